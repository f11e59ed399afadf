pub mod table;
pub mod map;

pub use table::{render_summary_table, render_table, TableOptions};
pub use map::render_map_svg;
