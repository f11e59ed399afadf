pub mod network;
pub mod pipeline;
pub mod report;
pub mod config;
pub mod error;
pub mod utils;

pub use error::{NetGeoError, Result};
pub use config::Config;
pub use pipeline::{ConnectionReport, EnrichedRow, EnrichmentPipeline, ReportMode};
