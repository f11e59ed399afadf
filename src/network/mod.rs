pub mod connections;
pub mod process;
pub mod geo;

pub use connections::{
    system_connection_source, ConnectionRecord, ConnectionSource, ConnectionStatus,
    ProcfsConnectionSource, Protocol,
};
pub use process::{ProcessInfo, ProcessResolver, ProcfsProcessResolver};
pub use geo::{GeoClient, GeoProvider, GeoRecord, IpInfoProvider};
