pub mod combiner;
pub mod download;

pub use combiner::{combine_network, NetworkAccumulator};
pub use download::{download, DownloadResult, Payload, Timeouts};
