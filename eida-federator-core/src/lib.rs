pub mod config;
pub mod error;
pub mod service_kind;
pub mod stream_epoch;

pub use config::{Cli, GatewayConfig};
pub use error::{AnyError, AnyResult, GatewayError};
pub use service_kind::{Level, ServiceKind, StationFormat};
pub use stream_epoch::{GroupField, GroupKey, StreamEpoch};
