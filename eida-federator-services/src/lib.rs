pub mod processor;
pub mod request_handlers;
pub mod route;
pub mod route_transforms;
pub mod routing_client;
pub mod slot_pool;
pub mod tasks;

pub use processor::{ProcessorVariant, RequestProcessor};
pub use route::{Route, RoutingTable};
pub use slot_pool::SlotPool;
