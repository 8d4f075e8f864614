//! Services module for lease-billing-service.

pub mod clock;
pub mod database;
pub mod memory;
pub mod metrics;
pub mod store;

pub use clock::{Clock, FixedClock, SystemClock};
pub use database::PgStore;
pub use memory::MemoryStore;
pub use metrics::{get_metrics, init_metrics};
pub use store::Store;
