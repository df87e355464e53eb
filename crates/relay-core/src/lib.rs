pub mod approvals;
pub mod cancellation;
pub mod config;
pub mod engine;
pub mod event_bus;
pub mod executor;
pub mod lease;
pub mod store;

pub use approvals::*;
pub use cancellation::*;
pub use config::*;
pub use engine::*;
pub use event_bus::*;
pub use executor::*;
pub use lease::*;
pub use store::*;
