pub mod canonical;
pub mod event;
pub mod log;
pub mod redact;
pub mod sink;

pub use canonical::*;
pub use event::*;
pub use log::*;
pub use redact::*;
pub use sink::*;
