pub mod error;
pub mod registry;
pub mod shadow;
pub mod sim;
pub mod spec;

pub use error::*;
pub use registry::*;
pub use shadow::*;
pub use spec::*;
