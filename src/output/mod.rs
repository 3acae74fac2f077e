// Output module for conductor

pub mod errors;
pub mod logging;
pub mod recap;

pub use errors::*;
pub use logging::init_tracing;
pub use recap::{HostStats, PlayRecap};
