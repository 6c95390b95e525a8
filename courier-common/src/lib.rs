pub mod address;
pub mod envelope;
pub mod error;
pub mod logging;

pub use tracing;
