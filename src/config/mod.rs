/// Configuration management
pub mod discovery;

pub use discovery::*;
