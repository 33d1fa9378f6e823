pub mod bloom_filter;
pub mod monitoring;
pub mod validator;

pub use bloom_filter::*;
pub use monitoring::*;
pub use validator::*;
