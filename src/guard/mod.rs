pub mod breaker;
pub mod rate_limit;

pub use breaker::*;
pub use rate_limit::*;
