pub mod retry;
pub mod breaker;
pub mod resilient;

pub use retry::*;
pub use breaker::*;
pub use resilient::*;
