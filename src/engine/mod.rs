pub mod exits;
pub mod simulator;
pub mod waves;
pub mod orchestrator;
pub mod controller;
pub mod results;

pub use exits::*;
pub use simulator::*;
pub use waves::*;
pub use orchestrator::*;
pub use controller::*;
pub use results::*;
