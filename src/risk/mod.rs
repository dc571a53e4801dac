pub mod margin;
pub mod ledger;

pub use margin::*;
pub use ledger::*;
