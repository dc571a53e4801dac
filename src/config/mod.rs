pub mod runtime;
pub mod policy;
pub mod profiles;
pub mod loader;

pub use runtime::*;
pub use policy::*;
pub use profiles::*;
pub use loader::*;
