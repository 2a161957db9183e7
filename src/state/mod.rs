pub mod flow;
pub mod store;

pub use flow::*;
pub use store::*;
