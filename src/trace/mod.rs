pub mod events;
pub mod pending;
pub mod tracker;

pub use events::*;
pub use pending::*;
pub use tracker::*;
