pub mod key;
pub mod record;

pub use key::*;
pub use record::*;
