//! Threshold alerting with hysteresis.

pub mod fsm;
pub mod manager;

pub use fsm::*;
pub use manager::*;
