//! Backend implementations
//!
//! - `sim`: in-process reference device (always available)

pub mod sim;

pub use sim::{SimBackend, SimConfig};
