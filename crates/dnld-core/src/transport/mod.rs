//! Transport layer module.

pub mod mock;
pub mod simulated;
pub mod traits;

pub use mock::{MockTransport, WriteBehavior};
pub use simulated::{ChipIdentity, SimulatedController};
pub use traits::{DeviceMode, Transport, TransportError};
