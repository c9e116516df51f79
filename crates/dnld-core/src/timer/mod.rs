//! Timer layer module.

pub mod manual;
pub mod thread;
pub mod traits;

pub use manual::ManualTimerService;
pub use thread::ThreadTimerService;
pub use traits::{TimerError, TimerId, TimerService};
