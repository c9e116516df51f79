//! State machine module.

pub mod chunker;
pub mod handlers;
pub mod machine;

pub use chunker::RwInfo;
pub use handlers::{HandleResult, build_frame, handle_response};
pub use machine::{
    Command, DownloadContext, FrameRequest, Sequence, SessionState, TimerInfo, TimerPurpose,
};
