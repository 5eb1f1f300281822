pub mod config;
pub mod fetcher;
pub mod integrity;
pub mod limiter;
pub mod manager;
pub mod models;
pub mod planner;
pub mod probe;
pub mod reassembler;
pub mod scheduler;
pub mod session;
pub mod sink;

pub use session::{start_transfer, Completion, SessionHandle, TransferError, TransferSession};

/// Convenient type alias exposing common structs.
pub mod prelude {
    pub use crate::config::{OutputTarget, TransferConfig, MIB};
    pub use crate::manager::{SessionSummary, TransferManager};
    pub use crate::models::{Progress, SessionState, TransferOutput};
    pub use crate::session::{
        start_transfer, Completion, ErrorCode, SessionHandle, TransferError, TransferSession,
    };
}
