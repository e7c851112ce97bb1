pub mod message_framing;
pub mod message_types;
pub mod response_tracker;
pub mod timeout_manager;

pub use message_framing::MessageFraming;
pub use message_types::{
    CodecError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ServerMessage, UNKNOWN_ID,
};
pub use response_tracker::{PendingCall, PendingCallKey, ResponseTracker, ResponseTrackerError, TrackerConfig};
pub use timeout_manager::{TimeoutHandler, TimeoutManager};
