//! burrow-core: Shared protocol library for the burrow tunnel.
//!
//! Provides the control-channel frame schema, the length-prefixed CBOR
//! codec (streaming and async variants), and the error taxonomy shared by
//! the broker and agent sides.

pub mod codec;
pub mod error;
pub mod frame;

// Re-export commonly used items at crate root.
pub use codec::{frame_encode, read_frame, write_frame, FrameDecoder, MAX_FRAME_LEN};
pub use error::{TunnelError, TunnelResult};
pub use frame::{Frame, FrameType, CONTROL_SESSION};
