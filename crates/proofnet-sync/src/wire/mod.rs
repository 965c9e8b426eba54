//! Wire protocol: codes, framing and message bodies.

pub mod codes;
pub mod frame;
pub mod messages;

pub use codes::{MessageCode, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION};
pub use frame::{write_frame, Frame, FrameReader, DEFAULT_MAX_FRAME_LEN, HEADER_LEN};
pub use messages::*;
