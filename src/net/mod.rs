//! Length-prefixed binary framing and the generic TCP request/response server.

mod connection;
mod error;
pub mod frame;
mod server;

pub use crate::net::error::NetError;
pub use crate::net::frame::{
    encode_frame, try_decode_frame, ErrorPayload, Frame, FrameDecodeError, FrameEncodeError,
    FrameType, ItemPayload, NamePayload, MAX_FRAME_SIZE,
};
pub use crate::net::server::{MessageHandler, NetworkConfig, Server};
