//! Wire codec for pipemux channels.
//!
//! Two layers:
//! - [`codec`]: routed frames (magic + kind + route + length-prefixed payload)
//! - [`message`]: message bodies carrying payload bytes and ordered handle
//!   descriptors, with file descriptors moved out-of-band as SCM_RIGHTS
//!   ancillary data

pub mod codec;
pub mod error;
pub mod message;

pub use codec::{
    decode_frame, encode_frame, Frame, FrameKind, DEFAULT_MAX_PAYLOAD, HEADER_SIZE, MAGIC,
};
pub use error::{Result, WireError};
pub use message::{
    decode_message, decode_token_bind, encode_message, encode_token_bind, BufferDescriptor,
    HandleDescriptor, PipeDescriptor, WireMessage,
};
