//! Core handle and message-pipe layer of pipemux.
//!
//! A process-wide handle table maps opaque [`Handle`] values to dispatchers:
//! message-pipe endpoints, shared memory buffers, and wrapped platform
//! handles. The free functions in [`api`] are the embedding surface; the
//! [`MessageRelay`] trait is the seam the channel layer plugs into for
//! cross-process pipes.

pub mod api;
pub mod buffer;
pub mod dispatcher;
pub mod error;
pub mod handle_table;
pub mod pipe;
pub mod signals;
pub mod wrapper;

pub use api::{
    close, create_message_pipe, create_shared_buffer, create_shared_buffer_with_options,
    duplicate_buffer, insert_dispatcher, insert_pipe, map_buffer, read_message,
    unwrap_platform_handle, unwrap_shared_memory, wait, wrap_platform_handle, wrap_shared_memory,
    write_message, MAX_MESSAGE_PAYLOAD,
};
pub use buffer::BufferDispatcher;
pub use dispatcher::Dispatcher;
pub use error::{CoreError, Result, WaitError};
pub use handle_table::{table, Handle, HandleTable};
pub use pipe::{
    discard_message, Attachment, Message, MessageRelay, PeerLink, PipeEndpoint, TransferPeer,
    TransferredPipe,
};
pub use signals::{Deadline, Signals, SignalsState};
pub use wrapper::WrapperDispatcher;
