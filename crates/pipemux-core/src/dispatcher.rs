use std::sync::Arc;

use crate::buffer::BufferDispatcher;
use crate::pipe::PipeEndpoint;
use crate::wrapper::WrapperDispatcher;

/// The object a handle-table entry points at.
#[derive(Debug, Clone)]
pub enum Dispatcher {
    Pipe(Arc<PipeEndpoint>),
    Buffer(BufferDispatcher),
    Wrapper(WrapperDispatcher),
}

impl Dispatcher {
    /// Close the underlying object. Buffers and wrappers release their
    /// resources on drop; pipes additionally notify their peer.
    pub fn close(self) {
        if let Dispatcher::Pipe(endpoint) = self {
            endpoint.close();
        }
    }
}
