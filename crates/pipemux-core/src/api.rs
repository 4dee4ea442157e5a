use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use pipemux_platform::{Mapping, PlatformHandle, SharedMemoryRegion};

use crate::buffer::BufferDispatcher;
use crate::dispatcher::Dispatcher;
use crate::error::{CoreError, Result, WaitError};
use crate::handle_table::{table, Handle};
use crate::pipe::{Attachment, Message, PipeEndpoint};
use crate::signals::{Deadline, Signals, SignalsState};
use crate::wrapper::WrapperDispatcher;

/// Maximum payload size of a single message: 16 MiB.
///
/// Enforced for every pipe so a message accepted locally can always be
/// carried by a channel later; channel frame limits sit above this.
pub const MAX_MESSAGE_PAYLOAD: usize = 16 * 1024 * 1024;

/// Create a connected message pipe, returning a handle to each end.
pub fn create_message_pipe() -> (Handle, Handle) {
    let (a, b) = PipeEndpoint::new_pair();
    let ha = table().insert(Dispatcher::Pipe(a));
    let hb = table().insert(Dispatcher::Pipe(b));
    debug!(a = ha.value(), b = hb.value(), "created message pipe");
    (ha, hb)
}

/// Register an existing endpoint in the handle table.
pub fn insert_pipe(endpoint: Arc<PipeEndpoint>) -> Handle {
    table().insert(Dispatcher::Pipe(endpoint))
}

/// Register any dispatcher in the handle table.
pub fn insert_dispatcher(dispatcher: Dispatcher) -> Handle {
    table().insert(dispatcher)
}

fn pipe_of(handle: Handle) -> Result<Arc<PipeEndpoint>> {
    match table().get(handle) {
        // A live non-pipe handle is just as invalid for pipe operations as
        // a dead one.
        None | Some(Dispatcher::Buffer(_)) | Some(Dispatcher::Wrapper(_)) => {
            Err(CoreError::InvalidHandle)
        }
        Some(Dispatcher::Pipe(endpoint)) => Ok(endpoint),
    }
}

fn buffer_of(handle: Handle) -> Result<BufferDispatcher> {
    match table().get(handle) {
        None => Err(CoreError::InvalidHandle),
        Some(Dispatcher::Buffer(buffer)) => Ok(buffer),
        Some(_) => Err(CoreError::InvalidArgument("handle is not a shared buffer")),
    }
}

/// Write a message with optional attached handles.
///
/// Attachment release is all-or-nothing: if any attached handle is invalid,
/// duplicated, or unattachable, nothing is consumed and the caller's handles
/// stay valid. On success the attached handles leave this table for good.
///
/// Writing to a pipe whose peer has closed succeeds and discards the
/// message, attachments included.
pub fn write_message(
    handle: Handle,
    payload: impl Into<Bytes>,
    attachments: &[Handle],
) -> Result<()> {
    let endpoint = pipe_of(handle)?;
    let payload = payload.into();
    if payload.len() > MAX_MESSAGE_PAYLOAD {
        return Err(CoreError::MessageTooLarge {
            size: payload.len(),
            max: MAX_MESSAGE_PAYLOAD,
        });
    }

    let will_serialize = !endpoint.is_transferable();
    for &attached in attachments {
        if attached == handle {
            return Err(CoreError::InvalidArgument(
                "cannot attach a pipe to a message written on it",
            ));
        }
        let dispatcher = table().get(attached).ok_or(CoreError::InvalidHandle)?;
        if let Dispatcher::Pipe(p) = &dispatcher {
            if Arc::ptr_eq(p, &endpoint) {
                return Err(CoreError::InvalidArgument(
                    "cannot attach a pipe to a message written on it",
                ));
            }
            if endpoint
                .local_peer()
                .is_some_and(|peer| Arc::ptr_eq(&peer, p))
            {
                return Err(CoreError::InvalidArgument(
                    "cannot attach a pipe's peer endpoint to it",
                ));
            }
            if will_serialize && !p.is_transferable() {
                return Err(CoreError::FailedPrecondition(
                    "attached pipe's peer is already bound to a transport",
                ));
            }
        }
    }

    let dispatchers = table().remove_all(attachments)?;
    let msg = Message {
        payload,
        attachments: attachments
            .iter()
            .zip(dispatchers)
            .map(|(&previous_value, dispatcher)| Attachment {
                previous_value,
                dispatcher,
            })
            .collect(),
    };
    endpoint.write(msg)
}

/// Read the oldest queued message, if any.
///
/// Attached objects enter this table as the message is read; in the process
/// that wrote them they get their old handle values back when still free.
pub fn read_message(handle: Handle) -> Result<Option<(Bytes, Vec<Handle>)>> {
    let endpoint = pipe_of(handle)?;
    let Some(msg) = endpoint.read() else {
        return Ok(None);
    };
    let handles = msg
        .attachments
        .into_iter()
        .map(|attachment| table().insert_at(attachment.previous_value, attachment.dispatcher))
        .collect();
    Ok(Some((msg.payload, handles)))
}

/// Block until one of `signals` is satisfied on `handle`.
///
/// Peer closure is reported as a satisfied signal, not an error. Closing the
/// handle from another thread cancels the wait.
pub fn wait(
    handle: Handle,
    signals: Signals,
    deadline: Deadline,
) -> std::result::Result<SignalsState, WaitError> {
    match table().get(handle) {
        None => Err(WaitError::InvalidHandle),
        Some(Dispatcher::Pipe(endpoint)) => endpoint.wait(signals, deadline),
        // Buffers and wrappers have no signal sources.
        Some(_) => Err(WaitError::Unsatisfiable(SignalsState::default())),
    }
}

/// Close a handle. A second close of the same value fails, which makes
/// double-close bugs detectable.
pub fn close(handle: Handle) -> Result<()> {
    let dispatcher = table().remove(handle).ok_or(CoreError::InvalidHandle)?;
    debug!(handle = handle.value(), "closing handle");
    dispatcher.close();
    Ok(())
}

/// Create a shared memory buffer of `size` bytes.
pub fn create_shared_buffer(size: u64) -> Result<Handle> {
    create_shared_buffer_with_options(size, false)
}

/// Create a shared memory buffer, optionally allowing read-only duplicates.
pub fn create_shared_buffer_with_options(size: u64, shareable_read_only: bool) -> Result<Handle> {
    let buffer = BufferDispatcher::create(size, shareable_read_only)?;
    Ok(table().insert(Dispatcher::Buffer(buffer)))
}

/// Adopt an existing shared memory region as a buffer handle.
pub fn wrap_shared_memory(region: SharedMemoryRegion) -> Handle {
    table().insert(Dispatcher::Buffer(BufferDispatcher::from_region(region)))
}

/// Duplicate a buffer handle over the same memory.
pub fn duplicate_buffer(handle: Handle, read_only: bool) -> Result<Handle> {
    let buffer = buffer_of(handle)?;
    let duplicate = buffer.duplicate(read_only)?;
    Ok(table().insert(Dispatcher::Buffer(duplicate)))
}

/// Map `len` bytes of a buffer starting at `offset`.
pub fn map_buffer(handle: Handle, offset: u64, len: usize) -> Result<Mapping> {
    buffer_of(handle)?.map(offset, len)
}

/// Extract the shared memory region behind a buffer handle, consuming the
/// handle. A later close of the same value fails.
pub fn unwrap_shared_memory(handle: Handle) -> Result<SharedMemoryRegion> {
    // Verify the type before removing so a wrong-type call leaves the
    // handle untouched.
    buffer_of(handle)?;
    match table().remove(handle) {
        Some(Dispatcher::Buffer(buffer)) => buffer.into_region(),
        Some(other) => {
            // Lost a race with a replacement; put it back untouched.
            table().insert_at(handle, other);
            Err(CoreError::InvalidArgument("handle is not a shared buffer"))
        }
        None => Err(CoreError::InvalidHandle),
    }
}

/// Wrap a platform handle for transfer through the handle table.
pub fn wrap_platform_handle(platform: PlatformHandle) -> Handle {
    table().insert(Dispatcher::Wrapper(WrapperDispatcher::new(platform)))
}

/// Take the platform handle back out, consuming the table entry.
pub fn unwrap_platform_handle(handle: Handle) -> Result<PlatformHandle> {
    match table().get(handle) {
        None => Err(CoreError::InvalidHandle),
        Some(Dispatcher::Wrapper(_)) => match table().remove(handle) {
            Some(Dispatcher::Wrapper(wrapper)) => {
                wrapper.take().ok_or(CoreError::InvalidHandle)
            }
            _ => Err(CoreError::InvalidHandle),
        },
        Some(_) => Err(CoreError::InvalidArgument(
            "handle does not wrap a platform handle",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_round_trip() {
        let (a, b) = create_message_pipe();
        write_message(a, &b"hello"[..], &[]).unwrap();

        let (payload, handles) = read_message(b).unwrap().unwrap();
        assert_eq!(payload.as_ref(), b"hello");
        assert!(handles.is_empty());
        assert!(read_message(b).unwrap().is_none());

        close(a).unwrap();
        close(b).unwrap();
    }

    #[test]
    fn double_close_is_detectable() {
        let (a, b) = create_message_pipe();
        close(a).unwrap();
        assert!(matches!(close(a), Err(CoreError::InvalidHandle)));
        close(b).unwrap();
    }

    #[test]
    fn attachment_keeps_value_within_process() {
        let (a, b) = create_message_pipe();
        let (c, d) = create_message_pipe();

        write_message(a, &b"carrier"[..], &[c]).unwrap();
        // The attached handle left the table.
        assert!(matches!(
            write_message(c, &b"x"[..], &[]),
            Err(CoreError::InvalidHandle)
        ));

        let (_, handles) = read_message(b).unwrap().unwrap();
        assert_eq!(handles, vec![c], "same-process read keeps the old value");

        // The reattached pipe still works end to end.
        write_message(handles[0], &b"still-works"[..], &[]).unwrap();
        let (payload, _) = read_message(d).unwrap().unwrap();
        assert_eq!(payload.as_ref(), b"still-works");

        for h in [a, b, d, handles[0]] {
            close(h).unwrap();
        }
    }

    #[test]
    fn non_pipe_handles_are_invalid_for_pipe_operations() {
        let buffer = create_shared_buffer(16).unwrap();
        assert!(matches!(
            write_message(buffer, &b"x"[..], &[]),
            Err(CoreError::InvalidHandle)
        ));
        assert!(matches!(read_message(buffer), Err(CoreError::InvalidHandle)));
        // The buffer itself is untouched.
        assert!(map_buffer(buffer, 0, 16).is_ok());
        close(buffer).unwrap();
    }

    #[test]
    fn oversized_payload_rejected_before_consuming_attachments() {
        let (a, b) = create_message_pipe();
        let (c, d) = create_message_pipe();

        let oversized = vec![0u8; MAX_MESSAGE_PAYLOAD + 1];
        assert!(matches!(
            write_message(a, oversized, &[c]),
            Err(CoreError::MessageTooLarge { .. })
        ));

        // The attachment is still live, and the pipe still works.
        write_message(c, &b"untouched"[..], &[]).unwrap();
        let (payload, _) = read_message(d).unwrap().unwrap();
        assert_eq!(payload.as_ref(), b"untouched");
        write_message(a, vec![0u8; MAX_MESSAGE_PAYLOAD], &[]).unwrap();
        assert!(read_message(b).unwrap().is_some());

        for h in [a, b, c, d] {
            close(h).unwrap();
        }
    }

    #[test]
    fn cannot_attach_self_or_peer() {
        let (a, b) = create_message_pipe();
        assert!(matches!(
            write_message(a, &b"x"[..], &[a]),
            Err(CoreError::InvalidArgument(_))
        ));
        assert!(matches!(
            write_message(a, &b"x"[..], &[b]),
            Err(CoreError::InvalidArgument(_))
        ));
        // Nothing was consumed.
        close(a).unwrap();
        close(b).unwrap();
    }

    #[test]
    fn failed_attach_consumes_nothing() {
        let (a, b) = create_message_pipe();
        let (c, d) = create_message_pipe();
        let bogus = Handle::from_value(0xDEAD_0001);

        assert!(matches!(
            write_message(a, &b"x"[..], &[c, bogus]),
            Err(CoreError::InvalidHandle)
        ));

        // The valid attachment is still live and usable.
        write_message(c, &b"alive"[..], &[]).unwrap();
        let (payload, _) = read_message(d).unwrap().unwrap();
        assert_eq!(payload.as_ref(), b"alive");

        for h in [a, b, c, d] {
            close(h).unwrap();
        }
    }

    #[test]
    fn write_after_peer_close_succeeds_and_discards() {
        let (a, b) = create_message_pipe();
        close(b).unwrap();

        let (c, d) = create_message_pipe();
        write_message(a, &b"gone"[..], &[c]).unwrap();
        // The attachment was consumed and closed with the message.
        assert!(matches!(close(c), Err(CoreError::InvalidHandle)));
        // Its peer observes the closure.
        let state = wait(d, Signals::PEER_CLOSED, Deadline::Indefinite).unwrap();
        assert!(state.satisfied.contains(Signals::PEER_CLOSED));

        close(a).unwrap();
        close(d).unwrap();
    }

    #[test]
    fn wait_on_buffer_is_unsatisfiable() {
        let h = create_shared_buffer(16).unwrap();
        assert!(matches!(
            wait(h, Signals::READABLE, Deadline::Indefinite),
            Err(WaitError::Unsatisfiable(_))
        ));
        close(h).unwrap();
    }

    #[test]
    fn shared_buffer_argument_validation() {
        assert!(matches!(
            create_shared_buffer(0),
            Err(CoreError::InvalidArgument(_))
        ));

        let h = create_shared_buffer(100).unwrap();
        assert!(map_buffer(h, 0, 100).is_ok());
        assert!(matches!(map_buffer(h, 4, 100), Err(CoreError::OutOfRange)));
        assert!(matches!(
            duplicate_buffer(h, true),
            Err(CoreError::PermissionDenied(_))
        ));
        close(h).unwrap();
    }

    #[test]
    fn read_only_duplicate_of_shareable_buffer() {
        let h = create_shared_buffer_with_options(64, true).unwrap();
        let mut rw = map_buffer(h, 0, 64).unwrap();
        rw.as_mut_slice()[..4].copy_from_slice(b"data");
        drop(rw);

        let ro = duplicate_buffer(h, true).unwrap();
        let view = map_buffer(ro, 0, 64).unwrap();
        assert_eq!(&view[..4], b"data");
        assert!(view.is_read_only());

        close(h).unwrap();
        close(ro).unwrap();
    }

    #[test]
    fn unwrap_shared_memory_consumes_handle() {
        let h = create_shared_buffer(32).unwrap();
        let region = unwrap_shared_memory(h).unwrap();
        assert_eq!(region.size(), 32);
        assert!(matches!(close(h), Err(CoreError::InvalidHandle)));
        assert!(matches!(
            unwrap_shared_memory(h),
            Err(CoreError::InvalidHandle)
        ));
    }

    #[test]
    fn platform_wrap_unwrap_is_single_shot() {
        let h = wrap_platform_handle(PlatformHandle::MachPort(7));
        let back = unwrap_platform_handle(h).unwrap();
        assert!(matches!(back, PlatformHandle::MachPort(7)));
        assert!(matches!(
            unwrap_platform_handle(h),
            Err(CoreError::InvalidHandle)
        ));
    }

    #[test]
    fn unwrap_platform_handle_rejects_pipes() {
        let (a, b) = create_message_pipe();
        assert!(matches!(
            unwrap_platform_handle(a),
            Err(CoreError::InvalidArgument(_))
        ));
        close(a).unwrap();
        close(b).unwrap();
    }
}
