use std::collections::{HashMap, VecDeque};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread;

use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use pipemux_core::{
    discard_message, Attachment, BufferDispatcher, Dispatcher, Handle, Message, MessageRelay,
    PeerLink, PipeEndpoint, TransferPeer, WrapperDispatcher,
};
use pipemux_platform::{PlatformHandle, ScmSocket, SharedMemoryRegion};
use pipemux_wire::{
    codec, message as wire_msg, BufferDescriptor, Frame, FrameKind, HandleDescriptor,
    PipeDescriptor, WireMessage,
};

use crate::control::{ControlMessage, CONTROL_CLOSE_ROUTE};
use crate::error::{NodeError, Result};
use crate::pending;

/// Route id of the bootstrap pipe established at connection time.
pub const BOOTSTRAP_ROUTE: u64 = 0;

struct OutFrame {
    bytes: Bytes,
    fds: Vec<OwnedFd>,
}

struct Outgoing {
    queue: VecDeque<OutFrame>,
    shutdown: bool,
}

/// A connection to one peer process, multiplexing any number of pipes.
///
/// One reader thread decodes and dispatches inbound frames; one writer
/// thread drains the outgoing queue. Application threads only ever touch the
/// queue, so pipe operations never block on socket I/O.
pub struct Channel {
    socket: ScmSocket,
    outgoing: Mutex<Outgoing>,
    outgoing_cond: Condvar,
    routes: Mutex<HashMap<u64, Arc<PipeEndpoint>>>,
    dead: AtomicBool,
    me: Weak<Channel>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Channel {
    /// Take ownership of a connected socket and start the I/O threads.
    pub fn spawn(socket: ScmSocket) -> Arc<Channel> {
        Self::start(socket, None)
    }

    /// Like [`spawn`](Self::spawn), but registers `endpoint` at `route`
    /// before the reader thread starts. Frames already buffered on the
    /// socket can otherwise be dispatched against an empty route table and
    /// discarded.
    pub fn spawn_bound(
        socket: ScmSocket,
        route: u64,
        endpoint: &Arc<PipeEndpoint>,
    ) -> Arc<Channel> {
        Self::start(socket, Some((route, endpoint)))
    }

    fn start(socket: ScmSocket, bootstrap: Option<(u64, &Arc<PipeEndpoint>)>) -> Arc<Channel> {
        let channel = Arc::new_cyclic(|me| Channel {
            socket,
            outgoing: Mutex::new(Outgoing {
                queue: VecDeque::new(),
                shutdown: false,
            }),
            outgoing_cond: Condvar::new(),
            routes: Mutex::new(HashMap::new()),
            dead: AtomicBool::new(false),
            me: me.clone(),
        });

        if let Some((route, endpoint)) = bootstrap {
            lock(&channel.routes).insert(route, endpoint.clone());
            let mut out = lock(&channel.outgoing);
            channel.relink_and_flush_locked(route, endpoint, &mut out);
        }

        {
            let reader = channel.clone();
            thread::spawn(move || reader.read_loop());
        }
        {
            let writer = channel.clone();
            thread::spawn(move || writer.write_loop());
        }
        channel
    }

    /// Serialize a reserved pipe endpoint into a token-bind frame.
    pub fn send_token_bind(
        self: &Arc<Self>,
        token: &str,
        endpoint: Arc<PipeEndpoint>,
    ) -> Result<()> {
        let mut out = lock(&self.outgoing);
        if out.shutdown {
            drop(out);
            endpoint.close();
            return Err(NodeError::ChannelClosed);
        }
        let descriptor = self.serialize_pipe_locked(endpoint, &mut out);
        let mut body = BytesMut::new();
        let mut fds = Vec::new();
        wire_msg::encode_token_bind(token, descriptor, &mut body, &mut fds)?;
        Self::enqueue_locked(&mut out, FrameKind::TokenBind, BOOTSTRAP_ROUTE, &body, fds)?;
        self.outgoing_cond.notify_one();
        Ok(())
    }

    /// Flush queued frames and close the connection. Every pipe routed over
    /// this channel observes peer closure, here and on the other side.
    pub fn shutdown(&self) {
        self.stop(true);
    }

    fn fail(&self) {
        self.stop(false);
    }

    fn stop(&self, flush: bool) {
        if self.dead.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut out = lock(&self.outgoing);
            out.shutdown = true;
            if !flush {
                out.queue.clear();
            }
            self.outgoing_cond.notify_all();
        }
        if !flush {
            // Unblock the reader immediately; the flushing path lets the
            // writer drain first and shut the socket itself.
            self.socket.shutdown();
        }
        let routed: Vec<Arc<PipeEndpoint>> = lock(&self.routes).drain().map(|(_, e)| e).collect();
        for endpoint in routed {
            endpoint.mark_peer_closed();
        }
        debug!(flush, "channel stopped");
    }

    fn read_loop(self: Arc<Self>) {
        let mut pending_bytes = BytesMut::with_capacity(64 * 1024);
        let mut pending_fds: VecDeque<OwnedFd> = VecDeque::new();
        let mut chunk = vec![0u8; 64 * 1024];

        loop {
            let mut fds = Vec::new();
            match self.socket.recv(&mut chunk, &mut fds) {
                Ok(0) => break,
                Ok(n) => {
                    pending_fds.extend(fds);
                    pending_bytes.extend_from_slice(&chunk[..n]);
                    loop {
                        match codec::decode_frame(&mut pending_bytes, codec::DEFAULT_MAX_PAYLOAD) {
                            Ok(Some(frame)) => self.dispatch(frame, &mut pending_fds),
                            Ok(None) => break,
                            Err(e) => {
                                warn!(error = %e, "malformed frame; closing channel");
                                self.fail();
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    debug!(error = %e, "channel read failed");
                    break;
                }
            }
        }
        self.fail();
    }

    fn write_loop(self: Arc<Self>) {
        loop {
            let frame = {
                let mut out = lock(&self.outgoing);
                loop {
                    if let Some(frame) = out.queue.pop_front() {
                        break Some(frame);
                    }
                    if out.shutdown {
                        break None;
                    }
                    out = self
                        .outgoing_cond
                        .wait(out)
                        .unwrap_or_else(|e| e.into_inner());
                }
            };
            let Some(frame) = frame else {
                // Drained after shutdown; close our side so the peer sees EOF.
                self.socket.shutdown();
                return;
            };
            let raw: Vec<RawFd> = frame.fds.iter().map(AsRawFd::as_raw_fd).collect();
            if let Err(e) = self.socket.send_with_fds(&frame.bytes, &raw) {
                debug!(error = %e, "channel write failed");
                self.fail();
                return;
            }
            // frame drops here, closing our copies of the passed fds.
        }
    }

    fn dispatch(self: &Arc<Self>, frame: Frame, fds: &mut VecDeque<OwnedFd>) {
        match frame.kind {
            FrameKind::Data => {
                let mut body = frame.payload;
                let wire = match wire_msg::decode_message(&mut body, fds) {
                    Ok(wire) => wire,
                    Err(e) => {
                        warn!(error = %e, route = frame.route, "undecodable message");
                        return;
                    }
                };
                let message = self.from_wire(wire);
                let target = lock(&self.routes).get(&frame.route).cloned();
                match target {
                    Some(endpoint) => endpoint.deliver(message),
                    // Route already closed on this side.
                    None => discard_message(message),
                }
            }
            FrameKind::Control => match serde_json::from_slice::<ControlMessage>(&frame.payload) {
                Ok(ctrl) if ctrl.msg_type == CONTROL_CLOSE_ROUTE => {
                    if let Some(route) = ctrl.route {
                        if let Some(endpoint) = lock(&self.routes).remove(&route) {
                            endpoint.mark_peer_closed();
                        }
                    }
                }
                Ok(ctrl) => debug!(msg_type = %ctrl.msg_type, "ignoring unknown control message"),
                Err(e) => warn!(error = %e, "undecodable control message"),
            },
            FrameKind::TokenBind => {
                let mut body = frame.payload;
                match wire_msg::decode_token_bind(&mut body, fds) {
                    Ok((token, descriptor)) => self.accept_token_bind(&token, descriptor),
                    Err(e) => warn!(error = %e, "undecodable token bind"),
                }
            }
        }
    }

    fn accept_token_bind(self: &Arc<Self>, token: &str, descriptor: PipeDescriptor) {
        let pending_msgs: Vec<Message> = descriptor
            .pending
            .into_iter()
            .map(|m| self.from_wire(m))
            .collect();

        // Fuse with a claim that is already waiting, or park for a later one.
        let endpoint = pending::take_waiting_claim(token)
            .unwrap_or_else(PipeEndpoint::new_detached);

        for msg in pending_msgs {
            endpoint.deliver(msg);
        }
        match descriptor.route {
            Some(route) => {
                lock(&self.routes).insert(route, endpoint.clone());
                let mut out = lock(&self.outgoing);
                self.relink_and_flush_locked(route, &endpoint, &mut out);
            }
            None => {
                if let Ok(parked) = endpoint.relink(PeerLink::Closed) {
                    for msg in parked {
                        discard_message(msg);
                    }
                }
            }
        }
        if descriptor.peer_closed {
            endpoint.mark_peer_closed();
        }
        pending::remote_endpoint_arrived(token, endpoint);
    }

    /// Point `endpoint` at this channel and push any parked writes through,
    /// all under the outgoing lock so no concurrent write can overtake them.
    fn relink_and_flush_locked(
        self: &Arc<Self>,
        route: u64,
        endpoint: &Arc<PipeEndpoint>,
        out: &mut Outgoing,
    ) {
        let relay: Arc<dyn MessageRelay> = self.clone();
        match endpoint.relink(PeerLink::Routed { relay, route }) {
            Ok(parked) => {
                for msg in parked {
                    if out.shutdown {
                        discard_message(msg);
                    } else {
                        self.enqueue_data_locked(route, msg, out);
                    }
                }
                self.outgoing_cond.notify_one();
            }
            Err(_link) => {
                // The endpoint closed before the splice completed; tell the
                // far side right away.
                lock(&self.routes).remove(&route);
                self.enqueue_close_route_locked(route, out);
            }
        }
    }

    fn enqueue_data_locked(self: &Arc<Self>, route: u64, message: Message, out: &mut Outgoing) {
        let wire = self.serialize_message_locked(message, out);
        let mut body = BytesMut::new();
        let mut fds = Vec::new();
        if let Err(e) = wire_msg::encode_message(wire, &mut body, &mut fds) {
            warn!(error = %e, route, "dropping unencodable message");
            return;
        }
        if let Err(e) = Self::enqueue_locked(out, FrameKind::Data, route, &body, fds) {
            warn!(error = %e, route, "dropping oversized frame");
        }
    }

    fn enqueue_close_route_locked(&self, route: u64, out: &mut Outgoing) {
        if out.shutdown {
            return;
        }
        let ctrl = ControlMessage::close_route(route);
        let body = match serde_json::to_vec(&ctrl) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "failed to encode control message");
                return;
            }
        };
        if let Err(e) = Self::enqueue_locked(out, FrameKind::Control, route, &body, Vec::new()) {
            warn!(error = %e, route, "failed to queue control frame");
        }
        self.outgoing_cond.notify_one();
    }

    fn enqueue_locked(
        out: &mut Outgoing,
        kind: FrameKind,
        route: u64,
        body: &[u8],
        fds: Vec<OwnedFd>,
    ) -> Result<()> {
        let mut framed = BytesMut::new();
        codec::encode_frame(kind, route, body, &mut framed)?;
        out.queue.push_back(OutFrame {
            bytes: framed.freeze(),
            fds,
        });
        Ok(())
    }

    // Callers hold the outgoing lock, so allocation cannot race with other
    // transfers on this channel. Random ids keep the two sides from ever
    // colliding without a handshake.
    fn allocate_route(&self) -> u64 {
        let routes = lock(&self.routes);
        loop {
            let route: u64 = rand::random();
            if route != BOOTSTRAP_ROUTE && !routes.contains_key(&route) {
                return route;
            }
        }
    }

    fn serialize_message_locked(
        self: &Arc<Self>,
        message: Message,
        out: &mut Outgoing,
    ) -> WireMessage {
        let handles = message
            .attachments
            .into_iter()
            .map(|attachment| self.serialize_attachment_locked(attachment.dispatcher, out))
            .collect();
        WireMessage {
            data: message.payload,
            handles,
        }
    }

    fn serialize_attachment_locked(
        self: &Arc<Self>,
        dispatcher: Dispatcher,
        out: &mut Outgoing,
    ) -> HandleDescriptor {
        match dispatcher {
            Dispatcher::Pipe(endpoint) => {
                HandleDescriptor::Pipe(self.serialize_pipe_locked(endpoint, out))
            }
            Dispatcher::Buffer(buffer) => {
                let size = buffer.size();
                let read_only = buffer.is_read_only();
                let shareable_read_only = buffer.is_shareable_read_only();
                match buffer.into_region() {
                    Ok(region) => HandleDescriptor::Buffer(BufferDescriptor {
                        fd: region.into_fd(),
                        size,
                        read_only,
                        shareable_read_only,
                    }),
                    Err(e) => {
                        warn!(error = %e, "failed to export buffer; sending null");
                        HandleDescriptor::Platform(PlatformHandle::Null)
                    }
                }
            }
            Dispatcher::Wrapper(wrapper) => HandleDescriptor::Platform(
                wrapper.take().unwrap_or(PlatformHandle::Null),
            ),
        }
    }

    fn serialize_pipe_locked(
        self: &Arc<Self>,
        endpoint: Arc<PipeEndpoint>,
        out: &mut Outgoing,
    ) -> PipeDescriptor {
        let transferred = match endpoint.begin_transfer() {
            Ok(transferred) => transferred,
            Err(e) => {
                // Pre-validation at write time makes this unreachable short
                // of a lost race with a concurrent transfer of the peer.
                warn!(error = %e, "pipe became untransferable; closing it");
                endpoint.close();
                return PipeDescriptor {
                    route: None,
                    peer_closed: true,
                    pending: Vec::new(),
                };
            }
        };

        let pending = transferred
            .pending
            .into_iter()
            .map(|msg| self.serialize_message_locked(msg, out))
            .collect();

        match transferred.peer {
            TransferPeer::Closed => PipeDescriptor {
                route: None,
                peer_closed: true,
                pending,
            },
            TransferPeer::Local(survivor) => {
                let route = self.allocate_route();
                lock(&self.routes).insert(route, survivor.clone());
                self.relink_and_flush_locked(route, &survivor, out);
                PipeDescriptor {
                    route: Some(route),
                    peer_closed: false,
                    pending,
                }
            }
        }
    }

    fn from_wire(self: &Arc<Self>, wire: WireMessage) -> Message {
        let attachments = wire
            .handles
            .into_iter()
            .map(|descriptor| Attachment {
                previous_value: Handle::INVALID,
                dispatcher: self.dispatcher_from(descriptor),
            })
            .collect();
        Message {
            payload: wire.data,
            attachments,
        }
    }

    fn dispatcher_from(self: &Arc<Self>, descriptor: HandleDescriptor) -> Dispatcher {
        match descriptor {
            HandleDescriptor::Pipe(pipe) => {
                let pending: Vec<Message> =
                    pipe.pending.into_iter().map(|m| self.from_wire(m)).collect();
                let endpoint = match pipe.route {
                    Some(route) => {
                        let relay: Arc<dyn MessageRelay> = self.clone();
                        let endpoint = PipeEndpoint::from_parts(
                            pending,
                            pipe.peer_closed,
                            PeerLink::Routed { relay, route },
                        );
                        lock(&self.routes).insert(route, endpoint.clone());
                        endpoint
                    }
                    None => PipeEndpoint::from_parts(pending, true, PeerLink::Closed),
                };
                Dispatcher::Pipe(endpoint)
            }
            HandleDescriptor::Buffer(buffer) => {
                match SharedMemoryRegion::from_fd(buffer.fd, buffer.size) {
                    Ok(region) => Dispatcher::Buffer(BufferDispatcher::from_parts(
                        region,
                        buffer.read_only,
                        buffer.shareable_read_only,
                    )),
                    Err(e) => {
                        warn!(error = %e, "rejecting transferred buffer");
                        Dispatcher::Wrapper(WrapperDispatcher::new(PlatformHandle::Null))
                    }
                }
            }
            HandleDescriptor::Platform(platform) => {
                Dispatcher::Wrapper(WrapperDispatcher::new(platform))
            }
        }
    }
}

impl MessageRelay for Channel {
    fn forward(&self, route: u64, message: Message) -> std::result::Result<(), Message> {
        let Some(me) = self.me.upgrade() else {
            return Err(message);
        };
        let mut out = lock(&self.outgoing);
        if out.shutdown {
            return Err(message);
        }
        me.enqueue_data_locked(route, message, &mut out);
        self.outgoing_cond.notify_one();
        Ok(())
    }

    fn route_closed(&self, route: u64) {
        lock(&self.routes).remove(&route);
        let mut out = lock(&self.outgoing);
        self.enqueue_close_route_locked(route, &mut out);
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("fd", &self.socket.as_raw_fd())
            .field("dead", &self.dead.load(Ordering::SeqCst))
            .finish()
    }
}
