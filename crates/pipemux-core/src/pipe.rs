use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Instant;

use bytes::Bytes;
use tracing::debug;

use crate::dispatcher::Dispatcher;
use crate::error::{CoreError, Result, WaitError};
use crate::handle_table::Handle;
use crate::signals::{Deadline, Signals, SignalsState};

/// A message queued at a pipe endpoint: payload bytes plus live attachments.
#[derive(Debug)]
pub struct Message {
    pub payload: Bytes,
    pub attachments: Vec<Attachment>,
}

/// An attached object in transit between handle tables.
#[derive(Debug)]
pub struct Attachment {
    /// The handle value the sender held. When the message is read in the
    /// same process and that value is still free, the reader gets it back.
    pub previous_value: Handle,
    pub dispatcher: Dispatcher,
}

/// Drop a message, closing any attached objects properly.
pub fn discard_message(msg: Message) {
    for attachment in msg.attachments {
        attachment.dispatcher.close();
    }
}

/// Forwards messages for endpoints whose peer lives across a transport.
///
/// Implemented by the channel layer; keeping it a trait keeps pipe semantics
/// independent of any particular transport.
pub trait MessageRelay: Send + Sync {
    /// Deliver `message` to the peer registered at `route`.
    ///
    /// Gives the message back if the link is gone so the caller can discard
    /// its attachments.
    fn forward(&self, route: u64, message: Message) -> std::result::Result<(), Message>;

    /// Tell the peer at `route` that this side closed.
    fn route_closed(&self, route: u64);
}

/// Where messages written on an endpoint go.
pub enum PeerLink {
    /// The peer is an endpoint in this process.
    Local(Arc<PipeEndpoint>),
    /// The peer lives across a channel; frames carry `route`.
    Routed {
        relay: Arc<dyn MessageRelay>,
        route: u64,
    },
    /// No peer is reachable yet; messages park here until one is.
    Queued(Vec<Message>),
    /// The peer is gone.
    Closed,
}

impl fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerLink::Local(_) => f.write_str("Local"),
            PeerLink::Routed { route, .. } => write!(f, "Routed({route:#x})"),
            PeerLink::Queued(parked) => write!(f, "Queued({})", parked.len()),
            PeerLink::Closed => f.write_str("Closed"),
        }
    }
}

struct PipeState {
    queue: VecDeque<Message>,
    closed: bool,
    peer_closed: bool,
}

/// One end of a message pipe.
///
/// Lock discipline: the state lock and the peer-link lock are never held at
/// the same time. Cross-endpoint calls (deliver, mark_peer_closed) are made
/// with no local lock held.
pub struct PipeEndpoint {
    state: Mutex<PipeState>,
    cond: Condvar,
    peer: Mutex<PeerLink>,
}

/// An endpoint extracted for transfer across a channel.
#[derive(Debug)]
pub struct TransferredPipe {
    /// Messages that were queued and unread at transfer time, oldest first.
    pub pending: Vec<Message>,
    pub peer: TransferPeer,
}

/// The surviving side of a transferred endpoint's pair.
#[derive(Debug)]
pub enum TransferPeer {
    Local(Arc<PipeEndpoint>),
    Closed,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl PipeEndpoint {
    fn unlinked(link: PeerLink) -> Self {
        Self {
            state: Mutex::new(PipeState {
                queue: VecDeque::new(),
                closed: false,
                peer_closed: false,
            }),
            cond: Condvar::new(),
            peer: Mutex::new(link),
        }
    }

    /// Create a connected pair of endpoints.
    pub fn new_pair() -> (Arc<Self>, Arc<Self>) {
        let a = Arc::new(Self::unlinked(PeerLink::Closed));
        let b = Arc::new(Self::unlinked(PeerLink::Closed));
        *lock(&a.peer) = PeerLink::Local(b.clone());
        *lock(&b.peer) = PeerLink::Local(a.clone());
        (a, b)
    }

    /// Create an endpoint with no reachable peer yet; writes park until
    /// [`relink`](Self::relink) provides one.
    pub fn new_detached() -> Arc<Self> {
        Arc::new(Self::unlinked(PeerLink::Queued(Vec::new())))
    }

    /// Rebuild an endpoint from transferred parts.
    pub fn from_parts(pending: Vec<Message>, peer_closed: bool, link: PeerLink) -> Arc<Self> {
        let endpoint = Arc::new(Self::unlinked(link));
        {
            let mut st = lock(&endpoint.state);
            st.queue = pending.into();
            st.peer_closed = peer_closed;
        }
        endpoint
    }

    /// The peer endpoint, when it lives in this process.
    pub fn local_peer(&self) -> Option<Arc<PipeEndpoint>> {
        match &*lock(&self.peer) {
            PeerLink::Local(p) => Some(p.clone()),
            _ => None,
        }
    }

    /// Whether this endpoint could be serialized for transfer right now.
    /// Endpoints whose peer is already routed (or still parked behind an
    /// unconnected transport) cannot be re-serialized.
    pub fn is_transferable(&self) -> bool {
        matches!(
            &*lock(&self.peer),
            PeerLink::Local(_) | PeerLink::Closed
        )
    }

    pub fn is_peer_closed(&self) -> bool {
        lock(&self.state).peer_closed
    }

    /// Write a message toward the peer.
    ///
    /// Succeeds silently when the peer is closed: the message and its
    /// attachments are discarded, matching fire-and-forget write semantics.
    pub fn write(&self, msg: Message) -> Result<()> {
        let mut msg = msg;
        loop {
            enum Target {
                Local(Arc<PipeEndpoint>),
                Routed(Arc<dyn MessageRelay>, u64),
                Dropped,
            }

            let target = {
                let mut link = lock(&self.peer);
                match &mut *link {
                    PeerLink::Queued(parked) => {
                        parked.push(msg);
                        return Ok(());
                    }
                    PeerLink::Local(p) => Target::Local(p.clone()),
                    PeerLink::Routed { relay, route } => Target::Routed(relay.clone(), *route),
                    PeerLink::Closed => Target::Dropped,
                }
            };

            match target {
                Target::Local(p) => match p.deliver_if_open(msg) {
                    Ok(()) => return Ok(()),
                    Err(back) => {
                        msg = back;
                        if lock(&self.state).peer_closed {
                            discard_message(msg);
                            return Ok(());
                        }
                        // The peer went defunct through a transfer; our link
                        // is being rewritten to a route. Retry against it.
                        std::thread::yield_now();
                    }
                },
                Target::Routed(relay, route) => {
                    return match relay.forward(route, msg) {
                        Ok(()) => Ok(()),
                        Err(back) => {
                            // The channel is gone; that is peer closure.
                            self.mark_peer_closed();
                            discard_message(back);
                            Ok(())
                        }
                    };
                }
                Target::Dropped => {
                    discard_message(msg);
                    return Ok(());
                }
            }
        }
    }

    /// Pop the oldest queued message, if any.
    pub fn read(&self) -> Option<Message> {
        lock(&self.state).queue.pop_front()
    }

    /// Queue an inbound message, discarding it if this endpoint closed.
    pub fn deliver(&self, msg: Message) {
        if let Err(msg) = self.deliver_if_open(msg) {
            discard_message(msg);
        }
    }

    fn deliver_if_open(&self, msg: Message) -> std::result::Result<(), Message> {
        let mut st = lock(&self.state);
        if st.closed {
            return Err(msg);
        }
        st.queue.push_back(msg);
        self.cond.notify_all();
        Ok(())
    }

    fn signals_state(st: &PipeState) -> SignalsState {
        let mut satisfied = Signals::empty();
        let mut satisfiable = Signals::PEER_CLOSED;
        if !st.queue.is_empty() {
            satisfied |= Signals::READABLE;
        }
        if st.peer_closed {
            satisfied |= Signals::PEER_CLOSED;
        } else {
            satisfied |= Signals::WRITABLE;
            satisfiable |= Signals::WRITABLE;
        }
        if !st.queue.is_empty() || !st.peer_closed {
            satisfiable |= Signals::READABLE;
        }
        SignalsState {
            satisfied,
            satisfiable,
        }
    }

    /// Current signal snapshot.
    pub fn query_signals(&self) -> SignalsState {
        Self::signals_state(&lock(&self.state))
    }

    /// Block until one of `signals` is satisfied, none can be, the deadline
    /// passes, or the endpoint is closed out from under the waiter.
    pub fn wait(
        &self,
        signals: Signals,
        deadline: Deadline,
    ) -> std::result::Result<SignalsState, WaitError> {
        let wake_at = match deadline {
            Deadline::Finite(d) => Instant::now().checked_add(d),
            _ => None,
        };

        let mut st = lock(&self.state);
        loop {
            if st.closed {
                return Err(WaitError::Cancelled);
            }
            let snapshot = Self::signals_state(&st);
            if snapshot.satisfies(signals) {
                return Ok(snapshot);
            }
            if !snapshot.can_satisfy(signals) {
                return Err(WaitError::Unsatisfiable(snapshot));
            }
            match deadline {
                Deadline::Poll => return Err(WaitError::DeadlineExpired(snapshot)),
                Deadline::Indefinite => {
                    st = self.cond.wait(st).unwrap_or_else(|e| e.into_inner());
                }
                Deadline::Finite(_) => {
                    let Some(at) = wake_at else {
                        // Duration overflowed Instant arithmetic; treat as
                        // indefinite.
                        st = self.cond.wait(st).unwrap_or_else(|e| e.into_inner());
                        continue;
                    };
                    let now = Instant::now();
                    if now >= at {
                        return Err(WaitError::DeadlineExpired(snapshot));
                    }
                    let (guard, _timeout) = self
                        .cond
                        .wait_timeout(st, at - now)
                        .unwrap_or_else(|e| e.into_inner());
                    st = guard;
                }
            }
        }
    }

    /// Close this endpoint: discard unread messages, wake waiters, and tell
    /// the peer. Idempotent at this layer; the handle layer makes double
    /// close detectable by removing the table entry first.
    pub fn close(&self) {
        let link = mem::replace(&mut *lock(&self.peer), PeerLink::Closed);

        let drained: Vec<Message> = {
            let mut st = lock(&self.state);
            if st.closed {
                Vec::new()
            } else {
                st.closed = true;
                self.cond.notify_all();
                st.queue.drain(..).collect()
            }
        };
        for msg in drained {
            discard_message(msg);
        }

        match link {
            PeerLink::Local(p) => p.mark_peer_closed(),
            PeerLink::Routed { relay, route } => relay.route_closed(route),
            PeerLink::Queued(parked) => {
                for msg in parked {
                    discard_message(msg);
                }
            }
            PeerLink::Closed => {}
        }
    }

    /// Record that the peer is gone, waking any waiters. Messages already
    /// queued here stay readable.
    pub fn mark_peer_closed(&self) {
        let old = mem::replace(&mut *lock(&self.peer), PeerLink::Closed);
        if let PeerLink::Queued(parked) = old {
            for msg in parked {
                discard_message(msg);
            }
        }
        let mut st = lock(&self.state);
        st.peer_closed = true;
        self.cond.notify_all();
    }

    /// Extract this endpoint's state for transfer, leaving it defunct.
    ///
    /// Fails if the peer is already routed across a transport or parked
    /// behind an unconnected one; such pairs cannot be re-serialized.
    pub fn begin_transfer(&self) -> Result<TransferredPipe> {
        let peer = {
            let mut link = lock(&self.peer);
            let peer = match &*link {
                PeerLink::Routed { .. } | PeerLink::Queued(_) => {
                    return Err(CoreError::FailedPrecondition(
                        "peer endpoint is already bound to a transport",
                    ));
                }
                PeerLink::Local(p) => TransferPeer::Local(p.clone()),
                PeerLink::Closed => TransferPeer::Closed,
            };
            *link = PeerLink::Closed;
            peer
        };

        let pending: Vec<Message> = {
            let mut st = lock(&self.state);
            st.closed = true;
            self.cond.notify_all();
            st.queue.drain(..).collect()
        };
        debug!(pending = pending.len(), "endpoint extracted for transfer");

        Ok(TransferredPipe { pending, peer })
    }

    /// Replace the peer link.
    ///
    /// Returns messages parked on the old link, which the caller must resend
    /// through the new one in order. If this endpoint already closed, the
    /// new link is handed back so the caller can notify the far side.
    pub fn relink(&self, link: PeerLink) -> std::result::Result<Vec<Message>, PeerLink> {
        let old = mem::replace(&mut *lock(&self.peer), link);
        if lock(&self.state).closed {
            let link = mem::replace(&mut *lock(&self.peer), PeerLink::Closed);
            if let PeerLink::Queued(parked) = old {
                for msg in parked {
                    discard_message(msg);
                }
            }
            return Err(link);
        }
        match old {
            PeerLink::Queued(parked) => Ok(parked),
            _ => Ok(Vec::new()),
        }
    }
}

impl fmt::Debug for PipeEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeEndpoint").finish_non_exhaustive()
    }
}
