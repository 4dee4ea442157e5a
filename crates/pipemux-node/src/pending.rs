use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};

use tracing::debug;

use pipemux_core::{insert_pipe, Handle, PipeEndpoint};
use pipemux_platform::ScmSocket;

use crate::channel::Channel;
use crate::error::{NodeError, Result};

/// Tokens are reserved, then claimed exactly once; a slot records which of
/// the two happened first.
enum TokenSlot {
    /// Reserved locally; the far half of the pair is parked here until the
    /// token is claimed or the transport connects.
    Reserved { parked: Arc<PipeEndpoint> },
    /// Claimed before the bound endpoint arrived; the claimant holds a
    /// detached endpoint to be spliced on arrival.
    Waiting { endpoint: Arc<PipeEndpoint> },
    /// The bound endpoint arrived before any claim.
    Arrived { endpoint: Arc<PipeEndpoint> },
    /// Claim completed. Kept for the life of the process so a second claim
    /// of the same token fails loudly instead of looking like a fresh early
    /// claim; tokens are 128-bit and single-use, so the map only grows by
    /// one small entry per reserved pipe.
    Claimed,
}

static TOKENS: LazyLock<Mutex<HashMap<String, TokenSlot>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn registry() -> MutexGuard<'static, HashMap<String, TokenSlot>> {
    TOKENS.lock().unwrap_or_else(|e| e.into_inner())
}

/// An opaque token for rendezvous between processes. 128 bits of randomness,
/// hex encoded; unguessable, never logged.
pub fn generate_random_token() -> String {
    let bytes: [u8; 16] = rand::random();
    let mut token = String::with_capacity(32);
    for b in bytes {
        use std::fmt::Write;
        let _ = write!(token, "{b:02x}");
    }
    token
}

/// Reserves message pipes against a process whose transport does not exist
/// yet.
///
/// Handles returned by [`create_message_pipe`](Self::create_message_pipe)
/// are immediately usable; writes queue until the other process claims the
/// token. Dropping the connection without [`connect`](Self::connect) closes
/// every reserved far end, so waiters see peer closure instead of hanging —
/// the launch-failed path.
pub struct PendingProcessConnection {
    tokens: Vec<String>,
    connected: bool,
}

impl PendingProcessConnection {
    pub fn new() -> Self {
        Self {
            tokens: Vec::new(),
            connected: false,
        }
    }

    /// Reserve a pipe. Returns a live local handle and the token the other
    /// process claims it with.
    pub fn create_message_pipe(&mut self) -> (Handle, String) {
        let (local, parked) = PipeEndpoint::new_pair();
        let handle = insert_pipe(local);
        let token = generate_random_token();
        registry().insert(token.clone(), TokenSlot::Reserved { parked });
        self.tokens.push(token.clone());
        debug!(handle = handle.value(), "reserved pipe for pending process");
        (handle, token)
    }

    /// Bind the reserved pipes to a connected transport, consuming the
    /// pending connection. Messages written before this point flush in
    /// order. Tokens already claimed in this process were fused locally and
    /// need no transport.
    pub fn connect(mut self, socket: ScmSocket) -> Result<Arc<Channel>> {
        let channel = Channel::spawn(socket);
        self.connected = true;
        let mut failed = None;
        for token in std::mem::take(&mut self.tokens) {
            let slot = registry().remove(&token);
            match slot {
                Some(TokenSlot::Reserved { parked }) => {
                    if failed.is_some() {
                        // The transport is dead; the remaining reservations
                        // can never bind. Close their far ends so local
                        // waiters observe peer closure instead of hanging.
                        parked.close();
                    } else if let Err(e) = channel.send_token_bind(&token, parked) {
                        failed = Some(e);
                    }
                }
                // Fused in-process before connect; nothing to transfer.
                Some(other) => {
                    registry().insert(token, other);
                }
                None => {}
            }
        }
        match failed {
            Some(e) => Err(e),
            None => Ok(channel),
        }
    }
}

impl Default for PendingProcessConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PendingProcessConnection {
    fn drop(&mut self) {
        if self.connected {
            return;
        }
        for token in self.tokens.drain(..) {
            let slot = registry().remove(&token);
            if let Some(TokenSlot::Reserved { parked }) = slot {
                // Never connected: the reserved far end dies, and the local
                // handle observes peer closure.
                parked.close();
            } else if let Some(other) = slot {
                registry().insert(token, other);
            }
        }
    }
}

/// Claim the pipe reserved under `token`.
///
/// Always returns a usable handle immediately: a same-process reservation is
/// fused directly, an endpoint that already arrived over a channel is handed
/// out, and an early claim parks until the token-bind frame shows up. A
/// second claim of the same token fails.
pub fn create_child_message_pipe(token: &str) -> Result<Handle> {
    let mut reg = registry();
    match reg.remove(token) {
        Some(TokenSlot::Reserved { parked }) => {
            reg.insert(token.to_owned(), TokenSlot::Claimed);
            drop(reg);
            debug!("token claimed in-process");
            Ok(insert_pipe(parked))
        }
        Some(TokenSlot::Arrived { endpoint }) => {
            reg.insert(token.to_owned(), TokenSlot::Claimed);
            drop(reg);
            Ok(insert_pipe(endpoint))
        }
        Some(slot @ (TokenSlot::Waiting { .. } | TokenSlot::Claimed)) => {
            reg.insert(token.to_owned(), slot);
            Err(NodeError::TokenAlreadyClaimed)
        }
        None => {
            let endpoint = PipeEndpoint::new_detached();
            reg.insert(
                token.to_owned(),
                TokenSlot::Waiting {
                    endpoint: endpoint.clone(),
                },
            );
            drop(reg);
            Ok(insert_pipe(endpoint))
        }
    }
}

/// Called by the channel when a token-bind frame arrives: hand back the
/// endpoint of a claim that is already waiting, marking the token claimed.
pub(crate) fn take_waiting_claim(token: &str) -> Option<Arc<PipeEndpoint>> {
    let mut reg = registry();
    match reg.remove(token) {
        Some(TokenSlot::Waiting { endpoint }) => {
            reg.insert(token.to_owned(), TokenSlot::Claimed);
            Some(endpoint)
        }
        Some(other) => {
            reg.insert(token.to_owned(), other);
            None
        }
        None => None,
    }
}

/// Called by the channel after splicing an arrived endpoint; parks it for a
/// future claim unless the claim already happened.
pub(crate) fn remote_endpoint_arrived(token: &str, endpoint: Arc<PipeEndpoint>) {
    let mut reg = registry();
    match reg.get(token) {
        Some(TokenSlot::Claimed) => {}
        Some(_) => {
            // A duplicate bind for a live slot; drop the newcomer.
            endpoint.close();
        }
        None => {
            reg.insert(token.to_owned(), TokenSlot::Arrived { endpoint });
        }
    }
}
