use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, warn};

use pipemux_core::{insert_pipe, Handle, PipeEndpoint};
use pipemux_platform::{ScmSocket, UnixDomainSocket};

use crate::channel::{Channel, BOOTSTRAP_ROUTE};
use crate::error::{NodeError, Result};

enum PeerState {
    /// Waiting for the remote to connect; the accept loop polls in a
    /// background thread so it can also watch the stop flag.
    Listening {
        stop: Arc<AtomicBool>,
        thread: Option<JoinHandle<()>>,
        endpoint: Arc<PipeEndpoint>,
    },
    Connected {
        channel: Arc<Channel>,
    },
}

static PEERS: LazyLock<Mutex<HashMap<String, PeerState>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn peers() -> MutexGuard<'static, HashMap<String, PeerState>> {
    PEERS.lock().unwrap_or_else(|e| e.into_inner())
}

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Connect to a peer process over an already-connected socket, registering
/// the connection under `token`. Returns the bootstrap pipe handle.
pub fn connect_to_peer_process(socket: ScmSocket, token: &str) -> Result<Handle> {
    let mut reg = peers();
    if reg.contains_key(token) {
        return Err(NodeError::TokenInUse);
    }
    let endpoint = PipeEndpoint::new_detached();
    let channel = Channel::spawn_bound(socket, BOOTSTRAP_ROUTE, &endpoint);
    reg.insert(token.to_owned(), PeerState::Connected { channel });
    debug!("peer connection registered");
    Ok(insert_pipe(endpoint))
}

/// Register a peer connection that waits for the remote to connect to
/// `listener`. The returned pipe handle is usable immediately; writes queue
/// until the connection is accepted.
pub fn connect_to_peer_server(listener: UnixDomainSocket, token: &str) -> Result<Handle> {
    let mut reg = peers();
    if reg.contains_key(token) {
        return Err(NodeError::TokenInUse);
    }
    let endpoint = PipeEndpoint::new_detached();
    let stop = Arc::new(AtomicBool::new(false));
    let thread = {
        let endpoint = endpoint.clone();
        let stop = stop.clone();
        let token = token.to_owned();
        std::thread::spawn(move || accept_loop(listener, endpoint, stop, token))
    };
    reg.insert(
        token.to_owned(),
        PeerState::Listening {
            stop,
            thread: Some(thread),
            endpoint: endpoint.clone(),
        },
    );
    Ok(insert_pipe(endpoint))
}

fn accept_loop(
    listener: UnixDomainSocket,
    endpoint: Arc<PipeEndpoint>,
    stop: Arc<AtomicBool>,
    token: String,
) {
    // The listener drops when this thread returns, unlinking its socket file.
    loop {
        if stop.load(Ordering::SeqCst) {
            return;
        }
        match listener.try_accept() {
            Ok(Some(socket)) => {
                let channel = Channel::spawn_bound(socket, BOOTSTRAP_ROUTE, &endpoint);
                if let Some(state) = peers().get_mut(&token) {
                    *state = PeerState::Connected { channel };
                }
                debug!("peer connected to listener");
                return;
            }
            Ok(None) => std::thread::sleep(ACCEPT_POLL_INTERVAL),
            Err(e) => {
                warn!(error = %e, "listener failed; closing peer pipe");
                endpoint.mark_peer_closed();
                return;
            }
        }
    }
}

/// Tear down the peer connection registered under `token`.
///
/// Before the remote ever connects this behaves exactly as if the peer had
/// connected and immediately closed: the local pipe observes peer closure
/// and the listener goes away, so later connection attempts fail. After a
/// connection, the channel shuts down and both sides observe peer closure.
pub fn close_peer_connection(token: &str) -> Result<()> {
    let join = {
        let mut reg = peers();
        match reg.get_mut(token) {
            None => return Err(NodeError::UnknownToken),
            Some(PeerState::Listening { stop, thread, .. }) => {
                stop.store(true, Ordering::SeqCst);
                thread.take()
            }
            Some(PeerState::Connected { .. }) => None,
        }
    };
    if let Some(join) = join {
        // Joining outside the registry lock: the accept thread takes the
        // lock itself when a connection wins the race.
        let _ = join.join();
    }

    match peers().remove(token) {
        None => Err(NodeError::UnknownToken),
        Some(PeerState::Listening { endpoint, .. }) => {
            endpoint.mark_peer_closed();
            Ok(())
        }
        Some(PeerState::Connected { channel }) => {
            channel.shutdown();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipemux_core::{close, wait, Deadline, Signals};

    fn temp_sock(tag: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("pipemux-rdv-{tag}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir.join("peer.sock")
    }

    #[test]
    fn duplicate_token_rejected() {
        let (a, b) = ScmSocket::pair().unwrap();
        let h1 = connect_to_peer_process(a, "dup-token-test").unwrap();
        let err = connect_to_peer_process(b, "dup-token-test").unwrap_err();
        assert!(matches!(err, NodeError::TokenInUse));

        close_peer_connection("dup-token-test").unwrap();
        close(h1).unwrap();
    }

    #[test]
    fn close_before_remote_connects_looks_like_peer_closure() {
        let path = temp_sock("early-close");
        let listener = UnixDomainSocket::bind(&path).unwrap();
        let h = connect_to_peer_server(listener, "early-close-test").unwrap();

        close_peer_connection("early-close-test").unwrap();

        let state = wait(h, Signals::PEER_CLOSED, Deadline::Indefinite).unwrap();
        assert!(state.satisfied.contains(Signals::PEER_CLOSED));
        close(h).unwrap();

        // The listener is gone; clients cannot connect anymore.
        assert!(UnixDomainSocket::connect(&path).is_err());
        assert!(matches!(
            close_peer_connection("early-close-test"),
            Err(NodeError::UnknownToken)
        ));
    }
}
