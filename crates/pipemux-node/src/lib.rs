//! Process-to-process plumbing for pipemux.
//!
//! A [`Channel`] multiplexes any number of message pipes over one
//! fd-passing socket. [`PendingProcessConnection`] reserves pipes against a
//! process that has not been launched yet, rendezvousing by token; the
//! `connect_to_peer_*` functions do the same for named peers over Unix
//! domain sockets.

pub mod channel;
pub mod control;
pub mod error;
pub mod pending;
pub mod rendezvous;

pub use channel::{Channel, BOOTSTRAP_ROUTE};
pub use control::ControlMessage;
pub use error::{NodeError, Result};
pub use pending::{create_child_message_pipe, generate_random_token, PendingProcessConnection};
pub use rendezvous::{close_peer_connection, connect_to_peer_process, connect_to_peer_server};
