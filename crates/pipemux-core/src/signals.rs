use std::time::Duration;

bitflags::bitflags! {
    /// Conditions a handle can be waited on for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Signals: u32 {
        /// A message is available to read.
        const READABLE = 1 << 0;
        /// A written message can reach the peer.
        const WRITABLE = 1 << 1;
        /// The peer endpoint has been closed.
        const PEER_CLOSED = 1 << 2;
    }
}

/// A snapshot of a handle's signal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SignalsState {
    /// Signals currently satisfied.
    pub satisfied: Signals,
    /// Signals that could still become satisfied.
    pub satisfiable: Signals,
}

impl SignalsState {
    pub fn satisfies(&self, signals: Signals) -> bool {
        self.satisfied.intersects(signals)
    }

    pub fn can_satisfy(&self, signals: Signals) -> bool {
        self.satisfiable.intersects(signals)
    }
}

/// How long a wait may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    /// Check once and return immediately.
    Poll,
    /// Block up to the given duration.
    Finite(Duration),
    /// Block until a result is known.
    Indefinite,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn satisfies_checks_intersection() {
        let state = SignalsState {
            satisfied: Signals::READABLE,
            satisfiable: Signals::READABLE | Signals::PEER_CLOSED,
        };
        assert!(state.satisfies(Signals::READABLE | Signals::WRITABLE));
        assert!(!state.satisfies(Signals::WRITABLE));
        assert!(state.can_satisfy(Signals::PEER_CLOSED));
        assert!(!state.can_satisfy(Signals::WRITABLE));
    }
}
