use std::fmt;

/// The lifecycle state of a connection.
///
/// States are ordered. A connection only ever moves to a greater state, except for the reversible
/// [`State::Active`] and [`State::Holding`] pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum State {
    /// Created, transport not yet confirmed.
    NotInitialized,
    /// Transport connected, waiting for the validate frame exchange.
    NotValidated,
    /// Reading and dispatching.
    Active,
    /// Validated but not reading; requests from the peer wait in the transport.
    Holding,
    /// Shutting down, waiting for dispatches to drain before sending the close frame.
    Closing,
    /// Close frame written, waiting for the peer to close the transport.
    ClosingPending,
    /// Transport released and every invocation failed.
    Closed,
    /// The driver task has stopped.
    Finished,
}

impl State {
    /// Rank used for monotonicity checks, with active and holding sharing a rank.
    pub(crate) fn rank(self) -> u8 {
        match self {
            State::NotInitialized => 0,
            State::NotValidated => 1,
            State::Active | State::Holding => 2,
            State::Closing => 3,
            State::ClosingPending => 4,
            State::Closed => 5,
            State::Finished => 6,
        }
    }

    /// The connection accepts new invocations.
    pub fn is_usable(self) -> bool {
        matches!(self, State::Active | State::Holding)
    }

    /// The connection is shutting down or gone.
    pub fn is_closing(self) -> bool {
        self >= State::Closing
    }

    /// Returns whether moving from `self` to `next` is allowed.
    pub(crate) fn can_move_to(self, next: State) -> bool {
        match (self, next) {
            (State::Active, State::Holding) | (State::Holding, State::Active) => true,
            (State::NotInitialized, State::Active | State::Holding) => false,
            (State::Closed, State::Finished) => true,
            (_, State::Finished) => false,
            _ => next.rank() > self.rank(),
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::NotInitialized => "not-initialized",
            State::NotValidated => "not-validated",
            State::Active => "active",
            State::Holding => "holding",
            State::Closing => "closing",
            State::ClosingPending => "closing-pending",
            State::Closed => "closed",
            State::Finished => "finished",
        };
        f.write_str(name)
    }
}

/// How [`Connection::close`](crate::Connection::close) shuts a connection down.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CloseMode {
    /// Close the transport right away, failing every pending invocation.
    Forcefully,
    /// Let in-flight dispatches finish, then run the close handshake. Pending invocations fail once
    /// the connection is closed.
    Gracefully,
    /// Like [`CloseMode::Gracefully`], but also wait for every pending two-way invocation to receive
    /// its reply before sending the close frame.
    GracefullyWithWait,
}
