/// Which direction(s) of a socket are latched shut.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Direction {
    Send,
    Receive,
    Both,
}

/// Who initiated a shutdown: the local call site, or the peer (observed
/// as EOF on read, or a reset on write).
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Initiator {
    Local,
    Remote,
}

/// Tri-state direction mask plus initiator tag. Transitions are monotonic
/// and total (spec.md §3): once a direction is shut it never reopens.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct ShutdownState {
    send_shut: bool,
    receive_shut: bool,
    initiator: Option<InitiatorRecord>,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
struct InitiatorRecord(Initiator);

impl ShutdownState {
    pub fn new() -> ShutdownState {
        ShutdownState::default()
    }

    pub fn can_send(&self) -> bool {
        !self.send_shut
    }

    pub fn can_receive(&self) -> bool {
        !self.receive_shut
    }

    pub fn is_send_shut(&self) -> bool {
        self.send_shut
    }

    pub fn is_receive_shut(&self) -> bool {
        self.receive_shut
    }

    /// `completed()` returns true only once both directions are shut;
    /// the caller is responsible for also confirming queued work has
    /// drained or been cancelled before relying on this for teardown.
    pub fn completed(&self) -> bool {
        self.send_shut && self.receive_shut
    }

    pub fn initiator(&self) -> Option<Initiator> {
        self.initiator.map(|r| r.0)
    }

    /// Latches `direction` shut. Idempotent: shutting an already-shut
    /// direction is a no-op (the first initiator sticks).
    pub fn shutdown(&mut self, direction: Direction, initiator: Initiator) {
        if self.initiator.is_none() {
            self.initiator = Some(InitiatorRecord(initiator));
        }
        match direction {
            Direction::Send => self.send_shut = true,
            Direction::Receive => self.receive_shut = true,
            Direction::Both => {
                self.send_shut = true;
                self.receive_shut = true;
            }
        }
    }
}
