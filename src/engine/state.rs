//! Tunnel connection state machine (§4.E).

/// Where a tunnel sits in its open/close handshake.
///
/// `Open` is the only state in which application data or queue substream
/// traffic may flow; every other state is part of the opening or closing
/// handshake. Any state can fall through to `Closed` on a fatal transport or
/// protocol error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Inactive,
    SendRequest,
    WaitRefresh,
    Authenticating,
    Open,
    SendFin,
    WaitAckOfFin,
    WaitClose,
    SendClose,
    WaitFin,
    SendAckOfFin,
    Closed,
}

impl TunnelState {
    pub fn is_open(self) -> bool {
        matches!(self, TunnelState::Open)
    }

    pub fn is_closed(self) -> bool {
        matches!(self, TunnelState::Closed)
    }

    /// `true` if this state is part of the opening handshake (request sent, or
    /// waiting on the peer's refresh/authentication exchange).
    pub fn is_opening(self) -> bool {
        matches!(self, TunnelState::SendRequest | TunnelState::WaitRefresh | TunnelState::Authenticating)
    }

    /// `true` if this state is part of either closing handshake (local-initiated
    /// fin, or peer-initiated fin).
    pub fn is_closing(self) -> bool {
        matches!(
            self,
            TunnelState::SendFin
                | TunnelState::WaitAckOfFin
                | TunnelState::WaitClose
                | TunnelState::SendClose
                | TunnelState::WaitFin
                | TunnelState::SendAckOfFin
        )
    }
}
