use std::fmt;

/// Reason a miner TCP connection stopped being relayed by the ingress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sv1IngressError {
    /// The miner closed the socket or sent an unreadable line.
    DownstreamDropped,
    /// The session worker went away, so nothing is left to relay to.
    SessionDropped,
    /// Writing to the miner did not complete within the write timeout.
    WriteTimeout,
    /// Global shutdown was requested.
    Shutdown,
}

impl fmt::Display for Sv1IngressError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Sv1IngressError::DownstreamDropped => write!(f, "downstream dropped"),
            Sv1IngressError::SessionDropped => write!(f, "session dropped"),
            Sv1IngressError::WriteTimeout => write!(f, "write timeout"),
            Sv1IngressError::Shutdown => write!(f, "shutdown"),
        }
    }
}
