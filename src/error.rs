use std::fmt;

/// Which of our two endpoint channels a check refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Incoming,
    Outgoing,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Incoming => write!(f, "incoming"),
            Side::Outgoing => write!(f, "outgoing"),
        }
    }
}

/// Coarse classification driving the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Parameter,
    Peer,
    Liquidity,
    Routing,
    Payment,
    Storage,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RebalanceError {
    #[error("missing required parameter: {0}")]
    MissingParameter(&'static str),
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("one of the nodes is self")]
    SelfNode,
    #[error("incoming and outgoing endpoints are the same")]
    SameEndpoints,
    #[error("amount must be greater than zero")]
    ZeroAmount,

    #[error("no peers yet")]
    NoPeers,
    #[error("{0} is not a peer")]
    NoPeer(String),
    #[error("no peer channel with short channel id {0}")]
    NoPeerChannel(String),
    #[error("{0} channel {1} is not in the graph")]
    NoGraphChannel(Side, String),
    #[error("{0} channel is not in normal state")]
    ChannelNotNormal(Side),
    #[error("{0} peer is disconnected")]
    PeerDisconnected(Side),

    #[error("{0} channel has insufficient balance")]
    InsufficientBalance(Side),
    #[error("channel {0} would cross its deplete/fill threshold")]
    ThresholdReached(String),
    #[error("no candidates")]
    NoCandidates,

    #[error("no route")]
    NoRoute,
    #[error("route too expensive. Cheapest route found was {fee_ppm} ppm, but maxppm is {max_ppm}")]
    RouteTooExpensive { fee_ppm: u64, max_ppm: u64 },

    #[error("temporary failure: {0}")]
    TemporaryFailure(String),
    #[error("fee insufficient on final hop ({0})")]
    FeeInsufficient(String),
    #[error("timed out waiting for payment, outcome unknown")]
    PaymentTimeout,

    #[error("storage error: {0}")]
    Storage(String),
}

impl RebalanceError {
    pub fn kind(&self) -> ErrorKind {
        use RebalanceError::*;
        match self {
            MissingParameter(_) | InvalidParameter(_) | SelfNode | SameEndpoints | ZeroAmount => {
                ErrorKind::Parameter
            }
            NoPeers | NoPeer(_) | NoPeerChannel(_) | NoGraphChannel(..) | ChannelNotNormal(_)
            | PeerDisconnected(_) => ErrorKind::Peer,
            InsufficientBalance(_) | ThresholdReached(_) | NoCandidates => ErrorKind::Liquidity,
            NoRoute | RouteTooExpensive { .. } => ErrorKind::Routing,
            TemporaryFailure(_) | FeeInsufficient(_) | PaymentTimeout => ErrorKind::Payment,
            Storage(_) => ErrorKind::Storage,
        }
    }

    /// Routing failures are answered by widening the hop budget.
    pub fn escalates_hops(&self) -> bool {
        self.kind() == ErrorKind::Routing
    }

    /// Only plain transient payment failures consume an attempt and retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RebalanceError::TemporaryFailure(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(RebalanceError::SelfNode.kind(), ErrorKind::Parameter);
        assert_eq!(
            RebalanceError::PeerDisconnected(Side::Incoming).kind(),
            ErrorKind::Peer
        );
        assert_eq!(
            RebalanceError::InsufficientBalance(Side::Outgoing).kind(),
            ErrorKind::Liquidity
        );
        assert_eq!(RebalanceError::NoRoute.kind(), ErrorKind::Routing);
        assert_eq!(RebalanceError::PaymentTimeout.kind(), ErrorKind::Payment);
        assert_eq!(
            RebalanceError::Storage("disk full".into()).kind(),
            ErrorKind::Storage
        );
    }

    #[test]
    fn test_retry_policy() {
        assert!(RebalanceError::NoRoute.escalates_hops());
        assert!(RebalanceError::RouteTooExpensive { fee_ppm: 20, max_ppm: 10 }.escalates_hops());
        assert!(!RebalanceError::PaymentTimeout.escalates_hops());

        assert!(RebalanceError::TemporaryFailure("x".into()).is_retryable());
        assert!(!RebalanceError::FeeInsufficient("x".into()).is_retryable());
        assert!(!RebalanceError::PaymentTimeout.is_retryable());
    }

    #[test]
    fn test_too_expensive_message() {
        let err = RebalanceError::RouteTooExpensive { fee_ppm: 120, max_ppm: 10 };
        assert_eq!(
            err.to_string(),
            "route too expensive. Cheapest route found was 120 ppm, but maxppm is 10"
        );
    }
}
