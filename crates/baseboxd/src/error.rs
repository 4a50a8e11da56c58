//! Error types for baseboxd

use basebox_ofdpa::{ChannelError, CodecError};
use thiserror::Error;
use tracing::{debug, error, warn};

/// Classification used to pick the log severity and the recovery action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Unmapped port, unknown LAG, unknown link or neighbor.
    NotFound,
    /// Rejected input; nothing was mutated.
    InvalidArgument,
    ChannelCongested,
    ChannelDown,
    /// Packet pool empty.
    ResourceExhausted,
    /// Upstream state tracking has diverged.
    InvariantViolation,
    /// Socket, device or file failures outside the core.
    Transport,
}

/// Errors that can occur in baseboxd
#[derive(Debug, Error)]
pub enum BaseboxError {
    #[error("link not found: ifindex {0}")]
    LinkNotFound(u32),

    #[error("port not found: {0}")]
    PortNotFound(String),

    #[error("no lag for bond ifindex {0}")]
    LagNotFound(u32),

    #[error("lag of bond {bond} already has member port {member}")]
    AlreadyHasMember { bond: u32, member: u32 },

    #[error("invalid port: {0}")]
    InvalidPort(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not supported: {0}")]
    NotSupported(&'static str),

    #[error("datapath channel congested")]
    ChannelCongested,

    #[error("datapath channel down")]
    ChannelDown,

    #[error("no datapath attached")]
    NotConnected,

    #[error("packet pool exhausted")]
    PoolExhausted,

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("netlink error: {0}")]
    Netlink(String),

    #[error("tap device error: {0}")]
    Tap(String),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BaseboxError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::LinkNotFound(_) | Self::PortNotFound(_) | Self::LagNotFound(_) => {
                ErrorKind::NotFound
            }
            Self::AlreadyHasMember { .. }
            | Self::InvalidPort(_)
            | Self::InvalidArgument(_)
            | Self::NotSupported(_)
            | Self::Config(_) => ErrorKind::InvalidArgument,
            Self::ChannelCongested => ErrorKind::ChannelCongested,
            Self::ChannelDown | Self::NotConnected => ErrorKind::ChannelDown,
            Self::PoolExhausted => ErrorKind::ResourceExhausted,
            Self::InvariantViolation(_) => ErrorKind::InvariantViolation,
            Self::Netlink(_) | Self::Tap(_) | Self::Codec(_) | Self::Io(_) => ErrorKind::Transport,
        }
    }

    /// Only invariant violations halt the subsystem that observed them.
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::InvariantViolation
    }

    pub fn port_not_found(key: impl std::fmt::Display) -> Self {
        Self::PortNotFound(key.to_string())
    }

    /// Logs the error at the severity its kind calls for.
    pub fn log(&self, op: &str) {
        match self.kind() {
            ErrorKind::NotFound => debug!(op, error = %self, "skipped"),
            ErrorKind::InvalidArgument
            | ErrorKind::ChannelCongested
            | ErrorKind::ChannelDown
            | ErrorKind::Transport => warn!(op, error = %self, "failed"),
            ErrorKind::ResourceExhausted => error!(op, error = %self, "dropped"),
            ErrorKind::InvariantViolation => error!(op, error = %self, "state diverged"),
        }
    }
}

impl From<ChannelError> for BaseboxError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Congested => Self::ChannelCongested,
            ChannelError::Down => Self::ChannelDown,
        }
    }
}

/// Result type alias for baseboxd operations
pub type Result<T> = std::result::Result<T, BaseboxError>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_kinds() {
        assert_eq!(BaseboxError::LagNotFound(5).kind(), ErrorKind::NotFound);
        assert_eq!(
            BaseboxError::AlreadyHasMember { bond: 5, member: 3 }.kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(BaseboxError::NotConnected.kind(), ErrorKind::ChannelDown);
        assert_eq!(BaseboxError::PoolExhausted.kind(), ErrorKind::ResourceExhausted);
    }

    #[test]
    fn test_only_invariant_violation_is_fatal() {
        assert!(BaseboxError::InvariantViolation("port 3 bound twice".into()).is_fatal());
        assert!(!BaseboxError::ChannelDown.is_fatal());
        assert!(!BaseboxError::LinkNotFound(1).is_fatal());
    }

    #[test]
    fn test_from_channel_error() {
        assert!(matches!(
            BaseboxError::from(ChannelError::Congested),
            BaseboxError::ChannelCongested
        ));
        assert!(matches!(
            BaseboxError::from(ChannelError::Down),
            BaseboxError::ChannelDown
        ));
    }
}
