//! Transport lifecycle states and the closed-signal helper.

use std::fmt;

use tokio::sync::watch;

/// Lifecycle state of a transport.
///
/// ```text
/// Connecting ──► Open ──► Reconnecting ──► Open ...
///      │          │             │
///      └──────────┴─────────────┴──► Closed   (terminal)
/// ```
///
/// Server transports start in `Open` and never reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportState {
    /// The first connection attempt cycle is running.
    Connecting,
    /// A channel is up and messages flow.
    Open,
    /// A previously open channel dropped and a new one is being opened.
    Reconnecting,
    /// Terminal; nothing is sent or published after this.
    Closed,
}

impl TransportState {
    /// Whether messages can be sent in this state.
    pub fn is_open(self) -> bool {
        self == Self::Open
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Resolves once the closed flag is set, or its sender is gone.
pub(crate) async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    loop {
        if *closed.borrow_and_update() {
            return;
        }
        if closed.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(TransportState::Connecting.to_string(), "connecting");
        assert_eq!(TransportState::Reconnecting.to_string(), "reconnecting");
        assert_eq!(TransportState::Closed.to_string(), "closed");
    }

    #[test]
    fn test_only_open_is_open() {
        assert!(TransportState::Open.is_open());
        assert!(!TransportState::Connecting.is_open());
        assert!(!TransportState::Reconnecting.is_open());
        assert!(!TransportState::Closed.is_open());
    }

    #[tokio::test]
    async fn test_wait_closed_returns_when_flag_set() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { wait_closed(&mut rx).await });
        tx.send_replace(true);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_closed_returns_when_already_set() {
        let (_tx, mut rx) = watch::channel(true);
        wait_closed(&mut rx).await;
    }
}
