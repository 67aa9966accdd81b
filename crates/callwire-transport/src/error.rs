/// Errors that can occur in the channel layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The channel is closed; nothing can be sent on it anymore.
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    /// Establishing the connection failed.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// Sending data failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Receiving data failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// Binding or accepting connections failed.
    #[error("accept failed: {0}")]
    AcceptFailed(#[source] std::io::Error),

    /// The listener will not produce any more channels.
    #[error("listener closed")]
    ListenerClosed,
}
