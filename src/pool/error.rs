/// Error returned by [`ChannelPool`](super::ChannelPool) operations.
#[derive(thiserror::Error, Debug)]
pub enum PoolError {
    /// Dialing the broker or opening channels on the connection failed.
    #[error("Failed to establish a usable connection with the RabbitMq broker")]
    Connection(#[source] anyhow::Error),
    /// No channel became available before the checkout timeout elapsed.
    #[error("Timed out after {0:?} waiting for a free channel")]
    ChannelTimeout(std::time::Duration),
    /// The pool was shut down.
    #[error("The client has been shut down")]
    Closed,
}

impl From<lapin::Error> for PoolError {
    fn from(err: lapin::Error) -> Self {
        Self::Connection(err.into())
    }
}
