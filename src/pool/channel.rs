//! Opening pooled [`Channel`]s and leasing them out.
use super::manager::PoolInner;
use lapin::{options::ConfirmSelectOptions, Channel, Connection};
use std::ops::Deref;
use std::sync::Weak;
use tracing::debug;

/// The idle channels of a single connection generation.
pub(super) type Slots = deadpool::unmanaged::Pool<Channel>;

/// Open a channel on `connection`, with publisher confirms if requested.
pub(super) async fn open_channel(
    connection: &Connection,
    publisher_confirms: bool,
) -> Result<Channel, lapin::Error> {
    let channel = connection.create_channel().await?;
    if publisher_confirms {
        channel
            .confirm_select(ConfirmSelectOptions { nowait: false })
            .await?;
    }
    Ok(channel)
}

/// Close `channel` without waiting for the broker to acknowledge it.
///
/// Does nothing outside of a tokio runtime or if the channel is already gone.
pub(super) fn close_in_background(channel: Channel, reason: &'static str) {
    if !channel.status().connected() {
        return;
    }
    if let Ok(runtime) = tokio::runtime::Handle::try_current() {
        runtime.spawn(async move {
            if let Err(e) = channel.close(200, reason).await {
                debug!(channel_id = channel.id(), error = %e, "Failed to close channel");
            }
        });
    }
}

/// A channel leased from a [`ChannelPool`](super::ChannelPool).
///
/// Dereferences to [`lapin::Channel`]. The channel goes back to the pool on drop.
pub struct PooledChannel {
    channel: Channel,
    slots: Slots,
    generation: u64,
    pool: Weak<PoolInner>,
}

impl PooledChannel {
    pub(super) fn new(
        channel: Channel,
        slots: Slots,
        generation: u64,
        pool: Weak<PoolInner>,
    ) -> Self {
        Self {
            channel,
            slots,
            generation,
            pool,
        }
    }

    /// Generation of the pool this channel was leased from.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Deref for PooledChannel {
    type Target = Channel;

    fn deref(&self) -> &Channel {
        &self.channel
    }
}

impl std::fmt::Debug for PooledChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledChannel")
            .field("channel_id", &self.channel.id())
            .field("generation", &self.generation)
            .finish()
    }
}

impl Drop for PooledChannel {
    fn drop(&mut self) {
        let channel = self.channel.clone();
        match self.pool.upgrade() {
            Some(pool) => pool.check_in(channel, &self.slots, self.generation),
            None => close_in_background(channel, "client dropped"),
        }
    }
}
