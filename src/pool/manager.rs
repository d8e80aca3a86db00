use crate::amqp::backoff::{retry_with_backoff, RetryError};
use crate::amqp::configuration::{BackoffSettings, ClientSettings};
use crate::amqp::ConnectionFactory;
use crate::pool::channel::{close_in_background, open_channel, PooledChannel, Slots};
use crate::pool::PoolError;
use deadpool::unmanaged::{self, PoolConfig};
use deadpool::Runtime;
use lapin::{Channel, Connection};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// The subset of [`ClientSettings`] the pool cares about.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub pool_size: usize,
    pub publisher_confirms: bool,
    pub checkout_timeout: Duration,
    pub backoff: BackoffSettings,
}

impl From<&ClientSettings> for PoolSettings {
    fn from(settings: &ClientSettings) -> Self {
        Self {
            pool_size: settings.pool_size,
            publisher_confirms: settings.publisher_confirms,
            checkout_timeout: settings.checkout_timeout(),
            backoff: settings.backoff.clone(),
        }
    }
}

/// A single connection to RabbitMq and a fixed-size pool of channels opened on it.
///
/// Channels are leased with [`ChannelPool::get_channel`] and go back to the pool when the
/// returned [`PooledChannel`] is dropped (or handed to [`ChannelPool::return_channel`]).
///
/// # Fault tolerance
///
/// A background task watches the connection. When it breaks, the pool dials the broker again
/// with exponential backoff and swaps in a brand-new set of channels; leases taken before the
/// swap are closed instead of being returned. If reconnecting exhausts its retries the pool
/// shuts itself down and [`ChannelPool::terminated`] fires: the process cannot do useful
/// work without a broker, and it is up to the binary to exit.
#[derive(Clone)]
pub struct ChannelPool {
    inner: Arc<PoolInner>,
}

pub(super) struct PoolInner {
    factory: ConnectionFactory,
    settings: PoolSettings,
    /// Connection and slots, swapped as a whole on reconnect.
    state: RwLock<PoolState>,
    /// Mirror of `state.generation` readable without the lock.
    generation: AtomicU64,
    closed: AtomicBool,
    terminated: CancellationToken,
    /// Serialises reconnect attempts.
    reconnecting: Mutex<()>,
    connection_lost: LostConnections,
}

struct PoolState {
    connection: Connection,
    slots: Slots,
    generation: u64,
}

impl ChannelPool {
    /// Dial the broker and fill the pool with `settings.pool_size` channels.
    ///
    /// Dialing is retried with exponential backoff. Failing to connect, or failing to open any
    /// of the channels, returns [`PoolError::Connection`]: callers are expected to treat it as
    /// fatal at startup.
    #[tracing::instrument(
        name = "channel_pool_connect",
        skip_all,
        fields(host = %factory.host(), pool_size = settings.pool_size)
    )]
    pub async fn connect(
        factory: ConnectionFactory,
        mut settings: PoolSettings,
    ) -> Result<Self, PoolError> {
        if settings.pool_size == 0 {
            warn!("A pool size of 0 cannot serve any request, using 1 instead");
            settings.pool_size = 1;
        }

        let terminated = CancellationToken::new();
        let connection = dial(&factory, &settings.backoff, &terminated).await?;

        let slots = new_slots(&settings);
        for _ in 0..settings.pool_size {
            let channel = open_channel(&connection, settings.publisher_confirms).await?;
            if let Err((channel, e)) = slots.try_add(channel) {
                close_in_background(channel, "pool is full");
                return Err(PoolError::Connection(anyhow::anyhow!(
                    "Failed to add a channel to the pool: {e}"
                )));
            }
        }

        let generation = 1;
        let (connection_lost, connection_lost_rx) = LostConnections::new();
        watch_connection(&connection, generation, connection_lost.clone());

        let inner = Arc::new(PoolInner {
            factory,
            settings,
            state: RwLock::new(PoolState {
                connection,
                slots,
                generation,
            }),
            generation: AtomicU64::new(generation),
            closed: AtomicBool::new(false),
            terminated,
            reconnecting: Mutex::new(()),
            connection_lost,
        });
        tokio::spawn(monitor(Arc::downgrade(&inner), connection_lost_rx));
        info!("Connected to RabbitMq");

        Ok(Self { inner })
    }

    /// Lease a channel, waiting up to the checkout timeout for one to be returned.
    ///
    /// Returns [`PoolError::ChannelTimeout`] if no channel frees up in time and
    /// [`PoolError::Closed`] once the pool has been shut down.
    pub async fn get_channel(&self) -> Result<PooledChannel, PoolError> {
        let timeout = self.inner.settings.checkout_timeout;
        let deadline = Instant::now() + timeout;
        loop {
            if self.inner.is_closed() {
                return Err(PoolError::Closed);
            }

            let (slots, generation) = {
                let state = self.inner.state.read().await;
                if !state.connection.status().connected() {
                    self.inner.report_connection_lost(state.generation);
                }
                (state.slots.clone(), state.generation)
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            match slots.timeout_get(Some(remaining)).await {
                Ok(object) => {
                    let channel = unmanaged::Object::take(object);
                    return Ok(PooledChannel::new(
                        channel,
                        slots,
                        generation,
                        Arc::downgrade(&self.inner),
                    ));
                }
                Err(unmanaged::PoolError::Timeout) => {
                    return Err(PoolError::ChannelTimeout(timeout));
                }
                // A reconnect swapped the slots while we were waiting: wait on the new ones.
                Err(unmanaged::PoolError::Closed)
                    if !self.inner.is_closed() && !remaining.is_zero() => {}
                Err(unmanaged::PoolError::Closed) if self.inner.is_closed() => {
                    return Err(PoolError::Closed);
                }
                Err(unmanaged::PoolError::Closed) => {
                    return Err(PoolError::ChannelTimeout(timeout));
                }
                Err(e) => {
                    return Err(PoolError::Connection(anyhow::anyhow!(
                        "Failed to check out a channel: {e}"
                    )));
                }
            }
        }
    }

    /// Give a channel back to the pool.
    ///
    /// Equivalent to dropping the lease. The channel is closed instead of pooled if the pool is
    /// full, shut down, or was rebuilt since the lease was taken; a broken channel is discarded
    /// and replaced with a fresh one in the background.
    pub fn return_channel(&self, channel: PooledChannel) {
        drop(channel);
    }

    /// Dial the broker again and rebuild the pool on the new connection.
    ///
    /// Channels that cannot be opened are skipped: the pool runs with reduced capacity rather
    /// than failing. Concurrent calls collapse into a single reconnect.
    pub async fn reconnect(&self) -> Result<(), PoolError> {
        let generation = self.inner.current_generation();
        self.inner.reconnect_from(generation).await
    }

    /// Close every pooled channel and the connection. Calling it more than once is a no-op.
    pub async fn shutdown(&self) {
        self.inner.close("client shut down").await;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Incremented every time the pool is rebuilt on a new connection.
    pub fn generation(&self) -> u64 {
        self.inner.current_generation()
    }

    /// A token cancelled when the pool is closed, either by [`ChannelPool::shutdown`] or because
    /// reconnecting to the broker failed for good.
    pub fn terminated(&self) -> CancellationToken {
        self.inner.terminated.child_token()
    }
}

impl PoolInner {
    pub(super) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(super) fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn report_connection_lost(&self, generation: u64) {
        self.connection_lost.report(generation);
    }

    /// Put a channel back into `slots`, or get rid of it.
    pub(super) fn check_in(self: &Arc<Self>, channel: Channel, slots: &Slots, generation: u64) {
        if self.is_closed() {
            close_in_background(channel, "client shut down");
            return;
        }
        if generation != self.current_generation() {
            close_in_background(channel, "channel pool was rebuilt");
            return;
        }
        if !channel.status().connected() {
            debug!(channel_id = channel.id(), "Discarding a broken channel");
            self.replenish(slots.clone(), generation);
            return;
        }
        if let Err((channel, e)) = slots.try_add(channel) {
            warn!("Could not return a channel to the pool ({e}), closing it");
            close_in_background(channel, "channel pool is full");
        }
    }

    /// Open a channel in place of a broken one, in the background.
    fn replenish(self: &Arc<Self>, slots: Slots, generation: u64) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let pool = Arc::clone(self);
        runtime.spawn(async move {
            let state = pool.state.read().await;
            if state.generation != generation || pool.is_closed() {
                return;
            }
            match open_channel(&state.connection, pool.settings.publisher_confirms).await {
                Ok(channel) => {
                    if let Err((channel, _)) = slots.try_add(channel) {
                        close_in_background(channel, "channel pool is full");
                    }
                }
                Err(e) => warn!(
                    error = %e,
                    "Failed to replace a broken channel, running with reduced capacity"
                ),
            }
        });
    }

    #[tracing::instrument(name = "channel_pool_reconnect", skip(self))]
    async fn reconnect_from(&self, expected_generation: u64) -> Result<(), PoolError> {
        let _guard = self.reconnecting.lock().await;
        if self.is_closed() {
            return Err(PoolError::Closed);
        }
        if self.current_generation() != expected_generation {
            debug!("The pool was already rebuilt by another reconnect");
            return Ok(());
        }

        let connection = dial(&self.factory, &self.settings.backoff, &self.terminated).await?;
        let generation = expected_generation + 1;
        let slots = new_slots(&self.settings);
        for slot in 0..self.settings.pool_size {
            match open_channel(&connection, self.settings.publisher_confirms).await {
                Ok(channel) => {
                    if let Err((channel, _)) = slots.try_add(channel) {
                        close_in_background(channel, "channel pool is full");
                    }
                }
                Err(e) => warn!(
                    slot,
                    error = %e,
                    "Failed to open a channel while rebuilding the pool, running with reduced capacity"
                ),
            }
        }
        watch_connection(&connection, generation, self.connection_lost.clone());

        let mut state = self.state.write().await;
        if self.is_closed() {
            drain(&slots, "client shut down");
            let _ = connection.close(200, "client shut down").await;
            return Err(PoolError::Closed);
        }
        let old_connection = std::mem::replace(&mut state.connection, connection);
        let old_slots = std::mem::replace(&mut state.slots, slots);
        state.generation = generation;
        self.generation.store(generation, Ordering::Release);
        drop(state);

        drain(&old_slots, "channel pool was rebuilt");
        tokio::spawn(async move {
            if let Err(e) = old_connection.close(200, "channel pool was rebuilt").await {
                debug!(error = %e, "Failed to close the previous connection");
            }
        });
        info!(generation, "Reconnected to RabbitMq");
        Ok(())
    }

    async fn close(&self, reason: &'static str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.terminated.cancel();

        let state = self.state.write().await;
        drain(&state.slots, reason);
        if let Err(e) = state.connection.close(200, reason).await {
            debug!(error = %e, "Failed to close the connection to RabbitMq");
        }
        info!(reason, "Channel pool closed");
    }
}

/// The latest connection generation reported as lost.
///
/// Reports are frequent (every checkout on a broken connection makes one) but only the first
/// for a given generation wakes the monitor up, so nothing piles up while it reconnects.
#[derive(Clone)]
struct LostConnections(Arc<watch::Sender<u64>>);

impl LostConnections {
    fn new() -> (Self, watch::Receiver<u64>) {
        let (sender, receiver) = watch::channel(0);
        (Self(Arc::new(sender)), receiver)
    }

    fn report(&self, generation: u64) {
        self.0.send_if_modified(|lost| {
            if generation > *lost {
                *lost = generation;
                true
            } else {
                false
            }
        });
    }
}

/// Waits for connection losses and rebuilds the pool.
async fn monitor(pool: Weak<PoolInner>, mut connection_lost: watch::Receiver<u64>) {
    while connection_lost.changed().await.is_ok() {
        let generation = *connection_lost.borrow_and_update();
        let Some(pool) = pool.upgrade() else {
            break;
        };
        if pool.is_closed() {
            break;
        }
        if generation != pool.current_generation() {
            continue;
        }

        error!(generation, "Lost the connection to RabbitMq, reconnecting");
        match pool.reconnect_from(generation).await {
            Ok(()) => {}
            Err(PoolError::Closed) => break,
            Err(e) => {
                error!(error = ?e, "Giving up on reconnecting to RabbitMq");
                pool.close("reconnecting to RabbitMq failed").await;
                break;
            }
        }
    }
}

async fn dial(
    factory: &ConnectionFactory,
    backoff: &BackoffSettings,
    cancel: &CancellationToken,
) -> Result<Connection, PoolError> {
    retry_with_backoff("rabbitmq_connect", backoff, cancel, || factory.new_connection())
        .await
        .map_err(|e| match e {
            RetryError::Cancelled { .. } => PoolError::Closed,
            RetryError::Exhausted {
                operation,
                attempts,
                source,
            } => PoolError::Connection(
                source.context(format!("`{operation}` failed after {attempts} attempts")),
            ),
        })
}

fn new_slots(settings: &PoolSettings) -> Slots {
    let mut config = PoolConfig::new(settings.pool_size);
    config.timeout = Some(settings.checkout_timeout);
    config.runtime = Some(Runtime::Tokio1);
    Slots::from_config(&config)
}

/// Close the idle channels of `slots` and wake up whoever is waiting on them.
fn drain(slots: &Slots, reason: &'static str) {
    while let Ok(channel) = slots.try_remove() {
        close_in_background(channel, reason);
    }
    slots.close();
}

fn watch_connection(connection: &Connection, generation: u64, connection_lost: LostConnections) {
    connection.on_error(move |e| {
        warn!(generation, "RabbitMQ broken connection: {:?}", e);
        connection_lost.report(generation);
    });
}
