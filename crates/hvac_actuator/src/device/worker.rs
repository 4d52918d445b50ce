//! Device Worker
//!
//! [`CqrsDevice`] is the cloneable handle; the worker task behind it owns the
//! driver and is the only place hardware I/O happens.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;

use hvac_types::{DeviceState, Error, Result, Signal};

use super::{Actuator, Command, Completion, DeviceOptions, Driver, Pacer};

/// Capacity of the per-device state broadcast
const STATE_BUFFER: usize = 64;

// ─────────────────────────────────────────────────────────────────────────────
// Envelope
// ─────────────────────────────────────────────────────────────────────────────

/// Messages from handles to the worker
enum Envelope<C> {
    /// Apply a command, subject to pacing
    Command {
        command: C,
        done: Option<oneshot::Sender<()>>,
    },

    /// Run the closing command and stop
    Close(oneshot::Sender<()>),
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared State
// ─────────────────────────────────────────────────────────────────────────────

struct Snapshot<C> {
    requested: Option<C>,
    actual: Option<C>,
    available: bool,
    last_error: Option<Error>,
}

/// State shared between the handles and the worker
struct Inner<C> {
    id: String,
    close_command: C,
    snapshot: Mutex<Snapshot<C>>,
    queue_depth: AtomicUsize,
    state_tx: Mutex<Option<broadcast::Sender<Signal<DeviceState<C>>>>>,
    closed: AtomicBool,
}

impl<C: Command> Inner<C> {
    fn state(&self) -> DeviceState<C> {
        let snapshot = self.snapshot.lock();
        DeviceState {
            id: self.id.clone(),
            available: snapshot.available,
            requested: snapshot.requested.clone(),
            actual: snapshot.actual.clone(),
            queue_depth: self.queue_depth.load(Ordering::SeqCst),
        }
    }

    fn signal(&self) -> Signal<DeviceState<C>> {
        let state = self.state();
        let error = self.snapshot.lock().last_error.clone();
        match error {
            Some(e) if !state.available => Signal::failure(Utc::now(), Some(state), e),
            _ => Signal::new(Utc::now(), state),
        }
    }

    fn publish(&self) {
        if let Some(tx) = self.state_tx.lock().as_ref() {
            // No subscribers is fine
            let _ = tx.send(self.signal());
        }
    }

    fn enqueue(&self) {
        self.queue_depth.fetch_add(1, Ordering::SeqCst);
    }

    fn dequeue(&self) {
        let result = self
            .queue_depth
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |depth| {
                depth.checked_sub(1)
            });
        if result.is_err() {
            tracing::error!(device = %self.id, "Queue depth underflow");
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Device Handle
// ─────────────────────────────────────────────────────────────────────────────

/// Handle to a device worker
///
/// Lightweight and cloneable. The worker stops after [`close`](Actuator::close)
/// or when the last handle is dropped.
pub struct CqrsDevice<C> {
    inner: Arc<Inner<C>>,
    command_tx: Arc<Mutex<Option<mpsc::UnboundedSender<Envelope<C>>>>>,
}

impl<C> Clone for CqrsDevice<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            command_tx: Arc::clone(&self.command_tx),
        }
    }
}

impl<C: Command> CqrsDevice<C> {
    /// Spawn the worker for a device
    ///
    /// `close_command` is written, bypassing pacing, when the device is closed.
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        id: impl Into<String>,
        driver: Arc<dyn Driver<C>>,
        close_command: C,
        options: DeviceOptions,
    ) -> Result<Self> {
        options.validate()?;

        let id = id.into();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = broadcast::channel(STATE_BUFFER);

        let inner = Arc::new(Inner {
            id: id.clone(),
            close_command,
            snapshot: Mutex::new(Snapshot {
                requested: None,
                actual: None,
                available: true,
                last_error: None,
            }),
            queue_depth: AtomicUsize::new(0),
            state_tx: Mutex::new(Some(state_tx)),
            closed: AtomicBool::new(false),
        });

        let worker = Worker {
            inner: Arc::clone(&inner),
            driver,
            command_rx,
            pacer: Pacer::new(options.pace),
            heartbeat: options.heartbeat,
            retry_backoff: options.retry_backoff,
            last_write: None,
        };

        tokio::spawn(worker.run());
        tracing::debug!(device = %id, ?options, "Device worker spawned");

        Ok(Self {
            inner,
            command_tx: Arc::new(Mutex::new(Some(command_tx))),
        })
    }

    /// Whether [`close`](Actuator::close) has been called
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn enqueue(&self, command: C, done: Option<oneshot::Sender<()>>) -> Result<()> {
        // Held across the send so close() can't slip in between check and send
        let guard = self.command_tx.lock();
        let tx = guard
            .as_ref()
            .ok_or_else(|| Error::Closed(self.inner.id.clone()))?;

        self.inner.snapshot.lock().requested = Some(command.clone());
        self.inner.enqueue();

        if tx.send(Envelope::Command { command, done }).is_err() {
            self.inner.dequeue();
            return Err(Error::Closed(self.inner.id.clone()));
        }
        drop(guard);

        self.inner.publish();
        Ok(())
    }
}

#[async_trait]
impl<C: Command> Actuator<C> for CqrsDevice<C> {
    fn id(&self) -> &str {
        &self.inner.id
    }

    fn set_state(&self, command: C) -> Result<DeviceState<C>> {
        self.enqueue(command, None)?;
        Ok(self.inner.state())
    }

    fn submit(&self, command: C) -> Result<Completion> {
        let (done_tx, done_rx) = oneshot::channel();
        self.enqueue(command, Some(done_tx))?;
        Ok(done_rx)
    }

    fn state(&self) -> DeviceState<C> {
        self.inner.state()
    }

    fn flux(&self) -> broadcast::Receiver<Signal<DeviceState<C>>> {
        match self.inner.state_tx.lock().as_ref() {
            Some(tx) => tx.subscribe(),
            None => {
                // Already closed: hand out a receiver that reports completion
                let (tx, rx) = broadcast::channel(1);
                drop(tx);
                rx
            }
        }
    }

    async fn close(&self) -> Result<DeviceState<C>> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            tracing::warn!(device = %self.inner.id, "Device already closed, ignoring");
            return Ok(self.inner.state());
        }

        let tx = self
            .command_tx
            .lock()
            .take()
            .ok_or_else(|| Error::Closed(self.inner.id.clone()))?;

        tracing::info!(device = %self.inner.id, "Closing device");

        self.inner.snapshot.lock().requested = Some(self.inner.close_command.clone());
        self.inner.enqueue();

        let (done_tx, done_rx) = oneshot::channel();
        if tx.send(Envelope::Close(done_tx)).is_err() {
            self.inner.dequeue();
            return Err(Error::ChannelClosed);
        }
        drop(tx);

        done_rx.await.map_err(|_| Error::ChannelClosed)?;
        Ok(self.inner.state())
    }
}

impl<C: Command> std::fmt::Debug for CqrsDevice<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CqrsDevice")
            .field("id", &self.inner.id)
            .field("state", &self.inner.state())
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Worker Task
// ─────────────────────────────────────────────────────────────────────────────

struct Worker<C> {
    inner: Arc<Inner<C>>,
    driver: Arc<dyn Driver<C>>,
    command_rx: mpsc::UnboundedReceiver<Envelope<C>>,
    pacer: Pacer<C>,
    heartbeat: Option<Duration>,
    retry_backoff: Duration,
    last_write: Option<(C, Instant)>,
}

impl<C: Command> Worker<C> {
    async fn run(mut self) {
        tracing::debug!(device = %self.inner.id, "Device worker started");

        loop {
            let envelope = match self.heartbeat_deadline() {
                Some(deadline) => {
                    match tokio::time::timeout_at(deadline, self.command_rx.recv()).await {
                        Ok(envelope) => envelope,
                        Err(_) => {
                            self.beat().await;
                            continue;
                        }
                    }
                }
                None => self.command_rx.recv().await,
            };

            match envelope {
                Some(Envelope::Command { command, done }) => {
                    self.execute(command).await;
                    if let Some(done) = done {
                        let _ = done.send(());
                    }
                }
                Some(Envelope::Close(done)) => {
                    self.shutdown().await;
                    let _ = done.send(());
                    break;
                }
                None => {
                    tracing::debug!(device = %self.inner.id, "All handles dropped");
                    break;
                }
            }
        }

        tracing::debug!(device = %self.inner.id, "Device worker stopped");
    }

    fn heartbeat_deadline(&self) -> Option<Instant> {
        let heartbeat = self.heartbeat?;
        let (_, written_at) = self.last_write.as_ref()?;
        Some(*written_at + heartbeat)
    }

    async fn execute(&mut self, command: C) {
        if self.is_closing_duplicate(&command) {
            tracing::trace!(device = %self.inner.id, ?command, "Closing, duplicate dropped");
        } else if self.pacer.admit(&command, Instant::now()) {
            self.write(&command).await;
        } else {
            tracing::trace!(device = %self.inner.id, ?command, "Paced, not sent");
        }

        self.inner.dequeue();
        self.inner.publish();
    }

    /// Once close is requested, repeats of the last write are not sent again
    fn is_closing_duplicate(&self, command: &C) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
            && matches!(&self.last_write, Some((last, _)) if last == command)
    }

    async fn beat(&mut self) {
        let Some((command, _)) = self.last_write.clone() else {
            return;
        };

        tracing::debug!(device = %self.inner.id, ?command, "Heartbeat");
        if self.write(&command).await {
            self.pacer.record(command, Instant::now());
        } else {
            // Nothing left to keep alive
            self.last_write = None;
        }
        self.inner.publish();
    }

    async fn shutdown(&mut self) {
        let command = self.inner.close_command.clone();
        self.write(&command).await;
        self.inner.dequeue();

        let last = self.inner.signal();
        if let Some(tx) = self.inner.state_tx.lock().take() {
            let _ = tx.send(last);
        }

        tracing::info!(device = %self.inner.id, ?command, "Device closed");
    }

    /// Write to hardware until it succeeds or fails permanently
    ///
    /// Returns whether the command reached the hardware.
    async fn write(&mut self, command: &C) -> bool {
        let mut attempt: u64 = 0;

        loop {
            attempt += 1;

            match self.driver.write(command).await {
                Ok(()) => {
                    let mut snapshot = self.inner.snapshot.lock();
                    snapshot.actual = Some(command.clone());
                    snapshot.available = true;
                    snapshot.last_error = None;
                    drop(snapshot);

                    if attempt > 1 {
                        tracing::info!(device = %self.inner.id, attempt, "Hardware write recovered");
                    }
                    break;
                }
                Err(e) if e.is_permanent() => {
                    {
                        let mut snapshot = self.inner.snapshot.lock();
                        snapshot.available = false;
                        snapshot.last_error = Some(e.clone());
                    }
                    self.inner.publish();

                    tracing::error!(
                        device = %self.inner.id,
                        attempt,
                        error = %e,
                        ?command,
                        "Hardware write failed permanently, giving up"
                    );
                    return false;
                }
                Err(e) => {
                    let fresh = {
                        let mut snapshot = self.inner.snapshot.lock();
                        let fresh = snapshot.available;
                        snapshot.available = false;
                        snapshot.last_error = Some(e.clone());
                        fresh
                    };
                    if fresh {
                        self.inner.publish();
                    }

                    tracing::warn!(
                        device = %self.inner.id,
                        attempt,
                        error = %e,
                        backoff_ms = self.retry_backoff.as_millis() as u64,
                        "Hardware write failed, retrying"
                    );
                    tokio::time::sleep(self.retry_backoff).await;
                }
            }
        }

        self.last_write = Some((command.clone(), Instant::now()));
        true
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
