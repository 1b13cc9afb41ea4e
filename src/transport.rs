use crate::config::ConnectionConfig;
use crate::error::{ArcamError, Result};
use crate::protocol::{hex, FrameBuffer, Response};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

const READ_BUFFER_SIZE: usize = 1024;
const STOP_GRACE: Duration = Duration::from_millis(500);
const STATE_EVENT_CAPACITY: usize = 32;

/// State of the TCP connection to the receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Explicitly closed; terminal
    Closing,
}

/// Consumer of everything the read loop produces
pub(crate) trait FrameSink: Send + Sync + 'static {
    /// A complete response frame arrived
    fn frame(&self, response: Response);

    /// The connection dropped or was closed
    fn connection_lost(&self);
}

/// Exponential backoff: base, 2 * base, 4 * base ... capped at max
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    base: Duration,
    max: Duration,
    current: Option<Duration>,
}

impl Backoff {
    pub(crate) fn new(base: Duration, max: Duration) -> Self {
        Self {
            base: base.min(max),
            max,
            current: None,
        }
    }

    /// Delay to wait before the next attempt
    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = match self.current {
            None => self.base,
            Some(previous) => (previous * 2).min(self.max),
        };
        self.current = Some(delay);
        delay
    }

    /// Start over from the base delay
    pub(crate) fn reset(&mut self) {
        self.current = None;
    }
}

/// Owner of the single TCP connection to a receiver
///
/// After the first successful [`Transport::connect`] a background task owns
/// the read half: it decodes frames into the [`FrameSink`] and, when the
/// connection drops, reconnects with [`Backoff`] until [`Transport::close`].
pub(crate) struct Transport {
    inner: Arc<Inner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    config: ConnectionConfig,
    sink: Arc<dyn FrameSink>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    state_tx: watch::Sender<ConnectionState>,
    /// Every transition in order; `state_tx` only keeps the latest
    events_tx: broadcast::Sender<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    /// Signalled by a failed write so the read loop notices half-dead sockets
    write_failed: Notify,
}

impl Transport {
    pub(crate) fn new(config: ConnectionConfig, sink: Arc<dyn FrameSink>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, _) = broadcast::channel(STATE_EVENT_CAPACITY);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                config,
                sink,
                writer: Mutex::new(None),
                state_tx,
                events_tx,
                shutdown_tx,
                write_failed: Notify::new(),
            }),
            task: Mutex::new(None),
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub(crate) fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub(crate) fn state_events(&self) -> broadcast::Receiver<ConnectionState> {
        self.inner.events_tx.subscribe()
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Make a single connection attempt and start the read loop on success
    pub(crate) async fn connect(&self) -> Result<()> {
        if self.inner.is_closing() {
            return Err(ArcamError::connection("transport is closed"));
        }

        let mut task = self.task.lock().await;
        if task.is_some() {
            // The background task already owns the connection and its reconnects
            return Ok(());
        }

        let stream = self.inner.dial().await?;
        let reader = self
            .inner
            .attach(stream)
            .await
            .ok_or_else(|| ArcamError::connection("transport is closed"))?;

        *task = Some(tokio::spawn(self.inner.clone().run(reader)));
        Ok(())
    }

    /// Write one encoded frame
    pub(crate) async fn write(&self, bytes: &[u8]) -> Result<()> {
        let mut writer = self.inner.writer.lock().await;
        let Some(stream) = writer.as_mut() else {
            return Err(ArcamError::connection("not connected"));
        };

        if let Err(e) = stream.write_all(bytes).await {
            tracing::error!("Failed to write to {}: {}", self.inner.config.address(), e);
            *writer = None;
            self.inner.write_failed.notify_one();
            return Err(ArcamError::io("write failed", e));
        }

        tracing::debug!("Sent frame: {}", hex(bytes));
        Ok(())
    }

    /// Close the socket, stop the read loop and suppress reconnection
    pub(crate) async fn close(&self) {
        if self.inner.is_closing() {
            return;
        }

        tracing::info!("Closing connection to {}", self.inner.config.address());
        self.inner.shutdown_tx.send_replace(true);
        self.inner.enter_closing();

        if let Some(mut writer) = self.inner.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }

        if let Some(mut handle) = self.task.lock().await.take() {
            if timeout(STOP_GRACE, &mut handle).await.is_err() {
                tracing::warn!("Transport task did not stop in time, aborting");
                handle.abort();
            }
        }

        self.inner.sink.connection_lost();
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.inner.shutdown_tx.send_replace(true);
    }
}

impl Inner {
    fn is_closing(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Closing is terminal and never overwritten
    fn set_state(&self, state: ConnectionState) {
        self.transition(|current| *current != ConnectionState::Closing && *current != state, state);
    }

    fn enter_closing(&self) {
        self.transition(|current| *current != ConnectionState::Closing, ConnectionState::Closing);
    }

    /// Events are published under the watch lock so both channels agree on order
    fn transition(&self, allowed: impl Fn(&ConnectionState) -> bool, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if !allowed(current) {
                return false;
            }
            tracing::debug!("Connection state {:?} -> {:?}", current, state);
            *current = state;
            let _ = self.events_tx.send(state);
            true
        });
    }

    async fn dial(&self) -> Result<TcpStream> {
        let address = self.config.address();
        self.set_state(ConnectionState::Connecting);
        tracing::info!("Connecting to {}", address);

        let connect = TcpStream::connect((self.config.host.as_str(), self.config.port));
        let result = match timeout(self.config.connect_timeout(), connect).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(ArcamError::io(
                format!("connection to {} failed", address),
                e,
            )),
            Err(_) => Err(ArcamError::connection(format!(
                "connection to {} timed out",
                address
            ))),
        };

        if result.is_err() {
            self.set_state(ConnectionState::Disconnected);
        }
        result
    }

    /// Install a fresh stream; `None` if the transport was closed meanwhile
    async fn attach(&self, stream: TcpStream) -> Option<OwnedReadHalf> {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Could not set TCP_NODELAY: {}", e);
        }
        let (reader, writer) = stream.into_split();

        let mut slot = self.writer.lock().await;
        if self.is_closing() {
            return None;
        }
        *slot = Some(writer);
        self.set_state(ConnectionState::Connected);
        tracing::info!("Connected to {}", self.config.address());
        Some(reader)
    }

    async fn run(self: Arc<Self>, mut reader: OwnedReadHalf) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut frames = FrameBuffer::new();
        let mut backoff = Backoff::new(self.config.reconnect_base(), self.config.reconnect_max());

        loop {
            let lost = self
                .read_until_lost(&mut reader, &mut frames, &mut shutdown_rx)
                .await;
            let Some(reason) = lost else {
                break;
            };

            tracing::warn!("Connection to {} lost: {}", self.config.address(), reason);
            self.writer.lock().await.take();
            frames.clear();
            self.set_state(ConnectionState::Disconnected);
            self.sink.connection_lost();

            match self.reconnect(&mut backoff, &mut shutdown_rx).await {
                Some(next) => reader = next,
                None => break,
            }
        }

        tracing::debug!("Transport task for {} stopped", self.config.address());
    }

    /// Pump frames until the connection fails; `None` means shutdown
    async fn read_until_lost(
        &self,
        reader: &mut OwnedReadHalf,
        frames: &mut FrameBuffer,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Option<String> {
        let mut buf = [0u8; READ_BUFFER_SIZE];

        loop {
            if *shutdown_rx.borrow_and_update() {
                return None;
            }

            tokio::select! {
                _ = shutdown_rx.changed() => {}
                _ = self.write_failed.notified() => {
                    // Permits can be left over from a previous connection
                    if self.writer.lock().await.is_none() {
                        return Some("write failed".to_string());
                    }
                }
                read = reader.read(&mut buf) => match read {
                    Ok(0) => return Some("closed by peer".to_string()),
                    Ok(n) => {
                        for response in frames.push(&buf[..n]) {
                            self.sink.frame(response);
                        }
                    }
                    Err(e) => return Some(e.to_string()),
                },
            }
        }
    }

    async fn reconnect(
        &self,
        backoff: &mut Backoff,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Option<OwnedReadHalf> {
        let mut attempt: u64 = 0;

        loop {
            attempt += 1;
            let delay = backoff.next_delay();
            tracing::info!(
                "Reconnecting to {} in {:?} (attempt {})",
                self.config.address(),
                delay,
                attempt
            );

            tokio::select! {
                _ = shutdown_rx.changed() => {}
                _ = sleep(delay) => {}
            }
            if self.is_closing() {
                return None;
            }

            let dialed = tokio::select! {
                _ = shutdown_rx.changed() => return None,
                dialed = self.dial() => dialed,
            };

            match dialed {
                Ok(stream) => {
                    backoff.reset();
                    return self.attach(stream).await;
                }
                Err(e) => {
                    tracing::warn!("Reconnection attempt {} failed: {}", attempt, e);
                }
            }
        }
    }
}
