use crate::config::ConnectionConfig;
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::protocol::{Command, Response};
use crate::subscription::Subscription;
use crate::transport::{Backoff, ConnectionState};
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::time::sleep;

/// Connection to an Arcam receiver
///
/// A `Session` owns one TCP connection. Commands are strictly lock-step:
/// concurrent callers of [`Session::send_command`] are queued and each gets
/// the response to its own command. Unsolicited frames are delivered to
/// [`Session::subscribe`] streams.
///
/// Once open, a dropped connection is re-established in the background
/// until [`Session::close`] is called.
pub struct Session {
    config: ConnectionConfig,
    dispatcher: Dispatcher,
    command_lock: Mutex<()>,
}

impl Session {
    /// Connect to the receiver at `host:port` with default settings
    ///
    /// # Example
    ///
    /// ```no_run
    /// use arcam_avr::{Command, Session};
    /// use std::time::Duration;
    ///
    /// #[tokio::main]
    /// async fn main() -> Result<(), Box<dyn std::error::Error>> {
    ///     let session = Session::open("192.168.1.100", 50000).await?;
    ///     let response = session
    ///         .send_command(&Command::new(1, 0x00, [0x01]), Duration::from_secs(3))
    ///         .await?;
    ///     println!("Power: {:?}", response.payload);
    ///     session.close().await;
    ///     Ok(())
    /// }
    /// ```
    pub async fn open(host: impl Into<String>, port: u16) -> Result<Self> {
        Self::open_with_config(ConnectionConfig::new(host).with_port(port)).await
    }

    /// Connect using explicit settings
    ///
    /// Makes up to `config.initial_attempts` connect attempts, backing off
    /// between them, and fails with the last connection error.
    pub async fn open_with_config(config: ConnectionConfig) -> Result<Self> {
        let dispatcher = Dispatcher::new(config.clone());
        let attempts = config.initial_attempts.max(1);
        let mut backoff = Backoff::new(config.reconnect_base(), config.reconnect_max());
        let mut attempt = 0;

        loop {
            attempt += 1;
            match dispatcher.transport().connect().await {
                Ok(()) => break,
                Err(e) if attempt < attempts => {
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        "Connect attempt {}/{} to {} failed: {}; retrying in {:?}",
                        attempt,
                        attempts,
                        config.address(),
                        e,
                        delay
                    );
                    sleep(delay).await;
                }
                Err(e) => {
                    tracing::error!(
                        "Giving up on {} after {} attempt(s): {}",
                        config.address(),
                        attempt,
                        e
                    );
                    dispatcher.transport().close().await;
                    return Err(e);
                }
            }
        }

        Ok(Self {
            config,
            dispatcher,
            command_lock: Mutex::new(()),
        })
    }

    /// Get the settings this session was opened with
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Send a command and wait up to `timeout` for its response
    ///
    /// A response carrying a non-zero answer code is returned as `Ok`; check
    /// [`Response::is_success`]. Fails immediately with a connection error
    /// while the receiver is unreachable; the command is not retried.
    pub async fn send_command(&self, command: &Command, timeout: Duration) -> Result<Response> {
        let _guard = self.command_lock.lock().await;
        self.dispatcher.send(command, timeout).await
    }

    /// Send a command with the configured default timeout
    pub async fn send(&self, command: &Command) -> Result<Response> {
        self.send_command(command, self.config.command_timeout()).await
    }

    /// Send a raw command given by zone, code and payload
    pub async fn request(
        &self,
        zone: u8,
        code: u8,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Response> {
        self.send_command(&Command::new(zone, code, payload), timeout)
            .await
    }

    /// Subscribe to unsolicited responses
    ///
    /// Multiple subscriptions can be active simultaneously.
    pub fn subscribe(&self) -> Subscription {
        Subscription::new(self.dispatcher.router().subscribe())
    }

    /// Get the current connection state
    pub fn state(&self) -> ConnectionState {
        self.dispatcher.transport().state()
    }

    /// Watch connection state transitions, including reconnect attempts
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.dispatcher.transport().watch_state()
    }

    /// Every connection state transition in arrival order
    ///
    /// Unlike [`Session::watch_state`], rapid transitions such as a refused
    /// reconnect attempt (`Connecting` then `Disconnected`) are not collapsed.
    /// A receiver that falls more than 32 transitions behind gets
    /// `RecvError::Lagged`.
    pub fn state_events(&self) -> broadcast::Receiver<ConnectionState> {
        self.dispatcher.transport().state_events()
    }

    /// Whether the receiver is currently reachable
    pub fn is_available(&self) -> bool {
        self.dispatcher.transport().is_connected()
    }

    /// End all subscriptions and close the connection
    ///
    /// A command still waiting for its response fails with a connection
    /// error. Closing twice is a no-op.
    pub async fn close(&self) {
        self.dispatcher.router().close_broadcasts();
        self.dispatcher.transport().close().await;
        tracing::info!("Session to {} closed", self.config.address());
    }
}
