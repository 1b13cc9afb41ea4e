use crate::config::ConnectionConfig;
use crate::error::{ArcamError, Result};
use crate::protocol::{encode, Command, Response};
use crate::transport::{FrameSink, Transport};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::time::{timeout_at, Instant};

/// The command currently waiting for its response
struct PendingRequest {
    id: u64,
    zone: u8,
    code: u8,
    deadline: Instant,
    tx: oneshot::Sender<Result<Response>>,
}

impl PendingRequest {
    fn matches(&self, response: &Response) -> bool {
        self.zone == response.zone && self.code == response.code
    }

    /// Past its deadline, or the caller stopped waiting
    fn is_stale(&self) -> bool {
        self.tx.is_closed() || Instant::now() >= self.deadline
    }
}

/// Handle returned when a request takes the pending slot
struct Ticket {
    id: u64,
    deadline: Instant,
    rx: oneshot::Receiver<Result<Response>>,
}

/// Matches incoming frames against the single pending request and fans out
/// everything else as broadcasts.
pub(crate) struct Router {
    pending: Mutex<Option<PendingRequest>>,
    /// `None` once broadcasts have been shut down
    broadcast_tx: Mutex<Option<broadcast::Sender<Response>>>,
    next_id: AtomicU64,
}

impl Router {
    pub(crate) fn new(broadcast_capacity: usize) -> Self {
        let (broadcast_tx, _) = broadcast::channel(broadcast_capacity.max(1));
        Self {
            pending: Mutex::new(None),
            broadcast_tx: Mutex::new(Some(broadcast_tx)),
            next_id: AtomicU64::new(1),
        }
    }

    fn lock_pending(&self) -> MutexGuard<'_, Option<PendingRequest>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_broadcast(&self) -> MutexGuard<'_, Option<broadcast::Sender<Response>>> {
        self.broadcast_tx.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim the pending slot for `command`
    fn register(&self, command: &Command, timeout: Duration) -> Result<Ticket> {
        let mut slot = self.lock_pending();
        if let Some(existing) = slot.as_ref() {
            if !existing.is_stale() {
                return Err(ArcamError::Busy);
            }
            tracing::debug!(
                "Releasing stale request for command 0x{:02X} (zone {})",
                existing.code,
                existing.zone
            );
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + timeout;
        let (tx, rx) = oneshot::channel();
        *slot = Some(PendingRequest {
            id,
            zone: command.zone(),
            code: command.code(),
            deadline,
            tx,
        });

        Ok(Ticket { id, deadline, rx })
    }

    /// Free the slot if it still belongs to request `id`
    fn release(&self, id: u64) {
        let mut slot = self.lock_pending();
        if slot.as_ref().is_some_and(|pending| pending.id == id) {
            *slot = None;
        }
    }

    fn route(&self, response: Response) {
        let mut slot = self.lock_pending();
        let claimed = slot
            .as_ref()
            .is_some_and(|pending| pending.matches(&response) && !pending.is_stale());

        if claimed {
            if let Some(pending) = slot.take() {
                drop(slot);
                // The caller may have given up between the check and the send
                if let Err(Ok(response)) = pending.tx.send(Ok(response)) {
                    self.publish(response);
                }
                return;
            }
        }

        drop(slot);
        self.publish(response);
    }

    fn publish(&self, response: Response) {
        let broadcast_tx = self.lock_broadcast();
        match broadcast_tx.as_ref() {
            Some(tx) => {
                tracing::debug!(
                    "Broadcast: zone={}, code=0x{:02X}, answer=0x{:02X}",
                    response.zone,
                    response.code,
                    response.answer
                );
                if tx.send(response).is_err() {
                    tracing::debug!("No subscribers for broadcast");
                }
            }
            None => tracing::debug!("Dropping broadcast after shutdown"),
        }
    }

    /// Resolve the pending request, if any, with a connection error
    fn fail_pending(&self, reason: &str) {
        let pending = self.lock_pending().take();
        if let Some(pending) = pending {
            tracing::debug!(
                "Failing command 0x{:02X} (zone {}): {}",
                pending.code,
                pending.zone,
                reason
            );
            let _ = pending.tx.send(Err(ArcamError::connection(reason)));
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<Response> {
        match self.lock_broadcast().as_ref() {
            Some(tx) => tx.subscribe(),
            None => {
                // Already shut down: hand out a stream that ends immediately
                let (tx, rx) = broadcast::channel(1);
                drop(tx);
                rx
            }
        }
    }

    /// Drop the sender so every subscriber sees end-of-stream
    pub(crate) fn close_broadcasts(&self) {
        self.lock_broadcast().take();
    }
}

impl FrameSink for Router {
    fn frame(&self, response: Response) {
        self.route(response);
    }

    fn connection_lost(&self) {
        self.fail_pending("connection lost");
    }
}

/// Lock-step request/response on top of a [`Transport`]
pub(crate) struct Dispatcher {
    transport: Transport,
    router: Arc<Router>,
}

impl Dispatcher {
    pub(crate) fn new(config: ConnectionConfig) -> Self {
        let router = Arc::new(Router::new(config.broadcast_capacity));
        let transport = Transport::new(config, router.clone());
        Self { transport, router }
    }

    pub(crate) fn transport(&self) -> &Transport {
        &self.transport
    }

    pub(crate) fn router(&self) -> &Router {
        &self.router
    }

    /// Write `command` and wait for the response with the same zone and code.
    ///
    /// A response with a non-zero answer code is still a successful result.
    pub(crate) async fn send(&self, command: &Command, timeout: Duration) -> Result<Response> {
        let frame = encode(command)?;

        if !self.transport.is_connected() {
            return Err(ArcamError::connection("not connected"));
        }

        let ticket = self.router.register(command, timeout)?;
        tracing::debug!(
            "Sending command: zone={}, code=0x{:02X}, data={}",
            command.zone(),
            command.code(),
            crate::protocol::hex(command.payload())
        );

        if let Err(e) = self.transport.write(&frame).await {
            self.router.release(ticket.id);
            return Err(e);
        }

        match timeout_at(ticket.deadline, ticket.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ArcamError::connection("connection closed")),
            Err(_) => {
                self.router.release(ticket.id);
                tracing::warn!(
                    "Command 0x{:02X} (zone {}) timed out after {:?}",
                    command.code(),
                    command.zone(),
                    timeout
                );
                Err(ArcamError::CommandTimeout)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(zone: u8, code: u8, payload: &[u8]) -> Response {
        Response {
            zone,
            code,
            answer: 0x00,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn test_second_request_is_busy() {
        let router = Router::new(8);
        let _first = router
            .register(&Command::new(1, 0x0D, [0xF0]), Duration::from_secs(5))
            .unwrap();
        let second = router.register(&Command::new(1, 0x0E, [0xF0]), Duration::from_secs(5));
        assert!(matches!(second, Err(ArcamError::Busy)));
    }

    #[test]
    fn test_release_frees_slot() {
        let router = Router::new(8);
        let first = router
            .register(&Command::new(1, 0x0D, [0xF0]), Duration::from_secs(5))
            .unwrap();
        router.release(first.id);
        assert!(router
            .register(&Command::new(1, 0x0E, [0xF0]), Duration::from_secs(5))
            .is_ok());
    }

    #[test]
    fn test_release_ignores_other_ids() {
        let router = Router::new(8);
        let first = router
            .register(&Command::new(1, 0x0D, [0xF0]), Duration::from_secs(5))
            .unwrap();
        router.release(first.id + 1);
        assert!(router.lock_pending().is_some());
    }

    #[test]
    fn test_abandoned_request_does_not_block() {
        let router = Router::new(8);
        let first = router
            .register(&Command::new(1, 0x0D, [0xF0]), Duration::from_secs(5))
            .unwrap();
        drop(first);
        assert!(router
            .register(&Command::new(1, 0x0E, [0xF0]), Duration::from_secs(5))
            .is_ok());
    }

    #[tokio::test]
    async fn test_matching_response_resolves_request() {
        let router = Router::new(8);
        let mut broadcasts = router.subscribe();
        let ticket = router
            .register(&Command::new(1, 0x0D, [0xF0]), Duration::from_secs(5))
            .unwrap();

        router.route(response(1, 0x0D, &[0x2D]));

        let result = ticket.rx.await.unwrap().unwrap();
        assert_eq!(result.payload, vec![0x2D]);
        assert!(broadcasts.try_recv().is_err());
        assert!(router.lock_pending().is_none());
    }

    #[tokio::test]
    async fn test_mismatched_response_is_broadcast() {
        let router = Router::new(8);
        let mut broadcasts = router.subscribe();
        let mut ticket = router
            .register(&Command::new(1, 0x0D, [0xF0]), Duration::from_secs(5))
            .unwrap();

        // Same code, other zone; then other code, same zone
        router.route(response(2, 0x0D, &[0x10]));
        router.route(response(1, 0x1D, &[0x03]));

        assert_eq!(broadcasts.recv().await.unwrap(), response(2, 0x0D, &[0x10]));
        assert_eq!(broadcasts.recv().await.unwrap(), response(1, 0x1D, &[0x03]));
        assert!(ticket.rx.try_recv().is_err());
        assert!(router.lock_pending().is_some());
    }

    #[tokio::test]
    async fn test_expired_request_does_not_claim_late_response() {
        let router = Router::new(8);
        let mut broadcasts = router.subscribe();
        let _ticket = router
            .register(&Command::new(1, 0x0D, [0xF0]), Duration::ZERO)
            .unwrap();

        router.route(response(1, 0x0D, &[0x2D]));
        assert_eq!(broadcasts.recv().await.unwrap(), response(1, 0x0D, &[0x2D]));
    }

    #[tokio::test]
    async fn test_connection_lost_fails_pending() {
        let router = Router::new(8);
        let ticket = router
            .register(&Command::new(1, 0x00, [0x01]), Duration::from_secs(5))
            .unwrap();

        router.connection_lost();

        let result = ticket.rx.await.unwrap();
        assert!(matches!(result, Err(ArcamError::Connection { .. })));
        assert!(router.lock_pending().is_none());
    }

    #[tokio::test]
    async fn test_close_broadcasts_ends_streams() {
        let router = Router::new(8);
        let mut early = router.subscribe();
        router.route(response(1, 0x00, &[0x01]));
        router.close_broadcasts();

        // Buffered broadcasts drain before the stream ends
        assert_eq!(early.recv().await.unwrap(), response(1, 0x00, &[0x01]));
        assert!(matches!(
            early.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));

        let mut late = router.subscribe();
        assert!(matches!(
            late.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest() {
        let router = Router::new(2);
        let mut slow = router.subscribe();
        for volume in 0..4u8 {
            router.route(response(1, 0x0D, &[volume]));
        }

        assert!(matches!(
            slow.recv().await,
            Err(broadcast::error::RecvError::Lagged(2))
        ));
        assert_eq!(slow.recv().await.unwrap().payload, vec![2]);
        assert_eq!(slow.recv().await.unwrap().payload, vec![3]);
    }

    #[tokio::test]
    async fn test_send_while_disconnected_fails_fast() {
        let dispatcher = Dispatcher::new(ConnectionConfig::new("127.0.0.1"));
        let result = dispatcher
            .send(&Command::new(1, 0x00, [0x01]), Duration::from_secs(5))
            .await;
        assert!(matches!(result, Err(ArcamError::Connection { .. })));
        assert!(dispatcher.router().lock_pending().is_none());
    }

    #[tokio::test]
    async fn test_send_rejects_unencodable_command() {
        let dispatcher = Dispatcher::new(ConnectionConfig::new("127.0.0.1"));
        let result = dispatcher
            .send(&Command::new(3, 0x00, [0x01]), Duration::from_secs(5))
            .await;
        assert!(matches!(result, Err(ArcamError::Encoding(_))));
    }
}
