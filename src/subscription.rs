use crate::protocol::Response;
use futures_util::stream::{self, BoxStream, StreamExt};
use tokio::sync::broadcast;

/// Independent stream of unsolicited responses from the receiver
///
/// Each subscription buffers broadcasts on its own; when it falls too far
/// behind the oldest entries are dropped. Dropping the subscription cancels
/// it without affecting other subscribers or the session.
pub struct Subscription {
    rx: broadcast::Receiver<Response>,
}

impl Subscription {
    pub(crate) fn new(rx: broadcast::Receiver<Response>) -> Self {
        Self { rx }
    }

    /// Receive the next broadcast
    ///
    /// Returns `None` once the session has been closed and every buffered
    /// broadcast has been delivered.
    pub async fn recv(&mut self) -> Option<Response> {
        loop {
            match self.rx.recv().await {
                Ok(response) => return Some(response),
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Subscriber lagged, dropped {} broadcast(s)", n);
                }
            }
        }
    }

    /// Receive a buffered broadcast without waiting
    pub fn try_recv(&mut self) -> Option<Response> {
        loop {
            match self.rx.try_recv() {
                Ok(response) => return Some(response),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    tracing::warn!("Subscriber lagged, dropped {} broadcast(s)", n);
                }
                Err(_) => return None,
            }
        }
    }

    /// Convert into a [`futures_util::Stream`]
    pub fn into_stream(self) -> BoxStream<'static, Response> {
        stream::unfold(self, |mut subscription| async move {
            subscription
                .recv()
                .await
                .map(|response| (response, subscription))
        })
        .boxed()
    }
}
