//! Per-request bridge between a push delivery and an output channel.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use warp::http::StatusCode;

use crate::message::{Acknowledgment, Message};
use crate::unmarshal::{PushRequest, UnmarshalMessage};

pub(crate) const PROVIDER: &str = "googlecloud_http";

type OfferSlot = Arc<Mutex<Option<(Message, oneshot::Sender<()>)>>>;

/// A message waiting on a route's channel for its consumer.
///
/// The hand-off is complete only once the consumer takes the message out.
/// Until then the handler can reclaim it and the consumer finds the offer
/// empty.
#[derive(Clone)]
pub(crate) struct Offer {
    slot: OfferSlot,
}

impl Offer {
    fn new(msg: Message) -> (Self, oneshot::Receiver<()>) {
        let (taken_tx, taken_rx) = oneshot::channel();
        let offer = Self {
            slot: Arc::new(Mutex::new(Some((msg, taken_tx)))),
        };
        (offer, taken_rx)
    }

    /// Take the offered message, `None` if the handler got it back first.
    pub(crate) fn take(&self) -> Option<Message> {
        let (msg, taken) = self.lock().take()?;
        let _ = taken.send(());
        Some(msg)
    }

    fn reclaim(&self) -> Option<Message> {
        self.lock().take().map(|(msg, _)| msg)
    }

    fn lock(&self) -> MutexGuard<'_, Option<(Message, oneshot::Sender<()>)>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Armed while a request waits on its consumer. If the HTTP layer drops the
/// handler future first, the message is withdrawn and the missing
/// acknowledgment is logged.
struct PendingAnswer<'a> {
    route: &'a str,
    message_uuid: &'a str,
    offer: &'a Offer,
    answered: bool,
}

impl Drop for PendingAnswer<'_> {
    fn drop(&mut self) {
        if self.answered {
            return;
        }
        self.offer.reclaim();
        tracing::info!(
            route = self.route,
            provider = PROVIDER,
            message_uuid = %self.message_uuid,
            "Request stopped without ACK received"
        );
    }
}

/// HTTP handler for one subscribed route.
///
/// Each call to [`handle`](PushHandler::handle) decodes the request, hands
/// the message to the consumer of the route's channel and waits for the
/// consumer's decision:
///
/// | outcome                                   | status |
/// |-------------------------------------------|--------|
/// | request body cannot be decoded            | 400    |
/// | message acked                             | 200    |
/// | message nacked                            | 500    |
/// | message dropped without a decision        | 500    |
/// | subscriber closed before delivery         | 500    |
/// | request finished before a decision        | 500    |
///
/// There is no timeout: an unsettled message keeps the request open until
/// the HTTP layer gives up on it.
#[derive(Clone)]
pub struct PushHandler {
    inner: Arc<HandlerInner>,
}

struct HandlerInner {
    route: String,
    unmarshaler: Arc<dyn UnmarshalMessage>,
    output: mpsc::Sender<Offer>,
    /// Parent of every message context handed out on this route
    base_context: CancellationToken,
    /// Cancelled when the subscriber closes the output channel
    closed: CancellationToken,
}

impl PushHandler {
    pub(crate) fn new(
        route: String,
        unmarshaler: Arc<dyn UnmarshalMessage>,
        output: mpsc::Sender<Offer>,
        base_context: CancellationToken,
        closed: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(HandlerInner {
                route,
                unmarshaler,
                output,
                base_context,
                closed,
            }),
        }
    }

    /// The route this handler was registered for.
    pub fn route(&self) -> &str {
        &self.inner.route
    }

    /// Handle one push delivery and return the status to answer it with.
    ///
    /// `request_done` must be cancelled when the inbound request is gone,
    /// either because the client disconnected or the server is shutting down.
    /// Dropping the returned future has the same effect.
    pub async fn handle(&self, request: PushRequest, request_done: CancellationToken) -> StatusCode {
        let route = self.inner.route.as_str();

        let mut msg = match self.inner.unmarshaler.unmarshal(&request) {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                tracing::info!(route, provider = PROVIDER, "No message returned by unmarshaler");
                return StatusCode::BAD_REQUEST;
            }
            Err(err) => {
                tracing::info!(route, provider = PROVIDER, error = %err, "Cannot unmarshal message");
                return StatusCode::BAD_REQUEST;
            }
        };

        if msg.uuid.is_empty() {
            msg.uuid = Uuid::new_v4().to_string();
        }
        let message_uuid = msg.uuid.clone();

        let context = self.inner.base_context.child_token();
        msg.set_context(context.clone());
        let _context_guard = context.drop_guard();

        let settled = msg.watch();
        let (offer, taken) = Offer::new(msg);

        let mut pending = PendingAnswer {
            route,
            message_uuid: &message_uuid,
            offer: &offer,
            answered: false,
        };
        let status = self
            .deliver(&offer, taken, settled, &request_done, &message_uuid)
            .await;
        pending.answered = true;
        status
    }

    async fn deliver(
        &self,
        offer: &Offer,
        taken: oneshot::Receiver<()>,
        settled: oneshot::Receiver<Acknowledgment>,
        request_done: &CancellationToken,
        message_uuid: &str,
    ) -> StatusCode {
        let inner = &self.inner;
        let route = inner.route.as_str();

        tracing::trace!(route, provider = PROVIDER, message_uuid, "Sending msg");
        let handed_off = tokio::select! {
            biased;
            _ = inner.closed.cancelled() => Err("Subscriber closed before message was delivered"),
            _ = request_done.cancelled() => Err("Request stopped before message was delivered"),
            _ = inner.output.closed() => Err("Output channel has no consumer"),
            handed_off = async {
                inner
                    .output
                    .send(offer.clone())
                    .await
                    .map_err(|_| "Output channel has no consumer")?;
                let _ = taken.await;
                Ok::<(), &'static str>(())
            } => handed_off,
        };

        if let Err(reason) = handed_off {
            // A consumer that took the message first owns it; wait for its decision.
            if offer.reclaim().is_some() {
                tracing::info!(route, provider = PROVIDER, message_uuid, "{reason}");
                return StatusCode::INTERNAL_SERVER_ERROR;
            }
        }

        tracing::trace!(route, provider = PROVIDER, message_uuid, "Waiting for ACK");
        tokio::select! {
            biased;
            decision = settled => match decision {
                Ok(Acknowledgment::Acked) => {
                    tracing::trace!(route, provider = PROVIDER, message_uuid, "Message acknowledged");
                    StatusCode::OK
                }
                Ok(Acknowledgment::Nacked) => {
                    tracing::info!(route, provider = PROVIDER, message_uuid, "Message nacked");
                    StatusCode::INTERNAL_SERVER_ERROR
                }
                Err(_) => {
                    tracing::info!(route, provider = PROVIDER, message_uuid, "Message dropped without ACK");
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            _ = request_done.cancelled() => {
                tracing::info!(route, provider = PROVIDER, message_uuid, "Request stopped without ACK received");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl std::fmt::Debug for PushHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushHandler")
            .field("route", &self.inner.route)
            .finish()
    }
}
