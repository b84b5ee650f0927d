//! Subscriber facade: mounts push handlers and exposes their messages.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SubscriberError};
use crate::handler::{Offer, PushHandler, PROVIDER};
use crate::message::Message;
use crate::registry::OutputRegistry;
use crate::unmarshal::{unmarshal_push_message, UnmarshalMessage};

/// Callback mounting `handler` at `route` on the caller's HTTP router.
pub type RegisterHttpHandler = Arc<dyn Fn(&str, PushHandler) + Send + Sync>;

/// Configuration for a [`Subscriber`].
#[derive(Clone, Default)]
pub struct SubscriberConfig {
    /// Mounts the push handler of each subscription. Required.
    pub register_http_handler: Option<RegisterHttpHandler>,

    /// Turns requests into messages.
    /// Default: [`unmarshal_push_message`]
    pub unmarshal_message: Option<Arc<dyn UnmarshalMessage>>,
}

impl SubscriberConfig {
    /// Create a configuration that mounts handlers through `register`.
    pub fn new<F>(register: F) -> Self
    where
        F: Fn(&str, PushHandler) + Send + Sync + 'static,
    {
        Self {
            register_http_handler: Some(Arc::new(register)),
            unmarshal_message: None,
        }
    }

    /// Replace the default push envelope decoding.
    pub fn with_unmarshaler(mut self, unmarshaler: impl UnmarshalMessage + 'static) -> Self {
        self.unmarshal_message = Some(Arc::new(unmarshaler));
        self
    }
}

impl std::fmt::Debug for SubscriberConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberConfig")
            .field("register_http_handler", &self.register_http_handler.is_some())
            .field("unmarshal_message", &self.unmarshal_message.is_some())
            .finish()
    }
}

/// Receives Pub/Sub push deliveries as messages.
///
/// Every [`subscribe`](Subscriber::subscribe) call mounts an HTTP handler at
/// a route and returns the [`Messages`] fed by it. The HTTP request of each
/// delivery stays open until the consumer acks (200) or nacks (500) the
/// message.
///
/// # Example
///
/// ```no_run
/// use push_subscriber::{PushServer, ServerConfig, Subscriber, SubscriberConfig};
/// use tokio_util::sync::CancellationToken;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let server = PushServer::bind(ServerConfig::default()).await?;
///     let subscriber = Subscriber::new(SubscriberConfig {
///         register_http_handler: Some(server.register_http_handler()),
///         ..Default::default()
///     })?;
///
///     let mut messages = subscriber.subscribe(CancellationToken::new(), "orders")?;
///     while let Some(msg) = messages.recv().await {
///         println!("{}: {:?}", msg.uuid, msg.payload);
///         msg.ack();
///     }
///     Ok(())
/// }
/// ```
pub struct Subscriber {
    register_http_handler: RegisterHttpHandler,
    unmarshaler: Arc<dyn UnmarshalMessage>,
    outputs: OutputRegistry,
    closed: AtomicBool,
}

impl Subscriber {
    /// Create a subscriber, failing if no registration callback is configured.
    pub fn new(config: SubscriberConfig) -> Result<Self> {
        let register_http_handler = config
            .register_http_handler
            .ok_or(SubscriberError::MissingRegisterHttpHandler)?;
        let unmarshaler = config
            .unmarshal_message
            .unwrap_or_else(|| Arc::new(unmarshal_push_message) as Arc<dyn UnmarshalMessage>);

        Ok(Self {
            register_http_handler,
            unmarshaler,
            outputs: OutputRegistry::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Mount a push handler at `route` and return its messages.
    ///
    /// A leading `/` is added to `route` when missing. Every message context
    /// is a child of `ctx`. Each call gets its own channel, so messages of
    /// different routes never mix.
    pub fn subscribe(&self, ctx: CancellationToken, route: &str) -> Result<Messages> {
        if self.is_closed() {
            return Err(SubscriberError::Closed);
        }

        let route = if route.starts_with('/') {
            route.to_string()
        } else {
            format!("/{route}")
        };

        // Carries offers only; a handler is done sending once its message is taken.
        let (tx, rx) = mpsc::channel(1);
        let closed = self.outputs.register(&route);

        let handler = PushHandler::new(
            route.clone(),
            self.unmarshaler.clone(),
            tx,
            ctx,
            closed.clone(),
        );
        (self.register_http_handler)(&route, handler);
        tracing::debug!(route = %route, provider = PROVIDER, "Subscribed");

        Ok(Messages {
            route,
            receiver: rx,
            closed,
        })
    }

    /// Close every output channel. Subsequent calls do nothing.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let count = self.outputs.drain();
        tracing::debug!(provider = PROVIDER, channels = count, "Subscriber closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.close();
    }
}

/// Messages delivered to one subscribed route.
///
/// Ends (`recv` returns `None`) once the subscriber is closed.
pub struct Messages {
    route: String,
    receiver: mpsc::Receiver<Offer>,
    closed: CancellationToken,
}

impl Messages {
    /// Wait for the next message.
    ///
    /// Taking a message here is what releases the waiting push handler from
    /// its send step; offers withdrawn by their handler are skipped.
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            let offer = tokio::select! {
                biased;
                _ = self.closed.cancelled() => {
                    // Refuse pending sends and drop queued offers so the
                    // waiting requests fail fast.
                    self.receiver.close();
                    while self.receiver.try_recv().is_ok() {}
                    return None;
                }
                offer = self.receiver.recv() => offer?,
            };
            if let Some(msg) = offer.take() {
                return Some(msg);
            }
        }
    }

    /// The normalized route feeding these messages.
    pub fn route(&self) -> &str {
        &self.route
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Convert into a [`Stream`] of messages.
    pub fn into_stream(self) -> impl Stream<Item = Message> + Send {
        futures::stream::unfold(self, |mut messages| async move {
            messages.recv().await.map(|msg| (msg, messages))
        })
    }
}

impl std::fmt::Debug for Messages {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Messages")
            .field("route", &self.route)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::StreamExt;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::timeout;
    use warp::http::{Request, StatusCode};

    type Routes = Arc<Mutex<HashMap<String, PushHandler>>>;

    fn recording_subscriber() -> (Subscriber, Routes) {
        let routes: Routes = Arc::new(Mutex::new(HashMap::new()));
        let recorded = routes.clone();
        let subscriber = Subscriber::new(SubscriberConfig::new(move |route, handler| {
            recorded.lock().unwrap().insert(route.to_string(), handler);
        }))
        .unwrap();
        (subscriber, routes)
    }

    fn handler_for(routes: &Routes, route: &str) -> PushHandler {
        routes.lock().unwrap().get(route).cloned().expect("route not registered")
    }

    fn push_body(data: &str) -> Bytes {
        Bytes::from(format!(
            r#"{{"message":{{"data":"{data}","attributes":{{}}}},"subscription":"s"}}"#
        ))
    }

    fn deliver(handler: PushHandler, body: Bytes) -> tokio::task::JoinHandle<StatusCode> {
        tokio::spawn(async move {
            let request = Request::post(handler.route().to_string()).body(body).unwrap();
            handler.handle(request, CancellationToken::new()).await
        })
    }

    #[test]
    fn test_new_requires_register_callback() {
        let result = Subscriber::new(SubscriberConfig::default());
        assert!(matches!(
            result,
            Err(SubscriberError::MissingRegisterHttpHandler)
        ));
    }

    #[test]
    fn test_subscribe_normalizes_route() {
        let (subscriber, routes) = recording_subscriber();

        let messages = subscriber.subscribe(CancellationToken::new(), "orders").unwrap();
        assert_eq!(messages.route(), "/orders");

        let messages = subscriber.subscribe(CancellationToken::new(), "/payments").unwrap();
        assert_eq!(messages.route(), "/payments");

        let routes = routes.lock().unwrap();
        assert!(routes.contains_key("/orders"));
        assert!(routes.contains_key("/payments"));
        assert_eq!(routes["/orders"].route(), "/orders");
    }

    #[tokio::test]
    async fn test_ack_and_nack_round_trip() {
        let (subscriber, routes) = recording_subscriber();
        let mut messages = subscriber.subscribe(CancellationToken::new(), "/push").unwrap();
        let handler = handler_for(&routes, "/push");

        let first = deliver(handler.clone(), push_body("aGVsbG8="));
        let msg = messages.recv().await.unwrap();
        assert_eq!(msg.payload, Bytes::from_static(b"hello"));
        msg.ack();
        assert_eq!(first.await.unwrap(), StatusCode::OK);

        let second = deliver(handler, push_body("aGVsbG8="));
        messages.recv().await.unwrap().nack();
        assert_eq!(second.await.unwrap(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_routes_have_independent_channels() {
        let (subscriber, routes) = recording_subscriber();
        let mut orders = subscriber.subscribe(CancellationToken::new(), "/orders").unwrap();
        let mut payments = subscriber.subscribe(CancellationToken::new(), "/payments").unwrap();

        let request = deliver(handler_for(&routes, "/payments"), push_body("cGF5"));

        let msg = payments.recv().await.unwrap();
        assert_eq!(msg.payload, Bytes::from_static(b"pay"));
        assert!(timeout(Duration::from_millis(50), orders.recv()).await.is_err());

        msg.ack();
        assert_eq!(request.await.unwrap(), StatusCode::OK);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_subscribes_get_independent_channels() {
        use base64::Engine;

        let (subscriber, routes) = recording_subscriber();
        let subscriber = Arc::new(subscriber);

        let subscribing: Vec<_> = (0..8)
            .map(|i| {
                let subscriber = subscriber.clone();
                tokio::spawn(async move {
                    subscriber
                        .subscribe(CancellationToken::new(), &format!("route-{i}"))
                        .unwrap()
                })
            })
            .collect();
        let mut channels = Vec::new();
        for task in subscribing {
            channels.push(task.await.unwrap());
        }
        assert_eq!(routes.lock().unwrap().len(), 8);

        // Deliver to every route at once, then check each channel sees only its own.
        let requests: Vec<_> = channels
            .iter()
            .map(|messages| {
                let data = base64::engine::general_purpose::STANDARD.encode(messages.route());
                deliver(handler_for(&routes, messages.route()), push_body(&data))
            })
            .collect();

        for messages in channels.iter_mut() {
            let msg = timeout(Duration::from_secs(5), messages.recv())
                .await
                .expect("timed out waiting for delivery")
                .unwrap();
            assert_eq!(&msg.payload[..], messages.route().as_bytes());
            msg.ack();
        }
        for request in requests {
            assert_eq!(request.await.unwrap(), StatusCode::OK);
        }
        for messages in channels.iter_mut() {
            assert!(timeout(Duration::from_millis(50), messages.recv()).await.is_err());
        }

        subscriber.close();
        for mut messages in channels {
            assert!(messages.recv().await.is_none());
        }
    }

    #[tokio::test]
    async fn test_aborted_delivery_never_reaches_consumer() {
        let (subscriber, routes) = recording_subscriber();
        let mut messages = subscriber.subscribe(CancellationToken::new(), "/push").unwrap();
        let handler = handler_for(&routes, "/push");

        let done = CancellationToken::new();
        let aborted = tokio::spawn({
            let done = done.clone();
            async move {
                let request = Request::post("/push").body(push_body("c3RhbGU=")).unwrap();
                handler.handle(request, done).await
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        done.cancel();
        assert_eq!(aborted.await.unwrap(), StatusCode::INTERNAL_SERVER_ERROR);

        let fresh = deliver(handler_for(&routes, "/push"), push_body("ZnJlc2g="));
        let msg = messages.recv().await.unwrap();
        assert_eq!(msg.payload, Bytes::from_static(b"fresh"));
        msg.ack();
        assert_eq!(fresh.await.unwrap(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_close_ends_every_stream() {
        let (subscriber, _routes) = recording_subscriber();
        let mut orders = subscriber.subscribe(CancellationToken::new(), "/orders").unwrap();
        let payments = subscriber.subscribe(CancellationToken::new(), "/payments").unwrap();

        subscriber.close();
        subscriber.close();

        assert!(subscriber.is_closed());
        assert!(orders.is_closed());
        assert!(orders.recv().await.is_none());
        assert_eq!(payments.into_stream().count().await, 0);
    }

    #[tokio::test]
    async fn test_close_fails_pending_delivery() {
        let (subscriber, routes) = recording_subscriber();
        let mut messages = subscriber.subscribe(CancellationToken::new(), "/push").unwrap();
        let handler = handler_for(&routes, "/push");

        // The first delivery fills the channel, the second waits to be sent.
        let first = deliver(handler.clone(), push_body(""));
        let second = deliver(handler, push_body(""));
        tokio::time::sleep(Duration::from_millis(50)).await;

        subscriber.close();
        assert!(messages.recv().await.is_none());
        assert_eq!(first.await.unwrap(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(second.await.unwrap(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_subscribe_after_close() {
        let (subscriber, routes) = recording_subscriber();
        subscriber.close();

        let result = subscriber.subscribe(CancellationToken::new(), "/late");
        assert!(matches!(result, Err(SubscriberError::Closed)));
        assert!(routes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_drop_closes_streams() {
        let (subscriber, _routes) = recording_subscriber();
        let mut messages = subscriber.subscribe(CancellationToken::new(), "/push").unwrap();
        drop(subscriber);
        assert!(messages.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_custom_unmarshaler() {
        let routes: Routes = Arc::new(Mutex::new(HashMap::new()));
        let recorded = routes.clone();
        let config = SubscriberConfig::new(move |route, handler| {
            recorded.lock().unwrap().insert(route.to_string(), handler);
        })
        .with_unmarshaler(
            |request: &crate::PushRequest| -> std::result::Result<Option<Message>, crate::UnmarshalError> {
                Ok(Some(Message::new("raw", request.body().clone())))
            },
        );
        let subscriber = Subscriber::new(config).unwrap();
        let mut messages = subscriber.subscribe(CancellationToken::new(), "/raw").unwrap();

        let request = deliver(handler_for(&routes, "/raw"), Bytes::from_static(b"plain text"));
        let msg = messages.recv().await.unwrap();
        assert_eq!(msg.uuid, "raw");
        assert_eq!(msg.payload, Bytes::from_static(b"plain text"));
        msg.ack();
        assert_eq!(request.await.unwrap(), StatusCode::OK);
    }
}
