//! HTTP server hosting push handlers.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use warp::http::{HeaderMap, Method, Request, StatusCode};
use warp::path::FullPath;
use warp::Filter;

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::handler::PushHandler;
use crate::subscriber::RegisterHttpHandler;

type RouteTable = Arc<DashMap<String, PushHandler>>;

/// HTTP server that dispatches push deliveries to registered handlers.
///
/// Handlers are mounted through the callback returned by
/// [`register_http_handler`](PushServer::register_http_handler), which is
/// what a [`Subscriber`](crate::Subscriber) expects in its configuration.
/// Only `POST` requests are accepted; unknown paths get a 404.
///
/// # Example
///
/// ```no_run
/// use push_subscriber::{PushServer, ServerConfig};
///
/// #[tokio::main]
/// async fn main() {
///     let server = PushServer::bind(ServerConfig::default())
///         .await
///         .expect("Failed to bind push server");
///
///     println!("Push endpoint base: {}", server.base_url());
///
///     server.shutdown().await.unwrap();
/// }
/// ```
pub struct PushServer {
    /// The port the server is bound to
    port: u16,
    /// The base URL push endpoints live under
    base_url: String,
    /// Handlers by normalized route
    routes: RouteTable,
    /// Stops the server and fails in-flight deliveries
    shutdown: CancellationToken,
    /// Server task handle
    server_handle: Option<tokio::task::JoinHandle<()>>,
}

impl PushServer {
    /// Bind the first free port of the configured range and start serving.
    ///
    /// A `(0, 0)` range lets the OS pick the port.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let routes: RouteTable = Arc::new(DashMap::new());
        let shutdown = CancellationToken::new();
        let filter = Self::push_filter(routes.clone(), shutdown.clone());

        let (start, end) = config.port_range;
        for port in start..=end {
            let signal = shutdown.clone();
            let bound = warp::serve(filter.clone()).try_bind_with_graceful_shutdown(
                SocketAddr::new(config.bind_address, port),
                async move { signal.cancelled().await },
            );

            let (addr, server) = match bound {
                Ok(bound) => bound,
                Err(err) => {
                    tracing::debug!(port, error = %err, "Port unavailable");
                    continue;
                }
            };

            tracing::info!(%addr, "Push server listening");
            let server_handle = tokio::spawn(server);

            return Ok(Self {
                port: addr.port(),
                base_url: format!("http://{addr}"),
                routes,
                shutdown,
                server_handle: Some(server_handle),
            });
        }

        Err(ServerError::NoAvailablePort { start, end })
    }

    /// The base URL push routes are served under, e.g. `http://127.0.0.1:8080`.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Get the port the server is bound to.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Callback that mounts a handler on this server.
    ///
    /// Registering a route twice replaces the earlier handler.
    pub fn register_http_handler(&self) -> RegisterHttpHandler {
        let routes = self.routes.clone();
        Arc::new(move |route: &str, handler: PushHandler| {
            if routes.insert(route.to_string(), handler).is_some() {
                tracing::warn!(route, "Replaced existing push handler");
            } else {
                tracing::debug!(route, "Mounted push handler");
            }
        })
    }

    /// Unmount the handler at `route`. Returns `false` if none was mounted.
    pub fn unregister(&self, route: &str) -> bool {
        self.routes.remove(route).is_some()
    }

    /// Number of mounted routes.
    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    /// Shut the server down.
    ///
    /// Deliveries still waiting for a decision are answered with a 500
    /// before the server stops.
    pub async fn shutdown(mut self) -> Result<(), ServerError> {
        self.shutdown.cancel();

        if let Some(handle) = self.server_handle.take() {
            handle.await?;
        }

        tracing::debug!(port = self.port, "Push server stopped");
        Ok(())
    }

    fn push_filter(
        routes: RouteTable,
        shutdown: CancellationToken,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = Infallible> + Clone + Send + Sync + 'static {
        warp::post()
            .and(warp::path::full())
            .and(warp::header::headers_cloned())
            .and(warp::body::bytes())
            .and_then(move |path: FullPath, headers: HeaderMap, body: Bytes| {
                let routes = routes.clone();
                let request_done = shutdown.child_token();
                async move {
                    let handler = routes
                        .get(path.as_str())
                        .map(|entry| entry.value().clone())
                        .ok_or_else(warp::reject::not_found)?;

                    let mut request = Request::new(body);
                    *request.method_mut() = Method::POST;
                    *request.uri_mut() = path
                        .as_str()
                        .parse()
                        .map_err(|_| warp::reject::custom(InvalidPushRequest))?;
                    *request.headers_mut() = headers;

                    let status = handler.handle(request, request_done).await;
                    tracing::debug!(route = handler.route(), status = status.as_u16(), "Push request handled");

                    Ok::<_, warp::Rejection>(warp::reply::with_status(warp::reply(), status))
                }
            })
            .recover(handle_rejection)
    }
}

impl Drop for PushServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Custom rejection for requests that cannot be turned into a push request.
#[derive(Debug)]
struct InvalidPushRequest;

impl warp::reject::Reject for InvalidPushRequest {}

/// Handle rejections and convert them to HTTP responses.
async fn handle_rejection(err: warp::Rejection) -> Result<impl warp::Reply, Infallible> {
    let code;
    let message;

    if err.is_not_found() {
        code = StatusCode::NOT_FOUND;
        message = "No push handler for route";
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        code = StatusCode::METHOD_NOT_ALLOWED;
        message = "Push deliveries must use POST";
    } else if err.find::<InvalidPushRequest>().is_some() {
        code = StatusCode::BAD_REQUEST;
        message = "Invalid push request";
    } else {
        code = StatusCode::INTERNAL_SERVER_ERROR;
        message = "Internal server error";
    }

    Ok(warp::reply::with_status(message, code))
}
