//! Pub/Sub push subscriptions as an acknowledged message stream.
//!
//! A push subscription delivers every message as an HTTP `POST`. This crate
//! turns those requests into [`Message`]s on an in-process channel and turns
//! the consumer's decision back into the HTTP response the broker expects:
//!
//! - [`Message::ack`] answers the delivery with `200 OK`
//! - [`Message::nack`] answers it with `500`, so the broker redelivers
//! - an undecodable body is answered with `400` and never reaches the consumer
//! - a request that ends before a decision is answered with `500`
//!
//! # Overview
//!
//! - [`Subscriber`]: mounts one [`PushHandler`] per subscribed route through
//!   an injected registration callback and hands out the [`Messages`] of
//!   each route.
//! - [`PushHandler`]: decodes a request, forwards the message and waits for
//!   its acknowledgment.
//! - [`UnmarshalMessage`]: pluggable request decoding, defaulting to
//!   [`unmarshal_push_message`] for the Pub/Sub push envelope.
//! - [`PushServer`]: a warp server that can host the handlers.
//!
//! # Example
//!
//! ```no_run
//! use push_subscriber::{PushServer, ServerConfig, Subscriber, SubscriberConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = PushServer::bind(ServerConfig::default()).await?;
//!     let subscriber = Subscriber::new(SubscriberConfig {
//!         register_http_handler: Some(server.register_http_handler()),
//!         ..Default::default()
//!     })?;
//!
//!     let mut messages = subscriber.subscribe(CancellationToken::new(), "/orders")?;
//!     tokio::spawn(async move {
//!         while let Some(msg) = messages.recv().await {
//!             if msg.payload.is_empty() {
//!                 msg.nack();
//!             } else {
//!                 msg.ack();
//!             }
//!         }
//!     });
//!
//!     tokio::signal::ctrl_c().await?;
//!     subscriber.close();
//!     server.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Hosting on another router
//!
//! The registration callback receives the normalized route and a cloneable
//! [`PushHandler`]; any HTTP stack can call [`PushHandler::handle`] with the
//! request and a token cancelled when the request goes away.

pub mod config;
pub mod error;
mod handler;
pub mod logging;
mod message;
mod registry;
mod server;
mod subscriber;
mod unmarshal;

pub use config::ServerConfig;
pub use error::{ConfigError, Result, ServerError, SubscriberError, UnmarshalError};
pub use handler::PushHandler;
pub use message::{Acknowledgment, Message, Metadata};
pub use server::PushServer;
pub use subscriber::{Messages, RegisterHttpHandler, Subscriber, SubscriberConfig};
pub use unmarshal::{
    unmarshal_push_message, PushRequest, UnmarshalMessage, PUBLISH_TIME_KEY, UUID_HEADER_KEY,
};
