//! Standalone push endpoint that logs and acks every message.
//!
//! Configuration comes from the environment:
//!
//! - `PUSH_ROUTES`: comma separated routes to subscribe (default `/push`)
//! - `PUSH_BIND_ADDRESS`, `PUSH_PORT_RANGE`: see [`ServerConfig`]
//! - `PUSH_LOG_MODE`, `PUSH_LOG_LEVEL`: see [`push_subscriber::logging`]

use push_subscriber::{logging, PushServer, ServerConfig, Subscriber, SubscriberConfig};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_logging_from_env()?;

    let server = PushServer::bind(ServerConfig::from_env()?).await?;
    let subscriber = Subscriber::new(SubscriberConfig {
        register_http_handler: Some(server.register_http_handler()),
        ..Default::default()
    })?;

    let routes = std::env::var("PUSH_ROUTES").unwrap_or_else(|_| "/push".to_string());
    let ctx = CancellationToken::new();
    let mut consumers = Vec::new();

    for route in routes.split(',').map(str::trim).filter(|r| !r.is_empty()) {
        let mut messages = subscriber.subscribe(ctx.clone(), route)?;
        tracing::info!("Accepting push deliveries at {}{}", server.base_url(), messages.route());

        consumers.push(tokio::spawn(async move {
            while let Some(msg) = messages.recv().await {
                tracing::info!(
                    route = messages.route(),
                    message_uuid = %msg.uuid,
                    payload_len = msg.payload.len(),
                    publish_time = msg.metadata.get(push_subscriber::PUBLISH_TIME_KEY).unwrap_or_default(),
                    "Received message"
                );
                msg.ack();
            }
        }));
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    ctx.cancel();
    subscriber.close();
    for consumer in consumers {
        let _ = consumer.await;
    }
    server.shutdown().await?;

    Ok(())
}
