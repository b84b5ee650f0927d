//! Decoding of Pub/Sub push requests into [`Message`]s.
//!
//! A push delivery is an HTTP POST whose JSON body wraps one broker message:
//!
//! ```json
//! {
//!   "message": {
//!     "data": "aGVsbG8=",
//!     "attributes": {"_watermill_message_uuid": "42", "foo": "bar"},
//!     "publishTime": "2021-02-26T19:13:55.749Z"
//!   },
//!   "subscription": "projects/p/subscriptions/s"
//! }
//! ```

use std::collections::HashMap;

use base64::Engine;
use bytes::Bytes;
use serde::Deserialize;
use warp::http::Request;

use crate::error::UnmarshalError;
use crate::message::{Message, Metadata};

/// Attribute carrying the sender-assigned message identifier.
pub const UUID_HEADER_KEY: &str = "_watermill_message_uuid";

/// Metadata key holding the broker publish time.
pub const PUBLISH_TIME_KEY: &str = "publishTime";

/// Incoming HTTP request as seen by the push handler.
pub type PushRequest = Request<Bytes>;

/// Turns a push request into a message.
///
/// Returning `Ok(None)` rejects the request just like an error does.
pub trait UnmarshalMessage: Send + Sync {
    fn unmarshal(&self, request: &PushRequest) -> Result<Option<Message>, UnmarshalError>;
}

impl<F> UnmarshalMessage for F
where
    F: Fn(&PushRequest) -> Result<Option<Message>, UnmarshalError> + Send + Sync,
{
    fn unmarshal(&self, request: &PushRequest) -> Result<Option<Message>, UnmarshalError> {
        self(request)
    }
}

#[derive(Debug, Default, Deserialize)]
struct PushEnvelope {
    #[serde(default)]
    message: Option<PubsubMessage>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PubsubMessage {
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    attributes: Option<HashMap<String, String>>,
    #[serde(default)]
    publish_time: Option<String>,
}

/// Default unmarshaler for Pub/Sub push envelopes.
///
/// The `_watermill_message_uuid` attribute becomes the message identifier
/// and is left out of the metadata; every other attribute is copied, and
/// `publishTime` is always set. The identifier is empty when the sender did
/// not provide one.
pub fn unmarshal_push_message(request: &PushRequest) -> Result<Option<Message>, UnmarshalError> {
    let envelope: PushEnvelope = serde_json::from_slice(request.body())?;
    let pubsub_message = envelope.message.unwrap_or_default();

    let mut uuid = String::new();
    let mut metadata = Metadata::new();
    for (key, value) in pubsub_message.attributes.unwrap_or_default() {
        if key == UUID_HEADER_KEY {
            uuid = value;
            continue;
        }
        metadata.set(key, value);
    }
    metadata.set(PUBLISH_TIME_KEY, pubsub_message.publish_time.unwrap_or_default());

    let data = pubsub_message.data.unwrap_or_default();
    let payload = base64::engine::general_purpose::STANDARD.decode(data)?;

    let mut msg = Message::new(uuid, payload);
    msg.metadata = metadata;

    Ok(Some(msg))
}
