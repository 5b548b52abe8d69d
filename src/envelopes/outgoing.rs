use crate::amqp::types::{AMQPValue, FieldTable};
use crate::amqp::BasicProperties;
use crate::codec::{CodecError, CodecRegistry, DataSchema, MimeType};
use crate::transport::Message;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// What a processor put in an [`Outgoing`].
#[derive(Clone, Debug, Default)]
pub enum Media {
    /// Nothing was set: no message will be published.
    #[default]
    NotLoaded,
    /// An explicitly empty reply: a message with an empty body is published.
    Empty,
    /// A value, encoded according to the mimetype and schema of the envelope.
    Value(Value),
    /// A pre-built message, published as is.
    Message(Message),
}

impl From<Value> for Media {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<Message> for Media {
    fn from(message: Message) -> Self {
        Self::Message(message)
    }
}

/// The reply of a processor, published to its output queue if the processor sets it.
///
/// `Outgoing` is a cheap handle: clones share the same reply.
#[derive(Clone)]
pub struct Outgoing {
    state: Arc<Mutex<OutgoingState>>,
    codecs: CodecRegistry,
}

struct OutgoingState {
    media: Media,
    headers: FieldTable,
    mimetype: Option<MimeType>,
    schema: Option<Arc<dyn DataSchema>>,
}

impl Outgoing {
    pub fn new(codecs: CodecRegistry, schema: Option<Arc<dyn DataSchema>>) -> Self {
        Self {
            state: Arc::new(Mutex::new(OutgoingState {
                media: Media::NotLoaded,
                headers: FieldTable::default(),
                mimetype: None,
                schema,
            })),
            codecs,
        }
    }

    fn lock(&self) -> MutexGuard<'_, OutgoingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_media(&self, value: impl Into<Value>) {
        self.lock().media = Media::Value(value.into());
    }

    /// Replace the reply wholesale.
    pub fn set(&self, media: Media) {
        self.lock().media = media;
    }

    /// Serialize `value` and use it as the reply.
    pub fn set_media_from<T: Serialize>(&self, value: &T) -> Result<(), CodecError> {
        let value = serde_json::to_value(value).map_err(|e| CodecError::Schema(e.into()))?;
        self.set_media(value);
        Ok(())
    }

    /// Reply with an empty body.
    pub fn set_empty(&self) {
        self.lock().media = Media::Empty;
    }

    /// Reply with a pre-built message. Mimetype, schema and headers are ignored.
    pub fn set_message(&self, message: Message) {
        self.lock().media = Media::Message(message);
    }

    pub fn set_mimetype(&self, mimetype: MimeType) {
        self.lock().mimetype = Some(mimetype);
    }

    pub fn set_header(&self, key: &str, value: AMQPValue) {
        self.lock().headers.insert(key.into(), value);
    }

    /// A copy of the current reply.
    pub fn media(&self) -> Media {
        self.lock().media.clone()
    }

    /// `true` if the processor set a reply, even an empty one.
    pub fn is_set(&self) -> bool {
        !matches!(self.lock().media, Media::NotLoaded)
    }

    /// The content type used when encoding the reply. Defaults to JSON.
    pub fn mimetype(&self) -> MimeType {
        self.lock().mimetype.clone().unwrap_or(MimeType::Json)
    }

    /// Build the message to publish: dump the reply through the schema, encode it and
    /// attach content type and headers. Messages are marked as persistent.
    pub fn generate_message(&self) -> Result<Message, CodecError> {
        let state = self.lock();
        let value = match &state.media {
            Media::Message(message) => return Ok(message.clone()),
            Media::NotLoaded | Media::Empty => None,
            Media::Value(value) => Some(value),
        };
        let mimetype = state.mimetype.clone().unwrap_or(MimeType::Json);
        let payload = match (value, &state.schema) {
            (None, _) => Vec::new(),
            (Some(value), Some(schema)) => {
                let dumped = schema.dump(value).map_err(CodecError::Schema)?;
                self.codecs.encode(&dumped, &mimetype)?
            }
            (Some(value), None) => self.codecs.encode(value, &mimetype)?,
        };
        let mut properties = BasicProperties::default()
            .with_content_type(mimetype.as_str().into())
            .with_delivery_mode(2);
        if !state.headers.inner().is_empty() {
            properties = properties.with_headers(state.headers.clone());
        }
        Ok(Message::new(payload, properties))
    }
}

impl fmt::Debug for Outgoing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("Outgoing")
            .field("media", &state.media)
            .field("mimetype", &state.mimetype)
            .field("headers", &state.headers)
            .finish()
    }
}
