use crate::amqp::convenience::BasicPropertiesExt;
use crate::amqp::BasicProperties;
use crate::codec::{CodecError, CodecRegistry, DataSchema, MimeType};
use crate::transport::{Acker, Delivery, DELIVERY_COUNT_HEADER};
use once_cell::sync::OnceCell;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A message received from the broker, ready for processing.
///
/// The body is decoded lazily: nothing is decoded until [`Incoming::media`] or
/// [`Incoming::media_loaded`] is called, and each of them decodes at most once per message.
///
/// `Incoming` is a cheap handle: clones share the same message and the same caches.
#[derive(Clone)]
pub struct Incoming {
    inner: Arc<IncomingInner>,
}

struct IncomingInner {
    delivery: Delivery,
    schema: Option<Arc<dyn DataSchema>>,
    codecs: CodecRegistry,
    // An empty cell means "not computed yet"; `Some(None)` is a computed absence.
    mimetype: OnceCell<Option<MimeType>>,
    media: OnceCell<Option<Value>>,
    media_loaded: OnceCell<Option<Value>>,
    delivery_count: OnceCell<u32>,
    reject: AtomicBool,
}

impl Incoming {
    pub fn new(
        delivery: Delivery,
        schema: Option<Arc<dyn DataSchema>>,
        codecs: CodecRegistry,
    ) -> Self {
        Self {
            inner: Arc::new(IncomingInner {
                delivery,
                schema,
                codecs,
                mimetype: OnceCell::new(),
                media: OnceCell::new(),
                media_loaded: OnceCell::new(),
                delivery_count: OnceCell::new(),
                reject: AtomicBool::new(false),
            }),
        }
    }

    /// The raw message body.
    pub fn body(&self) -> &[u8] {
        &self.inner.delivery.data
    }

    pub fn properties(&self) -> &BasicProperties {
        &self.inner.delivery.properties
    }

    /// The queue the message was consumed from.
    pub fn routing_key(&self) -> &str {
        &self.inner.delivery.routing_key
    }

    pub fn redelivered(&self) -> bool {
        self.inner.delivery.redelivered
    }

    pub fn delivery_tag(&self) -> u64 {
        self.inner.delivery.delivery_tag
    }

    /// Lookup a string header.
    pub fn header_str(&self, key: &str) -> Option<String> {
        self.properties()
            .get_header_str(key)
            .map(|value| value.into_owned())
    }

    pub(crate) fn acker(&self) -> &Acker {
        &self.inner.delivery.acker
    }

    /// The content type of the body, from the `content-type` property or header.
    pub fn mimetype(&self) -> Option<&MimeType> {
        self.inner
            .mimetype
            .get_or_init(|| {
                let properties = self.properties();
                match properties.content_type() {
                    Some(content_type) => MimeType::parse(content_type.as_str()),
                    None => properties
                        .get_header_str("content-type")
                        .or_else(|| properties.get_header_str("Content-Type"))
                        .and_then(|raw| MimeType::parse(&raw)),
                }
            })
            .as_ref()
    }

    /// The decoded body, before the schema is applied. `None` if the body is empty.
    pub fn media(&self) -> Result<Option<&Value>, CodecError> {
        self.inner
            .media
            .get_or_try_init(|| {
                let body = self.body();
                // Decoders are not required to accept an empty input.
                if body.is_empty() {
                    return Ok(None);
                }
                self.inner
                    .codecs
                    .decode(body, self.mimetype(), true)
                    .map(Some)
            })
            .map(Option::as_ref)
    }

    /// The decoded body, loaded through the processor schema (if any).
    pub fn media_loaded(&self) -> Result<Option<&Value>, CodecError> {
        self.inner
            .media_loaded
            .get_or_try_init(|| {
                let Some(raw) = self.media()?.cloned() else {
                    return Ok(None);
                };
                match &self.inner.schema {
                    Some(schema) => schema.load(raw).map(Some).map_err(CodecError::Schema),
                    None => Ok(Some(raw)),
                }
            })
            .map(Option::as_ref)
    }

    /// Deserialize the loaded body into `T`.
    pub fn media_as<T: DeserializeOwned>(&self) -> Result<Option<T>, CodecError> {
        self.media_loaded()?
            .map(|value| T::deserialize(value).map_err(|e| CodecError::Schema(e.into())))
            .transpose()
    }

    /// How many times this message was delivered before.
    ///
    /// Read from the `x-delivery-count` header when the queue tracks it (quorum queues).
    /// Otherwise it is `1` for a redelivered message and `0` for a first delivery, which
    /// undercounts messages redelivered more than once.
    pub fn delivery_count(&self) -> u32 {
        *self.inner.delivery_count.get_or_init(|| {
            match self.properties().get_header_u64(DELIVERY_COUNT_HEADER) {
                Some(count) => u32::try_from(count).unwrap_or(u32::MAX),
                None => u32::from(self.redelivered()),
            }
        })
    }

    /// Ask for the message to be rejected, without requeueing, once processing completes.
    pub fn set_reject(&self) {
        self.inner.reject.store(true, Ordering::SeqCst);
    }

    pub fn reject_requested(&self) -> bool {
        self.inner.reject.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for Incoming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Incoming")
            .field("delivery", &self.inner.delivery)
            .field("reject", &self.reject_requested())
            .finish()
    }
}
