//! Encoding and decoding of message bodies, keyed by content type.
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

mod mime;
mod schema;

pub use mime::MimeType;
pub use schema::{DataSchema, TypedSchema};

/// Errors raised while encoding or decoding a message body.
#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    #[error("No encoder is registered for '{0}'")]
    NoEncoder(MimeType),
    #[error("No decoder is registered for '{0}'")]
    NoDecoder(MimeType),
    #[error("The message body has no content type and sniffing is disabled")]
    UnknownMimeType,
    #[error("Failed to encode a message body as '{mimetype}'")]
    Encode {
        mimetype: MimeType,
        #[source]
        source: anyhow::Error,
    },
    #[error("Failed to decode a message body as '{mimetype}'")]
    Decode {
        mimetype: MimeType,
        #[source]
        source: anyhow::Error,
    },
    #[error("The message body does not match its schema")]
    Schema(#[source] anyhow::Error),
}

/// Turns a value into the bytes of a message body.
///
/// `Encoder` is implemented for all closures with the right signature.
pub trait Encoder: Send + Sync + 'static {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, anyhow::Error>;
}

impl<F> Encoder for F
where
    F: Fn(&Value) -> Result<Vec<u8>, anyhow::Error> + Send + Sync + 'static,
{
    fn encode(&self, value: &Value) -> Result<Vec<u8>, anyhow::Error> {
        self(value)
    }
}

/// Turns the bytes of a message body into a value.
///
/// `Decoder` is implemented for all closures with the right signature.
pub trait Decoder: Send + Sync + 'static {
    fn decode(&self, body: &[u8]) -> Result<Value, anyhow::Error>;
}

impl<F> Decoder for F
where
    F: Fn(&[u8]) -> Result<Value, anyhow::Error> + Send + Sync + 'static,
{
    fn decode(&self, body: &[u8]) -> Result<Value, anyhow::Error> {
        self(body)
    }
}

fn encode_json(value: &Value) -> Result<Vec<u8>, anyhow::Error> {
    Ok(serde_json::to_vec(value)?)
}

fn decode_json(body: &[u8]) -> Result<Value, anyhow::Error> {
    Ok(serde_json::from_slice(body)?)
}

fn encode_yaml(value: &Value) -> Result<Vec<u8>, anyhow::Error> {
    Ok(serde_yaml::to_string(value)?.into_bytes())
}

fn decode_yaml(body: &[u8]) -> Result<Value, anyhow::Error> {
    Ok(serde_yaml::from_slice(body)?)
}

fn encode_text(value: &Value) -> Result<Vec<u8>, anyhow::Error> {
    match value {
        Value::String(s) => Ok(s.as_bytes().to_vec()),
        other => Ok(other.to_string().into_bytes()),
    }
}

fn decode_text(body: &[u8]) -> Result<Value, anyhow::Error> {
    Ok(Value::String(std::str::from_utf8(body)?.to_owned()))
}

/// The encoders and decoders known to a [`Scribe`](crate::scribe::Scribe).
///
/// JSON, YAML and plain text are registered out of the box. Cloning a registry is cheap:
/// the tables are shared until one of the copies registers a new codec.
#[derive(Clone)]
pub struct CodecRegistry {
    encoders: Arc<HashMap<MimeType, Arc<dyn Encoder>>>,
    decoders: Arc<HashMap<MimeType, Arc<dyn Decoder>>>,
}

impl Default for CodecRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(MimeType::Json, encode_json, decode_json);
        registry.register(MimeType::Yaml, encode_yaml, decode_yaml);
        registry.register(MimeType::Text, encode_text, decode_text);
        registry
    }
}

impl CodecRegistry {
    /// A registry without any codec.
    pub fn empty() -> Self {
        Self {
            encoders: Arc::new(HashMap::new()),
            decoders: Arc::new(HashMap::new()),
        }
    }

    /// Register the codec for `mimetype`, replacing any previous registration.
    pub fn register(
        &mut self,
        mimetype: MimeType,
        encoder: impl Encoder,
        decoder: impl Decoder,
    ) {
        Arc::make_mut(&mut self.encoders).insert(mimetype.clone(), Arc::new(encoder));
        Arc::make_mut(&mut self.decoders).insert(mimetype, Arc::new(decoder));
    }

    /// Encode `value` as `mimetype`.
    pub fn encode(&self, value: &Value, mimetype: &MimeType) -> Result<Vec<u8>, CodecError> {
        let encoder = self
            .encoders
            .get(mimetype)
            .ok_or_else(|| CodecError::NoEncoder(mimetype.clone()))?;
        encoder.encode(value).map_err(|source| CodecError::Encode {
            mimetype: mimetype.clone(),
            source,
        })
    }

    /// Decode `body` as `mimetype`.
    ///
    /// When the content type is unknown and `allow_sniff` is `true`, the body is tried as
    /// JSON first and falls back to plain text.
    pub fn decode(
        &self,
        body: &[u8],
        mimetype: Option<&MimeType>,
        allow_sniff: bool,
    ) -> Result<Value, CodecError> {
        match mimetype {
            Some(mimetype) => self.decode_as(body, mimetype),
            None if allow_sniff => self
                .decode_as(body, &MimeType::Json)
                .or_else(|_| self.decode_as(body, &MimeType::Text)),
            None => Err(CodecError::UnknownMimeType),
        }
    }

    fn decode_as(&self, body: &[u8], mimetype: &MimeType) -> Result<Value, CodecError> {
        let decoder = self
            .decoders
            .get(mimetype)
            .ok_or_else(|| CodecError::NoDecoder(mimetype.clone()))?;
        decoder.decode(body).map_err(|source| CodecError::Decode {
            mimetype: mimetype.clone(),
            source,
        })
    }
}
