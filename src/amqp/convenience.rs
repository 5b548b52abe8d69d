use lapin::types::{AMQPValue, ShortString};
use lapin::BasicProperties;
use std::borrow::Cow;

/// Convenience methods for [`lapin::BasicProperties`].
pub trait BasicPropertiesExt {
    /// Lookup header by key.
    fn get_header(&self, key: &str) -> Option<&AMQPValue>;

    /// Lookup a header string value.
    ///
    /// Returns `None` if not a string.
    fn get_header_str(&self, key: &str) -> Option<Cow<'_, str>> {
        match self.get_header(key) {
            Some(AMQPValue::LongString(s)) => Some(String::from_utf8_lossy(s.as_bytes())),
            Some(AMQPValue::ShortString(s)) => Some(Cow::Borrowed(s.as_str())),
            _ => None,
        }
    }

    /// Lookup a header integer value, accepting any of the AMQP integer encodings.
    ///
    /// Returns `None` if missing, not an integer or negative.
    fn get_header_u64(&self, key: &str) -> Option<u64> {
        match self.get_header(key)? {
            AMQPValue::ShortShortUInt(v) => Some(u64::from(*v)),
            AMQPValue::ShortUInt(v) => Some(u64::from(*v)),
            AMQPValue::LongUInt(v) => Some(u64::from(*v)),
            AMQPValue::ShortShortInt(v) => u64::try_from(*v).ok(),
            AMQPValue::ShortInt(v) => u64::try_from(*v).ok(),
            AMQPValue::LongInt(v) => u64::try_from(*v).ok(),
            AMQPValue::LongLongInt(v) => u64::try_from(*v).ok(),
            AMQPValue::Timestamp(v) => Some(*v),
            _ => None,
        }
    }
}

impl BasicPropertiesExt for BasicProperties {
    fn get_header(&self, key: &str) -> Option<&AMQPValue> {
        self.headers().as_ref()?.inner().get(&ShortString::from(key))
    }
}

/// Return `properties` with `header_name` set to `header_value`.
///
/// `lapin` only hands out the headers by reference, so the table is cloned.
///
/// ```rust
/// use spanconsumer::amqp::convenience::{set_header, BasicPropertiesExt};
/// use spanconsumer::amqp::types::AMQPValue;
/// use spanconsumer::amqp::BasicProperties;
///
/// let properties = set_header(
///     BasicProperties::default(),
///     "x-trace-id",
///     AMQPValue::LongString("4bf92f35".into()),
/// );
/// assert_eq!(properties.get_header_str("x-trace-id").as_deref(), Some("4bf92f35"));
/// ```
pub fn set_header(
    properties: BasicProperties,
    header_name: &str,
    header_value: AMQPValue,
) -> BasicProperties {
    let mut headers = properties.headers().clone().unwrap_or_default();
    headers.insert(header_name.into(), header_value);
    properties.with_headers(headers)
}
