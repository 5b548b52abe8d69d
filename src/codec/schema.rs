use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::marker::PhantomData;

/// Validates and reshapes message bodies on their way in and out of a processor.
///
/// `load` turns a freshly decoded body into the value handed to the processor,
/// `dump` turns the value set by the processor into what gets encoded on the wire.
pub trait DataSchema: Send + Sync + 'static {
    fn load(&self, raw: Value) -> Result<Value, anyhow::Error>;
    fn dump(&self, value: &Value) -> Result<Value, anyhow::Error>;
}

/// A [`DataSchema`] backed by a `serde` type.
///
/// Loading and dumping go through `T`: unknown fields are dropped and missing or
/// mistyped fields are errors, according to `T`'s `Deserialize` implementation.
pub struct TypedSchema<T>(PhantomData<fn() -> T>);

impl<T> TypedSchema<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for TypedSchema<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DataSchema for TypedSchema<T>
where
    T: Serialize + DeserializeOwned + 'static,
{
    fn load(&self, raw: Value) -> Result<Value, anyhow::Error> {
        let typed: T = serde_json::from_value(raw)?;
        Ok(serde_json::to_value(typed)?)
    }

    fn dump(&self, value: &Value) -> Result<Value, anyhow::Error> {
        let typed: T = serde_json::from_value(value.clone())?;
        Ok(serde_json::to_value(typed)?)
    }
}
