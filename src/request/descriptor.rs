use std::marker::PhantomData;
use std::sync::Arc;

use crate::codec;
use crate::error::{ResolveError, TypeError};
use crate::value::{FromValue, IntoValue, Value};

/// Dynamic type interface attached to every request.
///
/// The engine treats all results as [`Value`]s. A descriptor validates (and
/// normalizes) those values against the concrete type a request promises, and
/// converts between values and the serialized immutable form stored remotely.
pub trait ResultDescriptor: Send + Sync {
    /// Human-readable name of the result type. Part of the request's identity.
    fn type_name(&self) -> &str;

    /// Validates a generic value against this type.
    fn check(&self, value: Value) -> Result<Value, TypeError>;

    fn value_to_immutable(&self, value: &Value) -> Result<Vec<u8>, ResolveError> {
        let value = self.check(value.clone())?;
        Ok(codec::encode(&value)?)
    }

    fn immutable_to_value(&self, data: &[u8]) -> Result<Value, ResolveError> {
        let value: Value = codec::decode(data)?;
        Ok(self.check(value)?)
    }
}

pub type Descriptor = Arc<dyn ResultDescriptor>;

/// Descriptor for a concrete Rust type.
pub struct Typed<T>(PhantomData<fn() -> T>);

impl<T> ResultDescriptor for Typed<T>
where
    T: FromValue + IntoValue + 'static,
{
    fn type_name(&self) -> &str {
        std::any::type_name::<T>()
    }

    fn check(&self, value: Value) -> Result<Value, TypeError> {
        T::from_value(value).map(IntoValue::into_value)
    }
}

/// Descriptor accepting any value.
pub struct Untyped;

impl ResultDescriptor for Untyped {
    fn type_name(&self) -> &str {
        "value"
    }

    fn check(&self, value: Value) -> Result<Value, TypeError> {
        Ok(value)
    }
}

pub fn typed<T>() -> Descriptor
where
    T: FromValue + IntoValue + 'static,
{
    Arc::new(Typed::<T>(PhantomData))
}

pub fn untyped() -> Descriptor {
    Arc::new(Untyped)
}
