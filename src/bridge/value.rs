use std::any::type_name;
use std::fmt;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

use super::error::BridgeError;

/// A bindable host field.
///
/// Holds an optional value so that an explicit script-side `null` clears the
/// field instead of being coerced into the value type. Reads and writes are
/// safe from any thread, which lets dispatch and the mutation watcher sample
/// the same field concurrently.
pub struct ValueCell<V> {
    inner: RwLock<Option<V>>,
}

impl<V> ValueCell<V> {
    pub fn new(value: V) -> Self {
        Self {
            inner: RwLock::new(Some(value)),
        }
    }

    pub fn empty() -> Self {
        Self {
            inner: RwLock::new(None),
        }
    }

    pub fn set(&self, value: V) {
        *self.inner.write() = Some(value);
    }

    pub fn replace(&self, value: Option<V>) -> Option<V> {
        std::mem::replace(&mut *self.inner.write(), value)
    }

    pub fn clear(&self) {
        *self.inner.write() = None;
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_none()
    }

    /// Apply `f` to the current value in place. Returns `None` when empty.
    pub fn update<R>(&self, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        self.inner.write().as_mut().map(f)
    }
}

impl<V: Clone> ValueCell<V> {
    pub fn get(&self) -> Option<V> {
        self.inner.read().clone()
    }
}

impl<V: Default> Default for ValueCell<V> {
    fn default() -> Self {
        Self::new(V::default())
    }
}

impl<V: fmt::Debug> fmt::Debug for ValueCell<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ValueCell").field(&*self.inner.read()).finish()
    }
}

/// Convert a JSON value to `V`, naming `subject` in the error.
pub fn coerce<V: DeserializeOwned>(value: &JsonValue, subject: &str) -> Result<V, BridgeError> {
    serde_json::from_value(value.clone()).map_err(|err| BridgeError::Coercion {
        subject: format!("{subject} {value}"),
        expected: type_name::<V>(),
        reason: err.to_string(),
    })
}

/// Positional parameter list of an exposed function.
///
/// Implemented for tuples of up to six deserializable types; `()` is a
/// function without parameters.
pub trait FunctionArgs: Sized {
    const ARITY: usize;

    fn param_types() -> Vec<&'static str>;

    fn from_json(args: &[JsonValue]) -> Result<Self, BridgeError>;
}

macro_rules! impl_function_args {
    ($arity:expr; $($ty:ident => $idx:tt),*) => {
        impl<$($ty: DeserializeOwned),*> FunctionArgs for ($($ty,)*) {
            const ARITY: usize = $arity;

            fn param_types() -> Vec<&'static str> {
                vec![$(type_name::<$ty>()),*]
            }

            #[allow(unused_variables)]
            fn from_json(args: &[JsonValue]) -> Result<Self, BridgeError> {
                Ok(($(
                    coerce::<$ty>(
                        args.get($idx).unwrap_or(&JsonValue::Null),
                        concat!("argument ", stringify!($idx)),
                    )?,
                )*))
            }
        }
    };
}

impl_function_args!(0;);
impl_function_args!(1; A => 0);
impl_function_args!(2; A => 0, B => 1);
impl_function_args!(3; A => 0, B => 1, C => 2);
impl_function_args!(4; A => 0, B => 1, C => 2, D => 3);
impl_function_args!(5; A => 0, B => 1, C => 2, D => 3, E => 4);
impl_function_args!(6; A => 0, B => 1, C => 2, D => 3, E => 4, F => 5);

/// Content-equality surrogate for a sampled property value.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fingerprint {
    /// The value was `null` or absent.
    Absent,
    Content([u8; 32]),
}

impl Fingerprint {
    pub fn of(value: &JsonValue) -> Self {
        if value.is_null() {
            return Fingerprint::Absent;
        }
        let digest = Sha256::digest(value.to_string().as_bytes());
        Fingerprint::Content(digest.into())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fingerprint::Absent => f.write_str("Fingerprint(absent)"),
            Fingerprint::Content(bytes) => write!(f, "Fingerprint({})", hex::encode(&bytes[..8])),
        }
    }
}
