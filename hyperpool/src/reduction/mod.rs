//! Reduction layer: turns task payloads and results into bytes that can
//! cross a process boundary.
//!
//! Everything a process worker sees is a [`Value`]. Callables travel by
//! name (see [`Callable`]), shared-memory blocks and sync primitives travel
//! as name references, and user types go through the custom reducers held
//! by a [`Registry`].

mod registry;

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::errors::Result;
use crate::manager::ProxyRef;
use crate::shm::ShmHandle;
use crate::sync::SyncHandle;

pub use registry::{Registry, TaskFn};

/// Encode any serde value with the crate's wire codec.
pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

pub fn deserialize<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

/// A reference to a function in the worker-side registry.
#[derive(Debug, Clone, PartialEq, serde_derive::Serialize, serde_derive::Deserialize)]
pub enum Callable {
    Function { name: String },
    /// Registered function plus captured state, prepended to the call
    /// arguments when the worker invokes it.
    Closure { name: String, captured: Vec<Value> },
}

impl Callable {
    pub fn function<S: Into<String>>(name: S) -> Callable {
        Callable::Function { name: name.into() }
    }

    pub fn closure<S: Into<String>>(name: S, captured: Vec<Value>) -> Callable {
        Callable::Closure {
            name: name.into(),
            captured,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Callable::Function { name } | Callable::Closure { name, .. } => name,
        }
    }
}

impl From<&str> for Callable {
    fn from(name: &str) -> Self {
        Callable::function(name)
    }
}

impl From<String> for Callable {
    fn from(name: String) -> Self {
        Callable::Function { name }
    }
}

/// A process-local object. Usable by thread workers; rejected by every
/// path that crosses a process boundary.
#[derive(Clone)]
pub struct LocalObject(pub Arc<dyn Any + Send + Sync>);

impl LocalObject {
    pub fn new<T: Any + Send + Sync>(value: T) -> LocalObject {
        LocalObject(Arc::new(value))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl fmt::Debug for LocalObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LocalObject({:p})", Arc::as_ptr(&self.0))
    }
}

#[derive(Debug, Clone, serde_derive::Serialize, serde_derive::Deserialize)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(BTreeMap<String, Value>),
    Callable(Callable),
    SharedMemory(ShmHandle),
    Sync(SyncHandle),
    Proxy(ProxyRef),
    Custom { type_name: String, payload: Vec<u8> },
    #[serde(skip)]
    Local(LocalObject),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        use Value::*;
        match (self, other) {
            (None, None) => true,
            (Bool(a), Bool(b)) => a == b,
            (Int(a), Int(b)) => a == b,
            (Float(a), Float(b)) => a == b,
            (Str(a), Str(b)) => a == b,
            (Bytes(a), Bytes(b)) => a == b,
            (List(a), List(b)) => a == b,
            (Dict(a), Dict(b)) => a == b,
            (Callable(a), Callable(b)) => a == b,
            (SharedMemory(a), SharedMemory(b)) => a == b,
            (Sync(a), Sync(b)) => a == b,
            (Proxy(a), Proxy(b)) => a == b,
            (
                Custom {
                    type_name: ta,
                    payload: pa,
                },
                Custom {
                    type_name: tb,
                    payload: pb,
                },
            ) => ta == tb && pa == pb,
            (Local(a), Local(b)) => Arc::ptr_eq(&a.0, &b.0),
            _ => false,
        }
    }
}

impl Value {
    pub fn kind(&self) -> &'static str {
        match self {
            Value::None => "none",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Dict(_) => "dict",
            Value::Callable(_) => "callable",
            Value::SharedMemory(_) => "shared_memory",
            Value::Sync(_) => "sync",
            Value::Proxy(_) => "proxy",
            Value::Custom { .. } => "custom",
            Value::Local(_) => "local",
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Ints widen to floats.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_callable(&self) -> Option<&Callable> {
        match self {
            Value::Callable(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_shared_memory(&self) -> Option<&ShmHandle> {
        match self {
            Value::SharedMemory(h) => Some(h),
            _ => None,
        }
    }

    pub fn as_sync(&self) -> Option<&SyncHandle> {
        match self {
            Value::Sync(h) => Some(h),
            _ => None,
        }
    }

    pub fn as_proxy(&self) -> Option<&ProxyRef> {
        match self {
            Value::Proxy(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_local(&self) -> Option<&LocalObject> {
        match self {
            Value::Local(l) => Some(l),
            _ => None,
        }
    }

    pub fn dict<I, K>(entries: I) -> Value
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Value::Dict(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::None
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::None
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<usize> for Value {
    fn from(v: usize) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::List(v.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::None,
        }
    }
}

impl From<Callable> for Value {
    fn from(v: Callable) -> Self {
        Value::Callable(v)
    }
}

impl From<ShmHandle> for Value {
    fn from(v: ShmHandle) -> Self {
        Value::SharedMemory(v)
    }
}

impl From<SyncHandle> for Value {
    fn from(v: SyncHandle) -> Self {
        Value::Sync(v)
    }
}

impl From<ProxyRef> for Value {
    fn from(v: ProxyRef) -> Self {
        Value::Proxy(v)
    }
}

impl From<LocalObject> for Value {
    fn from(v: LocalObject) -> Self {
        Value::Local(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_values_survive_the_codec() -> Result<()> {
        let value = Value::dict(vec![
            ("xs", Value::from(vec![1i64, 2, 3])),
            ("name", Value::from("square")),
            ("f", Value::Callable(Callable::closure("scale", vec![Value::Float(2.5)]))),
            ("shm", Value::SharedMemory(ShmHandle::new("/hp_test", 4096))),
        ]);
        let bytes = serialize(&value)?;
        let back: Value = deserialize(&bytes)?;
        assert_eq!(back, value);
        Ok(())
    }

    #[test]
    fn shared_memory_handles_carry_no_bytes() -> Result<()> {
        let handle = Value::SharedMemory(ShmHandle::new("/hp_big", 64 * 1024 * 1024));
        let bytes = serialize(&handle)?;
        assert!(bytes.len() < 64);
        Ok(())
    }

    #[test]
    fn local_objects_are_not_encodable() {
        let value = Value::List(vec![Value::Int(1), Value::Local(LocalObject::new(5u8))]);
        assert!(serialize(&value).is_err());
    }

    #[test]
    fn local_objects_compare_by_identity() {
        let a = LocalObject::new(String::from("x"));
        let b = LocalObject::new(String::from("x"));
        assert_eq!(Value::Local(a.clone()), Value::Local(a.clone()));
        assert_ne!(Value::Local(a), Value::Local(b));
    }

    #[test]
    fn float_accessor_widens_ints() {
        assert_eq!(Value::Int(3).as_float(), Some(3.0));
        assert_eq!(Value::Str("3".into()).as_float(), None);
    }
}
