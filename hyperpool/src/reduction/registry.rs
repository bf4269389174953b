use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{Callable, Value};
use crate::errors::{HyperError, Result};
use crate::manager::{builtin, Managed, ManagedEntry};

/// A function a process worker can run by name.
pub type TaskFn = Arc<dyn Fn(Vec<Value>) -> anyhow::Result<Value> + Send + Sync>;

type ReduceFn = Arc<dyn Fn(&dyn Any) -> Result<Vec<u8>> + Send + Sync>;
type RebuildFn = Arc<dyn Fn(&[u8]) -> Result<Box<dyn Any + Send>> + Send + Sync>;

struct Reducer {
    type_name: String,
    reduce: ReduceFn,
    rebuild: RebuildFn,
}

/// Name-keyed tables shared by the parent and every worker process.
///
/// The parent and its children build the registry with the same code, so
/// a name resolved in one process resolves to the same function, reducer
/// or managed type in the other.
pub struct Registry {
    functions: HashMap<String, TaskFn>,
    reducers_by_type: HashMap<TypeId, Arc<Reducer>>,
    reducers_by_name: HashMap<String, Arc<Reducer>>,
    managed: HashMap<String, ManagedEntry>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut functions: Vec<_> = self.functions.keys().collect();
        functions.sort();
        let mut types: Vec<_> = self.reducers_by_name.keys().collect();
        types.sort();
        let mut managed: Vec<_> = self.managed.keys().collect();
        managed.sort();
        f.debug_struct("Registry")
            .field("functions", &functions)
            .field("types", &types)
            .field("managed", &managed)
            .finish()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new()
    }
}

impl Registry {
    /// An empty function table with the built-in managed types registered.
    pub fn new() -> Registry {
        let mut registry = Registry {
            functions: HashMap::new(),
            reducers_by_type: HashMap::new(),
            reducers_by_name: HashMap::new(),
            managed: HashMap::new(),
        };
        builtin::register_all(&mut registry);
        registry
    }

    pub fn register_fn<S, F>(&mut self, name: S, f: F) -> &mut Self
    where
        S: Into<String>,
        F: Fn(Vec<Value>) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(f));
        self
    }

    pub fn function(&self, name: &str) -> Option<TaskFn> {
        self.functions.get(name).cloned()
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Register a serde type under `type_name`.
    pub fn register_type<T>(&mut self, type_name: &str) -> &mut Self
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        self.register_reducer::<T, _, _>(
            type_name,
            |value| Ok(bincode::serialize(value)?),
            |bytes| Ok(bincode::deserialize(bytes)?),
        )
    }

    /// Register a type with hand-written reduce/rebuild functions, for types
    /// that serde cannot describe.
    pub fn register_reducer<T, R, B>(&mut self, type_name: &str, reduce: R, rebuild: B) -> &mut Self
    where
        T: Send + 'static,
        R: Fn(&T) -> Result<Vec<u8>> + Send + Sync + 'static,
        B: Fn(&[u8]) -> Result<T> + Send + Sync + 'static,
    {
        let name = type_name.to_string();
        let reducer = Arc::new(Reducer {
            type_name: name.clone(),
            reduce: Arc::new(move |obj: &dyn Any| match obj.downcast_ref::<T>() {
                Some(v) => reduce(v),
                None => Err(HyperError::Unserializable(format!(
                    "reducer type mismatch for {}",
                    std::any::type_name::<T>()
                ))),
            }),
            rebuild: Arc::new(move |bytes: &[u8]| {
                let v = rebuild(bytes)?;
                Ok(Box::new(v) as Box<dyn Any + Send>)
            }),
        });
        self.reducers_by_type.insert(TypeId::of::<T>(), reducer.clone());
        self.reducers_by_name.insert(name, reducer);
        self
    }

    /// Reduce a typed value into a [`Value::Custom`].
    pub fn reduce<T: Any>(&self, value: &T) -> Result<Value> {
        self.reduce_any(value)
    }

    /// Reduce through dynamic dispatch on the value's concrete type.
    pub fn reduce_any(&self, value: &dyn Any) -> Result<Value> {
        let reducer = self.reducers_by_type.get(&(*value).type_id()).ok_or_else(|| {
            HyperError::Unserializable("no reducer registered for this type".to_string())
        })?;
        let payload = (reducer.reduce)(value)?;
        Ok(Value::Custom {
            type_name: reducer.type_name.clone(),
            payload,
        })
    }

    /// Rebuild a [`Value::Custom`] into `T`.
    pub fn rebuild<T: Any>(&self, value: &Value) -> Result<T> {
        let (type_name, payload) = match value {
            Value::Custom { type_name, payload } => (type_name, payload),
            other => {
                return Err(HyperError::Protocol(format!(
                    "expected a custom value, got {}",
                    other.kind()
                )))
            }
        };
        let reducer = self.reducers_by_name.get(type_name).ok_or_else(|| {
            HyperError::Unserializable(format!("unknown custom type '{}'", type_name))
        })?;
        let obj = (reducer.rebuild)(payload)?;
        obj.downcast::<T>().map(|b| *b).map_err(|_| {
            HyperError::Protocol(format!(
                "custom type '{}' is not a {}",
                type_name,
                std::any::type_name::<T>()
            ))
        })
    }

    pub fn register_managed<T: Managed>(&mut self) -> &mut Self {
        self.managed
            .insert(T::TYPE_NAME.to_string(), ManagedEntry::of::<T>());
        self
    }

    pub(crate) fn managed(&self, type_name: &str) -> Option<&ManagedEntry> {
        self.managed.get(type_name)
    }

    pub fn check_callable(&self, callable: &Callable) -> Result<()> {
        self.check_callable_at(callable, "callable")
    }

    fn check_callable_at(&self, callable: &Callable, path: &str) -> Result<()> {
        if !self.has_function(callable.name()) {
            return Err(HyperError::Unserializable(format!(
                "{}: function '{}' is not registered",
                path,
                callable.name()
            )));
        }
        if let Callable::Closure { captured, .. } = callable {
            for (i, v) in captured.iter().enumerate() {
                self.check_at(v, &format!("{}.captured[{}]", path, i))?;
            }
        }
        Ok(())
    }

    /// Walk a payload and reject anything that cannot cross a process
    /// boundary. The error names the offending path.
    pub fn check_transferable(&self, value: &Value) -> Result<()> {
        self.check_at(value, "value")
    }

    pub fn check_args(&self, args: &[Value]) -> Result<()> {
        for (i, arg) in args.iter().enumerate() {
            self.check_at(arg, &format!("args[{}]", i))?;
        }
        Ok(())
    }

    fn check_at(&self, value: &Value, path: &str) -> Result<()> {
        match value {
            Value::Local(_) => Err(HyperError::Unserializable(format!(
                "{}: process-local object",
                path
            ))),
            Value::List(items) => {
                for (i, item) in items.iter().enumerate() {
                    self.check_at(item, &format!("{}[{}]", path, i))?;
                }
                Ok(())
            }
            Value::Dict(entries) => {
                for (k, v) in entries {
                    self.check_at(v, &format!("{}.{}", path, k))?;
                }
                Ok(())
            }
            Value::Callable(c) => self.check_callable_at(c, path),
            Value::Custom { type_name, .. } if !self.reducers_by_name.contains_key(type_name) => {
                Err(HyperError::Unserializable(format!(
                    "{}: custom type '{}' has no registered reducer",
                    path, type_name
                )))
            }
            _ => Ok(()),
        }
    }
}
