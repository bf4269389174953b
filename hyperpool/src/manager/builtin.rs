//! Managed types every registry knows about.
//!
//! None of these block inside the manager: a blocking call would stall the
//! single dispatch thread for every client. `SharedQueue::get` on an empty
//! queue fails instead of waiting.

use std::collections::{BTreeMap, VecDeque};

use anyhow::{anyhow, bail, Context};

use super::Managed;
use crate::reduction::{Registry, Value};

pub fn register_all(registry: &mut Registry) {
    registry
        .register_managed::<Namespace>()
        .register_managed::<SharedList>()
        .register_managed::<SharedQueue>()
        .register_managed::<SharedValue>();
}

fn arg(args: &[Value], i: usize) -> anyhow::Result<&Value> {
    args.get(i).ok_or_else(|| anyhow!("missing argument #{}", i))
}

fn str_arg(args: &[Value], i: usize) -> anyhow::Result<&str> {
    arg(args, i)?
        .as_str()
        .ok_or_else(|| anyhow!("argument #{} must be a string", i))
}

fn int_arg(args: &[Value], i: usize) -> anyhow::Result<i64> {
    arg(args, i)?
        .as_int()
        .ok_or_else(|| anyhow!("argument #{} must be an integer", i))
}

fn take(args: Vec<Value>, i: usize) -> anyhow::Result<Value> {
    args.into_iter()
        .nth(i)
        .ok_or_else(|| anyhow!("missing argument #{}", i))
}

/// Resolve a possibly negative index against `len`.
fn position(index: i64, len: usize) -> anyhow::Result<usize> {
    let len = len as i64;
    let i = if index < 0 { index + len } else { index };
    if i < 0 || i >= len {
        bail!("index {} out of range for length {}", index, len);
    }
    Ok(i as usize)
}

/// Attribute bag: string keys to values.
#[derive(Debug, Default)]
pub struct Namespace {
    attrs: BTreeMap<String, Value>,
}

impl Managed for Namespace {
    const TYPE_NAME: &'static str = "Namespace";
    const METHODS: &'static [&'static str] =
        &["get", "set", "delete", "contains", "keys", "items", "len"];

    fn create(args: Vec<Value>) -> anyhow::Result<Namespace> {
        let attrs = match args.into_iter().next() {
            None | Some(Value::None) => BTreeMap::new(),
            Some(Value::Dict(d)) => d,
            Some(other) => bail!("Namespace takes a dict, got {}", other.kind()),
        };
        Ok(Namespace { attrs })
    }

    fn dispatch(&mut self, method: u16, args: Vec<Value>) -> anyhow::Result<Value> {
        match method {
            0 => {
                let key = str_arg(&args, 0)?;
                match self.attrs.get(key) {
                    Some(v) => Ok(v.clone()),
                    None => match args.get(1) {
                        Some(default) => Ok(default.clone()),
                        None => bail!("no attribute '{}'", key),
                    },
                }
            }
            1 => {
                let key = str_arg(&args, 0)?.to_string();
                let value = take(args, 1)?;
                Ok(self.attrs.insert(key, value).unwrap_or(Value::None))
            }
            2 => {
                let key = str_arg(&args, 0)?;
                self.attrs
                    .remove(key)
                    .with_context(|| format!("no attribute '{}'", key))
            }
            3 => Ok(Value::Bool(self.attrs.contains_key(str_arg(&args, 0)?))),
            4 => Ok(Value::List(
                self.attrs.keys().map(|k| Value::Str(k.clone())).collect(),
            )),
            5 => Ok(Value::Dict(self.attrs.clone())),
            6 => Ok(Value::from(self.attrs.len())),
            _ => bail!("unknown method #{}", method),
        }
    }
}

#[derive(Debug, Default)]
pub struct SharedList {
    items: Vec<Value>,
}

impl Managed for SharedList {
    const TYPE_NAME: &'static str = "SharedList";
    const METHODS: &'static [&'static str] = &[
        "append", "extend", "get", "set", "pop", "insert", "remove", "len", "index", "snapshot",
        "clear",
    ];

    fn create(args: Vec<Value>) -> anyhow::Result<SharedList> {
        let items = match args.into_iter().next() {
            None | Some(Value::None) => Vec::new(),
            Some(Value::List(items)) => items,
            Some(other) => bail!("SharedList takes a list, got {}", other.kind()),
        };
        Ok(SharedList { items })
    }

    fn dispatch(&mut self, method: u16, args: Vec<Value>) -> anyhow::Result<Value> {
        match method {
            0 => {
                self.items.push(take(args, 0)?);
                Ok(Value::None)
            }
            1 => match take(args, 0)? {
                Value::List(more) => {
                    self.items.extend(more);
                    Ok(Value::None)
                }
                other => bail!("extend takes a list, got {}", other.kind()),
            },
            2 => {
                let i = position(int_arg(&args, 0)?, self.items.len())?;
                Ok(self.items[i].clone())
            }
            3 => {
                let i = position(int_arg(&args, 0)?, self.items.len())?;
                let value = take(args, 1)?;
                Ok(std::mem::replace(&mut self.items[i], value))
            }
            4 => {
                if self.items.is_empty() {
                    bail!("pop from empty list");
                }
                let i = match args.first() {
                    Some(v) => {
                        let index = v.as_int().context("index must be an integer")?;
                        position(index, self.items.len())?
                    }
                    None => self.items.len() - 1,
                };
                Ok(self.items.remove(i))
            }
            5 => {
                let len = self.items.len() as i64;
                let index = int_arg(&args, 0)?;
                let at = if index < 0 { (index + len).max(0) } else { index.min(len) };
                self.items.insert(at as usize, take(args, 1)?);
                Ok(Value::None)
            }
            6 => {
                let needle = arg(&args, 0)?;
                let i = self
                    .items
                    .iter()
                    .position(|v| v == needle)
                    .context("value not in list")?;
                Ok(self.items.remove(i))
            }
            7 => Ok(Value::from(self.items.len())),
            8 => {
                let needle = arg(&args, 0)?;
                let i = self
                    .items
                    .iter()
                    .position(|v| v == needle)
                    .context("value not in list")?;
                Ok(Value::from(i))
            }
            9 => Ok(Value::List(self.items.clone())),
            10 => {
                self.items.clear();
                Ok(Value::None)
            }
            _ => bail!("unknown method #{}", method),
        }
    }
}

/// FIFO with an optional size limit.
#[derive(Debug, Default)]
pub struct SharedQueue {
    items: VecDeque<Value>,
    maxsize: Option<usize>,
}

impl Managed for SharedQueue {
    const TYPE_NAME: &'static str = "SharedQueue";
    const METHODS: &'static [&'static str] = &["put", "get", "qsize", "empty", "full"];

    fn create(args: Vec<Value>) -> anyhow::Result<SharedQueue> {
        let maxsize = match args.first() {
            None | Some(Value::None) => None,
            Some(v) => match v.as_int() {
                Some(n) if n > 0 => Some(n as usize),
                Some(_) => None,
                None => bail!("SharedQueue size must be an integer"),
            },
        };
        Ok(SharedQueue {
            items: VecDeque::new(),
            maxsize,
        })
    }

    fn dispatch(&mut self, method: u16, args: Vec<Value>) -> anyhow::Result<Value> {
        match method {
            0 => {
                if self.is_full() {
                    bail!("queue is full");
                }
                self.items.push_back(take(args, 0)?);
                Ok(Value::None)
            }
            1 => self.items.pop_front().context("queue is empty"),
            2 => Ok(Value::from(self.items.len())),
            3 => Ok(Value::Bool(self.items.is_empty())),
            4 => Ok(Value::Bool(self.is_full())),
            _ => bail!("unknown method #{}", method),
        }
    }
}

impl SharedQueue {
    fn is_full(&self) -> bool {
        self.maxsize.map_or(false, |max| self.items.len() >= max)
    }
}

/// A single value, with atomic read-modify-write helpers.
#[derive(Debug, Default)]
pub struct SharedValue {
    value: Value,
}

impl Managed for SharedValue {
    const TYPE_NAME: &'static str = "SharedValue";
    const METHODS: &'static [&'static str] = &["get", "set", "add", "compare_and_set"];

    fn create(args: Vec<Value>) -> anyhow::Result<SharedValue> {
        Ok(SharedValue {
            value: args.into_iter().next().unwrap_or(Value::None),
        })
    }

    fn dispatch(&mut self, method: u16, args: Vec<Value>) -> anyhow::Result<Value> {
        match method {
            0 => Ok(self.value.clone()),
            1 => Ok(std::mem::replace(&mut self.value, take(args, 0)?)),
            2 => {
                let delta = arg(&args, 0)?;
                self.value = match (&self.value, delta) {
                    (Value::Int(a), Value::Int(b)) => Value::Int(a + b),
                    (a, b) => match (a.as_float(), b.as_float()) {
                        (Some(a), Some(b)) => Value::Float(a + b),
                        _ => bail!("cannot add {} to {}", b.kind(), a.kind()),
                    },
                };
                Ok(self.value.clone())
            }
            3 => {
                let expected = arg(&args, 0)?;
                if &self.value == expected {
                    self.value = take(args, 1)?;
                    Ok(Value::Bool(true))
                } else {
                    Ok(Value::Bool(false))
                }
            }
            _ => bail!("unknown method #{}", method),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call<T: Managed>(obj: &mut T, name: &str, args: Vec<Value>) -> anyhow::Result<Value> {
        let id = T::METHODS.iter().position(|m| *m == name).unwrap() as u16;
        obj.dispatch(id, args)
    }

    #[test]
    fn namespace_get_set_delete() {
        let mut ns = Namespace::create(vec![]).unwrap();
        call(&mut ns, "set", vec!["x".into(), Value::Int(1)]).unwrap();
        assert_eq!(call(&mut ns, "get", vec!["x".into()]).unwrap(), Value::Int(1));
        assert_eq!(
            call(&mut ns, "get", vec!["y".into(), Value::Int(9)]).unwrap(),
            Value::Int(9)
        );
        assert!(call(&mut ns, "get", vec!["y".into()]).is_err());
        assert_eq!(call(&mut ns, "contains", vec!["x".into()]).unwrap(), Value::Bool(true));
        call(&mut ns, "delete", vec!["x".into()]).unwrap();
        assert_eq!(call(&mut ns, "len", vec![]).unwrap(), Value::Int(0));
    }

    #[test]
    fn list_supports_negative_indices() {
        let mut list = SharedList::create(vec![Value::from(vec![1i64, 2, 3])]).unwrap();
        assert_eq!(call(&mut list, "get", vec![Value::Int(-1)]).unwrap(), Value::Int(3));
        call(&mut list, "insert", vec![Value::Int(-1), Value::Int(9)]).unwrap();
        assert_eq!(
            call(&mut list, "snapshot", vec![]).unwrap(),
            Value::from(vec![1i64, 2, 9, 3])
        );
        assert_eq!(call(&mut list, "pop", vec![]).unwrap(), Value::Int(3));
        assert_eq!(call(&mut list, "index", vec![Value::Int(9)]).unwrap(), Value::Int(2));
        assert!(call(&mut list, "get", vec![Value::Int(10)]).is_err());
    }

    #[test]
    fn queue_is_fifo_and_never_blocks() {
        let mut q = SharedQueue::create(vec![Value::Int(2)]).unwrap();
        call(&mut q, "put", vec!["a".into()]).unwrap();
        call(&mut q, "put", vec!["b".into()]).unwrap();
        assert!(call(&mut q, "put", vec!["c".into()]).is_err());
        assert_eq!(call(&mut q, "full", vec![]).unwrap(), Value::Bool(true));
        assert_eq!(call(&mut q, "get", vec![]).unwrap(), Value::from("a"));
        assert_eq!(call(&mut q, "get", vec![]).unwrap(), Value::from("b"));
        assert!(call(&mut q, "get", vec![]).is_err());
    }

    #[test]
    fn value_add_and_compare_and_set() {
        let mut v = SharedValue::create(vec![Value::Int(1)]).unwrap();
        assert_eq!(call(&mut v, "add", vec![Value::Int(4)]).unwrap(), Value::Int(5));
        assert_eq!(call(&mut v, "add", vec![Value::Float(0.5)]).unwrap(), Value::Float(5.5));
        assert!(call(&mut v, "add", vec!["x".into()]).is_err());
        assert_eq!(
            call(&mut v, "compare_and_set", vec![Value::Int(0), Value::Int(1)]).unwrap(),
            Value::Bool(false)
        );
        assert_eq!(
            call(&mut v, "compare_and_set", vec![Value::Float(5.5), Value::Int(1)]).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(call(&mut v, "get", vec![]).unwrap(), Value::Int(1));
    }
}
