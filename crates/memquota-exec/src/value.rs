//! Runtime values.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use memquota_core::ast::Block;

/// A lexical scope. Lookups walk `parent` links up to the script binding.
#[derive(Debug, Default)]
pub struct Scope {
    vars: HashMap<String, Value>,
    parent: Option<Env>,
}

pub type Env = Arc<Mutex<Scope>>;

/// Lock a scope or byte buffer. A poisoned lock only means another run
/// panicked while holding it; the data is still usable.
pub fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Scope {
    pub fn root() -> Env {
        Arc::new(Mutex::new(Scope::default()))
    }

    pub fn child(parent: &Env) -> Env {
        Arc::new(Mutex::new(Scope {
            vars: HashMap::new(),
            parent: Some(Arc::clone(parent)),
        }))
    }

    pub fn define(&mut self, name: impl Into<String>, value: Value) {
        self.vars.insert(name.into(), value);
    }

    pub fn lookup(env: &Env, name: &str) -> Option<Value> {
        let scope = lock(env);
        match scope.vars.get(name) {
            Some(v) => Some(v.clone()),
            None => scope.parent.as_ref().and_then(|p| Scope::lookup(p, name)),
        }
    }

    /// Overwrite the nearest existing binding. Hands `value` back if there
    /// is none.
    pub fn assign(env: &Env, name: &str, value: Value) -> Result<(), Value> {
        let mut scope = lock(env);
        if let Some(slot) = scope.vars.get_mut(name) {
            *slot = value;
            return Ok(());
        }
        match scope.parent.clone() {
            Some(parent) => {
                drop(scope);
                Scope::assign(&parent, name, value)
            }
            None => Err(value),
        }
    }
}

/// Closure value: parameters, body, the scope it was created in and the
/// class whose methods unqualified calls inside it resolve against. The body
/// is the literal's own, shared rather than copied.
pub struct ClosureValue {
    pub params: Vec<String>,
    pub body: Arc<Block>,
    pub env: Env,
    pub class: String,
}

#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Str(Arc<str>),
    /// Shared, mutable byte array. Length is fixed at allocation.
    Bytes(Arc<Mutex<Vec<u8>>>),
    Closure(Arc<ClosureValue>),
}

impl Value {
    pub fn bytes(len: usize) -> Self {
        Value::Bytes(Arc::new(Mutex::new(vec![0u8; len])))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Closure(_) => "closure",
        }
    }

    /// Truthiness: null, false, 0, "" and empty arrays are false.
    pub fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Str(s) => !s.is_empty(),
            Value::Bytes(b) => !lock(b).is_empty(),
            Value::Closure(_) => true,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => Arc::ptr_eq(a, b) || *lock(a) == *lock(b),
            (Value::Closure(a), Value::Closure(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(Arc::from(v))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Str(s) => f.write_str(s),
            Value::Bytes(b) => write!(f, "byte[{}]", lock(b).len()),
            Value::Closure(c) => write!(f, "closure/{}", c.params.len()),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => write!(f, "{s:?}"),
            other => fmt::Display::fmt(other, f),
        }
    }
}
