//! The environment context implementation.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use thiserror::Error;

/// Errors raised by environment lookups and lifecycle operations.
#[derive(Debug, Error)]
pub enum EnvError {
    /// The requested key is not present.
    #[error("Configuration key '{0}' not found")]
    KeyNotFound(String),

    /// The key exists but holds a value of a different type.
    #[error("Configuration key '{key}' is {actual}, expected {expected}")]
    WrongType {
        key: String,
        expected: &'static str,
        actual: &'static str,
    },

    /// The environment was locked and can no longer be forked.
    #[error("Locked environment cannot be forked")]
    Locked,

    /// The value could not be represented as an environment value.
    #[error("Unsupported configuration value at '{0}'")]
    Unsupported(String),
}

/// A configuration value held by an [`Env`].
#[derive(Debug, Clone, PartialEq)]
pub enum EnvValue {
    /// A string value.
    Str(String),
    /// An integer value.
    Int(i64),
    /// A floating-point value.
    Float(f64),
    /// A boolean value.
    Bool(bool),
    /// An ordered list of values.
    List(Vec<EnvValue>),
    /// A nested sub-environment.
    Nested(Env),
}

impl EnvValue {
    /// Human-readable type name, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            EnvValue::Str(_) => "a string",
            EnvValue::Int(_) => "an integer",
            EnvValue::Float(_) => "a float",
            EnvValue::Bool(_) => "a boolean",
            EnvValue::List(_) => "a list",
            EnvValue::Nested(_) => "a nested section",
        }
    }

    /// Returns the nested environment, if this value is one.
    pub fn as_env(&self) -> Option<&Env> {
        match self {
            EnvValue::Nested(env) => Some(env),
            _ => None,
        }
    }

    /// Returns the string value, if this value is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            EnvValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// One node in the fork tree of read logs.
///
/// `keys` holds the reads made directly through the owning [`Env`]; `forks`
/// holds the log of every environment cloned from it. Aggregation happens at
/// query time, so a read through one fork never contaminates the log a
/// sibling fork later starts from.
#[derive(Debug, Default)]
struct ReadLog {
    keys: RefCell<BTreeSet<String>>,
    forks: RefCell<Vec<Rc<ReadLog>>>,
}

impl ReadLog {
    fn record(&self, key: &str) {
        self.keys.borrow_mut().insert(key.to_string());
    }

    /// Direct reads plus everything read through forked descendants.
    fn transitive(&self) -> BTreeSet<String> {
        let mut keys = self.keys.borrow().clone();
        for fork in self.forks.borrow().iter() {
            keys.extend(fork.transitive());
        }
        keys
    }
}

/// A forkable, read-logged configuration snapshot.
///
/// Reads through [`Env::get`] and the typed accessors are recorded in this
/// instance's own log; [`Env::accessed_keys`] folds in the logs of all forked
/// descendants, so a source env always sees the transitive set of keys read
/// through them. Framework bookkeeping (key enumeration, fork, lock) uses
/// the non-logging internal accessors and leaves no trace.
#[derive(Debug)]
pub struct Env {
    vars: BTreeMap<String, EnvValue>,
    log: Rc<ReadLog>,
    locked: bool,
}

impl PartialEq for Env {
    fn eq(&self, other: &Self) -> bool {
        self.vars == other.vars
    }
}

impl Clone for Env {
    /// Clones the snapshot, registering the clone's log with the source.
    ///
    /// The clone starts with a copy of the keys the source itself has read so
    /// far; its subsequent reads surface in the source's [`Env::accessed_keys`]
    /// but never in the log of any other fork. [`Env::fork`] is the public
    /// entry point; `clone` is what recursion through nested values uses.
    fn clone(&self) -> Self {
        let log = Rc::new(ReadLog {
            keys: RefCell::new(self.log.keys.borrow().clone()),
            forks: RefCell::new(Vec::new()),
        });
        self.log.forks.borrow_mut().push(Rc::clone(&log));
        Env {
            vars: self.vars.clone(),
            log,
            locked: self.locked,
        }
    }
}

impl Default for Env {
    fn default() -> Self {
        Self::new()
    }
}

impl Env {
    /// Creates an empty environment.
    pub fn new() -> Self {
        Env {
            vars: BTreeMap::new(),
            log: Rc::new(ReadLog::default()),
            locked: false,
        }
    }

    /// Builds an environment from a parsed YAML document.
    ///
    /// Mappings become nested sub-environments, sequences become lists.
    /// Only scalar types the tool understands are accepted.
    pub fn from_yaml(value: &serde_yaml::Value) -> Result<Self, EnvError> {
        match value {
            serde_yaml::Value::Mapping(map) => {
                let mut env = Env::new();
                for (key, value) in map {
                    let key = key
                        .as_str()
                        .ok_or_else(|| EnvError::Unsupported(format!("{key:?}")))?;
                    env.set(key, Self::value_from_yaml(key, value)?);
                }
                Ok(env)
            }
            _ => Err(EnvError::Unsupported("<document root>".to_string())),
        }
    }

    fn value_from_yaml(key: &str, value: &serde_yaml::Value) -> Result<EnvValue, EnvError> {
        Ok(match value {
            serde_yaml::Value::Bool(b) => EnvValue::Bool(*b),
            serde_yaml::Value::String(s) => EnvValue::Str(s.clone()),
            serde_yaml::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    EnvValue::Int(i)
                } else if let Some(f) = n.as_f64() {
                    EnvValue::Float(f)
                } else {
                    return Err(EnvError::Unsupported(key.to_string()));
                }
            }
            serde_yaml::Value::Sequence(items) => {
                let mut list = Vec::with_capacity(items.len());
                for (index, item) in items.iter().enumerate() {
                    list.push(Self::value_from_yaml(&format!("{key}[{index}]"), item)?);
                }
                EnvValue::List(list)
            }
            serde_yaml::Value::Mapping(_) => EnvValue::Nested(Env::from_yaml(value)?),
            serde_yaml::Value::Null | serde_yaml::Value::Tagged(_) => {
                return Err(EnvError::Unsupported(key.to_string()))
            }
        })
    }

    /// Inserts a value. Only valid before the env is handed out to a run.
    pub fn set(&mut self, key: impl Into<String>, value: EnvValue) {
        self.vars.insert(key.into(), value);
    }

    /// Resolves `key` and records the access.
    pub fn get(&self, key: &str) -> Result<&EnvValue, EnvError> {
        let value = self
            .vars
            .get(key)
            .ok_or_else(|| EnvError::KeyNotFound(key.to_string()))?;
        self.record(key);
        Ok(value)
    }

    /// Resolves `key` if present, recording the access.
    pub fn opt(&self, key: &str) -> Option<&EnvValue> {
        let value = self.vars.get(key)?;
        self.record(key);
        Some(value)
    }

    /// Non-logging accessor, reserved for framework bookkeeping.
    pub fn get_internal(&self, key: &str) -> Option<&EnvValue> {
        self.vars.get(key)
    }

    /// Resolves `key` as a string.
    pub fn get_str(&self, key: &str) -> Result<&str, EnvError> {
        match self.get(key)? {
            EnvValue::Str(s) => Ok(s),
            other => Err(Self::wrong_type(key, "a string", other)),
        }
    }

    /// Resolves `key` as an integer.
    pub fn get_int(&self, key: &str) -> Result<i64, EnvError> {
        match self.get(key)? {
            EnvValue::Int(i) => Ok(*i),
            other => Err(Self::wrong_type(key, "an integer", other)),
        }
    }

    /// Resolves `key` as a boolean.
    pub fn get_bool(&self, key: &str) -> Result<bool, EnvError> {
        match self.get(key)? {
            EnvValue::Bool(b) => Ok(*b),
            other => Err(Self::wrong_type(key, "a boolean", other)),
        }
    }

    /// Resolves `key` as a list.
    pub fn get_list(&self, key: &str) -> Result<&[EnvValue], EnvError> {
        match self.get(key)? {
            EnvValue::List(items) => Ok(items),
            other => Err(Self::wrong_type(key, "a list", other)),
        }
    }

    /// Resolves `key` as a nested sub-environment.
    pub fn sub(&self, key: &str) -> Result<&Env, EnvError> {
        match self.get(key)? {
            EnvValue::Nested(env) => Ok(env),
            other => Err(Self::wrong_type(key, "a nested section", other)),
        }
    }

    fn wrong_type(key: &str, expected: &'static str, actual: &EnvValue) -> EnvError {
        EnvError::WrongType {
            key: key.to_string(),
            expected,
            actual: actual.type_name(),
        }
    }

    fn record(&self, key: &str) {
        self.log.record(key);
    }

    /// Returns a copy of this environment for a child to specialize.
    ///
    /// Fails with [`EnvError::Locked`] once [`Env::lock`] has been called.
    pub fn fork(&self) -> Result<Env, EnvError> {
        if self.locked {
            return Err(EnvError::Locked);
        }
        Ok(self.clone())
    }

    /// Forks and applies overrides on the copy.
    pub fn fork_with(
        &self,
        overrides: impl IntoIterator<Item = (String, EnvValue)>,
    ) -> Result<Env, EnvError> {
        let mut forked = self.fork()?;
        for (key, value) in overrides {
            forked.vars.insert(key, value);
        }
        Ok(forked)
    }

    /// Locks this environment and every nested sub-environment against
    /// further forking.
    pub fn lock(&mut self) {
        self.locked = true;
        for value in self.vars.values_mut() {
            visit_nested_mut(value, &mut |env| env.locked = true);
        }
    }

    /// Whether this environment has been locked.
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// The transitive set of keys read through this instance and all of its
    /// forked descendants, as dotted paths into nested sections.
    pub fn accessed_keys(&self) -> BTreeSet<String> {
        let mut keys = BTreeSet::new();
        for key in self.log.transitive() {
            match self.vars.get(&key) {
                Some(EnvValue::Nested(sub)) => {
                    extend_prefixed(&mut keys, &key, sub.accessed_keys());
                }
                Some(EnvValue::List(items)) => {
                    let mut any_nested = false;
                    for (index, item) in items.iter().enumerate() {
                        if let EnvValue::Nested(sub) = item {
                            any_nested = true;
                            extend_prefixed(
                                &mut keys,
                                &format!("{key}[{index}]"),
                                sub.accessed_keys(),
                            );
                        }
                    }
                    if !any_nested {
                        keys.insert(key);
                    }
                }
                _ => {
                    keys.insert(key);
                }
            }
        }
        keys
    }

    /// Keys present in the snapshot but never read through any descendant.
    /// Used after a run to flag likely authoring mistakes.
    pub fn unused_keys(&self) -> Vec<String> {
        let accessed = self.accessed_keys();
        self.all_keys()
            .into_iter()
            .filter(|key| !accessed.contains(key))
            .collect()
    }

    /// Every key in the snapshot as a dotted path. Does not log.
    fn all_keys(&self) -> BTreeSet<String> {
        let mut keys = BTreeSet::new();
        for (key, value) in &self.vars {
            match value {
                EnvValue::Nested(sub) => extend_prefixed(&mut keys, key, sub.all_keys()),
                EnvValue::List(items) => {
                    let mut any_nested = false;
                    for (index, item) in items.iter().enumerate() {
                        if let EnvValue::Nested(sub) = item {
                            any_nested = true;
                            extend_prefixed(&mut keys, &format!("{key}[{index}]"), sub.all_keys());
                        }
                    }
                    if !any_nested {
                        keys.insert(key.clone());
                    }
                }
                _ => {
                    keys.insert(key.clone());
                }
            }
        }
        keys
    }
}

/// Applies `f` to every nested sub-environment reachable from `value`,
/// descending through lists. The eager tree-walk counterpart of per-access
/// dynamic wrapping.
fn visit_nested_mut(value: &mut EnvValue, f: &mut dyn FnMut(&mut Env)) {
    match value {
        EnvValue::Nested(env) => {
            f(env);
            for nested in env.vars.values_mut() {
                visit_nested_mut(nested, f);
            }
        }
        EnvValue::List(items) => {
            for item in items {
                visit_nested_mut(item, f);
            }
        }
        _ => {}
    }
}

/// Inserts `sub_keys` under `prefix`, or `prefix` itself when the section was
/// opened but no key inside it was read.
fn extend_prefixed(keys: &mut BTreeSet<String>, prefix: &str, sub_keys: BTreeSet<String>) {
    if sub_keys.is_empty() {
        keys.insert(prefix.to_string());
    } else {
        keys.extend(sub_keys.into_iter().map(|key| format!("{prefix}.{key}")));
    }
}
