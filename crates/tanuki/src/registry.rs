//! Command registry and parameter schemas.
//!
//! Commands are registered under a unique name with a handler, a statically
//! declared parameter schema, and a concurrency policy. Incoming params are
//! validated and coerced against the schema before the handler runs; a
//! validation failure becomes an ERROR response, never a crash.

use crate::codec::{Item, Params};
use crate::error::{TanukiError, TanukiResult};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Declared type of one command parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Bool,
    Int,
    Float,
    Str,
    List,
    Map,
    /// An opaque value decoded by a registered codec.
    Object,
}

/// One declared parameter: name, type, and an optional default applied when
/// the caller omits it.
#[derive(Debug, Clone)]
pub struct ParamField {
    pub name: String,
    pub kind: ParamKind,
    pub default: Option<Value>,
}

/// Statically declared parameter schema for one command.
#[derive(Debug, Clone, Default)]
pub struct ParamSchema {
    fields: Vec<ParamField>,
}

impl ParamSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a required field.
    pub fn field(mut self, name: &str, kind: ParamKind) -> Self {
        self.fields.push(ParamField {
            name: name.to_string(),
            kind,
            default: None,
        });
        self
    }

    /// Declare an optional field with a default wire value.
    pub fn field_with_default(mut self, name: &str, kind: ParamKind, default: Value) -> Self {
        self.fields.push(ParamField {
            name: name.to_string(),
            kind,
            default: Some(default),
        });
        self
    }

    /// Validate and coerce decoded params against this schema. Returns the
    /// failure description on a missing field, an undeclared field, or a
    /// type mismatch.
    pub fn validate(&self, mut params: Params) -> Result<Params, String> {
        let mut out = Params::new();
        for field in &self.fields {
            match params.remove(&field.name) {
                Some(item) => {
                    check_kind(&field.name, field.kind, &item)?;
                    out.insert(field.name.clone(), item);
                }
                None => match &field.default {
                    Some(default) => {
                        out.insert(field.name.clone(), Item::Value(default.clone()));
                    }
                    None => return Err(format!("missing required parameter '{}'", field.name)),
                },
            }
        }
        if let Some(extra) = params.into_keys().next() {
            return Err(format!("unexpected parameter '{extra}'"));
        }
        Ok(out)
    }
}

fn check_kind(name: &str, kind: ParamKind, item: &Item) -> Result<(), String> {
    let ok = match item {
        Item::Object(_) => kind == ParamKind::Object,
        Item::Map(_) => kind == ParamKind::Map,
        Item::Value(value) => match kind {
            ParamKind::Bool => value.is_boolean(),
            ParamKind::Int => value.is_i64() || value.is_u64(),
            // Integers coerce to floats
            ParamKind::Float => value.is_number(),
            ParamKind::Str => value.is_string(),
            ParamKind::List => value.is_array(),
            ParamKind::Map => value.is_object(),
            ParamKind::Object => false,
        },
    };
    if ok {
        Ok(())
    } else {
        Err(format!("parameter '{name}' has the wrong type, expected {kind:?}"))
    }
}

/// A registered command handler.
pub type Handler = Arc<dyn Fn(Params) -> anyhow::Result<Params> + Send + Sync>;

/// One command registry entry.
pub struct CommandEntry {
    pub handler: Handler,
    pub schema: ParamSchema,
    /// Hard bound on concurrently executing jobs for this command; `None`
    /// means the command runs inline on the consumer loop.
    pub(crate) semaphore: Option<Arc<Semaphore>>,
}

/// Name to command entry map. Names are unique; re-registration is a
/// configuration error.
#[derive(Default)]
pub struct CommandRegistry {
    commands: HashMap<String, Arc<CommandEntry>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a command. `max_concurrency` of 0 executes the handler on
    /// the consumer loop; a positive value executes it on spawned tasks,
    /// with at most that many outstanding at once.
    pub fn register<F>(
        &mut self,
        name: &str,
        schema: ParamSchema,
        max_concurrency: usize,
        handler: F,
    ) -> TanukiResult<()>
    where
        F: Fn(Params) -> anyhow::Result<Params> + Send + Sync + 'static,
    {
        if self.commands.contains_key(name) {
            return Err(TanukiError::Config(format!(
                "command '{name}' is already registered"
            )));
        }

        let semaphore = (max_concurrency > 0).then(|| Arc::new(Semaphore::new(max_concurrency)));
        self.commands.insert(
            name.to_string(),
            Arc::new(CommandEntry {
                handler: Arc::new(handler),
                schema,
                semaphore,
            }),
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<CommandEntry>> {
        self.commands.get(name).cloned()
    }
}
