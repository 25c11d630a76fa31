//! Server-exposed targets.
//!
//! A [`Target`] is a named method table: each entry carries the parameter
//! names, optional defaults, doc text, and an async handler. Dispatch goes
//! through the table rather than open-ended reflection, which is what makes
//! "method does not exist" a typed outcome distinct from "method raised".

use std::collections::BTreeMap;

use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;

use crate::codec::Value;

/// Positional and keyword arguments of one call.
#[derive(Debug, Clone, Default)]
pub struct CallArgs {
    pub args: Vec<Value>,
    pub kwargs: Vec<(String, Value)>,
}

impl CallArgs {
    pub fn positional(args: Vec<Value>) -> Self {
        Self {
            args,
            kwargs: Vec::new(),
        }
    }

    /// Value of a keyword argument.
    pub fn kwarg(&self, name: &str) -> Option<&Value> {
        self.kwargs
            .iter()
            .find_map(|(k, v)| (k == name).then_some(v))
    }
}

/// A failure raised by a method body, marshaled to the caller with its
/// class name and message preserved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub class: String,
    pub message: String,
}

impl Fault {
    pub fn new(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.class, self.message)
    }
}

/// One declared parameter of a method.
#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub default: Option<Value>,
}

impl Param {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: None,
        }
    }

    pub fn with_default(name: impl Into<String>, default: Value) -> Self {
        Self {
            name: name.into(),
            default: Some(default),
        }
    }
}

type Handler =
    Arc<dyn Fn(CallArgs) -> BoxFuture<'static, std::result::Result<Value, Fault>> + Send + Sync>;

struct Method {
    params: Vec<Param>,
    doc: Option<String>,
    handler: Handler,
}

/// Result of dispatching one call against a target.
pub enum InvokeOutcome {
    Ok(Value),
    UnknownMethod,
    Fault(Fault),
}

/// A named object whose registered methods are callable remotely.
pub struct Target {
    description: String,
    methods: BTreeMap<String, Method>,
}

impl Target {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            methods: BTreeMap::new(),
        }
    }

    /// Register a method. `doc` may be empty.
    pub fn method<F, Fut>(mut self, name: &str, params: Vec<Param>, doc: &str, handler: F) -> Self
    where
        F: Fn(CallArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, Fault>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |call| Box::pin(handler(call)));
        self.methods.insert(
            name.to_string(),
            Method {
                params,
                doc: (!doc.is_empty()).then(|| doc.to_string()),
                handler,
            },
        );
        self
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Invoke a method, awaiting it if it suspends.
    pub async fn invoke(&self, name: &str, call: CallArgs) -> InvokeOutcome {
        let Some(method) = self.methods.get(name) else {
            return InvokeOutcome::UnknownMethod;
        };
        match (method.handler)(call).await {
            Ok(value) => InvokeOutcome::Ok(value),
            Err(fault) => InvokeOutcome::Fault(fault),
        }
    }

    /// Introspection catalog served for `get_rpc_method_list`: method name →
    /// {args, defaults, doc}. Used by tooling to build help text.
    pub fn method_list(&self) -> Value {
        let entries = self
            .methods
            .iter()
            .map(|(name, method)| {
                let args = method
                    .params
                    .iter()
                    .map(|p| Value::from(p.name.as_str()))
                    .collect();
                let defaults = method
                    .params
                    .iter()
                    .filter_map(|p| {
                        p.default
                            .as_ref()
                            .map(|d| (Value::from(p.name.as_str()), d.clone()))
                    })
                    .collect();
                let doc = match &method.doc {
                    Some(doc) => Value::from(doc.as_str()),
                    None => Value::None,
                };
                let spec = Value::Dict(vec![
                    (Value::from("args"), Value::List(args)),
                    (Value::from("defaults"), Value::Dict(defaults)),
                    (Value::from("doc"), doc),
                ]);
                (Value::from(name.as_str()), spec)
            })
            .collect();
        Value::Dict(entries)
    }
}
