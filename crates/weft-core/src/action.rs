//! Action handler contract and registry.
//!
//! An action handler produces the effect of one action of a step: it
//! receives an enriched configuration mapping and returns an
//! [`ActionOutcome`] envelope. Handlers MUST NOT return `Err` for domain
//! failures -- those come back as `success = false` with an error message.
//! `Err` is reserved for infrastructure faults; the scheduler treats both
//! uniformly when deciding the step's fate.
//!
//! The registry is closed once construction finishes: adding a tag is the
//! only extension point of the engine.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// ActionOutcome
// ---------------------------------------------------------------------------

/// Result envelope returned by every action handler.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ActionOutcome {
    /// Whether the action succeeded.
    pub success: bool,
    /// Structured output data on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Error description on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionOutcome {
    /// A successful outcome carrying structured data.
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    /// A successful outcome with no data.
    pub fn empty() -> Self {
        Self {
            success: true,
            data: None,
            error: None,
        }
    }

    /// A failed outcome with an error message.
    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// ActionHandler trait
// ---------------------------------------------------------------------------

/// Contract implemented by every action handler.
///
/// Uses RPITIT (return-position `impl Trait` in traits) for the async
/// method, consistent with the crate's Rust 2024 approach; dynamic dispatch
/// goes through [`BoxActionHandler`].
pub trait ActionHandler: Send + Sync {
    /// Registry tag this handler answers to (e.g. "slack", "calendar").
    fn action_type(&self) -> &str;

    /// Produce the action's effect from the enriched configuration.
    fn execute(
        &self,
        config: &Map<String, Value>,
    ) -> impl Future<Output = anyhow::Result<ActionOutcome>> + Send;
}

// ---------------------------------------------------------------------------
// BoxActionHandler -- object-safe dynamic dispatch wrapper
// ---------------------------------------------------------------------------

/// Object-safe version of [`ActionHandler`] with a boxed future.
///
/// This trait exists solely to enable dynamic dispatch (`dyn ActionHandlerDyn`).
/// A blanket implementation is provided for all types implementing
/// `ActionHandler`.
pub trait ActionHandlerDyn: Send + Sync {
    fn action_type(&self) -> &str;

    fn execute_boxed<'a>(
        &'a self,
        config: &'a Map<String, Value>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<ActionOutcome>> + Send + 'a>>;
}

/// Blanket implementation: any `ActionHandler` automatically implements
/// `ActionHandlerDyn`.
impl<T: ActionHandler> ActionHandlerDyn for T {
    fn action_type(&self) -> &str {
        ActionHandler::action_type(self)
    }

    fn execute_boxed<'a>(
        &'a self,
        config: &'a Map<String, Value>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<ActionOutcome>> + Send + 'a>> {
        Box::pin(self.execute(config))
    }
}

/// Type-erased action handler for runtime tag dispatch.
pub struct BoxActionHandler {
    inner: Box<dyn ActionHandlerDyn + Send + Sync>,
}

impl BoxActionHandler {
    /// Wrap a concrete `ActionHandler` in a type-erased box.
    pub fn new<T: ActionHandler + 'static>(handler: T) -> Self {
        Self {
            inner: Box::new(handler),
        }
    }

    /// Registry tag of the wrapped handler.
    pub fn action_type(&self) -> &str {
        self.inner.action_type()
    }

    /// Execute the wrapped handler.
    pub async fn execute(&self, config: &Map<String, Value>) -> anyhow::Result<ActionOutcome> {
        self.inner.execute_boxed(config).await
    }
}

impl std::fmt::Debug for BoxActionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxActionHandler")
            .field("action_type", &self.action_type())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ActionRegistry
// ---------------------------------------------------------------------------

/// Maps action-type tags to their handlers.
///
/// Register everything up front, then share the registry behind an `Arc`;
/// the tag set is closed from that point on.
#[derive(Debug, Default)]
pub struct ActionRegistry {
    handlers: HashMap<String, BoxActionHandler>,
}

impl ActionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler under its own tag. A handler registered later
    /// under the same tag replaces the earlier one.
    pub fn register<T: ActionHandler + 'static>(&mut self, handler: T) {
        let boxed = BoxActionHandler::new(handler);
        let tag = boxed.action_type().to_string();
        if self.handlers.insert(tag.clone(), boxed).is_some() {
            tracing::warn!(tag, "action handler replaced");
        }
    }

    /// Look up the handler for a tag.
    pub fn get(&self, action_type: &str) -> Option<&BoxActionHandler> {
        self.handlers.get(action_type)
    }

    /// The set of registered tags.
    pub fn tags(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }
}

// ---------------------------------------------------------------------------
// Built-in handlers
// ---------------------------------------------------------------------------

/// Handler that succeeds with no output. Useful for trigger and terminator
/// nodes whose only job is routing.
pub struct NoopHandler;

impl ActionHandler for NoopHandler {
    fn action_type(&self) -> &str {
        "noop"
    }

    async fn execute(&self, _config: &Map<String, Value>) -> anyhow::Result<ActionOutcome> {
        Ok(ActionOutcome::empty())
    }
}

/// Handler that echoes its enriched configuration back as output data.
/// Useful for wiring checks and template debugging.
pub struct EchoHandler;

impl ActionHandler for EchoHandler {
    fn action_type(&self) -> &str {
        "echo"
    }

    async fn execute(&self, config: &Map<String, Value>) -> anyhow::Result<ActionOutcome> {
        Ok(ActionOutcome::ok(Value::Object(config.clone())))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
