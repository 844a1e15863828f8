//! Tool registry: typed parameter schemas, validation and dispatch.
//!
//! Arguments arrive from the model as JSON text. They are validated against the
//! tool's [`ParamSchema`] before the handler ever sees them: unknown fields,
//! missing required fields and type mismatches are rejected explicitly.
//! Handler failures (errors or panics) become a structured failure payload
//! instead of propagating.

use crate::conversation::ConversationItem;
use crate::error::{RealtimeError, RealtimeResult};
use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{info, warn};

/// JSON type a parameter must have
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
}

impl FieldType {
    pub fn as_str(self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Integer => "integer",
            FieldType::Boolean => "boolean",
            FieldType::Object => "object",
            FieldType::Array => "array",
        }
    }

    fn matches(self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Object => value.is_object(),
            FieldType::Array => value.is_array(),
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub kind: FieldType,
    pub description: String,
    pub required: bool,
}

/// Field name → spec. Built with [`required`](Self::required) / [`optional`](Self::optional).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParamSchema {
    fields: BTreeMap<String, FieldSpec>,
}

impl ParamSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(self, name: impl Into<String>, kind: FieldType, description: impl Into<String>) -> Self {
        self.field(name, kind, description, true)
    }

    pub fn optional(self, name: impl Into<String>, kind: FieldType, description: impl Into<String>) -> Self {
        self.field(name, kind, description, false)
    }

    fn field(mut self, name: impl Into<String>, kind: FieldType, description: impl Into<String>, required: bool) -> Self {
        self.fields.insert(
            name.into(),
            FieldSpec {
                kind,
                description: description.into(),
                required,
            },
        );
        self
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldSpec)> {
        self.fields.iter().map(|(name, spec)| (name.as_str(), spec))
    }

    /// JSON Schema object advertised to the model.
    pub fn to_json_schema(&self) -> Value {
        let properties: Map<String, Value> = self
            .fields
            .iter()
            .map(|(name, spec)| {
                (
                    name.clone(),
                    json!({ "type": spec.kind.as_str(), "description": spec.description }),
                )
            })
            .collect();
        let required: Vec<&str> = self
            .fields
            .iter()
            .filter(|(_, spec)| spec.required)
            .map(|(name, _)| name.as_str())
            .collect();
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": false,
        })
    }

    /// Check `args` against the schema. The error string names the first problem found.
    pub fn validate(&self, args: &Value) -> Result<Map<String, Value>, String> {
        let Value::Object(map) = args else {
            return Err(format!("arguments must be an object, got {}", json_type_name(args)));
        };

        if let Some(unknown) = map.keys().find(|key| !self.fields.contains_key(*key)) {
            return Err(format!("unknown field '{}'", unknown));
        }

        for (name, spec) in &self.fields {
            match map.get(name) {
                None | Some(Value::Null) if spec.required => {
                    return Err(format!("missing required field '{}'", name));
                }
                None | Some(Value::Null) => {}
                Some(value) if !spec.kind.matches(value) => {
                    return Err(format!(
                        "field '{}' must be {}, got {}",
                        name,
                        spec.kind.as_str(),
                        json_type_name(value)
                    ));
                }
                Some(_) => {}
            }
        }

        Ok(map.clone())
    }
}

/// Async tool implementation. Closures `Fn(Map) -> Future<Output = anyhow::Result<Value>>` qualify.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, args: Map<String, Value>) -> anyhow::Result<Value>;
}

#[async_trait]
impl<F, Fut> ToolHandler for F
where
    F: Fn(Map<String, Value>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn call(&self, args: Map<String, Value>) -> anyhow::Result<Value> {
        (self)(args).await
    }
}

/// A tool the model may call
#[derive(Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: ParamSchema,
    handler: Arc<dyn ToolHandler>,
}

impl ToolDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: ParamSchema,
        handler: impl ToolHandler + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            handler: Arc::new(handler),
        }
    }

    /// Wrap an async closure as the handler.
    pub fn from_fn<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: ParamSchema,
        handler: F,
    ) -> Self
    where
        F: Fn(Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self::new(name, description, parameters, handler)
    }

    /// Function schema as sent in the session update.
    pub fn schema(&self) -> Value {
        json!({
            "type": "function",
            "name": self.name,
            "description": self.description,
            "parameters": self.parameters.to_json_schema(),
        })
    }
}

impl fmt::Debug for ToolDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolDefinition")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("parameters", &self.parameters)
            .finish_non_exhaustive()
    }
}

/// A validated call, ready for its handler
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub tool_name: String,
    pub arguments: Map<String, Value>,
    /// Call id of the originating `function_call` item
    pub correlation_id: String,
}

/// Structured failure returned to the model in place of a result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolFailure {
    pub kind: String,
    pub message: String,
}

impl From<&RealtimeError> for ToolFailure {
    fn from(err: &RealtimeError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// Result of one tool call, success or structured failure
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub correlation_id: String,
    pub tool_name: String,
    pub result: Result<Value, ToolFailure>,
}

impl ToolOutput {
    pub fn failed(correlation_id: impl Into<String>, tool_name: impl Into<String>, err: &RealtimeError) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            tool_name: tool_name.into(),
            result: Err(ToolFailure::from(err)),
        }
    }

    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// Serialized output text for the `function_call_output` item.
    pub fn output_text(&self) -> String {
        match &self.result {
            Ok(value) => value.to_string(),
            Err(failure) => json!({ "error": failure }).to_string(),
        }
    }

    pub fn to_item(&self, item_id: impl Into<String>) -> ConversationItem {
        ConversationItem::function_call_output(item_id, &self.correlation_id, self.output_text())
    }
}

/// A validated invocation bound to its handler; runs without borrowing the registry.
pub struct PreparedCall {
    invocation: ToolInvocation,
    handler: Arc<dyn ToolHandler>,
}

impl PreparedCall {
    pub fn invocation(&self) -> &ToolInvocation {
        &self.invocation
    }

    /// Await the handler, converting errors and panics into a failure payload.
    pub async fn run(self) -> ToolOutput {
        let ToolInvocation {
            tool_name,
            arguments,
            correlation_id,
        } = self.invocation;

        let outcome = AssertUnwindSafe(self.handler.call(arguments)).catch_unwind().await;
        let result = match outcome {
            Ok(Ok(value)) => {
                info!(tool = %tool_name, call_id = %correlation_id, "🔧 Tool completed");
                Ok(value)
            }
            Ok(Err(e)) => {
                warn!(tool = %tool_name, call_id = %correlation_id, "Tool handler failed: {:#}", e);
                Err(ToolFailure::from(&RealtimeError::ToolHandler {
                    tool: tool_name.clone(),
                    message: format!("{:#}", e),
                }))
            }
            Err(_) => {
                warn!(tool = %tool_name, call_id = %correlation_id, "Tool handler panicked");
                Err(ToolFailure::from(&RealtimeError::ToolHandler {
                    tool: tool_name.clone(),
                    message: "handler panicked".to_string(),
                }))
            }
        };

        ToolOutput {
            correlation_id,
            tool_name,
            result,
        }
    }
}

/// Name → tool
#[derive(Debug, Default, Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, ToolDefinition>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, definition: ToolDefinition) -> RealtimeResult<()> {
        if self.tools.contains_key(&definition.name) {
            return Err(RealtimeError::DuplicateTool(definition.name));
        }
        info!(tool = %definition.name, "Tool registered");
        self.tools.insert(definition.name.clone(), definition);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Function schemas for every registered tool.
    pub fn schemas(&self) -> Vec<Value> {
        self.tools.values().map(ToolDefinition::schema).collect()
    }

    /// Parse and validate `arguments` for `tool_name`.
    pub fn prepare(&self, tool_name: &str, arguments: &str, correlation_id: &str) -> RealtimeResult<PreparedCall> {
        let definition = self
            .tools
            .get(tool_name)
            .ok_or_else(|| RealtimeError::UnknownTool(tool_name.to_string()))?;

        let invalid = |reason: String| RealtimeError::SchemaValidation {
            tool: tool_name.to_string(),
            reason,
        };

        let raw: Value = if arguments.trim().is_empty() {
            Value::Object(Map::new())
        } else {
            serde_json::from_str(arguments).map_err(|e| invalid(format!("arguments are not valid JSON: {}", e)))?
        };
        let arguments = definition.parameters.validate(&raw).map_err(invalid)?;

        Ok(PreparedCall {
            invocation: ToolInvocation {
                tool_name: tool_name.to_string(),
                arguments,
                correlation_id: correlation_id.to_string(),
            },
            handler: Arc::clone(&definition.handler),
        })
    }

    /// Validate and run in one step.
    pub async fn dispatch(&self, tool_name: &str, arguments: &str, correlation_id: &str) -> RealtimeResult<ToolOutput> {
        let call = self.prepare(tool_name, arguments, correlation_id)?;
        Ok(call.run().await)
    }
}
