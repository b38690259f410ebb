// Copyright takubokudori.
// This source code is licensed under the MIT or Apache-2.0 license.
//! Tool registry: descriptors, argument validation and action dispatch.
//!
//! Tools are declared once at startup as explicit descriptor records; the
//! runtime validator is generated from the descriptor, so a handler can
//! never drift from its advertised schema. A portmanteau tool is a single
//! registry entry whose `action` argument selects one of several
//! sub-schemas; the sub-schema is resolved before any other validation.
use crate::config::Config;
use crate::manager::VmManager;
use crate::ops::Coordinator;
use crate::types::*;
use crate::vmerr;
use serde_json::{json, Map, Value};
use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

/// Everything a handler may touch, built once at startup.
pub struct ToolContext {
    pub manager: Arc<VmManager>,
    pub coordinator: Arc<Coordinator>,
    pub config: Arc<Config>,
}

pub type HandlerFuture =
    Pin<Box<dyn Future<Output = VmResult<Value>> + Send>>;
pub type Handler =
    Arc<dyn Fn(Arc<ToolContext>, Args) -> HandlerFuture + Send + Sync>;

/// Adapts a plain `async fn(ctx, args)` into a stored handler.
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Arc<ToolContext>, Args) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = VmResult<Value>> + Send + 'static,
{
    Arc::new(move |ctx, args| Box::pin(f(ctx, args)))
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConcurrencyClass {
    Read,
    VmMutating,
    GlobalMutating,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FieldType {
    String,
    Integer,
    Number,
    Boolean,
    Enum(&'static [&'static str]),
    Object,
    Array,
}

impl FieldType {
    fn json_name(&self) -> &'static str {
        match self {
            Self::String | Self::Enum(_) => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
        }
    }
}

/// One field of an action's input schema.
pub struct FieldSpec {
    pub name: &'static str,
    pub ty: FieldType,
    pub required: bool,
    pub default: Option<Value>,
    pub description: &'static str,
    pub min: Option<i64>,
    pub max: Option<i64>,
    pub min_len: Option<usize>,
    pub max_len: Option<usize>,
}

impl FieldSpec {
    pub fn new(name: &'static str, ty: FieldType) -> Self {
        Self {
            name,
            ty,
            required: false,
            default: None,
            description: "",
            min: None,
            max: None,
            min_len: None,
            max_len: None,
        }
    }

    pub fn string(name: &'static str) -> Self {
        Self::new(name, FieldType::String)
    }

    pub fn integer(name: &'static str) -> Self {
        Self::new(name, FieldType::Integer)
    }

    pub fn boolean(name: &'static str) -> Self {
        Self::new(name, FieldType::Boolean)
    }

    pub fn enumeration(
        name: &'static str,
        values: &'static [&'static str],
    ) -> Self {
        Self::new(name, FieldType::Enum(values))
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn default_value(mut self, v: Value) -> Self {
        self.default = Some(v);
        self
    }

    pub fn describe(mut self, d: &'static str) -> Self {
        self.description = d;
        self
    }

    pub fn range(mut self, min: i64, max: i64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    pub fn length(mut self, min: usize, max: usize) -> Self {
        self.min_len = Some(min);
        self.max_len = Some(max);
        self
    }

    fn json_schema(&self) -> Value {
        let mut s = json!({ "type": self.ty.json_name() });
        if let FieldType::Enum(values) = self.ty {
            s["enum"] = json!(values);
        }
        if !self.description.is_empty() {
            s["description"] = json!(self.description);
        }
        if let Some(d) = &self.default {
            s["default"] = d.clone();
        }
        if let Some(m) = self.min {
            s["minimum"] = json!(m);
        }
        if let Some(m) = self.max {
            s["maximum"] = json!(m);
        }
        if let Some(m) = self.min_len {
            s["minLength"] = json!(m);
        }
        if let Some(m) = self.max_len {
            s["maxLength"] = json!(m);
        }
        s
    }

    fn check(&self, v: &Value) -> Result<(), String> {
        let ok = match self.ty {
            FieldType::String => v.is_string(),
            FieldType::Integer => v.is_i64() || v.is_u64(),
            FieldType::Number => v.is_number(),
            FieldType::Boolean => v.is_boolean(),
            FieldType::Enum(values) => match v.as_str() {
                Some(s) => {
                    if values.contains(&s) {
                        true
                    } else {
                        return Err(format!(
                            "field {:?} must be one of {:?}",
                            self.name, values
                        ));
                    }
                }
                None => false,
            },
            FieldType::Object => v.is_object(),
            FieldType::Array => v.is_array(),
        };
        if !ok {
            return Err(format!(
                "field {:?} must be of type {}",
                self.name,
                self.ty.json_name()
            ));
        }
        if let Some(n) = v.as_i64() {
            if let Some(min) = self.min {
                if n < min {
                    return Err(format!(
                        "field {:?} must be >= {}",
                        self.name, min
                    ));
                }
            }
            if let Some(max) = self.max {
                if n > max {
                    return Err(format!(
                        "field {:?} must be <= {}",
                        self.name, max
                    ));
                }
            }
        }
        if let Some(s) = v.as_str() {
            if let Some(min) = self.min_len {
                if s.len() < min {
                    return Err(format!(
                        "field {:?} must be at least {} characters",
                        self.name, min
                    ));
                }
            }
            if let Some(max) = self.max_len {
                if s.len() > max {
                    return Err(format!(
                        "field {:?} must be at most {} characters",
                        self.name, max
                    ));
                }
            }
        }
        Ok(())
    }
}

/// One action of a portmanteau tool: its own schema, class and handler.
pub struct ActionSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub fields: Vec<FieldSpec>,
    pub class: ConcurrencyClass,
    pub long_running: bool,
    pub handler: Handler,
}

impl ActionSpec {
    pub fn new(
        name: &'static str,
        description: &'static str,
        class: ConcurrencyClass,
        handler: Handler,
    ) -> Self {
        Self {
            name,
            description,
            fields: vec![],
            class,
            long_running: false,
            handler,
        }
    }

    pub fn field(mut self, f: FieldSpec) -> Self {
        self.fields.push(f);
        self
    }

    pub fn long_running(mut self) -> Self {
        self.long_running = true;
        self
    }
}

pub struct ToolDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub category: &'static str,
    pub actions: Vec<ActionSpec>,
}

impl ToolDescriptor {
    fn action(&self, name: &str) -> Option<&ActionSpec> {
        self.actions.iter().find(|a| a.name == name)
    }

    fn action_names(&self, degraded: bool) -> Vec<&'static str> {
        self.actions
            .iter()
            .filter(|a| !degraded || a.class == ConcurrencyClass::Read)
            .map(|a| a.name)
            .collect()
    }

    /// Renders the MCP `inputSchema`. The `action` field carries the
    /// closed action set; per-action fields are merged with their action
    /// named in the description.
    fn input_schema(&self, degraded: bool) -> Value {
        let mut properties = Map::new();
        let names = self.action_names(degraded);
        properties.insert(
            "action".to_string(),
            json!({
                "type": "string",
                "enum": names,
                "description": "Operation to perform",
            }),
        );
        for action in &self.actions {
            if degraded && action.class != ConcurrencyClass::Read {
                continue;
            }
            for f in &action.fields {
                let mut schema = f.json_schema();
                let tag = format!("[{}] {}", action.name, f.description);
                schema["description"] = json!(tag.trim_end());
                properties.entry(f.name.to_string()).or_insert(schema);
            }
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": ["action"],
        })
    }
}

/// Validated arguments handed to a handler. Only fields the schema knows
/// survive validation; handlers never see the raw argument map.
#[derive(Debug)]
pub struct Args(Map<String, Value>);

impl Args {
    pub fn get(&self, key: &str) -> Option<&Value> { self.0.get(key) }

    /// A required field; validation guarantees presence, so absence here
    /// is a descriptor bug.
    pub fn str(&self, key: &str) -> VmResult<&str> {
        self.0
            .get(key)
            .and_then(Value::as_str)
            .ok_or_else(|| VmError::internal(format!("missing field {:?}", key)))
    }

    pub fn u64(&self, key: &str) -> VmResult<u64> {
        self.0
            .get(key)
            .and_then(Value::as_u64)
            .ok_or_else(|| VmError::internal(format!("missing field {:?}", key)))
    }

    pub fn opt_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn opt_u64(&self, key: &str) -> Option<u64> {
        self.0.get(key).and_then(Value::as_u64)
    }

    pub fn opt_bool(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(Value::as_bool)
    }
}

pub struct ToolRegistry {
    tools: Vec<ToolDescriptor>,
    index: HashMap<&'static str, usize>,
    degraded: bool,
}

impl ToolRegistry {
    pub fn new(tools: Vec<ToolDescriptor>, degraded: bool) -> Self {
        let mut index = HashMap::new();
        for (i, t) in tools.iter().enumerate() {
            index.insert(t.name, i);
        }
        Self {
            tools,
            index,
            degraded,
        }
    }

    /// Serves `tools/list`. In degraded mode only read actions are
    /// advertised and tools without any disappear.
    pub fn list(&self) -> Vec<Value> {
        self.tools
            .iter()
            .filter(|t| !self.degraded || !t.action_names(true).is_empty())
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "inputSchema": t.input_schema(self.degraded),
                })
            })
            .collect()
    }

    /// Serves `tools/call`: resolve, validate, dispatch.
    pub async fn call(
        &self,
        ctx: &Arc<ToolContext>,
        name: &str,
        arguments: Value,
    ) -> VmResult<Value> {
        let tool = match self.index.get(name) {
            Some(&i) => &self.tools[i],
            None => {
                let known: Vec<&str> =
                    self.tools.iter().map(|t| t.name).collect();
                return Err(vmerr!(@e ToolNotFound,
                    "unknown tool {:?}", name)
                .with_details(json!({ "available_tools": known })));
            }
        };
        let args = match arguments {
            Value::Object(m) => m,
            Value::Null => Map::new(),
            _ => {
                return vmerr!(
                    InvalidArguments,
                    "arguments must be a JSON object"
                )
            }
        };
        let action_name = args
            .get("action")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                vmerr!(@e InvalidAction,
                    "missing required field \"action\"; supported: {:?}",
                    tool.action_names(false))
            })?;
        let action = tool.action(action_name).ok_or_else(|| {
            vmerr!(@e InvalidAction,
                "unknown action {:?}; supported: {:?}",
                action_name,
                tool.action_names(false))
        })?;
        if self.degraded && action.class != ConcurrencyClass::Read {
            return vmerr!(
                BinaryNotFound,
                "the hypervisor CLI is not available; {}.{} is disabled",
                tool.name,
                action.name
            );
        }

        let validated = validate(action, &args)?;
        let tool_name = format!("{}.{}", tool.name, action.name);
        let fut = (action.handler)(ctx.clone(), validated);
        if action.long_running {
            return ctx.coordinator.start(tool_name, fut).await;
        }
        // A panicking handler is a bug, not a protocol failure; it turns
        // into `Internal` instead of tearing the read loop down.
        match tokio::spawn(fut).await {
            Ok(r) => r,
            Err(e) if e.is_panic() => {
                Err(VmError::internal(format!("handler {} panicked", tool_name)))
            }
            Err(_) => vmerr!(Cancelled, "handler task was aborted"),
        }
    }
}

/// Validates the raw map against the action's field list. Unknown fields
/// are permitted and dropped; newer clients may send fields we do not
/// know yet.
fn validate(action: &ActionSpec, args: &Map<String, Value>) -> VmResult<Args> {
    let mut missing = Vec::new();
    let mut cleaned = Map::new();
    for f in &action.fields {
        match args.get(f.name) {
            Some(Value::Null) | None => {
                if f.required {
                    missing.push(f.name);
                } else if let Some(d) = &f.default {
                    cleaned.insert(f.name.to_string(), d.clone());
                }
            }
            Some(v) => {
                f.check(v).map_err(|msg| {
                    vmerr!(@e InvalidArguments, "{}", msg)
                })?;
                cleaned.insert(f.name.to_string(), v.clone());
            }
        }
    }
    if !missing.is_empty() {
        return Err(vmerr!(@e InvalidArguments,
            "missing required fields: {}",
            missing.join(", "))
        .with_details(json!({ "missing": missing })));
    }
    Ok(Args(cleaned))
}
