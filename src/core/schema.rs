//! Schema registry for event payloads.
//!
//! Maps raw event-type strings (canonical names and aliases) to an
//! `EventKind` and the `Schema` its payload must satisfy. Every mutation
//! bumps a generation counter so cached validation outcomes can be
//! discarded.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use serde_json::Value;

use crate::domain::EventKind;
use crate::error::{MeshError, MeshResult};

/// JSON type expected for a payload field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Number,
    Bool,
    Object,
    Array,
    Any,
}

impl FieldType {
    /// Check a value against this type
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Object => value.is_object(),
            FieldType::Array => value.is_array(),
            FieldType::Any => true,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Bool => "bool",
            FieldType::Object => "object",
            FieldType::Array => "array",
            FieldType::Any => "any",
        }
    }
}

/// Name of the JSON type of a value, for error messages
pub fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Rule for a single payload field
#[derive(Debug, Clone, Serialize)]
pub struct FieldRule {
    pub name: String,
    pub field_type: FieldType,
    pub required: bool,
    /// Strings and arrays must not be empty
    pub non_empty: bool,
}

impl FieldRule {
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
            non_empty: false,
        }
    }

    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
            non_empty: false,
        }
    }

    pub fn non_empty(mut self) -> Self {
        self.non_empty = true;
        self
    }
}

/// Payload schema for one event type
#[derive(Debug, Clone, Default, Serialize)]
pub struct Schema {
    pub fields: Vec<FieldRule>,
    /// Unknown fields are errors instead of warnings
    pub strict: bool,
}

impl Schema {
    /// Schema that accepts any payload
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, rule: FieldRule) -> Self {
        self.fields.push(rule);
        self
    }

    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    /// Check a payload, returning `(errors, warnings)`
    pub fn check(&self, payload: &Value) -> (Vec<String>, Vec<String>) {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        if self.fields.is_empty() && !self.strict {
            return (errors, warnings);
        }

        let object = match payload.as_object() {
            Some(object) => object,
            None => {
                errors.push(format!(
                    "payload must be an object, got {}",
                    value_type_name(payload)
                ));
                return (errors, warnings);
            }
        };

        for rule in &self.fields {
            match object.get(&rule.name) {
                None | Some(Value::Null) => {
                    if rule.required {
                        errors.push(format!("missing required field '{}'", rule.name));
                    }
                }
                Some(value) if !rule.field_type.matches(value) => {
                    errors.push(format!(
                        "field '{}' must be {}, got {}",
                        rule.name,
                        rule.field_type.name(),
                        value_type_name(value)
                    ));
                }
                Some(value) => {
                    let empty = match value {
                        Value::String(s) => s.trim().is_empty(),
                        Value::Array(a) => a.is_empty(),
                        _ => false,
                    };
                    if rule.non_empty && empty {
                        errors.push(format!("field '{}' must not be empty", rule.name));
                    }
                }
            }
        }

        for key in object.keys() {
            if self.fields.iter().any(|rule| &rule.name == key) {
                continue;
            }
            if self.strict {
                errors.push(format!("unexpected field '{}'", key));
            } else {
                warnings.push(format!("unrecognized field '{}'", key));
            }
        }

        (errors, warnings)
    }
}

/// Registry of event types, their aliases and schemas
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    /// canonical type -> schema
    schemas: HashMap<String, Schema>,
    /// alias -> canonical type
    aliases: HashMap<String, String>,
    generation: u64,
}

impl SchemaRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with every built-in event kind registered
    pub fn with_builtin() -> Self {
        use FieldType::{Any, Array, Number, Object};

        let mut registry = Self::new();

        registry.register(
            EventKind::ContextSlice,
            Schema::new()
                .field(FieldRule::required("id", FieldType::String).non_empty())
                .field(FieldRule::optional("userId", FieldType::String))
                .field(FieldRule::optional("sessionId", FieldType::String))
                .field(FieldRule::optional("domain", FieldType::String))
                .field(FieldRule::optional("state", Any))
                .field(FieldRule::optional("metadata", Object))
                .field(FieldRule::optional("ttlMs", Number))
                .field(FieldRule::optional("priority", FieldType::String))
                .field(FieldRule::optional("createdAt", FieldType::String)),
        );
        registry.register(
            EventKind::ContextPropagate,
            Schema::new()
                .field(FieldRule::required("slice", Object))
                .field(FieldRule::required("targetAgents", Array))
                .field(FieldRule::optional("propagationType", FieldType::String)),
        );
        registry.register(
            EventKind::WorkflowOrchestrate,
            Schema::new()
                .field(FieldRule::required("workflowId", FieldType::String).non_empty())
                .field(FieldRule::required("dagSpec", Object)),
        );
        registry.register(
            EventKind::StepDispatch,
            Schema::new()
                .field(FieldRule::required("workflowId", FieldType::String).non_empty())
                .field(FieldRule::required("stepId", FieldType::String).non_empty())
                .field(FieldRule::required("agentId", FieldType::String).non_empty())
                .field(FieldRule::required("action", FieldType::String).non_empty())
                .field(FieldRule::optional("parameters", Any))
                .field(FieldRule::optional("attempt", Number)),
        );
        registry.register(
            EventKind::StepCompleted,
            Schema::new()
                .field(FieldRule::required("workflowId", FieldType::String).non_empty())
                .field(FieldRule::required("stepId", FieldType::String).non_empty())
                .field(FieldRule::optional("output", Any))
                .field(FieldRule::optional("attempt", Number)),
        );
        registry.register(
            EventKind::StepFailed,
            Schema::new()
                .field(FieldRule::required("workflowId", FieldType::String).non_empty())
                .field(FieldRule::required("stepId", FieldType::String).non_empty())
                .field(FieldRule::required("error", FieldType::String))
                .field(FieldRule::optional("attempt", Number)),
        );
        registry.register(
            EventKind::WorkflowStateChanged,
            Schema::new()
                .field(FieldRule::required("workflowId", FieldType::String).non_empty())
                .field(FieldRule::required("state", FieldType::String)),
        );
        registry.register(
            EventKind::AgentRegistered,
            Schema::new()
                .field(FieldRule::required("agentId", FieldType::String).non_empty())
                .field(FieldRule::optional("role", FieldType::String)),
        );
        registry.register(
            EventKind::AgentStatus,
            Schema::new()
                .field(FieldRule::required("agentId", FieldType::String).non_empty())
                .field(FieldRule::required("status", FieldType::String)),
        );

        let aliases = [
            ("context_slice", EventKind::ContextSlice),
            ("context.create", EventKind::ContextSlice),
            ("context_propagation", EventKind::ContextPropagate),
            ("context.propagation", EventKind::ContextPropagate),
            ("dag_orchestration", EventKind::WorkflowOrchestrate),
            ("workflow_orchestration", EventKind::WorkflowOrchestrate),
            ("orchestrate_workflow", EventKind::WorkflowOrchestrate),
            ("step.completed", EventKind::StepCompleted),
            ("step.failed", EventKind::StepFailed),
        ];
        for (alias, kind) in aliases {
            registry
                .aliases
                .insert(alias.to_string(), kind.as_str().to_string());
        }

        registry
    }

    /// Register (or replace) the schema of an event kind
    pub fn register(&mut self, kind: EventKind, schema: Schema) {
        let canonical = kind.as_str().to_string();
        self.aliases.remove(&canonical);
        self.schemas.insert(canonical, schema);
        self.generation += 1;
    }

    /// Map an alias onto a registered canonical type
    pub fn alias(&mut self, alias: impl Into<String>, canonical: &str) -> MeshResult<()> {
        if !self.schemas.contains_key(canonical) {
            return Err(MeshError::UnknownEventType(canonical.to_string()));
        }
        self.aliases.insert(alias.into(), canonical.to_string());
        self.generation += 1;
        Ok(())
    }

    /// Resolve a raw event type into its kind and schema
    pub fn resolve(&self, event_type: &str) -> Option<(EventKind, &Schema)> {
        let canonical = self
            .aliases
            .get(event_type)
            .map(String::as_str)
            .unwrap_or(event_type);

        self.schemas
            .get(canonical)
            .map(|schema| (EventKind::from_canonical(canonical), schema))
    }

    /// Normalize a raw event type to its canonical kind
    pub fn normalize(&self, event_type: &str) -> Option<EventKind> {
        self.resolve(event_type).map(|(kind, _)| kind)
    }

    /// Changes whenever the registry is mutated
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Canonical types with their aliases, sorted by name
    pub fn event_types(&self) -> BTreeMap<String, Vec<String>> {
        let mut types: BTreeMap<String, Vec<String>> = self
            .schemas
            .keys()
            .map(|k| (k.clone(), Vec::new()))
            .collect();

        for (alias, canonical) in &self.aliases {
            if let Some(list) = types.get_mut(canonical) {
                list.push(alias.clone());
            }
        }
        for list in types.values_mut() {
            list.sort();
        }

        types
    }

    /// Schema registered for a canonical type
    pub fn schema(&self, canonical: &str) -> Option<&Schema> {
        self.schemas.get(canonical)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builtin_aliases_normalize() {
        let registry = SchemaRegistry::with_builtin();

        assert_eq!(
            registry.normalize("dag_orchestration"),
            Some(EventKind::WorkflowOrchestrate)
        );
        assert_eq!(
            registry.normalize("context_propagation"),
            Some(EventKind::ContextPropagate)
        );
        assert_eq!(
            registry.normalize("workflow.step.dispatch"),
            Some(EventKind::StepDispatch)
        );
        assert_eq!(registry.normalize("nope"), None);
    }

    #[test]
    fn test_missing_and_mistyped_fields() {
        let schema = Schema::new()
            .field(FieldRule::required("workflowId", FieldType::String).non_empty())
            .field(FieldRule::required("dagSpec", FieldType::Object));

        let (errors, _) = schema.check(&json!({"dagSpec": []}));
        assert_eq!(errors.len(), 2);
        assert!(errors.contains(&"missing required field 'workflowId'".to_string()));
        assert!(errors.contains(&"field 'dagSpec' must be object, got array".to_string()));
    }

    #[test]
    fn test_empty_string_rejected() {
        let schema = Schema::new().field(FieldRule::required("id", FieldType::String).non_empty());
        let (errors, _) = schema.check(&json!({"id": "  "}));
        assert_eq!(errors, vec!["field 'id' must not be empty".to_string()]);
    }

    #[test]
    fn test_unknown_fields_warn_or_fail() {
        let lenient = Schema::new().field(FieldRule::optional("a", FieldType::Any));
        let (errors, warnings) = lenient.check(&json!({"a": 1, "b": 2}));
        assert!(errors.is_empty());
        assert_eq!(warnings, vec!["unrecognized field 'b'".to_string()]);

        let strict = lenient.clone().strict();
        let (errors, _) = strict.check(&json!({"a": 1, "b": 2}));
        assert_eq!(errors, vec!["unexpected field 'b'".to_string()]);
    }

    #[test]
    fn test_non_object_payload() {
        let schema = Schema::new().field(FieldRule::required("id", FieldType::String));
        let (errors, _) = schema.check(&json!("just a string"));
        assert_eq!(errors, vec!["payload must be an object, got string".to_string()]);
    }

    #[test]
    fn test_open_schema_accepts_anything() {
        let (errors, warnings) = Schema::new().check(&json!(42));
        assert!(errors.is_empty());
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_generation_bumps_on_mutation() {
        let mut registry = SchemaRegistry::with_builtin();
        let before = registry.generation();

        registry.register(EventKind::Custom("billing.charged".to_string()), Schema::new());
        assert!(registry.generation() > before);

        let mid = registry.generation();
        registry.alias("charged", "billing.charged").unwrap();
        assert!(registry.generation() > mid);

        assert!(matches!(
            registry.alias("x", "missing.type"),
            Err(MeshError::UnknownEventType(_))
        ));
    }

    #[test]
    fn test_event_types_listing() {
        let registry = SchemaRegistry::with_builtin();
        let types = registry.event_types();

        assert_eq!(types.len(), EventKind::BUILTIN.len());
        assert!(types["workflow.orchestrate"].contains(&"dag_orchestration".to_string()));
    }
}
