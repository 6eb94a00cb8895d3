//! Event validation and normalization.
//!
//! The validator owns the schema registry. Outcomes are cached by
//! `(canonical type, payload hash)`; cache entries carry the registry
//! generation they were computed under and are ignored once it changes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::domain::EventKind;
use crate::error::MeshResult;

use super::fingerprint::hash_payload;
use super::schema::{Schema, SchemaRegistry};

/// Default number of cached validation outcomes
pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

/// Outcome of validating one event
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub normalized_event: Option<NormalizedEvent>,
}

impl ValidationResult {
    /// Invalid result with a single error
    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            valid: false,
            errors: vec![error.into()],
            warnings: Vec::new(),
            normalized_event: None,
        }
    }
}

/// Event after type normalization
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedEvent {
    pub event_type: EventKind,
    pub payload: Value,
    pub context: Option<String>,
}

#[derive(Debug, Clone)]
struct CachedOutcome {
    generation: u64,
    errors: Vec<String>,
    warnings: Vec<String>,
}

/// Validates payloads against the schema registry
#[derive(Debug)]
pub struct Validator {
    registry: RwLock<SchemaRegistry>,
    cache: DashMap<(String, String), CachedOutcome>,
    capacity: usize,
    hits: AtomicU64,
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(SchemaRegistry::with_builtin(), DEFAULT_CACHE_CAPACITY)
    }
}

impl Validator {
    /// Create a validator over a registry
    pub fn new(registry: SchemaRegistry, capacity: usize) -> Self {
        Self {
            registry: RwLock::new(registry),
            cache: DashMap::new(),
            capacity,
            hits: AtomicU64::new(0),
        }
    }

    /// Validate a payload for a raw event type
    pub fn validate(&self, event_type: &str, payload: &Value) -> ValidationResult {
        let registry = self.registry.read().unwrap_or_else(|e| e.into_inner());

        let (kind, schema) = match registry.resolve(event_type) {
            Some(resolved) => resolved,
            None => return ValidationResult::rejected(format!("unknown event type: {}", event_type)),
        };

        let (errors, warnings) = self.check_cached(&kind, schema, registry.generation(), payload);
        drop(registry);

        let valid = errors.is_empty();
        let normalized_event = valid.then(|| NormalizedEvent {
            context: extract_context(payload),
            event_type: kind,
            payload: payload.clone(),
        });

        ValidationResult {
            valid,
            errors,
            warnings,
            normalized_event,
        }
    }

    fn check_cached(
        &self,
        kind: &EventKind,
        schema: &Schema,
        generation: u64,
        payload: &Value,
    ) -> (Vec<String>, Vec<String>) {
        if self.capacity == 0 {
            return schema.check(payload);
        }

        let key = (kind.as_str().to_string(), hash_payload(payload));
        if let Some(cached) = self.cache.get(&key) {
            if cached.generation == generation {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return (cached.errors.clone(), cached.warnings.clone());
            }
        }

        let (errors, warnings) = schema.check(payload);

        if self.cache.len() >= self.capacity {
            debug!(capacity = self.capacity, "Validation cache full, clearing");
            self.cache.clear();
        }
        self.cache.insert(
            key,
            CachedOutcome {
                generation,
                errors: errors.clone(),
                warnings: warnings.clone(),
            },
        );

        (errors, warnings)
    }

    /// Normalize a raw event type without validating a payload
    pub fn normalize(&self, event_type: &str) -> Option<EventKind> {
        self.registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .normalize(event_type)
    }

    /// Register (or replace) a schema; invalidates the cache
    pub fn register(&self, kind: EventKind, schema: Schema) {
        self.registry
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .register(kind, schema);
        self.cache.clear();
    }

    /// Add an alias for a registered type; invalidates the cache
    pub fn alias(&self, alias: impl Into<String>, canonical: &str) -> MeshResult<()> {
        self.registry
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .alias(alias, canonical)?;
        self.cache.clear();
        Ok(())
    }

    /// Snapshot of the registry
    pub fn registry(&self) -> SchemaRegistry {
        self.registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Number of validations answered from the cache
    pub fn cache_hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }
}

/// Find the context slice referenced by a payload
fn extract_context(payload: &Value) -> Option<String> {
    let direct = payload
        .get("context")
        .or_else(|| payload.get("contextId"))
        .and_then(|c| c.as_str().or_else(|| c.get("id").and_then(Value::as_str)));

    direct
        .or_else(|| payload.get("slice").and_then(|s| s.get("id")).and_then(Value::as_str))
        .map(str::to_string)
}
