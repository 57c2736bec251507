//! Environment variable mutator
//!
//! Values are either literals or references to a key in a ConfigMap or Secret:
//!
//! ```yaml
//! LOG_LEVEL: debug
//! DB_PASSWORD: { type: secret, name: db-creds, key: password }
//! ```
//!
//! Entries that cannot be turned into an `EnvVar`, including values that are
//! neither strings nor descriptors (`PORT: 8080`), are skipped without error;
//! the reason is only visible at debug level.

use super::{first_container_mut, MutatorContext, PodSpecMutator};
use crate::error::Result;
use indexmap::IndexMap;
use k8s_openapi::api::core::v1::{EnvVar, EnvVarSource, PodSpec};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

/// Environment variables in insertion order; a `None` value is skipped
pub type EnvVars = IndexMap<String, Option<EnvValue>>;

/// Value of an environment variable entry
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum EnvValue {
    /// Plain value
    Literal(String),
    /// Reference descriptor with `type`, `name` and `key`; other keys are ignored
    Reference(BTreeMap<String, Value>),
    /// Anything else; never emitted
    Other(Value),
}

impl EnvValue {
    /// Reference descriptor for `key` in the object `name` of kind `ref_type`
    #[must_use]
    pub fn reference(ref_type: &str, name: &str, key: &str) -> Self {
        let mut descriptor = BTreeMap::new();
        descriptor.insert("type".to_string(), Value::from(ref_type));
        descriptor.insert("name".to_string(), Value::from(name));
        descriptor.insert("key".to_string(), Value::from(key));
        EnvValue::Reference(descriptor)
    }
}

impl From<&str> for EnvValue {
    fn from(value: &str) -> Self {
        EnvValue::Literal(value.to_string())
    }
}

impl From<String> for EnvValue {
    fn from(value: String) -> Self {
        EnvValue::Literal(value)
    }
}

/// Kinds of reference a descriptor's `type` may name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceType {
    ConfigMap,
    Secret,
    Field,
    ResourceField,
}

impl ReferenceType {
    /// Case-insensitive parse of a descriptor `type`
    #[must_use]
    pub fn from_str_ci(raw: &str) -> Option<Self> {
        match raw.to_lowercase().as_str() {
            "configmap" => Some(ReferenceType::ConfigMap),
            "secret" => Some(ReferenceType::Secret),
            "field" => Some(ReferenceType::Field),
            "resource_field" => Some(ReferenceType::ResourceField),
            _ => None,
        }
    }
}

/// Why an entry did not produce an environment variable
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SkippedEnvEntry {
    #[error("'{name}' has no value")]
    MissingValue { name: String },

    #[error("'{name}' is neither a string nor a reference descriptor")]
    UnsupportedValue { name: String },

    #[error("'{name}' reference has {keys} key(s), expected type, name and key")]
    IncompleteReference { name: String, keys: usize },

    #[error("'{name}' reference is missing '{field}'")]
    MissingReferenceField { name: String, field: &'static str },

    #[error("'{name}' reference field '{field}' is not a string")]
    NonStringReferenceField { name: String, field: &'static str },

    #[error("'{name}' reference type '{ref_type}' is not supported")]
    UnsupportedReferenceType { name: String, ref_type: String },

    // field and resource_field references are accepted but not translated yet
    #[error("'{name}' reference type '{ref_type}' is not implemented")]
    UnimplementedReferenceType { name: String, ref_type: String },

    #[error("'{name}' reference could not be built: {reason}")]
    InvalidReference { name: String, reason: String },
}

/// Build one environment variable from an entry
pub fn build_env_var(
    name: &str,
    value: Option<&EnvValue>,
) -> Result<EnvVar, SkippedEnvEntry> {
    let value = value.ok_or_else(|| SkippedEnvEntry::MissingValue {
        name: name.to_string(),
    })?;

    match value {
        EnvValue::Literal(literal) => Ok(EnvVar {
            name: name.to_string(),
            value: Some(literal.clone()),
            value_from: None,
        }),
        EnvValue::Reference(descriptor) => Ok(EnvVar {
            name: name.to_string(),
            value: None,
            value_from: Some(reference_source(name, descriptor)?),
        }),
        EnvValue::Other(_) => Err(SkippedEnvEntry::UnsupportedValue {
            name: name.to_string(),
        }),
    }
}

fn string_field<'a>(
    name: &str,
    descriptor: &'a BTreeMap<String, Value>,
    field: &'static str,
) -> Result<&'a str, SkippedEnvEntry> {
    match descriptor.get(field) {
        Some(Value::String(value)) => Ok(value.as_str()),
        Some(_) => Err(SkippedEnvEntry::NonStringReferenceField {
            name: name.to_string(),
            field,
        }),
        None => Err(SkippedEnvEntry::MissingReferenceField {
            name: name.to_string(),
            field,
        }),
    }
}

fn reference_source(
    name: &str,
    descriptor: &BTreeMap<String, Value>,
) -> Result<EnvVarSource, SkippedEnvEntry> {
    if descriptor.len() < 3 {
        return Err(SkippedEnvEntry::IncompleteReference {
            name: name.to_string(),
            keys: descriptor.len(),
        });
    }
    let ref_type = string_field(name, descriptor, "type")?;
    let ref_name = string_field(name, descriptor, "name")?;
    let ref_key = string_field(name, descriptor, "key")?;

    let selector = json!({ "name": ref_name, "key": ref_key });
    let source = match ReferenceType::from_str_ci(ref_type) {
        Some(ReferenceType::ConfigMap) => json!({ "configMapKeyRef": selector }),
        Some(ReferenceType::Secret) => json!({ "secretKeyRef": selector }),
        Some(ReferenceType::Field | ReferenceType::ResourceField) => {
            return Err(SkippedEnvEntry::UnimplementedReferenceType {
                name: name.to_string(),
                ref_type: ref_type.to_string(),
            });
        }
        None => {
            return Err(SkippedEnvEntry::UnsupportedReferenceType {
                name: name.to_string(),
                ref_type: ref_type.to_string(),
            });
        }
    };

    serde_json::from_value(source).map_err(|e| SkippedEnvEntry::InvalidReference {
        name: name.to_string(),
        reason: e.to_string(),
    })
}

/// Build the environment list for `vars`, dropping entries that cannot be built.
pub fn build_env_list(vars: &EnvVars) -> Vec<EnvVar> {
    let (built, skipped): (Vec<_>, Vec<_>) = vars
        .iter()
        .map(|(name, value)| build_env_var(name, value.as_ref()))
        .partition(std::result::Result::is_ok);

    for reason in skipped.into_iter().filter_map(std::result::Result::err) {
        debug!(reason = %reason, "Skipping environment entry");
    }
    built.into_iter().filter_map(std::result::Result::ok).collect()
}

/// Appends environment variables to the first container.
///
/// Existing entries keep their position; new ones follow in insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AddEnv {
    vars: EnvVars,
}

impl AddEnv {
    #[must_use]
    pub fn new(vars: EnvVars) -> Self {
        Self { vars }
    }

    #[must_use]
    pub fn var(mut self, name: impl Into<String>, value: impl Into<EnvValue>) -> Self {
        self.vars.insert(name.into(), Some(value.into()));
        self
    }

    #[must_use]
    pub fn vars(&self) -> &EnvVars {
        &self.vars
    }
}

impl PodSpecMutator for AddEnv {
    fn name(&self) -> &str {
        "add-env"
    }

    fn mutate(&self, _ctx: &MutatorContext, pod_spec: &mut PodSpec, _namespace: &str) -> Result<()> {
        let env_list = build_env_list(&self.vars);
        if env_list.is_empty() {
            return Ok(());
        }
        let Some(container) = first_container_mut(pod_spec) else {
            debug!("Pod spec has no containers; skipping environment");
            return Ok(());
        };
        container.env.get_or_insert_with(Vec::new).extend(env_list);
        Ok(())
    }
}
