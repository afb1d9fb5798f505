//! The parameter pipeline: default merging and schema validation.
//!
//! Both sides of the wire run the exact same rules — the host proxy to fail
//! fast before dialing, the plugin runtime as the authoritative check before
//! dispatching into plugin code.

use std::collections::HashMap;

use thiserror::Error;

use crate::message::ParameterSpec;

#[derive(Debug, Error, PartialEq)]
pub enum ParamError {
    #[error("missing required parameter: {0}")]
    MissingRequired(String),

    #[error("invalid value for {name}: {value} (allowed values: {allowed:?})")]
    NotAllowed {
        name: String,
        value: String,
        allowed: Vec<String>,
    },

    /// A value a plugin rejected on its own terms, e.g. an unparseable
    /// number. The shared pipeline never produces this.
    #[error("invalid value for {name}: {reason}")]
    Malformed { name: String, reason: String },
}

/// Fill in defaults for every schema entry absent from `params`: the
/// descriptor's per-plugin defaults win over the schema's own default.
pub fn merge_defaults(
    params: &mut HashMap<String, String>,
    descriptor_defaults: &HashMap<String, String>,
    schema: &HashMap<String, ParameterSpec>,
) {
    for (name, spec) in schema {
        if params.contains_key(name) {
            continue;
        }
        if let Some(value) = descriptor_defaults.get(name) {
            params.insert(name.clone(), value.clone());
        } else if let Some(value) = &spec.default_value {
            params.insert(name.clone(), value.clone());
        }
    }
}

/// Check `params` against the schema: required entries must be present, and
/// any value with a non-empty allowed list must match one of its entries
/// exactly. The `type` tag is advisory and not checked here.
pub fn validate(
    params: &HashMap<String, String>,
    schema: &HashMap<String, ParameterSpec>,
) -> Result<(), ParamError> {
    for (name, spec) in schema {
        let value = params.get(name);

        if spec.required && value.is_none() {
            return Err(ParamError::MissingRequired(name.clone()));
        }

        if let Some(value) = value {
            if !spec.allowed_values.is_empty() && !spec.allowed_values.contains(value) {
                return Err(ParamError::NotAllowed {
                    name: name.clone(),
                    value: value.clone(),
                    allowed: spec.allowed_values.clone(),
                });
            }
        }
    }
    Ok(())
}
