//! Routing policy validation with detailed error reporting.
//!
//! [`validate_policy`] checks a single [`RoutingPolicy`] for structural
//! problems (empty identifiers, reserved characters, missing or duplicate
//! backends, a zero failover threshold). [`validate`] runs it over a whole
//! [`PolicyFile`] and also rejects duplicate keys.

use std::collections::HashSet;

use super::model::{PolicyFile, RoutingPolicy, GLOBAL_ORGANIZATION};
use crate::error::ValidationError;

const RESERVED_CHARS: &[char] = &['/', ':'];

/// Validate an organization id or model name. Returns `Ok(())` or a
/// human-readable error.
pub fn validate_identifier(value: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err("cannot be empty".into());
    }
    if let Some(c) = value.chars().find(|c| RESERVED_CHARS.contains(c)) {
        return Err(format!("'{value}' contains reserved character '{c}'"));
    }
    Ok(())
}

fn policy_label(policy: &RoutingPolicy) -> String {
    if policy.organization_id.is_empty() && policy.model.is_empty() {
        "(unnamed)".into()
    } else {
        policy.key().to_string()
    }
}

pub fn validate_policy(policy: &RoutingPolicy) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let label = policy_label(policy);

    if policy.organization_id != GLOBAL_ORGANIZATION {
        if let Err(msg) = validate_identifier(&policy.organization_id) {
            errors.push(ValidationError {
                policy: label.clone(),
                field: "organization_id".into(),
                message: msg,
                suggestion: policy
                    .organization_id
                    .is_empty()
                    .then(|| format!("use '{GLOBAL_ORGANIZATION}' for the global policy")),
            });
        }
    }

    if let Err(msg) = validate_identifier(&policy.model) {
        errors.push(ValidationError {
            policy: label.clone(),
            field: "model".into(),
            message: msg,
            suggestion: None,
        });
    }

    if policy.failover_threshold == 0 {
        errors.push(ValidationError {
            policy: label.clone(),
            field: "failover_threshold".into(),
            message: "must be at least 1".into(),
            suggestion: Some("set it to 1 to disable failover".into()),
        });
    }

    if policy.backends.is_empty() {
        errors.push(ValidationError {
            policy: label.clone(),
            field: "backends".into(),
            message: "at least one backend must be defined".into(),
            suggestion: None,
        });
    }

    let mut seen = HashSet::new();
    for backend in &policy.backends {
        if backend.backend_id.trim().is_empty() {
            errors.push(ValidationError {
                policy: label.clone(),
                field: "backends.backend_id".into(),
                message: "backend id cannot be empty".into(),
                suggestion: None,
            });
        } else if !seen.insert(backend.backend_id.as_str()) {
            errors.push(ValidationError {
                policy: label.clone(),
                field: "backends.backend_id".into(),
                message: format!("duplicate backend '{}'", backend.backend_id),
                suggestion: Some("merge the entries and add up their weights".into()),
            });
        }
    }

    for degraded in &policy.degraded_backends {
        if !seen.contains(degraded.as_str()) {
            errors.push(ValidationError {
                policy: label.clone(),
                field: "degraded_backends".into(),
                message: format!("'{degraded}' is not one of the policy's backends"),
                suggestion: None,
            });
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

pub fn validate(file: &PolicyFile) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if file.policies.is_empty() {
        errors.push(ValidationError {
            policy: "(root)".into(),
            field: "policies".into(),
            message: "at least one policy must be defined".into(),
            suggestion: None,
        });
        return Err(errors);
    }

    let mut seen_keys = HashSet::new();
    for policy in &file.policies {
        if let Err(mut policy_errors) = validate_policy(policy) {
            errors.append(&mut policy_errors);
        }
        if !seen_keys.insert(policy.key()) {
            errors.push(ValidationError {
                policy: policy_label(policy),
                field: "organization_id/model".into(),
                message: "duplicate policy key".into(),
                suggestion: None,
            });
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[must_use]
pub fn format_validation_report(path: &str, file: &PolicyFile) -> String {
    let mut lines = vec![format!(
        "  {} policies, {} backend entries\n",
        file.policies.len(),
        file.total_backends()
    )];

    for policy in &file.policies {
        let weights = policy
            .backends
            .iter()
            .map(|b| format!("{}={}", b.backend_id, b.weight))
            .collect::<Vec<_>>()
            .join(", ");
        lines.push(format!("  {}  (v{})", policy.key(), policy.version));
        lines.push(format!("    backends: {weights}"));
        lines.push(format!(
            "    failover: up to {} backend(s)",
            policy.failover_threshold
        ));
    }

    format!("{} is valid\n{}", path, lines.join("\n"))
}
