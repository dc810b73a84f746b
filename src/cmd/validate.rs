//! `inference-router validate`: check a policy seed file offline.
//!
//! Parses and validates every policy in the file, reporting results in
//! either human-readable text or machine-readable JSON format.

use std::collections::BTreeSet;

use crate::cli::{ValidateArgs, ValidateFormat};
use crate::error::RouterError;
use crate::policy::stores::parse_policy_str;
use crate::policy::validation;

pub fn execute(args: &ValidateArgs) -> Result<(), RouterError> {
    let path = &args.policy_file;

    if !path.exists() {
        return Err(RouterError::PolicyFileNotFound { path: path.clone() });
    }

    let content = std::fs::read_to_string(path)?;

    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let file = parse_policy_str(ext, &content, &path.display().to_string())?;

    if let Err(errors) = validation::validate(&file) {
        match args.format {
            ValidateFormat::Text => {
                eprintln!("\u{2717} {} has {} errors\n", path.display(), errors.len());
                for error in &errors {
                    eprintln!("{error}");
                }
            }
            ValidateFormat::Json => {
                let json_errors: Vec<serde_json::Value> = errors
                    .iter()
                    .map(|e| {
                        serde_json::json!({
                            "policy": e.policy,
                            "field": e.field,
                            "message": e.message,
                            "suggestion": e.suggestion,
                        })
                    })
                    .collect();
                println!(
                    "{}",
                    serde_json::json!({
                        "valid": false,
                        "errors": json_errors,
                    })
                );
            }
        }
        return Err(RouterError::PolicyValidation { errors });
    }

    match args.format {
        ValidateFormat::Text => {
            println!(
                "\u{2713} {}",
                validation::format_validation_report(&path.display().to_string(), &file)
            );
        }
        ValidateFormat::Json => {
            let backends: BTreeSet<&str> = file
                .policies
                .iter()
                .flat_map(|p| p.backends.iter().map(|b| b.backend_id.as_str()))
                .collect();
            println!(
                "{}",
                serde_json::json!({
                    "valid": true,
                    "policies": file.policies.len(),
                    "backend_entries": file.total_backends(),
                    "distinct_backends": backends,
                })
            );
        }
    }

    Ok(())
}
