//! Concrete [`PolicyStore`](super::PolicyStore) implementations.
//!
//! Provides the polled seed-file store ([`file_source::FileStore`]), the
//! in-process [`memory::MemoryStore`], and the etcd client store gated by
//! the `etcd` feature, plus the [`parse_policy_str`] helper for
//! format-specific deserialization of seed files.

pub mod file_source;
pub mod memory;

#[cfg(feature = "etcd")]
pub mod etcd;

use sha2::{Digest, Sha256};

use super::model::PolicyFile;
use crate::error::RouterError;

/// Parse a policy seed file based on its extension.
pub fn parse_policy_str(
    ext: &str,
    content: &str,
    path_display: &str,
) -> Result<PolicyFile, RouterError> {
    match ext {
        #[cfg(feature = "yaml")]
        "yaml" | "yml" => serde_yml::from_str(content).map_err(|e| RouterError::PolicyParse {
            path: path_display.to_string(),
            source: Box::new(e),
        }),

        #[cfg(feature = "json")]
        "json" => serde_json::from_str(content).map_err(|e| RouterError::PolicyParse {
            path: path_display.to_string(),
            source: Box::new(e),
        }),

        other => Err(RouterError::UnsupportedFormat(other.to_string())),
    }
}

/// Compute a lowercase hex-encoded SHA-256 digest.
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_format_returns_error() {
        let result = parse_policy_str("xml", "<policies/>", "policies.xml");
        assert!(matches!(result, Err(RouterError::UnsupportedFormat(ext)) if ext == "xml"));
    }

    #[cfg(feature = "yaml")]
    #[test]
    fn yaml_policies_parse() {
        let content = r#"
policies:
  - organization_id: "*"
    model: gpt-lite
    version: 3
    failover_threshold: 2
    degraded_backends: [b2]
    backends:
      - { backend_id: b1, weight: 70 }
      - { backend_id: b2, weight: 30 }
"#;
        let file = parse_policy_str("yaml", content, "policies.yaml").unwrap();
        assert_eq!(file.policies.len(), 1);
        assert!(file.policies[0].is_global());
        assert_eq!(file.policies[0].degraded_backends, vec!["b2".to_string()]);
        assert_eq!(file.total_backends(), 2);
    }

    #[cfg(feature = "json")]
    #[test]
    fn json_policies_default_failover_threshold() {
        let content = r#"{"policies": [{"organization_id": "acme", "model": "m", "version": 1,
            "backends": [{"backend_id": "b1", "weight": 1}]}]}"#;
        let file = parse_policy_str("json", content, "policies.json").unwrap();
        assert_eq!(file.policies[0].failover_threshold, 1);
        assert!(file.policies[0].degraded_backends.is_empty());
    }

    #[test]
    fn sha256_is_stable() {
        assert_eq!(sha256_hex(b"abc"), sha256_hex(b"abc"));
        assert_ne!(sha256_hex(b"abc"), sha256_hex(b"abd"));
    }
}
