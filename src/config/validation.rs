//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, poll bound sane)
//! - Check that server identities name both files
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ReactorConfig → Result<(), Vec<ValidationError>>

use std::fmt;

use crate::config::schema::ReactorConfig;

/// A single semantic problem, keyed by the offending field path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validate a parsed configuration.
pub fn validate_config(config: &ReactorConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.connect.timeout_ms == 0 {
        errors.push(ValidationError::new("connect.timeout_ms", "must be greater than 0"));
    }
    if config.connect.send_timeout_ms == 0 {
        errors.push(ValidationError::new("connect.send_timeout_ms", "must be greater than 0"));
    }
    if config.tls.handshake_timeout_ms == 0 {
        errors.push(ValidationError::new("tls.handshake_timeout_ms", "must be greater than 0"));
    }
    if config.scheduler.poll_timeout_ms == 0 || config.scheduler.poll_timeout_ms > 1_000 {
        errors.push(ValidationError::new(
            "scheduler.poll_timeout_ms",
            "must be between 1 and 1000",
        ));
    }
    for (i, root) in config.tls.trust_roots.iter().enumerate() {
        if root.trim().is_empty() {
            errors.push(ValidationError::new(format!("tls.trust_roots[{i}]"), "path is empty"));
        }
    }
    for (i, identity) in config.server.identities.iter().enumerate() {
        if identity.cert_path.trim().is_empty() {
            errors.push(ValidationError::new(
                format!("server.identities[{i}].cert_path"),
                "path is empty",
            ));
        }
        if identity.key_path.trim().is_empty() {
            errors.push(ValidationError::new(
                format!("server.identities[{i}].key_path"),
                "path is empty",
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::IdentityConfig;

    #[test]
    fn default_config_is_valid() {
        assert!(validate_config(&ReactorConfig::default()).is_ok());
    }

    #[test]
    fn reports_every_problem() {
        let mut config = ReactorConfig::default();
        config.connect.timeout_ms = 0;
        config.scheduler.poll_timeout_ms = 5_000;
        config.server.identities.push(IdentityConfig {
            cert_path: String::new(),
            key_path: "key.pem".to_string(),
        });

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec![
                "connect.timeout_ms",
                "scheduler.poll_timeout_ms",
                "server.identities[0].cert_path",
            ]
        );
    }
}
