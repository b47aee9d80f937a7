use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("domain name is required")]
    Empty,
    #[error("wildcard domains cannot be validated over http-01: {0}")]
    Wildcard(String),
    #[error("invalid domain name {domain}: {reason}")]
    Invalid { domain: String, reason: String },
}

/// Normalizes a domain to its lower-case ASCII form without a trailing dot.
pub fn normalize_domain(input: &str) -> Result<String, DomainError> {
    let trimmed = input.trim().trim_end_matches('.');
    if trimmed.is_empty() {
        return Err(DomainError::Empty);
    }
    if trimmed.starts_with("*.") {
        return Err(DomainError::Wildcard(trimmed.to_string()));
    }
    let ascii = idna::domain_to_ascii(trimmed).map_err(|err| DomainError::Invalid {
        domain: trimmed.to_string(),
        reason: err.to_string(),
    })?;
    if ascii.is_empty() || !ascii.contains('.') {
        return Err(DomainError::Invalid {
            domain: trimmed.to_string(),
            reason: "expected a fully qualified name".to_string(),
        });
    }
    Ok(ascii.to_lowercase())
}
