//! Run configuration.
//!
//! Values come from an optional JSON file and are then overridden by
//! `BUCKET_CERT_*` environment variables. Everything is validated here, so a
//! bad configuration fails before any request leaves the process.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Url;
use serde::Deserialize;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::domain::{DomainError, normalize_domain};
use crate::issuance::acme_client::LETS_ENCRYPT_PRODUCTION;
use crate::issuance::keys::SUPPORTED_KEY_SIZES;
use crate::issuance::protocol::HTTP_01;
use crate::poll::{PollPolicy, PollPolicyError};
use crate::storage::BucketRef;
use crate::storage::linode::LINODE_API;

pub const ENV_PREFIX: &str = "BUCKET_CERT_";
pub const ACCESS_TOKEN_ENV: &str = "BUCKET_CERT_ACCESS_TOKEN";
pub const DEFAULT_ACCESS_TOKEN_FILE: &str = "/run/secrets/LINODE_BUCKET_ACCESS_KEY";
pub const DEFAULT_KEY_SIZE: u32 = 4096;
pub const DEFAULT_PROOF_TTL_SECS: u64 = 360;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 15;
/// Longest pre-signed URL lifetime the provider accepts.
pub const MAX_PROOF_TTL_SECS: u64 = 86_400;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid value {value:?} for {var}: {reason}")]
    InvalidEnv {
        var: String,
        value: String,
        reason: String,
    },
    #[error("missing required setting `{0}`")]
    Missing(&'static str),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("unsupported key size {0}; allowed: 2048, 3072, 4096")]
    KeySize(u32),
    #[error("invalid {field} {value:?}: {reason}")]
    InvalidUrl {
        field: &'static str,
        value: String,
        reason: String,
    },
    #[error("supported_challenges must list at least one challenge type")]
    NoChallenges,
    #[error("challenge type {0:?} cannot be fulfilled; only http-01 is available")]
    UnsupportedChallengeType(String),
    #[error("http_timeout_secs must be greater than zero")]
    ZeroTimeout,
    #[error("proof_ttl_secs must be between 1 and {}, got {0}", MAX_PROOF_TTL_SECS)]
    ProofTtl(u64),
    #[error("invalid {which} policy: {source}")]
    Poll {
        which: &'static str,
        #[source]
        source: PollPolicyError,
    },
    #[error("terms of service must be agreed to (set agree_terms to true)")]
    TermsNotAgreed,
    #[error(
        "no storage access token; set {} or provide access_token_file",
        ACCESS_TOKEN_ENV
    )]
    MissingAccessToken,
    #[error("failed to read access token file {path}: {source}")]
    TokenFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProvisionConfig {
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub cluster: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(default = "default_key_size")]
    pub key_size: u32,
    #[serde(default = "default_directory_url")]
    pub directory_url: String,
    #[serde(default = "default_storage_api_url")]
    pub storage_api_url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_challenges")]
    pub supported_challenges: Vec<String>,
    #[serde(default)]
    pub agree_terms: bool,
    #[serde(default)]
    pub contact_email: Option<String>,
    #[serde(default)]
    pub account_key_path: Option<PathBuf>,
    #[serde(default)]
    pub access_token_file: Option<PathBuf>,
    #[serde(default = "default_proof_ttl")]
    pub proof_ttl_secs: u64,
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,
    #[serde(default)]
    pub challenge_poll: PollPolicy,
    #[serde(default)]
    pub order_poll: PollPolicy,
    #[serde(skip)]
    access_token: Zeroizing<String>,
}

fn default_key_size() -> u32 {
    DEFAULT_KEY_SIZE
}

fn default_directory_url() -> String {
    LETS_ENCRYPT_PRODUCTION.to_string()
}

fn default_storage_api_url() -> String {
    LINODE_API.to_string()
}

fn default_user_agent() -> String {
    format!("bucket-cert/{}", env!("CARGO_PKG_VERSION"))
}

fn default_challenges() -> Vec<String> {
    vec![HTTP_01.to_string()]
}

fn default_proof_ttl() -> u64 {
    DEFAULT_PROOF_TTL_SECS
}

fn default_http_timeout() -> u64 {
    DEFAULT_HTTP_TIMEOUT_SECS
}

impl fmt::Debug for ProvisionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisionConfig")
            .field("domain", &self.domain)
            .field("cluster", &self.cluster)
            .field("bucket", &self.bucket)
            .field("key_size", &self.key_size)
            .field("directory_url", &self.directory_url)
            .field("storage_api_url", &self.storage_api_url)
            .field("user_agent", &self.user_agent)
            .field("supported_challenges", &self.supported_challenges)
            .field("agree_terms", &self.agree_terms)
            .field("contact_email", &self.contact_email)
            .field("account_key_path", &self.account_key_path)
            .field("access_token_file", &self.access_token_file)
            .field("proof_ttl_secs", &self.proof_ttl_secs)
            .field("http_timeout_secs", &self.http_timeout_secs)
            .field("challenge_poll", &self.challenge_poll)
            .field("order_poll", &self.order_poll)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

impl ProvisionConfig {
    /// Reads `path` (if given), applies process environment overrides and validates.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let raw = match path {
            Some(path) => fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?,
            None => "{}".to_string(),
        };
        Self::from_sources(&raw, |name| std::env::var(name).ok())
    }

    /// Builds a validated config from JSON text and an environment lookup.
    pub fn from_sources<F>(json: &str, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config: ProvisionConfig = serde_json::from_str(json)?;
        config.apply_env(&env)?;
        config.access_token = config.resolve_access_token(&env)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env<F>(&mut self, env: &F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| {
            let name = format!("{ENV_PREFIX}{key}");
            env(&name).map(|value| (name, value))
        };

        if let Some((_, v)) = var("DOMAIN") {
            self.domain = v;
        }
        if let Some((_, v)) = var("CLUSTER") {
            self.cluster = v;
        }
        if let Some((_, v)) = var("BUCKET") {
            self.bucket = v;
        }
        if let Some((name, v)) = var("KEY_SIZE") {
            self.key_size = parse_env(&name, &v)?;
        }
        if let Some((_, v)) = var("DIRECTORY_URL") {
            self.directory_url = v;
        }
        if let Some((_, v)) = var("STORAGE_API_URL") {
            self.storage_api_url = v;
        }
        if let Some((_, v)) = var("USER_AGENT") {
            self.user_agent = v;
        }
        if let Some((_, v)) = var("SUPPORTED_CHALLENGES") {
            self.supported_challenges = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some((name, v)) = var("AGREE_TERMS") {
            self.agree_terms = parse_flag(&name, &v)?;
        }
        if let Some((_, v)) = var("CONTACT_EMAIL") {
            self.contact_email = Some(v).filter(|s| !s.trim().is_empty());
        }
        if let Some((_, v)) = var("ACCOUNT_KEY_PATH") {
            self.account_key_path = Some(PathBuf::from(v));
        }
        if let Some((_, v)) = var("ACCESS_TOKEN_FILE") {
            self.access_token_file = Some(PathBuf::from(v));
        }
        if let Some((name, v)) = var("PROOF_TTL_SECS") {
            self.proof_ttl_secs = parse_env(&name, &v)?;
        }
        if let Some((name, v)) = var("HTTP_TIMEOUT_SECS") {
            self.http_timeout_secs = parse_env(&name, &v)?;
        }
        for (prefix, policy) in [
            ("CHALLENGE_POLL", &mut self.challenge_poll),
            ("ORDER_POLL", &mut self.order_poll),
        ] {
            if let Some((name, v)) = var(&format!("{prefix}_MAX_ATTEMPTS")) {
                policy.max_attempts = parse_env(&name, &v)?;
            }
            if let Some((name, v)) = var(&format!("{prefix}_INITIAL_DELAY_MS")) {
                policy.initial_delay = Duration::from_millis(parse_env(&name, &v)?);
            }
            if let Some((name, v)) = var(&format!("{prefix}_MAX_DELAY_MS")) {
                policy.max_delay = Duration::from_millis(parse_env(&name, &v)?);
            }
        }
        Ok(())
    }

    fn resolve_access_token<F>(&self, env: &F) -> Result<Zeroizing<String>, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(token) = env(ACCESS_TOKEN_ENV).map(Zeroizing::new) {
            if !token.trim().is_empty() {
                return Ok(Zeroizing::new(token.trim().to_string()));
            }
        }
        let path = match &self.access_token_file {
            Some(path) => path.clone(),
            None => {
                let fallback = PathBuf::from(DEFAULT_ACCESS_TOKEN_FILE);
                if !fallback.exists() {
                    return Err(ConfigError::MissingAccessToken);
                }
                fallback
            }
        };
        let raw = Zeroizing::new(
            fs::read_to_string(&path).map_err(|source| ConfigError::TokenFile { path, source })?,
        );
        let token = raw.trim();
        if token.is_empty() {
            return Err(ConfigError::MissingAccessToken);
        }
        Ok(Zeroizing::new(token.to_string()))
    }

    fn validate(&mut self) -> Result<(), ConfigError> {
        self.domain = normalize_domain(&self.domain)?;
        self.cluster = required("cluster", &self.cluster)?;
        self.bucket = required("bucket", &self.bucket)?;

        if !SUPPORTED_KEY_SIZES.contains(&self.key_size) {
            return Err(ConfigError::KeySize(self.key_size));
        }
        check_url("directory_url", &self.directory_url)?;
        check_url("storage_api_url", &self.storage_api_url)?;
        if self.user_agent.trim().is_empty() {
            self.user_agent = default_user_agent();
        }

        if self.supported_challenges.is_empty() {
            return Err(ConfigError::NoChallenges);
        }
        if let Some(other) = self.supported_challenges.iter().find(|c| *c != HTTP_01) {
            return Err(ConfigError::UnsupportedChallengeType(other.clone()));
        }

        if self.http_timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.proof_ttl_secs == 0 || self.proof_ttl_secs > MAX_PROOF_TTL_SECS {
            return Err(ConfigError::ProofTtl(self.proof_ttl_secs));
        }
        self.challenge_poll
            .validate()
            .map_err(|source| ConfigError::Poll {
                which: "challenge_poll",
                source,
            })?;
        self.order_poll
            .validate()
            .map_err(|source| ConfigError::Poll {
                which: "order_poll",
                source,
            })?;
        Ok(())
    }

    /// Checks only needed when a certificate is about to be ordered.
    pub fn require_terms(&self) -> Result<(), ConfigError> {
        if self.agree_terms {
            Ok(())
        } else {
            Err(ConfigError::TermsNotAgreed)
        }
    }

    pub fn access_token(&self) -> &Zeroizing<String> {
        &self.access_token
    }

    pub fn bucket_ref(&self) -> BucketRef {
        BucketRef::new(&self.cluster, &self.bucket)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn proof_ttl(&self) -> Duration {
        Duration::from_secs(self.proof_ttl_secs)
    }
}

fn required(field: &'static str, value: &str) -> Result<String, ConfigError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ConfigError::Missing(field));
    }
    Ok(value.to_string())
}

fn check_url(field: &'static str, value: &str) -> Result<(), ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidUrl {
        field,
        value: value.to_string(),
        reason,
    };
    let url = Url::parse(value).map_err(|e| invalid(e.to_string()))?;
    if !matches!(url.scheme(), "https" | "http") {
        return Err(invalid(format!("unsupported scheme {}", url.scheme())));
    }
    Ok(())
}

fn parse_env<T>(name: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidEnv {
            var: name.to_string(),
            value: value.to_string(),
            reason: e.to_string(),
        })
}

fn parse_flag(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            var: name.to_string(),
            value: value.to_string(),
            reason: "expected true or false".to_string(),
        }),
    }
}
