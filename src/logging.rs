use std::fmt;

use uuid::Uuid;

/// Identifies one provisioning run in log output.
///
/// Components receive a clone at construction and prefix their lines with it,
/// so interleaved output from separate runs stays attributable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunScope {
    id: String,
}

impl RunScope {
    pub fn new() -> Self {
        let simple = Uuid::new_v4().simple().to_string();
        Self {
            id: simple[..8].to_string(),
        }
    }

    pub fn with_id(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Default for RunScope {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run={}", self.id)
    }
}

/// Installs `env_logger` with `info` as the default level.
pub fn init() {
    let env = env_logger::Env::default().default_filter_or("info");
    let _ = env_logger::Builder::from_env(env)
        .format_timestamp_secs()
        .try_init();
}
