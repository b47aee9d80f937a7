//! ACME account key persistence.

use std::fs::{self, OpenOptions};
use std::io::Write;
#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use log::{info, warn};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::issuance::jose::AccountKey;
use crate::issuance::protocol::ProtocolError;

#[derive(Error, Debug)]
pub enum AccountKeyError {
    #[error("failed to read account key {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write account key {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to generate account key: {0}")]
    Generate(String),
    #[error("account key {path} is unusable: {source}")]
    Invalid {
        path: PathBuf,
        #[source]
        source: ProtocolError,
    },
}

/// Loads the account key at `path`, creating a P-256 key there when the file
/// does not exist. Without a path the key lives only for this run and the
/// authority sees a new account each time.
pub fn load_or_create(path: Option<&Path>) -> Result<AccountKey, AccountKeyError> {
    let Some(path) = path else {
        warn!("[account] no account_key_path configured; using a throwaway account key");
        let pem = generate_pem()?;
        return parse(Path::new("<memory>"), &pem);
    };

    match fs::read(path) {
        Ok(raw) => {
            let raw = Zeroizing::new(raw);
            info!("[account] using account key {}", path.display());
            parse(path, &raw)
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            info!("[account] creating account key {}", path.display());
            let pem = generate_pem()?;
            write_secure_file(path, &pem)?;
            parse(path, &pem)
        }
        Err(source) => Err(AccountKeyError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn generate_pem() -> Result<Zeroizing<Vec<u8>>, AccountKeyError> {
    let key = rcgen::KeyPair::generate().map_err(|e| AccountKeyError::Generate(e.to_string()))?;
    Ok(Zeroizing::new(key.serialize_pem().into_bytes()))
}

fn parse(path: &Path, pem: &[u8]) -> Result<AccountKey, AccountKeyError> {
    AccountKey::from_pem(pem).map_err(|source| AccountKeyError::Invalid {
        path: path.to_path_buf(),
        source,
    })
}

/// Creates `path` with owner-only permissions. Never overwrites.
fn write_secure_file(path: &Path, content: &[u8]) -> Result<(), AccountKeyError> {
    let failed = |source| AccountKeyError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(failed)?;
    }
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        options.mode(0o600);
    }
    let mut file = options.open(path).map_err(failed)?;
    file.write_all(content).map_err(failed)?;
    file.flush().map_err(failed)?;
    Ok(())
}
