use std::fs;
use std::path::{Path, PathBuf};

use super::Provider;
use crate::{Error, Result};

const CHALLENGE_DIR: &str = ".well-known/acme-challenge";

/// `http-01` provider writing the key authorization below an existing web server's
/// document root:
///
/// ```text
/// <root>/.well-known/acme-challenge/<token>
/// ```
#[derive(Debug, Clone)]
pub struct WebrootProvider {
    root: PathBuf,
}

impl WebrootProvider {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        WebrootProvider {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn token_path(&self, token: &str) -> Result<PathBuf> {
        // tokens are base64url, anything else must not escape the challenge dir.
        if token.is_empty() || token.contains(['/', '\\']) || token.starts_with('.') {
            return Err(Error::Other(format!("invalid challenge token: {}", token)));
        }
        Ok(self.root.join(CHALLENGE_DIR).join(token))
    }
}

impl Provider for WebrootProvider {
    fn present(&self, domain: &str, token: &str, key_auth: &str) -> Result<()> {
        let path = self.token_path(token)?;
        let dir = self.root.join(CHALLENGE_DIR);
        create_dir(&dir)?;
        debug!("[{}] Write http-01 challenge to {}", domain, path.display());
        fs::write(&path, key_auth).map_err(|e| {
            Error::Other(format!(
                "could not write challenge file {}: {}",
                path.display(),
                e
            ))
        })
    }

    fn clean_up(&self, domain: &str, token: &str, _key_auth: &str) -> Result<()> {
        let path = self.token_path(token)?;
        debug!("[{}] Remove http-01 challenge {}", domain, path.display());
        fs::remove_file(&path).map_err(|e| {
            Error::Other(format!(
                "could not remove challenge file {}: {}",
                path.display(),
                e
            ))
        })
    }
}

#[cfg(unix)]
fn create_dir(dir: &Path) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new()
        .recursive(true)
        .mode(0o755)
        .create(dir)
        .map_err(Error::from)
}

#[cfg(not(unix))]
fn create_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(Error::from)
}
