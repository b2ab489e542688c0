//! Files on disk.
//!
//! Everything lives below one storage root:
//!
//! ```text
//! <root>/accounts/<CA host>/<account id>/account.json
//! <root>/accounts/<CA host>/<account id>/keys/<account id>.key
//! <root>/certificates/<domain>.{crt,issuer.crt,key,pem,pfx,json}
//! <root>/archives/<unix timestamp>.<file>
//! ```
//!
//! Files are written to a temporary sibling and renamed into place. Private keys (and
//! anything containing one) are only readable by the owner.
use std::fs;
use std::io::Write;
use std::path::Path;

use crate::{Error, Result};

pub mod accounts;
pub mod certificates;

pub use self::accounts::{AccountRecord, AccountsStorage, Registration};
pub use self::certificates::{
    CertificateResource, CertificatesStorage, ExportOptions, PfxFormat, StoredCertificate,
};

/// Turn a domain (or certificate id) into a file name.
///
/// `*` becomes `_`, `:` becomes `-`, internationalized names are converted to their ASCII
/// form, the result is lowercased and anything but `[a-z0-9._-]` is dropped. Applying it
/// twice gives the same result as applying it once.
pub fn sanitized_domain(domain: &str) -> String {
    let replaced = domain.replace('*', "_").replace(':', "-");
    let ascii = match idna::domain_to_ascii(&replaced) {
        Ok(a) if !a.is_empty() => a,
        _ => replaced,
    };
    let safe: String = ascii
        .to_ascii_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'))
        .collect();
    safe.trim_start_matches('.').to_string()
}

pub(crate) fn storage_err(path: &Path, e: impl std::fmt::Display) -> Error {
    Error::Storage(format!("{}: {}", path.display(), e))
}

pub(crate) fn create_dir_all(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(dir)
            .map_err(|e| storage_err(dir, e))
    }
    #[cfg(not(unix))]
    {
        fs::create_dir_all(dir).map_err(|e| storage_err(dir, e))
    }
}

pub(crate) fn read_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| storage_err(path, e))
}

/// Write `contents` to a temporary file next to `path`, then rename it over `path`.
///
/// `private` files get mode `0600`.
pub(crate) fn write_atomic(path: &Path, contents: &[u8], private: bool) -> Result<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::Storage(format!("not a file path: {}", path.display())))?;
    let tmp = path.with_file_name(format!(".{}.tmp", file_name));

    let mut opts = fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(if private { 0o600 } else { 0o644 });
    }
    #[cfg(not(unix))]
    let _ = private;

    let write = || -> std::io::Result<()> {
        let mut f = opts.open(&tmp)?;
        f.write_all(contents)?;
        f.sync_all()?;
        // an existing file keeps its mode on open, so set it explicitly.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = if private { 0o600 } else { 0o644 };
            f.set_permissions(fs::Permissions::from_mode(mode))?;
        }
        Ok(())
    };
    if let Err(e) = write() {
        let _ = fs::remove_file(&tmp);
        return Err(storage_err(&tmp, e));
    }

    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        storage_err(path, e)
    })
}
