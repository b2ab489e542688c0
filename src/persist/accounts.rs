//! Account key and registration per CA server and account id.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use super::{create_dir_all, read_file, storage_err, write_atomic};
use crate::acc::AcmeKey;
use crate::cert::{private_key_from_pem, KeyType};
use crate::Result;

const ACCOUNTS_DIR: &str = "accounts";
const KEYS_DIR: &str = "keys";
const ACCOUNT_FILE: &str = "account.json";

/// Account id used when neither an id nor an email is given.
pub const PLACEHOLDER_ID: &str = "noemail@example.com";

/// The account id: the explicit id, else the email, else [`PLACEHOLDER_ID`].
///
/// [`PLACEHOLDER_ID`]: constant.PLACEHOLDER_ID.html
pub fn account_id(id: Option<&str>, email: Option<&str>) -> String {
    id.or(email)
        .filter(|s| !s.is_empty())
        .unwrap_or(PLACEHOLDER_ID)
        .to_string()
}

/// What the CA told us about the account when it was registered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    /// The account URL.
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contact: Vec<String>,
    #[serde(
        rename = "externalAccountBinding",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub external_account_binding: Option<serde_json::Value>,
}

/// Contents of `account.json`. The private key is kept in its own file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Missing in records written by older versions, see [`AccountsStorage::migrate`].
    ///
    /// [`AccountsStorage::migrate`]: struct.AccountsStorage.html#method.migrate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_type: Option<KeyType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration: Option<Registration>,
}

impl AccountRecord {
    /// Whether the registration is complete enough to use without asking the CA.
    pub fn is_registered(&self) -> bool {
        self.registration
            .as_ref()
            .map(|r| !r.uri.is_empty())
            .unwrap_or(false)
    }
}

/// The directory of one account: `<root>/accounts/<host>/<id>/`.
#[derive(Debug, Clone)]
pub struct AccountsStorage {
    id: String,
    email: Option<String>,
    account_dir: PathBuf,
}

impl AccountsStorage {
    /// `host` is the CA's storage host (see [`DirectoryUrl::storage_host`]).
    ///
    /// [`DirectoryUrl::storage_host`]: ../../enum.DirectoryUrl.html#method.storage_host
    pub fn new(root: &Path, host: &str, id: &str, email: Option<&str>) -> Self {
        let account_dir = root.join(ACCOUNTS_DIR).join(host).join(path_safe(id));
        AccountsStorage {
            id: id.to_string(),
            email: email.map(|s| s.to_string()),
            account_dir,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    pub fn account_dir(&self) -> &Path {
        &self.account_dir
    }

    fn key_file(&self) -> PathBuf {
        key_file(&self.account_dir, &self.id)
    }

    fn record_file(&self) -> PathBuf {
        self.account_dir.join(ACCOUNT_FILE)
    }

    /// Read the account key, or generate one of `key_type` and store it.
    pub(crate) fn load_or_create_key(&self, key_type: KeyType) -> Result<AcmeKey> {
        let path = self.key_file();
        if path.exists() {
            debug!("Load account key {}", path.display());
            let pem = read_file(&path)?;
            return AcmeKey::from_pem(&pem).map_err(|e| storage_err(&path, e));
        }

        info!("No key found for account {}, generating {} key", self.id, key_type);
        let key = AcmeKey::new(key_type)?;
        create_dir_all(&self.account_dir.join(KEYS_DIR))?;
        write_atomic(&path, &key.to_pem()?, true)?;
        Ok(key)
    }

    /// The stored record, `None` when the account was never saved.
    pub fn load_record(&self) -> Result<Option<AccountRecord>> {
        let path = self.record_file();
        if !path.exists() {
            return Ok(None);
        }
        let json = read_file(&path)?;
        let record = serde_json::from_slice(&json).map_err(|e| storage_err(&path, e))?;
        Ok(Some(record))
    }

    pub fn save_record(&self, record: &AccountRecord) -> Result<()> {
        create_dir_all(&self.account_dir)?;
        let json = serde_json::to_vec_pretty(record)?;
        write_atomic(&self.record_file(), &json, true)
    }

    /// Fill in `key_type` for every stored account that lacks it, inferring it from the
    /// key file. Returns the number of records updated.
    pub fn migrate(root: &Path) -> Result<usize> {
        let mut migrated = 0;
        for (dir, mut record) in stored_records(root)? {
            if record.key_type.is_some() {
                continue;
            }
            let key_path = key_file(&dir, &record.id);
            let pem = read_file(&key_path)?;
            let key = private_key_from_pem(&pem)?;
            let key_type = KeyType::infer(&key).map_err(|e| storage_err(&key_path, e))?;
            info!("Account {}: recording key type {}", record.id, key_type);
            record.key_type = Some(key_type);
            let json = serde_json::to_vec_pretty(&record)?;
            write_atomic(&dir.join(ACCOUNT_FILE), &json, true)?;
            migrated += 1;
        }
        Ok(migrated)
    }

    /// All stored accounts as `(CA host, record)`.
    pub fn list(root: &Path) -> Result<Vec<(String, AccountRecord)>> {
        let mut accounts = vec![];
        for (dir, record) in stored_records(root)? {
            let host = dir
                .parent()
                .and_then(|p| p.file_name())
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            accounts.push((host, record));
        }
        Ok(accounts)
    }
}

fn key_file(account_dir: &Path, id: &str) -> PathBuf {
    account_dir.join(KEYS_DIR).join(format!("{}.key", path_safe(id)))
}

/// Ids are usually emails, which are kept as they are apart from path separators.
/// Single path component for an id. `.`, `..` and the empty id would leave the
/// accounts directory, they become underscores.
fn path_safe(id: &str) -> String {
    if id.chars().all(|c| c == '.') {
        return "_".repeat(id.len().max(1));
    }
    id.replace(['/', '\\'], "_")
}

/// `(account dir, record)` for every `account.json` two levels below `<root>/accounts`.
fn stored_records(root: &Path) -> Result<Vec<(PathBuf, AccountRecord)>> {
    let accounts = root.join(ACCOUNTS_DIR);
    if !accounts.exists() {
        return Ok(vec![]);
    }
    let mut found = vec![];
    for host in sorted_dirs(&accounts)? {
        for dir in sorted_dirs(&host)? {
            let path = dir.join(ACCOUNT_FILE);
            if !path.exists() {
                continue;
            }
            let json = read_file(&path)?;
            let record: AccountRecord =
                serde_json::from_slice(&json).map_err(|e| storage_err(&path, e))?;
            found.push((dir, record));
        }
    }
    Ok(found)
}

fn sorted_dirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = vec![];
    for entry in fs::read_dir(dir).map_err(|e| storage_err(dir, e))? {
        let entry = entry.map_err(|e| storage_err(dir, e))?;
        if entry.file_type().map_err(|e| storage_err(dir, e))?.is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}
