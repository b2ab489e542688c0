//
use std::sync::Arc;
use url::Url;

use crate::acc::{Account, AcmeKey};
use crate::api::{ApiAccount, ApiDirectory};
use crate::jwt::external_account_binding;
use crate::req::{req_expect_header, req_handle_error, HttpClient};
use crate::trans::{NoncePool, Transport};
use crate::util::read_json;
use crate::{Error, Result};

const LETSENCRYPT: &str = "https://acme-v02.api.letsencrypt.org/directory";
const LETSENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Enumeration of known ACME API directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryUrl {
    /// The main Let's Encrypt directory. Not appropriate for testing and dev.
    LetsEncrypt,
    /// The staging Let's Encrypt directory. Use for testing and dev. Doesn't issue
    /// "valid" certificates. The root signing certificate is not supposed
    /// to be in any trust chains.
    LetsEncryptStaging,
    /// Provide an arbitrary director URL to connect to.
    Other(String),
}

impl Default for DirectoryUrl {
    fn default() -> Self {
        DirectoryUrl::LetsEncrypt
    }
}

impl DirectoryUrl {
    pub fn to_url(&self) -> &str {
        match self {
            DirectoryUrl::LetsEncrypt => LETSENCRYPT,
            DirectoryUrl::LetsEncryptStaging => LETSENCRYPT_STAGING,
            DirectoryUrl::Other(s) => s,
        }
    }

    /// Host (and port) of the directory url, as used in the account storage path.
    ///
    /// `https://localhost:14000/dir` becomes `localhost_14000`. The host is lowercased, so
    /// differently cased urls of one CA share their accounts.
    pub fn storage_host(&self) -> Result<String> {
        let raw = self.to_url();
        let invalid = || Error::Config(format!("invalid directory url: {}", raw));
        let url = Url::parse(raw).map_err(|_| invalid())?;
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(invalid)?
            .to_ascii_lowercase();
        let host = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host,
        };
        Ok(host.replace(':', "_"))
    }
}

/// Credentials for external account binding handed out by the CA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalAccountBinding {
    /// Key identifier given by the CA.
    pub kid: String,
    /// The base64url encoded HMAC key.
    pub hmac_key: String,
}

/// Entry point for accessing an ACME API.
#[derive(Clone)]
pub(crate) struct Directory {
    client: HttpClient,
    nonce_pool: Arc<NoncePool>,
    api_directory: ApiDirectory,
}

impl Directory {
    /// Fetch the directory document.
    pub fn from_url(client: HttpClient, url: &DirectoryUrl) -> Result<Directory> {
        let dir_url = url.to_url();
        debug!("Fetch directory: {}", dir_url);
        let res = req_handle_error(client.get(dir_url))?;
        let api_directory: ApiDirectory = read_json(res)?;
        let nonce_pool = Arc::new(NoncePool::new(client.clone(), &api_directory.newNonce));
        Ok(Directory {
            client,
            nonce_pool,
            api_directory,
        })
    }

    /// Register a new account for the key (or get the existing one, the CA answers with
    /// the existing account when the key is already known).
    pub fn register_account(
        &self,
        acme_key: AcmeKey,
        contact: Vec<String>,
        eab: Option<&ExternalAccountBinding>,
    ) -> Result<Account> {
        let new_account_url = &self.api_directory.newAccount;

        let external = match eab {
            Some(eab) => Some(external_account_binding(
                &eab.kid,
                &eab.hmac_key,
                &acme_key,
                new_account_url,
            )?),
            None if self.api_directory.external_account_required() => {
                return Err(Error::Config(
                    "the CA requires external account binding, but no EAB kid/HMAC key given"
                        .into(),
                ));
            }
            None => None,
        };

        let acc = ApiAccount {
            contact,
            termsOfServiceAgreed: Some(true),
            externalAccountBinding: external,
            ..Default::default()
        };

        debug!("Register account");
        self.account_call(acme_key, &acc)
    }

    /// Look up the account by its key without creating one.
    pub fn resolve_account(&self, acme_key: AcmeKey) -> Result<Account> {
        let acc = ApiAccount {
            onlyReturnExisting: Some(true),
            ..Default::default()
        };
        debug!("Resolve account by key");
        self.account_call(acme_key, &acc)
    }

    /// Account from an already known registration, no API calls involved.
    pub fn account_with_kid(
        &self,
        mut acme_key: AcmeKey,
        kid: &str,
        api_account: ApiAccount,
    ) -> Account {
        acme_key.set_key_id(kid.into());
        let transport = Transport::new(&self.nonce_pool, self.client.clone(), acme_key);
        Account::new(transport, kid, api_account, self.api_directory.clone())
    }

    fn account_call(&self, acme_key: AcmeKey, acc: &ApiAccount) -> Result<Account> {
        let mut transport = Transport::new(&self.nonce_pool, self.client.clone(), acme_key);
        let res = transport.call_jwk(&self.api_directory.newAccount, acc)?;
        let kid = req_expect_header(&res, "location")?;
        debug!("Key id is: {}", kid);
        // fill in the server returned key id
        transport.set_key_id(kid.clone());

        let api_account: ApiAccount = read_json(res)?;

        Ok(Account::new(
            transport,
            &kid,
            api_account,
            self.api_directory.clone(),
        ))
    }

    /// Access the underlying JSON object for debugging.
    pub fn api_directory(&self) -> &ApiDirectory {
        &self.api_directory
    }
}
