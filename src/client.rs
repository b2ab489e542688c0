//! Command level operations: run, renew, revoke, list and migrate.
//!
//! A [`Client`] is built once per process from [`ClientOptions`]. Building it fetches the
//! directory and loads (or registers) the account, so every later operation talks to the
//! CA as that account.
//!
//! ```no_run
//! use acme_keeper::challenge::{ChallengeConfig, Registry};
//! use acme_keeper::client::{Client, ClientOptions, RunRequest, DEFAULT_PATH};
//! use acme_keeper::DirectoryUrl;
//!
//! fn issue() -> Result<(), acme_keeper::Error> {
//!     let mut options = ClientOptions::new(DirectoryUrl::LetsEncryptStaging, DEFAULT_PATH);
//!     options.account.email = Some("ops@example.com".into());
//!     options.account.accept_tos = true;
//!
//!     let challenge = ChallengeConfig::new()
//!         .webroot("/var/www/html")
//!         .build(&Registry::default())?;
//!
//!     let client = Client::new(options)?;
//!     client.run(&challenge, RunRequest::domains(&["example.com"]))?;
//!     Ok(())
//! }
//! ```
//!
//! [`Client`]: struct.Client.html
//! [`ClientOptions`]: struct.ClientOptions.html
use openssl::pkey::{PKey, Private};
use std::path::{Path, PathBuf};
use std::time::Duration;
use time::OffsetDateTime;

use crate::acc::{Account, AcmeKey};
use crate::api::{ApiAccount, ApiSuggestedWindow};
use crate::cert::{CertInfo, CsrInput, KeyType};
use crate::certifier::{
    check_revocation_reason, revoke_certificate, Certifier, ObtainForCsrRequest, ObtainRequest,
};
use crate::challenge::EnabledChallenge;
use crate::dir::{Directory, DirectoryUrl, ExternalAccountBinding};
use crate::dns::PropagationConfig;
use crate::hook::{Hook, HookEnv, DEFAULT_HOOK_TIMEOUT};
use crate::order::PollSettings;
use crate::persist::accounts::account_id;
use crate::persist::{
    AccountRecord, AccountsStorage, CertificateResource, CertificatesStorage, ExportOptions,
    Registration, StoredCertificate,
};
use crate::renewal::{ari_cert_id, RenewalOptions, RenewalPolicy};
use crate::req::HttpClient;
use crate::wait::Cancel;
use crate::{Error, Result};

/// Storage root used when nothing else is configured, relative to the working directory.
pub const DEFAULT_PATH: &str = ".acme-keeper";

const DEFAULT_USER_AGENT: &str = concat!("acme-keeper/", env!("CARGO_PKG_VERSION"));

/// How the account is identified and registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountOptions {
    /// Contact address, also the account id unless `id` is set.
    pub email: Option<String>,
    pub id: Option<String>,
    /// Type of a newly generated account key.
    pub key_type: KeyType,
    /// External account binding, used only when registering.
    pub eab: Option<ExternalAccountBinding>,
    /// Agree to the CA's terms of service. Registering fails without.
    pub accept_tos: bool,
}

impl Default for AccountOptions {
    fn default() -> Self {
        AccountOptions {
            email: None,
            id: None,
            key_type: KeyType::EC256,
            eab: None,
            accept_tos: false,
        }
    }
}

/// Network timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    /// Timeout of every HTTP request to the CA.
    pub http_timeout: Duration,
    /// Pause between polls of authorizations and orders.
    pub poll_interval: Duration,
    /// Give up polling an authorization or order after this long.
    pub poll_timeout: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Timings {
            http_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(500),
            poll_timeout: Duration::from_secs(90),
        }
    }
}

/// The deploy hook run after every saved certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookOptions {
    pub command: Option<String>,
    pub timeout: Duration,
}

impl Default for HookOptions {
    fn default() -> Self {
        HookOptions {
            command: None,
            timeout: DEFAULT_HOOK_TIMEOUT,
        }
    }
}

/// Everything a [`Client`] is configured with.
///
/// [`Client`]: struct.Client.html
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub server: DirectoryUrl,
    /// Storage root, holding `accounts/`, `certificates/` and `archives/`.
    pub path: PathBuf,
    pub account: AccountOptions,
    /// Type of generated certificate keys.
    pub key_type: KeyType,
    pub export: ExportOptions,
    pub timings: Timings,
    pub propagation: PropagationConfig,
    pub renewal: RenewalOptions,
    pub hook: HookOptions,
    /// Common name of the topmost issuer of the chain to prefer.
    pub preferred_chain: Option<String>,
    pub user_agent: String,
}

impl ClientOptions {
    pub fn new<P: Into<PathBuf>>(server: DirectoryUrl, path: P) -> Self {
        ClientOptions {
            server,
            path: path.into(),
            account: AccountOptions::default(),
            key_type: KeyType::EC256,
            export: ExportOptions::default(),
            timings: Timings::default(),
            propagation: PropagationConfig::default(),
            renewal: RenewalOptions::default(),
            hook: HookOptions::default(),
            preferred_chain: None,
            user_agent: DEFAULT_USER_AGENT.into(),
        }
    }
}

/// What to issue in [`Client::run`].
///
/// [`Client::run`]: struct.Client.html#method.run
#[derive(Default)]
pub struct RunRequest {
    pub domains: Vec<String>,
    /// Issue for this CSR instead, `domains` is then ignored.
    pub csr: Option<CsrInput>,
    /// Key for the new certificate instead of a generated one.
    pub private_key: Option<PKey<Private>>,
}

impl RunRequest {
    pub fn domains<S: AsRef<str>>(domains: &[S]) -> Self {
        RunRequest {
            domains: domains.iter().map(|d| d.as_ref().to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn csr(csr: CsrInput) -> Self {
        RunRequest {
            csr: Some(csr),
            ..Default::default()
        }
    }
}

/// What to renew in [`Client::renew`]. The certificate is found by the first domain.
///
/// [`Client::renew`]: struct.Client.html#method.renew
#[derive(Debug, Clone, Default)]
pub struct RenewRequest {
    pub domains: Vec<String>,
    pub csr: Option<CsrInput>,
}

impl RenewRequest {
    pub fn domains<S: AsRef<str>>(domains: &[S]) -> Self {
        RenewRequest {
            domains: domains.iter().map(|d| d.as_ref().to_string()).collect(),
            csr: None,
        }
    }
}

/// Result of [`Client::renew`].
///
/// [`Client::renew`]: struct.Client.html#method.renew
#[derive(Debug)]
pub enum RenewOutcome {
    /// Nothing to do yet.
    NotDue { not_after: OffsetDateTime },
    Renewed(CertificateResource),
}

/// An account at a CA with its local storage.
pub struct Client {
    options: ClientOptions,
    account: Account,
    accounts: AccountsStorage,
    certificates: CertificatesStorage,
    cancel: Cancel,
}

impl Client {
    /// Fetch the directory and load the account, registering it when the CA doesn't know
    /// the key yet.
    pub fn new(options: ClientOptions) -> Result<Client> {
        let host = options.server.storage_host()?;
        let id = account_id(options.account.id.as_deref(), options.account.email.as_deref());
        let accounts = AccountsStorage::new(
            &options.path,
            &host,
            &id,
            options.account.email.as_deref(),
        );
        let certificates = CertificatesStorage::new(&options.path);

        let client = HttpClient::new(&options.user_agent, options.timings.http_timeout);
        let directory = Directory::from_url(client, &options.server)?;

        let record = accounts.load_record()?;
        let key_type = record
            .as_ref()
            .and_then(|r| r.key_type)
            .unwrap_or(options.account.key_type);
        let key = accounts.load_or_create_key(key_type)?;

        let known = record
            .as_ref()
            .and_then(|r| r.registration.as_ref())
            .filter(|r| !r.uri.is_empty());

        let account = match known {
            Some(reg) => {
                debug!("Account {} registered at {}", id, reg.uri);
                let api_account = ApiAccount {
                    status: reg.status.clone(),
                    contact: reg.contact.clone(),
                    ..Default::default()
                };
                directory.account_with_kid(key, &reg.uri, api_account)
            }
            None => {
                let account = match directory.resolve_account(key.clone()) {
                    Ok(account) => {
                        info!("Account {} recovered from the CA", id);
                        account
                    }
                    Err(Error::Api(p)) if p.is_account_does_not_exist() => {
                        register(&directory, key, &options.account)?
                    }
                    Err(e) => return Err(e),
                };
                let api = account.api_account();
                accounts.save_record(&AccountRecord {
                    id: id.clone(),
                    email: options.account.email.clone(),
                    key_type: Some(key_type),
                    registration: Some(Registration {
                        uri: account.location().to_string(),
                        status: api.status.clone(),
                        contact: api.contact.clone(),
                        external_account_binding: api.externalAccountBinding.clone(),
                    }),
                })?;
                account
            }
        };

        Ok(Client {
            options,
            account,
            accounts,
            certificates,
            cancel: Cancel::new(),
        })
    }

    /// Cancelling aborts every wait of the client's operations with `Error::Cancelled`.
    pub fn cancel_handle(&self) -> Cancel {
        self.cancel.clone()
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn certificates(&self) -> &CertificatesStorage {
        &self.certificates
    }

    /// Obtain a certificate and save it, archiving whatever was stored under its id.
    /// The deploy hook runs after saving.
    pub fn run(&self, challenge: &EnabledChallenge, req: RunRequest) -> Result<CertificateResource> {
        self.check_export(req.csr.is_some())?;
        let certifier = self.certifier(challenge)?;
        let res = self.issue(&certifier, req.domains, req.csr, req.private_key, None)?;
        info!("[{}] Certificate obtained", res.id);
        self.store(&res)?;
        self.deploy(&res.id)?;
        Ok(res)
    }

    /// Renew the stored certificate of the first requested domain, when it is due.
    pub fn renew(&self, challenge: &EnabledChallenge, req: RenewRequest) -> Result<RenewOutcome> {
        self.check_export(req.csr.is_some())?;
        let requested = match &req.csr {
            Some(csr) => csr.domains.clone(),
            None => req.domains.clone(),
        };
        let id = requested
            .first()
            .cloned()
            .ok_or_else(|| Error::Config("no domains to renew".into()))?;

        let stored = self.certificates.read_certificate(&id)?;
        let ari = self.renewal_window(&id, &stored.info);

        let policy = RenewalPolicy::new(self.options.renewal.clone());
        let mut rng = rand::thread_rng();
        let now = OffsetDateTime::now_utc();
        let decision = policy.decide(&stored.info, &requested, ari.as_ref(), now, &mut rng)?;

        if !decision.renew {
            info!(
                "[{}] The certificate expires in {} days, no renewal",
                id,
                (stored.info.not_after - now).whole_days()
            );
            return Ok(RenewOutcome::NotDue {
                not_after: stored.info.not_after,
            });
        }

        if let Some(until) = decision.sleep_until {
            let wait = Duration::try_from(until - now).unwrap_or_default();
            info!("[{}] Sleeping {:?} until the suggested renewal time", id, wait);
            self.cancel.sleep(wait)?;
        }
        policy.jitter_sleep(&self.cancel, &mut rng)?;

        info!(
            "[{}] Trying renewal ({:?}) with {} hours remaining",
            id,
            decision.reason,
            (stored.info.not_after - OffsetDateTime::now_utc()).whole_hours()
        );

        let key = if self.options.renewal.reuse_key && req.csr.is_none() {
            Some(self.certificates.read_private_key(&id)?)
        } else {
            None
        };

        let certifier = self.certifier(challenge)?;
        let res = self.issue(&certifier, decision.domains, req.csr, key, decision.replaces)?;
        info!("[{}] Certificate renewed", res.id);
        self.store(&res)?;
        self.deploy(&res.id)?;
        Ok(RenewOutcome::Renewed(res))
    }

    /// Revoke the stored certificates of `ids`. They are archived unless `keep`.
    pub fn revoke<S: AsRef<str>>(&self, ids: &[S], reason: u8, keep: bool) -> Result<()> {
        check_revocation_reason(reason)?;
        for id in ids {
            let id = id.as_ref();
            info!("[{}] Trying to revoke certificate", id);
            let stored = self.certificates.read_certificate(id)?;
            revoke_certificate(&self.account, &stored.pem, reason)?;
            info!("[{}] Certificate was revoked", id);

            if !keep {
                self.certificates.move_to_archive(id)?;
                info!("[{}] Certificate was archived", id);
            }
        }
        Ok(())
    }

    /// Certificates below the storage root, sorted by id.
    pub fn list(path: &Path) -> Result<Vec<StoredCertificate>> {
        CertificatesStorage::new(path).list()
    }

    /// Accounts below the storage root, by host.
    pub fn list_accounts(path: &Path) -> Result<Vec<(String, AccountRecord)>> {
        AccountsStorage::list(path)
    }

    /// Bring account records written by older versions up to date. Returns how many
    /// were changed.
    pub fn migrate_accounts(path: &Path) -> Result<usize> {
        AccountsStorage::migrate(path)
    }

    fn certifier(&self, challenge: &EnabledChallenge) -> Result<Certifier> {
        let poll = PollSettings {
            interval: self.options.timings.poll_interval,
            timeout: self.options.timings.poll_timeout,
            cancel: self.cancel.clone(),
        };
        Certifier::new(
            self.account.clone(),
            challenge.clone(),
            self.options.key_type,
            poll,
            &self.options.propagation,
        )
    }

    fn check_export(&self, for_csr: bool) -> Result<()> {
        let export = &self.options.export;
        if for_csr && (export.pem || export.pfx) {
            return Err(Error::Config(
                "PEM and PFX export need the private key, which a CSR doesn't carry".into(),
            ));
        }
        Ok(())
    }

    fn issue(
        &self,
        certifier: &Certifier,
        domains: Vec<String>,
        csr: Option<CsrInput>,
        private_key: Option<PKey<Private>>,
        replaces: Option<String>,
    ) -> Result<CertificateResource> {
        let bundle = self.options.export.bundle;
        let preferred_chain = self.options.preferred_chain.clone();
        match csr {
            Some(csr) => certifier.obtain_for_csr(ObtainForCsrRequest {
                csr,
                bundle,
                preferred_chain,
                replaces,
            }),
            None => certifier.obtain(ObtainRequest {
                domains,
                private_key,
                bundle,
                preferred_chain,
                replaces,
            }),
        }
    }

    fn store(&self, res: &CertificateResource) -> Result<()> {
        if self.certificates.exists(&res.id) {
            let moved = self.certificates.move_to_archive(&res.id)?;
            debug!("[{}] Archived {} files", res.id, moved.len());
        }
        self.certificates.save(res, &self.options.export)
    }

    fn deploy(&self, id: &str) -> Result<()> {
        let command = match &self.options.hook.command {
            Some(c) => c,
            None => return Ok(()),
        };
        let env = HookEnv::for_saved(&self.certificates, id, self.accounts.email());
        let hook = Hook::new(command, self.options.hook.timeout);
        hook.run(&env, &self.cancel).map_err(|e| {
            warn!("[{}] Deploy hook failed: {}", id, e);
            e
        })
    }

    fn renewal_window(&self, id: &str, info: &CertInfo) -> Option<ApiSuggestedWindow> {
        if self.options.renewal.ari_disable {
            return None;
        }
        let cert_id = match ari_cert_id(info) {
            Ok(c) => c,
            Err(e) => {
                warn!("[{}] No renewal info: {}", id, e);
                return None;
            }
        };
        match self.account.renewal_info(&cert_id) {
            Ok(Some(ri)) => {
                if let Some(url) = &ri.explanationURL {
                    info!("[{}] The CA explains its renewal window at {}", id, url);
                }
                Some(ri.suggestedWindow)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("[{}] Calling the renewal info endpoint: {}", id, e);
                None
            }
        }
    }
}

fn register(
    directory: &Directory,
    key: AcmeKey,
    opts: &AccountOptions,
) -> Result<Account> {
    if !opts.accept_tos {
        return Err(Error::Config(
            "the CA's terms of service must be accepted to register an account".into(),
        ));
    }
    info!(
        "Registering account {}",
        opts.email.as_deref().unwrap_or("without contact")
    );
    let contact = opts
        .email
        .iter()
        .map(|e| format!("mailto:{}", e))
        .collect();
    directory.register_account(key, contact, opts.eab.as_ref())
}
