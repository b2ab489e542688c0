//! Challenge providers and the selection of the one challenge type used per run.
//!
//! A [`Provider`] makes a challenge response visible to the CA: a file on a web server for
//! `http-01`, a `TXT` record for `dns-01` or a certificate served for `tls-alpn-01`. DNS
//! providers are looked up by name in a [`Registry`]. [`ChallengeConfig`] turns the
//! operator's choice into exactly one [`EnabledChallenge`].
//!
//! [`Provider`]: trait.Provider.html
//! [`Registry`]: struct.Registry.html
//! [`ChallengeConfig`]: struct.ChallengeConfig.html
//! [`EnabledChallenge`]: struct.EnabledChallenge.html
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::{Error, Result};

mod exec;
mod webroot;

pub use self::exec::ExecProvider;
pub use self::webroot::WebrootProvider;

/// The ACME challenge types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChallengeKind {
    Http01,
    Dns01,
    TlsAlpn01,
}

impl ChallengeKind {
    /// The challenge `type` as used by the ACME API.
    pub const fn as_str(self) -> &'static str {
        match self {
            ChallengeKind::Http01 => "http-01",
            ChallengeKind::Dns01 => "dns-01",
            ChallengeKind::TlsAlpn01 => "tls-alpn-01",
        }
    }
}

impl fmt::Display for ChallengeKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Makes challenge responses available to the CA.
///
/// `present` and `clean_up` receive the domain as ordered (with `*.` for wildcards), the
/// challenge token and the key authorization.
///
/// Implementations are shared between threads when identifiers are presented concurrently.
pub trait Provider: Send + Sync {
    /// Publish the challenge response.
    fn present(&self, domain: &str, token: &str, key_auth: &str) -> Result<()>;

    /// Remove what `present` published.
    fn clean_up(&self, domain: &str, token: &str, key_auth: &str) -> Result<()>;

    /// Propagation timeout and polling interval for DNS providers.
    ///
    /// `None` uses the defaults of the propagation check.
    fn timeout(&self) -> Option<(Duration, Duration)> {
        None
    }

    /// Interval between identifiers for providers that can't be used concurrently.
    ///
    /// When set, identifiers are handled one at a time: present, validate, clean up, then
    /// sleep the interval before the next one.
    fn sequential(&self) -> Option<Duration> {
        None
    }
}

/// Settings handed to a provider constructor, typically taken from the environment.
pub type ProviderSettings = HashMap<String, String>;

/// Constructor of a named DNS provider.
pub type ProviderConstructor = fn(&ProviderSettings) -> Result<Box<dyn Provider>>;

/// Named DNS providers.
///
/// `Registry::default()` knows the built-in `exec` provider. Other providers are added with
/// [`register`].
///
/// [`register`]: struct.Registry.html#method.register
#[derive(Clone)]
pub struct Registry {
    constructors: HashMap<String, ProviderConstructor>,
}

impl Default for Registry {
    fn default() -> Self {
        let mut registry = Registry::empty();
        registry.register("exec", ExecProvider::from_settings);
        registry
    }
}

impl Registry {
    /// A registry without any providers.
    pub fn empty() -> Self {
        Registry {
            constructors: HashMap::new(),
        }
    }

    /// Add (or replace) a provider constructor.
    pub fn register(&mut self, name: &str, constructor: ProviderConstructor) {
        self.constructors.insert(name.to_string(), constructor);
    }

    /// Registered provider names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.constructors.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Construct the provider registered under `name`.
    pub fn create(&self, name: &str, settings: &ProviderSettings) -> Result<Box<dyn Provider>> {
        let constructor = self
            .constructors
            .get(name)
            .ok_or_else(|| Error::Config(format!("unrecognized DNS provider: {}", name)))?;
        constructor(settings)
    }
}

#[derive(Clone)]
enum Source {
    Webroot(PathBuf),
    Http(Arc<dyn Provider>),
    TlsAlpn(Arc<dyn Provider>),
    Dns(String, ProviderSettings),
    DnsCustom(Arc<dyn Provider>),
}

impl Source {
    fn kind(&self) -> ChallengeKind {
        match self {
            Source::Webroot(_) | Source::Http(_) => ChallengeKind::Http01,
            Source::TlsAlpn(_) => ChallengeKind::TlsAlpn01,
            Source::Dns(..) | Source::DnsCustom(_) => ChallengeKind::Dns01,
        }
    }

    fn describe(&self) -> String {
        match self {
            Source::Webroot(p) => format!("webroot {}", p.display()),
            Source::Http(_) => "custom http-01 provider".into(),
            Source::TlsAlpn(_) => "custom tls-alpn-01 provider".into(),
            Source::Dns(name, _) => format!("dns provider {}", name),
            Source::DnsCustom(_) => "custom dns-01 provider".into(),
        }
    }
}

/// The operator's challenge selection.
///
/// Exactly one source must be chosen. Choosing none, choosing several, or excluding the
/// type of the chosen source are configuration errors, reported by [`build`] before any
/// request reaches the CA.
///
/// ```
/// use acme_keeper::challenge::{ChallengeConfig, ChallengeKind, Registry};
///
/// let enabled = ChallengeConfig::new()
///     .webroot("/var/www/html")
///     .exclude(ChallengeKind::Dns01)
///     .build(&Registry::default())
///     .unwrap();
/// assert_eq!(enabled.kind(), ChallengeKind::Http01);
/// ```
///
/// [`build`]: struct.ChallengeConfig.html#method.build
#[derive(Clone, Default)]
pub struct ChallengeConfig {
    sources: Vec<Source>,
    excluded: Vec<ChallengeKind>,
}

impl ChallengeConfig {
    pub fn new() -> Self {
        ChallengeConfig::default()
    }

    /// Answer `http-01` by writing files below a web server's document root.
    pub fn webroot<P: Into<PathBuf>>(mut self, root: P) -> Self {
        self.sources.push(Source::Webroot(root.into()));
        self
    }

    /// Answer `http-01` with a custom provider.
    pub fn http(mut self, provider: Arc<dyn Provider>) -> Self {
        self.sources.push(Source::Http(provider));
        self
    }

    /// Answer `tls-alpn-01` with a custom provider.
    pub fn tls_alpn(mut self, provider: Arc<dyn Provider>) -> Self {
        self.sources.push(Source::TlsAlpn(provider));
        self
    }

    /// Answer `dns-01` with a provider from the registry.
    pub fn dns(mut self, name: &str, settings: ProviderSettings) -> Self {
        self.sources.push(Source::Dns(name.to_string(), settings));
        self
    }

    /// Answer `dns-01` with a custom provider.
    pub fn dns_custom(mut self, provider: Arc<dyn Provider>) -> Self {
        self.sources.push(Source::DnsCustom(provider));
        self
    }

    /// Never use the given challenge type.
    pub fn exclude(mut self, kind: ChallengeKind) -> Self {
        if !self.excluded.contains(&kind) {
            self.excluded.push(kind);
        }
        self
    }

    /// Validate the selection and construct its provider.
    pub fn build(&self, registry: &Registry) -> Result<EnabledChallenge> {
        let source = match self.sources.as_slice() {
            [] => {
                return Err(Error::Config(
                    "no challenge selected, choose one of webroot, http, tls-alpn or dns".into(),
                ))
            }
            [one] => one,
            many => {
                let names: Vec<String> = many.iter().map(|s| s.describe()).collect();
                return Err(Error::Config(format!(
                    "only one challenge can be selected, got: {}",
                    names.join(", ")
                )));
            }
        };

        let kind = source.kind();
        if self.excluded.contains(&kind) {
            return Err(Error::Config(format!(
                "{} is selected through {} but also excluded",
                kind,
                source.describe()
            )));
        }

        let provider: Arc<dyn Provider> = match source {
            Source::Webroot(root) => Arc::new(WebrootProvider::new(root)),
            Source::Http(p) | Source::TlsAlpn(p) | Source::DnsCustom(p) => p.clone(),
            Source::Dns(name, settings) => Arc::from(registry.create(name, settings)?),
        };

        debug!("Enabled challenge {} using {}", kind, source.describe());

        Ok(EnabledChallenge { kind, provider })
    }
}

/// The single challenge type used for every authorization, with its provider.
#[derive(Clone)]
pub struct EnabledChallenge {
    kind: ChallengeKind,
    provider: Arc<dyn Provider>,
}

impl EnabledChallenge {
    pub fn kind(&self) -> ChallengeKind {
        self.kind
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }
}

impl fmt::Debug for EnabledChallenge {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("EnabledChallenge")
            .field("kind", &self.kind)
            .finish()
    }
}
