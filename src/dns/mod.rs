//! DNS-01 propagation check.
//!
//! Before the CA is asked to validate a `dns-01` challenge, the `TXT` record must be
//! visible on the zone's authoritative name servers. Caching resolvers are only used to
//! find those servers: CNAMEs from the challenge name are followed, the zone is found by
//! walking up the name looking for its SOA, and the zone's NS records name the servers
//! that are then asked directly, without recursion.
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::order::dns_txt_value;
use crate::wait::{poll, Cancel};
use crate::{Error, Result};

mod hickory;

pub use self::hickory::HickoryClient;

/// Resolvers used when none are configured and the system configuration can't be read.
pub const FALLBACK_RESOLVERS: &[&str] = &["8.8.8.8:53", "1.1.1.1:53"];

/// Default propagation timeout for providers not declaring one.
pub const DEFAULT_PROPAGATION_TIMEOUT: Duration = Duration::from_secs(60);

/// Default polling interval for providers not declaring one.
pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(2);

const MAX_CNAME_HOPS: usize = 50;

/// Record types the check asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryType {
    Txt,
    Soa,
    Ns,
    Cname,
}

/// Response code of an answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rcode {
    NoError,
    NxDomain,
    /// Any other code, e.g. `SERVFAIL` or `REFUSED`.
    Other(String),
}

/// Record data we care about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordData {
    Txt(String),
    Soa,
    Ns(String),
    Cname(String),
}

/// An answer record with its owner name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    pub name: String,
    pub data: RecordData,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsAnswer {
    pub rcode: Rcode,
    pub records: Vec<DnsRecord>,
}

impl DnsAnswer {
    pub fn empty(rcode: Rcode) -> Self {
        DnsAnswer {
            rcode,
            records: vec![],
        }
    }
}

/// The DNS queries needed by the propagation check.
///
/// Failure to carry out a query (no answer, network error) is `Error::DnsTransport`. An
/// answer with an error code is a successful query with a non `NoError` [`Rcode`].
///
/// [`Rcode`]: enum.Rcode.html
pub trait DnsClient: Send + Sync {
    /// Query through the configured recursive resolvers.
    fn recursive(&self, name: &str, qtype: QueryType) -> Result<DnsAnswer>;

    /// Query the named server directly with recursion turned off.
    fn authoritative(&self, server: &str, name: &str, qtype: QueryType) -> Result<DnsAnswer>;
}

/// Settings of the propagation check.
#[derive(Debug, Clone)]
pub struct PropagationConfig {
    /// Recursive resolvers (`host` or `host:port`). Empty means the system configuration,
    /// or [`FALLBACK_RESOLVERS`] when that can't be read.
    ///
    /// [`FALLBACK_RESOLVERS`]: constant.FALLBACK_RESOLVERS.html
    pub resolvers: Vec<String>,
    /// Per query timeout.
    pub query_timeout: Duration,
    /// Every authoritative server must serve the record, not just one of them.
    pub require_all_authoritative: bool,
    /// Skip checking and just wait this long after presenting.
    pub fixed_wait: Option<Duration>,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        PropagationConfig {
            resolvers: vec![],
            query_timeout: Duration::from_secs(10),
            require_all_authoritative: true,
            fixed_wait: None,
        }
    }
}

/// Name and value of the `TXT` record answering a `dns-01` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeInfo {
    /// `_acme-challenge.<domain>.`
    pub fqdn: String,
    pub value: String,
}

/// The record for `domain` (a leading `*.` is dropped) and key authorization.
pub fn challenge_info(domain: &str, key_auth: &str) -> ChallengeInfo {
    let domain = domain.strip_prefix("*.").unwrap_or(domain);
    ChallengeInfo {
        fqdn: to_fqdn(&format!("_acme-challenge.{}", domain)),
        value: dns_txt_value(key_auth),
    }
}

/// Lowercase with a single trailing dot.
pub(crate) fn to_fqdn(name: &str) -> String {
    format!("{}.", name.trim_end_matches('.').to_ascii_lowercase())
}

fn same_name(a: &str, b: &str) -> bool {
    to_fqdn(a) == to_fqdn(b)
}

/// Waits for `TXT` records to show up on the authoritative servers.
#[derive(Clone)]
pub struct PropagationVerifier {
    client: Arc<dyn DnsClient>,
    config: PropagationConfig,
}

impl PropagationVerifier {
    pub fn new(client: Arc<dyn DnsClient>, config: PropagationConfig) -> Self {
        PropagationVerifier { client, config }
    }

    /// Verifier on top of hickory using the configured resolvers.
    pub fn from_config(config: PropagationConfig) -> Result<Self> {
        let client = HickoryClient::new(&config.resolvers, config.query_timeout)?;
        Ok(PropagationVerifier::new(Arc::new(client), config))
    }

    pub fn config(&self) -> &PropagationConfig {
        &self.config
    }

    /// Block until `value` is served for `fqdn`, or fail.
    ///
    /// Zone and name server discovery happen once, failing immediately. The servers are
    /// then polled every `interval` until `timeout`, which gives
    /// `Error::PropagationTimeout`, or `Error::DnsTransport` if the last round failed to
    /// reach a server.
    pub fn wait(
        &self,
        fqdn: &str,
        value: &str,
        timeout: Duration,
        interval: Duration,
        cancel: &Cancel,
    ) -> Result<()> {
        if let Some(fixed) = self.config.fixed_wait {
            info!("Waiting {:?} for {} to propagate", fixed, fqdn);
            return cancel.sleep(fixed);
        }

        let target = self.follow_cnames(fqdn)?;
        let zone = self.find_zone(&target)?;
        let servers = self.authoritative_servers(&zone)?;
        debug!(
            "Checking {} (zone {}) on {}",
            target,
            zone,
            servers.join(", ")
        );

        let mut last_transport: Option<String> = None;
        let result = poll("dns propagation", interval, timeout, cancel, || {
            match self.check_servers(&servers, &target, value) {
                Ok(true) => return Ok(Some(())),
                Ok(false) => {
                    last_transport = None;
                    debug!("{} not yet propagated", target);
                }
                Err(Error::DnsTransport(e)) => {
                    debug!("{}: {}", target, e);
                    last_transport = Some(e);
                }
                Err(e) => {
                    debug!("{}: {}", target, e);
                    last_transport = None;
                }
            }
            Ok(None)
        });

        match result {
            Err(Error::Timeout { elapsed, .. }) => match last_transport {
                Some(e) => Err(Error::DnsTransport(e)),
                None => Err(Error::PropagationTimeout {
                    fqdn: fqdn.to_string(),
                    elapsed,
                }),
            },
            r => r,
        }
    }

    /// Follow the CNAME chain starting at `fqdn`, returning the last name.
    pub(crate) fn follow_cnames(&self, fqdn: &str) -> Result<String> {
        let mut name = to_fqdn(fqdn);
        let mut seen = HashSet::new();
        seen.insert(name.clone());

        for _ in 0..MAX_CNAME_HOPS {
            let answer = match self.client.recursive(&name, QueryType::Txt) {
                Ok(a) => a,
                Err(e) => {
                    debug!("CNAME lookup for {} failed: {}", name, e);
                    return Ok(name);
                }
            };
            let next = answer.records.iter().find_map(|r| match &r.data {
                RecordData::Cname(target) if same_name(&r.name, &name) => Some(to_fqdn(target)),
                _ => None,
            });
            match next {
                Some(target) => {
                    debug!("Following CNAME {} -> {}", name, target);
                    if !seen.insert(target.clone()) {
                        return Err(Error::DnsResolution(format!(
                            "circular CNAME chain at {}",
                            target
                        )));
                    }
                    name = target;
                }
                None => return Ok(name),
            }
        }

        Err(Error::DnsResolution(format!(
            "more than {} CNAMEs following {}",
            MAX_CNAME_HOPS, fqdn
        )))
    }

    /// Find the zone apex of `fqdn` by asking for the SOA of each suffix.
    pub(crate) fn find_zone(&self, fqdn: &str) -> Result<String> {
        let fqdn = to_fqdn(fqdn);
        let labels: Vec<&str> = fqdn.trim_end_matches('.').split('.').collect();

        let mut attempts = 0;
        let mut transport_failures = 0;
        let mut last_transport: Option<Error> = None;

        for i in 0..labels.len() {
            let domain = to_fqdn(&labels[i..].join("."));
            attempts += 1;

            let answer = match self.client.recursive(&domain, QueryType::Soa) {
                Ok(a) => a,
                Err(e) => {
                    debug!("SOA lookup for {} failed: {}", domain, e);
                    transport_failures += 1;
                    last_transport = Some(e);
                    continue;
                }
            };

            match &answer.rcode {
                Rcode::NoError => {
                    let is_cname = answer
                        .records
                        .iter()
                        .any(|r| matches!(r.data, RecordData::Cname(_)));
                    if is_cname {
                        continue;
                    }
                    let soa = answer
                        .records
                        .iter()
                        .find(|r| r.data == RecordData::Soa && same_name(&r.name, &domain));
                    if let Some(soa) = soa {
                        return Ok(to_fqdn(&soa.name));
                    }
                }
                Rcode::NxDomain => {}
                Rcode::Other(code) => {
                    return Err(Error::DnsResolution(format!(
                        "unexpected response {} for SOA of {}",
                        code, domain
                    )));
                }
            }
        }

        // the name could not be looked up at all.
        if transport_failures == attempts {
            if let Some(e) = last_transport {
                return Err(e);
            }
        }

        Err(Error::DnsZoneNotFound { fqdn })
    }

    /// The name servers of `zone`.
    pub(crate) fn authoritative_servers(&self, zone: &str) -> Result<Vec<String>> {
        let answer = self.client.recursive(zone, QueryType::Ns)?;
        if answer.rcode != Rcode::NoError {
            return Err(Error::DnsResolution(format!(
                "NS lookup for {} answered {:?}",
                zone, answer.rcode
            )));
        }
        let mut servers: Vec<String> = answer
            .records
            .iter()
            .filter_map(|r| match &r.data {
                RecordData::Ns(ns) => Some(to_fqdn(ns)),
                _ => None,
            })
            .collect();
        servers.sort();
        servers.dedup();
        if servers.is_empty() {
            return Err(Error::DnsResolution(format!(
                "could not determine authoritative nameservers for {}",
                zone
            )));
        }
        Ok(servers)
    }

    fn check_servers(&self, servers: &[String], fqdn: &str, value: &str) -> Result<bool> {
        let require_all = self.config.require_all_authoritative;
        let mut error = None;
        let mut answered = false;

        for server in servers {
            let found = match self.served_by(server, fqdn, value) {
                Ok(found) => found,
                Err(e) if require_all => return Err(e),
                Err(e) => {
                    debug!("{}: {}", server, e);
                    error = Some(e);
                    continue;
                }
            };
            answered = true;
            if found && !require_all {
                return Ok(true);
            }
            if !found && require_all {
                debug!("{} does not serve the record yet", server);
                return Ok(false);
            }
        }

        // without requiring all, a server that answered "not yet" outweighs unreachable ones.
        match error {
            Some(e) if !answered => Err(e),
            _ => Ok(require_all),
        }
    }

    fn served_by(&self, server: &str, fqdn: &str, value: &str) -> Result<bool> {
        let answer = self.client.authoritative(server, fqdn, QueryType::Txt)?;
        match &answer.rcode {
            Rcode::NoError | Rcode::NxDomain => {}
            Rcode::Other(code) => {
                return Err(Error::DnsResolution(format!(
                    "{} answered {} for {}",
                    server, code, fqdn
                )));
            }
        }
        Ok(answer
            .records
            .iter()
            .any(|r| matches!(&r.data, RecordData::Txt(txt) if txt == value)))
    }
}
