use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use hickory_resolver::proto::op::ResponseCode;
use hickory_resolver::proto::rr::{RData, RecordType};
use hickory_resolver::Resolver;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use super::{DnsAnswer, DnsClient, DnsRecord, QueryType, Rcode, RecordData, FALLBACK_RESOLVERS};
use crate::{Error, Result};

/// [`DnsClient`] on the hickory resolver, with caching turned off.
///
/// [`DnsClient`]: trait.DnsClient.html
pub struct HickoryClient {
    recursive: Resolver,
    timeout: Duration,
    // one resolver per authoritative server name.
    authoritative: Mutex<HashMap<String, Arc<Resolver>>>,
}

impl HickoryClient {
    /// Client asking the given resolvers, the system's or the fallback ones when empty.
    pub fn new(resolvers: &[String], timeout: Duration) -> Result<Self> {
        let config = if resolvers.is_empty() {
            match hickory_resolver::system_conf::read_system_conf() {
                Ok((config, _)) => config,
                Err(e) => {
                    debug!("No system resolver configuration ({}), using fallback", e);
                    resolver_config(&fallback_resolvers())?
                }
            }
        } else {
            resolver_config(resolvers)?
        };

        let recursive = Resolver::new(config, options(timeout, true))
            .map_err(|e| Error::DnsTransport(format!("could not create resolver: {}", e)))?;

        Ok(HickoryClient {
            recursive,
            timeout,
            authoritative: Mutex::new(HashMap::new()),
        })
    }

    fn server(&self, server: &str) -> Result<Arc<Resolver>> {
        let mut servers = self
            .authoritative
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(r) = servers.get(server) {
            return Ok(r.clone());
        }

        let ips: Vec<IpAddr> = match server.trim_end_matches('.').parse::<IpAddr>() {
            Ok(ip) => vec![ip],
            Err(_) => self
                .recursive
                .lookup_ip(server)
                .map_err(|e| Error::DnsTransport(format!("could not resolve {}: {}", server, e)))?
                .iter()
                .collect(),
        };

        let group = NameServerConfigGroup::from_ips_clear(&ips, 53, true);
        let config = ResolverConfig::from_parts(None, vec![], group);
        let resolver = Resolver::new(config, options(self.timeout, false))
            .map_err(|e| Error::DnsTransport(format!("could not create resolver: {}", e)))?;
        let resolver = Arc::new(resolver);
        servers.insert(server.to_string(), resolver.clone());
        Ok(resolver)
    }
}

impl DnsClient for HickoryClient {
    fn recursive(&self, name: &str, qtype: QueryType) -> Result<DnsAnswer> {
        query(&self.recursive, name, qtype)
    }

    fn authoritative(&self, server: &str, name: &str, qtype: QueryType) -> Result<DnsAnswer> {
        let resolver = self.server(server)?;
        query(&resolver, name, qtype)
    }
}

fn options(timeout: Duration, recursion_desired: bool) -> ResolverOpts {
    let mut opts = ResolverOpts::default();
    opts.timeout = timeout;
    opts.attempts = 2;
    opts.cache_size = 0;
    opts.use_hosts_file = false;
    opts.preserve_intermediates = true;
    opts.recursion_desired = recursion_desired;
    opts
}

fn fallback_resolvers() -> Vec<String> {
    FALLBACK_RESOLVERS.iter().map(|s| s.to_string()).collect()
}

fn resolver_config(resolvers: &[String]) -> Result<ResolverConfig> {
    let mut group = NameServerConfigGroup::new();
    for r in resolvers {
        let addr = parse_resolver(r)?;
        group.merge(NameServerConfigGroup::from_ips_clear(
            &[addr.ip()],
            addr.port(),
            true,
        ));
    }
    Ok(ResolverConfig::from_parts(None, vec![], group))
}

/// `1.1.1.1`, `1.1.1.1:53`, `[2606:4700::1111]:53` or `2606:4700::1111`.
fn parse_resolver(s: &str) -> Result<SocketAddr> {
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let ip = s
        .trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .map_err(|_| Error::Config(format!("invalid resolver address: {}", s)))?;
    Ok(SocketAddr::new(ip, 53))
}

fn record_type(qtype: QueryType) -> RecordType {
    match qtype {
        QueryType::Txt => RecordType::TXT,
        QueryType::Soa => RecordType::SOA,
        QueryType::Ns => RecordType::NS,
        QueryType::Cname => RecordType::CNAME,
    }
}

fn query(resolver: &Resolver, name: &str, qtype: QueryType) -> Result<DnsAnswer> {
    trace!("dns query {:?} {}", qtype, name);
    match resolver.lookup(name, record_type(qtype)) {
        Ok(lookup) => {
            let records = lookup
                .record_iter()
                .filter_map(|r| {
                    let data = match r.data()? {
                        RData::TXT(txt) => RecordData::Txt(
                            txt.iter()
                                .map(|part| String::from_utf8_lossy(part).into_owned())
                                .collect(),
                        ),
                        RData::SOA(_) => RecordData::Soa,
                        RData::NS(ns) => RecordData::Ns(ns.0.to_ascii()),
                        RData::CNAME(cname) => RecordData::Cname(cname.0.to_ascii()),
                        _ => return None,
                    };
                    Some(DnsRecord {
                        name: r.name().to_ascii(),
                        data,
                    })
                })
                .collect();
            Ok(DnsAnswer {
                rcode: Rcode::NoError,
                records,
            })
        }
        Err(e) => error_answer(name, e),
    }
}

fn error_answer(name: &str, e: ResolveError) -> Result<DnsAnswer> {
    match e.kind() {
        ResolveErrorKind::NoRecordsFound { response_code, .. } => {
            let rcode = match *response_code {
                ResponseCode::NoError => Rcode::NoError,
                ResponseCode::NXDomain => Rcode::NxDomain,
                other => Rcode::Other(other.to_string()),
            };
            Ok(DnsAnswer::empty(rcode))
        }
        _ => Err(Error::DnsTransport(format!("{}: {}", name, e))),
    }
}
