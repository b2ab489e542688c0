//! Complete issuance: order, challenges, finalization and download.
//!
//! The [`Certifier`] drives the [order façades] with the one [`EnabledChallenge`] of the
//! run. Every authorization still pending is presented through the challenge's provider,
//! validated by the CA and cleaned up again. Any failing authorization fails the whole
//! issuance.
//!
//! [`Certifier`]: struct.Certifier.html
//! [order façades]: ../order/index.html
//! [`EnabledChallenge`]: ../challenge/struct.EnabledChallenge.html
use openssl::pkey::{PKey, Private};
use std::thread;
use std::time::Duration;

use crate::acc::Account;
use crate::cert::{create_csr, pem_chain_to_der, private_key_to_pem, CsrInput, KeyType};
use crate::challenge::{ChallengeKind, EnabledChallenge};
use crate::dns::{
    challenge_info, PropagationConfig, PropagationVerifier, DEFAULT_POLLING_INTERVAL,
    DEFAULT_PROPAGATION_TIMEOUT,
};
use crate::order::{
    order_failure, Auth, Challenge, ChallengeMarker, CsrOrder, Dns, DownloadedCert, Http,
    OrderState, PollSettings, TlsAlpn,
};
use crate::persist::CertificateResource;
use crate::wait::poll;
use crate::{Error, Result};

/// Issue a certificate for domains, with a key generated (or supplied) here.
pub struct ObtainRequest {
    /// The first domain is the certificate's common name and id.
    pub domains: Vec<String>,
    /// Use this key instead of generating a new one.
    pub private_key: Option<PKey<Private>>,
    /// Keep the issuer chain in the certificate.
    pub bundle: bool,
    /// Common name of the topmost issuer of the chain to prefer.
    pub preferred_chain: Option<String>,
    /// ARI CertID of the certificate being renewed.
    pub replaces: Option<String>,
}

impl ObtainRequest {
    pub fn new<S: AsRef<str>>(domains: &[S]) -> Self {
        ObtainRequest {
            domains: domains.iter().map(|d| d.as_ref().to_string()).collect(),
            private_key: None,
            bundle: true,
            preferred_chain: None,
            replaces: None,
        }
    }
}

/// Issue a certificate for an operator supplied CSR.
pub struct ObtainForCsrRequest {
    pub csr: CsrInput,
    pub bundle: bool,
    pub preferred_chain: Option<String>,
    pub replaces: Option<String>,
}

impl ObtainForCsrRequest {
    pub fn new(csr: CsrInput) -> Self {
        ObtainForCsrRequest {
            csr,
            bundle: true,
            preferred_chain: None,
            replaces: None,
        }
    }
}

struct Prepared<A> {
    domain: String,
    key_auth: String,
    challenge: Challenge<A>,
}

/// Obtains certificates for an account using one challenge type.
pub struct Certifier {
    account: Account,
    challenge: EnabledChallenge,
    verifier: Option<PropagationVerifier>,
    key_type: KeyType,
    poll: PollSettings,
}

impl Certifier {
    /// A `dns-01` challenge gets a propagation check on top of `propagation`.
    pub fn new(
        account: Account,
        challenge: EnabledChallenge,
        key_type: KeyType,
        poll: PollSettings,
        propagation: &PropagationConfig,
    ) -> Result<Certifier> {
        let verifier = if challenge.kind() == ChallengeKind::Dns01 {
            Some(PropagationVerifier::from_config(propagation.clone())?)
        } else {
            None
        };
        Ok(Certifier {
            account,
            challenge,
            verifier,
            key_type,
            poll,
        })
    }

    /// Replace the propagation check.
    pub fn with_verifier(mut self, verifier: PropagationVerifier) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    /// Obtain a certificate for the request's domains.
    pub fn obtain(&self, req: ObtainRequest) -> Result<CertificateResource> {
        let mut domains: Vec<String> = vec![];
        for d in req.domains {
            if !domains.contains(&d) {
                domains.push(d);
            }
        }
        if domains.is_empty() {
            return Err(Error::Config("no domains to obtain a certificate for".into()));
        }
        self.check_wildcards(&domains)?;

        info!("[{}] acme: Obtaining bundled SAN certificate", domains.join(", "));

        let csr_order = self.authorize(&domains, req.replaces.as_deref())?;

        let key = match req.private_key {
            Some(key) => key,
            None => self.key_type.generate()?,
        };
        let names: Vec<&str> = domains.iter().map(|d| d.as_str()).collect();
        let csr = create_csr(&key, &names)?;

        let cert = self.finalize(
            csr_order,
            &csr.to_der()?,
            req.bundle,
            req.preferred_chain.as_deref(),
            &domains[0],
        )?;

        Ok(CertificateResource {
            id: domains[0].clone(),
            domains,
            cert_url: cert.url.clone(),
            cert_stable_url: cert.url,
            certificate: cert.certificate.into_bytes(),
            issuer_certificate: Some(cert.issuer_certificate.into_bytes()),
            private_key: Some(private_key_to_pem(&key)?),
            csr: Some(csr.to_pem()?),
        })
    }

    /// Obtain a certificate for the names in a CSR. The resource has no private key.
    pub fn obtain_for_csr(&self, req: ObtainForCsrRequest) -> Result<CertificateResource> {
        let domains = req.csr.domains.clone();
        self.check_wildcards(&domains)?;

        info!("[{}] acme: Obtaining SAN certificate given a CSR", domains.join(", "));

        let csr_order = self.authorize(&domains, req.replaces.as_deref())?;
        let cert = self.finalize(
            csr_order,
            &req.csr.der,
            req.bundle,
            req.preferred_chain.as_deref(),
            &domains[0],
        )?;

        Ok(CertificateResource {
            id: domains[0].clone(),
            domains,
            cert_url: cert.url.clone(),
            cert_stable_url: cert.url,
            certificate: cert.certificate.into_bytes(),
            issuer_certificate: Some(cert.issuer_certificate.into_bytes()),
            private_key: None,
            csr: Some(req.csr.pem),
        })
    }

    /// Revoke a certificate (PEM, the leaf first) with an RFC 5280 reason code.
    pub fn revoke(&self, cert_pem: &[u8], reason: u8) -> Result<()> {
        revoke_certificate(&self.account, cert_pem, reason)
    }

    fn check_wildcards(&self, domains: &[String]) -> Result<()> {
        if self.challenge.kind() == ChallengeKind::Dns01 {
            return Ok(());
        }
        match domains.iter().find(|d| d.starts_with("*.")) {
            Some(wildcard) => Err(Error::Config(format!(
                "{} is a wildcard, which can only be validated with dns-01 (enabled: {})",
                wildcard,
                self.challenge.kind()
            ))),
            None => Ok(()),
        }
    }

    /// Create the order and get all its authorizations valid.
    fn authorize(&self, domains: &[String], replaces: Option<&str>) -> Result<CsrOrder> {
        let names: Vec<&str> = domains.iter().map(|d| d.as_str()).collect();
        let mut order = self.account.new_order(&names, replaces)?;

        self.solve(order.authorizations()?)?;

        let poll_settings = &self.poll;
        poll(
            "order authorization",
            poll_settings.interval,
            poll_settings.timeout,
            &poll_settings.cancel,
            || {
                order.refresh()?;
                if let Some(csr_order) = order.confirm_validations() {
                    return Ok(Some(csr_order));
                }
                if order.state() == OrderState::Invalid {
                    warn!("[{}] acme: order is invalid", domains[0]);
                    return Err(order_failure(order.api_order()));
                }
                Ok(None)
            },
        )
    }

    fn finalize(
        &self,
        csr_order: CsrOrder,
        csr_der: &[u8],
        bundle: bool,
        preferred_chain: Option<&str>,
        label: &str,
    ) -> Result<DownloadedCert> {
        info!("[{}] acme: Validations succeeded; requesting certificates", label);
        let cert_order = csr_order.finalize_csr(csr_der, &self.poll)?;
        let cert = cert_order.download(bundle, preferred_chain)?;
        info!("[{}] Server responded with a certificate.", label);
        Ok(cert)
    }

    fn solve(&self, auths: Vec<Auth>) -> Result<()> {
        let pending: Vec<Auth> = auths
            .into_iter()
            .filter(|auth| {
                if auth.need_challenge() {
                    true
                } else {
                    info!(
                        "[{}] acme: authorization already valid; skipping challenge",
                        auth.targeted_domain()
                    );
                    false
                }
            })
            .collect();
        if pending.is_empty() {
            return Ok(());
        }

        match self.challenge.kind() {
            ChallengeKind::Http01 => self.solve_with::<Http>(&pending),
            ChallengeKind::Dns01 => self.solve_with::<Dns>(&pending),
            ChallengeKind::TlsAlpn01 => self.solve_with::<TlsAlpn>(&pending),
        }
    }

    fn solve_with<A: ChallengeMarker>(&self, auths: &[Auth]) -> Result<()> {
        let mut prepared = Vec::with_capacity(auths.len());
        for auth in auths {
            let domain = auth.targeted_domain();
            let challenge = auth.challenge::<A>().ok_or_else(|| Error::Authorization {
                domain: domain.clone(),
                challenge: A::KIND.as_str().to_string(),
                detail: "the CA did not offer this challenge type".into(),
            })?;
            let key_auth = challenge.key_authorization()?;
            prepared.push(Prepared {
                domain,
                key_auth,
                challenge,
            });
        }

        match self.challenge.provider().sequential() {
            Some(interval) => self.solve_sequentially(&prepared, interval),
            None => self.solve_concurrently(&prepared),
        }
    }

    /// Present everything at once, then validate one by one.
    fn solve_concurrently<A: ChallengeMarker>(&self, prepared: &[Prepared<A>]) -> Result<()> {
        let provider = self.challenge.provider();
        let kind = A::KIND;
        let jobs: Vec<(&str, &str, &str)> = prepared
            .iter()
            .map(|p| (p.domain.as_str(), p.challenge.token(), p.key_auth.as_str()))
            .collect();

        let presented: Vec<Result<()>> = thread::scope(|s| {
            let handles: Vec<_> = jobs
                .iter()
                .map(|&(domain, token, key_auth)| {
                    s.spawn(move || {
                        info!("[{}] acme: Preparing to solve {}", domain, kind);
                        provider.present(domain, token, key_auth)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join()
                        .unwrap_or_else(|_| Err(Error::Other("challenge provider panicked".into())))
                })
                .collect()
        });

        let mut failure = None;
        for (p, present) in prepared.iter().zip(presented) {
            if failure.is_none() {
                if let Err(e) = present.and_then(|_| self.validate(p)) {
                    failure = Some(e);
                }
            } else if let Err(e) = present {
                debug!("[{}] acme: present failed too: {}", p.domain, e);
            }
            self.clean_up(p);
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// One identifier at a time, sleeping `interval` in between.
    fn solve_sequentially<A: ChallengeMarker>(
        &self,
        prepared: &[Prepared<A>],
        interval: Duration,
    ) -> Result<()> {
        let provider = self.challenge.provider();
        for (i, p) in prepared.iter().enumerate() {
            if i > 0 {
                info!("sequence: wait for {:?}", interval);
                self.poll.cancel.sleep(interval)?;
            }
            info!("[{}] acme: Preparing to solve {}", p.domain, A::KIND);
            let result = provider
                .present(&p.domain, p.challenge.token(), &p.key_auth)
                .and_then(|_| self.validate(p));
            self.clean_up(p);
            result?;
        }
        Ok(())
    }

    fn validate<A: ChallengeMarker>(&self, p: &Prepared<A>) -> Result<()> {
        if A::KIND == ChallengeKind::Dns01 {
            self.wait_for_propagation(p)?;
        }
        info!("[{}] acme: Trying to solve {}", p.domain, A::KIND);
        p.challenge.validate(&self.poll)?;
        info!("[{}] The server validated our request", p.domain);
        Ok(())
    }

    fn wait_for_propagation<A: ChallengeMarker>(&self, p: &Prepared<A>) -> Result<()> {
        let verifier = match &self.verifier {
            Some(v) => v,
            None => return Ok(()),
        };
        let record = challenge_info(&p.domain, &p.key_auth);
        let (timeout, interval) = self
            .challenge
            .provider()
            .timeout()
            .unwrap_or((DEFAULT_PROPAGATION_TIMEOUT, DEFAULT_POLLING_INTERVAL));
        info!(
            "[{}] acme: Checking DNS record propagation of {}",
            p.domain, record.fqdn
        );
        verifier.wait(&record.fqdn, &record.value, timeout, interval, &self.poll.cancel)
    }

    fn clean_up<A: ChallengeMarker>(&self, p: &Prepared<A>) {
        let provider = self.challenge.provider();
        if let Err(e) = provider.clean_up(&p.domain, p.challenge.token(), &p.key_auth) {
            warn!("[{}] acme: cleaning up failed: {}", p.domain, e);
        }
    }
}

/// Reason codes of RFC 5280 §5.3.1, 7 is unused.
pub fn check_revocation_reason(reason: u8) -> Result<()> {
    if reason > 10 || reason == 7 {
        return Err(Error::Config(format!(
            "invalid revocation reason: {} (0-10, except 7)",
            reason
        )));
    }
    Ok(())
}

pub(crate) fn revoke_certificate(account: &Account, cert_pem: &[u8], reason: u8) -> Result<()> {
    check_revocation_reason(reason)?;
    let ders = pem_chain_to_der(cert_pem)?;
    let leaf = ders
        .first()
        .ok_or_else(|| Error::Storage("no certificate to revoke".into()))?;
    account.revoke_certificate(leaf, reason)
}
