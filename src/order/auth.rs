//
use openssl::sha::sha256;
use std::sync::Arc;

use crate::acc::AccountInner;
use crate::api::{ApiAuth, ApiChallenge, ApiEmptyObject, ApiEmptyString};
use crate::challenge::ChallengeKind;
use crate::jwt::key_authorization;
use crate::order::PollSettings;
use crate::util::{base64url, read_json};
use crate::wait::poll;
use crate::{Error, Result};

/// An authorization ([ownership proof]) for a domain name.
///
/// Each authorization for an order much be progressed to a valid state before the ACME API
/// will issue a certificate.
///
/// Authorizations may or may not be required depending on previous orders against the same
/// ACME account. The ACME API decides if the authorization is needed.
///
/// [ownership proof]: ../index.html#domain-ownership
pub struct Auth {
    inner: Arc<AccountInner>,
    api_auth: ApiAuth,
    auth_url: String,
}

impl Auth {
    pub(crate) fn new(inner: &Arc<AccountInner>, api_auth: ApiAuth, auth_url: &str) -> Self {
        Auth {
            inner: inner.clone(),
            api_auth,
            auth_url: auth_url.into(),
        }
    }

    /// Domain name for this authorization.
    ///
    /// For wildcard orders this is the name without the `*.` prefix.
    pub fn domain_name(&self) -> &str {
        &self.api_auth.identifier.value
    }

    /// The name as it was ordered, including `*.` for wildcards.
    pub fn targeted_domain(&self) -> String {
        if self.api_auth.wildcard() {
            format!("*.{}", self.domain_name())
        } else {
            self.domain_name().to_string()
        }
    }

    /// Whether we actually need to do the authorization. This might not be needed if we have
    /// proven ownership of the domain recently in a previous order.
    pub fn need_challenge(&self) -> bool {
        !self.api_auth.is_status_valid()
    }

    /// The challenge of type `A`, if the CA offered one.
    pub fn challenge<A: ChallengeMarker>(&self) -> Option<Challenge<A>> {
        self.api_auth
            .challenge(A::KIND.as_str())
            .map(|c| Challenge::new(&self.inner, c.clone(), &self.auth_url, self.targeted_domain()))
    }

    /// Get the http challenge.
    ///
    /// The http challenge must be placed so it is accessible under:
    ///
    /// ```text
    /// http://<domain-to-be-proven>/.well-known/acme-challenge/<token>
    /// ```
    ///
    /// The challenge will be accessed over HTTP (not HTTPS), for obvious reasons.
    pub fn http_challenge(&self) -> Option<Challenge<Http>> {
        self.challenge()
    }

    /// Get the dns challenge.
    ///
    /// The dns challenge is a `TXT` record that must put created under:
    ///
    /// ```text
    /// _acme-challenge.<domain-to-be-proven>.  TXT  <proof>
    /// ```
    ///
    /// The dns proof is not the same as the http proof.
    pub fn dns_challenge(&self) -> Option<Challenge<Dns>> {
        self.challenge()
    }

    /// Get the TLS ALPN challenge.
    ///
    /// The TLS ALPN challenge is a certificate that must be served when a
    /// request is made for the ALPN protocol "tls-alpn-01". The certificate
    /// must contain a single dNSName SAN containing the domain being
    /// validated, as well as an ACME extension containing the SHA256 of the
    /// key authorization.
    pub fn tls_alpn_challenge(&self) -> Option<Challenge<TlsAlpn>> {
        self.challenge()
    }

    /// Access the underlying JSON object for debugging. We don't
    /// refresh the authorization when the corresponding challenge is validated,
    /// so there will be no changes to see here.
    pub fn api_auth(&self) -> &ApiAuth {
        &self.api_auth
    }
}

/// Ties a marker type to its challenge kind.
pub trait ChallengeMarker {
    const KIND: ChallengeKind;
}

/// Marker type for http challenges.
#[doc(hidden)]
pub struct Http;

/// Marker type for dns challenges.
#[doc(hidden)]
pub struct Dns;

/// Marker type for tls alpn challenges.
#[doc(hidden)]
pub struct TlsAlpn;

impl ChallengeMarker for Http {
    const KIND: ChallengeKind = ChallengeKind::Http01;
}

impl ChallengeMarker for Dns {
    const KIND: ChallengeKind = ChallengeKind::Dns01;
}

impl ChallengeMarker for TlsAlpn {
    const KIND: ChallengeKind = ChallengeKind::TlsAlpn01;
}

/// A DNS, HTTP, or TLS-ALPN challenge as obtained from the [`Auth`].
///
/// [`Auth`]: struct.Auth.html
pub struct Challenge<A> {
    inner: Arc<AccountInner>,
    api_challenge: ApiChallenge,
    auth_url: String,
    domain: String,
    _ph: std::marker::PhantomData<A>,
}

impl Challenge<Http> {
    /// The `token` is a unique identifier of the challenge. It is the file name in the
    /// http challenge like so:
    ///
    /// ```text
    /// http://<domain-to-be-proven>/.well-known/acme-challenge/<token>
    /// ```
    pub fn http_token(&self) -> &str {
        &self.api_challenge.token
    }

    /// The `proof` is some text content that is placed in the file named by `token`.
    pub fn http_proof(&self) -> Result<String> {
        self.key_authorization()
    }
}

impl Challenge<Dns> {
    /// The `proof` is the `TXT` record placed under:
    ///
    /// ```text
    /// _acme-challenge.<domain-to-be-proven>.  TXT  <proof>
    /// ```
    pub fn dns_proof(&self) -> Result<String> {
        Ok(dns_txt_value(&self.key_authorization()?))
    }
}

impl Challenge<TlsAlpn> {
    /// The `proof` is the contents of the ACME extension to be placed in the
    /// certificate used for validation.
    pub fn tls_alpn_proof(&self) -> Result<[u8; 32]> {
        Ok(sha256(self.key_authorization()?.as_bytes()))
    }
}

/// The TXT record value for a key authorization.
pub fn dns_txt_value(key_auth: &str) -> String {
    base64url(&sha256(key_auth.as_bytes()))
}

impl<A: ChallengeMarker> Challenge<A> {
    fn new(
        inner: &Arc<AccountInner>,
        api_challenge: ApiChallenge,
        auth_url: &str,
        domain: String,
    ) -> Self {
        Challenge {
            inner: inner.clone(),
            api_challenge,
            auth_url: auth_url.into(),
            domain,
            _ph: std::marker::PhantomData,
        }
    }

    pub fn token(&self) -> &str {
        &self.api_challenge.token
    }

    /// `<token>.<account key thumbprint>`, what providers are handed to present.
    pub fn key_authorization(&self) -> Result<String> {
        key_authorization(&self.api_challenge.token, self.inner.transport.acme_key())
    }

    /// Check whether this challlenge really need validation. It might already been
    /// done in a previous order for the same account.
    pub fn need_validate(&self) -> bool {
        self.api_challenge.is_status_pending()
    }

    /// Tell the ACME API to attempt validating the proof of this challenge, then poll the
    /// authorization until it is no longer pending.
    ///
    /// The user must first update the DNS record or HTTP web server depending
    /// on the type challenge being validated.
    pub fn validate(&self, poll_settings: &PollSettings) -> Result<()> {
        let url_chall = &self.api_challenge.url;
        let res = self.inner.transport.call(url_chall, &ApiEmptyObject)?;
        let _: ApiChallenge = read_json(res)?;

        let auth = wait_for_auth_status(&self.inner, &self.auth_url, poll_settings).map_err(
            |e| match e {
                Error::Timeout { elapsed, .. } => {
                    self.failure(format!("still pending after {:?}", elapsed))
                }
                e => e,
            },
        )?;

        if !auth.is_status_valid() {
            let detail = match auth.problem() {
                Some(problem) => problem.to_string(),
                None => format!(
                    "authorization is {}",
                    auth.status.as_deref().unwrap_or("without status")
                ),
            };
            return Err(self.failure(detail));
        }

        Ok(())
    }

    fn failure(&self, detail: String) -> Error {
        Error::Authorization {
            domain: self.domain.clone(),
            challenge: A::KIND.as_str().to_string(),
            detail,
        }
    }

    /// Access the underlying JSON object for debugging.
    pub fn api_challenge(&self) -> &ApiChallenge {
        &self.api_challenge
    }
}

fn wait_for_auth_status(
    inner: &Arc<AccountInner>,
    auth_url: &str,
    poll_settings: &PollSettings,
) -> Result<ApiAuth> {
    poll(
        "authorization",
        poll_settings.interval,
        poll_settings.timeout,
        &poll_settings.cancel,
        || {
            let res = inner.transport.call(auth_url, &ApiEmptyString)?;
            let auth: ApiAuth = read_json(res)?;
            Ok(if auth.is_status_pending() {
                None
            } else {
                Some(auth)
            })
        },
    )
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::acc::test::test_account;
    use crate::wait::Cancel;
    use std::time::Duration;

    fn poll_settings() -> PollSettings {
        PollSettings {
            interval: Duration::from_millis(50),
            timeout: Duration::from_secs(10),
            cancel: Cancel::new(),
        }
    }

    #[test]
    fn test_get_challenges() -> Result<()> {
        let server = crate::test::with_directory_server();
        let acc = test_account(&server)?;
        let ord = acc.new_order(&["acmetest.example.com"], None)?;
        let authz = ord.authorizations()?;
        assert!(authz.len() == 1);
        let auth = &authz[0];
        assert!(auth.need_challenge());
        {
            let http = auth.http_challenge().unwrap();
            assert!(http.need_validate());
            let proof = http.http_proof()?;
            assert!(proof.starts_with(http.http_token()));
        }
        {
            let dns = auth.dns_challenge().unwrap();
            assert!(dns.need_validate());
            assert_eq!(dns.dns_proof()?.len(), 43);
        }
        Ok(())
    }

    #[test]
    fn test_validate_published_http_challenge() -> Result<()> {
        let server = crate::test::with_directory_server();
        let acc = test_account(&server)?;
        let ord = acc.new_order(&["acmetest.example.com"], None)?;
        let auth = ord.authorizations()?.remove(0);
        let http = auth.http_challenge().unwrap();
        server
            .published()
            .lock()
            .unwrap()
            .insert(http.http_token().to_string(), http.http_proof()?);
        http.validate(&poll_settings())?;
        Ok(())
    }

    #[test]
    fn test_validate_unpublished_challenge_fails() -> Result<()> {
        let server = crate::test::with_directory_server();
        let acc = test_account(&server)?;
        let ord = acc.new_order(&["acmetest.example.com"], None)?;
        let auth = ord.authorizations()?.remove(0);
        let http = auth.http_challenge().unwrap();
        match http.validate(&poll_settings()) {
            Err(Error::Authorization {
                domain, challenge, ..
            }) => {
                assert_eq!(domain, "acmetest.example.com");
                assert_eq!(challenge, "http-01");
            }
            r => panic!("expected authorization error, got {:?}", r),
        }
        Ok(())
    }

    #[test]
    fn test_pending_authorization_timeout_names_domain() -> Result<()> {
        let server = crate::test::with_directory_server();
        server.ca().stuck_pending = true;
        let acc = test_account(&server)?;
        let ord = acc.new_order(&["slow.example.com"], None)?;
        let auth = ord.authorizations()?.remove(0);
        let dns = auth.dns_challenge().unwrap();
        let settings = PollSettings {
            timeout: Duration::from_millis(300),
            ..poll_settings()
        };
        match dns.validate(&settings) {
            Err(Error::Authorization {
                domain,
                challenge,
                detail,
            }) => {
                assert_eq!(domain, "slow.example.com");
                assert_eq!(challenge, "dns-01");
                assert!(detail.contains("still pending"), "{}", detail);
            }
            r => panic!("expected authorization error, got {:?}", r),
        }
        Ok(())
    }
}
