//! Order life cycle.
//!
//! An order goes through a life cycle of different states that require various actions by
//! the user. To ensure the user only use appropriate actions, this library have simple façade
//! structs that wraps the actual [`ApiOrder`].
//!
//! 1. First prove ownership:
//!    * [`NewOrder`] -> [`Auth`]* -> [`Challenge`]
//! 2. Then submit CSR and download the cert.
//!    * [`NewOrder`] -> [`CsrOrder`] -> [`CertOrder`]
//!
//! \* Possibly multiple auths.
//!
//! The [`Certifier`] drives these façades for complete issuance.
//!
//! [`ApiOrder`]: ../api/struct.ApiOrder.html
//! [`NewOrder`]: struct.NewOrder.html
//! [`Auth`]: struct.Auth.html
//! [`Challenge`]: struct.Challenge.html
//! [`CsrOrder`]: struct.CsrOrder.html
//! [`CertOrder`]: struct.CertOrder.html
//! [`Certifier`]: ../certifier/struct.Certifier.html
use std::sync::Arc;
use std::time::Duration;

use crate::acc::AccountInner;
use crate::api::{ApiAuth, ApiEmptyString, ApiFinalize, ApiOrder};
use crate::cert::{pem_chain_to_der, split_pem_chain, CertInfo};
use crate::req::{req_links, req_safe_read_body};
use crate::util::{base64url, read_json};
use crate::wait::{poll, Cancel};
use crate::{Error, Result};

mod auth;

pub use self::auth::{dns_txt_value, Auth, Challenge, ChallengeMarker, Dns, Http, TlsAlpn};

/// Where an order is in its life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderState {
    /// Sent to the CA, no status seen yet.
    Created,
    /// At least one authorization is outstanding.
    AuthorizationsPending,
    /// All authorizations are valid, the order awaits the CSR.
    AuthorizationsValid,
    /// The CA is processing the CSR.
    Finalizing,
    /// The certificate can be downloaded.
    Valid,
    /// The CA gave up on the order.
    Invalid,
    /// The order was abandoned because of a local or transport error.
    Errored,
}

impl OrderState {
    pub(crate) fn of(api_order: &ApiOrder) -> OrderState {
        match api_order.status.as_deref() {
            None => OrderState::Created,
            Some("pending") => OrderState::AuthorizationsPending,
            Some("ready") => OrderState::AuthorizationsValid,
            Some("processing") => OrderState::Finalizing,
            Some("valid") => OrderState::Valid,
            Some("invalid") => OrderState::Invalid,
            Some(_) => OrderState::Errored,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderState::Valid | OrderState::Invalid | OrderState::Errored
        )
    }
}

/// The order wrapped with an outer façade.
pub(crate) struct Order {
    inner: Arc<AccountInner>,
    api_order: ApiOrder,
    url: String,
}

impl Order {
    pub(crate) fn new(inner: &Arc<AccountInner>, api_order: ApiOrder, url: String) -> Self {
        Order {
            inner: inner.clone(),
            api_order,
            url,
        }
    }
}

/// Helper to refresh an order status (POST-as-GET).
pub(crate) fn refresh_order(inner: &Arc<AccountInner>, url: String) -> Result<Order> {
    let res = inner.transport.call(&url, &ApiEmptyString)?;
    let api_order: ApiOrder = read_json(res)?;
    Ok(Order {
        inner: inner.clone(),
        api_order,
        url,
    })
}

/// Polling parameters for authorization and order status.
#[derive(Debug, Clone)]
pub struct PollSettings {
    pub interval: Duration,
    pub timeout: Duration,
    pub cancel: Cancel,
}

/// A new order created by [`Account::new_order`].
///
/// An order is created using one or many domains (a primary `CN` and possible multiple
/// alt names). All domains in the order must have authorizations ([confirmed ownership])
/// before the order can progress to submitting a [CSR].
///
/// This order façade provides calls to provide such authorizations and to progress the order
/// when ready.
///
/// The ACME API provider might "remember" for a time that you already own a domain, which
/// means you might not need to prove the ownership every time. Use appropriate methods to
/// first check whether you really need to handle authorizations.
///
/// [`Account::new_order`]: ../struct.Account.html#method.new_order
/// [confirmed ownership]: ../index.html#domain-ownership
/// [CSR]: https://en.wikipedia.org/wiki/Certificate_signing_request
pub struct NewOrder {
    pub(crate) order: Order,
}

impl NewOrder {
    /// Tell if the domains in this order have been authorized.
    ///
    /// This doesn't do any calls against the API. You must manually call [`refresh`].
    ///
    /// In ACME API terms, the order can either be `ready` or `valid`, which both would
    /// mean we have passed the authorization stage.
    ///
    /// [`refresh`]: struct.NewOrder.html#method.refresh
    pub fn is_validated(&self) -> bool {
        self.order.api_order.is_status_ready() || self.order.api_order.is_status_valid()
    }

    pub fn state(&self) -> OrderState {
        OrderState::of(&self.order.api_order)
    }

    /// If the order [`is_validated`] progress it to a [`CsrOrder`].
    ///
    /// This doesn't do any calls against the API. You must manually call [`refresh`].
    ///
    /// [`is_validated`]: struct.NewOrder.html#method.is_validated
    /// [`CsrOrder`]: struct.CsrOrder.html
    pub fn confirm_validations(&self) -> Option<CsrOrder> {
        if self.is_validated() {
            Some(CsrOrder {
                order: Order::new(
                    &self.order.inner,
                    self.order.api_order.clone(),
                    self.order.url.clone(),
                ),
            })
        } else {
            None
        }
    }

    /// Refresh the order state against the ACME API.
    ///
    /// RFC 8555 calls this a "POST-as-GET" against the order URL.
    pub fn refresh(&mut self) -> Result<()> {
        let order = refresh_order(&self.order.inner, self.order.url.clone())?;
        self.order = order;
        Ok(())
    }

    /// Provide the authorizations. The number of authorizations will be the same as
    /// the number of domains requests, i.e. at least one (the primary CN), but possibly
    /// more (for alt names).
    ///
    /// If the order includes new domain names that have not been authorized before, this
    /// list might contain a mix of already valid and not yet valid auths.
    pub fn authorizations(&self) -> Result<Vec<Auth>> {
        let mut result = vec![];
        if let Some(authorizations) = &self.order.api_order.authorizations {
            for auth_url in authorizations {
                let res = self.order.inner.transport.call(auth_url, &ApiEmptyString)?;
                let api_auth: ApiAuth = read_json(res)?;
                result.push(Auth::new(&self.order.inner, api_auth, auth_url));
            }
        }
        Ok(result)
    }

    /// Access the underlying JSON object for debugging.
    pub fn api_order(&self) -> &ApiOrder {
        &self.order.api_order
    }
}

/// An order that is ready for a [CSR] submission.
///
/// To submit the CSR is called "finalizing" the order.
///
/// [CSR]: https://en.wikipedia.org/wiki/Certificate_signing_request
pub struct CsrOrder {
    pub(crate) order: Order,
}

impl CsrOrder {
    /// Finalize the order with a DER encoded CSR.
    ///
    /// Once the CSR has been submitted, the order goes into a `processing` status,
    /// which is polled until the order is `valid` (or `invalid`).
    pub fn finalize_csr(self, csr_der: &[u8], poll_settings: &PollSettings) -> Result<CertOrder> {
        let finalize = ApiFinalize {
            csr: base64url(csr_der),
        };

        let inner = self.order.inner;
        let order_url = self.order.url;
        let finalize_url = &self.order.api_order.finalize;

        // if the CSR is invalid, we will get a 4xx code back that
        // bombs out from this call.
        inner.transport.call(finalize_url, &finalize)?;

        // wait for the status to not be processing.
        // valid -> cert is issued
        // invalid -> the whole thing is off
        let order = wait_for_order_status(&inner, &order_url, poll_settings)?;

        if !order.api_order.is_status_valid() {
            return Err(order_failure(&order.api_order));
        }

        Ok(CertOrder { order })
    }

    /// Access the underlying JSON object for debugging.
    pub fn api_order(&self) -> &ApiOrder {
        &self.order.api_order
    }
}

/// The problem an invalid order carries, as reported by the CA.
pub(crate) fn order_failure(api_order: &ApiOrder) -> Error {
    match &api_order.error {
        Some(problem) => Error::Api(problem.clone()),
        None => Error::Other(format!(
            "order is {}",
            api_order.status.as_deref().unwrap_or("without status")
        )),
    }
}

fn wait_for_order_status(
    inner: &Arc<AccountInner>,
    url: &str,
    poll_settings: &PollSettings,
) -> Result<Order> {
    poll(
        "order finalization",
        poll_settings.interval,
        poll_settings.timeout,
        &poll_settings.cancel,
        || {
            let order = refresh_order(inner, url.to_string())?;
            // a server may briefly report "ready" after the finalize call.
            let done = order.api_order.is_status_valid() || order.api_order.is_status_invalid();
            Ok(if done { Some(order) } else { None })
        },
    )
}

/// A downloaded certificate chain.
#[derive(Debug, Clone)]
pub struct DownloadedCert {
    /// The URL the chosen chain was downloaded from.
    pub url: String,
    /// The leaf, followed by the issuers when bundled.
    pub certificate: String,
    /// The issuer chain without the leaf.
    pub issuer_certificate: String,
}

/// Order for an issued certificate that is ready to download.
pub struct CertOrder {
    order: Order,
}

impl CertOrder {
    /// Download the issued certificate.
    ///
    /// With `bundle`, `certificate` holds the leaf followed by the issuers, otherwise only
    /// the leaf. When a `preferred_chain` is given, the alternate chains offered by the CA
    /// are searched for one whose topmost issuer has that common name. The default chain
    /// is used when none matches.
    pub fn download(self, bundle: bool, preferred_chain: Option<&str>) -> Result<DownloadedCert> {
        let url = self
            .order
            .api_order
            .certificate
            .clone()
            .ok_or_else(|| Error::Other("valid order without certificate url".into()))?;
        let inner = &self.order.inner;

        let (default_pem, alternates) = fetch_chain(inner, &url)?;
        let default = to_downloaded(&url, &default_pem, bundle);

        let wanted = match preferred_chain {
            Some(p) => p,
            None => return Ok(default),
        };

        if has_preferred_chain(&default.issuer_certificate, wanted)? {
            return Ok(default);
        }

        for alt in alternates {
            let (pem, _) = fetch_chain(inner, &alt)?;
            let downloaded = to_downloaded(&alt, &pem, bundle);
            if has_preferred_chain(&downloaded.issuer_certificate, wanted)? {
                debug!("Using preferred chain {} from {}", wanted, alt);
                return Ok(downloaded);
            }
        }

        debug!("Preferred chain {} not offered, using default", wanted);
        Ok(default)
    }

    /// Access the underlying JSON object for debugging.
    pub fn api_order(&self) -> &ApiOrder {
        &self.order.api_order
    }
}

fn fetch_chain(inner: &Arc<AccountInner>, url: &str) -> Result<(String, Vec<String>)> {
    let res = inner.transport.call(url, &ApiEmptyString)?;
    let alternates = req_links(&res, "alternate");
    let pem = req_safe_read_body(res);
    if pem.trim().is_empty() {
        return Err(Error::Other(format!("empty certificate chain from {}", url)));
    }
    Ok((pem, alternates))
}

fn to_downloaded(url: &str, pem: &str, bundle: bool) -> DownloadedCert {
    let (leaf, issuer) = split_pem_chain(pem);
    let certificate = if bundle {
        format!("{}{}", leaf, issuer)
    } else {
        leaf
    };
    DownloadedCert {
        url: url.to_string(),
        certificate,
        issuer_certificate: issuer,
    }
}

fn has_preferred_chain(issuer_pem: &str, preferred: &str) -> Result<bool> {
    let ders = pem_chain_to_der(issuer_pem.as_bytes())?;
    match ders.last() {
        Some(top) => {
            let info = CertInfo::from_der(top)?;
            Ok(info.issuer_common_name.as_deref() == Some(preferred))
        }
        None => Ok(false),
    }
}
