//
use std::sync::Arc;

use crate::api::{ApiAccount, ApiDirectory, ApiIdentifier, ApiOrder, ApiRenewalInfo, ApiRevocation};
use crate::order::{NewOrder, Order};
use crate::req::{req_expect_header, req_handle_error};
use crate::trans::Transport;
use crate::util::{base64url, read_json};
use crate::{Error, Result};

mod akey;

pub(crate) use self::akey::AcmeKey;

pub(crate) struct AccountInner {
    pub transport: Transport,
    pub location: String,
    pub api_account: ApiAccount,
    pub api_directory: ApiDirectory,
}

/// Account with an ACME provider.
///
/// An account is a private key used to sign requests against the ACME API, plus the
/// account URL (key id) the CA assigned when the key was registered. The key type is
/// chosen when the account is first created and recorded next to the key on disk.
#[derive(Clone)]
pub struct Account {
    inner: Arc<AccountInner>,
}

impl Account {
    pub(crate) fn new(
        transport: Transport,
        location: &str,
        api_account: ApiAccount,
        api_directory: ApiDirectory,
    ) -> Self {
        Account {
            inner: Arc::new(AccountInner {
                transport,
                location: location.into(),
                api_account,
                api_directory,
            }),
        }
    }

    /// The account URL, also used as key id in signed requests.
    pub fn location(&self) -> &str {
        &self.inner.location
    }

    /// Private key for this account as PEM.
    pub fn acme_private_key_pem(&self) -> Result<String> {
        let pem = self.inner.transport.acme_key().to_pem()?;
        String::from_utf8(pem).map_err(|e| Error::Other(e.to_string()))
    }

    /// Create a new order to issue a certificate for this account.
    ///
    /// Names that parse as IP addresses become `ip` identifiers, the rest `dns`.
    ///
    /// The `replaces` value is the ARI CertID of the certificate being renewed. It is only
    /// sent when the CA advertises renewal information.
    pub(crate) fn new_order(&self, domains: &[&str], replaces: Option<&str>) -> Result<NewOrder> {
        let replaces = replaces
            .filter(|_| self.inner.api_directory.renewalInfo.is_some())
            .map(|s| s.to_string());

        let order = ApiOrder {
            identifiers: domains.iter().map(|d| ApiIdentifier::of(d)).collect(),
            replaces,
            ..Default::default()
        };

        let new_order_url = &self.inner.api_directory.newOrder;

        let res = self.inner.transport.call(new_order_url, &order)?;
        let order_url = req_expect_header(&res, "location")?;
        let api_order: ApiOrder = read_json(res)?;

        let order = Order::new(&self.inner, api_order, order_url);
        Ok(NewOrder { order })
    }

    /// Ask the CA for its renewal window of a certificate.
    ///
    /// `None` when the CA doesn't support ACME Renewal Information.
    pub(crate) fn renewal_info(&self, cert_id: &str) -> Result<Option<ApiRenewalInfo>> {
        let base = match &self.inner.api_directory.renewalInfo {
            Some(url) => url,
            None => return Ok(None),
        };
        let url = format!("{}/{}", base.trim_end_matches('/'), cert_id);
        debug!("Fetch renewal info: {}", url);
        let res = req_handle_error(self.inner.transport.client().get(&url))?;
        Ok(Some(read_json(res)?))
    }

    /// Revoke a (DER encoded) certificate issued to this account.
    pub(crate) fn revoke_certificate(&self, cert_der: &[u8], reason: u8) -> Result<()> {
        let revocation = ApiRevocation {
            certificate: base64url(cert_der),
            reason,
        };
        let url = &self.inner.api_directory.revokeCert;
        self.inner.transport.call(url, &revocation)?;
        Ok(())
    }

    /// Access the underlying JSON object for debugging.
    pub fn api_account(&self) -> &ApiAccount {
        &self.inner.api_account
    }

    pub(crate) fn api_directory(&self) -> &ApiDirectory {
        &self.inner.api_directory
    }
}
