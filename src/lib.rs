#![warn(clippy::all)]
//! acme-keeper obtains, renews and revokes certificates from ACME (Automatic Certificate
//! Management Environment) services such as [Let's Encrypt](https://letsencrypt.org/),
//! and keeps them on disk.
//!
//! Uses ACME v2 (RFC 8555), with ACME Renewal Information (ARI) when the CA offers it.
//!
//! Install it like so:
//!
//! ```toml
//! [dependencies]
//! acme-keeper = "0.1"
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use acme_keeper::challenge::{ChallengeConfig, Registry};
//! use acme_keeper::client::{
//!     Client, ClientOptions, RenewOutcome, RenewRequest, RunRequest, DEFAULT_PATH,
//! };
//! use acme_keeper::{DirectoryUrl, Error};
//!
//! fn request_cert() -> Result<(), Error> {
//!
//! // Use DirectoryUrl::LetsEncryptStaging for dev/testing.
//! let url = DirectoryUrl::LetsEncrypt;
//!
//! // Accounts, certificates and archives are kept below this directory.
//! let mut options = ClientOptions::new(url, DEFAULT_PATH);
//! options.account.email = Some("foo@bar.com".into());
//! options.account.accept_tos = true;
//!
//! // Reads the account key and registration from disk, or creates
//! // and registers them before going any further.
//! let client = Client::new(options)?;
//!
//! // Exactly one challenge type is used. For HTTP, the key authorization
//! // is written below the web server's root:
//! //
//! // /var/www/.well-known/acme-challenge/<token>
//! let challenge = ChallengeConfig::new()
//!     .webroot("/var/www")
//!     .build(&Registry::default())?;
//!
//! // Order, prove control over the domain, finalize and download. The
//! // certificate lands in .acme-keeper/certificates/myfancydomain.com.crt
//! client.run(&challenge, RunRequest::domains(&["myfancydomain.com"]))?;
//!
//! // Later, typically from cron. Nothing happens until the certificate is due.
//! match client.renew(&challenge, RenewRequest::domains(&["myfancydomain.com"]))? {
//!     RenewOutcome::NotDue { not_after } => println!("valid until {}", not_after),
//!     RenewOutcome::Renewed(cert) => println!("renewed {}", cert.id),
//! }
//!
//! Ok(())
//! }
//! ```
//!
//! ## Domain ownership
//!
//! Most website TLS certificates tries to prove ownership/control over the domain they
//! are issued for. For ACME, this means proving you control either a web server answering
//! HTTP requests to the domain, the DNS server answering name lookups against the domain,
//! or a TLS server answering on port 443.
//!
//! A [`Provider`] makes the proof available and removes it again. Wildcard domains can
//! only be proven with `dns-01`. After presenting a `dns-01` record, the record is
//! checked on the zone's authoritative servers before the CA is asked to validate.
//!
//! [`Provider`]: challenge/trait.Provider.html
//!
//! ### Multiple domains
//!
//! A certificate can be issued for several domains at once. Each needs its own proof,
//! and one failing proof fails the whole certificate.
//!
//! ## Renewal
//!
//! A stored certificate is renewed when the CA's renewal window says so, or otherwise
//! when a third of its lifetime is left. See [`RenewalPolicy`].
//!
//! [`RenewalPolicy`]: renewal/struct.RenewalPolicy.html
//!
//! ## Rate limits
//!
//! The ACME API provider Let's Encrypt uses [rate limits] to ensure the API i not being
//! abused. It might be tempting to put the polling intervals really low, but balance this
//! against the real risk of having access cut off.
//!
//! [rate limits]: https://letsencrypt.org/docs/rate-limits/
//!
//! ### Use staging for dev!
//!
//! Especially take care to use the Let`s Encrypt staging environment for development
//! where the rate limits are more relaxed.
//!
//! See [`DirectoryUrl::LetsEncryptStaging`].
//!
//! [`DirectoryUrl::LetsEncryptStaging`]: enum.DirectoryUrl.html#variant.LetsEncryptStaging
//!
//! ## Implementation details
//!
//! Synchronous I/O and blocking calls throughout. Every wait (polling, propagation, the
//! deploy hook) can be cancelled through a [`Cancel`] handle.
//!
//! [`Cancel`]: wait/struct.Cancel.html
//!
#[macro_use]
extern crate log;

mod acc;
mod cert;
mod dir;
mod error;
mod jwt;
mod req;
mod trans;
mod util;

pub mod api;
pub mod certifier;
pub mod challenge;
pub mod client;
pub mod dns;
pub mod hook;
pub mod order;
pub mod persist;
pub mod renewal;
pub mod wait;

#[cfg(test)]
mod test;

pub use crate::acc::Account;
pub use crate::cert::{
    pem_chain_to_der, private_key_from_pem, private_key_to_pem, CertInfo, CsrInput, KeyType,
};
pub use crate::certifier::{Certifier, ObtainForCsrRequest, ObtainRequest};
pub use crate::client::{Client, ClientOptions, RenewOutcome};
pub use crate::dir::{DirectoryUrl, ExternalAccountBinding};
pub use crate::error::{Error, Result};
