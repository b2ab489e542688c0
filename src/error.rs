//
use std::fmt;
use std::io;
use std::time::Duration;

use crate::api::ApiProblem;

/// acme-keeper result.
pub type Result<T> = ::std::result::Result<T, Error>;

/// acme-keeper errors.
///
/// The variants follow the failure taxonomy of the certificate life cycle. Configuration
/// errors are raised before anything is sent to the CA, protocol errors carry the CA's
/// problem document verbatim, and the DNS variants let callers tell "still converging"
/// ([`PropagationTimeout`]) from "never going to work" ([`DnsZoneNotFound`],
/// [`DnsResolution`]).
///
/// [`PropagationTimeout`]: enum.Error.html#variant.PropagationTimeout
/// [`DnsZoneNotFound`]: enum.Error.html#variant.DnsZoneNotFound
/// [`DnsResolution`]: enum.Error.html#variant.DnsResolution
#[derive(Debug)]
pub enum Error {
    /// Invalid or contradictory configuration.
    Config(String),
    /// The ACME API answered with a problem document.
    Api(ApiProblem),
    /// An authorization did not become valid.
    Authorization {
        domain: String,
        challenge: String,
        detail: String,
    },
    /// The TXT record was not visible on the authoritative servers in time.
    PropagationTimeout { fqdn: String, elapsed: Duration },
    /// No zone (SOA) could be found for the name.
    DnsZoneNotFound { fqdn: String },
    /// A resolver answered with an error code.
    DnsResolution(String),
    /// A DNS query could not be carried out.
    DnsTransport(String),
    /// A bounded polling loop ran out of time.
    Timeout { what: String, elapsed: Duration },
    /// The operation was cancelled while waiting.
    Cancelled,
    /// Stored files are missing, malformed or can't be written.
    Storage(String),
    /// The deploy hook failed.
    Hook(String),
    /// The deploy hook was killed after exceeding its timeout.
    HookTimeout { timeout: Duration },
    /// Base64 decoding failed.
    Base64Decode(base64::DecodeError),
    /// JSON serialization/deserialization error.
    Json(serde_json::Error),
    /// openssl error.
    Ssl(openssl::error::ErrorStack),
    /// std::io error.
    Io(io::Error),
    /// Some other error. Notice that `Error` is
    /// `From<String>` and `From<&str>` and it becomes `Other`.
    Other(String),
}

impl Error {
    /// Whether the error is a (propagation, polling or hook) timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::PropagationTimeout { .. } | Error::Timeout { .. } | Error::HookTimeout { .. }
        )
    }
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Config(s) => write!(f, "configuration error: {}", s),
            Error::Api(p) => write!(f, "acme: {}", p),
            Error::Authorization {
                domain,
                challenge,
                detail,
            } => write!(f, "[{}] {} authorization failed: {}", domain, challenge, detail),
            Error::PropagationTimeout { fqdn, elapsed } => write!(
                f,
                "propagation: TXT record for {} not found on all authoritative servers after {:?}",
                fqdn, elapsed
            ),
            Error::DnsZoneNotFound { fqdn } => {
                write!(f, "could not find the start of authority for {}", fqdn)
            }
            Error::DnsResolution(s) => write!(f, "dns resolution: {}", s),
            Error::DnsTransport(s) => write!(f, "dns query: {}", s),
            Error::Timeout { what, elapsed } => {
                write!(f, "{}: time limit exceeded after {:?}", what, elapsed)
            }
            Error::Cancelled => write!(f, "operation cancelled"),
            Error::Storage(s) => write!(f, "storage: {}", s),
            Error::Hook(s) => write!(f, "hook: {}", s),
            Error::HookTimeout { timeout } => write!(f, "hook timed out after {:?}", timeout),
            Error::Base64Decode(e) => write!(f, "{}", e),
            Error::Json(e) => write!(f, "{}", e),
            Error::Ssl(e) => write!(f, "{}", e),
            Error::Io(e) => write!(f, "{}", e),
            Error::Other(s) => write!(f, "{}", s),
        }
    }
}

impl From<ApiProblem> for Error {
    fn from(p: ApiProblem) -> Self {
        Error::Api(p)
    }
}

impl From<base64::DecodeError> for Error {
    fn from(e: base64::DecodeError) -> Self {
        Error::Base64Decode(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Json(e)
    }
}

impl From<openssl::error::ErrorStack> for Error {
    fn from(e: openssl::error::ErrorStack) -> Self {
        Error::Ssl(e)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}
