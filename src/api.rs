//! Low level API JSON objects.
//!
//! Unstable and not to be used directly. Provided to aid debugging.
#![allow(non_snake_case)]
#![allow(non_camel_case_types)]

use serde::{
    ser::{SerializeMap, Serializer},
    Deserialize, Serialize,
};
use time::OffsetDateTime;

/// Serializes to `""`
pub struct ApiEmptyString;
impl Serialize for ApiEmptyString {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str("")
    }
}

/// Serializes to `{}`
pub struct ApiEmptyObject;
impl Serialize for ApiEmptyObject {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let m = serializer.serialize_map(Some(0))?;
        m.end()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ApiProblem {
    #[serde(rename = "type")]
    pub _type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subproblems: Option<Vec<ApiSubproblem>>,
}

impl ApiProblem {
    pub(crate) fn new(_type: &str, detail: impl Into<String>) -> Self {
        ApiProblem {
            _type: _type.into(),
            detail: Some(detail.into()),
            ..Default::default()
        }
    }
    pub fn is_bad_nonce(&self) -> bool {
        self._type.ends_with("badNonce")
    }
    pub fn is_rate_limited(&self) -> bool {
        self._type.ends_with("rateLimited")
    }
    pub fn is_account_does_not_exist(&self) -> bool {
        self._type.ends_with("accountDoesNotExist")
    }
}

impl ::std::fmt::Display for ApiProblem {
    fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
        if let Some(detail) = &self.detail {
            write!(f, "{}: {}", self._type, detail)?;
        } else {
            write!(f, "{}", self._type)?;
        }
        if let Some(subs) = &self.subproblems {
            for sub in subs {
                let ident = sub.identifier.as_ref().map(|i| i.value.as_str()).unwrap_or("-");
                write!(
                    f,
                    "; [{}] {}: {}",
                    ident,
                    sub._type,
                    sub.detail.as_deref().unwrap_or("")
                )?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ApiSubproblem {
    #[serde(rename = "type")]
    pub _type: String,
    pub detail: Option<String>,
    pub identifier: Option<ApiIdentifier>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ApiDirectory {
    pub newNonce: String,
    pub newAccount: String,
    pub newOrder: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub newAuthz: Option<String>,
    pub revokeCert: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyChange: Option<String>,
    /// ACME Renewal Information endpoint, only present on CAs supporting ARI.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub renewalInfo: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<ApiDirectoryMeta>,
}

impl ApiDirectory {
    pub fn external_account_required(&self) -> bool {
        self.meta
            .as_ref()
            .map(|m| m.externalAccountRequired())
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ApiDirectoryMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub termsOfService: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caaIdentities: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub externalAccountRequired: Option<bool>,
}

impl ApiDirectoryMeta {
    pub fn externalAccountRequired(&self) -> bool {
        self.externalAccountRequired.unwrap_or(false)
    }
}

//    {
//      "status": "valid",
//      "contact": [
//        "mailto:cert-admin@example.com",
//        "mailto:admin@example.com"
//      ],
//      "termsOfServiceAgreed": true,
//      "orders": "https://example.com/acme/acct/evOfKhNU60wg/orders"
//    }
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ApiAccount {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contact: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub termsOfServiceAgreed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub onlyReturnExisting: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub externalAccountBinding: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orders: Option<String>,
}

impl ApiAccount {
    pub fn is_status_valid(&self) -> bool {
        self.status.as_ref().map(|s| s.as_ref()) == Some("valid")
    }
    pub fn is_status_deactivated(&self) -> bool {
        self.status.as_ref().map(|s| s.as_ref()) == Some("deactivated")
    }
    pub fn is_status_revoked(&self) -> bool {
        self.status.as_ref().map(|s| s.as_ref()) == Some("revoked")
    }
}

// {
//   "status": "pending",
//   "expires": "2019-01-09T08:26:43.570360537Z",
//   "identifiers": [
//     {
//       "type": "dns",
//       "value": "acmetest.algesten.se"
//     }
//   ],
//   "authorizations": [
//     "https://example.com/acme/authz/YTqpYUthlVfwBncUufE8IRA2TkzZkN4eYWWLMSRqcSs"
//   ],
//   "finalize": "https://example.com/acme/finalize/7738992/18234324"
// }
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ApiOrder {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires: Option<String>,
    pub identifiers: Vec<ApiIdentifier>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notBefore: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notAfter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiProblem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorizations: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub finalize: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
    /// ARI CertID of the certificate this order replaces.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replaces: Option<String>,
}

impl ApiOrder {
    /// As long as there are outstanding authorizations.
    pub fn is_status_pending(&self) -> bool {
        self.status.as_ref().map(|s| s.as_ref()) == Some("pending")
    }
    /// When all authorizations are finished, and we need to call
    /// "finalize".
    pub fn is_status_ready(&self) -> bool {
        self.status.as_ref().map(|s| s.as_ref()) == Some("ready")
    }
    /// On "finalize" the server is processing to sign CSR.
    pub fn is_status_processing(&self) -> bool {
        self.status.as_ref().map(|s| s.as_ref()) == Some("processing")
    }
    /// Once the certificate is issued and can be downloaded.
    pub fn is_status_valid(&self) -> bool {
        self.status.as_ref().map(|s| s.as_ref()) == Some("valid")
    }
    /// If the order failed and can't be used again.
    pub fn is_status_invalid(&self) -> bool {
        self.status.as_ref().map(|s| s.as_ref()) == Some("invalid")
    }
    /// Return all identifier values
    pub fn domains(&self) -> Vec<&str> {
        self.identifiers.iter().map(|i| i.value.as_ref()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiIdentifier {
    #[serde(rename = "type")]
    pub _type: String,
    pub value: String,
}

impl ApiIdentifier {
    /// Identifier for a name, `ip` when the value parses as an IP address.
    pub fn of(value: &str) -> Self {
        let _type = if value.parse::<std::net::IpAddr>().is_ok() {
            "ip"
        } else {
            "dns"
        };
        ApiIdentifier {
            _type: _type.into(),
            value: value.into(),
        }
    }
    pub fn is_type_dns(&self) -> bool {
        self._type == "dns"
    }
    pub fn is_type_ip(&self) -> bool {
        self._type == "ip"
    }
}

// {
//   "identifier": {
//     "type": "dns",
//     "value": "acmetest.algesten.se"
//   },
//   "status": "pending",
//   "expires": "2019-01-09T08:26:43Z",
//   "challenges": [
//     {
//       "type": "http-01",
//       "status": "pending",
//       "url": "https://example.com/acme/challenge/YTqpYUthlVfwBncUufE8IRA2TkzZkN4eYWWLMSRqcSs/216789597",
//       "token": "MUi-gqeOJdRkSb_YR2eaMxQBqf6al8dgt_dOttSWb0w"
//     },
//     {
//       "type": "dns-01",
//       "status": "pending",
//       "url": "https://example.com/acme/challenge/YTqpYUthlVfwBncUufE8IRA2TkzZkN4eYWWLMSRqcSs/216789599",
//       "token": "RRo2ZcXAEqxKvMH8RGcATjSK1KknLEUmauwfQ5i3gG8"
//     }
//   ]
// }
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiAuth {
    pub identifier: ApiIdentifier,
    pub status: Option<String>,
    pub expires: Option<String>,
    pub challenges: Vec<ApiChallenge>,
    pub wildcard: Option<bool>,
}

impl ApiAuth {
    pub fn is_status_pending(&self) -> bool {
        self.status.as_ref().map(|s| s.as_ref()) == Some("pending")
    }
    pub fn is_status_valid(&self) -> bool {
        self.status.as_ref().map(|s| s.as_ref()) == Some("valid")
    }
    pub fn is_status_invalid(&self) -> bool {
        self.status.as_ref().map(|s| s.as_ref()) == Some("invalid")
    }
    pub fn wildcard(&self) -> bool {
        self.wildcard.unwrap_or(false)
    }
    pub fn challenge(&self, _type: &str) -> Option<&ApiChallenge> {
        self.challenges.iter().find(|c| c._type == _type)
    }
    /// The first error reported on any of the challenges.
    pub fn problem(&self) -> Option<&ApiProblem> {
        self.challenges.iter().filter_map(|c| c.error.as_ref()).next()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiChallenge {
    pub url: String,
    #[serde(rename = "type")]
    pub _type: String,
    pub status: String,
    #[serde(default)]
    pub token: String,
    pub validated: Option<String>,
    pub error: Option<ApiProblem>,
}

impl ApiChallenge {
    pub fn is_status_pending(&self) -> bool {
        self.status == "pending"
    }
    pub fn is_status_processing(&self) -> bool {
        self.status == "processing"
    }
    pub fn is_status_valid(&self) -> bool {
        self.status == "valid"
    }
    pub fn is_status_invalid(&self) -> bool {
        self.status == "invalid"
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiFinalize {
    pub csr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiRevocation {
    pub certificate: String,
    pub reason: u8,
}

// {
//   "suggestedWindow": {
//     "start": "2025-01-02T04:00:00Z",
//     "end": "2025-01-03T04:00:00Z"
//   },
//   "explanationURL": "https://acme.example.com/docs/ari"
// }
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiRenewalInfo {
    pub suggestedWindow: ApiSuggestedWindow,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanationURL: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiSuggestedWindow {
    #[serde(with = "time::serde::rfc3339")]
    pub start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end: OffsetDateTime,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_api_empty_string() {
        let x = serde_json::to_string(&ApiEmptyString).unwrap();
        assert_eq!("\"\"", x);
    }

    #[test]
    fn test_api_empty_object() {
        let x = serde_json::to_string(&ApiEmptyObject).unwrap();
        assert_eq!("{}", x);
    }

    #[test]
    fn test_identifier_kind() {
        assert!(ApiIdentifier::of("example.com").is_type_dns());
        assert!(ApiIdentifier::of("192.0.2.7").is_type_ip());
        assert!(ApiIdentifier::of("2001:db8::1").is_type_ip());
    }

    #[test]
    fn test_bad_nonce_urn() {
        let p = ApiProblem::new("urn:ietf:params:acme:error:badNonce", "stale");
        assert!(p.is_bad_nonce());
        assert!(!p.is_rate_limited());
    }

    #[test]
    fn test_renewal_info_parse() {
        let json = r#"{
            "suggestedWindow": {
                "start": "2025-01-02T04:00:00Z",
                "end": "2025-01-03T04:00:00Z"
            },
            "explanationURL": "https://acme.example.com/docs/ari"
        }"#;
        let ri: ApiRenewalInfo = serde_json::from_str(json).unwrap();
        assert!(ri.suggestedWindow.start < ri.suggestedWindow.end);
        assert_eq!(ri.suggestedWindow.start.unix_timestamp(), 1735790400);
    }

    #[test]
    fn test_order_replaces_is_skipped_when_none() {
        let order = ApiOrder {
            identifiers: vec![ApiIdentifier::of("example.com")],
            ..Default::default()
        };
        let json = serde_json::to_string(&order).unwrap();
        assert!(!json.contains("replaces"));
        assert!(!json.contains("finalize"));
    }
}
