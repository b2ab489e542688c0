use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::sha::sha256;
use openssl::sign::Signer;
use serde::{Deserialize, Serialize};

use crate::acc::AcmeKey;
use crate::util::{base64url, base64url_decode};
use crate::{Error, Result};

#[derive(Debug, Serialize, Deserialize, Default)]
pub(crate) struct JwsProtected {
    alg: String,
    url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    nonce: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    jwk: Option<Jwk>,
    #[serde(skip_serializing_if = "Option::is_none")]
    kid: Option<String>,
}

impl JwsProtected {
    pub(crate) fn new_jwk(key: &AcmeKey, url: &str, nonce: String) -> Result<Self> {
        Ok(JwsProtected {
            alg: key.alg().into(),
            url: url.into(),
            nonce: Some(nonce),
            jwk: Some(key.jwk()?),
            ..Default::default()
        })
    }
    pub(crate) fn new_kid(key: &AcmeKey, url: &str, nonce: String) -> Result<Self> {
        let kid = key
            .key_id()
            .ok_or_else(|| Error::Other("account key id is not known yet".into()))?;
        Ok(JwsProtected {
            alg: key.alg().into(),
            url: url.into(),
            nonce: Some(nonce),
            kid: Some(kid.into()),
            ..Default::default()
        })
    }
}

/// Public part of an account key.
///
/// Only the members required for the thumbprint are included, so the serialized form
/// doubles as the thumbprint input (RFC 7638).
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
// LEXICAL ORDER OF FIELDS MATTER!
pub(crate) struct Jwk {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
    pub kty: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,
}

impl Jwk {
    pub(crate) fn thumbprint(&self) -> Result<String> {
        let jwk_json = serde_json::to_string(self)?;
        Ok(base64url(&sha256(jwk_json.as_bytes())))
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Jws {
    protected: String,
    payload: String,
    signature: String,
}

pub(crate) fn jws_with_kid<T: Serialize + ?Sized>(
    url: &str,
    nonce: String,
    key: &AcmeKey,
    payload: &T,
) -> Result<String> {
    let protected = JwsProtected::new_kid(key, url, nonce)?;
    jws_with(protected, key, payload)
}

pub(crate) fn jws_with_jwk<T: Serialize + ?Sized>(
    url: &str,
    nonce: String,
    key: &AcmeKey,
    payload: &T,
) -> Result<String> {
    let protected = JwsProtected::new_jwk(key, url, nonce)?;
    jws_with(protected, key, payload)
}

fn jws_with<T: Serialize + ?Sized>(
    protected: JwsProtected,
    key: &AcmeKey,
    payload: &T,
) -> Result<String> {
    let protected = {
        let pro_json = serde_json::to_string(&protected)?;
        base64url(pro_json.as_bytes())
    };
    let payload = encode_payload(payload)?;

    let to_sign = format!("{}.{}", protected, payload);
    let signature = base64url(&key.sign(to_sign.as_bytes())?);

    let jws = Jws {
        protected,
        payload,
        signature,
    };

    Ok(serde_json::to_string(&jws)?)
}

fn encode_payload<T: Serialize + ?Sized>(payload: &T) -> Result<String> {
    let pay_json = serde_json::to_string(payload)?;
    if pay_json == "\"\"" {
        // This is a special case produced by ApiEmptyString and should
        // not be further base64url encoded.
        Ok("".to_string())
    } else {
        Ok(base64url(pay_json.as_bytes()))
    }
}

/// External account binding, an HS256 JWS over the account key signed with the MAC key
/// handed out by the CA.
pub(crate) fn external_account_binding(
    eab_kid: &str,
    hmac_key_b64: &str,
    key: &AcmeKey,
    new_account_url: &str,
) -> Result<serde_json::Value> {
    let hmac_key = base64url_decode(hmac_key_b64)
        .map_err(|e| Error::Config(format!("EAB HMAC key is not base64url: {}", e)))?;

    let protected = serde_json::json!({
        "alg": "HS256",
        "kid": eab_kid,
        "url": new_account_url,
    });
    let protected = base64url(serde_json::to_string(&protected)?.as_bytes());
    let payload = encode_payload(&key.jwk()?)?;

    let pkey = PKey::hmac(&hmac_key)?;
    let mut signer = Signer::new(MessageDigest::sha256(), &pkey)?;
    signer.update(format!("{}.{}", protected, payload).as_bytes())?;
    let signature = base64url(&signer.sign_to_vec()?);

    Ok(serde_json::to_value(Jws {
        protected,
        payload,
        signature,
    })?)
}

pub(crate) fn key_authorization(token: &str, key: &AcmeKey) -> Result<String> {
    let thumb = key.jwk()?.thumbprint()?;
    Ok(format!("{}.{}", token, thumb))
}
