use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use lazy_static::lazy_static;
use openssl::ec::{Asn1Flag, EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{self, Id, PKey, PKeyRef};
use openssl::rsa::Rsa;
use openssl::stack::Stack;
use openssl::x509::extension::SubjectAlternativeName;
use openssl::x509::{X509NameBuilder, X509Req, X509ReqBuilder};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::pem::Pem;
use x509_parser::prelude::FromDer;

use crate::{Error, Result};

lazy_static! {
    pub(crate) static ref EC_GROUP_P256: EcGroup = ec_group(Nid::X9_62_PRIME256V1);
    pub(crate) static ref EC_GROUP_P384: EcGroup = ec_group(Nid::SECP384R1);
}

fn ec_group(nid: Nid) -> EcGroup {
    let mut g = EcGroup::from_curve_name(nid).expect("EcGroup");
    // this is required for openssl 1.0.x (but not 1.1.x)
    g.set_asn1_flag(Asn1Flag::NAMED_CURVE);
    g
}

/// Supported key algorithms, both for account keys and certificate keys.
///
/// The serialized names are the ones written to `account.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyType {
    #[serde(rename = "P256")]
    EC256,
    #[serde(rename = "P384")]
    EC384,
    #[serde(rename = "2048")]
    RSA2048,
    #[serde(rename = "3072")]
    RSA3072,
    #[serde(rename = "4096")]
    RSA4096,
    #[serde(rename = "8192")]
    RSA8192,
}

impl Default for KeyType {
    fn default() -> Self {
        KeyType::EC256
    }
}

impl KeyType {
    /// Generate a fresh private key of this type.
    pub fn generate(self) -> Result<PKey<pkey::Private>> {
        let pkey = match self {
            KeyType::EC256 => PKey::from_ec_key(EcKey::generate(&EC_GROUP_P256)?)?,
            KeyType::EC384 => PKey::from_ec_key(EcKey::generate(&EC_GROUP_P384)?)?,
            KeyType::RSA2048 => PKey::from_rsa(Rsa::generate(2048)?)?,
            KeyType::RSA3072 => PKey::from_rsa(Rsa::generate(3072)?)?,
            KeyType::RSA4096 => PKey::from_rsa(Rsa::generate(4096)?)?,
            KeyType::RSA8192 => PKey::from_rsa(Rsa::generate(8192)?)?,
        };
        Ok(pkey)
    }

    /// Work out the key type from existing key material.
    ///
    /// Used when reading files written before the key type was recorded.
    pub fn infer<T: pkey::HasPublic>(key: &PKeyRef<T>) -> Result<KeyType> {
        match key.id() {
            Id::RSA => match key.bits() {
                2048 => Ok(KeyType::RSA2048),
                3072 => Ok(KeyType::RSA3072),
                4096 => Ok(KeyType::RSA4096),
                8192 => Ok(KeyType::RSA8192),
                bits => Err(format!("unsupported RSA key size: {}", bits).into()),
            },
            Id::EC => {
                let ec = key.ec_key()?;
                match ec.group().curve_name() {
                    Some(Nid::X9_62_PRIME256V1) => Ok(KeyType::EC256),
                    Some(Nid::SECP384R1) => Ok(KeyType::EC384),
                    other => Err(format!("unsupported EC curve: {:?}", other).into()),
                }
            }
            other => Err(format!("unsupported key algorithm: {:?}", other).into()),
        }
    }

    pub fn is_rsa(self) -> bool {
        !matches!(self, KeyType::EC256 | KeyType::EC384)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            KeyType::EC256 => "ec256",
            KeyType::EC384 => "ec384",
            KeyType::RSA2048 => "rsa2048",
            KeyType::RSA3072 => "rsa3072",
            KeyType::RSA4096 => "rsa4096",
            KeyType::RSA8192 => "rsa8192",
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ec256" | "p256" => Ok(KeyType::EC256),
            "ec384" | "p384" => Ok(KeyType::EC384),
            "rsa2048" | "2048" => Ok(KeyType::RSA2048),
            "rsa3072" | "3072" => Ok(KeyType::RSA3072),
            "rsa4096" | "4096" => Ok(KeyType::RSA4096),
            "rsa8192" | "8192" => Ok(KeyType::RSA8192),
            _ => Err(Error::Config(format!("unsupported key type: {}", s))),
        }
    }
}

/// PEM encode a private key. RSA keys are written as PKCS#1, EC keys as SEC1.
pub fn private_key_to_pem(key: &PKeyRef<pkey::Private>) -> Result<Vec<u8>> {
    let pem = match key.id() {
        Id::RSA => key.rsa()?.private_key_to_pem()?,
        Id::EC => key.ec_key()?.private_key_to_pem()?,
        _ => key.private_key_to_pem_pkcs8()?,
    };
    Ok(pem)
}

/// Read a PEM private key in PKCS#1, SEC1 or PKCS#8 form.
pub fn private_key_from_pem(pem: &[u8]) -> Result<PKey<pkey::Private>> {
    PKey::private_key_from_pem(pem)
        .map_err(|e| Error::Storage(format!("error reading private key PEM: {}", e)))
}

pub(crate) fn create_csr(pkey: &PKeyRef<pkey::Private>, domains: &[&str]) -> Result<X509Req> {
    //
    // the csr builder
    let mut req_bld = X509ReqBuilder::new()?;

    // set private/public key in builder
    req_bld.set_pubkey(pkey)?;

    // CN is limited to 64 chars, longer names only go in the SAN.
    if let Some(first) = domains.first().filter(|d| d.len() <= 64) {
        let mut name = X509NameBuilder::new()?;
        name.append_entry_by_nid(Nid::COMMONNAME, first)?;
        req_bld.set_subject_name(&name.build())?;
    }

    // set all domains as alt names
    let mut stack = Stack::new()?;
    let ctx = req_bld.x509v3_context(None);
    let mut an = SubjectAlternativeName::new();
    for d in domains {
        if d.parse::<IpAddr>().is_ok() {
            an.ip(d);
        } else {
            an.dns(d);
        }
    }
    let ext = an.build(&ctx)?;
    stack.push(ext)?;
    req_bld.add_extensions(&stack)?;

    // sign it
    req_bld.sign(pkey, MessageDigest::sha256())?;

    // the csr
    Ok(req_bld.build())
}

/// What we need to know about an issued certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertInfo {
    /// Common name first, followed by the remaining SAN entries.
    pub domains: Vec<String>,
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
    pub is_ca: bool,
    /// Serial number as DER integer content bytes.
    pub serial: Vec<u8>,
    pub authority_key_id: Option<Vec<u8>>,
    pub issuer_common_name: Option<String>,
}

impl CertInfo {
    /// Parse a DER encoded certificate.
    pub fn from_der(der: &[u8]) -> Result<CertInfo> {
        let (_, cert) = x509_parser::parse_x509_certificate(der)
            .map_err(|e| Error::Storage(format!("malformed certificate: {}", e)))?;

        let validity = cert.validity();
        let not_before = timestamp(validity.not_before.timestamp())?;
        let not_after = timestamp(validity.not_after.timestamp())?;

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(|s| s.to_string());

        let mut san = vec![];
        if let Ok(Some(ext)) = cert.subject_alternative_name() {
            san = general_names(&ext.value.general_names);
        }

        let authority_key_id = cert.extensions().iter().find_map(|ext| {
            if let ParsedExtension::AuthorityKeyIdentifier(aki) = ext.parsed_extension() {
                aki.key_identifier.as_ref().map(|k| k.0.to_vec())
            } else {
                None
            }
        });

        let issuer_common_name = cert
            .issuer()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(|s| s.to_string());

        Ok(CertInfo {
            domains: merge_domains(common_name, san),
            not_before,
            not_after,
            is_ca: cert.is_ca(),
            serial: cert.raw_serial().to_vec(),
            authority_key_id,
            issuer_common_name,
        })
    }

    /// Whole days left until expiry, negative when expired.
    pub fn valid_days_left(&self, now: OffsetDateTime) -> i64 {
        (self.not_after - now).whole_days()
    }
}

fn timestamp(ts: i64) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(ts)
        .map_err(|e| Error::Storage(format!("certificate time out of range: {}", e)))
}

fn general_names(names: &[GeneralName]) -> Vec<String> {
    names
        .iter()
        .filter_map(|n| match n {
            GeneralName::DNSName(s) => Some(s.to_string()),
            GeneralName::IPAddress(b) => ip_of(b).map(|ip| ip.to_string()),
            _ => None,
        })
        .collect()
}

fn ip_of(b: &[u8]) -> Option<IpAddr> {
    match b.len() {
        4 => <[u8; 4]>::try_from(b).ok().map(IpAddr::from),
        16 => <[u8; 16]>::try_from(b).ok().map(IpAddr::from),
        _ => None,
    }
}

fn merge_domains(common_name: Option<String>, san: Vec<String>) -> Vec<String> {
    let mut domains: Vec<String> = common_name.into_iter().collect();
    for name in san {
        if !domains.contains(&name) {
            domains.push(name);
        }
    }
    domains
}

/// Split a PEM bundle into DER encoded certificates, in file order.
pub fn pem_chain_to_der(pem: &[u8]) -> Result<Vec<Vec<u8>>> {
    let mut ders = vec![];
    for block in Pem::iter_from_buffer(pem) {
        let block = block.map_err(|e| Error::Storage(format!("malformed PEM: {}", e)))?;
        if block.label == "CERTIFICATE" {
            ders.push(block.contents);
        }
    }
    Ok(ders)
}

/// Split a PEM bundle into the leaf and the (PEM encoded) rest of the chain.
pub(crate) fn split_pem_chain(pem: &str) -> (String, String) {
    const END: &str = "-----END CERTIFICATE-----";
    match pem.find(END) {
        Some(idx) => {
            let cut = idx + END.len();
            let leaf = format!("{}\n", pem[..cut].trim());
            let rest = pem[cut..].trim();
            let rest = if rest.is_empty() {
                String::new()
            } else {
                format!("{}\n", rest)
            };
            (leaf, rest)
        }
        None => (pem.to_string(), String::new()),
    }
}

/// A CSR supplied by the operator, with the names it asks for.
#[derive(Debug, Clone)]
pub struct CsrInput {
    pub der: Vec<u8>,
    pub pem: Vec<u8>,
    pub domains: Vec<String>,
}

impl CsrInput {
    /// Read a CSR from PEM or DER bytes.
    pub fn parse(bytes: &[u8]) -> Result<CsrInput> {
        let der = if bytes.starts_with(b"-----BEGIN") {
            let block = Pem::iter_from_buffer(bytes)
                .filter_map(|b| b.ok())
                .find(|b| b.label.ends_with("CERTIFICATE REQUEST"))
                .ok_or_else(|| Error::Config("no certificate request found in PEM".into()))?;
            block.contents
        } else {
            bytes.to_vec()
        };

        let (_, csr) = X509CertificationRequest::from_der(&der)
            .map_err(|e| Error::Config(format!("invalid CSR: {}", e)))?;

        let common_name = csr
            .certification_request_info
            .subject
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(|s| s.to_string());

        let mut san = vec![];
        if let Some(exts) = csr.requested_extensions() {
            for ext in exts {
                if let ParsedExtension::SubjectAlternativeName(names) = ext {
                    san.extend(general_names(&names.general_names));
                }
            }
        }

        let domains = merge_domains(common_name, san);
        if domains.is_empty() {
            return Err(Error::Config("CSR does not name any domain".into()));
        }

        let pem = X509Req::from_der(&der)?.to_pem()?;

        Ok(CsrInput { der, pem, domains })
    }
}
