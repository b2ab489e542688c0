use openssl::bn::{BigNum, BigNumContext};
use openssl::ecdsa::EcdsaSig;
use openssl::hash::{hash, MessageDigest};
use openssl::pkey::{self, PKey};
use openssl::sign::Signer;

use crate::cert::{private_key_from_pem, private_key_to_pem, KeyType};
use crate::jwt::Jwk;
use crate::util::base64url;
use crate::Result;

/// Account key plus the key id (account URL) once the CA told us.
#[derive(Clone)]
pub(crate) struct AcmeKey {
    key_type: KeyType,
    private_key: PKey<pkey::Private>,
    /// set once we contacted the ACME API to figure out the key id
    key_id: Option<String>,
}

impl AcmeKey {
    pub(crate) fn new(key_type: KeyType) -> Result<AcmeKey> {
        Ok(Self::from_key(key_type, key_type.generate()?))
    }

    pub(crate) fn from_pem(pem: &[u8]) -> Result<AcmeKey> {
        let pri_key = private_key_from_pem(pem)?;
        let key_type = KeyType::infer(&pri_key)?;
        Ok(Self::from_key(key_type, pri_key))
    }

    fn from_key(key_type: KeyType, private_key: PKey<pkey::Private>) -> AcmeKey {
        AcmeKey {
            key_type,
            private_key,
            key_id: None,
        }
    }

    pub(crate) fn to_pem(&self) -> Result<Vec<u8>> {
        private_key_to_pem(&self.private_key)
    }

    pub(crate) fn key_type(&self) -> KeyType {
        self.key_type
    }

    pub(crate) fn key_id(&self) -> Option<&str> {
        self.key_id.as_deref()
    }

    pub(crate) fn set_key_id(&mut self, kid: String) {
        self.key_id = Some(kid)
    }

    /// JWS algorithm for this key.
    pub(crate) fn alg(&self) -> &'static str {
        match self.key_type {
            KeyType::EC256 => "ES256",
            KeyType::EC384 => "ES384",
            _ => "RS256",
        }
    }

    pub(crate) fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        let (digest, width) = match self.key_type {
            KeyType::EC256 => (MessageDigest::sha256(), 32),
            KeyType::EC384 => (MessageDigest::sha384(), 48),
            _ => {
                let mut signer = Signer::new(MessageDigest::sha256(), &self.private_key)?;
                signer.update(data)?;
                return Ok(signer.sign_to_vec()?);
            }
        };

        // JWS wants the raw r || s, each left padded to the curve size.
        let digest = hash(digest, data)?;
        let sig = EcdsaSig::sign(&digest, &*self.private_key.ec_key()?)?;
        let mut v = sig.r().to_vec_padded(width)?;
        v.extend_from_slice(&sig.s().to_vec_padded(width)?);
        Ok(v)
    }

    pub(crate) fn jwk(&self) -> Result<Jwk> {
        if self.key_type.is_rsa() {
            let rsa = self.private_key.rsa()?;
            return Ok(Jwk {
                crv: None,
                e: Some(base64url(&rsa.e().to_vec())),
                kty: "RSA".into(),
                n: Some(base64url(&rsa.n().to_vec())),
                x: None,
                y: None,
            });
        }

        let (crv, width) = match self.key_type {
            KeyType::EC384 => ("P-384", 48),
            _ => ("P-256", 32),
        };
        let ec = self.private_key.ec_key()?;
        let mut ctx = BigNumContext::new()?;
        let mut x = BigNum::new()?;
        let mut y = BigNum::new()?;
        ec.public_key()
            .affine_coordinates_gfp(ec.group(), &mut x, &mut y, &mut ctx)?;
        Ok(Jwk {
            crv: Some(crv.into()),
            e: None,
            kty: "EC".into(),
            n: None,
            x: Some(base64url(&x.to_vec_padded(width)?)),
            y: Some(base64url(&y.to_vec_padded(width)?)),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_es256_signature_width_and_verify() -> Result<()> {
        let key = AcmeKey::new(KeyType::EC256)?;
        let sig = key.sign(b"hello")?;
        assert_eq!(sig.len(), 64);

        let r = BigNum::from_slice(&sig[..32])?;
        let s = BigNum::from_slice(&sig[32..])?;
        let sig = EcdsaSig::from_private_components(r, s)?;
        let digest = hash(MessageDigest::sha256(), b"hello")?;
        assert!(sig.verify(&digest, &*key.private_key.ec_key()?)?);
        Ok(())
    }

    #[test]
    fn test_es384_alg() -> Result<()> {
        let key = AcmeKey::new(KeyType::EC384)?;
        assert_eq!(key.alg(), "ES384");
        assert_eq!(key.sign(b"x")?.len(), 96);
        assert_eq!(key.jwk()?.crv.as_deref(), Some("P-384"));
        Ok(())
    }

    #[test]
    fn test_pem_roundtrip_keeps_type() -> Result<()> {
        let key = AcmeKey::new(KeyType::RSA2048)?;
        let back = AcmeKey::from_pem(&key.to_pem()?)?;
        assert_eq!(back.key_type(), KeyType::RSA2048);
        assert_eq!(back.alg(), "RS256");
        assert_eq!(back.jwk()?, key.jwk()?);
        Ok(())
    }
}
