use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use serde::de::DeserializeOwned;

use crate::Result;

pub(crate) fn base64url<T: ?Sized + AsRef<[u8]>>(input: &T) -> String {
    URL_SAFE_NO_PAD.encode(input)
}

pub(crate) fn base64url_decode(input: &str) -> Result<Vec<u8>> {
    Ok(URL_SAFE_NO_PAD.decode(input.trim_end_matches('='))?)
}

pub(crate) fn read_json<T: DeserializeOwned>(res: ureq::Response) -> Result<T> {
    let res_body = res.into_string()?;
    trace!("{}", res_body);
    Ok(serde_json::from_str(&res_body)?)
}

/// Serde adapter storing `Option<Vec<u8>>` as a standard base64 string.
pub(crate) mod base64_bytes {
    use super::*;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<Vec<u8>>, s: S) -> std::result::Result<S::Ok, S::Error> {
        match v {
            Some(b) => s.serialize_str(&STANDARD.encode(b)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<Vec<u8>>, D::Error> {
        let v: Option<String> = Option::deserialize(d)?;
        match v {
            Some(s) if !s.is_empty() => STANDARD
                .decode(s.as_bytes())
                .map(Some)
                .map_err(serde::de::Error::custom),
            _ => Ok(None),
        }
    }
}

/// Serde adapter storing `Vec<u8>` as a standard base64 string.
pub(crate) mod base64_vec {
    use super::*;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[u8], s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_base64url_roundtrip_without_padding() {
        let enc = base64url(&[0xfb, 0xff, 0x01]);
        assert!(!enc.contains('='));
        assert!(!enc.contains('+'));
        assert_eq!(base64url_decode(&enc).unwrap(), vec![0xfb, 0xff, 0x01]);
    }
}
