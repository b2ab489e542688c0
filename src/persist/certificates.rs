//! Issued certificates, their keys and export formats.
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, Private};
use openssl::stack::Stack;
use openssl::x509::X509;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use time::OffsetDateTime;

use super::{create_dir_all, read_file, sanitized_domain, storage_err, write_atomic};
use crate::cert::{pem_chain_to_der, private_key_from_pem, CertInfo};
use crate::util::{base64_bytes, base64_vec};
use crate::{Error, Result};

const CERTIFICATES_DIR: &str = "certificates";
const ARCHIVES_DIR: &str = "archives";

/// `errno` of a rename across file systems.
const EXDEV: i32 = 18;

/// An issued certificate with everything needed to renew or revoke it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateResource {
    /// Name the files are stored under, the first domain unless chosen otherwise.
    #[serde(rename = "domain")]
    pub id: String,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(rename = "certUrl", default)]
    pub cert_url: String,
    #[serde(rename = "certStableUrl", default)]
    pub cert_stable_url: String,
    /// PEM, the leaf first.
    #[serde(with = "base64_vec", default)]
    pub certificate: Vec<u8>,
    #[serde(
        rename = "issuerCertificate",
        with = "base64_bytes",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub issuer_certificate: Option<Vec<u8>>,
    /// `None` when issued for an operator supplied CSR.
    #[serde(
        rename = "privateKey",
        with = "base64_bytes",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub private_key: Option<Vec<u8>>,
    #[serde(with = "base64_bytes", default, skip_serializing_if = "Option::is_none")]
    pub csr: Option<Vec<u8>>,
}

/// PKCS#12 encryption profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PfxFormat {
    /// AES-256-CBC with a SHA-256 MAC.
    SHA256,
    /// Triple DES with a SHA-1 MAC, for older consumers.
    DES,
    /// 40-bit RC2 for certificates, for very old consumers.
    RC2,
}

impl Default for PfxFormat {
    fn default() -> Self {
        PfxFormat::SHA256
    }
}

impl FromStr for PfxFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "SHA256" => Ok(PfxFormat::SHA256),
            "DES" => Ok(PfxFormat::DES),
            "RC2" => Ok(PfxFormat::RC2),
            _ => Err(Error::Config(format!("invalid PFX format: {}", s))),
        }
    }
}

impl fmt::Display for PfxFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            PfxFormat::SHA256 => "SHA256",
            PfxFormat::DES => "DES",
            PfxFormat::RC2 => "RC2",
        };
        f.write_str(s)
    }
}

/// Which files to produce besides the certificate, issuer and key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportOptions {
    /// Keep the issuer chain in `<id>.crt`.
    pub bundle: bool,
    /// Write `<id>.pem`, certificate followed by key.
    pub pem: bool,
    /// Write `<id>.pfx`.
    pub pfx: bool,
    pub pfx_password: String,
    pub pfx_format: PfxFormat,
}

impl Default for ExportOptions {
    fn default() -> Self {
        ExportOptions {
            bundle: true,
            pem: false,
            pfx: false,
            pfx_password: "changeit".into(),
            pfx_format: PfxFormat::default(),
        }
    }
}

/// A certificate read back from `<id>.crt`.
#[derive(Debug, Clone)]
pub struct StoredCertificate {
    pub id: String,
    pub path: PathBuf,
    pub pem: Vec<u8>,
    pub leaf_der: Vec<u8>,
    pub info: CertInfo,
}

/// `<root>/certificates` and `<root>/archives`.
#[derive(Debug, Clone)]
pub struct CertificatesStorage {
    root: PathBuf,
    archive: PathBuf,
}

impl CertificatesStorage {
    pub fn new(root: &Path) -> Self {
        CertificatesStorage {
            root: root.join(CERTIFICATES_DIR),
            archive: root.join(ARCHIVES_DIR),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn archive_root(&self) -> &Path {
        &self.archive
    }

    /// `<root>/certificates/<sanitized id>.<ext>`
    pub fn path_of(&self, id: &str, ext: &str) -> PathBuf {
        self.root.join(format!("{}.{}", sanitized_domain(id), ext))
    }

    pub fn exists(&self, id: &str) -> bool {
        self.path_of(id, "crt").exists()
    }

    /// Write the resource's files. The metadata JSON goes last, so a crash leaves no
    /// JSON pointing at missing files.
    pub fn save(&self, resource: &CertificateResource, opts: &ExportOptions) -> Result<()> {
        if (opts.pem || opts.pfx) && resource.private_key.is_none() {
            return Err(Error::Config(
                "PEM and PFX export need the private key, which a CSR issuance doesn't have"
                    .into(),
            ));
        }
        if sanitized_domain(&resource.id).is_empty() {
            return Err(Error::Config(format!(
                "invalid certificate id: {:?}",
                resource.id
            )));
        }

        // everything that can fail on the data is done before the first write.
        let pfx = match (&resource.private_key, opts.pfx) {
            (Some(key), true) => Some(to_pfx(resource, key, opts)?),
            _ => None,
        };
        let json = serde_json::to_vec_pretty(resource)?;

        create_dir_all(&self.root)?;
        let id = &resource.id;

        write_atomic(&self.path_of(id, "crt"), &resource.certificate, false)?;

        if let Some(issuer) = resource.issuer_certificate.as_ref().filter(|i| !i.is_empty()) {
            write_atomic(&self.path_of(id, "issuer.crt"), issuer, false)?;
        }

        if let Some(key) = &resource.private_key {
            write_atomic(&self.path_of(id, "key"), key, true)?;
            if opts.pem {
                let mut pem = resource.certificate.clone();
                if !pem.ends_with(b"\n") {
                    pem.push(b'\n');
                }
                pem.extend_from_slice(key);
                write_atomic(&self.path_of(id, "pem"), &pem, true)?;
            }
        }

        if let Some(pfx) = pfx {
            write_atomic(&self.path_of(id, "pfx"), &pfx, true)?;
        }

        write_atomic(
            &self.path_of(id, "json"),
            &json,
            resource.private_key.is_some(),
        )?;

        debug!("[{}] Saved certificate files in {}", id, self.root.display());
        Ok(())
    }

    /// Move all files of `id` to the archive, prefixed with the current Unix time.
    ///
    /// Only `<base>.<ext>` (no dot in `ext`) and `<base>.issuer.crt` belong to `id`, so
    /// `example.com` never takes `example.com.au` or `www.example.com` with it.
    pub fn move_to_archive(&self, id: &str) -> Result<Vec<PathBuf>> {
        let base = sanitized_domain(id);
        if !self.root.exists() {
            return Ok(vec![]);
        }

        let mut names = vec![];
        for entry in fs::read_dir(&self.root).map_err(|e| storage_err(&self.root, e))? {
            let entry = entry.map_err(|e| storage_err(&self.root, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if belongs_to(&name, &base) {
                names.push(name);
            }
        }
        if names.is_empty() {
            return Ok(vec![]);
        }
        names.sort();

        create_dir_all(&self.archive)?;
        let prefix = self.archive_prefix(&names);

        let mut archived = vec![];
        for name in names {
            let from = self.root.join(&name);
            let to = self.archive.join(format!("{}.{}", prefix, name));
            fs::rename(&from, &to).map_err(|e| {
                if e.raw_os_error() == Some(EXDEV) {
                    Error::Storage(format!(
                        "cannot archive {} into {}: different file systems",
                        from.display(),
                        self.archive.display()
                    ))
                } else {
                    storage_err(&from, e)
                }
            })?;
            debug!("Archived {} to {}", from.display(), to.display());
            archived.push(to);
        }
        Ok(archived)
    }

    /// The current Unix time, with a counter appended when an earlier archive of the same
    /// second already took one of the `names`. Archived files are never replaced.
    fn archive_prefix(&self, names: &[String]) -> String {
        let ts = OffsetDateTime::now_utc().unix_timestamp();
        let taken = |prefix: &str| {
            names
                .iter()
                .any(|n| self.archive.join(format!("{}.{}", prefix, n)).exists())
        };
        let mut prefix = ts.to_string();
        let mut n = 1;
        while taken(&prefix) {
            prefix = format!("{}-{}", ts, n);
            n += 1;
        }
        prefix
    }

    /// Read `<id>.crt`. The first certificate in the file is the leaf, which must not be
    /// a CA certificate.
    pub fn read_certificate(&self, id: &str) -> Result<StoredCertificate> {
        read_certificate_file(id, &self.path_of(id, "crt"))
    }

    pub fn read_resource(&self, id: &str) -> Result<CertificateResource> {
        let path = self.path_of(id, "json");
        let json = read_file(&path)?;
        serde_json::from_slice(&json).map_err(|e| storage_err(&path, e))
    }

    pub fn read_private_key(&self, id: &str) -> Result<PKey<Private>> {
        let path = self.path_of(id, "key");
        let pem = read_file(&path)?;
        private_key_from_pem(&pem).map_err(|e| storage_err(&path, e))
    }

    /// All stored certificates, sorted by id.
    pub fn list(&self) -> Result<Vec<StoredCertificate>> {
        if !self.root.exists() {
            return Ok(vec![]);
        }
        let mut found = vec![];
        for entry in fs::read_dir(&self.root).map_err(|e| storage_err(&self.root, e))? {
            let entry = entry.map_err(|e| storage_err(&self.root, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || name.ends_with(".issuer.crt") {
                continue;
            }
            if let Some(id) = name.strip_suffix(".crt") {
                found.push(read_certificate_file(id, &entry.path())?);
            }
        }
        found.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(found)
    }
}

fn belongs_to(name: &str, base: &str) -> bool {
    if name == format!("{}.issuer.crt", base) {
        return true;
    }
    name.strip_prefix(base)
        .and_then(|rest| rest.strip_prefix('.'))
        .map(|ext| !ext.is_empty() && !ext.contains('.'))
        .unwrap_or(false)
}

fn read_certificate_file(id: &str, path: &Path) -> Result<StoredCertificate> {
    if !path.exists() {
        return Err(Error::Storage(format!(
            "no certificate for {} at {}",
            id,
            path.display()
        )));
    }
    let pem = read_file(path)?;
    let ders = pem_chain_to_der(&pem).map_err(|e| storage_err(path, e))?;
    let leaf_der = ders
        .into_iter()
        .next()
        .ok_or_else(|| storage_err(path, "no certificate in file"))?;
    let info = CertInfo::from_der(&leaf_der).map_err(|e| storage_err(path, e))?;
    if info.is_ca {
        return Err(storage_err(path, "certificate bundle starts with a CA certificate"));
    }
    Ok(StoredCertificate {
        id: id.to_string(),
        path: path.to_path_buf(),
        pem,
        leaf_der,
        info,
    })
}

fn to_pfx(resource: &CertificateResource, key_pem: &[u8], opts: &ExportOptions) -> Result<Vec<u8>> {
    let key = private_key_from_pem(key_pem)?;
    let mut certs = X509::stack_from_pem(&resource.certificate)?.into_iter();
    let leaf = certs
        .next()
        .ok_or_else(|| Error::Storage("no certificate to export".into()))?;

    let mut ca = Stack::new()?;
    for c in certs {
        ca.push(c)?;
    }
    if let Some(issuer) = &resource.issuer_certificate {
        // a bundled .crt already carries the issuers.
        if ca.is_empty() {
            for c in X509::stack_from_pem(issuer)? {
                ca.push(c)?;
            }
        }
    }

    let (key_alg, cert_alg, mac) = match opts.pfx_format {
        PfxFormat::SHA256 => (Nid::AES_256_CBC, Nid::AES_256_CBC, MessageDigest::sha256()),
        PfxFormat::DES => (
            Nid::PBE_WITHSHA1AND3_KEY_TRIPLEDES_CBC,
            Nid::PBE_WITHSHA1AND3_KEY_TRIPLEDES_CBC,
            MessageDigest::sha1(),
        ),
        PfxFormat::RC2 => (
            Nid::PBE_WITHSHA1AND3_KEY_TRIPLEDES_CBC,
            Nid::PBE_WITHSHA1AND40BITRC2_CBC,
            MessageDigest::sha1(),
        ),
    };

    let mut builder = Pkcs12::builder();
    builder
        .name(&resource.id)
        .pkey(&key)
        .cert(&leaf)
        .ca(ca)
        .key_algorithm(key_alg)
        .cert_algorithm(cert_alg)
        .mac_md(mac);
    let pfx = builder.build2(&opts.pfx_password)?;
    Ok(pfx.to_der()?)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cert::test::TestCa;

    fn resource(ca: &TestCa, id: &str, with_key: bool) -> Result<CertificateResource> {
        let now = OffsetDateTime::now_utc();
        let (leaf, issuer, key) = ca.issue_pem(&[id], now, now + time::Duration::days(90))?;
        Ok(CertificateResource {
            id: id.into(),
            domains: vec![id.into()],
            cert_url: "https://ca.example/cert/1".into(),
            cert_stable_url: "https://ca.example/cert/1".into(),
            certificate: leaf,
            issuer_certificate: Some(issuer),
            private_key: if with_key { Some(key) } else { None },
            csr: None,
        })
    }

    #[test]
    fn test_save_and_read_back() -> Result<()> {
        let root = tempfile::tempdir()?;
        let store = CertificatesStorage::new(root.path());
        let ca = TestCa::new("Test CA")?;
        let res = resource(&ca, "example.com", true)?;

        let opts = ExportOptions {
            pem: true,
            pfx: true,
            ..Default::default()
        };
        store.save(&res, &opts)?;

        for ext in &["crt", "issuer.crt", "key", "pem", "pfx", "json"] {
            assert!(store.path_of("example.com", ext).exists(), "{}", ext);
        }
        assert!(store.exists("example.com"));
        assert_eq!(store.read_resource("example.com")?, res);

        let stored = store.read_certificate("example.com")?;
        assert_eq!(stored.info.domains, vec!["example.com"]);
        store.read_private_key("example.com")?;

        let pfx = Pkcs12::from_der(&fs::read(store.path_of("example.com", "pfx"))?)?;
        let parsed = pfx.parse2("changeit")?;
        assert!(parsed.pkey.is_some());
        assert_eq!(parsed.ca.map(|c| c.len()), Some(1));

        let pem = fs::read_to_string(store.path_of("example.com", "pem"))?;
        let cert_at = pem.find("BEGIN CERTIFICATE").unwrap();
        let key_at = pem.find("PRIVATE KEY").unwrap();
        assert!(cert_at < key_at);
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_key_files_are_private() -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        let root = tempfile::tempdir()?;
        let store = CertificatesStorage::new(root.path());
        let ca = TestCa::new("Test CA")?;
        store.save(&resource(&ca, "example.com", true)?, &ExportOptions::default())?;
        let mode = |ext: &str| -> Result<u32> {
            Ok(fs::metadata(store.path_of("example.com", ext))?
                .permissions()
                .mode()
                & 0o777)
        };
        assert_eq!(mode("key")?, 0o600);
        assert_eq!(mode("json")?, 0o600);
        assert_eq!(mode("crt")?, 0o644);
        Ok(())
    }

    #[test]
    fn test_pem_without_key_is_rejected_before_writing() -> Result<()> {
        let root = tempfile::tempdir()?;
        let store = CertificatesStorage::new(root.path());
        let ca = TestCa::new("Test CA")?;
        let res = resource(&ca, "example.com", false)?;
        let opts = ExportOptions {
            pem: true,
            ..Default::default()
        };
        assert!(matches!(store.save(&res, &opts), Err(Error::Config(_))));
        assert!(!store.root().exists());

        // without exports the CSR resource is fine
        store.save(&res, &ExportOptions::default())?;
        assert!(!store.path_of("example.com", "key").exists());
        Ok(())
    }

    #[test]
    fn test_pfx_format_names() {
        assert_eq!("des".parse::<PfxFormat>().unwrap(), PfxFormat::DES);
        assert_eq!("SHA256".parse::<PfxFormat>().unwrap(), PfxFormat::SHA256);
        assert!(matches!("md5".parse::<PfxFormat>(), Err(Error::Config(_))));
    }

    #[test]
    fn test_archive_is_exact() -> Result<()> {
        let root = tempfile::tempdir()?;
        let store = CertificatesStorage::new(root.path());
        let ca = TestCa::new("Test CA")?;
        let others = ["www.example.com", "example.com.au", "example.com.example.org"];
        for id in ["example.com"].iter().chain(others.iter()) {
            store.save(&resource(&ca, id, true)?, &ExportOptions::default())?;
        }

        let archived = store.move_to_archive("example.com")?;
        // crt, issuer.crt, key, json
        assert_eq!(archived.len(), 4);
        assert!(!store.exists("example.com"));
        for other in &others {
            assert!(store.exists(other), "{}", other);
            assert!(store.path_of(other, "issuer.crt").exists(), "{}", other);
            assert!(store.path_of(other, "json").exists(), "{}", other);
        }

        for path in &archived {
            let name = path.file_name().unwrap().to_string_lossy().into_owned();
            let (ts, rest) = name.split_once('.').unwrap();
            assert!(ts.parse::<i64>().is_ok());
            assert!(rest.starts_with("example.com."));
        }

        let ids: Vec<String> = store.list()?.into_iter().map(|c| c.id).collect();
        assert_eq!(
            ids,
            vec!["example.com.au", "example.com.example.org", "www.example.com"]
        );
        Ok(())
    }

    #[test]
    fn test_archive_twice_in_one_second_keeps_both() -> Result<()> {
        let root = tempfile::tempdir()?;
        let store = CertificatesStorage::new(root.path());
        let ca = TestCa::new("Test CA")?;

        store.save(&resource(&ca, "example.com", true)?, &ExportOptions::default())?;
        let first_pem = fs::read(store.path_of("example.com", "crt"))?;
        let first = store.move_to_archive("example.com")?;

        store.save(&resource(&ca, "example.com", true)?, &ExportOptions::default())?;
        let second = store.move_to_archive("example.com")?;

        assert_eq!(first.len(), 4);
        assert_eq!(second.len(), 4);
        assert_eq!(fs::read_dir(store.archive_root())?.count(), 8);
        for path in &first {
            assert!(path.exists());
            assert!(!second.contains(path));
        }
        let first_crt = first
            .iter()
            .find(|p| p.to_string_lossy().ends_with("example.com.crt"))
            .unwrap();
        assert_eq!(fs::read(first_crt)?, first_pem);
        Ok(())
    }

    #[test]
    fn test_ca_leaf_is_rejected() -> Result<()> {
        let root = tempfile::tempdir()?;
        let store = CertificatesStorage::new(root.path());
        let ca = TestCa::new("Test CA")?;
        create_dir_all(store.root())?;
        fs::write(store.path_of("example.com", "crt"), ca.cert.to_pem()?)?;
        assert!(matches!(
            store.read_certificate("example.com"),
            Err(Error::Storage(_))
        ));

        fs::write(store.path_of("example.com", "crt"), b"")?;
        assert!(matches!(
            store.read_certificate("example.com"),
            Err(Error::Storage(_))
        ));
        Ok(())
    }
}
