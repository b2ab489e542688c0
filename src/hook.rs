//! Deploy hook, run after a certificate was saved.
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use crate::persist::CertificatesStorage;
use crate::wait::{poll, Cancel};
use crate::{Error, Result};

/// How long a hook may run unless configured otherwise.
pub const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(120);

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// What the hook is told about the certificate, as `ACME_*` environment variables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HookEnv {
    pub account_email: Option<String>,
    pub cert_domain: String,
    pub cert_path: Option<PathBuf>,
    pub cert_key_path: Option<PathBuf>,
    pub issuer_cert_path: Option<PathBuf>,
    pub cert_pem_path: Option<PathBuf>,
    pub cert_pfx_path: Option<PathBuf>,
}

impl HookEnv {
    /// The environment for the files of `id` in `storage`. Paths are only set for files
    /// that exist.
    pub fn for_saved(storage: &CertificatesStorage, id: &str, email: Option<&str>) -> HookEnv {
        let existing = |ext: &str| Some(storage.path_of(id, ext)).filter(|p| p.exists());
        HookEnv {
            account_email: email.map(|e| e.to_string()),
            cert_domain: id.to_string(),
            cert_path: existing("crt"),
            cert_key_path: existing("key"),
            issuer_cert_path: existing("issuer.crt"),
            cert_pem_path: existing("pem"),
            cert_pfx_path: existing("pfx"),
        }
    }

    pub fn vars(&self) -> Vec<(&'static str, String)> {
        fn path(p: &Path) -> String {
            p.to_string_lossy().into_owned()
        }
        let mut vars = vec![];
        if let Some(email) = &self.account_email {
            vars.push(("ACME_ACCOUNT_EMAIL", email.clone()));
        }
        vars.push(("ACME_CERT_DOMAIN", self.cert_domain.clone()));
        let paths = [
            ("ACME_CERT_PATH", &self.cert_path),
            ("ACME_CERT_KEY_PATH", &self.cert_key_path),
            ("ACME_ISSUER_CERT_PATH", &self.issuer_cert_path),
            ("ACME_CERT_PEM_PATH", &self.cert_pem_path),
            ("ACME_CERT_PFX_PATH", &self.cert_pfx_path),
        ];
        for (name, value) in paths {
            if let Some(p) = value {
                vars.push((name, path(p)));
            }
        }
        vars
    }
}

/// A shell command run with a deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hook {
    command: String,
    timeout: Duration,
}

impl Hook {
    pub fn new(command: &str, timeout: Duration) -> Self {
        Hook {
            command: command.to_string(),
            timeout,
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Run the command and wait for it. The child is killed when it runs past the
    /// timeout or `cancel` fires.
    pub fn run(&self, env: &HookEnv, cancel: &Cancel) -> Result<()> {
        info!("[{}] Running deploy hook: {}", env.cert_domain, self.command);

        let mut child = shell(&self.command)
            .envs(env.vars())
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| Error::Hook(format!("could not start `{}`: {}", self.command, e)))?;

        let waited = poll("deploy hook", POLL_INTERVAL, self.timeout, cancel, || {
            Ok(child.try_wait()?)
        });

        match waited {
            Ok(status) if status.success() => Ok(()),
            Ok(status) => Err(Error::Hook(format!("`{}` {}", self.command, status))),
            Err(e) => {
                if let Err(kill) = child.kill() {
                    debug!("Could not kill deploy hook: {}", kill);
                }
                let _ = child.wait();
                Err(match e {
                    Error::Timeout { .. } => Error::HookTimeout {
                        timeout: self.timeout,
                    },
                    other => other,
                })
            }
        }
    }
}

#[cfg(unix)]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(windows)]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}
