use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use super::{Provider, ProviderSettings};
use crate::dns::challenge_info;
use crate::{Error, Result};

const DEFAULT_PROPAGATION_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(2);

/// `dns-01` provider delegating record management to an external program.
///
/// The program is called as
///
/// ```text
/// <EXEC_PATH> present <fqdn> <value>
/// <EXEC_PATH> cleanup <fqdn> <value>
/// ```
///
/// With `EXEC_MODE=RAW` it gets the unprocessed challenge instead:
///
/// ```text
/// <EXEC_PATH> present -- <domain> <token> <key authorization>
/// ```
///
/// Settings:
///
/// * `EXEC_PATH` (required)
/// * `EXEC_MODE` (`RAW` or unset)
/// * `EXEC_PROPAGATION_TIMEOUT` seconds, default 60
/// * `EXEC_POLLING_INTERVAL` seconds, default 2
/// * `EXEC_SEQUENCE_INTERVAL` seconds, handles one identifier at a time when set
#[derive(Debug, Clone)]
pub struct ExecProvider {
    program: PathBuf,
    raw: bool,
    propagation_timeout: Duration,
    polling_interval: Duration,
    sequence_interval: Option<Duration>,
}

impl ExecProvider {
    pub fn new<P: Into<PathBuf>>(program: P) -> Self {
        ExecProvider {
            program: program.into(),
            raw: false,
            propagation_timeout: DEFAULT_PROPAGATION_TIMEOUT,
            polling_interval: DEFAULT_POLLING_INTERVAL,
            sequence_interval: None,
        }
    }

    /// Registry constructor.
    pub fn from_settings(settings: &ProviderSettings) -> Result<Box<dyn Provider>> {
        let program = settings
            .get("EXEC_PATH")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::Config("exec: EXEC_PATH is required".into()))?;

        let mut provider = ExecProvider::new(program);
        provider.raw = match settings.get("EXEC_MODE").map(|s| s.as_str()) {
            None | Some("") => false,
            Some("RAW") => true,
            Some(other) => {
                return Err(Error::Config(format!("exec: unknown EXEC_MODE {}", other)));
            }
        };
        if let Some(d) = seconds(settings, "EXEC_PROPAGATION_TIMEOUT")? {
            provider.propagation_timeout = d;
        }
        if let Some(d) = seconds(settings, "EXEC_POLLING_INTERVAL")? {
            provider.polling_interval = d;
        }
        provider.sequence_interval = seconds(settings, "EXEC_SEQUENCE_INTERVAL")?;

        Ok(Box::new(provider))
    }

    fn args(&self, action: &str, domain: &str, token: &str, key_auth: &str) -> Vec<String> {
        if self.raw {
            vec![
                action.into(),
                "--".into(),
                domain.into(),
                token.into(),
                key_auth.into(),
            ]
        } else {
            let info = challenge_info(domain, key_auth);
            vec![action.into(), info.fqdn, info.value]
        }
    }

    fn exec(&self, action: &str, domain: &str, token: &str, key_auth: &str) -> Result<()> {
        let args = self.args(action, domain, token, key_auth);
        debug!("[{}] exec {} {}", domain, self.program.display(), action);
        let output = Command::new(&self.program).args(&args).output()?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        for line in stdout.lines() {
            info!("[{}] {}", domain, line);
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Other(format!(
                "exec {} {} failed ({}): {}",
                self.program.display(),
                action,
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }
}

impl Provider for ExecProvider {
    fn present(&self, domain: &str, token: &str, key_auth: &str) -> Result<()> {
        self.exec("present", domain, token, key_auth)
    }

    fn clean_up(&self, domain: &str, token: &str, key_auth: &str) -> Result<()> {
        self.exec("cleanup", domain, token, key_auth)
    }

    fn timeout(&self) -> Option<(Duration, Duration)> {
        Some((self.propagation_timeout, self.polling_interval))
    }

    fn sequential(&self) -> Option<Duration> {
        self.sequence_interval
    }
}

fn seconds(settings: &ProviderSettings, name: &str) -> Result<Option<Duration>> {
    match settings.get(name).map(|s| s.trim()) {
        None | Some("") => Ok(None),
        Some(v) => v
            .parse::<u64>()
            .map(|s| Some(Duration::from_secs(s)))
            .map_err(|_| Error::Config(format!("exec: {} must be seconds, got {}", name, v))),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn settings(pairs: &[(&str, &str)]) -> ProviderSettings {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_settings() -> Result<()> {
        let p = ExecProvider::from_settings(&settings(&[
            ("EXEC_PATH", "/bin/true"),
            ("EXEC_PROPAGATION_TIMEOUT", "120"),
            ("EXEC_POLLING_INTERVAL", "5"),
        ]))?;
        assert_eq!(
            p.timeout(),
            Some((Duration::from_secs(120), Duration::from_secs(5)))
        );
        assert_eq!(p.sequential(), None);

        let p = ExecProvider::from_settings(&settings(&[
            ("EXEC_PATH", "/bin/true"),
            ("EXEC_SEQUENCE_INTERVAL", "3"),
        ]))?;
        assert_eq!(p.sequential(), Some(Duration::from_secs(3)));

        assert!(ExecProvider::from_settings(&settings(&[])).is_err());
        assert!(ExecProvider::from_settings(&settings(&[
            ("EXEC_PATH", "/bin/true"),
            ("EXEC_POLLING_INTERVAL", "soon"),
        ]))
        .is_err());
        Ok(())
    }

    #[test]
    fn test_args() {
        let mut p = ExecProvider::new("/bin/true");
        let args = p.args("present", "*.example.com", "tok", "tok.thumb");
        assert_eq!(args[0], "present");
        assert_eq!(args[1], "_acme-challenge.example.com.");
        assert_eq!(args[2].len(), 43);

        p.raw = true;
        let args = p.args("cleanup", "example.com", "tok", "tok.thumb");
        assert_eq!(args, vec!["cleanup", "--", "example.com", "tok", "tok.thumb"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_failing_program() {
        let p = ExecProvider::new("/bin/false");
        assert!(p.present("example.com", "tok", "tok.thumb").is_err());
    }
}
