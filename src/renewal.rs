//! Deciding when a stored certificate is renewed.
//!
//! The CA's ACME Renewal Information (ARI) takes precedence when it names a time we are
//! prepared to act on. Otherwise a calendar heuristic applies: either an explicit number
//! of days before expiry, or a third of the certificate's lifetime (half for certificates
//! living ten days or less).
use rand::Rng;
use std::io::IsTerminal;
use std::time::Duration;
use time::OffsetDateTime;

use crate::api::ApiSuggestedWindow;
use crate::cert::CertInfo;
use crate::util::base64url;
use crate::wait::Cancel;
use crate::{Error, Result};

/// Default upper bound of the random delay before renewing.
pub const DEFAULT_JITTER: Duration = Duration::from_secs(8 * 60);

/// Renewal settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenewalOptions {
    /// Renew this many days before expiry. Negative renews every time. `None` uses a
    /// threshold relative to the certificate's lifetime.
    pub days: Option<i64>,
    /// Renew regardless of timing.
    pub force: bool,
    /// Use the domains of the stored certificate instead of the requested ones.
    pub force_cert_domains: bool,
    /// Don't ask the CA for renewal information.
    pub ari_disable: bool,
    /// How long we are willing to sleep for a renewal time suggested by the CA.
    pub ari_wait_to_renew: Duration,
    /// Skip the random delay before renewing.
    pub no_random_sleep: bool,
    /// Upper bound of the random delay.
    pub jitter: Duration,
    /// Reuse the private key of the stored certificate.
    pub reuse_key: bool,
}

impl Default for RenewalOptions {
    fn default() -> Self {
        RenewalOptions {
            days: None,
            force: false,
            force_cert_domains: false,
            ari_disable: false,
            ari_wait_to_renew: Duration::ZERO,
            no_random_sleep: false,
            jitter: DEFAULT_JITTER,
            reuse_key: false,
        }
    }
}

/// Why a renewal does (or doesn't) happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalReason {
    Forced,
    DomainsChanged,
    RenewalInfo,
    Expiring,
    NotDue,
}

/// The outcome of [`RenewalPolicy::decide`].
///
/// [`RenewalPolicy::decide`]: struct.RenewalPolicy.html#method.decide
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenewalDecision {
    pub renew: bool,
    pub reason: RenewalReason,
    /// Sleep until this time before renewing.
    pub sleep_until: Option<OffsetDateTime>,
    /// Domains to put in the new order.
    pub domains: Vec<String>,
    /// ARI CertID of the certificate being replaced.
    pub replaces: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RenewalPolicy {
    options: RenewalOptions,
}

impl RenewalPolicy {
    pub fn new(options: RenewalOptions) -> Self {
        RenewalPolicy { options }
    }

    pub fn options(&self) -> &RenewalOptions {
        &self.options
    }

    /// Decide whether `cert` is renewed now.
    ///
    /// `requested` are the domains asked for in this run, empty meaning "the certificate's
    /// domains". `ari` is the CA's suggested window, `None` when unavailable.
    pub fn decide<R: Rng>(
        &self,
        cert: &CertInfo,
        requested: &[String],
        ari: Option<&ApiSuggestedWindow>,
        now: OffsetDateTime,
        rng: &mut R,
    ) -> Result<RenewalDecision> {
        if cert.is_ca {
            return Err(Error::Storage(
                "refusing to renew a CA certificate".into(),
            ));
        }

        let opts = &self.options;

        let drift = !opts.force_cert_domains
            && !requested.is_empty()
            && sorted(requested) != sorted(&cert.domains);

        let domains = if opts.force_cert_domains || requested.is_empty() {
            cert.domains.clone()
        } else {
            requested.to_vec()
        };

        let replaces = if opts.ari_disable {
            None
        } else {
            match ari_cert_id(cert) {
                Ok(id) => Some(id),
                Err(e) => {
                    debug!("No ARI CertID: {}", e);
                    None
                }
            }
        };

        let decision = |renew, reason, sleep_until| RenewalDecision {
            renew,
            reason,
            sleep_until,
            domains: domains.clone(),
            replaces: replaces.clone(),
        };

        if opts.force {
            return Ok(decision(true, RenewalReason::Forced, None));
        }

        if drift {
            return Ok(decision(true, RenewalReason::DomainsChanged, None));
        }

        if let Some(window) = ari.filter(|_| !opts.ari_disable) {
            if let Some(at) = should_renew_at(window, now, opts.ari_wait_to_renew, rng) {
                let sleep_until = if at > now { Some(at) } else { None };
                return Ok(decision(true, RenewalReason::RenewalInfo, sleep_until));
            }
        }

        if needs_renewal(cert, opts.days, now) {
            return Ok(decision(true, RenewalReason::Expiring, None));
        }

        Ok(decision(false, RenewalReason::NotDue, None))
    }

    /// The random delay before renewing, `None` when disabled or when running in a
    /// terminal.
    pub fn jitter_delay<R: Rng>(&self, interactive: bool, rng: &mut R) -> Option<Duration> {
        if self.options.no_random_sleep || interactive {
            return None;
        }
        let max = self.options.jitter.as_millis() as u64;
        if max == 0 {
            return None;
        }
        Some(Duration::from_millis(rng.gen_range(0..max)))
    }

    /// Sleep the random delay, unless stdout is a terminal.
    pub fn jitter_sleep<R: Rng>(&self, cancel: &Cancel, rng: &mut R) -> Result<()> {
        let interactive = std::io::stdout().is_terminal();
        if let Some(delay) = self.jitter_delay(interactive, rng) {
            info!("renewal: random delay of {:?}", delay);
            cancel.sleep(delay)?;
        }
        Ok(())
    }
}

fn sorted(domains: &[String]) -> Vec<String> {
    let mut v: Vec<String> = domains.iter().map(|d| d.to_ascii_lowercase()).collect();
    v.sort();
    v.dedup();
    v
}

/// The calendar heuristic.
pub fn needs_renewal(cert: &CertInfo, days: Option<i64>, now: OffsetDateTime) -> bool {
    match days {
        Some(days) if days < 0 => true,
        Some(days) => {
            // thresholds reaching past the representable range are always due
            let due = days
                .checked_mul(86_400)
                .and_then(|secs| cert.not_after.checked_sub(time::Duration::seconds(secs)));
            match due {
                Some(due) => now >= due,
                None => true,
            }
        }
        None => {
            let lifetime = cert.not_after - cert.not_before;
            let lifetime_days = (lifetime.whole_hours() as f64 / 24.0).round() as i64;
            let divisor = if lifetime_days <= 10 { 2 } else { 3 };
            let due = cert.not_after - lifetime / divisor;
            if now >= due {
                true
            } else {
                debug!(
                    "Certificate expires {}, renewal due {}",
                    cert.not_after, due
                );
                false
            }
        }
    }
}

/// Pick a random time in the CA's window. Past times mean "now", future times within
/// `willing_to_sleep` are returned as they are, anything later gives `None`.
pub fn should_renew_at<R: Rng>(
    window: &ApiSuggestedWindow,
    now: OffsetDateTime,
    willing_to_sleep: Duration,
    rng: &mut R,
) -> Option<OffsetDateTime> {
    let span = (window.end - window.start).whole_milliseconds();
    let offset = if span > 0 {
        rng.gen_range(0..span.min(i64::MAX as i128) as i64)
    } else {
        0
    };
    let at = window.start + time::Duration::milliseconds(offset);

    if at < now {
        return Some(now);
    }
    let latest = time::Duration::try_from(willing_to_sleep)
        .ok()
        .and_then(|w| now.checked_add(w));
    match latest {
        Some(latest) if latest < at => None,
        // an unbounded wait reaches any window
        _ => Some(at),
    }
}

/// The ARI CertID: `base64url(AKI key id) "." base64url(serial)`.
pub fn ari_cert_id(cert: &CertInfo) -> Result<String> {
    let aki = cert
        .authority_key_id
        .as_ref()
        .ok_or_else(|| Error::Other("certificate has no authority key identifier".into()))?;
    if cert.serial.is_empty() {
        return Err(Error::Other("certificate has no serial number".into()));
    }
    Ok(format!("{}.{}", base64url(aki), base64url(&cert.serial)))
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use time::macros::datetime;

    fn cert(not_before: OffsetDateTime, days: i64, domains: &[&str]) -> CertInfo {
        CertInfo {
            domains: domains.iter().map(|d| d.to_string()).collect(),
            not_before,
            not_after: not_before + time::Duration::days(days),
            is_ca: false,
            serial: vec![0x87, 0x65, 0x43, 0x21],
            authority_key_id: Some(vec![0x69, 0x88, 0x5b, 0x6b]),
            issuer_common_name: None,
        }
    }

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    const T0: OffsetDateTime = datetime!(2025-01-01 0:00 UTC);

    #[test]
    fn test_dynamic_threshold_boundary() -> Result<()> {
        let c = cert(T0, 90, &["example.com"]);
        let policy = RenewalPolicy::new(RenewalOptions::default());

        let at_59 = policy.decide(&c, &[], None, T0 + time::Duration::days(59), &mut rng())?;
        assert!(!at_59.renew);
        assert_eq!(at_59.reason, RenewalReason::NotDue);

        let at_60 = policy.decide(&c, &[], None, T0 + time::Duration::days(60), &mut rng())?;
        assert!(at_60.renew);
        assert_eq!(at_60.reason, RenewalReason::Expiring);
        assert_eq!(at_60.domains, strings(&["example.com"]));
        Ok(())
    }

    #[test]
    fn test_short_lived_uses_half() {
        let c = cert(T0, 6, &["example.com"]);
        assert!(!needs_renewal(&c, None, T0 + time::Duration::hours(71)));
        assert!(needs_renewal(&c, None, T0 + time::Duration::hours(72)));
        // 10 days is still short lived
        let c = cert(T0, 10, &["example.com"]);
        assert!(needs_renewal(&c, None, T0 + time::Duration::days(5)));
        let c = cert(T0, 11, &["example.com"]);
        assert!(!needs_renewal(&c, None, T0 + time::Duration::days(5)));
    }

    #[test]
    fn test_explicit_days() {
        let c = cert(T0, 90, &["example.com"]);
        assert!(!needs_renewal(&c, Some(30), T0 + time::Duration::days(59)));
        assert!(needs_renewal(&c, Some(30), T0 + time::Duration::days(60)));
        assert!(needs_renewal(&c, Some(-1), T0));
    }

    #[test]
    fn test_huge_days_is_due() {
        let c = cert(T0, 90, &["example.com"]);
        assert!(needs_renewal(&c, Some(5_000_000), T0));
        assert!(needs_renewal(&c, Some(i64::MAX), T0));
    }

    #[test]
    fn test_unbounded_ari_wait() -> Result<()> {
        let c = cert(T0, 90, &["example.com"]);
        let now = T0 + time::Duration::days(1);
        let window = ApiSuggestedWindow {
            start: T0 + time::Duration::days(60),
            end: T0 + time::Duration::days(61),
        };
        let policy = RenewalPolicy::new(RenewalOptions {
            ari_wait_to_renew: Duration::MAX,
            ..Default::default()
        });
        let d = policy.decide(&c, &[], Some(&window), now, &mut rng())?;
        assert!(d.renew);
        assert_eq!(d.reason, RenewalReason::RenewalInfo);
        let at = d.sleep_until.expect("sleep until window");
        assert!(at >= window.start && at <= window.end);
        Ok(())
    }

    #[test]
    fn test_ari_window_in_past_renews_now() -> Result<()> {
        let c = cert(T0, 90, &["example.com"]);
        let now = T0 + time::Duration::days(10);
        let window = ApiSuggestedWindow {
            start: T0 + time::Duration::days(5),
            end: T0 + time::Duration::days(6),
        };
        let policy = RenewalPolicy::new(RenewalOptions::default());
        let d = policy.decide(&c, &[], Some(&window), now, &mut rng())?;
        assert!(d.renew);
        assert_eq!(d.reason, RenewalReason::RenewalInfo);
        assert_eq!(d.sleep_until, None);
        assert_eq!(d.replaces.as_deref(), Some("aYhbaw.h2VDIQ"));
        Ok(())
    }

    #[test]
    fn test_ari_window_within_sleep_bound() -> Result<()> {
        let c = cert(T0, 90, &["example.com"]);
        let now = T0 + time::Duration::days(10);
        let window = ApiSuggestedWindow {
            start: now + time::Duration::hours(1),
            end: now + time::Duration::hours(2),
        };
        let policy = RenewalPolicy::new(RenewalOptions {
            ari_wait_to_renew: Duration::from_secs(3 * 3600),
            ..Default::default()
        });
        let d = policy.decide(&c, &[], Some(&window), now, &mut rng())?;
        assert!(d.renew);
        let at = d.sleep_until.expect("sleep until window");
        assert!(at >= window.start && at <= window.end);
        Ok(())
    }

    #[test]
    fn test_ari_window_far_away_falls_back_to_heuristic() -> Result<()> {
        let c = cert(T0, 90, &["example.com"]);
        let window = ApiSuggestedWindow {
            start: T0 + time::Duration::days(70),
            end: T0 + time::Duration::days(71),
        };
        let policy = RenewalPolicy::new(RenewalOptions::default());

        let early = policy.decide(&c, &[], Some(&window), T0 + time::Duration::days(20), &mut rng())?;
        assert!(!early.renew);

        // the heuristic still applies when the CA's window is later than it
        let late = policy.decide(&c, &[], Some(&window), T0 + time::Duration::days(61), &mut rng())?;
        assert!(late.renew);
        assert_eq!(late.reason, RenewalReason::Expiring);
        Ok(())
    }

    #[test]
    fn test_ari_disabled_ignores_window() -> Result<()> {
        let c = cert(T0, 90, &["example.com"]);
        let window = ApiSuggestedWindow {
            start: T0,
            end: T0 + time::Duration::days(1),
        };
        let policy = RenewalPolicy::new(RenewalOptions {
            ari_disable: true,
            ..Default::default()
        });
        let d = policy.decide(&c, &[], Some(&window), T0 + time::Duration::days(20), &mut rng())?;
        assert!(!d.renew);
        assert_eq!(d.replaces, None);
        Ok(())
    }

    #[test]
    fn test_domain_drift() -> Result<()> {
        let c = cert(T0, 90, &["a.com"]);
        let now = T0 + time::Duration::days(1);
        let requested = strings(&["a.com", "b.com"]);

        let policy = RenewalPolicy::new(RenewalOptions::default());
        let d = policy.decide(&c, &requested, None, now, &mut rng())?;
        assert!(d.renew);
        assert_eq!(d.reason, RenewalReason::DomainsChanged);
        assert_eq!(d.domains, requested);

        // order doesn't matter
        let c2 = cert(T0, 90, &["b.com", "a.com"]);
        assert!(!policy.decide(&c2, &requested, None, now, &mut rng())?.renew);

        let pinned = RenewalPolicy::new(RenewalOptions {
            force_cert_domains: true,
            ..Default::default()
        });
        let d = pinned.decide(&c, &requested, None, now, &mut rng())?;
        assert!(!d.renew);
        assert_eq!(d.domains, strings(&["a.com"]));
        Ok(())
    }

    #[test]
    fn test_force() -> Result<()> {
        let c = cert(T0, 90, &["example.com"]);
        let policy = RenewalPolicy::new(RenewalOptions {
            force: true,
            ..Default::default()
        });
        let d = policy.decide(&c, &[], None, T0, &mut rng())?;
        assert!(d.renew);
        assert_eq!(d.reason, RenewalReason::Forced);
        Ok(())
    }

    #[test]
    fn test_ca_certificate_is_an_error() {
        let mut c = cert(T0, 90, &["example.com"]);
        c.is_ca = true;
        let policy = RenewalPolicy::new(RenewalOptions::default());
        assert!(policy.decide(&c, &[], None, T0, &mut rng()).is_err());
    }

    #[test]
    fn test_ari_cert_id() -> Result<()> {
        // example from the ARI draft
        let c = CertInfo {
            serial: vec![0x00, 0x87, 0x65, 0x43, 0x21],
            authority_key_id: Some(vec![
                0x69, 0x88, 0x5b, 0x6b, 0x87, 0x46, 0x40, 0x41, 0xe1, 0xb3, 0x7b, 0x84, 0x7b,
                0xa0, 0xae, 0x2c, 0xde, 0x01, 0xc8, 0xd4,
            ]),
            ..cert(T0, 90, &[])
        };
        assert_eq!(ari_cert_id(&c)?, "aYhba4dGQEHhs3uEe6CuLN4ByNQ.AIdlQyE");

        let mut no_aki = c;
        no_aki.authority_key_id = None;
        assert!(ari_cert_id(&no_aki).is_err());
        Ok(())
    }

    #[test]
    fn test_jitter() {
        let policy = RenewalPolicy::new(RenewalOptions::default());
        let d = policy.jitter_delay(false, &mut rng()).unwrap();
        assert!(d < DEFAULT_JITTER);
        assert_eq!(policy.jitter_delay(true, &mut rng()), None);

        let quiet = RenewalPolicy::new(RenewalOptions {
            no_random_sleep: true,
            ..Default::default()
        });
        assert_eq!(quiet.jitter_delay(false, &mut rng()), None);
    }
}
