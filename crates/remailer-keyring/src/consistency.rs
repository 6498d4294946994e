//! Comparing a parsed descriptor against current configuration.
//!
//! Grounded in `checkDescriptorConsistency`/`_WarnWrapper` in
//! `ServerKeys.py`: a single pass over the descriptor's fields, counting
//! "real" errors (which demand regeneration) separately from
//! operator-can't-fix-this warnings (which are logged but don't count),
//! and a record of every message raised either way so the caller can
//! print a report without re-running the comparison.

use crate::config::KeyringConfig;
use crate::descriptor::{previous_midnight, ServerDescriptor};
use crate::platform::platform_summary;

/// The outcome of comparing a descriptor against configuration.
///
/// Mirrors the three-way string return of `checkDescriptorConsistency`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Verdict {
    /// The descriptor matches configuration exactly.
    Good,
    /// The descriptor differs only cosmetically; no need to regenerate.
    SoSo,
    /// The descriptor should be regenerated.
    Bad,
}

/// A structured record of a consistency check: the verdict plus every
/// warning message raised while producing it, so a caller can print a
/// report without re-running the comparison with `log = true`.
#[derive(Clone, Debug)]
pub struct ConsistencyReport {
    /// The overall verdict.
    pub verdict: Verdict,
    /// Every warning message raised, in the order they were found.
    pub warnings: Vec<String>,
}

/// Accumulates warnings while walking a descriptor's fields, mirroring
/// `_WarnWrapper`.
struct WarnWrapper {
    log: bool,
    is_published: bool,
    errors: i32,
    called: bool,
    messages: Vec<String>,
}

impl WarnWrapper {
    fn new(log: bool, is_published: bool) -> Self {
        WarnWrapper {
            log,
            is_published,
            errors: 0,
            called: false,
            messages: Vec::new(),
        }
    }

    /// Raise a warning that counts as a real inconsistency.
    fn warn(&mut self, message: impl Into<String>) {
        self.called = true;
        self.errors += 1;
        self.record(message.into());
    }

    /// Raise a warning the operator can't act on: noted, but does not by
    /// itself force a regeneration. Mirrors the original's pattern of
    /// calling `warn(...)` and then decrementing `self.errors` right
    /// back down.
    fn warn_only(&mut self, message: impl Into<String>) {
        self.called = true;
        self.record(message.into());
    }

    fn record(&mut self, mut message: String) {
        if !self.is_published {
            message = message.replace("published", "in unpublished descriptor");
        }
        if self.log {
            tracing::warn!("{message}");
        }
        self.messages.push(message);
    }

    fn finish(self) -> ConsistencyReport {
        let verdict = if self.errors > 0 {
            Verdict::Bad
        } else if self.called {
            Verdict::SoSo
        } else {
            Verdict::Good
        };
        ConsistencyReport {
            verdict,
            warnings: self.messages,
        }
    }
}

/// Compare `descriptor` against `config`, returning a verdict and the
/// warnings raised while producing it.
///
/// Mirrors `checkDescriptorConsistency` field-for-field. If `log` is
/// true, every warning is also emitted via `tracing::warn!`. `is_published`
/// controls whether warning text says "published" or "in unpublished
/// descriptor", matching `_WarnWrapper`'s rewrite.
pub fn check_consistency(
    descriptor: &ServerDescriptor,
    config: &KeyringConfig,
    log: bool,
    is_published: bool,
) -> ConsistencyReport {
    let mut warn = WarnWrapper::new(log, is_published);

    if descriptor.nickname != config.nickname {
        warn.warn(format!(
            "mismatched nicknames: {} in configuration; {} published",
            config.nickname, descriptor.nickname
        ));
    }

    if descriptor.identity_bits != config.identity_key_bits {
        // We can't do anything about this from here: the identity key is
        // long-lived and was already generated at some earlier bit size.
        warn.warn_only(format!(
            "mismatched identity bits: {} in configuration; {} published",
            config.identity_key_bits, descriptor.identity_bits
        ));
    }

    if config.contact != descriptor.contact {
        warn.warn(format!(
            "mismatched contacts: {:?} in configuration; {:?} published",
            config.contact, descriptor.contact
        ));
    }
    if config.contact_fingerprint != descriptor.contact_fingerprint {
        warn.warn("mismatched contact fingerprints");
    }

    let current_software = format!("remailer-keyring {}", env!("CARGO_PKG_VERSION"));
    if !descriptor.raw.is_empty() {
        let published_software = descriptor_software_line(descriptor);
        if let Some(published_software) = published_software {
            if published_software != current_software {
                warn.warn(format!(
                    "mismatched versions: running {current_software}; {published_software} published"
                ));
            }
        }
    }

    if config.comments != descriptor.comments {
        warn.warn("mismatched comments field");
    }

    if previous_midnight(descriptor.valid_until)
        != previous_midnight(descriptor.valid_after + config.public_key_lifetime)
    {
        // Future keys will be generated with the correct lifetime; there's
        // nothing to do about an already-published one.
        warn.warn_only("published lifetime does not match PublicKeyLifetime");
    }

    let insecurities = config.insecurities();
    if !insecurities.is_empty() {
        let why = insecurities.join(", ");
        if descriptor.secure_configuration || descriptor.why_insecure.as_deref() != Some(&why) {
            warn.warn(format!(
                "mismatched Secure-Configuration: {:?} {:?} {:?}",
                descriptor.secure_configuration, descriptor.why_insecure, why
            ));
        }
    } else if !descriptor.secure_configuration || descriptor.why_insecure.is_some() {
        warn.warn("mismatched Secure-Configuration");
    }

    match &descriptor.incoming {
        Some(incoming) => {
            if incoming.port != config.incoming_port {
                warn.warn(format!(
                    "mismatched ports: {} configured; {} published",
                    config.incoming_port, incoming.port
                ));
            }
            match &config.hostname {
                None => {
                    if let Some(guessed) = crate::ipguess::local_fqdn() {
                        if guessed != incoming.hostname {
                            warn.warn(format!(
                                "mismatched hostnames: {guessed} guessed; {} published",
                                incoming.hostname
                            ));
                        }
                    }
                }
                Some(configured) => {
                    if *configured != incoming.hostname {
                        warn.warn(format!(
                            "mismatched hostnames: {configured} configured, {} published",
                            incoming.hostname
                        ));
                    }
                }
            }
        }
        None => {}
    }

    if config.incoming_enabled && descriptor.incoming.is_none() {
        warn.warn("incoming MMTP enabled but not published");
    } else if !config.incoming_enabled && descriptor.incoming.is_some() {
        warn.warn("incoming MMTP published but not enabled");
    }

    if config.outgoing_enabled && descriptor.outgoing.is_none() {
        warn.warn("outgoing MMTP enabled but not published");
    } else if !config.outgoing_enabled && descriptor.outgoing.is_some() {
        warn.warn("outgoing MMTP published but not enabled");
    }

    for module in &config.modules {
        let published = descriptor
            .modules_rendered
            .iter()
            .any(|(name, enabled)| name == module.section_name() && *enabled);
        if module.is_enabled() && !published {
            warn.warn(format!(
                "{} enabled, but not published",
                module.section_name()
            ));
        } else if !module.is_enabled() && published {
            warn.warn(format!(
                "{} published, but not enabled",
                module.section_name()
            ));
        }
    }

    if descriptor.platform != platform_summary() {
        warn.warn(format!(
            "mismatched platform: running {:?}, but {:?} published",
            platform_summary(),
            descriptor.platform
        ));
    }

    if warn.errors == 0 && descriptor.configuration_summary != config.configuration_summary() {
        warn.warn("configuration has changed since last publication");
    }

    warn.finish()
}

/// Extract the `Software:` field's value from a descriptor's raw text,
/// without pulling it into [`ServerDescriptor`] as a first-class field:
/// nothing else in this crate needs it, and [`crate::descriptor::parse`]
/// already hands back everything that does.
fn descriptor_software_line(descriptor: &ServerDescriptor) -> Option<String> {
    descriptor
        .raw
        .lines()
        .find_map(|line| line.strip_prefix("Software:").map(|v| v.trim().to_string()))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::KeyringConfigBuilder;
    use std::time::{Duration, SystemTime};

    fn config() -> KeyringConfig {
        KeyringConfigBuilder::default()
            .key_dir(std::path::PathBuf::from("/tmp/keys"))
            .work_dir(std::path::PathBuf::from("/tmp/work"))
            .nickname("TestNode".to_string())
            .directory_url("https://example.invalid/submit".to_string())
            .incoming_enabled(false)
            .outgoing_enabled(false)
            .build()
            .unwrap()
    }

    fn base_descriptor(cfg: &KeyringConfig) -> ServerDescriptor {
        let now = SystemTime::now();
        ServerDescriptor {
            nickname: cfg.nickname.clone(),
            identity_base64: String::new(),
            identity_bits: cfg.identity_key_bits,
            published: now,
            valid_after: now,
            valid_until: now + cfg.public_key_lifetime,
            packet_key_base64: String::new(),
            packet_versions: cfg.packet_versions.clone(),
            secure_configuration: false,
            why_insecure: Some(cfg.insecurities().join(", ")),
            contact: cfg.contact.clone(),
            contact_fingerprint: cfg.contact_fingerprint.clone(),
            comments: cfg.comments.clone(),
            incoming: None,
            outgoing: None,
            modules_rendered: Vec::new(),
            platform: platform_summary(),
            configuration_summary: cfg.configuration_summary(),
            raw: format!("Software: remailer-keyring {}\n", env!("CARGO_PKG_VERSION")),
        }
    }

    #[test]
    fn matching_descriptor_is_good() {
        let cfg = config();
        let desc = base_descriptor(&cfg);
        let report = check_consistency(&desc, &cfg, false, true);
        assert_eq!(report.verdict, Verdict::Good);
    }

    #[test]
    fn nickname_mismatch_is_bad() {
        let cfg = config();
        let mut desc = base_descriptor(&cfg);
        desc.nickname = "other".to_string();
        let report = check_consistency(&desc, &cfg, false, true);
        assert_eq!(report.verdict, Verdict::Bad);
        assert!(report.warnings.iter().any(|w| w.contains("nicknames")));
    }

    #[test]
    fn identity_bits_mismatch_is_warning_only() {
        let cfg = config();
        let mut desc = base_descriptor(&cfg);
        desc.identity_bits = 4096;
        let report = check_consistency(&desc, &cfg, false, true);
        assert_eq!(report.verdict, Verdict::SoSo);
    }

    #[test]
    fn unpublished_rewrites_warning_text() {
        let cfg = config();
        let mut desc = base_descriptor(&cfg);
        desc.nickname = "other".to_string();
        let report = check_consistency(&desc, &cfg, false, false);
        assert!(report
            .warnings
            .iter()
            .any(|w| w.contains("in unpublished descriptor")));
    }

    #[test]
    fn lifetime_mismatch_is_warning_only() {
        let cfg = config();
        let mut desc = base_descriptor(&cfg);
        desc.valid_until = desc.valid_after + Duration::from_secs(60 * 60 * 24 * 10);
        let report = check_consistency(&desc, &cfg, false, true);
        assert_eq!(report.verdict, Verdict::SoSo);
    }

    #[test]
    fn enabled_but_unpublished_incoming_is_bad() {
        let mut b = KeyringConfigBuilder::default();
        b.key_dir(std::path::PathBuf::from("/tmp/keys"))
            .work_dir(std::path::PathBuf::from("/tmp/work"))
            .nickname("TestNode".to_string())
            .directory_url("https://example.invalid/submit".to_string())
            .incoming_enabled(true)
            .outgoing_enabled(false);
        let cfg = b.build().unwrap();
        let desc = base_descriptor(&cfg);
        let report = check_consistency(&desc, &cfg, false, true);
        assert_eq!(report.verdict, Verdict::Bad);
    }
}
