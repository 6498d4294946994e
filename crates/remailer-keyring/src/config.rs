//! Typed configuration consumed by the keyring.
//!
//! Configuration *parsing* (reading a config file, flags, environment)
//! is an external collaborator; this module only defines the typed
//! value the rest of the crate consumes, validated once at construction
//! the way `arti-relay`'s config types are validated by their
//! `derive_builder` builders rather than on first use.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use derive_builder::Builder;

use remailer_error::{internal, Error, ErrorDetail};

use crate::descriptor::ModuleDescriptor;

/// The mixing algorithm a server is configured to run.
///
/// Only `MixAlgorithm` itself is relevant here: the keyring needs to know
/// whether pool-size/rate options apply, and whether the algorithm counts
/// as "secure" for [`KeyringConfig::insecurities`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum MixAlgorithm {
    /// Mix strictly by wall-clock interval; pool size/rate are unused.
    TimedMixPool,
    /// Cottrell's mix algorithm.
    Cottrell,
    /// Binomial-distribution mix.
    Binomial,
}

impl MixAlgorithm {
    /// Whether this algorithm is on the "secure enough to not warn about"
    /// list, mirroring `ServerConfig.py`'s `_SECURE_MIX_RULES`.
    fn is_secure(self) -> bool {
        matches!(self, MixAlgorithm::Cottrell | MixAlgorithm::Binomial)
    }
}

/// Typed, validated server configuration.
///
/// Covers the fields a running keyring actually consults, plus the
/// handful `ServerConfig.py`'s `getInsecurities`/
/// `getConfigurationSummary` draw on, so those two accessors are real
/// rather than stubs.
#[derive(Clone, Debug, Builder)]
#[builder(build_fn(validate = "Self::validate", error = "Error"))]
pub struct KeyringConfig {
    /// Directory holding one subdirectory per keyset, plus the identity
    /// key and pinger seed. Mirrors `ServerConfig.getKeyDir`.
    pub key_dir: PathBuf,

    /// Work directory holding hash logs, DH parameters, and the current
    /// TLS certificate chain. Mirrors `ServerConfig.getWorkDir`.
    pub work_dir: PathBuf,

    /// Bits in a newly generated identity key; 2048..=4096 inclusive.
    #[builder(default = "2048")]
    pub identity_key_bits: u32,

    /// How long a generated keyset's public key remains valid.
    #[builder(default = "Duration::from_secs(60 * 60 * 24 * 30)")]
    pub public_key_lifetime: Duration,

    /// How long successive keysets' validity windows overlap; 6h..=72h.
    #[builder(default = "Duration::from_secs(60 * 60 * 24)")]
    pub public_key_overlap: Duration,

    /// Nickname advertised in the descriptor.
    pub nickname: String,

    /// Contact email advertised in the descriptor, if any.
    #[builder(default)]
    pub contact: Option<String>,

    /// Contact PGP/key fingerprint advertised in the descriptor, if any.
    #[builder(default)]
    pub contact_fingerprint: Option<String>,

    /// Free-form operator comments advertised in the descriptor, if any.
    #[builder(default)]
    pub comments: Option<String>,

    /// Whether this server accepts incoming MMTP connections.
    #[builder(default = "true")]
    pub incoming_enabled: bool,

    /// Whether this server makes outgoing MMTP connections.
    #[builder(default = "true")]
    pub outgoing_enabled: bool,

    /// Address this server publishes for incoming MMTP connections, or
    /// `None` to guess one via [`crate::ipguess::guess_local_ip`].
    #[builder(default)]
    pub published_ip: Option<IpAddr>,

    /// Hostname this server publishes for incoming MMTP connections, or
    /// `None` to guess the local FQDN.
    #[builder(default)]
    pub hostname: Option<String>,

    /// Port this server listens on for incoming MMTP connections.
    #[builder(default = "48099")]
    pub incoming_port: u16,

    /// Packet format versions this server's packet key can process,
    /// advertised verbatim as the descriptor's `Packet-Versions` field.
    #[builder(default = "\"0.3\".to_string()")]
    pub packet_versions: String,

    /// Configured Allow/Deny rules for incoming MMTP, in order.
    #[builder(default)]
    pub incoming_rules: Vec<crate::descriptor::AllowDenyRule>,

    /// Configured Allow/Deny rules for outgoing MMTP, in order.
    #[builder(default)]
    pub outgoing_rules: Vec<crate::descriptor::AllowDenyRule>,

    /// Delivery-module descriptor blocks to splice into the descriptor
    /// and check for enabled/published parity, keyed by the module
    /// manager the surrounding server owns.
    #[builder(default)]
    pub modules: Vec<Arc<dyn ModuleDescriptor>>,

    /// URL of the directory server's descriptor-submission endpoint.
    pub directory_url: String,

    /// Logging verbosity, mirrored from `Server.LogLevel`.
    #[builder(default = "LogLevel::Info")]
    pub log_level: LogLevel,

    /// Whether periodic statistics logging is enabled.
    #[builder(default = "false")]
    pub log_stats: bool,

    /// How often statistics are logged, if `log_stats` is set.
    #[builder(default = "Duration::from_secs(60 * 60 * 6)")]
    pub stats_interval: Duration,

    /// The configured mixing algorithm.
    #[builder(default = "MixAlgorithm::Cottrell")]
    pub mix_algorithm: MixAlgorithm,

    /// How often the mix pool is flushed.
    #[builder(default = "Duration::from_secs(60 * 60)")]
    pub mix_interval: Duration,

    /// Minimum number of messages held before a pool-based mix will flush.
    #[builder(default = "5")]
    pub mix_pool_min_size: i64,

    /// Fraction of the pool flushed per mix interval.
    #[builder(default = "0.6")]
    pub mix_pool_rate: f64,
}

/// Coarse log verbosity, mirroring `Server.LogLevel`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum LogLevel {
    /// Per-cell tracing, never appropriate in production.
    Trace,
    /// Verbose debugging output.
    Debug,
    /// Normal operational logging.
    Info,
    /// Warnings and errors only.
    Warn,
}

impl KeyringConfigBuilder {
    /// Validate cross-field and range invariants, mirroring
    /// `ServerConfig.validate`'s checks on `IdentityKeyBits`,
    /// `PublicKeyLifetime` and `PublicKeyOverlap`.
    fn validate(&self) -> Result<(), Error> {
        if let Some(bits) = self.identity_key_bits {
            if !(2048..=4096).contains(&bits) {
                return Err(ErrorDetail::Config(
                    "identity_key_bits must be between 2048 and 4096".into(),
                )
                .into());
            }
        }
        if let Some(lifetime) = self.public_key_lifetime {
            if lifetime < Duration::from_secs(24 * 60 * 60) {
                return Err(ErrorDetail::Config(
                    "public_key_lifetime must be at least 1 day".into(),
                )
                .into());
            }
        }
        if let Some(overlap) = self.public_key_overlap {
            if overlap < Duration::from_secs(6 * 60 * 60) {
                return Err(
                    ErrorDetail::Config("public_key_overlap must be >= 6 hours".into()).into(),
                );
            }
            if overlap > Duration::from_secs(72 * 60 * 60) {
                return Err(
                    ErrorDetail::Config("public_key_overlap must be <= 72 hours".into()).into(),
                );
            }
        }
        if let Some(min_size) = self.mix_pool_min_size {
            if min_size < 0 {
                return Err(
                    ErrorDetail::Config("mix_pool_min_size must be nonnegative".into()).into(),
                );
            }
        }
        match (
            &self.key_dir,
            &self.work_dir,
            &self.nickname,
            &self.directory_url,
        ) {
            (Some(_), Some(_), Some(_), Some(_)) => Ok(()),
            _ => Err(internal!("required config field missing post-builder-check").into()),
        }
    }
}

impl KeyringConfig {
    /// Returns an empty list if the configuration is reasonably secure;
    /// otherwise a list of reasons it isn't, mirroring
    /// `ServerConfig.getInsecurities`.
    ///
    /// Unlike the original, which always prepends `"Software is alpha"`,
    /// this carries the same spirit forward as a standing reminder that a
    /// remailer keyring is inherently alpha-quality software.
    pub fn insecurities(&self) -> Vec<&'static str> {
        let mut reasons = vec!["software is alpha"];

        if matches!(self.log_level, LogLevel::Trace | LogLevel::Debug) {
            reasons.push("log is too verbose");
        }
        if self.log_stats && self.stats_interval < Duration::from_secs(2 * 60 * 60) {
            reasons.push("stats interval is too short");
        }
        if !self.mix_algorithm.is_secure() {
            reasons.push("mix algorithm is not secure");
        } else if self.mix_pool_min_size < 5 {
            reasons.push("mix pool min size is too small");
        }
        if self.mix_interval < Duration::from_secs(30 * 60) {
            reasons.push("mix interval under 30 minutes");
        }

        reasons
    }

    /// A human-readable summary of the live configuration, for inclusion
    /// in the descriptor's `[Testing]` section and for the consistency
    /// checker's "configuration changed since last publication" test.
    ///
    /// Mirrors `ServerConfig.getConfigurationSummary`'s exact field list
    /// for the `Server` and `Outgoing/MMTP` sections; the delivery-module
    /// sections it also lists are covered by [`crate::descriptor::ModuleDescriptor`]
    /// blocks instead, since those fields live with the modules that own
    /// them rather than in this crate.
    pub fn configuration_summary(&self) -> String {
        let mut parts = Vec::new();
        parts.push(format!("Server/LogLevel={:?}", self.log_level));
        parts.push(format!("Server/LogStats={}", self.log_stats));
        parts.push(format!(
            "Server/StatsInterval={}",
            humantime::format_duration(self.stats_interval)
        ));
        parts.push(format!(
            "Server/PublicKeyOverlap={}",
            humantime::format_duration(self.public_key_overlap)
        ));
        parts.push(format!("Server/MixAlgorithm={:?}", self.mix_algorithm));
        parts.push(format!(
            "Server/MixInterval={}",
            humantime::format_duration(self.mix_interval)
        ));
        parts.push(format!("Server/MixPoolRate={}", self.mix_pool_rate));
        parts.push(format!(
            "Server/MixPoolMinSize={}",
            self.mix_pool_min_size
        ));
        parts.join("; ")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn minimal_builder() -> KeyringConfigBuilder {
        let mut b = KeyringConfigBuilder::default();
        b.key_dir(std::path::PathBuf::from("/tmp/keys"))
            .work_dir(std::path::PathBuf::from("/tmp/work"))
            .nickname("TestNode".to_string())
            .directory_url("https://example.invalid/submit".to_string());
        b
    }

    #[test]
    fn defaults_build() {
        let cfg = minimal_builder().build().expect("should build");
        assert_eq!(cfg.identity_key_bits, 2048);
        assert_eq!(cfg.incoming_port, 48099);
        assert_eq!(cfg.packet_versions, "0.3");
    }

    #[test]
    fn rejects_undersized_identity_key() {
        let mut b = minimal_builder();
        b.identity_key_bits(1024);
        let err = b.build().unwrap_err();
        assert_eq!(err.kind(), remailer_error::ErrorKind::BadConfig);
    }

    #[test]
    fn rejects_short_overlap() {
        let mut b = minimal_builder();
        b.public_key_overlap(Duration::from_secs(60));
        assert!(b.build().is_err());
    }

    #[test]
    fn insecurities_flags_weak_mix() {
        let mut b = minimal_builder();
        b.mix_algorithm(MixAlgorithm::TimedMixPool);
        let cfg = b.build().unwrap();
        assert!(cfg
            .insecurities()
            .contains(&"mix algorithm is not secure"));
    }

    #[test]
    fn insecurities_empty_list_would_still_contain_alpha_notice() {
        let cfg = minimal_builder().build().unwrap();
        assert_eq!(cfg.insecurities().first(), Some(&"software is alpha"));
    }
}
