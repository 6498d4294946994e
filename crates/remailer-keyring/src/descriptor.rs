//! Building and parsing signed server descriptors.
//!
//! Grounded in `generateServerDescriptorAndKeys`/`_rule` in
//! `ServerKeys.py` for the shape of the stock descriptor text, and in
//! `tor-netdoc`'s `doc::routerdesc` module for the general idea of "a
//! signed, section-based descriptor with a parser that hands back typed
//! fields". The original's format is simple enough (flat `Key: Value`
//! lines under `[Section]` headers, no token-table machinery) that this
//! module writes its own small parser rather than pulling in
//! `tor-netdoc`'s full tokenizer.

use std::net::IpAddr;
use std::time::SystemTime;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rsa::pkcs1::EncodeRsaPublicKey;
use rsa::traits::PublicKeyParts;
use rsa::Pkcs1v15Sign;
use sha1::{Digest, Sha1};
use time::OffsetDateTime;

use remailer_error::{ErrorDetail, Result};

use crate::identity::IdentityKey;

/// The descriptor format version this crate emits and understands.
pub const DESCRIPTOR_VERSION: &str = "0.2";

/// Whether `mask` is the most specific mask for its address family
/// (i.e. "match exactly this host"), the case [`AllowDenyRule::render`]
/// omits from its output as the default.
fn is_full_mask(mask: IpAddr) -> bool {
    match mask {
        IpAddr::V4(m) => m == std::net::Ipv4Addr::new(255, 255, 255, 255),
        IpAddr::V6(m) => m == std::net::Ipv6Addr::from(u128::MAX),
    }
}

/// An advertised IP allow/deny rule, rendered into the descriptor but
/// never enforced by this crate (enforcement is a stated Non-goal).
///
/// Grounded in `_rule` in `ServerKeys.py`.
#[derive(Clone, Debug)]
pub struct AllowDenyRule {
    /// Whether this is an `Allow` (true) or `Deny` (false) rule.
    pub allow: bool,
    /// The network this rule applies to, or `None` for "any" (`*`).
    pub network: Option<(IpAddr, IpAddr)>,
    /// Inclusive port range this rule applies to.
    pub ports: (u16, u16),
}

impl AllowDenyRule {
    /// Render this rule the way `_rule` does: `<ip><mask><ports>`, with
    /// the wildcard network and the default MMTP port range both
    /// rendered with their redundant fields omitted.
    fn render(&self) -> String {
        let (ip, mask) = match self.network {
            None => ("*".to_string(), String::new()),
            Some((ip, mask)) if is_full_mask(mask) => (ip.to_string(), String::new()),
            Some((ip, mask)) => (ip.to_string(), format!("/{mask}")),
        };
        let (lo, hi) = self.ports;
        let ports = if lo == hi && lo == 48099 && self.allow {
            String::new()
        } else if lo == 0 && hi == 65535 && !self.allow {
            String::new()
        } else if lo == hi {
            format!(" {lo}")
        } else {
            format!(" {lo}-{hi}")
        };
        format!("{ip}{mask}{ports}")
    }

    fn key(&self) -> &'static str {
        if self.allow {
            "Allow"
        } else {
            "Deny"
        }
    }

    /// Parse one `Allow`/`Deny` value back into a rule, inverting
    /// [`AllowDenyRule::render`].
    fn parse(allow: bool, value: &str) -> Result<Self> {
        let mut parts = value.split_whitespace();
        let host = parts
            .next()
            .ok_or_else(|| ErrorDetail::Descriptor("empty Allow/Deny rule".into()))?;
        let ports = match parts.next() {
            None if allow => (48099, 48099),
            None => (0, 65535),
            Some(p) => match p.split_once('-') {
                Some((lo, hi)) => (
                    lo.parse()
                        .map_err(|_| ErrorDetail::Descriptor(format!("bad port range {p:?}")))?,
                    hi.parse()
                        .map_err(|_| ErrorDetail::Descriptor(format!("bad port range {p:?}")))?,
                ),
                None => {
                    let port: u16 = p
                        .parse()
                        .map_err(|_| ErrorDetail::Descriptor(format!("bad port {p:?}")))?;
                    (port, port)
                }
            },
        };
        let network = if host == "*" {
            None
        } else {
            let (ip, mask) = match host.split_once('/') {
                Some((ip, mask)) => (ip, mask),
                None => (host, "255.255.255.255"),
            };
            let ip: IpAddr = ip
                .parse()
                .map_err(|_| ErrorDetail::Descriptor(format!("bad Allow/Deny host {host:?}")))?;
            let mask: IpAddr = mask
                .parse()
                .map_err(|_| ErrorDetail::Descriptor(format!("bad Allow/Deny mask {host:?}")))?;
            Some((ip, mask))
        };
        Ok(AllowDenyRule {
            allow,
            network,
            ports,
        })
    }
}

/// The hook point for delivery-module `[Delivery/...]`-style descriptor
/// blocks.
///
/// The delivery modules themselves (mail delivery, pinging, etc.) are
/// out of this crate's scope; this trait is the seam a future crate can
/// implement to plug its own section into the descriptor, and that
/// [`crate::consistency::ConsistencyChecker`] walks to compare
/// enabled-vs-published state. Grounded in the `ModuleManager`/
/// `getServerInfoBlocks` hook in `ServerKeys.py`.
pub trait ModuleDescriptor: std::fmt::Debug + Send + Sync {
    /// The section name this module contributes, e.g. `"Delivery/SMTP"`.
    fn section_name(&self) -> &str;
    /// Whether this module is currently enabled in configuration.
    fn is_enabled(&self) -> bool;
    /// The full rendered `[Section]\nKey: Value\n...` text to splice into
    /// the descriptor, if enabled. Returns an empty string if disabled.
    fn render(&self) -> String;
}

/// What a descriptor advertises about incoming MMTP service.
#[derive(Clone, Debug)]
pub struct IncomingMmtp {
    /// Address this server accepts connections on.
    pub ip: IpAddr,
    /// Hostname this server accepts connections on.
    pub hostname: String,
    /// Port this server accepts connections on.
    pub port: u16,
    /// SHA-1 digest of this keyset's MMTP key, hex-encoded.
    pub key_digest: String,
    /// Comma-separated list of supported MMTP protocol versions.
    pub protocols: String,
    /// Configured Allow/Deny rules, in configuration order.
    pub rules: Vec<AllowDenyRule>,
}

/// What a descriptor advertises about outgoing MMTP service.
#[derive(Clone, Debug)]
pub struct OutgoingMmtp {
    /// Comma-separated list of supported MMTP protocol versions.
    pub protocols: String,
    /// Configured Allow/Deny rules, in configuration order.
    pub rules: Vec<AllowDenyRule>,
}

/// A fully built or parsed server descriptor.
#[derive(Clone, Debug)]
pub struct ServerDescriptor {
    pub nickname: String,
    pub identity_base64: String,
    pub identity_bits: u32,
    pub published: SystemTime,
    pub valid_after: SystemTime,
    pub valid_until: SystemTime,
    pub packet_key_base64: String,
    pub packet_versions: String,
    pub secure_configuration: bool,
    pub why_insecure: Option<String>,
    pub contact: Option<String>,
    pub contact_fingerprint: Option<String>,
    pub comments: Option<String>,
    pub incoming: Option<IncomingMmtp>,
    pub outgoing: Option<OutgoingMmtp>,
    pub modules_rendered: Vec<(String, bool)>,
    pub platform: String,
    pub configuration_summary: String,
    /// The full signed descriptor text, if this value was built or
    /// parsed from one.
    pub raw: String,
}

/// Inputs needed to build a fresh descriptor for one keyset.
pub struct DescriptorBuilder<'a> {
    pub identity: &'a IdentityKey,
    pub nickname: String,
    pub contact: Option<String>,
    pub contact_fingerprint: Option<String>,
    pub comments: Option<String>,
    pub packet_key_der: Vec<u8>,
    pub packet_versions: String,
    pub valid_after: SystemTime,
    pub valid_until: SystemTime,
    pub secure_configuration: bool,
    pub why_insecure: Option<String>,
    pub incoming: Option<IncomingMmtp>,
    pub outgoing: Option<OutgoingMmtp>,
    pub modules: Vec<(String, bool, String)>,
    pub platform: String,
    pub configuration_summary: String,
}

impl<'a> DescriptorBuilder<'a> {
    /// Build and sign a descriptor, returning both the rendered text and
    /// the typed view of it.
    ///
    /// Mirrors the body of `generateServerDescriptorAndKeys`: assemble
    /// the stock fields, strip/rejoin whitespace the way the original's
    /// triple-quoted templates do, then sign with the identity key over
    /// a SHA-1 digest (`signServerInfo`'s scheme).
    pub fn build(self) -> Result<ServerDescriptor> {
        let now = SystemTime::now();
        let identity_base64 = encode_rsa_public_base64(self.identity.private_key())?;
        let packet_key_base64 = BASE64.encode(&self.packet_key_der);

        let mut lines = vec!["[Server]".to_string()];
        lines.push(format!("Descriptor-Version: {DESCRIPTOR_VERSION}"));
        lines.push(format!("Nickname: {}", self.nickname));
        lines.push(format!("Identity: {identity_base64}"));
        lines.push("Digest:".to_string());
        lines.push("Signature:".to_string());
        lines.push(format!("Published: {}", format_timestamp(now)));
        lines.push(format!("Valid-After: {}", format_date(self.valid_after)));
        lines.push(format!("Valid-Until: {}", format_date(self.valid_until)));
        lines.push(format!("Packet-Key: {packet_key_base64}"));
        lines.push(format!("Packet-Versions: {}", self.packet_versions));
        lines.push(format!("Software: remailer-keyring {}", env!("CARGO_PKG_VERSION")));
        lines.push(format!(
            "Secure-Configuration: {}",
            if self.secure_configuration { "yes" } else { "no" }
        ));
        if let Some(why) = &self.why_insecure {
            lines.push(format!("Why-Insecure: {why}"));
        }
        if let Some(contact) = &self.contact {
            lines.push(format!("Contact: {contact}"));
        }
        if let Some(fp) = &self.contact_fingerprint {
            lines.push(format!("Contact-Fingerprint: {fp}"));
        }
        if let Some(comments) = &self.comments {
            lines.push(format!("Comments: {comments}"));
        }

        if let Some(incoming) = &self.incoming {
            lines.push(String::new());
            lines.push("[Incoming/MMTP]".to_string());
            lines.push("Version: 0.1".to_string());
            lines.push(format!("IP: {}", incoming.ip));
            lines.push(format!("Hostname: {}", incoming.hostname));
            lines.push(format!("Port: {}", incoming.port));
            lines.push(format!("Key-Digest: {}", incoming.key_digest));
            lines.push(format!("Protocols: {}", incoming.protocols));
            for rule in &incoming.rules {
                lines.push(format!("{}: {}", rule.key(), rule.render()));
            }
        }

        if let Some(outgoing) = &self.outgoing {
            lines.push(String::new());
            lines.push("[Outgoing/MMTP]".to_string());
            lines.push("Version: 0.1".to_string());
            lines.push(format!("Protocols: {}", outgoing.protocols));
            for rule in &outgoing.rules {
                lines.push(format!("{}: {}", rule.key(), rule.render()));
            }
        }

        for (_, enabled, rendered) in &self.modules {
            if *enabled {
                lines.push(String::new());
                lines.push(rendered.clone());
            }
        }

        lines.push(String::new());
        lines.push("[Testing]".to_string());
        lines.push(format!("Platform: {}", self.platform));
        lines.push(format!("Configuration: {}", self.configuration_summary));

        // Strip and rejoin whitespace, forcing a trailing newline, the
        // way the original processes its triple-quoted templates.
        let body: String = lines
            .iter()
            .map(|l| l.trim())
            .filter(|l| !l.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        let unsigned = format!("{body}\n");

        let signed = sign_descriptor(&unsigned, self.identity)?;

        let modules_rendered = self
            .modules
            .iter()
            .map(|(name, enabled, _)| (name.clone(), *enabled))
            .collect();

        Ok(ServerDescriptor {
            nickname: self.nickname,
            identity_base64,
            identity_bits: self.identity.private_key().size() as u32 * 8,
            published: now,
            valid_after: self.valid_after,
            valid_until: self.valid_until,
            packet_key_base64,
            packet_versions: self.packet_versions,
            secure_configuration: self.secure_configuration,
            why_insecure: self.why_insecure,
            contact: self.contact,
            contact_fingerprint: self.contact_fingerprint,
            comments: self.comments,
            incoming: self.incoming,
            outgoing: self.outgoing,
            modules_rendered,
            platform: self.platform,
            configuration_summary: self.configuration_summary,
            raw: signed,
        })
    }
}

/// Sign `unsigned` (a descriptor with empty `Digest:`/`Signature:`
/// lines) by hashing it with SHA-1 and signing with `identity`, then
/// splicing the base64-encoded digest and signature back into those two
/// lines.
///
/// Mirrors `signServerInfo`'s scheme in the original.
fn sign_descriptor(unsigned: &str, identity: &IdentityKey) -> Result<String> {
    let digest = {
        let mut hasher = Sha1::new();
        hasher.update(unsigned.as_bytes());
        hasher.finalize()
    };
    let signature = identity
        .private_key()
        .sign(Pkcs1v15Sign::new::<Sha1>(), &digest)
        .map_err(|e| ErrorDetail::Build(format!("could not sign descriptor: {e}")))?;

    let digest_b64 = BASE64.encode(digest);
    let sig_b64 = BASE64.encode(signature);

    let signed = unsigned
        .replacen("Digest:", &format!("Digest: {digest_b64}"), 1)
        .replacen("Signature:", &format!("Signature: {sig_b64}"), 1);
    Ok(signed)
}

/// Base64-encode the DER-encoded RSA public key belonging to `identity`,
/// matching the original's `formatBase64(pk_encode_public_key(key))`.
fn encode_rsa_public_base64(key: &rsa::RsaPrivateKey) -> Result<String> {
    let public = key.to_public_key();
    let der = public
        .to_pkcs1_der()
        .map_err(|e| ErrorDetail::Build(format!("could not encode identity key: {e}")))?;
    Ok(BASE64.encode(der.as_bytes()))
}

/// Format a timestamp the way the original's `formatTime` does: an
/// RFC-3339-ish `YYYY-MM-DD HH:MM:SS` in UTC.
pub(crate) fn format_timestamp(t: SystemTime) -> String {
    let dt: OffsetDateTime = t.into();
    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
        dt.year(),
        u8::from(dt.month()),
        dt.day(),
        dt.hour(),
        dt.minute(),
        dt.second()
    )
}

/// Format a date at midnight UTC, matching the original's `formatDate`
/// (used for `Valid-After`/`Valid-Until`, which are always
/// midnight-aligned).
fn format_date(t: SystemTime) -> String {
    let dt: OffsetDateTime = t.into();
    format!("{:04}-{:02}-{:02}", dt.year(), u8::from(dt.month()), dt.day())
}

/// Round `t` down to the most recent UTC midnight, matching the
/// original's `previousMidnight`.
///
/// Used by [`crate::keyset::KeySet`] to snap a keyset's validity window
/// to midnight before it is handed to [`DescriptorBuilder`], and by
/// [`crate::consistency`] to compare validity windows in a way that's
/// insensitive to the handful of seconds' slop `generateKeys` adds.
pub fn previous_midnight(t: SystemTime) -> SystemTime {
    let dt: OffsetDateTime = t.into();
    let midnight = dt.replace_time(time::Time::MIDNIGHT);
    midnight.into()
}

#[cfg(test)]
mod midnight_test {
    use super::*;
    use std::time::Duration;

    #[test]
    fn rounds_down_to_utc_midnight() {
        let t = SystemTime::UNIX_EPOCH + Duration::from_secs(100_000);
        let m = previous_midnight(t);
        let dt: OffsetDateTime = m.into();
        assert_eq!(dt.hour(), 0);
        assert_eq!(dt.minute(), 0);
        assert_eq!(dt.second(), 0);
        assert!(m <= t);
    }
}

/// Parse a previously-built descriptor's text back into typed fields.
///
/// A small hand-rolled parser, proportioned to the original's actual
/// format: a flat `Key: Value` line grammar under `[Section]` headers,
/// no nested structure or token-table machinery.
pub fn parse(text: &str) -> Result<ServerDescriptor> {
    let mut section = String::new();
    let mut fields: std::collections::HashMap<(String, String), String> =
        std::collections::HashMap::new();
    let mut rules: std::collections::HashMap<String, Vec<AllowDenyRule>> =
        std::collections::HashMap::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            section = name.to_string();
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim();
            let value = value.trim();
            match key {
                "Allow" => rules
                    .entry(section.clone())
                    .or_default()
                    .push(AllowDenyRule::parse(true, value)?),
                "Deny" => rules
                    .entry(section.clone())
                    .or_default()
                    .push(AllowDenyRule::parse(false, value)?),
                _ => {
                    fields.insert((section.clone(), key.to_string()), value.to_string());
                }
            }
        }
    }

    let get = |section: &str, key: &str| -> Option<String> {
        fields.get(&(section.to_string(), key.to_string())).cloned()
    };
    let require = |section: &str, key: &str| -> Result<String> {
        get(section, key).ok_or_else(|| {
            ErrorDetail::Descriptor(format!("missing {section}/{key}")).into()
        })
    };

    let nickname = require("Server", "Nickname")?;
    let identity_base64 = require("Server", "Identity")?;
    let identity_der = BASE64
        .decode(&identity_base64)
        .map_err(|e| ErrorDetail::Descriptor(format!("bad Identity encoding: {e}")))?;
    let identity_bits = {
        use rsa::pkcs1::DecodeRsaPublicKey;
        let public = rsa::RsaPublicKey::from_pkcs1_der(&identity_der)
            .map_err(|e| ErrorDetail::Descriptor(format!("bad Identity key: {e}")))?;
        public.size() as u32 * 8
    };
    let packet_key_base64 = require("Server", "Packet-Key")?;
    let packet_versions = require("Server", "Packet-Versions")?;
    let published = parse_timestamp(&require("Server", "Published")?)?;
    let valid_after = parse_date(&require("Server", "Valid-After")?)?;
    let valid_until = parse_date(&require("Server", "Valid-Until")?)?;
    let secure_configuration = require("Server", "Secure-Configuration")? == "yes";
    let why_insecure = get("Server", "Why-Insecure");
    let contact = get("Server", "Contact");
    let contact_fingerprint = get("Server", "Contact-Fingerprint");
    let comments = get("Server", "Comments");
    let platform = get("Testing", "Platform").unwrap_or_default();
    let configuration_summary = get("Testing", "Configuration").unwrap_or_default();

    let incoming = get("Incoming/MMTP", "Port")
        .map(|port| -> Result<IncomingMmtp> {
            Ok(IncomingMmtp {
                ip: get("Incoming/MMTP", "IP")
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| ErrorDetail::Descriptor("bad Incoming/MMTP IP".into()))?,
                hostname: get("Incoming/MMTP", "Hostname").unwrap_or_default(),
                port: port
                    .parse()
                    .map_err(|_| ErrorDetail::Descriptor("bad Incoming/MMTP Port".into()))?,
                key_digest: get("Incoming/MMTP", "Key-Digest").unwrap_or_default(),
                protocols: get("Incoming/MMTP", "Protocols").unwrap_or_default(),
                rules: rules.remove("Incoming/MMTP").unwrap_or_default(),
            })
        })
        .transpose()?;

    let outgoing = get("Outgoing/MMTP", "Version").map(|_| OutgoingMmtp {
        protocols: get("Outgoing/MMTP", "Protocols").unwrap_or_default(),
        rules: rules.remove("Outgoing/MMTP").unwrap_or_default(),
    });

    Ok(ServerDescriptor {
        nickname,
        identity_base64,
        identity_bits,
        published,
        valid_after,
        valid_until,
        packet_key_base64,
        packet_versions,
        secure_configuration,
        why_insecure,
        contact,
        contact_fingerprint,
        comments,
        incoming,
        outgoing,
        modules_rendered: Vec::new(),
        platform,
        configuration_summary,
        raw: text.to_string(),
    })
}

fn parse_timestamp(s: &str) -> Result<SystemTime> {
    let format = time::macros::format_description!(
        "[year]-[month]-[day] [hour]:[minute]:[second]"
    );
    let dt = time::PrimitiveDateTime::parse(s, &format)
        .map_err(|e| ErrorDetail::Descriptor(format!("bad timestamp {s:?}: {e}")))?;
    Ok(dt.assume_utc().into())
}

fn parse_date(s: &str) -> Result<SystemTime> {
    let format = time::macros::format_description!("[year]-[month]-[day]");
    let date = time::Date::parse(s, &format)
        .map_err(|e| ErrorDetail::Descriptor(format!("bad date {s:?}: {e}")))?;
    Ok(date.midnight().assume_utc().into())
}
