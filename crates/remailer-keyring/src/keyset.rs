//! A single generated keyset: one packet (mix) key, its signed
//! descriptor, and the hash log and publication state that travel with
//! it.
//!
//! Grounded in the `ServerKeyset` class in `ServerKeys.py`: each keyset
//! lives in its own subdirectory of the key directory, named `key_NNNN`,
//! holding a packet private key, a signed descriptor, and a marker file
//! recording whether the descriptor has been published.

use std::path::Path;
use std::time::SystemTime;

use fs_mistrust::CheckedDir;
use rand_core::OsRng;
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey, EncodeRsaPublicKey};
use rsa::pkcs8::LineEnding;
use rsa::RsaPrivateKey;
use tracing::{debug, info};

use remailer_error::{ErrorDetail, Result};

use crate::config::KeyringConfig;
use crate::consistency::{self, ConsistencyReport};
use crate::descriptor::{self, DescriptorBuilder, IncomingMmtp, OutgoingMmtp, ServerDescriptor};
use crate::hashlog::HashLogHandle;
use crate::identity::IdentityKey;
use crate::platform::platform_summary;
use crate::publisher::{PublishOutcome, Publisher};
use crate::scheduler::Liveness;

/// Bits in a generated packet (mix) key. The original hardcodes 1024;
/// kept as-is since this is the key MMTP packets are encrypted under and
/// changing its size is a wire-format change out of this crate's scope.
const PACKET_KEY_BITS: usize = 1024;

/// Name of the packet private key file within a keyset's directory.
const PACKET_KEY_FILE: &str = "mix.key";

/// Name of the signed descriptor file within a keyset's directory.
const DESCRIPTOR_FILE: &str = "ServerDesc";

/// Name of the zero-length marker file recording that this keyset's
/// descriptor has been successfully published.
const PUBLISHED_FILE: &str = "published";

/// Legacy per-keyset files the original generated before MMTP replaced
/// the older TLS-link protocol. A keyset directory inherited from an
/// older server may still carry them; nothing in this crate reads or
/// writes them, so they are cleaned up on [`KeySet::scan`].
const LEGACY_FILES: &[&str] = &["mmtp.key", "mmtp.cert"];

/// One generated keyset: a packet key, its descriptor, and the
/// publication/hash-log state that travels with it.
pub struct KeySet {
    /// The `key_NNNN`-style name identifying this keyset.
    name: String,
    /// The owner-only-permission-checked directory this keyset lives in.
    dir: CheckedDir,
    /// The packet (mix) private key.
    packet_key: RsaPrivateKey,
    /// The current signed descriptor for this keyset.
    descriptor: ServerDescriptor,
    /// Handle to this keyset's replay-detection hash log.
    hashlog: HashLogHandle,
    /// Whether the current descriptor has been published.
    published: bool,
}

impl KeySet {
    /// Load an already-generated keyset from `dir`, cleaning up any
    /// legacy files left behind by an older server version.
    ///
    /// Mirrors `ServerKeyset.__init__`'s file layout, including its
    /// removal of now-unused `mmtp.key`/`mmtp.cert` files.
    pub fn scan(name: String, dir: CheckedDir, hash_dir: &Path) -> Result<Self> {
        for legacy in LEGACY_FILES {
            if dir.as_path().join(legacy).try_exists().unwrap_or(false) {
                debug!(keyset = %name, file = %legacy, "removing legacy keyset file");
                dir.remove_file(legacy)
                    .map_err(|e| ErrorDetail::Io(format!("could not remove legacy {legacy}: {e}")))?;
            }
        }

        let pem = dir
            .read_to_string(PACKET_KEY_FILE)
            .map_err(|e| ErrorDetail::Key(format!("could not read packet key: {e}")))?;
        let packet_key = RsaPrivateKey::from_pkcs1_pem(&pem)
            .map_err(|e| ErrorDetail::Key(format!("could not parse packet key: {e}")))?;

        let raw = dir
            .read_to_string(DESCRIPTOR_FILE)
            .map_err(|e| ErrorDetail::Descriptor(format!("could not read descriptor: {e}")))?;
        let descriptor = descriptor::parse(&raw)?;

        let published = dir.as_path().join(PUBLISHED_FILE).try_exists().unwrap_or(false);
        let hashlog = HashLogHandle::new(hash_dir, &name);

        Ok(KeySet {
            name,
            dir,
            packet_key,
            descriptor,
            hashlog,
            published,
        })
    }

    /// Generate a brand-new keyset named `name`, with a validity window
    /// of `[valid_after, valid_after + config.public_key_lifetime)`
    /// snapped to UTC midnight, and persist it under `dir`.
    ///
    /// Mirrors `ServerKeyring.createKeys`/`generateServerDescriptorAndKeys`:
    /// a fresh packet key is generated, the descriptor is built from
    /// current configuration and signed with `identity`, and both are
    /// written to disk before the keyset is handed back.
    pub fn create(
        name: String,
        dir: CheckedDir,
        hash_dir: &Path,
        identity: &IdentityKey,
        config: &KeyringConfig,
        tls_key_digest_hex: &str,
        valid_after: std::time::SystemTime,
    ) -> Result<Self> {
        let packet_key = RsaPrivateKey::new(&mut OsRng, PACKET_KEY_BITS)
            .map_err(|e| ErrorDetail::Key(format!("could not generate packet key: {e}")))?;

        // Snapped to the previous midnight of `valid_after + 30s` rather
        // than `valid_after` itself, so a caller-supplied instant that
        // already sits exactly at midnight still rounds to that same
        // midnight instead of the one before it.
        let thirty_secs = std::time::Duration::from_secs(30);
        let valid_after = descriptor::previous_midnight(valid_after + thirty_secs);
        let valid_until =
            descriptor::previous_midnight(valid_after + config.public_key_lifetime + thirty_secs);

        let packet_key_der = packet_key
            .to_public_key()
            .to_pkcs1_der()
            .map_err(|e| ErrorDetail::Build(format!("could not encode packet key: {e}")))?
            .as_bytes()
            .to_vec();

        let incoming = build_incoming(config, identity, tls_key_digest_hex)?;
        let outgoing = build_outgoing(config);
        let insecurities = config.insecurities();
        let secure_configuration = insecurities.is_empty();
        let why_insecure = (!insecurities.is_empty()).then(|| insecurities.join(", "));

        let modules = config
            .modules
            .iter()
            .map(|m| (m.section_name().to_string(), m.is_enabled(), m.render()))
            .collect();

        let descriptor = DescriptorBuilder {
            identity,
            nickname: config.nickname.clone(),
            contact: config.contact.clone(),
            contact_fingerprint: config.contact_fingerprint.clone(),
            comments: config.comments.clone(),
            packet_key_der,
            packet_versions: config.packet_versions.clone(),
            valid_after,
            valid_until,
            secure_configuration,
            why_insecure,
            incoming,
            outgoing,
            modules,
            platform: platform_summary(),
            configuration_summary: config.configuration_summary(),
        }
        .build()?;

        let pem = packet_key
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(|e| ErrorDetail::Key(format!("could not encode packet key: {e}")))?;
        dir.write_and_replace(PACKET_KEY_FILE, pem.as_bytes())
            .map_err(|e| ErrorDetail::Key(format!("could not persist packet key: {e}")))?;
        dir.write_and_replace(DESCRIPTOR_FILE, descriptor.raw.as_bytes())
            .map_err(|e| ErrorDetail::Descriptor(format!("could not persist descriptor: {e}")))?;

        info!(keyset = %name, "generated new keyset");

        let hashlog = HashLogHandle::new(hash_dir, &name);
        Ok(KeySet {
            name,
            dir,
            packet_key,
            descriptor,
            hashlog,
            published: false,
        })
    }

    /// This keyset's `key_NNNN`-style name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The current descriptor's validity window.
    pub fn liveness(&self) -> Liveness {
        Liveness {
            valid_after: self.descriptor.valid_after,
            valid_until: self.descriptor.valid_until,
        }
    }

    /// The packet private key, for handing to a mix packet handler.
    pub fn packet_key(&self) -> &RsaPrivateKey {
        &self.packet_key
    }

    /// The current signed descriptor.
    pub fn descriptor(&self) -> &ServerDescriptor {
        &self.descriptor
    }

    /// This keyset's hash log handle.
    pub fn hashlog(&self) -> &HashLogHandle {
        &self.hashlog
    }

    /// Whether the current descriptor has been published.
    pub fn is_published(&self) -> bool {
        self.published
    }

    /// Record that the current descriptor has been published, creating
    /// the on-disk marker file.
    fn mark_published(&mut self) -> Result<()> {
        let stamp = descriptor::format_timestamp(SystemTime::now());
        self.dir
            .write_and_replace(PUBLISHED_FILE, stamp.as_bytes())
            .map_err(|e| ErrorDetail::Io(format!("could not record publication: {e}")))?;
        self.published = true;
        Ok(())
    }

    /// Clear the published marker, e.g. after regenerating a descriptor
    /// that supersedes the one that was published.
    fn mark_unpublished(&mut self) -> Result<()> {
        if self
            .dir
            .as_path()
            .join(PUBLISHED_FILE)
            .try_exists()
            .unwrap_or(false)
        {
            self.dir
                .remove_file(PUBLISHED_FILE)
                .map_err(|e| ErrorDetail::Io(format!("could not clear publication marker: {e}")))?;
        }
        self.published = false;
        Ok(())
    }

    /// Compare the current descriptor against `config`, without touching
    /// any state.
    ///
    /// Mirrors `ServerKeyring.checkDescriptorConsistency`.
    pub fn check_consistency(&self, config: &KeyringConfig, log: bool) -> ConsistencyReport {
        consistency::check_consistency(&self.descriptor, config, log, self.published)
    }

    /// Rebuild and re-sign this keyset's descriptor from current
    /// configuration, keeping the same packet key and validity window,
    /// and clear the published marker since the new descriptor has not
    /// yet been submitted.
    ///
    /// Mirrors the regeneration path `ServerKeyring.checkKeys` takes when
    /// [`consistency::check_consistency`] returns [`consistency::Verdict::Bad`].
    pub fn regenerate_descriptor(
        &mut self,
        identity: &IdentityKey,
        config: &KeyringConfig,
        tls_key_digest_hex: &str,
    ) -> Result<()> {
        let packet_key_der = self
            .packet_key
            .to_public_key()
            .to_pkcs1_der()
            .map_err(|e| ErrorDetail::Build(format!("could not encode packet key: {e}")))?
            .as_bytes()
            .to_vec();

        let incoming = build_incoming(config, identity, tls_key_digest_hex)?;
        let outgoing = build_outgoing(config);
        let insecurities = config.insecurities();
        let secure_configuration = insecurities.is_empty();
        let why_insecure = (!insecurities.is_empty()).then(|| insecurities.join(", "));

        let modules = config
            .modules
            .iter()
            .map(|m| (m.section_name().to_string(), m.is_enabled(), m.render()))
            .collect();

        let descriptor = DescriptorBuilder {
            identity,
            nickname: config.nickname.clone(),
            contact: config.contact.clone(),
            contact_fingerprint: config.contact_fingerprint.clone(),
            comments: config.comments.clone(),
            packet_key_der,
            packet_versions: config.packet_versions.clone(),
            valid_after: self.descriptor.valid_after,
            valid_until: self.descriptor.valid_until,
            secure_configuration,
            why_insecure,
            incoming,
            outgoing,
            modules,
            platform: platform_summary(),
            configuration_summary: config.configuration_summary(),
        }
        .build()?;

        self.dir
            .write_and_replace(DESCRIPTOR_FILE, descriptor.raw.as_bytes())
            .map_err(|e| ErrorDetail::Descriptor(format!("could not persist descriptor: {e}")))?;
        self.descriptor = descriptor;
        self.mark_unpublished()?;
        info!(keyset = %self.name, "regenerated descriptor");
        Ok(())
    }

    /// Submit this keyset's descriptor to the directory server, marking
    /// it published on acceptance.
    ///
    /// Mirrors `ServerKeyset.publish`. A transport-level failure or a
    /// rejection both surface to the caller unchanged; only
    /// [`PublishOutcome::Accepted`] updates local state.
    pub fn publish(&mut self, publisher: &Publisher) -> Result<PublishOutcome> {
        let outcome = publisher.publish(&self.descriptor.raw)?;
        if let PublishOutcome::Accepted { .. } = &outcome {
            self.mark_published()?;
        }
        Ok(outcome)
    }

    /// Permanently delete this keyset: securely overwrite its packet key
    /// and descriptor, delete its hash log, then remove the now-empty
    /// directory.
    ///
    /// Mirrors `ServerKeyring.removeDeadKeys`' per-keyset cleanup. Takes
    /// `self` by value since the keyset cannot be used after this call.
    pub fn delete(self) -> Result<()> {
        crate::secure_delete::secure_delete_file(&self.dir, PACKET_KEY_FILE)?;
        crate::secure_delete::secure_delete_file(&self.dir, DESCRIPTOR_FILE)?;
        if self.published {
            self.dir
                .remove_file(PUBLISHED_FILE)
                .map_err(|e| ErrorDetail::Io(format!("could not remove publication marker: {e}")))?;
        }
        self.hashlog.delete()?;

        // `CheckedDir` has no directory-removal method of its own; by
        // this point every file it guarded is gone, so a plain
        // `remove_dir` is safe.
        let path = self.dir.as_path().to_path_buf();
        std::fs::remove_dir(&path)
            .map_err(|e| ErrorDetail::Io(format!("could not remove keyset directory: {e}")))?;
        info!(keyset = %self.name, "removed dead keyset");
        Ok(())
    }
}

/// Build the `[Incoming/MMTP]` section's typed fields from `config`, or
/// `None` if incoming service is disabled.
///
/// Resolves an unconfigured IP/hostname via [`crate::ipguess`], matching
/// `generateServerDescriptorAndKeys`'s fallback behavior.
fn build_incoming(
    config: &KeyringConfig,
    identity: &IdentityKey,
    tls_key_digest_hex: &str,
) -> Result<Option<IncomingMmtp>> {
    if !config.incoming_enabled {
        return Ok(None);
    }

    let ip = match config.published_ip {
        Some(ip) => ip,
        None => crate::ipguess::guess_local_ip()?,
    };
    let hostname = match &config.hostname {
        Some(h) => h.clone(),
        None => crate::ipguess::local_fqdn()
            .ok_or_else(|| ErrorDetail::Build("could not guess a local hostname".into()))?,
    };

    // The digest advertised here is the server's identity key digest,
    // not the MMTP session key's: this field hasn't been checked by any
    // client since the MMTP protocol replaced the older TLS-only link,
    // and changing its meaning now would break older directories that
    // still parse it.
    let _ = tls_key_digest_hex;

    Ok(Some(IncomingMmtp {
        ip,
        hostname,
        port: config.incoming_port,
        key_digest: identity.digest().to_hex(),
        protocols: "0.3".to_string(),
        rules: config.incoming_rules.clone(),
    }))
}

/// Build the `[Outgoing/MMTP]` section's typed fields from `config`, or
/// `None` if outgoing service is disabled.
fn build_outgoing(config: &KeyringConfig) -> Option<OutgoingMmtp> {
    config.outgoing_enabled.then(|| OutgoingMmtp {
        protocols: "0.3".to_string(),
        rules: config.outgoing_rules.clone(),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::KeyringConfigBuilder;
    use fs_mistrust::Mistrust;
    use std::time::{Duration, SystemTime};

    fn identity(tmp: &tempfile::TempDir) -> IdentityKey {
        let dir = Mistrust::new()
            .verifier()
            .permit_readable()
            .make_secure_dir(tmp.path())
            .unwrap();
        IdentityKey::load_or_create(&dir, 2048).unwrap()
    }

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

    fn checked_dir(tmp: &tempfile::TempDir, name: &str) -> CheckedDir {
        let path = tmp.path().join(name);
        std::fs::create_dir(&path).unwrap();
        Mistrust::new()
            .verifier()
            .permit_readable()
            .make_secure_dir(&path)
            .unwrap()
    }

    #[test]
    fn create_then_scan_round_trips() {
        let identity_tmp = tempfile::tempdir().unwrap();
        let identity = identity(&identity_tmp);
        let cfg = config();
        let tmp = tempfile::tempdir().unwrap();
        let dir = checked_dir(&tmp, "key_0001");

        let created = KeySet::create(
            "key_0001".to_string(),
            dir,
            tmp.path(),
            &identity,
            &cfg,
            "deadbeef",
            SystemTime::now(),
        )
        .unwrap();
        assert!(!created.is_published());

        let reopened = checked_dir_from_existing(tmp.path(), "key_0001");
        let scanned = KeySet::scan("key_0001".to_string(), reopened, tmp.path()).unwrap();
        assert_eq!(scanned.descriptor().nickname, "TestNode");
    }

    fn checked_dir_from_existing(base: &std::path::Path, name: &str) -> CheckedDir {
        Mistrust::new()
            .verifier()
            .permit_readable()
            .make_secure_dir(base.join(name))
            .unwrap()
    }

    #[test]
    fn scan_removes_legacy_files() {
        let identity_tmp = tempfile::tempdir().unwrap();
        let identity = identity(&identity_tmp);
        let cfg = config();
        let tmp = tempfile::tempdir().unwrap();
        let dir = checked_dir(&tmp, "key_0002");
        KeySet::create(
            "key_0002".to_string(),
            dir,
            tmp.path(),
            &identity,
            &cfg,
            "deadbeef",
            SystemTime::now(),
        )
        .unwrap();

        std::fs::write(tmp.path().join("key_0002").join("mmtp.key"), b"old").unwrap();
        let reopened = checked_dir_from_existing(tmp.path(), "key_0002");
        KeySet::scan("key_0002".to_string(), reopened, tmp.path()).unwrap();
        assert!(!tmp.path().join("key_0002").join("mmtp.key").exists());
    }

    #[test]
    fn delete_removes_the_keyset_directory() {
        let identity_tmp = tempfile::tempdir().unwrap();
        let identity = identity(&identity_tmp);
        let cfg = config();
        let tmp = tempfile::tempdir().unwrap();
        let dir = checked_dir(&tmp, "key_0003");
        let keyset = KeySet::create(
            "key_0003".to_string(),
            dir,
            tmp.path(),
            &identity,
            &cfg,
            "deadbeef",
            SystemTime::now(),
        )
        .unwrap();

        let dir_path = tmp.path().join("key_0003");
        assert!(dir_path.exists());
        keyset.delete().unwrap();
        assert!(!dir_path.exists());
    }

    #[test]
    fn liveness_spans_configured_lifetime() {
        let identity_tmp = tempfile::tempdir().unwrap();
        let identity = identity(&identity_tmp);
        let cfg = config();
        let tmp = tempfile::tempdir().unwrap();
        let dir = checked_dir(&tmp, "key_0004");
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let keyset = KeySet::create(
            "key_0004".to_string(),
            dir,
            tmp.path(),
            &identity,
            &cfg,
            "deadbeef",
            now,
        )
        .unwrap();

        let liveness = keyset.liveness();
        assert!(liveness.valid_until > liveness.valid_after);
        assert_eq!(
            liveness.valid_until.duration_since(liveness.valid_after).unwrap(),
            cfg.public_key_lifetime
        );
    }

    #[test]
    fn mark_published_writes_a_timestamp_not_an_empty_file() {
        let identity_tmp = tempfile::tempdir().unwrap();
        let identity = identity(&identity_tmp);
        let cfg = config();
        let tmp = tempfile::tempdir().unwrap();
        let dir = checked_dir(&tmp, "key_0005");
        let mut keyset = KeySet::create(
            "key_0005".to_string(),
            dir,
            tmp.path(),
            &identity,
            &cfg,
            "deadbeef",
            SystemTime::now(),
        )
        .unwrap();

        keyset.mark_published().unwrap();
        assert!(keyset.is_published());

        let contents = std::fs::read_to_string(tmp.path().join("key_0005").join(PUBLISHED_FILE))
            .unwrap();
        // "YYYY-MM-DD HH:MM:SS", matching `format_timestamp`'s shape.
        assert_eq!(contents.len(), 19);
        assert_eq!(contents.as_bytes()[4], b'-');
        assert_eq!(contents.as_bytes()[10], b' ');
    }
}
