//! The server's long-term identity key.
//!
//! A single RSA keypair that outlives any individual [`crate::keyset::KeySet`]
//! and is used to sign every descriptor the server publishes. Grounded in
//! `ServerKeyring.getIdentityKey`/`getIdentityKeyDigest`/`removeIdentityKey`
//! in `ServerKeys.py`, with PEM persistence and owner-only permission
//! enforcement borrowed from `fs-mistrust`'s `CheckedDir`, the same way
//! `tor-keymgr` relies on it for on-disk key material.

use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::Path;
use std::thread;
use std::time::Duration;

use fs_mistrust::CheckedDir;
use rand_core::OsRng;
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::pkcs8::LineEnding;
use rsa::RsaPrivateKey;
use sha1::{Digest, Sha1};
use tracing::{info, warn};

use remailer_error::{ErrorDetail, Result};

/// How long `remove()` sleeps, printing a warning, before actually
/// unlinking the identity key and its DH-parameters file.
///
/// Mirrors the original's ten-second "are you sure" delay in
/// `removeIdentityKey`: long enough that an operator watching the
/// console has a chance to interrupt the process, short enough not to
/// block an automated tool that really means it.
const REMOVAL_WARNING_DELAY: Duration = Duration::from_secs(10);

/// Name of the identity key's PEM file within the key directory.
const IDENTITY_KEY_FILE: &str = "identity.key";

/// Name of the DH-parameters file kept alongside the identity key.
///
/// The original treats both as long-lived secrets an operator discards
/// together; see [`IdentityKey::remove`].
const DH_PARAM_FILE: &str = "dhparam";

/// A 20-byte SHA-1 digest identifying an [`IdentityKey`] by its public
/// component, the same digest `RsaIdentity` in `tor-llcrypto` uses for
/// relay identities.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct IdentityDigest([u8; 20]);

impl IdentityDigest {
    /// Render as lowercase hex.
    pub fn to_hex(self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl std::fmt::Debug for IdentityDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IdentityDigest({})", self.to_hex())
    }
}

impl std::fmt::Display for IdentityDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl safelog::Redactable for IdentityDigest {
    fn display_redacted(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "identity:{}…", &self.to_hex()[..8])
    }
}

/// Hook point for private-key-at-rest encryption.
///
/// Out of scope: the original's `EncryptIdentityKey`/`EncryptPrivateKey`
/// config flags never got implemented either, and just logged a warning
/// at startup. This exists so that turning the feature on later doesn't
/// require restructuring [`IdentityKey`]'s storage format.
#[derive(Clone, Copy, Debug, Default)]
pub struct KeyEncryption;

impl KeyEncryption {
    /// Always fails: no private-key-at-rest encryption is implemented.
    pub fn describe(self) -> &'static str {
        "private key encryption is not yet implemented"
    }
}

/// The server's long-term RSA identity key.
pub struct IdentityKey {
    /// The private key itself.
    private: RsaPrivateKey,
    /// Cached digest of the public key, computed once at load/create time.
    digest: IdentityDigest,
}

impl IdentityKey {
    /// Load the identity key from `dir` if present, otherwise generate a
    /// fresh one of `bits` bits and persist it, mirroring
    /// `ServerKeyring.getIdentityKey`'s lazy-create-on-first-access
    /// behavior.
    pub fn load_or_create(dir: &CheckedDir, bits: u32) -> Result<Self> {
        if dir
            .as_path()
            .join(IDENTITY_KEY_FILE)
            .try_exists()
            .unwrap_or(false)
        {
            Self::load(dir)
        } else {
            let key = Self::generate(bits)?;
            key.save(dir)?;
            info!(bits, "generated new server identity key");
            Ok(key)
        }
    }

    /// Load an existing identity key from `dir`.
    pub fn load(dir: &CheckedDir) -> Result<Self> {
        let pem = zeroize::Zeroizing::new(dir.read_to_string(IDENTITY_KEY_FILE).map_err(
            |e| ErrorDetail::Key(format!("could not read identity key: {e}")),
        )?);
        let private = RsaPrivateKey::from_pkcs1_pem(&pem)
            .map_err(|e| ErrorDetail::Key(format!("could not parse identity key: {e}")))?;
        Ok(Self::from_private(private))
    }

    /// Generate a fresh identity key of `bits` bits.
    ///
    /// `bits` is validated at [`crate::config::KeyringConfig`] construction
    /// time to lie in `2048..=4096`; this function trusts that range.
    fn generate(bits: u32) -> Result<Self> {
        let private = RsaPrivateKey::new(&mut OsRng, bits as usize)
            .map_err(|e| ErrorDetail::Key(format!("could not generate identity key: {e}")))?;
        Ok(Self::from_private(private))
    }

    /// Wrap a loaded/generated private key, computing its digest.
    fn from_private(private: RsaPrivateKey) -> Self {
        let digest = digest_of(&private);
        IdentityKey { private, digest }
    }

    /// Persist this key as owner-only-readable PEM under `dir`.
    fn save(&self, dir: &CheckedDir) -> Result<()> {
        let pem = self
            .private
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(|e| ErrorDetail::Key(format!("could not encode identity key: {e}")))?;
        dir.write_and_replace(IDENTITY_KEY_FILE, pem.as_bytes())
            .map_err(|e| ErrorDetail::Key(format!("could not persist identity key: {e}")))?;
        Ok(())
    }

    /// The underlying private key, for signing operations.
    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private
    }

    /// The digest identifying this key's public component.
    pub fn digest(&self) -> IdentityDigest {
        self.digest
    }

    /// Permanently remove the identity key and its DH-parameters file.
    ///
    /// Mirrors `ServerKeyring.removeIdentityKey`: logs a loud warning,
    /// sleeps [`REMOVAL_WARNING_DELAY`] to give an operator a last
    /// chance to interrupt, then deletes both files. This is never
    /// invoked except from an explicit operator-initiated action —
    /// nothing else in this crate calls it.
    pub fn remove(dir: &CheckedDir) -> Result<()> {
        warn!(
            delay_secs = REMOVAL_WARNING_DELAY.as_secs(),
            "removing server identity key: this is irreversible"
        );
        thread::sleep(REMOVAL_WARNING_DELAY);

        crate::secure_delete::secure_delete_file(dir, IDENTITY_KEY_FILE)?;
        if dir.as_path().join(DH_PARAM_FILE).try_exists().unwrap_or(false) {
            crate::secure_delete::secure_delete_file(dir, DH_PARAM_FILE)?;
        }
        info!("server identity key removed");
        Ok(())
    }

    /// Ensure the DH-parameters file exists under `dir`, generating a
    /// fresh one if absent.
    ///
    /// Mirrors `_getDHFile`: a single shared DH-parameters file lives
    /// alongside the identity key rather than being regenerated per TLS
    /// context.
    pub fn ensure_dh_params(dir: &CheckedDir) -> Result<std::path::PathBuf> {
        let path = dir
            .join(DH_PARAM_FILE)
            .map_err(|e| ErrorDetail::Key(format!("bad DH-params path: {e}")))?;
        if !path.try_exists().unwrap_or(false) {
            generate_dh_params(&path)?;
        }
        Ok(path)
    }
}

/// Compute the SHA-1 digest of an RSA public key's DER encoding.
fn digest_of(key: &RsaPrivateKey) -> IdentityDigest {
    use rsa::pkcs1::EncodeRsaPublicKey;
    let public = key.to_public_key();
    let der = public
        .to_pkcs1_der()
        .expect("encoding a freshly-built RSA public key cannot fail");
    let mut hasher = Sha1::new();
    hasher.update(der.as_bytes());
    let digest: [u8; 20] = hasher.finalize().into();
    IdentityDigest(digest)
}

/// The RFC 3526 2048-bit MODP group prime, as uppercase hex.
///
/// Using a well-known fixed group avoids the cost of generating a fresh
/// safe prime at startup while giving every server the same strength of
/// MMTP-layer forward secrecy as a freshly generated one. The bit size
/// matches a conservative modern minimum rather than the original's
/// hardcoded value; see `DESIGN.md` for this Open Question.
const MODP_2048_PRIME_HEX: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD",
    "129024E088A67CC74020BBEA63B139B22514A08798E3404",
    "DDEF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C",
    "245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406",
    "B7EDEE386BFB5A899FA5AE9F24117C4B1FE649286651ECE",
    "45B3DC2007CB8A163BF0598DA48361C55D39A69163FA8FD",
    "24CF5F83655D23DCA3AD961C62F356208552BB9ED529077",
    "096966D670C354E4ABC9804F1746C08CA18217C32905E46",
    "2E36CE3BE39E772C180E86039B2783A2EC07A28FB5C55DF",
    "06F4C52C9DE2BCBF6955817183995497CEA956AE515D226",
    "1898FA051015728E5A8AACAA68FFFFFFFFFFFFFFFF",
);

/// Our own internal text format for a DH parameters file: one hex prime
/// per line followed by the decimal generator. Not an interchange
/// format — nothing outside this crate's TLS module reads it — so
/// there's no need to round-trip through ASN.1/PEM for a value that
/// never leaves the local key directory.
fn generate_dh_params(path: &Path) -> Result<()> {
    let contents = format!("p={MODP_2048_PRIME_HEX}\ng=2\n");
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| ErrorDetail::Io(format!("could not create DH-params file: {e}")))?;
    file.write_all(contents.as_bytes())
        .map_err(|e| ErrorDetail::Io(format!("could not write DH-params file: {e}")))?;
    Ok(())
}
