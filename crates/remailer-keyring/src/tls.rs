//! Minting the MMTP link's TLS certificate chain.
//!
//! Grounded in `tor-cert`'s `x509` module for the mechanics of building
//! an X.509 certificate with the `x509-cert` crate, and in
//! `ServerKeyring._newTLSContext`/`generateCertChain` in
//! `ServerKeys.py` for the MMTP-specific shape: a short-lived RSA key
//! for the connection itself, certified by a cert chain of (link cert
//! signed by the identity key, identity cert self-signed), rather than
//! Tor relay TLS's ECDSA link keys.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use digest::Digest as _;
use rand_core::OsRng;
use rsa::pkcs1v15::SigningKey;
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use x509_cert::builder::{Builder, CertificateBuilder, Profile};
use x509_cert::der::asn1::GeneralizedTime;
use x509_cert::der::{DateTime, Encode};
use x509_cert::ext::pkix::{KeyUsage, KeyUsages};
use x509_cert::serial_number::SerialNumber;
use x509_cert::time::Validity;

use remailer_error::{ErrorDetail, Result};

use crate::identity::IdentityKey;

/// How far before "now" the certificate chain's validity window starts,
/// and how far after `CERTIFICATE_LIFETIME` it ends, so that
/// slightly-clock-skewed peers don't spuriously reject it.
///
/// Mirrors `CERTIFICATE_EXPIRY_SLOPPINESS` (2 hours).
pub const CERTIFICATE_EXPIRY_SLOPPINESS: Duration = Duration::from_secs(2 * 60 * 60);

/// How long a minted certificate chain is considered fresh before
/// [`crate::keyring::Keyring`] mints a new one.
///
/// Mirrors `CERTIFICATE_LIFETIME` (24 hours).
pub const CERTIFICATE_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);

/// Bits in the short-lived MMTP connection key.
const MMTP_KEY_BITS: usize = 1024;

/// A minted MMTP TLS certificate chain and its short-term private key.
#[derive(Clone)]
#[non_exhaustive]
pub struct TlsContext {
    /// The short-term RSA key used for the MMTP connection itself.
    mmtp_key: RsaPrivateKey,
    /// Link cert followed by identity cert, each DER-encoded.
    certificates_der: Vec<Vec<u8>>,
    /// When this context should be replaced.
    expires: SystemTime,
    /// SHA-1 digest of the MMTP key, for the descriptor's `Key-Digest`.
    key_digest_hex: String,
    /// Path to the shared DH-parameters file this context was bound to.
    ///
    /// Spec'd as part of the TLS context alongside the chain and the
    /// MMTP key (`ServerKeyring._getTLSContext` hands the MMTP server all
    /// three together); the file's own lifecycle is
    /// [`IdentityKey::ensure_dh_params`], since it's shared across every
    /// context rather than re-minted per rotation.
    dh_params_path: PathBuf,
}

impl TlsContext {
    /// Mint a fresh MMTP TLS context valid starting near `now`.
    ///
    /// Mirrors `_newTLSContext`: generate a new short-term key, build a
    /// two-certificate chain signed by `identity`, and remember when it
    /// expires.
    pub fn mint(
        identity: &IdentityKey,
        nickname: &str,
        dh_params_path: &Path,
        now: SystemTime,
    ) -> Result<Self> {
        let mmtp_key = RsaPrivateKey::new(&mut OsRng, MMTP_KEY_BITS)
            .map_err(|e| ErrorDetail::Tls(format!("could not generate MMTP key: {e}")))?;

        let cert_starts = now
            .checked_sub(CERTIFICATE_EXPIRY_SLOPPINESS)
            .unwrap_or(now);
        let expires = now + CERTIFICATE_LIFETIME;
        let cert_ends = expires + CERTIFICATE_EXPIRY_SLOPPINESS;

        let link_cert = build_cert(
            identity.private_key(),
            &mmtp_key.to_public_key(),
            &format!("{nickname}<MMTP>"),
            nickname,
            cert_starts,
            cert_ends,
        )?;
        let identity_cert = build_cert(
            identity.private_key(),
            &identity.private_key().to_public_key(),
            nickname,
            nickname,
            cert_starts,
            cert_ends,
        )?;

        let key_digest_hex = {
            use sha1::{Digest as _, Sha1};
            use rsa::pkcs1::EncodeRsaPublicKey;
            let der = mmtp_key
                .to_public_key()
                .to_pkcs1_der()
                .map_err(|e| ErrorDetail::Tls(format!("could not encode MMTP key: {e}")))?;
            let mut hasher = Sha1::new();
            hasher.update(der.as_bytes());
            let digest: [u8; 20] = hasher.finalize().into();
            digest.iter().map(|b| format!("{b:02x}")).collect()
        };

        Ok(TlsContext {
            mmtp_key,
            certificates_der: vec![link_cert, identity_cert],
            expires,
            key_digest_hex,
            dh_params_path: dh_params_path.to_path_buf(),
        })
    }

    /// Whether this context should be replaced, either because `force`
    /// was requested or because it has passed its expiry.
    ///
    /// Mirrors `_getTLSContext`'s `force or ... or expires < now` check.
    pub fn needs_refresh(&self, force: bool, now: SystemTime) -> bool {
        force || self.expires < now
    }

    /// When this context expires.
    pub fn expires(&self) -> SystemTime {
        self.expires
    }

    /// Hex-encoded SHA-1 digest of the MMTP key, for the descriptor's
    /// `Key-Digest` field.
    pub fn key_digest_hex(&self) -> &str {
        &self.key_digest_hex
    }

    /// The certificate chain, link cert first, each DER-encoded.
    pub fn certificates_der(&self) -> &[Vec<u8>] {
        &self.certificates_der
    }

    /// Path to the shared DH-parameters file this context is bound to.
    pub fn dh_params_path(&self) -> &Path {
        &self.dh_params_path
    }

    /// Render the certificate chain as concatenated PEM, matching
    /// `generateCertChain`'s on-disk format (link cert then identity
    /// cert, concatenated into a single `cert_chain` file).
    pub fn certificate_chain_pem(&self) -> String {
        let config = pem::EncodeConfig::new().set_line_ending(pem::LineEnding::LF);
        self.certificates_der
            .iter()
            .map(|der| pem::encode_config(&pem::Pem::new("CERTIFICATE", der.clone()), config))
            .collect()
    }

    /// The short-term MMTP private key, DER-encoded (PKCS#1), for
    /// callers that need to hand it to a TLS library alongside the
    /// chain.
    pub fn mmtp_key_der(&self) -> Result<Vec<u8>> {
        use rsa::pkcs1::EncodeRsaPrivateKey;
        let doc = self
            .mmtp_key
            .to_pkcs1_der()
            .map_err(|e| ErrorDetail::Tls(format!("could not encode MMTP key: {e}")))?;
        Ok(doc.as_bytes().to_vec())
    }
}

/// Build a single RSA-signed X.509 certificate, self-issued by
/// `signing_key`, certifying `subject_public` under `subject_cn`.
///
/// Adapted from `create_legacy_rsa_id_cert`'s builder sequence, but
/// signing with the caller-supplied RSA key (the original always signs
/// with the server's identity key, regardless of which key is being
/// certified) rather than requiring the subject and signer to match.
fn build_cert(
    signing_key: &RsaPrivateKey,
    subject_public: &RsaPublicKey,
    subject_cn: &str,
    issuer_cn: &str,
    not_before: SystemTime,
    not_after: SystemTime,
) -> Result<Vec<u8>> {
    use rsa::pkcs8::SubjectPublicKeyInfo;

    let profile = Profile::Manual {
        issuer: Some(
            format!("CN={issuer_cn}")
                .parse()
                .map_err(|e| ErrorDetail::Tls(format!("bad issuer CN: {e}")))?,
        ),
    };
    let subject = format!("CN={subject_cn}")
        .parse()
        .map_err(|e| ErrorDetail::Tls(format!("bad subject CN: {e}")))?;

    let serial = random_serial_number()?;
    let validity = der_validity(not_before, not_after)?;
    let spki = SubjectPublicKeyInfo::from_key(subject_public.clone())
        .map_err(|e| ErrorDetail::Tls(format!("could not encode subject key: {e}")))?;
    let signer = SigningKey::<Sha256>::new(signing_key.clone());

    let mut builder = CertificateBuilder::new(profile, serial, validity, subject, spki, &signer)
        .map_err(|e| ErrorDetail::Tls(format!("could not start certificate: {e}")))?;

    // Not strictly needed, but without any extension the builder emits a
    // v1 certificate, which some TLS stacks are fussier about.
    builder
        .add_extension(&KeyUsage(
            KeyUsages::KeyCertSign | KeyUsages::DigitalSignature,
        ))
        .map_err(|e| ErrorDetail::Tls(format!("could not add certificate extension: {e}")))?;

    let cert = builder
        .build()
        .map_err(|e| ErrorDetail::Tls(format!("could not build certificate: {e}")))?;

    let mut out = Vec::new();
    cert.encode_to_vec(&mut out)
        .map_err(|e| ErrorDetail::Tls(format!("could not DER-encode certificate: {e}")))?;
    Ok(out)
}

/// Build a `Validity` spanning `[not_before, not_after]`, encoding each
/// endpoint at its exact instant. Unlike a descriptor's `Valid-After`/
/// `Valid-Until`, `_newTLSContext`'s cert bounds are raw timestamps
/// (`now - CERTIFICATE_EXPIRY_SLOPPINESS` / `now + CERTIFICATE_LIFETIME +
/// CERTIFICATE_EXPIRY_SLOPPINESS`); rounding to midnight here would add
/// up to a day of slop on top of the spec's exact 2-hour window.
fn der_validity(not_before: SystemTime, not_after: SystemTime) -> Result<Validity> {
    let time_of = |when: SystemTime| -> Result<x509_cert::time::Time> {
        let dt = DateTime::from_system_time(when)
            .map_err(|e| ErrorDetail::Tls(format!("bad certificate time: {e}")))?;
        Ok(x509_cert::time::Time::GeneralTime(
            GeneralizedTime::from_date_time(dt),
        ))
    };
    Ok(Validity {
        not_before: time_of(not_before)?,
        not_after: time_of(not_after)?,
    })
}

/// Generate a random 16-byte certificate serial number.
fn random_serial_number() -> Result<SerialNumber> {
    use rand::RngCore;
    let mut buf = [0u8; 16];
    OsRng.fill_bytes(&mut buf);
    SerialNumber::new(&buf)
        .map_err(|e| ErrorDetail::Tls(format!("could not build serial number: {e}")).into())
}

#[cfg(test)]
mod test {
    use super::*;
    use fs_mistrust::Mistrust;

    fn identity() -> (tempfile::TempDir, IdentityKey) {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Mistrust::new()
            .verifier()
            .permit_readable()
            .make_secure_dir(tmp.path())
            .unwrap();
        let key = IdentityKey::load_or_create(&dir, 2048).unwrap();
        (tmp, key)
    }

    #[test]
    fn mint_produces_a_two_certificate_chain() {
        let (_tmp, identity) = identity();
        let ctx = TlsContext::mint(&identity, "TestNode", Path::new("/tmp/test-dhparam"), SystemTime::now()).unwrap();
        assert_eq!(ctx.certificates_der().len(), 2);
        assert!(ctx.certificate_chain_pem().matches("BEGIN CERTIFICATE").count() == 2);
    }

    #[test]
    fn fresh_context_does_not_need_refresh() {
        let (_tmp, identity) = identity();
        let now = SystemTime::now();
        let ctx = TlsContext::mint(&identity, "TestNode", Path::new("/tmp/test-dhparam"), now).unwrap();
        assert!(!ctx.needs_refresh(false, now));
        assert!(ctx.needs_refresh(true, now));
    }

    #[test]
    fn expired_context_needs_refresh() {
        let (_tmp, identity) = identity();
        let now = SystemTime::now();
        let ctx = TlsContext::mint(&identity, "TestNode", Path::new("/tmp/test-dhparam"), now).unwrap();
        let later = now + CERTIFICATE_LIFETIME + CERTIFICATE_EXPIRY_SLOPPINESS * 2;
        assert!(ctx.needs_refresh(false, later));
    }
}
