//! Publishing descriptors to the directory server.
//!
//! Grounded in `ServerKeyset.publish`/`DIRECTORY_RESPONSE_RE` in
//! `ServerKeys.py`. Uses `ureq` the way `arti-ureq` does for its HTTP
//! needs, with certificate verification disabled specifically for this
//! endpoint — the original disables it too, noting that the directory's
//! self-signed certificate doesn't matter because the descriptor itself
//! is already signed.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use remailer_error::{ErrorDetail, Result};

/// How the directory server responded to a publication attempt.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PublishOutcome {
    /// The directory accepted the descriptor.
    Accepted {
        /// The directory's human-readable message.
        message: String,
    },
    /// The directory understood but rejected the descriptor.
    Rejected {
        /// The directory's human-readable message.
        message: String,
    },
}

/// Matches the tri-state reply a directory server gives: a `Status:`
/// line of `0` or `1`, followed by a `Message:` line.
///
/// Mirrors `DIRECTORY_RESPONSE_RE` verbatim.
static DIRECTORY_RESPONSE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^Status: (0|1)[ \t]*\nMessage: (.*)$").expect("static regex is valid")
});

/// A client for the directory server's descriptor-submission endpoint.
pub struct Publisher {
    url: String,
    agent: ureq::Agent,
}

impl Publisher {
    /// Build a publisher posting to `url`.
    ///
    /// TLS certificate verification is disabled for this client only;
    /// it is never reused for any other outbound connection.
    pub fn new(url: String) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(30))
            .tls_config(std::sync::Arc::new(insecure_tls_config()))
            .build();
        Publisher { url, agent }
    }

    /// Submit `descriptor` (the full signed descriptor text) to the
    /// directory server.
    ///
    /// Mirrors `ServerKeyset.publish`: POST a `desc=<descriptor>` form
    /// body, require a `text/plain` response, and parse the tri-state
    /// reply. Transport-level failures and malformed replies surface as
    /// `Err`; only a reply the directory understood but rejected
    /// produces `Ok(PublishOutcome::Rejected)`.
    pub fn publish(&self, descriptor: &str) -> Result<PublishOutcome> {
        let body = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("desc", descriptor)
            .finish();

        let response = self
            .agent
            .post(&self.url)
            .set("Content-Type", "application/x-www-form-urlencoded")
            .send_string(&body)
            .map_err(|e| ErrorDetail::Publish(format!("error publishing descriptor: {e}")))?;

        let content_type = response.content_type().to_string();
        let reply = response
            .into_string()
            .map_err(|e| ErrorDetail::Publish(format!("could not read directory reply: {e}")))?;

        if content_type != "text/plain" {
            return Err(ErrorDetail::Publish(format!(
                "bad content type {content_type:?} from directory"
            ))
            .into());
        }

        let captures = DIRECTORY_RESPONSE_RE
            .captures(&reply)
            .ok_or_else(|| {
                ErrorDetail::Publish(format!("didn't understand reply from directory: {reply:?}"))
            })?;
        let ok = &captures[1] == "1";
        let message = captures[2].to_string();

        if ok {
            Ok(PublishOutcome::Accepted { message })
        } else {
            Ok(PublishOutcome::Rejected { message })
        }
    }
}

/// A `rustls::ClientConfig` that accepts any server certificate.
///
/// Scoped entirely to [`Publisher`]; nothing else in this crate makes
/// outbound TLS connections.
fn insecure_tls_config() -> rustls::ClientConfig {
    rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(std::sync::Arc::new(AcceptAllCertificates))
        .with_no_client_auth()
}

/// A certificate verifier that accepts everything.
///
/// The directory's descriptor-submission endpoint historically runs a
/// self-signed certificate; this is safe only because the descriptor
/// payload itself is independently signed by the server's identity key,
/// so directory-side TLS is not this protocol's trust boundary.
#[derive(Debug)]
struct AcceptAllCertificates;

impl rustls::client::danger::ServerCertVerifier for AcceptAllCertificates {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn response_regex_parses_accept() {
        let reply = "Status: 1\nMessage: thanks\n";
        let caps = DIRECTORY_RESPONSE_RE.captures(reply).unwrap();
        assert_eq!(&caps[1], "1");
        assert_eq!(&caps[2], "thanks");
    }

    #[test]
    fn response_regex_parses_reject() {
        let reply = "Status: 0\nMessage: bad signature\n";
        let caps = DIRECTORY_RESPONSE_RE.captures(reply).unwrap();
        assert_eq!(&caps[1], "0");
        assert_eq!(&caps[2], "bad signature");
    }

    #[test]
    fn response_regex_rejects_garbage() {
        assert!(DIRECTORY_RESPONSE_RE.captures("not a reply").is_none());
    }
}
