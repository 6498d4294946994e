//! Heuristics for guessing a server's publishable IP address, and for
//! sanity-checking a configured hostname.
//!
//! Grounded in `_guessLocalIP`/`_checkHostnameIsLocal` in `ServerKeys.py`:
//! used only when the operator hasn't pinned down an explicit IP or
//! hostname in configuration, never to override one that was given.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};

use remailer_error::{ErrorDetail, Result};

/// `target_addr`s we probe via `connect`-less UDP sockets to discover
/// which local interface the kernel would route through, mirroring the
/// original's `getsockname` probe list.
const PROBE_TARGETS: &[&str] = &["18.0.0.1:9", "10.0.0.1:9", "192.168.0.1:9", "172.16.0.1:9"];

/// Whether `ip` falls in a well-known private or loopback block the
/// original refuses to publish, because a remailer behind NAT with no
/// explicit `IP` configured can't usefully advertise it.
fn is_unpublishable(ip: Ipv4Addr) -> bool {
    ip.is_loopback() || ip.is_private() || ip.octets()[0] == 0
}

/// Try to find a single, reasonable, publishable IPv4 address for this
/// host by asking the kernel which local address it would use to reach
/// a handful of well-known public targets.
///
/// Returns an error if no address is found, if the probes disagree on
/// more than one candidate, or if the only candidate found is in a
/// private block — all per the original's `_guessLocalIP`.
pub fn guess_local_ip() -> Result<IpAddr> {
    let mut candidates = std::collections::BTreeSet::new();

    for target in PROBE_TARGETS {
        if let Ok(socket) = UdpSocket::bind("0.0.0.0:0") {
            if socket.connect(target).is_ok() {
                if let Ok(addr) = socket.local_addr() {
                    if let IpAddr::V4(v4) = addr.ip() {
                        if !v4.is_loopback() && v4.octets()[0] != 0 {
                            candidates.insert(v4);
                        }
                    }
                }
            }
        }
    }

    match candidates.len() {
        0 => Err(ErrorDetail::Build("could not guess a local IP address: no address found".into())
            .into()),
        1 => {
            let ip = *candidates.iter().next().expect("len checked above");
            if is_unpublishable(ip) {
                Err(ErrorDetail::Build(
                    "could not guess a local IP address: only address found is in a private block"
                        .into(),
                )
                .into())
            } else {
                Ok(IpAddr::V4(ip))
            }
        }
        _ => Err(ErrorDetail::Build(format!(
            "could not guess a local IP address: multiple candidates found: {}",
            candidates
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        ))
        .into()),
    }
}

/// Guess the local fully-qualified hostname, the way the original falls
/// back to `socket.getfqdn()` when no `Hostname` is configured.
///
/// Returns `None` if the platform hostname can't be read or isn't valid
/// UTF-8; callers should simply skip any check that needs it in that
/// case, matching the original's best-effort framing.
pub fn local_fqdn() -> Option<String> {
    hostname::get().ok()?.into_string().ok()
}

/// Warn-worthy, not fatal: check whether `hostname` resolves to a
/// loopback or unspecified address, the way `_checkHostnameIsLocal`
/// logs a warning (but doesn't fail) when it does.
pub fn hostname_resolves_to_reserved_address(hostname: &str) -> bool {
    use std::net::ToSocketAddrs;
    match (hostname, 0).to_socket_addrs() {
        Ok(addrs) => addrs.into_iter().any(|a| match a.ip() {
            IpAddr::V4(v4) => v4.is_loopback() || v4.octets()[0] == 0,
            IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
        }),
        Err(_) => false,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn loopback_is_unpublishable() {
        assert!(is_unpublishable(Ipv4Addr::new(127, 0, 0, 1)));
    }

    #[test]
    fn private_block_is_unpublishable() {
        assert!(is_unpublishable(Ipv4Addr::new(192, 168, 1, 1)));
    }

    #[test]
    fn public_address_is_publishable() {
        assert!(!is_unpublishable(Ipv4Addr::new(203, 0, 113, 5)));
    }

    #[test]
    fn localhost_resolves_to_reserved_address() {
        assert!(hostname_resolves_to_reserved_address("localhost"));
    }
}
