//! Platform summary string, compared by the consistency checker's
//! `Testing.Platform` field.
//!
//! Mirrors `getPlatformSummary` in the original, which reports
//! `os.uname()` and the Python interpreter version. Rust has no single
//! analogue of `os.uname()` without a libc binding arti doesn't already
//! use elsewhere, so this reports `std::env::consts::{OS, ARCH}` and the
//! crate's own version instead.

/// Describe the current software and platform, for the descriptor's
/// `[Testing]` section.
pub fn platform_summary() -> String {
    format!(
        "remailer-keyring {}; rustc target {}-{}",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::ARCH,
        std::env::consts::OS,
    )
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn summary_is_stable_within_a_process() {
        assert_eq!(platform_summary(), platform_summary());
    }

    #[test]
    fn summary_mentions_the_crate_name() {
        assert!(platform_summary().contains("remailer-keyring"));
    }
}
