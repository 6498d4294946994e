//! Pure key-rotation scheduling logic, factored out of [`crate::keyring::Keyring`]
//! so it is testable without any filesystem state.
//!
//! Grounded in `ServerKeyring._getLiveKeys`/`getNextKeyRotation`/
//! `getNextKeygen`/`createKeysAsNeeded` in `ServerKeys.py`.

use std::time::{Duration, SystemTime};

/// How far in advance of going live a key should be generated and
/// published, mirroring `PUBLICATION_LATENCY` (2 days, 13 hours).
pub const PUBLICATION_LATENCY: Duration = Duration::from_secs((2 * 24 + 13) * 60 * 60);

/// How many seconds' worth of future keys should exist at any time,
/// mirroring `PREPUBLICATION_INTERVAL` (14 days).
pub const PREPUBLICATION_INTERVAL: Duration = Duration::from_secs(14 * 24 * 60 * 60);

/// The validity window of one generated keyset.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Liveness {
    /// First instant this keyset's public key is valid.
    pub valid_after: SystemTime,
    /// Last instant this keyset's public key is valid.
    pub valid_until: SystemTime,
}

/// A key rotation event: either an existing keyset leaving the live set,
/// or a future one entering it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RotationEvent {
    /// A keyset's overlap window has ended; it should be removed.
    Remove(SystemTime),
    /// A keyset's validity window has begun; it should be added.
    Add(SystemTime),
}

impl RotationEvent {
    /// The instant at which this event occurs.
    fn at(self) -> SystemTime {
        match self {
            RotationEvent::Remove(t) | RotationEvent::Add(t) => t,
        }
    }
}

/// Of `all_keysets` (every keyset on disk, regardless of liveness),
/// return the indices that are live at `now`: those that became valid
/// before `now` and that have not yet passed `now - key_overlap`.
///
/// Mirrors `ServerKeyring._getLiveKeys`.
pub fn live_indices(all_keysets: &[Liveness], now: SystemTime, key_overlap: Duration) -> Vec<usize> {
    let cutoff = now.checked_sub(key_overlap).unwrap_or(SystemTime::UNIX_EPOCH);
    all_keysets
        .iter()
        .enumerate()
        .filter(|(_, live)| live.valid_after <= now && live.valid_until >= cutoff)
        .map(|(idx, _)| idx)
        .collect()
}

/// Of `all_keysets`, return the indices that are dead at `now`: those
/// whose overlap window has already ended.
///
/// Mirrors `ServerKeyring.getDeadKeys`.
pub fn dead_indices(all_keysets: &[Liveness], now: SystemTime, key_overlap: Duration) -> Vec<usize> {
    let cutoff = now.checked_sub(key_overlap).unwrap_or(SystemTime::UNIX_EPOCH);
    all_keysets
        .iter()
        .enumerate()
        .filter(|(_, live)| live.valid_until < cutoff)
        .map(|(idx, _)| idx)
        .collect()
}

/// Compute the next instant at which the live set changes: either the
/// earliest currently-live keyset leaving (at `valid_until + key_overlap`)
/// or the earliest not-yet-live keyset entering (at its `valid_after`).
///
/// Returns `None` if there are no future events (mirrors the original's
/// `sys.maxint` sentinel, expressed idiomatically as an `Option`).
///
/// Mirrors `ServerKeyring.getNextKeyRotation`.
pub fn next_rotation(
    all_keysets: &[Liveness],
    current_live: &[usize],
    key_overlap: Duration,
) -> Option<SystemTime> {
    let mut events = Vec::new();
    let live_set: std::collections::HashSet<usize> = current_live.iter().copied().collect();

    for &idx in current_live {
        let live = all_keysets[idx];
        events.push(RotationEvent::Remove(live.valid_until + key_overlap));
    }
    for (idx, live) in all_keysets.iter().enumerate() {
        if !live_set.contains(&idx) {
            events.push(RotationEvent::Add(live.valid_after));
        }
    }

    events.into_iter().map(RotationEvent::at).min()
}

/// Compute the time at which key generation should next run so that the
/// live set stays covered for `PUBLICATION_LATENCY + PREPUBLICATION_INTERVAL`
/// seconds into the future. Returns `None` to mean "run immediately",
/// mirroring the original's `-1` sentinel for "no keys yet".
///
/// Mirrors `ServerKeyring.getNextKeygen`.
pub fn next_keygen(all_keysets: &[Liveness]) -> Option<SystemTime> {
    let last_expiry = all_keysets.iter().map(|l| l.valid_until).max()?;
    Some(last_expiry - PUBLICATION_LATENCY - PREPUBLICATION_INTERVAL)
}

/// How many new keysets need generating right now, and when the first
/// one's validity should start, so that the schedule is covered through
/// `PUBLICATION_LATENCY + PREPUBLICATION_INTERVAL` from `now`.
///
/// Mirrors `ServerKeyring.createKeysAsNeeded`'s count computation
/// (`createKeys` itself, which actually materializes the keys, lives in
/// [`crate::keyring::Keyring`] since it touches disk).
pub fn keys_needed(
    all_keysets: &[Liveness],
    now: SystemTime,
    key_lifetime: Duration,
) -> Option<(u32, SystemTime)> {
    if let Some(keygen_at) = next_keygen(all_keysets) {
        // 10 seconds of leeway, matching the original.
        if keygen_at > now - Duration::from_secs(10) {
            return None;
        }
    }

    let last_expiry = all_keysets
        .iter()
        .map(|l| l.valid_until)
        .max()
        .filter(|&t| t >= now)
        .unwrap_or(now);

    let need_to_cover_until = now + PUBLICATION_LATENCY + PREPUBLICATION_INTERVAL;
    let time_to_cover = need_to_cover_until
        .duration_since(last_expiry)
        .unwrap_or(Duration::ZERO);

    let lifetime_secs = key_lifetime.as_secs().max(1);
    let n_keys = time_to_cover.as_secs().div_ceil(lifetime_secs).max(1) as u32;

    // One minute after the previous key's expiry (or `now`, if there is
    // no previous key), before the caller snaps it to midnight.
    Some((n_keys, last_expiry + Duration::from_secs(60)))
}

#[cfg(test)]
mod test {
    use super::*;

    fn secs(n: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(n)
    }

    #[test]
    fn live_indices_excludes_future_and_long_dead_keys() {
        let keysets = vec![
            Liveness { valid_after: secs(0), valid_until: secs(100) },
            Liveness { valid_after: secs(100), valid_until: secs(200) },
            Liveness { valid_after: secs(500), valid_until: secs(600) },
        ];
        let overlap = Duration::from_secs(10);
        let live = live_indices(&keysets, secs(150), overlap);
        assert_eq!(live, vec![1]);
    }

    #[test]
    fn dead_indices_finds_expired_past_overlap() {
        let keysets = vec![
            Liveness { valid_after: secs(0), valid_until: secs(100) },
            Liveness { valid_after: secs(100), valid_until: secs(200) },
        ];
        let overlap = Duration::from_secs(10);
        assert_eq!(dead_indices(&keysets, secs(115), overlap), vec![0]);
    }

    #[test]
    fn next_rotation_picks_the_earliest_event() {
        let keysets = vec![
            Liveness { valid_after: secs(0), valid_until: secs(100) },
            Liveness { valid_after: secs(150), valid_until: secs(300) },
        ];
        let overlap = Duration::from_secs(10);
        let next = next_rotation(&keysets, &[0], overlap).unwrap();
        // current key 0 leaves at 110, future key 1 arrives at 150: earliest is 110.
        assert_eq!(next, secs(110));
    }

    #[test]
    fn next_rotation_is_none_with_no_keysets() {
        assert_eq!(next_rotation(&[], &[], Duration::from_secs(10)), None);
    }

    #[test]
    fn keys_needed_is_none_when_far_from_next_keygen() {
        let keysets = vec![Liveness {
            valid_after: secs(0),
            valid_until: secs(u64::from(u32::MAX)),
        }];
        assert_eq!(keys_needed(&keysets, secs(0), Duration::from_secs(86400)), None);
    }

    #[test]
    fn keys_needed_computes_at_least_one_key_when_empty() {
        let (n, start) = keys_needed(&[], secs(1000), Duration::from_secs(86400)).unwrap();
        assert!(n >= 1);
        assert_eq!(start, secs(1060));
    }
}
