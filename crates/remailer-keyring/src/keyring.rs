//! The top-level keyring: owns the identity key, every generated
//! keyset, and the current MMTP TLS context, and drives the rotation,
//! publication, and consistency-checking schedule.
//!
//! Grounded in the `ServerKeyring` class in `ServerKeys.py`. All state
//! mutation goes through a single [`parking_lot::ReentrantMutex`], the
//! same coarse-locking approach the original uses (a single
//! `threading.RLock` guarding the whole keyring) rather than per-field
//! locks, since every operation here is infrequent (hourly-to-daily) and
//! none of them need to run concurrently with each other.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use fs_mistrust::{CheckedDir, Mistrust};
use parking_lot::ReentrantMutex;
use tracing::{debug, info, warn};

use remailer_error::{ErrorDetail, Result};

use crate::config::KeyringConfig;
use crate::consistency::{ConsistencyReport, Verdict};
use crate::identity::IdentityKey;
use crate::keyset::KeySet;
use crate::publisher::{PublishOutcome, Publisher};
use crate::scheduler::{self, Liveness};
use crate::tls::TlsContext;

/// Name of the hash-log subdirectory under the work directory.
const HASHLOG_DIR: &str = "hashlogs";

/// Name of the file persisting the pinger's random seed under the key
/// directory.
const PINGER_SEED_FILE: &str = "pinger_seed";

/// Bytes of randomness stored in [`PINGER_SEED_FILE`].
const PINGER_SEED_BYTES: usize = 20;

/// Name of the cert-chain file persisted under the work directory, and
/// the `.tmp` staging name [`write_and_replace`](CheckedDir::write_and_replace)
/// uses to make the replacement atomic.
const CERT_CHAIN_FILE: &str = "cert_chain";

/// Everything the keyring mutates, guarded by [`Keyring::inner`].
struct State {
    identity: IdentityKey,
    keysets: Vec<KeySet>,
    tls: Option<TlsContext>,
    next_rotation: Option<SystemTime>,
}

/// The server's keyring: identity key, generated keysets, and MMTP TLS
/// context, plus the operations that keep them in sync with
/// configuration and the directory server.
pub struct Keyring {
    config: KeyringConfig,
    key_dir: CheckedDir,
    work_dir: CheckedDir,
    hash_dir: PathBuf,
    dh_params_path: PathBuf,
    publisher: Publisher,
    inner: ReentrantMutex<RefCell<State>>,
}

impl Keyring {
    /// Open (or initialize) a keyring rooted at `config.key_dir`/
    /// `config.work_dir`, loading the identity key and scanning for
    /// existing keysets.
    ///
    /// Mirrors `ServerKeyring.__init__` / `checkKeys`'s startup scan,
    /// minus the consistency check itself: call [`Keyring::check_keys`]
    /// once construction succeeds to mirror the original's
    /// check-on-every-startup behavior.
    pub fn open(config: KeyringConfig) -> Result<Self> {
        let mistrust = Mistrust::new();
        let key_dir = mistrust
            .verifier()
            .permit_readable()
            .make_secure_dir(&config.key_dir)
            .map_err(|e| ErrorDetail::Io(format!("could not secure key directory: {e}")))?;
        let work_dir = mistrust
            .verifier()
            .permit_readable()
            .make_secure_dir(&config.work_dir)
            .map_err(|e| ErrorDetail::Io(format!("could not secure work directory: {e}")))?;
        let hash_dir_checked = work_dir
            .make_secure_directory(HASHLOG_DIR)
            .map_err(|e| ErrorDetail::Io(format!("could not secure hash log directory: {e}")))?;
        let hash_dir = hash_dir_checked.as_path().to_path_buf();

        let identity = IdentityKey::load_or_create(&key_dir, config.identity_key_bits)?;
        let dh_params_path = IdentityKey::ensure_dh_params(&key_dir)?;

        let mut keysets = Vec::new();
        for entry in key_dir
            .read_directory(".")
            .map_err(|e| ErrorDetail::Io(format!("could not list key directory: {e}")))?
        {
            let entry = entry.map_err(|e| ErrorDetail::Io(format!("bad directory entry: {e}")))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with("key_") || !entry.path().is_dir() {
                continue;
            }
            let sub = key_dir
                .make_secure_directory(&name)
                .map_err(|e| ErrorDetail::Io(format!("could not secure {name}: {e}")))?;
            // A keyset directory is either complete (packet key + valid
            // descriptor) or bad; rather than letting one corrupt/partial
            // directory from a crashed generation take down the whole
            // scan, discard it and move on rather than failing the whole open.
            match KeySet::scan(name.clone(), sub, &hash_dir) {
                Ok(keyset) => keysets.push(keyset),
                Err(e) => {
                    warn!(keyset = %name, error = %e, "discarding invalid keyset directory");
                    if let Err(e) = std::fs::remove_dir_all(key_dir.as_path().join(&name)) {
                        warn!(keyset = %name, error = %e, "could not remove invalid keyset directory");
                    }
                }
            }
        }
        keysets.sort_by(|a, b| a.name().cmp(b.name()));

        let publisher = Publisher::new(config.directory_url.clone());

        info!(keysets = keysets.len(), "opened server keyring");

        Ok(Keyring {
            config,
            key_dir,
            work_dir,
            hash_dir,
            dh_params_path,
            publisher,
            inner: ReentrantMutex::new(RefCell::new(State {
                identity,
                keysets,
                tls: None,
                next_rotation: None,
            })),
        })
    }

    /// The configuration this keyring was opened with.
    pub fn config(&self) -> &KeyringConfig {
        &self.config
    }

    /// Names of every keyset currently on disk, in name order.
    pub fn keyset_names(&self) -> Vec<String> {
        let guard = self.inner.lock();
        let state = guard.borrow();
        state.keysets.iter().map(|k| k.name().to_string()).collect()
    }

    /// Compare every keyset's descriptor against current configuration,
    /// regenerating (and unpublishing) any that are
    /// [`Verdict::Bad`](crate::consistency::Verdict::Bad).
    ///
    /// Mirrors `ServerKeyring.checkKeys`.
    pub fn check_keys(&self) -> Result<Vec<(String, ConsistencyReport)>> {
        let guard = self.inner.lock();
        let mut state = guard.borrow_mut();
        let State { identity, keysets, tls, .. } = &mut *state;

        let tls_digest = tls.as_ref().map(|t| t.key_digest_hex().to_string());
        let mut reports = Vec::with_capacity(keysets.len());
        for keyset in keysets.iter_mut() {
            let report = keyset.check_consistency(&self.config, true);
            if report.verdict == Verdict::Bad {
                let digest = tls_digest.as_deref().unwrap_or_default();
                keyset.regenerate_descriptor(identity, &self.config, digest)?;
            }
            reports.push((keyset.name().to_string(), report));
        }
        Ok(reports)
    }

    /// Compute how far in the future key generation is already covered.
    ///
    /// Mirrors `ServerKeyring.getNextKeygen`.
    pub fn next_keygen(&self) -> Option<SystemTime> {
        let guard = self.inner.lock();
        let state = guard.borrow();
        scheduler::next_keygen(&liveness_of(&state.keysets))
    }

    /// Generate as many new keysets as needed to keep the schedule
    /// covered `PUBLICATION_LATENCY + PREPUBLICATION_INTERVAL` into the
    /// future, returning the names of whatever was created.
    ///
    /// New keysets are numbered by [`allocate_key_numbers`]: the range of
    /// existing numbers grows downward one step at a time while its floor
    /// is still above `1`, then upward past its ceiling once that floor is
    /// reached. Mirrors `ServerKeyring.createKeysAsNeeded`.
    pub fn create_keys_as_needed(&self, now: SystemTime) -> Result<Vec<String>> {
        let guard = self.inner.lock();
        let mut state = guard.borrow_mut();

        let liveness = liveness_of(&state.keysets);
        let Some((n_keys, start)) = scheduler::keys_needed(&liveness, now, self.config.public_key_lifetime)
        else {
            return Ok(Vec::new());
        };

        let existing_numbers: Vec<u32> = state
            .keysets
            .iter()
            .filter_map(|k| key_number(k.name()))
            .collect();
        let numbers = allocate_key_numbers(&existing_numbers, n_keys);

        let tls_digest = state
            .tls
            .as_ref()
            .map(|t| t.key_digest_hex().to_string())
            .unwrap_or_default();

        let mut created = Vec::with_capacity(numbers.len());
        let mut valid_after = start;
        for number in numbers {
            let name = format!("key_{number:04}");
            let dir = self
                .key_dir
                .make_secure_directory(&name)
                .map_err(|e| ErrorDetail::Io(format!("could not create {name}: {e}")))?;
            let keyset = KeySet::create(
                name.clone(),
                dir,
                &self.hash_dir,
                &state.identity,
                &self.config,
                &tls_digest,
                valid_after,
            )?;
            valid_after = keyset.liveness().valid_until + Duration::from_secs(60);
            state.keysets.push(keyset);
            created.push(name);
        }
        state.keysets.sort_by(|a, b| a.name().cmp(b.name()));
        info!(count = created.len(), "created new keysets");
        Ok(created)
    }

    /// Names of every keyset live at `now`.
    ///
    /// Mirrors `ServerKeyring._getLiveKeys`.
    pub fn live_keyset_names(&self, now: SystemTime) -> Vec<String> {
        let guard = self.inner.lock();
        let state = guard.borrow();
        let liveness = liveness_of(&state.keysets);
        scheduler::live_indices(&liveness, now, self.config.public_key_overlap)
            .into_iter()
            .map(|i| state.keysets[i].name().to_string())
            .collect()
    }

    /// The next instant at which the live keyset set changes, caching
    /// the result until it is invalidated by key creation/removal.
    ///
    /// Mirrors `ServerKeyring.getNextKeyRotation`.
    pub fn next_key_rotation(&self, now: SystemTime) -> Option<SystemTime> {
        let guard = self.inner.lock();
        let mut state = guard.borrow_mut();
        if let Some(cached) = state.next_rotation {
            if cached > now {
                return Some(cached);
            }
        }
        let liveness = liveness_of(&state.keysets);
        let live = scheduler::live_indices(&liveness, now, self.config.public_key_overlap);
        let next = scheduler::next_rotation(&liveness, &live, self.config.public_key_overlap);
        state.next_rotation = next;
        next
    }

    /// Permanently delete every keyset that has passed its overlap
    /// window, returning the names removed.
    ///
    /// Mirrors `ServerKeyring.removeDeadKeys`.
    pub fn remove_dead_keys(&self, now: SystemTime) -> Result<Vec<String>> {
        let guard = self.inner.lock();
        let mut state = guard.borrow_mut();

        let liveness = liveness_of(&state.keysets);
        let dead = scheduler::dead_indices(&liveness, now, self.config.public_key_overlap);
        let dead: BTreeSet<usize> = dead.into_iter().collect();

        let mut removed = Vec::with_capacity(dead.len());
        let mut kept = Vec::with_capacity(state.keysets.len() - dead.len());
        let mut first_error = None;
        for (idx, keyset) in state.keysets.drain(..).enumerate() {
            if !dead.contains(&idx) {
                kept.push(keyset);
                continue;
            }
            if first_error.is_some() {
                // Once one deletion has failed, stop trying to delete
                // further keysets this round, but don't drop them: keep
                // them around to retry on the next call.
                kept.push(keyset);
                continue;
            }
            let name = keyset.name().to_string();
            match keyset.delete() {
                Ok(()) => removed.push(name),
                Err(e) => first_error = Some(e),
            }
        }
        kept.sort_by(|a, b| a.name().cmp(b.name()));
        state.keysets = kept;
        state.next_rotation = None;

        if !removed.is_empty() {
            info!(removed = ?removed, "removed dead keysets");
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        Ok(removed)
    }

    /// Force every live keyset's descriptor to be rebuilt and re-signed
    /// from current configuration, e.g. after the MMTP TLS context has
    /// been replaced.
    pub fn regenerate_descriptors(&self) -> Result<()> {
        let guard = self.inner.lock();
        let mut state = guard.borrow_mut();
        let State { identity, keysets, tls, .. } = &mut *state;
        let digest = tls
            .as_ref()
            .map(|t| t.key_digest_hex().to_string())
            .unwrap_or_default();
        for keyset in keysets.iter_mut() {
            keyset.regenerate_descriptor(identity, &self.config, &digest)?;
        }
        Ok(())
    }

    /// Return the current MMTP TLS context, minting (and persisting) a
    /// fresh one if there is none cached, it has expired, or `force` is
    /// set.
    ///
    /// Mirrors `ServerKeyring._getTLSContext`/`_newTLSContext`: the
    /// certificate chain is written to `cert_chain` under the work
    /// directory through [`CheckedDir::write_and_replace`], which stages
    /// the write through a temporary file so a reader never observes a
    /// half-written chain.
    pub fn tls_context(&self, force: bool, now: SystemTime) -> Result<TlsContext> {
        let guard = self.inner.lock();
        let mut state = guard.borrow_mut();

        let needs_mint = match &state.tls {
            Some(ctx) => ctx.needs_refresh(force, now),
            None => true,
        };
        if needs_mint {
            let ctx = TlsContext::mint(&state.identity, &self.config.nickname, &self.dh_params_path, now)?;
            self.work_dir
                .write_and_replace(CERT_CHAIN_FILE, ctx.certificate_chain_pem().as_bytes())
                .map_err(|e| ErrorDetail::Tls(format!("could not persist certificate chain: {e}")))?;
            info!(expires = ?ctx.expires(), "minted new MMTP TLS context");
            state.tls = Some(ctx);
        }
        Ok(state.tls.clone().expect("just set or already present"))
    }

    /// Submit every unpublished keyset's descriptor (or, if `all` is
    /// set, every keyset's descriptor regardless of prior publication)
    /// to the directory server.
    ///
    /// Stops and returns the first transport-level error encountered,
    /// matching `ServerKeyring.publishKeys`'s behavior of not masking one
    /// keyset's failure by continuing on to the next: a directory outage
    /// likely affects every subsequent attempt too, so there is nothing
    /// to gain from retrying immediately for each keyset in turn.
    pub fn publish_keys(&self, all: bool, now: SystemTime) -> Result<Vec<(String, PublishOutcome)>> {
        let guard = self.inner.lock();
        let mut state = guard.borrow_mut();

        let liveness = liveness_of(&state.keysets);
        let live: BTreeSet<usize> =
            scheduler::live_indices(&liveness, now, self.config.public_key_overlap)
                .into_iter()
                .collect();

        let mut outcomes = Vec::new();
        for (idx, keyset) in state.keysets.iter_mut().enumerate() {
            if !all && !live.contains(&idx) {
                continue;
            }
            if !all && keyset.is_published() {
                continue;
            }
            let outcome = keyset.publish(&self.publisher)?;
            match &outcome {
                PublishOutcome::Accepted { message } => {
                    info!(keyset = keyset.name(), %message, "descriptor published")
                }
                PublishOutcome::Rejected { message } => {
                    warn!(keyset = keyset.name(), %message, "descriptor rejected by directory")
                }
            }
            outcomes.push((keyset.name().to_string(), outcome));
        }
        Ok(outcomes)
    }

    /// Run the keyring's full periodic maintenance sequence: check
    /// consistency, generate any needed keys, drop dead keys, refresh
    /// the TLS context, regenerate descriptors if it changed, publish
    /// whatever needs it, and refresh the rotation-time cache.
    ///
    /// Mirrors the sequence `MMTPServer`'s main loop drives via
    /// `ServerKeyring.checkKeys`/`createKeysAsNeeded`/`removeDeadKeys`/
    /// `getTLSContext`/`publishKeys` on every scheduled tick.
    pub fn update_keys(&self, now: SystemTime) -> Result<()> {
        self.check_keys()?;
        self.create_keys_as_needed(now)?;
        self.remove_dead_keys(now)?;

        let previous_digest = {
            let guard = self.inner.lock();
            let state = guard.borrow();
            state.tls.as_ref().map(|t| t.key_digest_hex().to_string())
        };
        let ctx = self.tls_context(false, now)?;
        if previous_digest.as_deref() != Some(ctx.key_digest_hex()) {
            self.regenerate_descriptors()?;
        }

        self.publish_keys(false, now)?;
        let _ = self.next_key_rotation(now);

        debug!("keyring maintenance cycle complete");
        Ok(())
    }

    /// Permanently remove the server's identity key and DH parameters.
    ///
    /// Mirrors `ServerKeyring.removeIdentityKey`. This is destructive and
    /// irreversible, and is never called by [`Keyring::update_keys`] or
    /// any other internal maintenance path — only an explicit
    /// operator-initiated action should invoke it, and the keyring must
    /// not be used afterward.
    pub fn remove_identity_key(&self) -> Result<()> {
        IdentityKey::remove(&self.key_dir)
    }

    /// The random seed used to jitter the mix pool's ping/probe timing,
    /// generating and persisting one on first use.
    ///
    /// Mirrors `ServerKeyring.getPingerSeed`: this value is not secret
    /// (it only defeats trivial timing predictability, not an adversary
    /// who can already observe the server), so it is stored as a plain
    /// file rather than going through [`crate::secure_delete`].
    pub fn pinger_seed(&self) -> Result<Vec<u8>> {
        if self
            .key_dir
            .as_path()
            .join(PINGER_SEED_FILE)
            .try_exists()
            .unwrap_or(false)
        {
            return self
                .key_dir
                .read(PINGER_SEED_FILE)
                .map_err(|e| ErrorDetail::Io(format!("could not read pinger seed: {e}")).into());
        }

        use rand::RngCore;
        let mut seed = vec![0u8; PINGER_SEED_BYTES];
        rand::thread_rng().fill_bytes(&mut seed);
        self.key_dir
            .write_and_replace(PINGER_SEED_FILE, &seed)
            .map_err(|e| ErrorDetail::Io(format!("could not persist pinger seed: {e}")))?;
        Ok(seed)
    }
}

/// Collect every keyset's validity window, in the same order as
/// `keysets`, so indices returned by [`crate::scheduler`] line up.
fn liveness_of(keysets: &[KeySet]) -> Vec<Liveness> {
    keysets.iter().map(KeySet::liveness).collect()
}

/// Parse the numeric suffix of a `key_NNNN`-style name.
fn key_number(name: &str) -> Option<u32> {
    name.strip_prefix("key_")?.parse().ok()
}

/// Choose `n` previously-unused keyset numbers from `existing`, extending
/// the `(first, last)` range downward one step at a time while `first > 1`,
/// then upward past `last` once it reaches the floor.
///
/// A freshly created keyring with no historical gap below its lowest
/// number grows by appending past the top of the range; one that still
/// has room below `1` backfills that room first, preserving the ability
/// to reuse historical slots without renumbering anything already on
/// disk.
fn allocate_key_numbers(existing: &[u32], n: u32) -> Vec<u32> {
    let mut chosen = Vec::with_capacity(n as usize);
    let Some(mut first) = existing.iter().copied().min() else {
        return (1..=n).collect();
    };
    let mut last = existing.iter().copied().max().unwrap_or(first);

    for _ in 0..n {
        if first > 1 {
            first -= 1;
            chosen.push(first);
        } else {
            last += 1;
            chosen.push(last);
        }
    }
    chosen
}
