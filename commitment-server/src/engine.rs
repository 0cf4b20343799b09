//! Commitment state machine.
//!
//! A row starts out `Awaiting`. A verifier attempt moves it to `Match` (sticky)
//! or `NoMatch`; a later correct attempt can still turn `NoMatch` into `Match`.
//! The prover can poll the state, but only learns it when presenting the
//! prover key reference. Both sides are throttled independently by the
//! [`VelocityCheck`].

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

use crate::crypto::{Ed25519KeyGenerator, KeyPairGenerator, Pbkdf2Hasher, SecretHasher};
use crate::error::{CommitmentError, Result};
use crate::store::{CommitmentRow, CommitmentStore, SecretState};

pub const MAX_ATTEMPTS_PER_WINDOW: u32 = 5;

/// Attempt throttle: once `max_attempts` attempts have been counted, further
/// attempts are refused until `window` has passed since the last one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VelocityCheck {
    pub max_attempts: u32,
    pub window: Duration,
}

impl Default for VelocityCheck {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS_PER_WINDOW,
            window: Duration::hours(1),
        }
    }
}

impl VelocityCheck {
    pub fn allows(&self, last_attempt: DateTime<Utc>, attempts: u32, now: DateTime<Utc>) -> bool {
        let within_window = now.signed_duration_since(last_attempt) < self.window;
        !(attempts >= self.max_attempts && within_window)
    }
}

/// What the prover gets back from [`VerificationEngine::submit_secret`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub id: String,
    pub prover_key_ref: String,
    pub verifier_key_ref: String,
}

impl fmt::Display for Submission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "uuid:{} | proverKey:{} | verifierKey:{}",
            self.id, self.prover_key_ref, self.verifier_key_ref
        )
    }
}

/// Result of a prover poll.
///
/// The poll is recorded even when it trips the throttle, so the label is
/// always present and `rate_limited` says whether the caller should be told
/// to back off instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateReport {
    pub label: SecretState,
    pub rate_limited: bool,
}

impl StateReport {
    pub fn into_result(self) -> Result<SecretState> {
        if self.rate_limited {
            Err(CommitmentError::RateLimited)
        } else {
            Ok(self.label)
        }
    }
}

pub struct VerificationEngine {
    store: Arc<CommitmentStore>,
    hasher: Box<dyn SecretHasher>,
    keys: Box<dyn KeyPairGenerator>,
    velocity: VelocityCheck,
}

impl VerificationEngine {
    pub fn new(store: Arc<CommitmentStore>) -> Self {
        Self {
            store,
            hasher: Box::new(Pbkdf2Hasher::default()),
            keys: Box::new(Ed25519KeyGenerator),
            velocity: VelocityCheck::default(),
        }
    }

    pub fn with_hasher(mut self, hasher: impl SecretHasher + 'static) -> Self {
        self.hasher = Box::new(hasher);
        self
    }

    pub fn with_key_generator(mut self, keys: impl KeyPairGenerator + 'static) -> Self {
        self.keys = Box::new(keys);
        self
    }

    pub fn with_velocity_check(mut self, velocity: VelocityCheck) -> Self {
        self.velocity = velocity;
        self
    }

    pub fn store(&self) -> &Arc<CommitmentStore> {
        &self.store
    }

    /// Commits to `secret` and hands back the id plus both key references.
    pub fn submit_secret(&self, secret: &str) -> Result<Submission> {
        let refs = self.keys.generate()?;
        let hashed_secret = self.hasher.hash(secret)?;

        let row = self.store.create(CommitmentRow::new(
            hashed_secret,
            refs.prover,
            refs.verifier,
            Utc::now(),
        ))?;
        info!(id = %row.id, "secret committed");

        Ok(Submission {
            id: row.id,
            prover_key_ref: row.prover_key_ref,
            verifier_key_ref: row.verifier_key_ref,
        })
    }

    /// Checks a candidate secret against the commitment stored under `id`.
    ///
    /// A throttled attempt leaves the row untouched. Only a wrong verifier key
    /// reference counts towards the throttle; a wrong secret with the right
    /// key reference does not.
    pub fn verify_secret(&self, secret: &str, id: &str, verifier_key_ref: &str) -> Result<bool> {
        self.store.update_with(id, |row| {
            if row.state == SecretState::Match {
                debug!(id = %row.id, "commitment already matched");
                return Ok(true);
            }

            let now = Utc::now();
            if !self.velocity.allows(
                row.last_verifier_attempt,
                row.verifier_attempt_count,
                now,
            ) {
                warn!(
                    id = %row.id,
                    attempts = row.verifier_attempt_count,
                    "verifier attempt throttled"
                );
                return Err(CommitmentError::RateLimited);
            }
            row.last_verifier_attempt = now;

            let secret_matches = self.hasher.verify(secret, &row.hashed_secret);
            let key_matches = refs_match(verifier_key_ref, &row.verifier_key_ref);

            if key_matches && secret_matches {
                row.state = SecretState::Match;
                row.verifier_attempt_count = 0;
                info!(id = %row.id, "commitment matched");
                return Ok(true);
            }

            row.state = SecretState::NoMatch;
            if !key_matches {
                row.verifier_attempt_count = row.verifier_attempt_count.saturating_add(1);
                warn!(
                    id = %row.id,
                    attempts = row.verifier_attempt_count,
                    "verifier key reference mismatch"
                );
            } else {
                debug!(id = %row.id, "secret does not match commitment");
            }
            Ok(false)
        })?
    }

    /// Reports the state of the commitment under `id` to its prover.
    ///
    /// Without the right prover key reference the label is always `NoMatch`,
    /// so the true state cannot be learned by guessing. The attempt is
    /// recorded whether or not it trips the throttle.
    pub fn get_secret_state(&self, id: &str, prover_key_ref: &str) -> Result<StateReport> {
        self.store.update_with(id, |row| {
            let now = Utc::now();
            let rate_limited =
                !self
                    .velocity
                    .allows(row.last_prover_attempt, row.prover_attempt_count, now);

            let label = if refs_match(prover_key_ref, &row.prover_key_ref) {
                row.prover_attempt_count = 0;
                row.state
            } else {
                row.prover_attempt_count = row.prover_attempt_count.saturating_add(1);
                warn!(
                    id = %row.id,
                    attempts = row.prover_attempt_count,
                    "prover key reference mismatch"
                );
                SecretState::NoMatch
            };
            row.last_prover_attempt = now;

            if rate_limited {
                warn!(id = %row.id, "prover poll throttled");
            }
            StateReport {
                label,
                rate_limited,
            }
        })
    }
}

fn refs_match(presented: &str, stored: &str) -> bool {
    presented.as_bytes().ct_eq(stored.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::crypto::{KeyReferences, MIN_HASH_ITERATIONS};
    use crate::store::IdGenerator;

    fn engine() -> VerificationEngine {
        engine_with_store(Arc::new(CommitmentStore::new()))
    }

    fn engine_with_store(store: Arc<CommitmentStore>) -> VerificationEngine {
        VerificationEngine::new(store)
            .with_hasher(Pbkdf2Hasher::new(MIN_HASH_ITERATIONS).expect("hasher"))
    }

    fn row(engine: &VerificationEngine, id: &str) -> CommitmentRow {
        engine.store().get(id).expect("row exists")
    }

    struct BrokenKeys;

    impl KeyPairGenerator for BrokenKeys {
        fn generate(&self) -> Result<KeyReferences> {
            Err(CommitmentError::CryptoFailure("no entropy".into()))
        }
    }

    struct BrokenHasher;

    impl SecretHasher for BrokenHasher {
        fn hash(&self, _secret: &str) -> Result<String> {
            Err(CommitmentError::CryptoFailure("hash failed".into()))
        }

        fn verify(&self, _secret: &str, _hash: &str) -> bool {
            false
        }
    }

    /// Counts calls to `verify` so tests can tell whether a secret was hashed.
    struct CountingHasher {
        inner: Pbkdf2Hasher,
        verifies: Arc<AtomicUsize>,
    }

    impl SecretHasher for CountingHasher {
        fn hash(&self, secret: &str) -> Result<String> {
            self.inner.hash(secret)
        }

        fn verify(&self, secret: &str, hash: &str) -> bool {
            self.verifies.fetch_add(1, Ordering::SeqCst);
            self.inner.verify(secret, hash)
        }
    }

    fn counting_engine() -> (VerificationEngine, Arc<AtomicUsize>) {
        let verifies = Arc::new(AtomicUsize::new(0));
        let hasher = CountingHasher {
            inner: Pbkdf2Hasher::new(MIN_HASH_ITERATIONS).expect("hasher"),
            verifies: Arc::clone(&verifies),
        };
        (engine().with_hasher(hasher), verifies)
    }

    struct NoIds;

    impl IdGenerator for NoIds {
        fn generate(&self) -> Result<String> {
            Err(CommitmentError::StorageFailure("no ids".into()))
        }
    }

    #[test]
    fn velocity_check_blocks_only_inside_the_window() {
        let check = VelocityCheck::default();
        let now = Utc::now();

        assert!(check.allows(now, 4, now));
        assert!(!check.allows(now, 5, now));
        assert!(!check.allows(now - Duration::minutes(59), 5, now));
        assert!(check.allows(now - Duration::minutes(61), 5, now));
        assert!(check.allows(now - Duration::hours(3), 50, now));
    }

    #[test]
    fn submit_creates_an_awaiting_row() {
        let engine = engine();
        let submission = engine.submit_secret("hunter2").expect("submit");
        let stored = row(&engine, &submission.id);

        assert_eq!(stored.state, SecretState::Awaiting);
        assert_eq!(stored.prover_attempt_count, 0);
        assert_eq!(stored.verifier_attempt_count, 0);
        assert_eq!(stored.prover_key_ref, submission.prover_key_ref);
        assert_eq!(stored.verifier_key_ref, submission.verifier_key_ref);
        assert!(engine.hasher.verify("hunter2", &stored.hashed_secret));
        assert!(!engine.hasher.verify("hunter3", &stored.hashed_secret));

        let other = engine.submit_secret("hunter2").expect("submit");
        assert_ne!(submission.id, other.id);
    }

    #[test]
    fn submit_fails_on_key_generation_error() {
        let engine = engine().with_key_generator(BrokenKeys);
        assert!(matches!(
            engine.submit_secret("s"),
            Err(CommitmentError::CryptoFailure(_))
        ));
        assert!(engine.store().is_empty());
    }

    #[test]
    fn submit_fails_on_hash_error() {
        let engine = engine().with_hasher(BrokenHasher);
        assert!(matches!(
            engine.submit_secret("s"),
            Err(CommitmentError::CryptoFailure(_))
        ));
        assert!(engine.store().is_empty());
    }

    #[test]
    fn submit_fails_on_id_generation_error() {
        let engine = engine_with_store(Arc::new(CommitmentStore::with_id_generator(NoIds)));
        assert!(matches!(
            engine.submit_secret("s"),
            Err(CommitmentError::StorageFailure(_))
        ));
    }

    #[test]
    fn correct_secret_and_key_match() {
        let engine = engine();
        let sub = engine.submit_secret("pw").expect("submit");

        let matched = engine
            .verify_secret("pw", &sub.id, &sub.verifier_key_ref)
            .expect("verify");

        assert!(matched);
        let stored = row(&engine, &sub.id);
        assert_eq!(stored.state, SecretState::Match);
        assert_eq!(stored.verifier_attempt_count, 0);
    }

    #[test]
    fn match_is_sticky_and_untouched() {
        let engine = engine();
        let sub = engine.submit_secret("pw").expect("submit");
        engine
            .verify_secret("pw", &sub.id, &sub.verifier_key_ref)
            .expect("verify");
        let before = row(&engine, &sub.id);

        let again = engine
            .verify_secret("wrong", &sub.id, "wrong key")
            .expect("verify");

        assert!(again);
        assert_eq!(row(&engine, &sub.id), before);
    }

    #[test]
    fn matched_row_is_never_hashed_again() {
        let (engine, verifies) = counting_engine();
        let sub = engine.submit_secret("pw").expect("submit");
        engine
            .verify_secret("pw", &sub.id, &sub.verifier_key_ref)
            .expect("verify");
        assert_eq!(verifies.load(Ordering::SeqCst), 1);

        for (secret, key) in [("pw", sub.verifier_key_ref.as_str()), ("other", "bad")] {
            assert_eq!(engine.verify_secret(secret, &sub.id, key), Ok(true));
        }
        assert_eq!(verifies.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn throttled_verify_skips_the_hash() {
        let (engine, verifies) = counting_engine();
        let sub = engine.submit_secret("pw").expect("submit");
        for _ in 0..MAX_ATTEMPTS_PER_WINDOW {
            engine.verify_secret("pw", &sub.id, "bad").expect("verify");
        }
        assert_eq!(verifies.load(Ordering::SeqCst), MAX_ATTEMPTS_PER_WINDOW as usize);

        let throttled = engine.verify_secret("pw", &sub.id, &sub.verifier_key_ref);

        assert_eq!(throttled, Err(CommitmentError::RateLimited));
        assert_eq!(verifies.load(Ordering::SeqCst), MAX_ATTEMPTS_PER_WINDOW as usize);
    }

    #[test]
    fn wrong_key_counts_as_failed_attempt() {
        let engine = engine();
        let sub = engine.submit_secret("pw").expect("submit");

        let matched = engine
            .verify_secret("pw", &sub.id, "not the key")
            .expect("verify");

        assert!(!matched);
        let stored = row(&engine, &sub.id);
        assert_eq!(stored.state, SecretState::NoMatch);
        assert_eq!(stored.verifier_attempt_count, 1);
    }

    #[test]
    fn wrong_secret_with_right_key_does_not_count() {
        let engine = engine();
        let sub = engine.submit_secret("pw").expect("submit");
        let before = row(&engine, &sub.id);

        let matched = engine
            .verify_secret("nope", &sub.id, &sub.verifier_key_ref)
            .expect("verify");

        assert!(!matched);
        let stored = row(&engine, &sub.id);
        assert_eq!(stored.state, SecretState::NoMatch);
        assert_eq!(stored.verifier_attempt_count, 0);
        assert!(stored.last_verifier_attempt >= before.last_verifier_attempt);
    }

    #[test]
    fn no_match_can_still_become_match() {
        let engine = engine();
        let sub = engine.submit_secret("pw").expect("submit");
        engine.verify_secret("pw", &sub.id, "bad").expect("verify");

        let matched = engine
            .verify_secret("pw", &sub.id, &sub.verifier_key_ref)
            .expect("verify");

        assert!(matched);
        let stored = row(&engine, &sub.id);
        assert_eq!(stored.state, SecretState::Match);
        assert_eq!(stored.verifier_attempt_count, 0);
    }

    #[test]
    fn sixth_failed_attempt_is_throttled_without_mutation() {
        let engine = engine();
        let sub = engine.submit_secret("pw").expect("submit");

        for _ in 0..5 {
            assert!(!engine.verify_secret("pw", &sub.id, "bad").expect("verify"));
        }
        let before = row(&engine, &sub.id);
        assert_eq!(before.verifier_attempt_count, 5);

        let result = engine.verify_secret("pw", &sub.id, &sub.verifier_key_ref);

        assert_eq!(result, Err(CommitmentError::RateLimited));
        assert_eq!(row(&engine, &sub.id), before);
    }

    #[test]
    fn throttle_lifts_after_the_window() {
        let engine = engine();
        let sub = engine.submit_secret("pw").expect("submit");
        for _ in 0..5 {
            engine.verify_secret("pw", &sub.id, "bad").expect("verify");
        }

        let mut aged = row(&engine, &sub.id);
        aged.last_verifier_attempt = Utc::now() - Duration::hours(2);
        engine.store().update(&sub.id, aged).expect("update");

        let matched = engine
            .verify_secret("pw", &sub.id, &sub.verifier_key_ref)
            .expect("verify");
        assert!(matched);
    }

    #[test]
    fn verify_unknown_id_is_not_found() {
        let engine = engine();
        assert_eq!(
            engine.verify_secret("pw", "missing", "key"),
            Err(CommitmentError::NotFound)
        );
    }

    #[test]
    fn prover_with_right_key_sees_true_state() {
        let engine = engine();
        let sub = engine.submit_secret("pw").expect("submit");

        let report = engine
            .get_secret_state(&sub.id, &sub.prover_key_ref)
            .expect("state");
        assert_eq!(report.into_result(), Ok(SecretState::Awaiting));

        engine
            .verify_secret("pw", &sub.id, &sub.verifier_key_ref)
            .expect("verify");
        let report = engine
            .get_secret_state(&sub.id, &sub.prover_key_ref)
            .expect("state");
        assert_eq!(report.label, SecretState::Match);
        assert_eq!(row(&engine, &sub.id).prover_attempt_count, 0);
    }

    #[test]
    fn prover_with_wrong_key_always_sees_no_match() {
        let engine = engine();
        let sub = engine.submit_secret("pw").expect("submit");
        engine
            .verify_secret("pw", &sub.id, &sub.verifier_key_ref)
            .expect("verify");
        let before = row(&engine, &sub.id);

        let report = engine
            .get_secret_state(&sub.id, &sub.verifier_key_ref)
            .expect("state");

        assert_eq!(report.label, SecretState::NoMatch);
        assert!(!report.rate_limited);
        let stored = row(&engine, &sub.id);
        assert_eq!(stored.prover_attempt_count, 1);
        assert!(stored.last_prover_attempt >= before.last_prover_attempt);
        assert_eq!(stored.state, SecretState::Match);
    }

    #[test]
    fn throttled_poll_is_still_recorded() {
        let engine = engine();
        let sub = engine.submit_secret("pw").expect("submit");
        for _ in 0..5 {
            let report = engine.get_secret_state(&sub.id, "bad").expect("state");
            assert!(!report.rate_limited);
        }

        let report = engine.get_secret_state(&sub.id, "bad").expect("state");
        assert!(report.rate_limited);
        assert_eq!(report.into_result(), Err(CommitmentError::RateLimited));
        assert_eq!(row(&engine, &sub.id).prover_attempt_count, 6);

        // The right key resets the counter even while throttled.
        let report = engine
            .get_secret_state(&sub.id, &sub.prover_key_ref)
            .expect("state");
        assert!(report.rate_limited);
        assert_eq!(report.label, SecretState::Awaiting);
        assert_eq!(row(&engine, &sub.id).prover_attempt_count, 0);
    }

    #[test]
    fn state_of_unknown_id_is_not_found() {
        let engine = engine();
        assert_eq!(
            engine.get_secret_state("missing", "key"),
            Err(CommitmentError::NotFound)
        );
    }

    #[test]
    fn submission_display() {
        let sub = Submission {
            id: "abc".into(),
            prover_key_ref: "p".into(),
            verifier_key_ref: "v".into(),
        };
        assert_eq!(sub.to_string(), "uuid:abc | proverKey:p | verifierKey:v");
    }
}
