//! In-memory commitment table.
//!
//! Every row lives behind its own mutex, and the map only hands out those
//! slots. A read-modify-write on one id therefore serializes with other
//! callers on the same id, while work on different ids proceeds in parallel.
//! The map lock is only held long enough to find, insert or remove a slot.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, warn};

use crate::error::{CommitmentError, Result};

/// Number of times [`CommitmentStore::create`] asks for a new id when the
/// generator hands back one that is already taken.
const MAX_ID_ATTEMPTS: usize = 8;

/// Verification state of a commitment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretState {
    Awaiting,
    Match,
    NoMatch,
}

impl fmt::Display for SecretState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SecretState::Awaiting => "AwaitingForVerifierSubmission",
            SecretState::Match => "Match",
            SecretState::NoMatch => "NoMatch",
        };
        f.write_str(label)
    }
}

/// A stored commitment: the hashed secret, both key references and the
/// attempt bookkeeping for each side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitmentRow {
    pub id: String,
    pub hashed_secret: String,
    pub prover_key_ref: String,
    pub verifier_key_ref: String,
    pub state: SecretState,
    pub last_prover_attempt: DateTime<Utc>,
    pub last_verifier_attempt: DateTime<Utc>,
    pub prover_attempt_count: u32,
    pub verifier_attempt_count: u32,
}

impl CommitmentRow {
    /// A row that has not been stored yet. The id is assigned by the store.
    pub fn new(
        hashed_secret: String,
        prover_key_ref: String,
        verifier_key_ref: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: String::new(),
            hashed_secret,
            prover_key_ref,
            verifier_key_ref,
            state: SecretState::Awaiting,
            last_prover_attempt: now,
            last_verifier_attempt: now,
            prover_attempt_count: 0,
            verifier_attempt_count: 0,
        }
    }
}

/// Source of collision-resistant row identifiers.
pub trait IdGenerator: Send + Sync {
    fn generate(&self) -> Result<String>;
}

/// Random (version 4) UUIDs drawn from the operating system RNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidV4;

impl IdGenerator for UuidV4 {
    fn generate(&self) -> Result<String> {
        let mut bytes = [0u8; 16];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|err| CommitmentError::StorageFailure(err.to_string()))?;
        Ok(uuid::Builder::from_random_bytes(bytes)
            .into_uuid()
            .to_string())
    }
}

type Slot = Arc<Mutex<CommitmentRow>>;

/// Concurrency-safe keyed storage for [`CommitmentRow`]s.
pub struct CommitmentStore {
    rows: RwLock<HashMap<String, Slot>>,
    ids: Box<dyn IdGenerator>,
}

impl Default for CommitmentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CommitmentStore {
    pub fn new() -> Self {
        Self::with_id_generator(UuidV4)
    }

    pub fn with_id_generator(ids: impl IdGenerator + 'static) -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
            ids: Box::new(ids),
        }
    }

    /// Stores `row` under a fresh id. The state is always reset to
    /// [`SecretState::Awaiting`], whatever the caller passed in.
    pub fn create(&self, mut row: CommitmentRow) -> Result<CommitmentRow> {
        row.state = SecretState::Awaiting;

        for _ in 0..MAX_ID_ATTEMPTS {
            let id = self.ids.generate()?;

            let mut rows = self.rows.write();
            if rows.contains_key(&id) {
                warn!(id = %id, "id generator produced a duplicate id, retrying");
                continue;
            }
            row.id = id.clone();
            rows.insert(id, Arc::new(Mutex::new(row.clone())));
            debug!(id = %row.id, "commitment row created");
            return Ok(row);
        }

        Err(CommitmentError::StorageFailure(
            "could not allocate a unique id".to_string(),
        ))
    }

    /// Returns a copy of the row stored under `id`.
    pub fn get(&self, id: &str) -> Result<CommitmentRow> {
        let slot = self.slot(id)?;
        let row = slot.lock().clone();
        Ok(row)
    }

    /// Replaces the contents of an existing row. The stored id is kept even if
    /// `row` carries a different one.
    pub fn update(&self, id: &str, mut row: CommitmentRow) -> Result<CommitmentRow> {
        let slot = self.slot(id)?;
        let mut current = slot.lock();
        row.id = current.id.clone();
        *current = row;
        Ok(current.clone())
    }

    /// Runs `f` against the stored row while holding that row's lock, so the
    /// read and the write that follows it are a single atomic step.
    ///
    /// `f` must not change `row.id`; any change is reverted.
    pub fn update_with<R>(&self, id: &str, f: impl FnOnce(&mut CommitmentRow) -> R) -> Result<R> {
        let slot = self.slot(id)?;
        let mut row = slot.lock();
        let original_id = row.id.clone();
        let result = f(&mut *row);
        row.id = original_id;
        Ok(result)
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        match self.rows.write().remove(id) {
            Some(_) => Ok(true),
            None => Err(CommitmentError::NotFound),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    fn slot(&self, id: &str) -> Result<Slot> {
        self.rows
            .read()
            .get(id)
            .cloned()
            .ok_or(CommitmentError::NotFound)
    }
}
