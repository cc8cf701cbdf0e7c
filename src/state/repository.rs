//! Persistence seams for state values.
//!
//! The hosting exam engine owns the actual storage. This module defines the
//! three shapes it has to provide and in-memory implementations backed by
//! `DashMap`, used by the CLI and the tests:
//!
//! - [`StateRepository`]: global rows `(user, name) -> value` and insert-only
//!   instance rows `(user, attempt, sequence number, name) -> value`.
//! - [`AttemptSnapshot`]: the flat key/value bag attached to an attempt's
//!   first step.
//! - [`UserDirectory`]: profiles for the `user` scope.

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::scope::Scope;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RepositoryError {
    /// The storage backend could not be reached.
    #[error("State storage unavailable: {0}")]
    Unavailable(String),

    #[error("State storage error: {0}")]
    Storage(String),
}

/// One persisted state value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVariableRecord {
    pub scope: Scope,
    pub name: String,
    pub value: String,
    /// Set for instance rows only.
    pub sequence_number: Option<i64>,
    /// Set for instance rows only.
    pub attempt_id: Option<i64>,
    pub user_id: i64,
}

impl StateVariableRecord {
    pub fn global(user_id: i64, name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            scope: Scope::Global,
            name: name.into(),
            value: value.into(),
            sequence_number: None,
            attempt_id: None,
            user_id,
        }
    }

    pub fn instance(
        user_id: i64,
        attempt_id: i64,
        sequence_number: i64,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            scope: Scope::Instance,
            name: name.into(),
            value: value.into(),
            sequence_number: Some(sequence_number),
            attempt_id: Some(attempt_id),
            user_id,
        }
    }
}

#[async_trait]
pub trait StateRepository: Send + Sync {
    /// Global rows of `user_id` whose names are in `names`.
    async fn select_global(
        &self,
        user_id: i64,
        names: &[String],
    ) -> Result<Vec<StateVariableRecord>, RepositoryError>;

    /// Updates the row for `(user_id, name)` or inserts it.
    async fn upsert_global(&self, record: StateVariableRecord) -> Result<(), RepositoryError>;

    /// Instance rows with `sequence_number <= max_sequence`, ascending by
    /// sequence number. Rows with equal numbers keep insertion order.
    async fn select_instance(
        &self,
        user_id: i64,
        attempt_id: i64,
        max_sequence: i64,
    ) -> Result<Vec<StateVariableRecord>, RepositoryError>;

    async fn insert_instance(
        &self,
        records: Vec<StateVariableRecord>,
    ) -> Result<(), RepositoryError>;

    /// Number of instance rows named `name` at exactly `sequence_number`.
    async fn count_instance(
        &self,
        user_id: i64,
        attempt_id: i64,
        sequence_number: i64,
        name: &str,
    ) -> Result<usize, RepositoryError>;
}

/// The key/value bag attached to an attempt's first step.
#[async_trait]
pub trait AttemptSnapshot: Send + Sync {
    async fn get_all(&self, attempt_id: i64) -> Result<BTreeMap<String, String>, RepositoryError>;

    async fn get(&self, attempt_id: i64, name: &str) -> Result<Option<String>, RepositoryError>;

    async fn set(&self, attempt_id: i64, name: &str, value: &str) -> Result<(), RepositoryError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: i64,
    pub username: String,
    pub firstname: String,
    pub lastname: String,
    pub idnumber: String,
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn profile(&self, user_id: i64) -> Result<Option<UserProfile>, RepositoryError>;
}

/// Who owns the attempt being processed and who is looking at it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptContext {
    pub attempt_id: i64,
    pub owner_id: i64,
    pub active_user: UserProfile,
}

impl AttemptContext {
    pub fn new(attempt_id: i64, owner: UserProfile) -> Self {
        Self {
            attempt_id,
            owner_id: owner.id,
            active_user: owner,
        }
    }

    /// The same attempt seen by somebody else, e.g. a teacher reviewing it.
    pub fn reviewed_by(mut self, reviewer: UserProfile) -> Self {
        self.active_user = reviewer;
        self
    }

    pub fn is_review(&self) -> bool {
        self.active_user.id != self.owner_id
    }
}

/// In-memory state rows.
///
/// Clones share storage, so a test can keep a handle while the store owns
/// another.
#[derive(Clone, Default)]
pub struct InMemoryStateRepository {
    global: Arc<DashMap<(i64, String), String>>,
    instance: Arc<DashMap<(i64, i64), Vec<StateVariableRecord>>>,
}

impl InMemoryStateRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every instance row of an attempt, in insertion order.
    pub fn instance_rows(&self, user_id: i64, attempt_id: i64) -> Vec<StateVariableRecord> {
        self.instance
            .get(&(user_id, attempt_id))
            .map(|rows| rows.clone())
            .unwrap_or_default()
    }

    pub fn global_value(&self, user_id: i64, name: &str) -> Option<String> {
        self.global
            .get(&(user_id, name.to_string()))
            .map(|value| value.clone())
    }

    /// Total number of stored rows.
    pub fn row_count(&self) -> usize {
        self.global.len() + self.instance.iter().map(|rows| rows.len()).sum::<usize>()
    }
}

#[async_trait]
impl StateRepository for InMemoryStateRepository {
    async fn select_global(
        &self,
        user_id: i64,
        names: &[String],
    ) -> Result<Vec<StateVariableRecord>, RepositoryError> {
        Ok(names
            .iter()
            .filter_map(|name| {
                self.global
                    .get(&(user_id, name.clone()))
                    .map(|value| StateVariableRecord::global(user_id, name.clone(), value.clone()))
            })
            .collect())
    }

    async fn upsert_global(&self, record: StateVariableRecord) -> Result<(), RepositoryError> {
        if record.scope != Scope::Global {
            return Err(RepositoryError::Storage(format!(
                "{} row {} written as global",
                record.scope, record.name
            )));
        }
        self.global
            .insert((record.user_id, record.name), record.value);
        Ok(())
    }

    async fn select_instance(
        &self,
        user_id: i64,
        attempt_id: i64,
        max_sequence: i64,
    ) -> Result<Vec<StateVariableRecord>, RepositoryError> {
        let mut rows: Vec<StateVariableRecord> = self
            .instance_rows(user_id, attempt_id)
            .into_iter()
            .filter(|row| row.sequence_number.is_some_and(|n| n <= max_sequence))
            .collect();
        rows.sort_by_key(|row| row.sequence_number);
        Ok(rows)
    }

    async fn insert_instance(
        &self,
        records: Vec<StateVariableRecord>,
    ) -> Result<(), RepositoryError> {
        for record in records {
            let (Some(attempt_id), Some(_)) = (record.attempt_id, record.sequence_number) else {
                return Err(RepositoryError::Storage(format!(
                    "instance row {} lacks an attempt or sequence number",
                    record.name
                )));
            };
            self.instance
                .entry((record.user_id, attempt_id))
                .or_default()
                .push(record);
        }
        Ok(())
    }

    async fn count_instance(
        &self,
        user_id: i64,
        attempt_id: i64,
        sequence_number: i64,
        name: &str,
    ) -> Result<usize, RepositoryError> {
        Ok(self
            .instance_rows(user_id, attempt_id)
            .iter()
            .filter(|row| row.sequence_number == Some(sequence_number) && row.name == name)
            .count())
    }
}

/// In-memory attempt snapshots, one bag per attempt.
#[derive(Clone, Default)]
pub struct InMemoryAttemptSnapshot {
    bags: Arc<DashMap<i64, BTreeMap<String, String>>>,
}

impl InMemoryAttemptSnapshot {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AttemptSnapshot for InMemoryAttemptSnapshot {
    async fn get_all(&self, attempt_id: i64) -> Result<BTreeMap<String, String>, RepositoryError> {
        Ok(self
            .bags
            .get(&attempt_id)
            .map(|bag| bag.clone())
            .unwrap_or_default())
    }

    async fn get(&self, attempt_id: i64, name: &str) -> Result<Option<String>, RepositoryError> {
        Ok(self
            .bags
            .get(&attempt_id)
            .and_then(|bag| bag.get(name).cloned()))
    }

    async fn set(&self, attempt_id: i64, name: &str, value: &str) -> Result<(), RepositoryError> {
        self.bags
            .entry(attempt_id)
            .or_default()
            .insert(name.to_string(), value.to_string());
        Ok(())
    }
}

/// Fixed set of user profiles.
#[derive(Clone, Default)]
pub struct InMemoryUserDirectory {
    users: Arc<DashMap<i64, UserProfile>>,
}

impl InMemoryUserDirectory {
    pub fn new(profiles: impl IntoIterator<Item = UserProfile>) -> Self {
        let users = DashMap::new();
        for profile in profiles {
            users.insert(profile.id, profile);
        }
        Self {
            users: Arc::new(users),
        }
    }
}

#[async_trait]
impl UserDirectory for InMemoryUserDirectory {
    async fn profile(&self, user_id: i64) -> Result<Option<UserProfile>, RepositoryError> {
        Ok(self.users.get(&user_id).map(|profile| profile.clone()))
    }
}
