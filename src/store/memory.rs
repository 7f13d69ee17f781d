// src/store/memory.rs
//! In-memory [`PollStore`].
//!
//! Enforces the same constraints as the Postgres schema (one vote per user
//! per poll, option rows belong to an existing poll) and publishes change
//! events to a [`ChangeFeed`] after every committed write, the way the
//! database triggers do. Failures can be injected for tests.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
};

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use super::PollStore;
use crate::error::StoreError;
use crate::feed::{ChangeEvent, ChangeFeed, ChangeKind, Table};
use crate::models::{Poll, PollOption, PollSnapshot, Vote};

#[derive(Default)]
struct Tables {
    polls: HashMap<Uuid, Poll>,
    options: Vec<PollOption>,
    votes: Vec<Vote>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    feed: Option<ChangeFeed>,
    unavailable: AtomicBool,
    fail_option_inserts: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that publishes its changes to `feed`.
    pub fn with_feed(feed: ChangeFeed) -> Self {
        Self {
            feed: Some(feed),
            ..Self::default()
        }
    }

    /// Makes every call fail with `StoreError::Unavailable` until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Makes `insert_options` fail until reset.
    pub fn fail_option_inserts(&self, fail: bool) {
        self.fail_option_inserts.store(fail, Ordering::SeqCst);
    }

    pub fn poll_count(&self) -> usize {
        self.tables().polls.len()
    }

    pub fn vote_count(&self) -> usize {
        self.tables().votes.len()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }

    fn emit<T: serde::Serialize>(
        &self,
        kind: ChangeKind,
        table: Table,
        poll_id: Uuid,
        new_row: Option<&T>,
        old_row: Option<&T>,
    ) {
        let Some(feed) = &self.feed else {
            return;
        };
        let to_value = |row: &T| serde_json::to_value(row).unwrap_or(Value::Null);
        let delivered = feed.publish(ChangeEvent {
            kind,
            table,
            poll_id,
            new_row: new_row.map(to_value),
            old_row: old_row.map(to_value),
        });
        debug!(?kind, %table, %poll_id, delivered, "Published change event");
    }

    /// Moves the cached counter of `option_id` and publishes the row change,
    /// like the counter trigger does.
    fn bump_counter(&self, tables: &mut Tables, poll_id: Uuid, option_id: Uuid, delta: i32) {
        let Some(option) = tables.options.iter_mut().find(|o| o.id == option_id) else {
            return;
        };
        let old = option.clone();
        option.votes += delta;
        self.emit(ChangeKind::Update, Table::PollOptions, poll_id, Some(&*option), Some(&old));
    }
}

#[async_trait]
impl PollStore for MemoryStore {
    async fn insert_poll(&self, poll: &Poll) -> Result<Poll, StoreError> {
        self.check_available()?;
        let mut tables = self.tables();
        if tables.polls.contains_key(&poll.id) {
            return Err(StoreError::Conflict(format!("poll {} already exists", poll.id)));
        }
        tables.polls.insert(poll.id, poll.clone());
        Ok(poll.clone())
    }

    async fn insert_options(&self, options: &[PollOption]) -> Result<Vec<PollOption>, StoreError> {
        self.check_available()?;
        if self.fail_option_inserts.load(Ordering::SeqCst) {
            return Err(StoreError::Internal("option insert rejected".to_string()));
        }

        let mut tables = self.tables();
        if let Some(orphan) = options.iter().find(|o| !tables.polls.contains_key(&o.poll_id)) {
            return Err(StoreError::NotFound(format!("poll {}", orphan.poll_id)));
        }
        tables.options.extend(options.iter().cloned());

        for option in options {
            self.emit(ChangeKind::Insert, Table::PollOptions, option.poll_id, Some(option), None);
        }
        Ok(options.to_vec())
    }

    async fn delete_poll(&self, poll_id: Uuid) -> Result<(), StoreError> {
        self.check_available()?;
        let mut tables = self.tables();
        if tables.polls.remove(&poll_id).is_none() {
            return Ok(());
        }
        let (votes, kept): (Vec<_>, Vec<_>) =
            tables.votes.drain(..).partition(|v| v.poll_id == poll_id);
        tables.votes = kept;
        let (options, kept): (Vec<_>, Vec<_>) =
            tables.options.drain(..).partition(|o| o.poll_id == poll_id);
        tables.options = kept;

        for vote in &votes {
            self.emit(ChangeKind::Delete, Table::Votes, poll_id, None, Some(vote));
        }
        for option in &options {
            self.emit(ChangeKind::Delete, Table::PollOptions, poll_id, None, Some(option));
        }
        Ok(())
    }

    async fn get_poll(&self, poll_id: Uuid) -> Result<Option<Poll>, StoreError> {
        self.check_available()?;
        Ok(self.tables().polls.get(&poll_id).cloned())
    }

    async fn list_polls(&self, owner: Option<&str>) -> Result<Vec<Poll>, StoreError> {
        self.check_available()?;
        let mut polls: Vec<Poll> = self
            .tables()
            .polls
            .values()
            .filter(|p| owner.map_or(true, |owner| p.user_id == owner))
            .cloned()
            .collect();
        polls.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(polls)
    }

    async fn list_options(&self, poll_id: Uuid) -> Result<Vec<PollOption>, StoreError> {
        self.check_available()?;
        Ok(self
            .tables()
            .options
            .iter()
            .filter(|o| o.poll_id == poll_id)
            .cloned()
            .collect())
    }

    async fn list_votes(&self, poll_id: Uuid) -> Result<Vec<Vote>, StoreError> {
        self.check_available()?;
        Ok(self
            .tables()
            .votes
            .iter()
            .filter(|v| v.poll_id == poll_id)
            .cloned()
            .collect())
    }

    async fn snapshot(&self, poll_id: Uuid) -> Result<PollSnapshot, StoreError> {
        self.check_available()?;
        let tables = self.tables();
        Ok(PollSnapshot {
            options: tables
                .options
                .iter()
                .filter(|o| o.poll_id == poll_id)
                .cloned()
                .collect(),
            votes: tables
                .votes
                .iter()
                .filter(|v| v.poll_id == poll_id)
                .cloned()
                .collect(),
        })
    }

    async fn find_vote(&self, poll_id: Uuid, user_id: &str) -> Result<Option<Vote>, StoreError> {
        self.check_available()?;
        Ok(self
            .tables()
            .votes
            .iter()
            .find(|v| v.poll_id == poll_id && v.user_id == user_id)
            .cloned())
    }

    async fn insert_vote(&self, vote: &Vote) -> Result<Vote, StoreError> {
        self.check_available()?;
        let mut tables = self.tables();
        if tables
            .votes
            .iter()
            .any(|v| v.poll_id == vote.poll_id && v.user_id == vote.user_id)
        {
            return Err(StoreError::Conflict(format!(
                "user {} already voted on poll {}",
                vote.user_id, vote.poll_id
            )));
        }
        if !tables
            .options
            .iter()
            .any(|o| o.id == vote.option_id && o.poll_id == vote.poll_id)
        {
            return Err(StoreError::NotFound(format!("option {}", vote.option_id)));
        }
        tables.votes.push(vote.clone());

        // Published under the lock so events leave in commit order.
        self.emit(ChangeKind::Insert, Table::Votes, vote.poll_id, Some(vote), None);
        self.bump_counter(&mut tables, vote.poll_id, vote.option_id, 1);
        Ok(vote.clone())
    }

    async fn update_vote_option(&self, vote_id: Uuid, option_id: Uuid) -> Result<Vote, StoreError> {
        self.check_available()?;
        let mut tables = self.tables();
        let Some(index) = tables.votes.iter().position(|v| v.id == vote_id) else {
            return Err(StoreError::NotFound(format!("vote {vote_id}")));
        };
        let poll_id = tables.votes[index].poll_id;
        if !tables
            .options
            .iter()
            .any(|o| o.id == option_id && o.poll_id == poll_id)
        {
            return Err(StoreError::NotFound(format!("option {option_id}")));
        }
        let old = tables.votes[index].clone();
        tables.votes[index].option_id = option_id;
        let new = tables.votes[index].clone();

        self.emit(ChangeKind::Update, Table::Votes, poll_id, Some(&new), Some(&old));
        if old.option_id != new.option_id {
            self.bump_counter(&mut tables, poll_id, old.option_id, -1);
            self.bump_counter(&mut tables, poll_id, new.option_id, 1);
        }
        Ok(new)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
