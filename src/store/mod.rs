// src/store/mod.rs
//! Store access interface.
//!
//! Every component that reads or writes polls goes through [`PollStore`], so
//! handlers, the reconciler and the live sessions can run against Postgres or
//! against the in-memory backend used by tests.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{Poll, PollOption, PollSnapshot, Vote};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

pub type DynStore = Arc<dyn PollStore>;

#[async_trait]
pub trait PollStore: Send + Sync {
    /// Inserts a poll row.
    async fn insert_poll(&self, poll: &Poll) -> Result<Poll, StoreError>;

    /// Inserts the option rows of one poll.
    ///
    /// # Errors
    ///
    /// Fails as a whole: either every option is stored or none is.
    async fn insert_options(&self, options: &[PollOption]) -> Result<Vec<PollOption>, StoreError>;

    /// Deletes a poll together with its options and votes. Deleting a poll
    /// that does not exist is not an error.
    async fn delete_poll(&self, poll_id: Uuid) -> Result<(), StoreError>;

    async fn get_poll(&self, poll_id: Uuid) -> Result<Option<Poll>, StoreError>;

    /// Lists polls newest first, optionally restricted to one owner.
    async fn list_polls(&self, owner: Option<&str>) -> Result<Vec<Poll>, StoreError>;

    /// Options of a poll in creation order.
    async fn list_options(&self, poll_id: Uuid) -> Result<Vec<PollOption>, StoreError>;

    async fn list_votes(&self, poll_id: Uuid) -> Result<Vec<Vote>, StoreError>;

    /// Reads options and votes of a poll from a single consistent view.
    async fn snapshot(&self, poll_id: Uuid) -> Result<PollSnapshot, StoreError>;

    async fn find_vote(&self, poll_id: Uuid, user_id: &str) -> Result<Option<Vote>, StoreError>;

    /// Inserts a first vote.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Conflict` if the user already has a vote on this poll.
    async fn insert_vote(&self, vote: &Vote) -> Result<Vote, StoreError>;

    /// Points an existing vote at another option.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the vote does not exist.
    async fn update_vote_option(&self, vote_id: Uuid, option_id: Uuid) -> Result<Vote, StoreError>;

    /// Name of the backend for logging and health reporting.
    fn backend_name(&self) -> &'static str;
}
