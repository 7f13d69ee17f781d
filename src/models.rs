// src/models.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Poll {
    pub id: Uuid,
    pub title: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
}

/// One selectable answer of a poll.
///
/// `votes` is a cached counter kept by the database; tallies are always
/// computed from vote rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct PollOption {
    pub id: Uuid,
    pub poll_id: Uuid,
    pub option_text: String,
    pub votes: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Vote {
    pub id: Uuid,
    pub poll_id: Uuid,
    pub option_id: Uuid,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
}

/// A poll together with its options, in creation order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollDetails {
    pub poll: Poll,
    pub options: Vec<PollOption>,
}

/// Options and votes read from one consistent view of the store.
#[derive(Debug, Clone, Default)]
pub struct PollSnapshot {
    pub options: Vec<PollOption>,
    pub votes: Vec<Vote>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePollRequest {
    pub title: String,
    pub options: Vec<String>,
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    pub poll_id: Uuid,
    pub option_id: Uuid,
    pub user_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteOutcome {
    Inserted,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteResponse {
    pub outcome: VoteOutcome,
    pub vote: Vote,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserQuery {
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollIdQuery {
    pub poll_id: Uuid,
}
