// src/store/postgres.rs
use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use super::PollStore;
use crate::error::StoreError;
use crate::models::{Poll, PollOption, PollSnapshot, Vote};

const POLL_COLUMNS: &str = "id, title, user_id, created_at";
const OPTION_COLUMNS: &str = "id, poll_id, option_text, votes, created_at";
const VOTE_COLUMNS: &str = "id, poll_id, option_id, user_id, created_at";

/// [`PollStore`] backed by the Postgres schema created in [`crate::db`].
///
/// Change notifications are emitted by database triggers and picked up by
/// [`crate::listener::NotifyListener`], not by this type.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PollStore for PgStore {
    async fn insert_poll(&self, poll: &Poll) -> Result<Poll, StoreError> {
        let row = sqlx::query_as::<_, Poll>(&format!(
            "INSERT INTO polls (id, title, user_id, created_at) VALUES ($1, $2, $3, $4) \
             RETURNING {POLL_COLUMNS}"
        ))
        .bind(poll.id)
        .bind(&poll.title)
        .bind(&poll.user_id)
        .bind(poll.created_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }

    async fn insert_options(&self, options: &[PollOption]) -> Result<Vec<PollOption>, StoreError> {
        if options.is_empty() {
            return Ok(Vec::new());
        }

        // One multi-row statement, so either all options land or none do.
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("INSERT INTO poll_options (id, poll_id, option_text, votes, created_at) ");
        builder.push_values(options, |mut row, option| {
            row.push_bind(option.id)
                .push_bind(option.poll_id)
                .push_bind(&option.option_text)
                .push_bind(option.votes)
                .push_bind(option.created_at);
        });
        builder.push(format!(" RETURNING {OPTION_COLUMNS}"));

        let mut rows = builder
            .build_query_as::<PollOption>()
            .fetch_all(&self.pool)
            .await?;
        rows.sort_by_key(|row| {
            options
                .iter()
                .position(|o| o.id == row.id)
                .unwrap_or(usize::MAX)
        });

        Ok(rows)
    }

    async fn delete_poll(&self, poll_id: Uuid) -> Result<(), StoreError> {
        // options and votes go with it through ON DELETE CASCADE
        sqlx::query("DELETE FROM polls WHERE id = $1")
            .bind(poll_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn get_poll(&self, poll_id: Uuid) -> Result<Option<Poll>, StoreError> {
        let poll = sqlx::query_as::<_, Poll>(&format!(
            "SELECT {POLL_COLUMNS} FROM polls WHERE id = $1"
        ))
        .bind(poll_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(poll)
    }

    async fn list_polls(&self, owner: Option<&str>) -> Result<Vec<Poll>, StoreError> {
        let polls = sqlx::query_as::<_, Poll>(&format!(
            "SELECT {POLL_COLUMNS} FROM polls \
             WHERE ($1::text IS NULL OR user_id = $1) \
             ORDER BY created_at DESC"
        ))
        .bind(owner)
        .fetch_all(&self.pool)
        .await?;

        Ok(polls)
    }

    async fn list_options(&self, poll_id: Uuid) -> Result<Vec<PollOption>, StoreError> {
        let options = sqlx::query_as::<_, PollOption>(&format!(
            "SELECT {OPTION_COLUMNS} FROM poll_options WHERE poll_id = $1 ORDER BY created_at, id"
        ))
        .bind(poll_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(options)
    }

    async fn list_votes(&self, poll_id: Uuid) -> Result<Vec<Vote>, StoreError> {
        let votes = sqlx::query_as::<_, Vote>(&format!(
            "SELECT {VOTE_COLUMNS} FROM votes WHERE poll_id = $1 ORDER BY created_at"
        ))
        .bind(poll_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(votes)
    }

    async fn snapshot(&self, poll_id: Uuid) -> Result<PollSnapshot, StoreError> {
        // Both reads see the same committed state.
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await?;

        let options = sqlx::query_as::<_, PollOption>(&format!(
            "SELECT {OPTION_COLUMNS} FROM poll_options WHERE poll_id = $1 ORDER BY created_at, id"
        ))
        .bind(poll_id)
        .fetch_all(&mut *tx)
        .await?;

        let votes = sqlx::query_as::<_, Vote>(&format!(
            "SELECT {VOTE_COLUMNS} FROM votes WHERE poll_id = $1"
        ))
        .bind(poll_id)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(PollSnapshot { options, votes })
    }

    async fn find_vote(&self, poll_id: Uuid, user_id: &str) -> Result<Option<Vote>, StoreError> {
        let vote = sqlx::query_as::<_, Vote>(&format!(
            "SELECT {VOTE_COLUMNS} FROM votes WHERE poll_id = $1 AND user_id = $2"
        ))
        .bind(poll_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(vote)
    }

    async fn insert_vote(&self, vote: &Vote) -> Result<Vote, StoreError> {
        // The option must belong to the poll; a mismatch inserts nothing.
        let row = sqlx::query_as::<_, Vote>(&format!(
            "INSERT INTO votes (id, poll_id, option_id, user_id, created_at) \
             SELECT $1, $2, $3, $4, $5 \
             WHERE EXISTS (SELECT 1 FROM poll_options WHERE id = $3 AND poll_id = $2) \
             RETURNING {VOTE_COLUMNS}"
        ))
        .bind(vote.id)
        .bind(vote.poll_id)
        .bind(vote.option_id)
        .bind(&vote.user_id)
        .bind(vote.created_at)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| StoreError::NotFound(format!("option {}", vote.option_id)))
    }

    async fn update_vote_option(&self, vote_id: Uuid, option_id: Uuid) -> Result<Vote, StoreError> {
        let row = sqlx::query_as::<_, Vote>(&format!(
            "UPDATE votes SET option_id = $2 \
             WHERE id = $1 \
               AND EXISTS (SELECT 1 FROM poll_options o WHERE o.id = $2 AND o.poll_id = votes.poll_id) \
             RETURNING {VOTE_COLUMNS}"
        ))
        .bind(vote_id)
        .bind(option_id)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| StoreError::NotFound(format!("vote {vote_id} or option {option_id}")))
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}
