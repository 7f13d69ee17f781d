// src/voting.rs
use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{AppError, StoreError};
use crate::models::{Vote, VoteOutcome, VoteResponse};
use crate::store::PollStore;

/// Records `user_id`'s vote for `option_id`.
///
/// A first vote inserts a row, a revote moves the existing row, and a repeat
/// of the current choice changes nothing. Retrying after any outcome is safe:
/// if an insert races with another insert for the same user, the store's
/// uniqueness constraint rejects it and the call continues on the update path.
pub async fn cast_vote(
    store: &dyn PollStore,
    poll_id: Uuid,
    user_id: &str,
    option_id: Uuid,
) -> Result<VoteResponse, AppError> {
    let user_id = user_id.trim();
    if user_id.is_empty() {
        return Err(AppError::Validation("Missing required fields".to_string()));
    }

    if store.get_poll(poll_id).await?.is_none() {
        return Err(AppError::NotFound(format!("Poll {poll_id} not found")));
    }
    let options = store.list_options(poll_id).await?;
    if !options.iter().any(|option| option.id == option_id) {
        return Err(AppError::NotFound(format!(
            "Option {option_id} not found in poll {poll_id}"
        )));
    }

    let existing = match store.find_vote(poll_id, user_id).await? {
        Some(existing) => existing,
        None => {
            let vote = Vote {
                id: Uuid::new_v4(),
                poll_id,
                option_id,
                user_id: user_id.to_string(),
                created_at: Utc::now(),
            };
            match store.insert_vote(&vote).await {
                Ok(vote) => {
                    info!(%poll_id, %option_id, user_id, "Vote recorded");
                    return Ok(VoteResponse {
                        outcome: VoteOutcome::Inserted,
                        vote,
                    });
                }
                Err(StoreError::Conflict(_)) => {
                    debug!(%poll_id, user_id, "Already voted, switching to update");
                    store.find_vote(poll_id, user_id).await?.ok_or_else(|| {
                        AppError::Unavailable("vote conflict without a stored vote".to_string())
                    })?
                }
                Err(e) => return Err(e.into()),
            }
        }
    };

    if existing.option_id == option_id {
        return Ok(VoteResponse {
            outcome: VoteOutcome::Unchanged,
            vote: existing,
        });
    }

    let vote = store.update_vote_option(existing.id, option_id).await?;
    info!(
        %poll_id,
        from = %existing.option_id,
        to = %option_id,
        user_id,
        "Vote changed"
    );

    Ok(VoteResponse {
        outcome: VoteOutcome::Updated,
        vote,
    })
}
