// src/polls.rs
use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{CreatePollRequest, Poll, PollDetails, PollOption};
use crate::store::PollStore;

pub const MIN_OPTIONS: usize = 2;

/// A create request that passed validation: trimmed title, trimmed
/// non-empty options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPoll {
    pub title: String,
    pub options: Vec<String>,
    pub user_id: String,
}

impl NewPoll {
    pub fn validate(request: CreatePollRequest) -> Result<Self, AppError> {
        let title = request.title.trim().to_string();
        if title.is_empty() {
            return Err(AppError::Validation("Please enter a poll title".to_string()));
        }

        let user_id = request.user_id.trim().to_string();
        if user_id.is_empty() {
            return Err(AppError::Validation("Missing required fields".to_string()));
        }

        let options: Vec<String> = request
            .options
            .iter()
            .map(|option| option.trim())
            .filter(|option| !option.is_empty())
            .map(str::to_string)
            .collect();
        if options.len() < MIN_OPTIONS {
            return Err(AppError::Validation(format!(
                "At least {MIN_OPTIONS} options are required"
            )));
        }

        Ok(Self {
            title,
            options,
            user_id,
        })
    }
}

/// Creates a poll and its options. If the options cannot be stored the
/// poll row is deleted again, so callers never see a poll without options.
pub async fn create_poll(
    store: &dyn PollStore,
    request: CreatePollRequest,
) -> Result<PollDetails, AppError> {
    let new_poll = NewPoll::validate(request)?;

    let now = Utc::now();
    let poll = store
        .insert_poll(&Poll {
            id: Uuid::new_v4(),
            title: new_poll.title,
            user_id: new_poll.user_id,
            created_at: now,
        })
        .await?;

    // Spread timestamps by a microsecond so creation order survives the
    // ORDER BY created_at in listings.
    let options: Vec<PollOption> = new_poll
        .options
        .into_iter()
        .enumerate()
        .map(|(index, option_text)| PollOption {
            id: Uuid::new_v4(),
            poll_id: poll.id,
            option_text,
            votes: 0,
            created_at: now + chrono::Duration::microseconds(index as i64),
        })
        .collect();

    let options = match store.insert_options(&options).await {
        Ok(options) => options,
        Err(e) => {
            warn!(poll_id = %poll.id, error = %e, "Option insert failed, removing poll");
            if let Err(cleanup) = store.delete_poll(poll.id).await {
                error!(poll_id = %poll.id, error = %cleanup, "Failed to remove orphaned poll");
            }
            return Err(e.into());
        }
    };

    info!(poll_id = %poll.id, options = options.len(), "Poll created");
    Ok(PollDetails { poll, options })
}

pub async fn get_poll(store: &dyn PollStore, poll_id: Uuid) -> Result<PollDetails, AppError> {
    let poll = store
        .get_poll(poll_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Poll {poll_id} not found")))?;
    let options = store.list_options(poll_id).await?;

    Ok(PollDetails { poll, options })
}

pub async fn list_polls(store: &dyn PollStore, owner: Option<&str>) -> Result<Vec<Poll>, AppError> {
    Ok(store.list_polls(owner).await?)
}

/// Deletes a poll on behalf of its owner.
pub async fn delete_poll(
    store: &dyn PollStore,
    poll_id: Uuid,
    user_id: &str,
) -> Result<(), AppError> {
    let poll = store
        .get_poll(poll_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Poll {poll_id} not found")))?;

    if poll.user_id != user_id {
        return Err(AppError::Forbidden(
            "Only the poll owner can delete it".to_string(),
        ));
    }

    store.delete_poll(poll_id).await?;
    info!(%poll_id, "Poll deleted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn request(title: &str, options: &[&str]) -> CreatePollRequest {
        CreatePollRequest {
            title: title.to_string(),
            options: options.iter().map(|o| o.to_string()).collect(),
            user_id: "owner".to_string(),
        }
    }

    #[tokio::test]
    async fn creates_poll_with_trimmed_options_in_order() {
        let store = MemoryStore::new();
        let details = create_poll(&store, request("  Lunch?  ", &[" Pizza ", "", "Sushi"]))
            .await
            .unwrap();

        assert_eq!(details.poll.title, "Lunch?");
        let texts: Vec<_> = details.options.iter().map(|o| o.option_text.as_str()).collect();
        assert_eq!(texts, ["Pizza", "Sushi"]);

        let fetched = get_poll(&store, details.poll.id).await.unwrap();
        assert_eq!(fetched.options, details.options);
    }

    #[tokio::test]
    async fn single_option_is_rejected_without_writing() {
        let store = MemoryStore::new();
        let err = create_poll(&store, request("Lunch?", &["A"])).await.unwrap_err();

        assert!(matches!(err, AppError::Validation(_)));
        assert_eq!(store.poll_count(), 0);
    }

    #[tokio::test]
    async fn blank_title_is_rejected() {
        let store = MemoryStore::new();
        let err = create_poll(&store, request("   ", &["A", "B"])).await.unwrap_err();

        assert!(matches!(err, AppError::Validation(_)));
        assert_eq!(store.poll_count(), 0);
    }

    #[tokio::test]
    async fn failed_option_insert_removes_poll() {
        let store = MemoryStore::new();
        store.fail_option_inserts(true);

        let err = create_poll(&store, request("Lunch?", &["A", "B"])).await.unwrap_err();

        assert!(matches!(err, AppError::Internal(_)));
        assert_eq!(store.poll_count(), 0);
    }

    #[tokio::test]
    async fn only_owner_can_delete() {
        let store = MemoryStore::new();
        let details = create_poll(&store, request("Lunch?", &["A", "B"])).await.unwrap();

        let err = delete_poll(&store, details.poll.id, "intruder").await.unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));

        delete_poll(&store, details.poll.id, "owner").await.unwrap();
        assert!(matches!(
            get_poll(&store, details.poll.id).await.unwrap_err(),
            AppError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn lists_newest_first_and_filters_by_owner() {
        let store = MemoryStore::new();
        let pause = || tokio::time::sleep(std::time::Duration::from_millis(2));
        let first = create_poll(&store, request("First", &["A", "B"])).await.unwrap();
        pause().await;
        let mut other = request("Other", &["A", "B"]);
        other.user_id = "someone-else".to_string();
        create_poll(&store, other).await.unwrap();
        pause().await;
        let last = create_poll(&store, request("Last", &["A", "B"])).await.unwrap();

        let mine = list_polls(&store, Some("owner")).await.unwrap();
        assert_eq!(mine.len(), 2);
        assert_eq!(mine[0].id, last.poll.id);
        assert_eq!(mine[1].id, first.poll.id);
        assert_eq!(list_polls(&store, None).await.unwrap().len(), 3);
    }
}
