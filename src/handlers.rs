// src/handlers.rs
use std::convert::Infallible;

use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    Json,
};
use futures_util::stream::{self, Stream};
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use crate::error::AppError;
use crate::extract::{ApiJson, ApiPath, ApiQuery};
use crate::live::LiveTally;
use crate::models::{CreatePollRequest, PollIdQuery, UserQuery, VoteOutcome, VoteRequest};
use crate::polls;
use crate::state::AppState;
use crate::tally::TallyReconciler;
use crate::voting;

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "store": state.store.backend_name(),
        "feed_available": state.feed.is_available(),
    }))
}

/// List polls, newest first; `?user_id=` narrows to one owner
pub async fn list_polls(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<UserQuery>,
) -> Result<impl IntoResponse, AppError> {
    let polls = polls::list_polls(state.store.as_ref(), query.user_id.as_deref()).await?;
    Ok(Json(polls))
}

/// Create a poll with its options
pub async fn create_poll(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<CreatePollRequest>,
) -> Result<impl IntoResponse, AppError> {
    let details = polls::create_poll(state.store.as_ref(), request).await?;
    Ok((StatusCode::CREATED, Json(details)))
}

pub async fn get_poll(
    State(state): State<AppState>,
    ApiPath(poll_id): ApiPath<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let details = polls::get_poll(state.store.as_ref(), poll_id).await?;
    Ok(Json(details))
}

/// Delete a poll (owner only)
pub async fn delete_poll(
    State(state): State<AppState>,
    ApiPath(poll_id): ApiPath<Uuid>,
    ApiQuery(query): ApiQuery<UserQuery>,
) -> Result<impl IntoResponse, AppError> {
    let user_id = query
        .user_id
        .ok_or_else(|| AppError::Validation("Missing required fields".to_string()))?;
    polls::delete_poll(state.store.as_ref(), poll_id, &user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Current tally of a poll, read from one snapshot
pub async fn poll_results(
    State(state): State<AppState>,
    ApiPath(poll_id): ApiPath<Uuid>,
    ApiQuery(query): ApiQuery<UserQuery>,
) -> Result<impl IntoResponse, AppError> {
    if state.store.get_poll(poll_id).await?.is_none() {
        return Err(AppError::NotFound(format!("Poll {poll_id} not found")));
    }

    let mut tally = TallyReconciler::new(poll_id, query.user_id);
    let ticket = tally.begin_snapshot();
    let snapshot = state.store.snapshot(poll_id).await?;
    tally.install_snapshot(ticket, snapshot);

    Ok(Json(tally.view()))
}

/// Live tally as server-sent events. The session lives as long as the
/// response stream.
pub async fn live_results(
    State(state): State<AppState>,
    ApiPath(poll_id): ApiPath<Uuid>,
    ApiQuery(query): ApiQuery<UserQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    if state.store.get_poll(poll_id).await?.is_none() {
        return Err(AppError::NotFound(format!("Poll {poll_id} not found")));
    }

    let live = LiveTally::mount(
        state.store.clone(),
        state.feed.clone(),
        poll_id,
        query.user_id,
        state.config.feed_poll_interval,
    );
    let updates = live.updates();

    let events = stream::unfold((live, updates, true), |(live, mut updates, first)| async move {
        if !first && updates.changed().await.is_err() {
            return None;
        }
        let update = updates.borrow_and_update().clone();
        let event = Event::default()
            .event("tally")
            .json_data(&update)
            .unwrap_or_else(|e| {
                warn!(error = %e, "Failed to encode live update");
                Event::default().comment("encode error")
            });
        Some((Ok(event), (live, updates, false)))
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

/// Raw votes of a poll
pub async fn list_votes(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<PollIdQuery>,
) -> Result<impl IntoResponse, AppError> {
    let votes = state.store.list_votes(query.poll_id).await?;
    Ok(Json(votes))
}

/// Vote for an option, or change an existing vote
pub async fn vote(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<VoteRequest>,
) -> Result<impl IntoResponse, AppError> {
    let response = voting::cast_vote(
        state.store.as_ref(),
        request.poll_id,
        &request.user_id,
        request.option_id,
    )
    .await?;

    let status = match response.outcome {
        VoteOutcome::Inserted => StatusCode::CREATED,
        VoteOutcome::Updated | VoteOutcome::Unchanged => StatusCode::OK,
    };
    Ok((status, Json(response)))
}
