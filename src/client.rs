// src/client.rs
use http::Method;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{CreatePollRequest, Poll, PollDetails, Vote, VoteRequest, VoteResponse};
use crate::session::build_request;
use crate::tally::TallyView;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("{status}: {message}")]
    Api {
        status: u16,
        message: String,
        retryable: bool,
    },
}

impl ClientError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Api { status, .. } => Some(*status),
            ClientError::Transport(e) => e.status().map(|s| s.as_u16()),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Api { retryable, .. } => *retryable,
            ClientError::Transport(e) => e.is_connect() || e.is_timeout(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    #[serde(default)]
    retryable: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub store: String,
    pub feed_available: bool,
}

/// HTTP client for the poll API. Every request carries the session token the
/// client was created with.
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base_url: String,
    session_token: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, session_token: Option<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            session_token,
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        build_request(&self.http, method, &url, self.session_token.as_deref())
    }

    pub async fn health(&self) -> Result<HealthResponse, ClientError> {
        decode(self.request(Method::GET, "/api/health").send().await?).await
    }

    pub async fn create_poll(&self, request: &CreatePollRequest) -> Result<PollDetails, ClientError> {
        let response = self
            .request(Method::POST, "/api/polls")
            .json(request)
            .send()
            .await?;
        decode(response).await
    }

    pub async fn list_polls(&self, owner: Option<&str>) -> Result<Vec<Poll>, ClientError> {
        let mut request = self.request(Method::GET, "/api/polls");
        if let Some(owner) = owner {
            request = request.query(&[("user_id", owner)]);
        }
        decode(request.send().await?).await
    }

    pub async fn get_poll(&self, poll_id: Uuid) -> Result<PollDetails, ClientError> {
        let path = format!("/api/polls/{poll_id}");
        decode(self.request(Method::GET, &path).send().await?).await
    }

    pub async fn delete_poll(&self, poll_id: Uuid, user_id: &str) -> Result<(), ClientError> {
        let path = format!("/api/polls/{poll_id}");
        let response = self
            .request(Method::DELETE, &path)
            .query(&[("user_id", user_id)])
            .send()
            .await?;
        check(response).await.map(|_| ())
    }

    pub async fn results(&self, poll_id: Uuid, user_id: Option<&str>) -> Result<TallyView, ClientError> {
        let path = format!("/api/polls/{poll_id}/results");
        let mut request = self.request(Method::GET, &path);
        if let Some(user_id) = user_id {
            request = request.query(&[("user_id", user_id)]);
        }
        decode(request.send().await?).await
    }

    pub async fn list_votes(&self, poll_id: Uuid) -> Result<Vec<Vote>, ClientError> {
        let response = self
            .request(Method::GET, "/api/votes")
            .query(&[("poll_id", poll_id.to_string())])
            .send()
            .await?;
        decode(response).await
    }

    pub async fn cast_vote(&self, vote: &VoteRequest) -> Result<VoteResponse, ClientError> {
        let response = self
            .request(Method::POST, "/api/votes")
            .json(vote)
            .send()
            .await?;
        decode(response).await
    }
}

async fn check(response: Response) -> Result<Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let (message, retryable) = match serde_json::from_str::<ErrorBody>(&body) {
        Ok(parsed) => (parsed.error, parsed.retryable),
        Err(_) => (body, false),
    };
    Err(ClientError::Api {
        status: status.as_u16(),
        message,
        retryable,
    })
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ClientError> {
    Ok(check(response).await?.json::<T>().await?)
}
