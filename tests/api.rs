// tests/api.rs
use std::sync::Arc;
use std::time::Duration;

use live_poll::client::{ApiClient, ClientError};
use live_poll::config::Config;
use live_poll::feed::ChangeFeed;
use live_poll::live::{LiveUpdate, SubscriptionState};
use live_poll::models::{CreatePollRequest, PollDetails, VoteOutcome, VoteRequest};
use live_poll::routes::create_routes;
use live_poll::state::AppState;
use live_poll::store::MemoryStore;
use tokio::task::JoinHandle;

struct TestServer {
    base: String,
    store: Arc<MemoryStore>,
    shutdown: tokio::sync::oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl TestServer {
    async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.handle.await;
    }
}

async fn start_server() -> TestServer {
    let feed = ChangeFeed::new();
    let store = Arc::new(MemoryStore::with_feed(feed.clone()));
    let config = Config {
        feed_poll_interval: Duration::from_millis(50),
        ..Config::default()
    };
    let app = create_routes(AppState::new(store.clone(), feed, config));

    // Bind to an ephemeral port
    let listener = tokio::net::TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0))
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();

    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = rx.await;
            })
            .await;
    });

    TestServer {
        base: format!("http://{addr}"),
        store,
        shutdown: tx,
        handle,
    }
}

fn poll_request(owner: &str, title: &str, options: &[&str]) -> CreatePollRequest {
    CreatePollRequest {
        title: title.to_string(),
        options: options.iter().map(|o| o.to_string()).collect(),
        user_id: owner.to_string(),
    }
}

fn vote(details: &PollDetails, user: &str, option: usize) -> VoteRequest {
    VoteRequest {
        poll_id: details.poll.id,
        option_id: details.options[option].id,
        user_id: user.to_string(),
    }
}

#[tokio::test]
async fn health_reports_memory_store() {
    let server = start_server().await;
    let client = ApiClient::new(&server.base, None);

    let health = client.health().await.unwrap();
    assert_eq!(health.status, "ok");
    assert_eq!(health.store, "memory");
    assert!(health.feed_available);

    server.stop().await;
}

#[tokio::test]
async fn create_and_fetch_poll() {
    let server = start_server().await;
    let client = ApiClient::new(&server.base, Some("token-alice".to_string()));

    let created = client
        .create_poll(&poll_request("alice", "Lunch?", &["Pizza", "  Sushi  ", ""]))
        .await
        .unwrap();
    assert_eq!(created.poll.title, "Lunch?");
    let texts: Vec<_> = created.options.iter().map(|o| o.option_text.as_str()).collect();
    assert_eq!(texts, vec!["Pizza", "Sushi"]);

    let fetched = client.get_poll(created.poll.id).await.unwrap();
    assert_eq!(fetched.poll, created.poll);
    assert_eq!(fetched.options, created.options);

    let owned = client.list_polls(Some("alice")).await.unwrap();
    assert_eq!(owned.len(), 1);
    assert!(client.list_polls(Some("bob")).await.unwrap().is_empty());

    server.stop().await;
}

#[tokio::test]
async fn single_option_poll_is_rejected() {
    let server = start_server().await;
    let client = ApiClient::new(&server.base, None);

    let err = client
        .create_poll(&poll_request("alice", "Only one", &["Yes", "   "]))
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(400));
    assert!(!err.is_retryable());
    assert_eq!(server.store.poll_count(), 0);

    server.stop().await;
}

#[tokio::test]
async fn malformed_requests_get_json_errors() {
    let server = start_server().await;
    let http = reqwest::Client::new();

    let resp = http
        .post(format!("{}/api/polls", server.base))
        .json(&serde_json::json!({ "options": ["A", "B"], "user_id": "u" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("title"));
    assert_eq!(server.store.poll_count(), 0);

    let resp = http
        .post(format!("{}/api/votes", server.base))
        .json(&serde_json::json!({ "poll_id": "not-a-uuid", "option_id": 3 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert!(body["error"].is_string());

    let resp = http
        .get(format!("{}/api/votes", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert!(body["error"].is_string());

    let resp = http
        .get(format!("{}/api/polls/not-a-uuid", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);

    server.stop().await;
}

#[tokio::test]
async fn unknown_poll_is_not_found() {
    let server = start_server().await;
    let client = ApiClient::new(&server.base, None);

    let err = client.get_poll(uuid::Uuid::new_v4()).await.unwrap_err();
    assert_eq!(err.status(), Some(404));
    let err = client.results(uuid::Uuid::new_v4(), None).await.unwrap_err();
    assert_eq!(err.status(), Some(404));

    server.stop().await;
}

#[tokio::test]
async fn voting_inserts_then_moves_the_same_row() {
    let server = start_server().await;
    let client = ApiClient::new(&server.base, Some("token-bob".to_string()));
    let details = client
        .create_poll(&poll_request("alice", "Color", &["Red", "Green", "Blue"]))
        .await
        .unwrap();

    let first = client.cast_vote(&vote(&details, "bob", 0)).await.unwrap();
    assert_eq!(first.outcome, VoteOutcome::Inserted);

    let again = client.cast_vote(&vote(&details, "bob", 0)).await.unwrap();
    assert_eq!(again.outcome, VoteOutcome::Unchanged);
    assert_eq!(again.vote.id, first.vote.id);

    let moved = client.cast_vote(&vote(&details, "bob", 2)).await.unwrap();
    assert_eq!(moved.outcome, VoteOutcome::Updated);
    assert_eq!(moved.vote.id, first.vote.id);
    assert_eq!(moved.vote.option_id, details.options[2].id);

    let votes = client.list_votes(details.poll.id).await.unwrap();
    assert_eq!(votes.len(), 1);
    assert_eq!(server.store.vote_count(), 1);

    server.stop().await;
}

#[tokio::test]
async fn vote_for_foreign_option_is_rejected() {
    let server = start_server().await;
    let client = ApiClient::new(&server.base, None);
    let first = client
        .create_poll(&poll_request("alice", "A", &["1", "2"]))
        .await
        .unwrap();
    let second = client
        .create_poll(&poll_request("alice", "B", &["3", "4"]))
        .await
        .unwrap();

    let request = VoteRequest {
        poll_id: first.poll.id,
        option_id: second.options[0].id,
        user_id: "bob".to_string(),
    };
    let err = client.cast_vote(&request).await.unwrap_err();
    assert_eq!(err.status(), Some(404));
    assert_eq!(server.store.vote_count(), 0);

    server.stop().await;
}

#[tokio::test]
async fn results_reflect_votes_and_own_choice() {
    let server = start_server().await;
    let client = ApiClient::new(&server.base, None);
    let details = client
        .create_poll(&poll_request("alice", "Pets", &["Cat", "Dog", "Fish"]))
        .await
        .unwrap();

    client.cast_vote(&vote(&details, "u1", 0)).await.unwrap();
    client.cast_vote(&vote(&details, "u2", 0)).await.unwrap();
    client.cast_vote(&vote(&details, "u3", 1)).await.unwrap();

    let view = client.results(details.poll.id, Some("u3")).await.unwrap();
    assert_eq!(view.total_votes, 3);
    assert_eq!(view.own_vote, Some(details.options[1].id));
    let votes: Vec<u64> = view.options.iter().map(|o| o.votes).collect();
    assert_eq!(votes, vec![2, 1, 0]);
    assert_eq!(view.options[0].percentage, 66.7);
    assert_eq!(view.options[1].percentage, 33.3);
    assert_eq!(view.options[2].percentage, 0.0);

    let anonymous = client.results(details.poll.id, None).await.unwrap();
    assert_eq!(anonymous.own_vote, None);

    server.stop().await;
}

#[tokio::test]
async fn only_owner_deletes_poll() {
    let server = start_server().await;
    let client = ApiClient::new(&server.base, None);
    let details = client
        .create_poll(&poll_request("alice", "Mine", &["a", "b"]))
        .await
        .unwrap();
    client.cast_vote(&vote(&details, "bob", 1)).await.unwrap();

    let err = client.delete_poll(details.poll.id, "bob").await.unwrap_err();
    assert_eq!(err.status(), Some(403));
    assert!(client.get_poll(details.poll.id).await.is_ok());

    client.delete_poll(details.poll.id, "alice").await.unwrap();
    let err = client.get_poll(details.poll.id).await.unwrap_err();
    assert_eq!(err.status(), Some(404));
    assert_eq!(server.store.vote_count(), 0);

    server.stop().await;
}

#[tokio::test]
async fn store_outage_is_retryable() {
    let server = start_server().await;
    let client = ApiClient::new(&server.base, None);
    let details = client
        .create_poll(&poll_request("alice", "Flaky", &["a", "b"]))
        .await
        .unwrap();

    server.store.set_unavailable(true);
    let err = client.cast_vote(&vote(&details, "bob", 0)).await.unwrap_err();
    assert_eq!(err.status(), Some(503));
    assert!(err.is_retryable());
    assert!(matches!(err, ClientError::Api { .. }));

    server.store.set_unavailable(false);
    let ok = client.cast_vote(&vote(&details, "bob", 0)).await.unwrap();
    assert_eq!(ok.outcome, VoteOutcome::Inserted);

    server.stop().await;
}

/// Reads SSE frames until one carries a tally with `total` votes.
async fn next_tally_with_total(
    response: &mut reqwest::Response,
    buffer: &mut String,
    total: u64,
) -> LiveUpdate {
    loop {
        while let Some(end) = buffer.find("\n\n") {
            let frame: String = buffer.drain(..end + 2).collect();
            let data: String = frame
                .lines()
                .filter_map(|line| line.strip_prefix("data:"))
                .map(str::trim_start)
                .collect();
            if data.is_empty() {
                continue;
            }
            let update: LiveUpdate = serde_json::from_str(&data).unwrap();
            if update.tally.as_ref().map(|t| t.total_votes) == Some(total) {
                return update;
            }
        }

        let chunk = response.chunk().await.unwrap().expect("stream ended");
        buffer.push_str(&String::from_utf8_lossy(&chunk));
    }
}

#[tokio::test]
async fn live_endpoint_streams_new_votes() {
    let server = start_server().await;
    let client = ApiClient::new(&server.base, None);
    let details = client
        .create_poll(&poll_request("alice", "Live", &["x", "y"]))
        .await
        .unwrap();
    client.cast_vote(&vote(&details, "u1", 0)).await.unwrap();

    let mut response = reqwest::Client::new()
        .get(format!("{}/api/polls/{}/live?user_id=u2", server.base, details.poll.id))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());

    let mut buffer = String::new();
    let initial = tokio::time::timeout(
        Duration::from_secs(5),
        next_tally_with_total(&mut response, &mut buffer, 1),
    )
    .await
    .expect("initial tally");
    assert_eq!(initial.tally.unwrap().own_vote, None);

    client.cast_vote(&vote(&details, "u2", 1)).await.unwrap();

    let update = tokio::time::timeout(
        Duration::from_secs(5),
        next_tally_with_total(&mut response, &mut buffer, 2),
    )
    .await
    .expect("updated tally");
    assert_eq!(update.state, SubscriptionState::Active);
    let tally = update.tally.unwrap();
    assert_eq!(tally.own_vote, Some(details.options[1].id));
    let votes: Vec<u64> = tally.options.iter().map(|o| o.votes).collect();
    assert_eq!(votes, vec![1, 1]);

    drop(response);
    server.stop().await;
}
