// src/live.rs
//! Live tally sessions.
//!
//! A [`LiveTally`] keeps a [`TallyReconciler`] for one poll up to date and
//! publishes every change through a `watch` channel. Its subscription goes
//! through `unsubscribed -> subscribing -> active -> (error | closed)`:
//!
//! - `subscribing`: both change feed keys (`votes`, `poll_options`) are
//!   acquired before the first snapshot, so no change can fall between them.
//! - `active`: events are patched into the tally; ambiguous events, lagging
//!   receivers and snapshot failures lead to a resync.
//! - `error`: the feed is down. The session re-reads the snapshot every
//!   poll interval and tries to subscribe again once the feed is back.
//! - `closed`: the session was unmounted. Subscriptions are dropped with
//!   the session task, whichever way it ends.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast::error::RecvError, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::feed::{ChangeEvent, ChangeFeed, FeedError, Subscription, SubscriptionKey, Table};
use crate::store::DynStore;
use crate::tally::{ApplyOutcome, TallyReconciler, TallyView};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionState {
    Unsubscribed,
    Subscribing,
    Active,
    Error,
    Closed,
}

/// What a live session currently shows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveUpdate {
    pub state: SubscriptionState,
    /// `None` until the first snapshot has been loaded.
    pub tally: Option<TallyView>,
    /// Last store failure, cleared by the next successful snapshot.
    pub error: Option<String>,
}

pub struct LiveTally {
    poll_id: Uuid,
    updates: watch::Receiver<LiveUpdate>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl LiveTally {
    /// Starts a session for `poll_id`. `user_id` selects whose own vote is
    /// reported.
    pub fn mount(
        store: DynStore,
        feed: ChangeFeed,
        poll_id: Uuid,
        user_id: Option<String>,
        poll_interval: Duration,
    ) -> Self {
        let (updates_tx, updates) = watch::channel(LiveUpdate {
            state: SubscriptionState::Unsubscribed,
            tally: None,
            error: None,
        });
        let (shutdown, shutdown_rx) = oneshot::channel();

        let mut session = Session {
            store,
            feed,
            tally: TallyReconciler::new(poll_id, user_id),
            state: SubscriptionState::Unsubscribed,
            error: None,
            poll_interval,
            updates: updates_tx,
        };

        let task = tokio::spawn(async move {
            tokio::select! {
                _ = session.run() => {}
                // Fires on explicit unmount and when the handle is dropped.
                _ = shutdown_rx => {}
            }
            session.set_state(SubscriptionState::Closed);
            debug!(%poll_id, "Live tally closed");
        });

        info!(%poll_id, "Live tally mounted");
        Self {
            poll_id,
            updates,
            shutdown: Some(shutdown),
            task: Some(task),
        }
    }

    pub fn poll_id(&self) -> Uuid {
        self.poll_id
    }

    pub fn updates(&self) -> watch::Receiver<LiveUpdate> {
        self.updates.clone()
    }

    pub fn current(&self) -> LiveUpdate {
        self.updates.borrow().clone()
    }

    /// Stops the session and waits until its subscriptions are released.
    pub async fn unmount(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        info!(poll_id = %self.poll_id, "Live tally unmounted");
    }
}

struct Session {
    store: DynStore,
    feed: ChangeFeed,
    tally: TallyReconciler,
    state: SubscriptionState,
    error: Option<String>,
    poll_interval: Duration,
    updates: watch::Sender<LiveUpdate>,
}

impl Session {
    async fn run(&mut self) {
        loop {
            self.set_state(SubscriptionState::Subscribing);
            match self.subscribe() {
                Ok((votes, options)) => {
                    self.set_state(SubscriptionState::Active);
                    self.stream(votes, options).await;
                    warn!(poll_id = %self.tally.poll_id(), "Change feed closed, polling");
                }
                Err(e) => {
                    warn!(poll_id = %self.tally.poll_id(), error = %e, "Subscribe failed, polling");
                }
            }
            self.set_state(SubscriptionState::Error);
            self.poll_until_feed_returns().await;
        }
    }

    fn subscribe(&self) -> Result<(Subscription, Subscription), FeedError> {
        let poll_id = self.tally.poll_id();
        let votes = self.feed.subscribe(SubscriptionKey::new(poll_id, Table::Votes))?;
        // `votes` is released by its guard if this one fails.
        let options = self
            .feed
            .subscribe(SubscriptionKey::new(poll_id, Table::PollOptions))?;
        Ok((votes, options))
    }

    /// Runs until the feed closes.
    async fn stream(&mut self, mut votes: Subscription, mut options: Subscription) {
        let mut retry_at = if self.resync().await {
            None
        } else {
            Some(Instant::now() + self.poll_interval)
        };

        loop {
            let received = tokio::select! {
                received = votes.recv() => received,
                received = options.recv() => received,
                _ = wait_until(retry_at) => {
                    retry_at = (!self.resync().await).then(|| Instant::now() + self.poll_interval);
                    continue;
                }
            };

            let needs_resync = match received {
                Ok(event) => self.apply(&event),
                Err(RecvError::Lagged(missed)) => {
                    warn!(poll_id = %self.tally.poll_id(), missed, "Change feed lagged");
                    true
                }
                Err(RecvError::Closed) => return,
            };

            if needs_resync && retry_at.is_none() && !self.resync().await {
                retry_at = Some(Instant::now() + self.poll_interval);
            }
        }
    }

    /// Returns whether a resync is needed.
    fn apply(&mut self, event: &ChangeEvent) -> bool {
        match self.tally.apply_change(event) {
            ApplyOutcome::Applied => {
                self.publish();
                false
            }
            ApplyOutcome::Ignored => false,
            ApplyOutcome::ResyncRequired => {
                debug!(poll_id = %self.tally.poll_id(), kind = ?event.kind, table = %event.table, "Ambiguous change, resyncing");
                true
            }
        }
    }

    async fn poll_until_feed_returns(&mut self) {
        loop {
            self.resync().await;
            sleep(self.poll_interval).await;
            if self.feed.is_available() {
                return;
            }
        }
    }

    /// Loads a snapshot and installs it. Returns `false` if the store failed.
    async fn resync(&mut self) -> bool {
        let poll_id = self.tally.poll_id();
        let ticket = self.tally.begin_snapshot();
        match self.store.snapshot(poll_id).await {
            Ok(snapshot) => {
                self.tally.install_snapshot(ticket, snapshot);
                self.error = None;
                self.publish();
                true
            }
            Err(e) => {
                self.tally.abandon_snapshot(ticket);
                warn!(%poll_id, error = %e, retryable = e.is_retryable(), "Snapshot failed");
                self.error = Some(e.to_string());
                self.publish();
                false
            }
        }
    }

    fn set_state(&mut self, state: SubscriptionState) {
        if self.state != state {
            debug!(poll_id = %self.tally.poll_id(), from = ?self.state, to = ?state, "Subscription state");
            self.state = state;
            self.publish();
        }
    }

    fn publish(&self) {
        let next = LiveUpdate {
            state: self.state,
            tally: self.tally.is_loaded().then(|| self.tally.view()),
            error: self.error.clone(),
        };
        self.updates.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::models::{CreatePollRequest, PollDetails};
    use crate::polls::create_poll;
    use crate::store::MemoryStore;
    use crate::voting::cast_vote;

    const INTERVAL: Duration = Duration::from_millis(20);

    async fn setup() -> (Arc<MemoryStore>, ChangeFeed, PollDetails) {
        let feed = ChangeFeed::new();
        let store = Arc::new(MemoryStore::with_feed(feed.clone()));
        let details = create_poll(
            store.as_ref(),
            CreatePollRequest {
                title: "Tabs or spaces".to_string(),
                options: vec!["tabs".to_string(), "spaces".to_string()],
                user_id: "owner".to_string(),
            },
        )
        .await
        .unwrap();
        (store, feed, details)
    }

    async fn wait_for(
        rx: &mut watch::Receiver<LiveUpdate>,
        mut pred: impl FnMut(&LiveUpdate) -> bool,
    ) -> LiveUpdate {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let current = rx.borrow_and_update().clone();
                if pred(&current) {
                    return current;
                }
                rx.changed().await.expect("session dropped");
            }
        })
        .await
        .expect("timed out waiting for live update")
    }

    fn votes_for(update: &LiveUpdate, index: usize) -> u64 {
        update.tally.as_ref().map_or(0, |t| t.options[index].votes)
    }

    #[tokio::test]
    async fn follows_votes_and_revotes() {
        let (store, feed, details) = setup().await;
        let poll_id = details.poll.id;
        let (tabs, spaces) = (details.options[0].id, details.options[1].id);

        let live = LiveTally::mount(store.clone(), feed, poll_id, Some("u1".into()), INTERVAL);
        let mut rx = live.updates();
        wait_for(&mut rx, |u| u.state == SubscriptionState::Active && u.tally.is_some()).await;

        cast_vote(store.as_ref(), poll_id, "u1", tabs).await.unwrap();
        cast_vote(store.as_ref(), poll_id, "u2", tabs).await.unwrap();
        let update = wait_for(&mut rx, |u| votes_for(u, 0) == 2).await;
        assert_eq!(update.tally.unwrap().own_vote, Some(tabs));

        cast_vote(store.as_ref(), poll_id, "u1", spaces).await.unwrap();
        let update = wait_for(&mut rx, |u| votes_for(u, 1) == 1).await;
        let tally = update.tally.unwrap();
        assert_eq!(tally.options[0].votes, 1);
        assert_eq!(tally.total_votes, 2);
        assert_eq!(tally.own_vote, Some(spaces));

        live.unmount().await;
    }

    #[tokio::test]
    async fn falls_back_to_polling_while_feed_is_down() {
        let (store, feed, details) = setup().await;
        let poll_id = details.poll.id;

        let live = LiveTally::mount(store.clone(), feed.clone(), poll_id, None, INTERVAL);
        let mut rx = live.updates();
        wait_for(&mut rx, |u| u.state == SubscriptionState::Active && u.tally.is_some()).await;

        feed.set_available(false);
        wait_for(&mut rx, |u| u.state == SubscriptionState::Error).await;

        // No events are delivered now; the vote shows up through polling.
        cast_vote(store.as_ref(), poll_id, "u1", details.options[1].id)
            .await
            .unwrap();
        let update = wait_for(&mut rx, |u| votes_for(u, 1) == 1).await;
        assert_eq!(update.state, SubscriptionState::Error);

        feed.set_available(true);
        wait_for(&mut rx, |u| u.state == SubscriptionState::Active).await;
        cast_vote(store.as_ref(), poll_id, "u2", details.options[1].id)
            .await
            .unwrap();
        wait_for(&mut rx, |u| votes_for(u, 1) == 2).await;

        live.unmount().await;
    }

    #[tokio::test]
    async fn unmount_releases_subscriptions() {
        let (store, feed, details) = setup().await;

        let live = LiveTally::mount(store, feed.clone(), details.poll.id, None, INTERVAL);
        let mut rx = live.updates();
        wait_for(&mut rx, |u| u.state == SubscriptionState::Active).await;
        assert_eq!(feed.open_channels(), 2);

        live.unmount().await;
        assert_eq!(feed.open_channels(), 0);
        assert_eq!(rx.borrow().state, SubscriptionState::Closed);
    }

    #[tokio::test]
    async fn dropping_the_handle_closes_the_session() {
        let (store, feed, details) = setup().await;

        let live = LiveTally::mount(store, feed.clone(), details.poll.id, None, INTERVAL);
        let mut rx = live.updates();
        wait_for(&mut rx, |u| u.state == SubscriptionState::Active).await;

        drop(live);
        wait_for(&mut rx, |u| u.state == SubscriptionState::Closed).await;
        assert_eq!(feed.open_channels(), 0);
    }

    #[tokio::test]
    async fn failed_second_subscribe_releases_the_first() {
        let (store, _, details) = setup().await;
        // Room for the votes channel only.
        let feed = ChangeFeed::with_max_channels(1);

        let live = LiveTally::mount(
            store,
            feed.clone(),
            details.poll.id,
            None,
            Duration::from_secs(3600),
        );
        let mut rx = live.updates();
        let update = wait_for(&mut rx, |u| u.tally.is_some()).await;
        assert_eq!(update.state, SubscriptionState::Error);
        assert_eq!(feed.open_channels(), 0);

        live.unmount().await;
        assert_eq!(feed.open_channels(), 0);
    }

    #[tokio::test]
    async fn store_outage_is_reported_and_recovers() {
        let (store, feed, details) = setup().await;
        store.set_unavailable(true);

        let live = LiveTally::mount(store.clone(), feed, details.poll.id, None, INTERVAL);
        let mut rx = live.updates();
        let update = wait_for(&mut rx, |u| u.error.is_some()).await;
        assert!(update.tally.is_none());

        store.set_unavailable(false);
        let update = wait_for(&mut rx, |u| u.tally.is_some()).await;
        assert!(update.error.is_none());
        assert_eq!(update.state, SubscriptionState::Active);

        live.unmount().await;
    }
}
