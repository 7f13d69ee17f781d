// src/listener.rs
//! PostgreSQL LISTEN/NOTIFY bridge into the [`ChangeFeed`].
//!
//! The triggers installed by [`crate::db::migrate`] publish a JSON payload per
//! changed row. This listener parses each payload into a [`ChangeEvent`] and
//! hands it to the feed. While the LISTEN connection is down the feed is
//! marked unavailable, which pushes live sessions onto their polling fallback.

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

use crate::db::CHANGE_CHANNEL;
use crate::feed::{ChangeEvent, ChangeFeed};

pub struct NotifyListener {
    pool: PgPool,
    feed: ChangeFeed,
    reconnect_delay: Duration,
}

impl NotifyListener {
    pub fn new(pool: PgPool, feed: ChangeFeed, reconnect_delay: Duration) -> Self {
        Self {
            pool,
            feed,
            reconnect_delay,
        }
    }

    /// Spawns the listen loop. It reconnects after `reconnect_delay` on
    /// every error and only stops when the task is aborted.
    #[instrument(skip(self), name = "notify_listener")]
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        info!("Starting change listener");

        tokio::spawn(async move {
            loop {
                if let Err(e) = self.listen_loop().await {
                    self.feed.set_available(false);
                    error!(
                        error = %e,
                        delay_ms = self.reconnect_delay.as_millis() as u64,
                        "Change listener error, reconnecting"
                    );
                    sleep(self.reconnect_delay).await;
                }
            }
        })
    }

    async fn listen_loop(&self) -> Result<(), sqlx::Error> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(CHANGE_CHANNEL).await?;

        info!(channel = CHANGE_CHANNEL, "Listening for poll changes");
        self.feed.set_available(true);

        loop {
            match listener.try_recv().await? {
                Some(notification) => {
                    if let Some(event) = parse_payload(notification.payload()) {
                        let delivered = self.feed.publish(event);
                        debug!(delivered, "Forwarded change notification");
                    }
                }
                None => {
                    // Notifications sent while disconnected are gone; bounce
                    // the feed so every session reloads its snapshot.
                    warn!("LISTEN connection lost, reconnecting");
                    self.feed.set_available(false);
                    sleep(self.reconnect_delay).await;
                    self.feed.set_available(true);
                }
            }
        }
    }
}

fn parse_payload(payload: &str) -> Option<ChangeEvent> {
    match serde_json::from_str::<ChangeEvent>(payload) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!(error = %e, payload = %payload, "Failed to parse change payload");
            None
        }
    }
}
