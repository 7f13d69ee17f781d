// src/state.rs
use std::sync::Arc;

use crate::config::Config;
use crate::feed::ChangeFeed;
use crate::store::DynStore;

#[derive(Clone)]
pub struct AppState {
    pub store: DynStore,
    pub feed: ChangeFeed,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(store: DynStore, feed: ChangeFeed, config: Config) -> Self {
        Self {
            store,
            feed,
            config: Arc::new(config),
        }
    }
}
