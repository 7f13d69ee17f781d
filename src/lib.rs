// src/lib.rs
//! Polls with live results.
//!
//! Users create polls, vote once per poll (changing their vote moves the same
//! row), and watch tallies update as votes come in. Votes live in Postgres;
//! row changes are pushed to subscribers through `LISTEN/NOTIFY` and merged
//! into per-poll tallies by [`tally::TallyReconciler`].
//!
//! Without `DATABASE_URL` the service runs on [`store::MemoryStore`], which
//! also backs the test suite.

pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod extract;
pub mod feed;
pub mod handlers;
pub mod listener;
pub mod live;
pub mod models;
pub mod polls;
pub mod routes;
pub mod server;
pub mod session;
pub mod state;
pub mod store;
pub mod tally;
pub mod voting;
