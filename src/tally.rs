// src/tally.rs
//! Per-poll vote tallies kept consistent with the store.
//!
//! A [`TallyReconciler`] starts from a snapshot (all options and vote rows of
//! one poll) and is then patched by change events. Tallies are never stored as
//! counters: they are derived from the set of known vote rows, keyed by vote
//! id, so applying an event twice, applying an update before its insert, or
//! deleting an unknown vote cannot skew a count or make it negative.
//!
//! When an event cannot be applied unambiguously the reconciler answers
//! [`ApplyOutcome::ResyncRequired`] and the caller reloads a snapshot.
//!
//! Snapshot fetches may overlap with incoming events. Each fetch is bracketed
//! by [`TallyReconciler::begin_snapshot`] and
//! [`TallyReconciler::install_snapshot`]: events seen while the fetch was in
//! flight are replayed on top of the snapshot, and a snapshot that started
//! before the one currently installed is discarded.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::feed::{ChangeEvent, ChangeKind, Table};
use crate::models::{PollOption, PollSnapshot, Vote};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The tally changed.
    Applied,
    /// Nothing visible changed (duplicate, unknown delete, other poll).
    Ignored,
    /// The event was ambiguous; reload a snapshot.
    ResyncRequired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SnapshotTicket(u64);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionTally {
    pub id: Uuid,
    pub option_text: String,
    pub votes: u64,
    /// Share of the total, rounded to one decimal.
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TallyView {
    pub poll_id: Uuid,
    pub options: Vec<OptionTally>,
    pub total_votes: u64,
    /// Option the requesting user currently votes for.
    pub own_vote: Option<Uuid>,
}

#[derive(Debug, Clone)]
struct OptionEntry {
    id: Uuid,
    option_text: String,
    created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct VoteEntry {
    option_id: Uuid,
    user_id: String,
}

/// Partial image of a `votes` row. Old rows may carry only the id.
#[derive(Debug, Deserialize)]
struct VoteImage {
    id: Uuid,
    #[serde(default)]
    option_id: Option<Uuid>,
    #[serde(default)]
    user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OptionImage {
    id: Uuid,
    #[serde(default)]
    option_text: Option<String>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
}

pub struct TallyReconciler {
    poll_id: Uuid,
    user_id: Option<String>,
    options: Vec<OptionEntry>,
    votes: HashMap<Uuid, VoteEntry>,
    by_user: HashMap<String, Uuid>,
    loaded: bool,

    next_ticket: u64,
    installed: Option<SnapshotTicket>,
    /// Outstanding tickets and the event sequence number they started at.
    in_flight: BTreeMap<SnapshotTicket, u64>,
    event_log: Vec<(u64, ChangeEvent)>,
    next_seq: u64,
}

impl TallyReconciler {
    pub fn new(poll_id: Uuid, user_id: Option<String>) -> Self {
        Self {
            poll_id,
            user_id,
            options: Vec::new(),
            votes: HashMap::new(),
            by_user: HashMap::new(),
            loaded: false,
            next_ticket: 0,
            installed: None,
            in_flight: BTreeMap::new(),
            event_log: Vec::new(),
            next_seq: 0,
        }
    }

    pub fn poll_id(&self) -> Uuid {
        self.poll_id
    }

    /// Whether a snapshot has been installed.
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Marks the start of a snapshot fetch. Events applied from now on are
    /// kept until the matching [`install_snapshot`](Self::install_snapshot).
    pub fn begin_snapshot(&mut self) -> SnapshotTicket {
        let ticket = SnapshotTicket(self.next_ticket);
        self.next_ticket += 1;
        self.in_flight.insert(ticket, self.next_seq);
        ticket
    }

    /// Forgets a fetch that failed.
    pub fn abandon_snapshot(&mut self, ticket: SnapshotTicket) {
        self.in_flight.remove(&ticket);
        self.prune_log();
    }

    /// Replaces the tally with `snapshot` and replays the events seen since
    /// `ticket` was issued. Returns `false` if a newer snapshot is already
    /// installed, in which case `snapshot` is dropped.
    pub fn install_snapshot(&mut self, ticket: SnapshotTicket, snapshot: PollSnapshot) -> bool {
        let Some(start_seq) = self.in_flight.remove(&ticket) else {
            debug!(poll_id = %self.poll_id, ?ticket, "Ignoring snapshot with unknown ticket");
            return false;
        };
        if self.installed.is_some_and(|installed| installed > ticket) {
            debug!(poll_id = %self.poll_id, ?ticket, "Discarding stale snapshot");
            self.prune_log();
            return false;
        }

        self.reset_from(snapshot);

        let replay: Vec<ChangeEvent> = self
            .event_log
            .iter()
            .filter(|(seq, _)| *seq >= start_seq)
            .map(|(_, event)| event.clone())
            .collect();
        for event in &replay {
            // Outcomes are irrelevant here: the state is already as fresh as
            // a follow-up snapshot would make it.
            self.patch(event);
        }

        self.installed = Some(ticket);
        self.in_flight.retain(|pending, _| *pending > ticket);
        self.prune_log();

        debug!(
            poll_id = %self.poll_id,
            options = self.options.len(),
            votes = self.votes.len(),
            replayed = replay.len(),
            "Installed snapshot"
        );
        true
    }

    /// Applies one change event without refetching.
    pub fn apply_change(&mut self, event: &ChangeEvent) -> ApplyOutcome {
        if event.poll_id != self.poll_id {
            return ApplyOutcome::Ignored;
        }

        if !self.in_flight.is_empty() {
            self.event_log.push((self.next_seq, event.clone()));
        }
        self.next_seq += 1;

        if !self.loaded {
            // Kept in the log for the snapshot that is about to arrive.
            return if self.in_flight.is_empty() {
                ApplyOutcome::ResyncRequired
            } else {
                ApplyOutcome::Ignored
            };
        }

        self.patch(event)
    }

    /// Per-option counts, including options with no votes.
    pub fn counts(&self) -> HashMap<Uuid, u64> {
        let mut counts: HashMap<Uuid, u64> = self.options.iter().map(|o| (o.id, 0)).collect();
        for vote in self.votes.values() {
            if let Some(count) = counts.get_mut(&vote.option_id) {
                *count += 1;
            }
        }
        counts
    }

    pub fn own_vote(&self) -> Option<Uuid> {
        let user_id = self.user_id.as_deref()?;
        let vote_id = self.by_user.get(user_id)?;
        self.votes.get(vote_id).map(|vote| vote.option_id)
    }

    pub fn view(&self) -> TallyView {
        let counts = self.counts();
        let total_votes: u64 = counts.values().sum();

        let options = self
            .options
            .iter()
            .map(|option| {
                let votes = counts.get(&option.id).copied().unwrap_or(0);
                let percentage = if total_votes == 0 {
                    0.0
                } else {
                    (votes as f64 * 1000.0 / total_votes as f64).round() / 10.0
                };
                OptionTally {
                    id: option.id,
                    option_text: option.option_text.clone(),
                    votes,
                    percentage,
                }
            })
            .collect();

        TallyView {
            poll_id: self.poll_id,
            options,
            total_votes,
            own_vote: self.own_vote(),
        }
    }

    fn reset_from(&mut self, snapshot: PollSnapshot) {
        self.options = snapshot
            .options
            .into_iter()
            .filter(|option| option.poll_id == self.poll_id)
            .map(OptionEntry::from)
            .collect();
        self.votes.clear();
        self.by_user.clear();

        let mut votes: Vec<Vote> = snapshot
            .votes
            .into_iter()
            .filter(|vote| vote.poll_id == self.poll_id)
            .collect();
        // Latest row wins if the store ever hands out two rows for one user.
        votes.sort_by_key(|vote| vote.created_at);
        for vote in votes {
            if let Some(previous) = self.by_user.insert(vote.user_id.clone(), vote.id) {
                warn!(
                    poll_id = %self.poll_id,
                    user_id = %vote.user_id,
                    dropped_vote = %previous,
                    "Snapshot contains more than one vote for a user"
                );
                self.votes.remove(&previous);
            }
            self.votes.insert(
                vote.id,
                VoteEntry {
                    option_id: vote.option_id,
                    user_id: vote.user_id,
                },
            );
        }

        self.loaded = true;
    }

    fn patch(&mut self, event: &ChangeEvent) -> ApplyOutcome {
        match event.table {
            Table::Votes => self.patch_vote(event),
            Table::PollOptions => self.patch_option(event),
        }
    }

    fn patch_vote(&mut self, event: &ChangeEvent) -> ApplyOutcome {
        match event.kind {
            ChangeKind::Insert | ChangeKind::Update => {
                let Some(new) = parse_row::<VoteImage>(event.new_row.as_ref()) else {
                    return ApplyOutcome::ResyncRequired;
                };
                // A row is inserted once; a repeated or late insert carries
                // nothing newer than what we hold.
                if event.kind == ChangeKind::Insert && self.votes.contains_key(&new.id) {
                    return ApplyOutcome::Ignored;
                }
                let known_user = self.votes.get(&new.id).map(|vote| vote.user_id.clone());
                let Some(user_id) = new.user_id.or(known_user) else {
                    return ApplyOutcome::ResyncRequired;
                };
                let Some(option_id) = new.option_id else {
                    return ApplyOutcome::ResyncRequired;
                };
                self.upsert_vote(new.id, option_id, user_id)
            }
            ChangeKind::Delete => {
                let Some(old) = parse_row::<VoteImage>(event.old_row.as_ref()) else {
                    return ApplyOutcome::ResyncRequired;
                };
                match self.votes.remove(&old.id) {
                    Some(removed) => {
                        if self.by_user.get(&removed.user_id) == Some(&old.id) {
                            self.by_user.remove(&removed.user_id);
                        }
                        ApplyOutcome::Applied
                    }
                    None => ApplyOutcome::Ignored,
                }
            }
        }
    }

    fn upsert_vote(&mut self, vote_id: Uuid, option_id: Uuid, user_id: String) -> ApplyOutcome {
        if let Some(existing) = self.by_user.get(&user_id) {
            if *existing != vote_id {
                // A second row for the same user: our view is out of date.
                return ApplyOutcome::ResyncRequired;
            }
        }

        let unknown_option = !self.options.iter().any(|o| o.id == option_id);

        let changed = match self.votes.get_mut(&vote_id) {
            Some(vote) if vote.option_id == option_id && vote.user_id == user_id => false,
            Some(vote) => {
                if vote.user_id != user_id {
                    self.by_user.remove(&vote.user_id);
                }
                vote.option_id = option_id;
                vote.user_id = user_id.clone();
                true
            }
            None => {
                self.votes.insert(
                    vote_id,
                    VoteEntry {
                        option_id,
                        user_id: user_id.clone(),
                    },
                );
                true
            }
        };
        self.by_user.insert(user_id, vote_id);

        if unknown_option {
            ApplyOutcome::ResyncRequired
        } else if changed {
            ApplyOutcome::Applied
        } else {
            ApplyOutcome::Ignored
        }
    }

    fn patch_option(&mut self, event: &ChangeEvent) -> ApplyOutcome {
        match event.kind {
            ChangeKind::Insert | ChangeKind::Update => {
                let Some(new) = parse_row::<OptionImage>(event.new_row.as_ref()) else {
                    return ApplyOutcome::ResyncRequired;
                };
                if let Some(option) = self.options.iter_mut().find(|o| o.id == new.id) {
                    return match new.option_text {
                        Some(text) if text != option.option_text => {
                            option.option_text = text;
                            ApplyOutcome::Applied
                        }
                        // Cached counter updates land here.
                        _ => ApplyOutcome::Ignored,
                    };
                }

                let Some(option_text) = new.option_text else {
                    return ApplyOutcome::ResyncRequired;
                };
                self.options.push(OptionEntry {
                    id: new.id,
                    option_text,
                    created_at: new.created_at,
                });
                self.options
                    .sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
                ApplyOutcome::Applied
            }
            ChangeKind::Delete => {
                let Some(old) = parse_row::<OptionImage>(event.old_row.as_ref()) else {
                    return ApplyOutcome::ResyncRequired;
                };
                let before = self.options.len();
                self.options.retain(|o| o.id != old.id);
                if self.options.len() == before {
                    return ApplyOutcome::Ignored;
                }
                let orphaned: Vec<Uuid> = self
                    .votes
                    .iter()
                    .filter(|(_, vote)| vote.option_id == old.id)
                    .map(|(id, _)| *id)
                    .collect();
                for vote_id in orphaned {
                    if let Some(vote) = self.votes.remove(&vote_id) {
                        self.by_user.remove(&vote.user_id);
                    }
                }
                ApplyOutcome::Applied
            }
        }
    }

    fn prune_log(&mut self) {
        match self.in_flight.values().min().copied() {
            Some(oldest) => self.event_log.retain(|(seq, _)| *seq >= oldest),
            None => self.event_log.clear(),
        }
    }
}

impl From<PollOption> for OptionEntry {
    fn from(option: PollOption) -> Self {
        Self {
            id: option.id,
            option_text: option.option_text,
            created_at: Some(option.created_at),
        }
    }
}

fn parse_row<T: serde::de::DeserializeOwned>(row: Option<&Value>) -> Option<T> {
    let row = row?;
    match serde_json::from_value(row.clone()) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            warn!(error = %e, "Change event row has an unexpected shape");
            None
        }
    }
}
