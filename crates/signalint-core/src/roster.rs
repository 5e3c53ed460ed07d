//! Device roster aggregation.
//!
//! The roster is a derived view: one row per distinct identifier in a radio's
//! observation log, showing its most recent sighting with the operator's alias
//! applied and an optional search filter.
//!
//! [`derive_roster`] is the pure derivation. [`RosterAggregator`] keeps it up
//! to date in a single background task: log and alias writes recompute
//! immediately, search text changes are debounced.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};
use utoipa::ToSchema;

use crate::distance::PathLossModel;
use crate::store::{AliasStore, ObservationStore, StoreResult};
use crate::types::{RadioKind, ScanObservation};

/// Default delay before a search text change is applied.
pub const DEFAULT_SEARCH_DEBOUNCE: Duration = Duration::from_millis(300);

/// Attempts at reading a consistent log/alias snapshot before giving up.
const MAX_SNAPSHOT_ATTEMPTS: usize = 5;

/// One row of the roster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct RosterEntry {
    /// Hardware address.
    #[schema(example = "AA:BB:CC:DD:EE:FF")]
    pub identifier: String,

    /// Alias if one exists, otherwise the broadcast label or a placeholder.
    #[schema(example = "Hallway printer")]
    pub display_name: String,

    /// Label from the most recent sighting (may be empty).
    pub original_label: String,

    /// Signal strength of the most recent sighting.
    #[schema(example = -67)]
    pub rssi_dbm: i16,

    /// Estimated distance in metres (BLE only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_distance_m: Option<f64>,

    /// Channel frequency (WiFi only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_mhz: Option<u32>,

    /// Time of the most recent sighting.
    pub observed_at: DateTime<Utc>,

    /// Whether `display_name` comes from an alias.
    pub is_aliased: bool,
}

/// Health of the roster's upstream stores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RosterHealth {
    /// The roster reflects the stores.
    Healthy,
    /// A store read failed; the roster shows its last good value.
    Stale {
        /// Error from the failing store.
        reason: String,
    },
}

/// Derive the roster from a log snapshot.
///
/// `observations` is expected newest first, as [`ObservationStore::query_all`]
/// returns it. When several rows of one identifier share the newest
/// timestamp, the one that comes first in `observations` wins, which for store
/// output is the earliest appended.
///
/// A blank `query` keeps every entry; otherwise entries whose display name or
/// identifier contain it (case-insensitively) are kept.
#[must_use]
pub fn derive_roster(
    kind: RadioKind,
    observations: &[ScanObservation],
    aliases: &HashMap<String, String>,
    query: &str,
    model: &PathLossModel,
) -> Vec<RosterEntry> {
    let mut latest: HashMap<&str, &ScanObservation> = HashMap::new();
    for observation in observations {
        latest
            .entry(observation.identifier.as_str())
            .and_modify(|current| {
                if observation.observed_at > current.observed_at {
                    *current = observation;
                }
            })
            .or_insert(observation);
    }

    let mut rows: Vec<&ScanObservation> = latest.into_values().collect();
    rows.sort_by(|a, b| {
        b.observed_at
            .cmp(&a.observed_at)
            .then_with(|| a.identifier.cmp(&b.identifier))
    });

    let needle = (!query.trim().is_empty()).then(|| query.to_lowercase());

    rows.into_iter()
        .map(|observation| {
            let alias = aliases.get(&observation.identifier);
            let display_name = match alias {
                Some(label) => label.clone(),
                None if observation.label.is_empty() => kind.unknown_label().to_string(),
                None => observation.label.clone(),
            };
            RosterEntry {
                identifier: observation.identifier.clone(),
                display_name,
                original_label: observation.label.clone(),
                rssi_dbm: observation.rssi_dbm,
                estimated_distance_m: observation.estimated_distance(model),
                frequency_mhz: observation.frequency_mhz(),
                observed_at: observation.observed_at,
                is_aliased: alias.is_some(),
            }
        })
        .filter(|entry| {
            needle.as_ref().map_or(true, |needle| {
                entry.display_name.to_lowercase().contains(needle)
                    || entry.identifier.to_lowercase().contains(needle)
            })
        })
        .collect()
}

/// Options for a [`RosterAggregator`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RosterOptions {
    /// Delay applied to search text changes.
    pub debounce: Duration,
    /// Distance model used for BLE rows.
    pub model: PathLossModel,
}

impl Default for RosterOptions {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_SEARCH_DEBOUNCE,
            model: PathLossModel::default(),
        }
    }
}

/// Reactive roster for one radio kind.
///
/// Dropping the aggregator stops its background task.
pub struct RosterAggregator {
    kind: RadioKind,
    query: watch::Sender<String>,
    roster: watch::Receiver<Vec<RosterEntry>>,
    health: watch::Receiver<RosterHealth>,
    _cancel_on_drop: DropGuard,
}

impl RosterAggregator {
    /// Start aggregating `log` and `aliases`.
    ///
    /// The initial roster (with an empty query) is available as soon as this
    /// returns. Must be called within a Tokio runtime.
    pub fn spawn(
        kind: RadioKind,
        log: Arc<dyn ObservationStore>,
        aliases: Arc<dyn AliasStore>,
        options: RosterOptions,
    ) -> Self {
        let (query_tx, query_rx) = watch::channel(String::new());

        let (initial, health) = match read_snapshot(log.as_ref(), aliases.as_ref()) {
            Ok((rows, table)) => (
                derive_roster(kind, &rows, &table, "", &options.model),
                RosterHealth::Healthy,
            ),
            Err(e) => {
                warn!(%kind, error = %e, "Initial roster read failed");
                (Vec::new(), RosterHealth::Stale { reason: e.to_string() })
            }
        };
        let (roster_tx, roster_rx) = watch::channel(initial);
        let (health_tx, health_rx) = watch::channel(health);

        let cancel = CancellationToken::new();
        let task = AggregatorTask {
            kind,
            log,
            aliases,
            options,
            roster: roster_tx,
            health: health_tx,
        };
        tokio::spawn(task.run(query_rx, cancel.clone()));
        info!(%kind, debounce_ms = options.debounce.as_millis(), "Roster aggregator started");

        Self {
            kind,
            query: query_tx,
            roster: roster_rx,
            health: health_rx,
            _cancel_on_drop: cancel.drop_guard(),
        }
    }

    /// Radio this roster covers.
    #[must_use]
    pub const fn kind(&self) -> RadioKind {
        self.kind
    }

    /// Replace the search text. Applied after the debounce delay.
    pub fn set_query(&self, query: impl Into<String>) {
        let query = query.into();
        self.query.send_if_modified(|current| {
            if *current == query {
                false
            } else {
                *current = query;
                true
            }
        });
    }

    /// Search text most recently set (possibly not applied yet).
    #[must_use]
    pub fn query(&self) -> String {
        self.query.borrow().clone()
    }

    /// Current roster.
    #[must_use]
    pub fn current(&self) -> Vec<RosterEntry> {
        self.roster.borrow().clone()
    }

    /// Subscribe to roster changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Vec<RosterEntry>> {
        self.roster.clone()
    }

    /// Current store health.
    #[must_use]
    pub fn health(&self) -> RosterHealth {
        self.health.borrow().clone()
    }

    /// Subscribe to store health changes.
    #[must_use]
    pub fn subscribe_health(&self) -> watch::Receiver<RosterHealth> {
        self.health.clone()
    }
}

impl std::fmt::Debug for RosterAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RosterAggregator")
            .field("kind", &self.kind)
            .field("query", &*self.query.borrow())
            .field("entries", &self.roster.borrow().len())
            .finish_non_exhaustive()
    }
}

struct AggregatorTask {
    kind: RadioKind,
    log: Arc<dyn ObservationStore>,
    aliases: Arc<dyn AliasStore>,
    options: RosterOptions,
    roster: watch::Sender<Vec<RosterEntry>>,
    health: watch::Sender<RosterHealth>,
}

impl AggregatorTask {
    async fn run(self, mut query_rx: watch::Receiver<String>, cancel: CancellationToken) {
        let mut log_rev = self.log.revision();
        let mut alias_rev = self.aliases.revision();
        let mut log_open = true;
        let mut alias_open = true;

        let mut settled = String::new();
        let mut pending: Option<String> = None;
        let debounce = tokio::time::sleep(self.options.debounce);
        tokio::pin!(debounce);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                changed = log_rev.changed(), if log_open => {
                    if changed.is_err() {
                        log_open = false;
                        continue;
                    }
                    self.recompute(&settled);
                }
                changed = alias_rev.changed(), if alias_open => {
                    if changed.is_err() {
                        alias_open = false;
                        continue;
                    }
                    self.recompute(&settled);
                }
                changed = query_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    pending = Some(query_rx.borrow_and_update().clone());
                    debounce.as_mut().reset(Instant::now() + self.options.debounce);
                }
                () = &mut debounce, if pending.is_some() => {
                    if let Some(query) = pending.take() {
                        debug!(kind = %self.kind, query = %query, "Applying search query");
                        settled = query;
                        self.recompute(&settled);
                    }
                }
            }
        }
        debug!(kind = %self.kind, "Roster aggregator stopped");
    }

    fn recompute(&self, query: &str) {
        match read_snapshot(self.log.as_ref(), self.aliases.as_ref()) {
            Ok((rows, aliases)) => {
                let next = derive_roster(self.kind, &rows, &aliases, query, &self.options.model);
                self.roster.send_if_modified(|current| {
                    if *current == next {
                        false
                    } else {
                        *current = next;
                        true
                    }
                });
                self.health.send_if_modified(|health| {
                    if *health == RosterHealth::Healthy {
                        false
                    } else {
                        info!(kind = %self.kind, "Roster stores recovered");
                        *health = RosterHealth::Healthy;
                        true
                    }
                });
            }
            Err(e) => {
                warn!(kind = %self.kind, error = %e, "Roster store read failed, keeping last roster");
                self.health
                    .send_replace(RosterHealth::Stale { reason: e.to_string() });
            }
        }
    }
}

pub(crate) type Snapshot = (Vec<ScanObservation>, HashMap<String, String>);

/// Read log and aliases such that neither changed while the other was read.
pub(crate) fn read_snapshot(
    log: &dyn ObservationStore,
    aliases: &dyn AliasStore,
) -> StoreResult<Snapshot> {
    let revisions = || (*log.revision().borrow(), *aliases.revision().borrow());

    let mut attempt = 0;
    loop {
        attempt += 1;
        let before = revisions();
        let rows = log.query_all()?;
        let table: HashMap<String, String> = aliases
            .query_all()?
            .into_iter()
            .map(|alias| (alias.identifier, alias.label))
            .collect();
        if revisions() == before || attempt >= MAX_SNAPSHOT_ATTEMPTS {
            if attempt >= MAX_SNAPSHOT_ATTEMPTS {
                // The revision bump queues another recompute.
                debug!(attempt, "Stores kept changing while reading roster snapshot");
            }
            return Ok((rows, table));
        }
    }
}
