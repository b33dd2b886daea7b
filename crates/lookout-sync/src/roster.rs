//! Online-roster comparison and the persistent association table.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use lookout_adapters::{AdapterError, RosterSource};
use lookout_core::{AssociationTable, Character, Maker, SIGNIFICANT_ASSOCIATION};
use lookout_storage::JsonStateFile;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Sessions that ended and began between two consecutive roster snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RosterDiff {
    pub logged_out: Vec<Character>,
    pub logged_in: Vec<Character>,
}

pub fn diff_rosters(before: &[Character], after: &[Character]) -> RosterDiff {
    let before_names: HashSet<&str> = before.iter().map(|c| c.name.as_str()).collect();
    let after_names: HashSet<&str> = after.iter().map(|c| c.name.as_str()).collect();

    RosterDiff {
        logged_out: before
            .iter()
            .filter(|c| !after_names.contains(c.name.as_str()))
            .cloned()
            .collect(),
        logged_in: after
            .iter()
            .filter(|c| !before_names.contains(c.name.as_str()))
            .cloned()
            .collect(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CompareReport {
    /// The first snapshot only primes the comparison.
    pub seeded: bool,
    pub logged_out: usize,
    pub logged_in: usize,
    /// `(tracked, candidate, count)` pairs that reached the significance threshold this pass.
    pub significant: Vec<(String, String, u32)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "makers", rename_all = "snake_case")]
pub enum AssociationCheck {
    UnknownCharacter,
    NoneSignificant,
    Found(Vec<Maker>),
}

impl fmt::Display for AssociationCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssociationCheck::UnknownCharacter => f.write_str("No character found"),
            AssociationCheck::NoneSignificant => f.write_str("No makers found"),
            AssociationCheck::Found(makers) => {
                let lines: Vec<_> = makers
                    .iter()
                    .map(|m| format!("{} | Accuracy:{}", m.name, m.count))
                    .collect();
                f.write_str(&lines.join("\n"))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub removed: usize,
    pub result: String,
}

#[derive(Debug, Default)]
struct TrackerState {
    previous: Option<Vec<Character>>,
    table: AssociationTable,
}

pub struct RosterTracker {
    source: Arc<dyn RosterSource>,
    file: JsonStateFile<AssociationTable>,
    state: Mutex<TrackerState>,
}

impl RosterTracker {
    /// Loads the association table at `path`, starting empty when it is missing or unreadable.
    pub async fn open(source: Arc<dyn RosterSource>, path: impl Into<PathBuf>) -> Self {
        let file: JsonStateFile<AssociationTable> = JsonStateFile::new(path);
        let table = file.load_or_default().await;
        debug!(tracked = table.len(), "association table loaded");
        Self {
            source,
            file,
            state: Mutex::new(TrackerState {
                previous: None,
                table,
            }),
        }
    }

    /// Fetches the roster and scores every (logged out, logged in) pair against the previous one.
    pub async fn compare(&self) -> Result<CompareReport, AdapterError> {
        let current = self.source.online().await?;
        let mut state = self.state.lock().await;

        let Some(previous) = state.previous.replace(current.clone()) else {
            info!(online = current.len(), "roster snapshot primed");
            return Ok(CompareReport {
                seeded: true,
                ..CompareReport::default()
            });
        };

        let diff = diff_rosters(&previous, &current);
        let mut report = CompareReport {
            seeded: false,
            logged_out: diff.logged_out.len(),
            logged_in: diff.logged_in.len(),
            significant: Vec::new(),
        };

        for gone in &diff.logged_out {
            for arrived in &diff.logged_in {
                let count = state.table.record(&gone.name, &arrived.name);
                if count >= SIGNIFICANT_ASSOCIATION {
                    info!(
                        tracked = %gone.name,
                        candidate = %arrived.name,
                        count,
                        "significant association"
                    );
                    report
                        .significant
                        .push((gone.name.clone(), arrived.name.clone(), count));
                }
            }
        }

        if let Err(err) = self.file.save(&state.table).await {
            warn!(error = %err, "association table not persisted");
        }
        debug!(
            logged_out = report.logged_out,
            logged_in = report.logged_in,
            "roster compared"
        );
        Ok(report)
    }

    pub async fn check(&self, name: &str) -> AssociationCheck {
        let state = self.state.lock().await;
        match state.table.strong_for(name, SIGNIFICANT_ASSOCIATION) {
            None => AssociationCheck::UnknownCharacter,
            Some(makers) if makers.is_empty() => AssociationCheck::NoneSignificant,
            Some(makers) => AssociationCheck::Found(makers),
        }
    }

    /// Drops every association with `count <= threshold`.
    pub async fn purge(&self, threshold: u32) -> PurgeReport {
        let mut state = self.state.lock().await;
        let removed = state.table.purge(threshold);
        if let Err(err) = self.file.save(&state.table).await {
            warn!(error = %err, "purged association table not persisted");
        }
        info!(threshold, removed, "association table purged");
        PurgeReport {
            removed,
            result: format!("Data cleared with {threshold} incidents as reference"),
        }
    }

    pub async fn table(&self) -> AssociationTable {
        self.state.lock().await.table.clone()
    }
}
