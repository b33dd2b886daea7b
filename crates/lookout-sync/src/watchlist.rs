//! Hunted and team watchlists: operator verbs and the periodic board broadcast.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Local;
use lookout_adapters::{AdapterError, RosterSource};
use lookout_core::{Character, WatchEntries, WatchEntry};
use lookout_storage::JsonStateFile;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::delivery::{DeliveryError, DeliverySink};

/// Chat message size limit.
pub const MAX_MESSAGE_LEN: usize = 2000;

const FENCE_OPEN: &str = "```diff\n";
const FENCE_CLOSE: &str = "```";
const UNAVAILABLE: &str = "Unable to load";

/// Result text when the roster site cannot be reached for an operator verb.
pub const ACTION_FAILED: &str = "Can't perform the action";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchlistKind {
    Hunted,
    Team,
}

impl WatchlistKind {
    pub const ALL: [WatchlistKind; 2] = [WatchlistKind::Hunted, WatchlistKind::Team];

    pub fn as_str(self) -> &'static str {
        match self {
            WatchlistKind::Hunted => "hunted",
            WatchlistKind::Team => "team",
        }
    }

    pub fn file_name(self) -> &'static str {
        match self {
            WatchlistKind::Hunted => "hunted.json",
            WatchlistKind::Team => "team.json",
        }
    }

    pub fn busy_message(self) -> &'static str {
        match self {
            WatchlistKind::Hunted => "Aguarde a lista de hunteds ser atualizada/enviada!",
            WatchlistKind::Team => "Aguarde a lista de times ser atualizada/enviada!",
        }
    }

    fn board_title(self) -> &'static str {
        match self {
            WatchlistKind::Hunted => "HUNTED",
            WatchlistKind::Team => "TEAM",
        }
    }
}

impl fmt::Display for WatchlistKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown watchlist `{0}` (expected hunted or team)")]
pub struct UnknownWatchlist(pub String);

impl FromStr for WatchlistKind {
    type Err = UnknownWatchlist;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hunted" => Ok(WatchlistKind::Hunted),
            "team" => Ok(WatchlistKind::Team),
            _ => Err(UnknownWatchlist(s.to_string())),
        }
    }
}

/// Operator verbs. Anything unrecognized lists the entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchAction {
    Add,
    Remove,
    Edit,
    Online,
    List,
}

impl WatchAction {
    pub fn parse(action: &str) -> Self {
        match action.trim().to_ascii_lowercase().as_str() {
            "add" => WatchAction::Add,
            "remove" => WatchAction::Remove,
            "edit" => WatchAction::Edit,
            "online" => WatchAction::Online,
            _ => WatchAction::List,
        }
    }
}

/// A broadcast pass holds the list; operator actions must wait.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("{}", .0.busy_message())]
pub struct WatchlistBusy(pub WatchlistKind);

#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error(transparent)]
    Roster(#[from] AdapterError),
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastOutcome {
    Sent { entries: usize, messages: usize },
    /// Another pass was already running.
    Skipped,
}

/// Clears the running flag on drop, including on an early error return.
struct RunningGuard<'a>(&'a AtomicBool);

impl<'a> RunningGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunningGuard(flag))
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Watchlist {
    kind: WatchlistKind,
    source: Arc<dyn RosterSource>,
    sink: Arc<dyn DeliverySink>,
    file: JsonStateFile<WatchEntries>,
    entries: Mutex<WatchEntries>,
    running: AtomicBool,
}

impl Watchlist {
    pub async fn open(
        kind: WatchlistKind,
        source: Arc<dyn RosterSource>,
        sink: Arc<dyn DeliverySink>,
        path: impl Into<PathBuf>,
    ) -> Self {
        let file: JsonStateFile<WatchEntries> = JsonStateFile::new(path);
        let entries = file.load_or_default().await;
        Self {
            kind,
            source,
            sink,
            file,
            entries: Mutex::new(entries),
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn ensure_idle(&self) -> Result<(), WatchlistBusy> {
        if self.is_running() {
            Err(WatchlistBusy(self.kind))
        } else {
            Ok(())
        }
    }

    async fn save(&self, entries: &WatchEntries) {
        if let Err(err) = self.file.save(entries).await {
            warn!(list = %self.kind, error = %err, "watchlist not persisted");
        }
    }

    pub async fn entries(&self) -> WatchEntries {
        self.entries.lock().await.clone()
    }

    pub async fn add(&self, name: &str, reason: &str) -> Result<String, WatchlistBusy> {
        self.ensure_idle()?;
        let mut entries = self.entries.lock().await;
        if entries.contains_key(name) {
            return Ok(format!("{name} already in list"));
        }

        match self.source.lookup_character(name).await {
            Ok(Some(_)) => {}
            Ok(None) => return Ok(format!("{name} not exist")),
            Err(err) => {
                warn!(list = %self.kind, name, error = %err, "character lookup failed");
                return Ok(format!("{name} not exist"));
            }
        }

        // A board pass may have started during the lookup.
        self.ensure_idle()?;
        entries.insert(
            name.to_string(),
            WatchEntry {
                reason: reason.to_string(),
            },
        );
        self.save(&entries).await;
        info!(list = %self.kind, name, "added to watchlist");
        Ok(format!("{name} added to list"))
    }

    pub async fn remove(&self, name: &str) -> Result<String, WatchlistBusy> {
        let mut entries = self.entries.lock().await;
        self.ensure_idle()?;
        if entries.remove(name).is_none() {
            return Ok(format!("{name} not found in list"));
        }
        self.save(&entries).await;
        info!(list = %self.kind, name, "removed from watchlist");
        Ok(format!("{name} removed from list"))
    }

    pub async fn edit(&self, name: &str, reason: &str) -> Result<String, WatchlistBusy> {
        let mut entries = self.entries.lock().await;
        self.ensure_idle()?;
        let Some(entry) = entries.get_mut(name) else {
            return Ok(format!("{name} not found in list"));
        };
        entry.reason = reason.to_string();
        self.save(&entries).await;
        Ok(format!("reason {reason} edited in {name} from list"))
    }

    /// Members of the list that are in the live roster.
    pub async fn online_check(&self) -> String {
        let online = match self.source.online().await {
            Ok(online) => online,
            Err(err) => {
                warn!(list = %self.kind, error = %err, "online roster unavailable");
                return ACTION_FAILED.to_string();
            }
        };
        let entries = self.entries.lock().await;
        let lines: Vec<_> = online
            .iter()
            .filter(|c| entries.contains_key(&c.name))
            .map(|c| format!("{} - {} {}", c.name, c.level, c.vocation))
            .collect();
        if lines.is_empty() {
            "No players online".to_string()
        } else {
            lines.join("\n")
        }
    }

    pub async fn list(&self) -> String {
        let entries = self.entries.lock().await;
        if entries.is_empty() {
            return "No players".to_string();
        }
        entries
            .iter()
            .map(|(name, entry)| format!("{name} - {}\n", entry.reason))
            .collect()
    }

    /// Dispatches an operator verb. Every verb is rejected while a broadcast runs.
    pub async fn handle(
        &self,
        action: WatchAction,
        name: &str,
        reason: &str,
    ) -> Result<String, WatchlistBusy> {
        self.ensure_idle()?;
        match action {
            WatchAction::Add => self.add(name, reason).await,
            WatchAction::Remove => self.remove(name).await,
            WatchAction::Edit => self.edit(name, reason).await,
            WatchAction::Online => Ok(self.online_check().await),
            WatchAction::List => Ok(self.list().await),
        }
    }

    /// Renders every entry as one status line and sends the board in size-limited messages.
    pub async fn broadcast_pass(&self) -> Result<BroadcastOutcome, BroadcastError> {
        let Some(_running) = RunningGuard::acquire(&self.running) else {
            return Ok(BroadcastOutcome::Skipped);
        };
        info!(list = %self.kind, "broadcasting board");

        let online = self.source.online().await?;
        let online: HashSet<&str> = online.iter().map(|c| c.name.as_str()).collect();
        let entries = self.entries.lock().await.clone();

        let mut lines = Vec::with_capacity(entries.len());
        for (name, entry) in &entries {
            let detail = match self.source.lookup_character(name).await {
                Ok(Some(character)) => character,
                Ok(None) => unavailable(name),
                Err(err) => {
                    warn!(list = %self.kind, name = %name, error = %err, "character lookup failed");
                    unavailable(name)
                }
            };
            lines.push(board_line(online.contains(name.as_str()), &detail, &entry.reason));
        }

        let header = format!(
            "{} BOARD Last Updated in {}",
            self.kind.board_title(),
            Local::now().format("%H:%M:%S")
        );
        let messages = batch_board(&header, &lines, MAX_MESSAGE_LEN);
        for message in &messages {
            self.sink.deliver_text(self.kind.as_str(), message).await?;
        }
        info!(list = %self.kind, entries = entries.len(), messages = messages.len(), "board sent");
        Ok(BroadcastOutcome::Sent {
            entries: entries.len(),
            messages: messages.len(),
        })
    }
}

fn unavailable(name: &str) -> Character {
    Character::new(name, UNAVAILABLE, UNAVAILABLE, "")
}

/// One board row: `+ ` when online, `- ` otherwise, then padded columns.
pub fn board_line(online: bool, character: &Character, reason: &str) -> String {
    let status = if online { "+ " } else { "- " };
    format!(
        "{status}{:<30} {} {:<20} Guild: {:<35} Reason: {:<30}\n",
        character.name,
        character.level,
        character.vocation,
        character.guild_or_none(),
        reason
    )
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn truncate_line(line: &str, max_chars: usize) -> String {
    if char_len(line) <= max_chars {
        return line.to_string();
    }
    let mut cut: String = line.chars().take(max_chars.saturating_sub(1)).collect();
    cut.push('\n');
    cut
}

/// Packs board lines into fenced messages of at most `limit` characters each.
/// Every line lands in exactly one message, in order.
pub fn batch_board(header: &str, lines: &[String], limit: usize) -> Vec<String> {
    let close_len = char_len(FENCE_CLOSE);
    let line_budget = limit.saturating_sub(char_len(FENCE_OPEN) + close_len);

    let mut messages = Vec::new();
    let mut current = format!("{FENCE_OPEN}{header}\n");
    if lines.is_empty() {
        current.push_str("No players");
    }

    for line in lines {
        let line = truncate_line(line, line_budget);
        if char_len(&current) + char_len(&line) + close_len > limit {
            current.push_str(FENCE_CLOSE);
            messages.push(std::mem::replace(&mut current, FENCE_OPEN.to_string()));
        }
        current.push_str(&line);
    }

    current.push_str(FENCE_CLOSE);
    messages.push(current);
    messages
}
