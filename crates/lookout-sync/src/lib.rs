//! Orchestration: configuration, the feed poller, roster tracking, watchlists, and the job runner.

pub mod delivery;
pub mod poll;
pub mod roster;
pub mod scheduler;
pub mod watchlist;

use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use lookout_adapters::{TibiantisRoster, DEFAULT_ROSTER_BASE};
use lookout_core::SourceDescriptor;
use lookout_storage::{BodyFetcher, ChangeStore, HttpClientConfig, HttpFetcher};
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

pub use delivery::{DeliveryError, DeliverySink, DiscordWebhookSink, LogSink, PATCH_NOTES_CHANNEL};
pub use poll::{PollError, PollOutcome, PollWorker};
pub use roster::{diff_rosters, AssociationCheck, CompareReport, PurgeReport, RosterDiff, RosterTracker};
pub use scheduler::{Job, Scheduler, SchedulerHandle};
pub use watchlist::{
    batch_board, board_line, BroadcastOutcome, WatchAction, Watchlist, WatchlistBusy,
    WatchlistKind, MAX_MESSAGE_LEN,
};

pub const CRATE_NAME: &str = "lookout-sync";

pub const DEFAULT_API_BASE: &str = "https://api.axsddlr.xyz";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("duplicate source name `{0}`")]
    DuplicateName(String),
    #[error("sources `{first}` and `{second}` share state file {path}")]
    DuplicateStateFile {
        first: String,
        second: String,
        path: PathBuf,
    },
    #[error("source `{name}` has invalid state file {path} (must be relative, without `..`)")]
    InvalidStateFile { name: String, path: PathBuf },
    #[error("source `{0}` has an empty endpoint")]
    EmptyEndpoint(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceDescriptor>,
}

impl SourceRegistry {
    pub fn from_yaml(text: &str, path: &Path) -> Result<Self, ConfigError> {
        let registry: SourceRegistry =
            serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        registry.validate()?;
        Ok(registry)
    }

    /// Reads and validates the registry. Unknown shapes fail here, never at poll time.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_yaml(&text, path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        let mut state_files: HashMap<&Path, &str> = HashMap::new();
        for source in &self.sources {
            if !names.insert(source.name.as_str()) {
                return Err(ConfigError::DuplicateName(source.name.clone()));
            }
            if source.endpoint.trim().is_empty() {
                return Err(ConfigError::EmptyEndpoint(source.name.clone()));
            }
            let key = source.state_file.as_path();
            let relative = !key.as_os_str().is_empty()
                && key
                    .components()
                    .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
            if !relative {
                return Err(ConfigError::InvalidStateFile {
                    name: source.name.clone(),
                    path: key.to_path_buf(),
                });
            }
            if let Some(first) = state_files.insert(key, &source.name) {
                return Err(ConfigError::DuplicateStateFile {
                    first: first.to_string(),
                    second: source.name.clone(),
                    path: key.to_path_buf(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct LookoutConfig {
    pub workspace_root: PathBuf,
    pub state_dir: PathBuf,
    pub sources_path: PathBuf,
    pub api_base: String,
    pub roster_base: String,
    pub patch_interval: Duration,
    pub compare_interval: Duration,
    pub board_interval: Duration,
    pub http_timeout_secs: u64,
    pub webhook_retries: u8,
    pub user_agent: String,
    pub patch_webhook: Option<String>,
    pub hunted_webhook: Option<String>,
    pub team_webhook: Option<String>,
    pub announce_first_seen: bool,
    pub web_port: u16,
}

impl LookoutConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let secs = |key: &str, default: u64| {
            non_empty(key)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        };

        let workspace_root = non_empty("LOOKOUT_WORKSPACE")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            state_dir: non_empty("LOOKOUT_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| workspace_root.join("state")),
            sources_path: non_empty("LOOKOUT_SOURCES")
                .map(PathBuf::from)
                .unwrap_or_else(|| workspace_root.join("sources.yaml")),
            api_base: non_empty("LOOKOUT_API_BASE").unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            roster_base: non_empty("LOOKOUT_ROSTER_BASE")
                .unwrap_or_else(|| DEFAULT_ROSTER_BASE.to_string()),
            patch_interval: Duration::from_secs(secs("LOOKOUT_PATCH_INTERVAL_SECS", 3600)),
            compare_interval: Duration::from_secs(secs("LOOKOUT_COMPARE_INTERVAL_SECS", 60)),
            board_interval: Duration::from_secs(secs("LOOKOUT_BOARD_INTERVAL_SECS", 600)),
            http_timeout_secs: secs("LOOKOUT_HTTP_TIMEOUT_SECS", 20),
            webhook_retries: non_empty("LOOKOUT_WEBHOOK_RETRIES")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(3),
            user_agent: non_empty("LOOKOUT_USER_AGENT")
                .unwrap_or_else(|| "lookout-bot/0.1".to_string()),
            patch_webhook: non_empty("LOOKOUT_PATCH_WEBHOOK"),
            hunted_webhook: non_empty("LOOKOUT_HUNTED_WEBHOOK"),
            team_webhook: non_empty("LOOKOUT_TEAM_WEBHOOK"),
            announce_first_seen: non_empty("LOOKOUT_ANNOUNCE_FIRST_SEEN")
                .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            web_port: non_empty("LOOKOUT_WEB_PORT")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(8000),
            workspace_root,
        }
    }

    pub fn users_dir(&self) -> PathBuf {
        self.state_dir.join("users")
    }

    pub fn associations_path(&self) -> PathBuf {
        self.users_dir().join("data.json")
    }

    pub fn watchlist_path(&self, kind: WatchlistKind) -> PathBuf {
        self.users_dir().join(kind.file_name())
    }

    fn webhooks(&self) -> HashMap<String, String> {
        [
            (PATCH_NOTES_CHANNEL, &self.patch_webhook),
            (WatchlistKind::Hunted.as_str(), &self.hunted_webhook),
            (WatchlistKind::Team.as_str(), &self.team_webhook),
        ]
        .into_iter()
        .filter_map(|(channel, url)| url.clone().map(|url| (channel.to_string(), url)))
        .collect()
    }

    pub fn delivery_sink(&self) -> Arc<dyn DeliverySink> {
        let webhooks = self.webhooks();
        if webhooks.is_empty() {
            warn!("no webhooks configured, deliveries go to the log");
            Arc::new(LogSink)
        } else {
            Arc::new(
                DiscordWebhookSink::new(webhooks)
                    .with_timeout(self.http_timeout_secs)
                    .with_retries(self.webhook_retries),
            )
        }
    }
}

/// Every long-lived component, built once at startup and shared by `Arc`.
pub struct Lookout {
    pub config: LookoutConfig,
    pub sources: Arc<Vec<SourceDescriptor>>,
    pub poller: Arc<PollWorker>,
    pub tracker: Arc<RosterTracker>,
    pub hunted: Arc<Watchlist>,
    pub team: Arc<Watchlist>,
}

impl Lookout {
    pub async fn from_config(config: LookoutConfig) -> Result<Self> {
        let registry = SourceRegistry::load(&config.sources_path).await?;
        let fetcher: Arc<dyn BodyFetcher> = Arc::new(HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?);
        let sink = config.delivery_sink();
        let roster = Arc::new(TibiantisRoster::new(fetcher.clone(), config.roster_base.clone()));

        let poller = PollWorker::new(
            fetcher,
            Arc::new(ChangeStore::new(config.state_dir.clone())),
            sink.clone(),
            config.api_base.clone(),
        )
        .announce_first_seen(config.announce_first_seen);
        let tracker = RosterTracker::open(roster.clone(), config.associations_path()).await;
        let hunted = Watchlist::open(
            WatchlistKind::Hunted,
            roster.clone(),
            sink.clone(),
            config.watchlist_path(WatchlistKind::Hunted),
        )
        .await;
        let team = Watchlist::open(
            WatchlistKind::Team,
            roster,
            sink,
            config.watchlist_path(WatchlistKind::Team),
        )
        .await;

        info!(sources = registry.sources.len(), "lookout initialized");
        Ok(Self {
            config,
            sources: Arc::new(registry.sources),
            poller: Arc::new(poller),
            tracker: Arc::new(tracker),
            hunted: Arc::new(hunted),
            team: Arc::new(team),
        })
    }

    pub fn watchlist(&self, kind: WatchlistKind) -> &Arc<Watchlist> {
        match kind {
            WatchlistKind::Hunted => &self.hunted,
            WatchlistKind::Team => &self.team,
        }
    }

    /// Patch-note polling, roster comparison, and one board per watchlist.
    pub fn scheduler(&self) -> Scheduler {
        let poller = self.poller.clone();
        let sources = self.sources.clone();
        let mut scheduler = Scheduler::new().with_job(Job::new(
            "patch-notes",
            self.config.patch_interval,
            move || {
                let poller = poller.clone();
                let sources = sources.clone();
                async move {
                    poller.run_all(&sources).await;
                    anyhow::Ok(())
                }
            },
        ));

        let tracker = self.tracker.clone();
        scheduler.add(Job::new(
            "roster-compare",
            self.config.compare_interval,
            move || {
                let tracker = tracker.clone();
                async move {
                    tracker.compare().await?;
                    anyhow::Ok(())
                }
            },
        ));

        for kind in WatchlistKind::ALL {
            let list = self.watchlist(kind).clone();
            scheduler.add(Job::new(
                format!("{kind}-board"),
                self.config.board_interval,
                move || {
                    let list = list.clone();
                    async move {
                        list.broadcast_pass().await?;
                        anyhow::Ok(())
                    }
                },
            ));
        }
        scheduler
    }
}
