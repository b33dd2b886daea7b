//! Core domain model for Lookout: feed descriptors, records, roster characters.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "lookout-core";

/// Association count at which a logout/login pair is reported as significant.
pub const SIGNIFICANT_ASSOCIATION: u32 = 4;

/// A single "latest entry" exactly as decoded from a source response.
pub type RawItem = Map<String, JsonValue>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ShapeError {
    #[error("unknown response shape index {0} (expected 0..=3)")]
    UnknownIndex(u8),
    #[error("unknown response shape name {0:?}")]
    UnknownName(String),
}

/// Where the newest item lives inside a source's JSON payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "ShapeSelector", into = "ShapeSelector")]
pub enum ResponseShape {
    /// `data[0]`
    DataList,
    /// `data.segments[0]`
    DataSegments,
    /// `data.featured[0]`
    DataFeatured,
    /// `news[0]`
    NewsList,
}

impl ResponseShape {
    pub const ALL: [ResponseShape; 4] = [
        ResponseShape::DataList,
        ResponseShape::DataSegments,
        ResponseShape::DataFeatured,
        ResponseShape::NewsList,
    ];

    pub fn index(self) -> u8 {
        match self {
            ResponseShape::DataList => 0,
            ResponseShape::DataSegments => 1,
            ResponseShape::DataFeatured => 2,
            ResponseShape::NewsList => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResponseShape::DataList => "data",
            ResponseShape::DataSegments => "segments",
            ResponseShape::DataFeatured => "featured",
            ResponseShape::NewsList => "news",
        }
    }
}

impl fmt::Display for ResponseShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<u8> for ResponseShape {
    type Error = ShapeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|shape| shape.index() == value)
            .ok_or(ShapeError::UnknownIndex(value))
    }
}

impl FromStr for ResponseShape {
    type Err = ShapeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        if let Ok(index) = wanted.parse::<u8>() {
            return Self::try_from(index);
        }
        Self::ALL
            .into_iter()
            .find(|shape| shape.as_str() == wanted)
            .ok_or_else(|| ShapeError::UnknownName(s.to_string()))
    }
}

/// Config-side spelling of a shape: either the legacy node index or a name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum ShapeSelector {
    Index(u8),
    Name(String),
}

impl TryFrom<ShapeSelector> for ResponseShape {
    type Error = ShapeError;

    fn try_from(value: ShapeSelector) -> Result<Self, Self::Error> {
        match value {
            ShapeSelector::Index(i) => ResponseShape::try_from(i),
            ShapeSelector::Name(name) => name.parse(),
        }
    }
}

impl From<ResponseShape> for ShapeSelector {
    fn from(value: ResponseShape) -> Self {
        ShapeSelector::Index(value.index())
    }
}

/// Embed accent color (`0xRRGGBB`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "ColorRepr", into = "u32")]
pub struct Color(pub u32);

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ColorRepr {
    Int(u32),
    Text(String),
}

impl TryFrom<ColorRepr> for Color {
    type Error = String;

    fn try_from(value: ColorRepr) -> Result<Self, Self::Error> {
        match value {
            ColorRepr::Int(v) => Ok(Color(v)),
            ColorRepr::Text(s) => {
                let hex = s
                    .trim()
                    .trim_start_matches('#')
                    .trim_start_matches("0x")
                    .trim_start_matches("0X");
                u32::from_str_radix(hex, 16)
                    .map(Color)
                    .map_err(|e| format!("invalid color {s:?}: {e}"))
            }
        }
    }
}

impl From<Color> for u32 {
    fn from(value: Color) -> Self {
        value.0
    }
}

/// Declarative definition of one tracked feed. Built once from configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub name: String,
    /// Absolute URL, or a path joined onto `api_base` / the global API base.
    pub endpoint: String,
    #[serde(default)]
    pub api_base: Option<String>,
    pub shape: ResponseShape,
    /// old key -> new key, applied before defaults.
    #[serde(default)]
    pub rename: BTreeMap<String, String>,
    /// key -> fallback for absent or empty-string values.
    #[serde(default)]
    pub defaults: BTreeMap<String, String>,
    /// Prepended to the extracted `url` (sources that return relative links).
    #[serde(default)]
    pub link_prefix: Option<String>,
    #[serde(default)]
    pub color: Color,
    /// Storage key of the last-seen item, relative to the state directory.
    pub state_file: PathBuf,
}

impl SourceDescriptor {
    pub fn is_absolute_endpoint(&self) -> bool {
        let e = self.endpoint.trim();
        e.starts_with("http://") || e.starts_with("https://")
    }

    pub fn resolve_endpoint(&self, default_base: &str) -> String {
        if self.is_absolute_endpoint() {
            return self.endpoint.trim().to_string();
        }
        let base = self.api_base.as_deref().unwrap_or(default_base);
        join_url(base, &self.endpoint)
    }
}

pub fn join_url(base: &str, path: &str) -> String {
    let base = base.trim().trim_end_matches('/');
    let path = path.trim().trim_start_matches('/');
    if path.is_empty() {
        base.to_string()
    } else {
        format!("{base}/{path}")
    }
}

/// Canonical record handed to the delivery collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    /// Display name of the source, not of the item.
    pub name: String,
    pub title: String,
    pub description: String,
    pub url: String,
    pub thumbnail: String,
    pub author: String,
    /// Date as published by the source (or the default fallback).
    pub date: String,
    /// `date` parsed as RFC 3339 / ISO 8601 when it is one.
    pub published_at: Option<DateTime<Utc>>,
    pub color: Color,
}

/// A character seen on the roster site. Identity is the name alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Character {
    pub name: String,
    pub level: String,
    pub vocation: String,
    pub url: String,
    #[serde(default)]
    pub guild: Option<String>,
    #[serde(default)]
    pub online: bool,
}

impl Character {
    pub fn new(
        name: impl Into<String>,
        level: impl Into<String>,
        vocation: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            level: level.into(),
            vocation: vocation.into(),
            url: url.into(),
            guild: None,
            online: false,
        }
    }

    pub fn with_guild(mut self, guild: impl Into<String>) -> Self {
        self.guild = Some(guild.into());
        self
    }

    pub fn guild_or_none(&self) -> &str {
        self.guild.as_deref().unwrap_or("None")
    }
}

impl PartialEq for Character {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Character {}

impl Hash for Character {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl fmt::Display for Character {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} - {} {} - {}",
            self.name,
            self.level,
            self.vocation,
            self.guild_or_none()
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Maker {
    pub name: String,
    pub count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssociationEntry {
    #[serde(default)]
    pub makers: Vec<Maker>,
}

/// Persistent co-occurrence table: `{ tracked: { makers: [ {name, count} ] } }`.
///
/// Counts only grow; `purge` is the single way entries go away.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssociationTable {
    entries: BTreeMap<String, AssociationEntry>,
}

impl AssociationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, tracked: &str) -> Option<&AssociationEntry> {
        self.entries.get(tracked)
    }

    pub fn count(&self, tracked: &str, candidate: &str) -> Option<u32> {
        self.entries
            .get(tracked)?
            .makers
            .iter()
            .find(|m| m.name == candidate)
            .map(|m| m.count)
    }

    /// Increments `tracked -> candidate`, creating it at 1. Returns the new count.
    pub fn record(&mut self, tracked: &str, candidate: &str) -> u32 {
        let entry = self.entries.entry(tracked.to_string()).or_default();
        match entry.makers.iter_mut().find(|m| m.name == candidate) {
            Some(maker) => {
                maker.count = maker.count.saturating_add(1);
                maker.count
            }
            None => {
                entry.makers.push(Maker {
                    name: candidate.to_string(),
                    count: 1,
                });
                1
            }
        }
    }

    /// `None` when `tracked` was never recorded.
    pub fn strong_for(&self, tracked: &str, min_count: u32) -> Option<Vec<Maker>> {
        let entry = self.entries.get(tracked)?;
        Some(
            entry
                .makers
                .iter()
                .filter(|m| m.count >= min_count)
                .cloned()
                .collect(),
        )
    }

    /// Drops every maker with `count <= threshold`. Returns how many were removed.
    pub fn purge(&mut self, threshold: u32) -> usize {
        let mut removed = 0usize;
        for entry in self.entries.values_mut() {
            let before = entry.makers.len();
            entry.makers.retain(|m| m.count > threshold);
            removed += before - entry.makers.len();
        }
        removed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEntry {
    pub reason: String,
}

/// Persisted watchlist: `{ name: { reason } }`, key-sorted.
pub type WatchEntries = BTreeMap<String, WatchEntry>;
