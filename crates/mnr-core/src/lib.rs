//! Core reward model, region registry types and small shared helpers for MNR.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize};

pub const CRATE_NAME: &str = "mnr-core";

/// Document collection holding one [`RegionSnapshot`] per region.
pub const REWARDS_COLLECTION: &str = "rewards";
/// Document collection holding one [`RewardHistory`] per region.
pub const REWARDS_HISTORY_COLLECTION: &str = "rewards-history";
/// The only topic clients may subscribe to; the region code is appended.
pub const NEW_REWARDS_TOPIC: &str = "new-rewards";

/// Short store/market code such as `US` or `GB`. Always upper-case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RegionCode(String);

impl RegionCode {
    pub fn new(code: impl AsRef<str>) -> Self {
        Self(code.as_ref().trim().to_ascii_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Topic id for this region, e.g. `new-rewards-US`.
    pub fn topic(&self, topic: &str) -> String {
        format!("{topic}-{}", self.0)
    }
}

impl<'de> Deserialize<'de> for RegionCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::new(raw))
    }
}

impl fmt::Display for RegionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PointCategory {
    Platinum,
    Gold,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Points {
    pub amount: f64,
    pub category: PointCategory,
}

/// Stock as published by the feed. Two generations exist: the collapsed
/// availability flag (canonical) and the older remaining/total counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Stock {
    Availability { available: bool },
    Counted { remains: i64, total: i64 },
}

impl Default for Stock {
    fn default() -> Self {
        Stock::Availability { available: true }
    }
}

impl Stock {
    pub fn is_available(&self) -> bool {
        match self {
            Stock::Availability { available } => *available,
            Stock::Counted { remains, .. } => *remains > 0,
        }
    }

    /// Collapse counters into the availability flag.
    pub fn collapse(self) -> Stock {
        Stock::Availability {
            available: self.is_available(),
        }
    }

    /// The value tracked in history for this stock reading.
    pub fn level(&self) -> StockLevel {
        match self {
            Stock::Availability { available } => StockLevel::Available(*available),
            Stock::Counted { remains, .. } => StockLevel::Remaining(*remains),
        }
    }
}

/// Which stock generation a region keeps after normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StockMode {
    #[default]
    Availability,
    Counted,
}

/// Scalar recorded in a history series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StockLevel {
    Available(bool),
    Remaining(i64),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Href {
    pub href: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Links {
    #[serde(rename = "myNintendo", default, skip_serializing_if = "Option::is_none")]
    pub my_nintendo: Option<Href>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Images {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<ImageRef>,
}

/// Canonical reward item. Unknown feed fields are dropped on deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewardItem {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub title: String,
    pub category: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub begins_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ends_at: Option<i64>,
    #[serde(default, deserialize_with = "stock_or_default")]
    pub stock: Stock,
    #[serde(default)]
    pub points: Vec<Points>,
    #[serde(default)]
    pub links: Links,
    #[serde(default)]
    pub images: Images,
}

impl RewardItem {
    /// First points entry is the displayed price.
    pub fn default_price(&self) -> Option<&Points> {
        self.points.first()
    }

    pub fn link(&self) -> Option<&str> {
        self.links.my_nintendo.as_ref().map(|h| h.href.as_str())
    }
}

fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Number(serde_json::Number),
    }
    Ok(match Id::deserialize(deserializer)? {
        Id::Text(s) => s,
        Id::Number(n) => n.to_string(),
    })
}

fn stock_or_default<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Stock, D::Error> {
    Ok(Option::<Stock>::deserialize(deserializer)?.unwrap_or_default())
}

/// Wholesale per-region state document (`rewards/<REGION>`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionSnapshot {
    /// Milliseconds since the unix epoch.
    pub last_updated_at: i64,
    pub rewards: Vec<RewardItem>,
}

impl RegionSnapshot {
    pub fn new(rewards: Vec<RewardItem>, updated_at: DateTime<Utc>) -> Self {
        Self {
            last_updated_at: updated_at.timestamp_millis(),
            rewards,
        }
    }

    pub fn reward_ids(&self) -> HashSet<&str> {
        self.rewards.iter().map(|r| r.id.as_str()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryPoint {
    /// Milliseconds since the unix epoch.
    pub timestamp: i64,
    pub stock: StockLevel,
}

/// Per-region stock series keyed by reward id (`rewards-history/<REGION>`).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RewardHistory {
    #[serde(rename = "rewardHistory", default)]
    pub series: BTreeMap<String, Vec<HistoryPoint>>,
}

impl RewardHistory {
    pub fn series_for(&self, id: &str) -> Option<&[HistoryPoint]> {
        self.series.get(id).map(Vec::as_slice)
    }

    pub fn last_level(&self, id: &str) -> Option<StockLevel> {
        self.series.get(id).and_then(|s| s.last()).map(|p| p.stock)
    }
}

/// Which payload extraction strategy a region's page needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExtractorKind {
    EmbeddedScript,
    MarkupNode,
    /// Try every known strategy in order.
    #[default]
    Auto,
}

/// Static per-region configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionConfig {
    pub code: RegionCode,
    pub name: String,
    pub category_name: String,
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub extractor: ExtractorKind,
    #[serde(default)]
    pub type_filter: Option<String>,
    #[serde(default)]
    pub stock_mode: StockMode,
}

fn default_enabled() -> bool {
    true
}

/// The regions the service shipped with.
pub fn builtin_regions() -> Vec<RegionConfig> {
    let region = |code: &str, name: &str, category: &str, proxy: Option<&str>| RegionConfig {
        code: RegionCode::new(code),
        name: name.to_string(),
        category_name: category.to_string(),
        proxy: proxy.map(ToString::to_string),
        enabled: true,
        extractor: ExtractorKind::Auto,
        type_filter: None,
        stock_mode: StockMode::Availability,
    };
    vec![
        region("US", "United States", "nintendo_store", None),
        region("CA", "Canada", "nintendo_store", Some("proxy-canada")),
        region("GB", "United Kingdom", "my_nintendo_store", Some("proxy-london")),
    ]
}

/// Sliding-window limiter over a bounded queue of accepted action times.
///
/// An action is rejected when `capacity` earlier actions were accepted within
/// the trailing `window`. Rejected actions are not recorded, so retrying while
/// limited never extends the lockout.
#[derive(Debug, Clone)]
pub struct ActionRateLimiter {
    capacity: usize,
    window: Duration,
    accepted: VecDeque<DateTime<Utc>>,
}

pub const RATE_LIMIT_CALL_NUMBER: usize = 5;
pub const RATE_LIMIT_PERIOD_SECONDS: i64 = 30;

impl Default for ActionRateLimiter {
    fn default() -> Self {
        Self::new(
            RATE_LIMIT_CALL_NUMBER,
            Duration::seconds(RATE_LIMIT_PERIOD_SECONDS),
        )
    }
}

impl ActionRateLimiter {
    pub fn new(capacity: usize, window: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            window,
            accepted: VecDeque::with_capacity(capacity),
        }
    }

    pub fn try_acquire(&mut self, now: DateTime<Utc>) -> bool {
        while let Some(oldest) = self.accepted.front() {
            if now - *oldest >= self.window {
                self.accepted.pop_front();
            } else {
                break;
            }
        }
        if self.accepted.len() >= self.capacity {
            return false;
        }
        self.accepted.push_back(now);
        true
    }

    /// True once every recorded action has aged out of the window.
    pub fn is_idle(&self, now: DateTime<Utc>) -> bool {
        self.accepted
            .back()
            .map_or(true, |latest| now - *latest >= self.window)
    }
}
