//! Payload extraction strategies for the rewards page plus item normalization.

use std::collections::HashSet;

use mnr_core::{ExtractorKind, RegionConfig, RewardItem, StockMode};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "mnr-adapters";

/// Marker that opens the embedded payload line in the legacy page layout.
pub const EMBEDDED_MARKER: &str = "embeddedResponses:";
/// Element id carrying the JSON document in the current page layout.
pub const DEFAULT_NODE_ID: &str = "__NEXT_DATA__";

static EMBEDDED_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"embeddedResponses: (.*)").expect("static regex"));
static DECODE_CALL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(^.*JSON\.parse\()|(\),?\s*$)").expect("static regex"));

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("marker `{0}` not found in page")]
    MarkerMissing(&'static str),
    #[error("embedded payload is not a JSON string literal: {0}")]
    OuterDecode(#[source] serde_json::Error),
    #[error("embedded payload string is not a JSON document: {0}")]
    InnerDecode(#[source] serde_json::Error),
    #[error("no element with id `{0}` in page")]
    NodeMissing(String),
    #[error("element `{node_id}` does not hold a JSON document: {source}")]
    NodeDecode {
        node_id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("`{0}` does not resolve to an array")]
    PathMiss(String),
    #[error("invalid selector: {0}")]
    Selector(String),
    #[error("no extraction strategy matched the page: {}", .0.join("; "))]
    NoStrategyMatched(Vec<String>),
}

/// Turns fetched page text into the feed's raw item records.
pub trait PayloadExtractor: Send + Sync {
    fn name(&self) -> &'static str;
    fn extract(&self, page: &str) -> Result<Vec<JsonValue>, ExtractionError>;
}

fn json_path<'a>(value: &'a JsonValue, path: &[String]) -> Option<&'a JsonValue> {
    path.iter().try_fold(value, |cur, segment| cur.get(segment.as_str()))
}

fn items_at(value: &JsonValue, path: &[String]) -> Result<Vec<JsonValue>, ExtractionError> {
    json_path(value, path)
        .and_then(JsonValue::as_array)
        .cloned()
        .ok_or_else(|| ExtractionError::PathMiss(path.join(".")))
}

fn owned_path(path: &[&str]) -> Vec<String> {
    path.iter().map(ToString::to_string).collect()
}

/// Legacy layout: the payload is a `JSON.parse("...")` call on one script line,
/// so it is JSON encoded as a string inside JSON and needs two decodes.
#[derive(Debug, Clone)]
pub struct EmbeddedScriptExtractor {
    items_path: Vec<String>,
}

impl Default for EmbeddedScriptExtractor {
    fn default() -> Self {
        Self {
            items_path: owned_path(&["api_reward_list", "data", "items"]),
        }
    }
}

impl EmbeddedScriptExtractor {
    pub fn with_items_path(path: &[&str]) -> Self {
        Self {
            items_path: owned_path(path),
        }
    }

    /// The payload document, before navigating to the item array.
    pub fn decode_payload(&self, page: &str) -> Result<JsonValue, ExtractionError> {
        let line = EMBEDDED_LINE
            .find(page)
            .ok_or(ExtractionError::MarkerMissing(EMBEDDED_MARKER))?
            .as_str();
        let literal = DECODE_CALL.replace_all(line, "");
        let inner: String =
            serde_json::from_str(literal.trim()).map_err(ExtractionError::OuterDecode)?;
        serde_json::from_str(&inner).map_err(ExtractionError::InnerDecode)
    }
}

impl PayloadExtractor for EmbeddedScriptExtractor {
    fn name(&self) -> &'static str {
        "embedded-script"
    }

    fn extract(&self, page: &str) -> Result<Vec<JsonValue>, ExtractionError> {
        let payload = self.decode_payload(page)?;
        items_at(&payload, &self.items_path)
    }
}

/// Current layout: one element, found by id, whose text is a JSON document.
#[derive(Debug, Clone)]
pub struct MarkupNodeExtractor {
    node_id: String,
    items_path: Vec<String>,
}

impl Default for MarkupNodeExtractor {
    fn default() -> Self {
        Self {
            node_id: DEFAULT_NODE_ID.to_string(),
            items_path: owned_path(&["props", "pageProps", "rewards", "items"]),
        }
    }
}

impl MarkupNodeExtractor {
    pub fn new(node_id: impl Into<String>, items_path: &[&str]) -> Self {
        Self {
            node_id: node_id.into(),
            items_path: owned_path(items_path),
        }
    }
}

impl PayloadExtractor for MarkupNodeExtractor {
    fn name(&self) -> &'static str {
        "markup-node"
    }

    fn extract(&self, page: &str) -> Result<Vec<JsonValue>, ExtractionError> {
        let selector = Selector::parse(&format!(r#"[id="{}"]"#, self.node_id))
            .map_err(|e| ExtractionError::Selector(e.to_string()))?;
        let document = Html::parse_document(page);
        let node = document
            .select(&selector)
            .next()
            .ok_or_else(|| ExtractionError::NodeMissing(self.node_id.clone()))?;
        let text = node.text().collect::<String>();
        let value: JsonValue =
            serde_json::from_str(text.trim()).map_err(|source| ExtractionError::NodeDecode {
                node_id: self.node_id.clone(),
                source,
            })?;
        items_at(&value, &self.items_path)
    }
}

/// Tries each strategy in order and returns the first success.
pub struct FallbackExtractor {
    strategies: Vec<Box<dyn PayloadExtractor>>,
}

impl FallbackExtractor {
    pub fn new(strategies: Vec<Box<dyn PayloadExtractor>>) -> Self {
        Self { strategies }
    }
}

impl Default for FallbackExtractor {
    fn default() -> Self {
        Self::new(vec![
            Box::<MarkupNodeExtractor>::default(),
            Box::<EmbeddedScriptExtractor>::default(),
        ])
    }
}

impl PayloadExtractor for FallbackExtractor {
    fn name(&self) -> &'static str {
        "auto"
    }

    fn extract(&self, page: &str) -> Result<Vec<JsonValue>, ExtractionError> {
        let mut failures = Vec::with_capacity(self.strategies.len());
        for strategy in &self.strategies {
            match strategy.extract(page) {
                Ok(items) => {
                    debug!(strategy = strategy.name(), items = items.len(), "payload extracted");
                    return Ok(items);
                }
                Err(err) => failures.push(format!("{}: {err}", strategy.name())),
            }
        }
        Err(ExtractionError::NoStrategyMatched(failures))
    }
}

pub fn extractor_for(kind: ExtractorKind) -> Box<dyn PayloadExtractor> {
    match kind {
        ExtractorKind::EmbeddedScript => Box::<EmbeddedScriptExtractor>::default(),
        ExtractorKind::MarkupNode => Box::<MarkupNodeExtractor>::default(),
        ExtractorKind::Auto => Box::<FallbackExtractor>::default(),
    }
}

/// Keep raw items of `category_name` (and `type_filter`, when given) and project
/// them onto [`RewardItem`], preserving feed order. Stock is collapsed to the
/// availability flag. Records that do not fit the model are logged and skipped.
pub fn normalize(
    raw_items: &[JsonValue],
    category_name: &str,
    type_filter: Option<&str>,
) -> Vec<RewardItem> {
    normalize_with_mode(raw_items, category_name, type_filter, StockMode::Availability)
}

pub fn normalize_for_region(
    raw_items: &[JsonValue],
    region: &RegionConfig,
) -> Vec<RewardItem> {
    normalize_with_mode(
        raw_items,
        &region.category_name,
        region.type_filter.as_deref(),
        region.stock_mode,
    )
}

pub fn normalize_with_mode(
    raw_items: &[JsonValue],
    category_name: &str,
    type_filter: Option<&str>,
    stock_mode: StockMode,
) -> Vec<RewardItem> {
    let field = |raw: &JsonValue, name: &str| raw.get(name).and_then(JsonValue::as_str).map(str::to_owned);

    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for (index, raw) in raw_items.iter().enumerate() {
        if field(raw, "category").as_deref() != Some(category_name) {
            continue;
        }
        if let Some(wanted) = type_filter {
            if field(raw, "type").as_deref() != Some(wanted) {
                continue;
            }
        }

        let mut item: RewardItem = match serde_json::from_value(raw.clone()) {
            Ok(item) => item,
            Err(err) => {
                let id = raw.get("id").and_then(JsonValue::as_str).unwrap_or("?");
                warn!(index, id, error = %err, "skipping raw reward that does not fit the model");
                continue;
            }
        };
        if stock_mode == StockMode::Availability {
            item.stock = item.stock.collapse();
        }
        if !seen.insert(item.id.clone()) {
            warn!(id = %item.id, "duplicate reward id in feed; keeping first");
            continue;
        }
        out.push(item);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use mnr_core::{RegionCode, Stock};
    use serde_json::json;

    fn legacy_page(payload: &JsonValue) -> String {
        let literal = serde_json::to_string(&payload.to_string()).unwrap();
        format!(
            "<html><script>\n  window.state = {{\n    embeddedResponses: JSON.parse({literal}),\n    other: 1\n  }};\n</script></html>"
        )
    }

    fn raw(id: &str, category: &str, kind: &str) -> JsonValue {
        json!({
            "id": id, "title": format!("Item {id}"), "category": category, "type": kind,
            "stock": {"remains": 2, "total": 9}, "points": [{"amount": 100, "category": "platinum"}],
            "internalNotes": "dropped"
        })
    }

    #[test]
    fn embedded_script_decodes_double_encoded_payload() {
        let page = legacy_page(&json!({"api_reward_list": {"data": {"items": [raw("a", "nintendo_store", "stocked_code")]}}}));
        let items = EmbeddedScriptExtractor::default().extract(&page).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["id"], "a");
    }

    #[test]
    fn embedded_script_without_marker_is_an_extraction_error() {
        let err = EmbeddedScriptExtractor::default()
            .extract("<html><body>maintenance</body></html>")
            .unwrap_err();
        assert!(matches!(err, ExtractionError::MarkerMissing(EMBEDDED_MARKER)));
    }

    #[test]
    fn embedded_script_rejects_single_encoded_payload() {
        let page = "<script>\n embeddedResponses: JSON.parse({\"api_reward_list\": 1}),\n</script>";
        let err = EmbeddedScriptExtractor::default().extract(page).unwrap_err();
        assert!(matches!(err, ExtractionError::OuterDecode(_)));
    }

    #[test]
    fn markup_node_requires_array_at_path() {
        let page = r#"<html><script id="__NEXT_DATA__" type="application/json">{"props":{"pageProps":{"rewards":{"items":{}}}}}</script></html>"#;
        let err = MarkupNodeExtractor::default().extract(page).unwrap_err();
        assert!(matches!(err, ExtractionError::PathMiss(ref p) if p == "props.pageProps.rewards.items"));

        let err = MarkupNodeExtractor::default().extract("<html></html>").unwrap_err();
        assert!(matches!(err, ExtractionError::NodeMissing(_)));
    }

    #[test]
    fn fallback_reports_every_strategy_failure() {
        let err = FallbackExtractor::default().extract("<html></html>").unwrap_err();
        match err {
            ExtractionError::NoStrategyMatched(failures) => {
                assert_eq!(failures.len(), 2);
                assert!(failures[0].starts_with("markup-node"));
                assert!(failures[1].starts_with("embedded-script"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn normalize_filters_category_and_type_and_keeps_order() {
        let raw_items = vec![
            raw("b", "nintendo_store", "stocked_code"),
            raw("x", "game_content", "stocked_code"),
            raw("a", "nintendo_store", "stocked_code"),
            raw("c", "nintendo_store", "digital"),
        ];

        let all = normalize(&raw_items, "nintendo_store", None);
        assert_eq!(all.iter().map(|i| i.id.as_str()).collect::<Vec<_>>(), ["b", "a", "c"]);
        assert!(all.iter().all(|i| i.category == "nintendo_store"));
        assert_eq!(all[0].stock, Stock::Availability { available: true });

        let stocked = normalize(&raw_items, "nintendo_store", Some("stocked_code"));
        assert_eq!(stocked.len(), 2);
        assert!(stocked.iter().all(|i| i.kind == "stocked_code"));
    }

    #[test]
    fn normalize_for_counted_region_keeps_remaining_counts_and_drops_duplicates() {
        let region = RegionConfig {
            code: RegionCode::new("US"),
            name: "United States".into(),
            category_name: "nintendo_store".into(),
            proxy: None,
            enabled: true,
            extractor: ExtractorKind::EmbeddedScript,
            type_filter: Some("stocked_code".into()),
            stock_mode: StockMode::Counted,
        };
        let raw_items = vec![
            raw("a", "nintendo_store", "stocked_code"),
            raw("a", "nintendo_store", "stocked_code"),
        ];
        let items = normalize_for_region(&raw_items, &region);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].stock, Stock::Counted { remains: 2, total: 9 });
    }

    #[test]
    fn records_that_do_not_fit_are_skipped() {
        let mut odd_points = raw("p", "nintendo_store", "stocked_code");
        odd_points["points"] = json!([{"amount": 10, "category": "silver"}]);
        let raw_items = vec![
            json!({"id": "a", "category": "nintendo_store"}),
            raw("b", "nintendo_store", "stocked_code"),
            odd_points,
        ];
        let items = normalize(&raw_items, "nintendo_store", None);
        assert_eq!(items.iter().map(|i| i.id.as_str()).collect::<Vec<_>>(), ["b"]);

        let only_bad = vec![json!({"id": "a", "category": "nintendo_store"})];
        assert!(normalize(&only_bad, "nintendo_store", None).is_empty());
    }
}
