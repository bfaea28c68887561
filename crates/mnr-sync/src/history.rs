//! Stock history compaction and new-reward detection.

use std::collections::{BTreeMap, HashSet};

use mnr_core::{HistoryPoint, RegionSnapshot, RewardHistory, RewardItem};

/// Fold the current items into `previous`.
///
/// A point is appended for an id only when its stock level differs from the
/// last recorded one; ids missing from `current_items` lose their series.
/// Applying the same inputs twice yields the same history.
pub fn reconcile_history(
    previous: &RewardHistory,
    current_items: &[RewardItem],
    timestamp: i64,
) -> RewardHistory {
    let mut series: BTreeMap<String, Vec<HistoryPoint>> = BTreeMap::new();

    for item in current_items {
        let level = item.stock.level();
        let points = series
            .entry(item.id.clone())
            .or_insert_with(|| previous.series.get(&item.id).cloned().unwrap_or_default());
        if points.last().map(|p| p.stock) != Some(level) {
            points.push(HistoryPoint {
                timestamp,
                stock: level,
            });
        }
    }

    RewardHistory { series }
}

/// Ids present in `after` but not in `before`, in `after` order.
pub fn new_reward_ids<'a>(before: &RegionSnapshot, after: &'a RegionSnapshot) -> Vec<&'a str> {
    let known = before.reward_ids();
    let mut seen = HashSet::new();
    after
        .rewards
        .iter()
        .map(|r| r.id.as_str())
        .filter(|id| !known.contains(id) && seen.insert(*id))
        .collect()
}

pub fn first_new_reward<'a>(
    before: &RegionSnapshot,
    after: &'a RegionSnapshot,
) -> Option<&'a RewardItem> {
    let known = before.reward_ids();
    after.rewards.iter().find(|r| !known.contains(r.id.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mnr_core::{Images, Links, Stock, StockLevel};

    fn item(id: &str, remains: i64) -> RewardItem {
        RewardItem {
            id: id.to_string(),
            title: format!("Reward {id}"),
            category: "nintendo_store".into(),
            kind: "stocked_code".into(),
            begins_at: None,
            ends_at: None,
            stock: Stock::Counted { remains, total: 10 },
            points: vec![],
            links: Links::default(),
            images: Images::default(),
        }
    }

    fn history(entries: &[(&str, &[(i64, i64)])]) -> RewardHistory {
        RewardHistory {
            series: entries
                .iter()
                .map(|(id, points)| {
                    (
                        id.to_string(),
                        points
                            .iter()
                            .map(|(t, s)| HistoryPoint {
                                timestamp: *t,
                                stock: StockLevel::Remaining(*s),
                            })
                            .collect(),
                    )
                })
                .collect(),
        }
    }

    fn snapshot(ids: &[&str]) -> RegionSnapshot {
        RegionSnapshot {
            last_updated_at: 0,
            rewards: ids.iter().map(|id| item(id, 1)).collect(),
        }
    }

    #[test]
    fn unchanged_stock_appends_nothing() {
        let previous = history(&[("A", &[(100, 5)])]);
        let result = reconcile_history(&previous, &[item("A", 5)], 200);
        assert_eq!(result, previous);
    }

    #[test]
    fn changed_stock_appends_a_point() {
        let previous = history(&[("A", &[(100, 5)])]);
        let result = reconcile_history(&previous, &[item("A", 3)], 200);
        assert_eq!(result, history(&[("A", &[(100, 5), (200, 3)])]));
    }

    #[test]
    fn new_ids_start_a_series_and_missing_ids_are_pruned() {
        let previous = history(&[("A", &[(100, 5)]), ("B", &[(100, 1), (150, 0)])]);
        let result = reconcile_history(&previous, &[item("A", 5), item("C", 7)], 200);
        assert!(!result.series.contains_key("B"));
        assert_eq!(result.series_for("C"), Some(&[HistoryPoint { timestamp: 200, stock: StockLevel::Remaining(7) }][..]));
        assert_eq!(result.series_for("A").map(<[_]>::len), Some(1));
    }

    #[test]
    fn reconcile_is_idempotent() {
        let previous = history(&[("A", &[(100, 5)]), ("B", &[(100, 2)])]);
        let items = [item("A", 4), item("C", 1)];
        let once = reconcile_history(&previous, &items, 300);
        let twice = reconcile_history(&once, &items, 300);
        assert_eq!(once, twice);
        let later = reconcile_history(&once, &items, 900);
        assert_eq!(once, later);
    }

    #[test]
    fn duplicate_ids_in_one_run_do_not_double_append() {
        let result = reconcile_history(&RewardHistory::default(), &[item("A", 2), item("A", 2)], 50);
        assert_eq!(result, history(&[("A", &[(50, 2)])]));
    }

    #[test]
    fn availability_flip_is_recorded() {
        let mut available = item("A", 1);
        available.stock = Stock::Availability { available: true };
        let first = reconcile_history(&RewardHistory::default(), &[available.clone()], 10);
        available.stock = Stock::Availability { available: false };
        let second = reconcile_history(&first, &[available], 20);
        let levels: Vec<_> = second.series["A"].iter().map(|p| p.stock).collect();
        assert_eq!(levels, [StockLevel::Available(true), StockLevel::Available(false)]);
    }

    #[test]
    fn existing_ids_are_never_new_even_when_fields_change() {
        let before = snapshot(&["A", "B"]);
        let mut after = snapshot(&["B", "A", "C"]);
        after.rewards[1].title = "Renamed".into();
        after.rewards[1].stock = Stock::Counted { remains: 0, total: 10 };
        assert_eq!(new_reward_ids(&before, &after), ["C"]);
        assert_eq!(first_new_reward(&before, &after).map(|r| r.id.as_str()), Some("C"));
        assert!(first_new_reward(&after, &before).is_none());
    }
}
