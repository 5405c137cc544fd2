//! Rank changes between two snapshots of the same user, category and window.

use std::collections::HashMap;

use crate::models::RankedItem;

/// Compare `current` against `previous` by item id.
///
/// Items found in `previous` get `position_change = previous - current`
/// (positive when the item climbed) and `is_new = false`; the rest are marked
/// new without a change. The output follows `current` order. Duplicate ids in
/// `previous` are not supported.
pub fn compute_deltas(current: &[RankedItem], previous: &[RankedItem]) -> Vec<RankedItem> {
    let previous_positions: HashMap<&str, i32> = previous
        .iter()
        .map(|item| (item.id.as_str(), item.position))
        .collect();

    current
        .iter()
        .map(|item| match previous_positions.get(item.id.as_str()) {
            Some(&previous_position) => RankedItem {
                id: item.id.clone(),
                position: item.position,
                position_change: Some(previous_position - item.position),
                is_new: false,
            },
            None => RankedItem::new(item.id.clone(), item.position),
        })
        .collect()
}

/// Every item new, used when there is no history to compare against.
pub fn mark_all_new(current: &[RankedItem]) -> Vec<RankedItem> {
    current
        .iter()
        .map(|item| RankedItem::new(item.id.clone(), item.position))
        .collect()
}
