//! Property equality rules for merging.

use buildmerge_core::Properties;

/// Properties that must always match for two requests to merge.
/// Builders can require more through their merge properties.
pub const BASE_MERGE_PROPERTIES: [&str; 2] = ["force_rebuild", "force_chain_rebuild"];

/// Whether a request with `properties` may merge into an existing request
/// whose buildset has `other`.
///
/// An existing request pinned to a worker never accepts merges. Otherwise
/// every baseline and `merge_properties` name must carry the same value and
/// source on both sides, where absent on both sides counts as equal.
pub fn properties_match(properties: &Properties, other: &Properties, merge_properties: &[String]) -> bool {
    if other.has_selected_slave() {
        return false;
    }

    BASE_MERGE_PROPERTIES
        .iter()
        .copied()
        .chain(merge_properties.iter().map(String::as_str))
        .all(|name| properties.get_with_source(name) == other.get_with_source(name))
}
