//! Display filter: the subscriber-side predicate selecting renderable
//! envelopes.
//!
//! The hub broadcasts every directive to every caster; this is the only
//! place routing happens.

use bk_protocol::targets_all;

/// True when a directive targeting `targets` should be rendered by a caster
/// displaying `display_monitor_ids`.
///
/// A directive is rendered iff it targets `"ALL"` or shares at least one
/// monitor ID with the caster's display set.
pub fn is_displayed(targets: &[String], display_monitor_ids: &[String]) -> bool {
    targets_all(targets)
        || targets
            .iter()
            .any(|t| display_monitor_ids.iter().any(|d| d == t))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn all_sentinel_matches_any_display_set() {
        assert!(is_displayed(&ids(&["ALL"]), &ids(&["m-1"])));
        assert!(is_displayed(&ids(&["ALL"]), &[]));
    }

    #[test]
    fn intersection_matches() {
        assert!(is_displayed(&ids(&["m-1", "m-2"]), &ids(&["m-2", "m-9"])));
    }

    #[test]
    fn disjoint_sets_do_not_match() {
        assert!(!is_displayed(&ids(&["m-1"]), &ids(&["m-2"])));
    }

    #[test]
    fn empty_display_set_renders_nothing_but_all() {
        assert!(!is_displayed(&ids(&["m-1"]), &[]));
        assert!(is_displayed(&ids(&["m-1", "ALL"]), &[]));
    }

    #[test]
    fn sentinel_is_case_sensitive() {
        assert!(!is_displayed(&ids(&["all"]), &[]));
    }
}
