//! Queue list resolution
//!
//! A worker's queue pattern mixes literals, `*` wildcards and `!`
//! exclusions. Literals keep their position; wildcard regions expand to the
//! matching live queues in uniformly random order; exclusions thin the pool
//! wildcards draw from without ever removing a literal.

use rand::seq::SliceRandom;
use regex::Regex;

use crate::error::ResqResult;
use crate::queue;
use crate::store::Store;

/// Whether resolving this pattern requires the live queue registry
pub fn needs_live_queues(pattern: &[String]) -> bool {
    pattern
        .iter()
        .any(|entry| entry.contains('*') || entry.starts_with('!'))
}

fn wildcard_regex(pattern: &str) -> Regex {
    let escaped = regex::escape(pattern).replace(r"\*", ".*");
    Regex::new(&format!("^{}$", escaped)).expect("escaped pattern is always valid")
}

/// Expand a queue pattern against a snapshot of the live queue set.
///
/// A pattern with neither wildcards nor exclusions resolves to itself
/// without consulting the snapshot.
pub fn resolve(pattern: &[String], live: &[String]) -> Vec<String> {
    if !needs_live_queues(pattern) {
        return pattern.to_vec();
    }

    let mut pool: Vec<String> = live.to_vec();
    pool.shuffle(&mut rand::rng());

    let exclusions: Vec<Regex> = pattern
        .iter()
        .filter(|entry| entry.starts_with('!'))
        .map(|entry| wildcard_regex(&entry[1..]))
        .collect();
    pool.retain(|name| !exclusions.iter().any(|re| re.is_match(name)));

    let mut resolved = Vec::new();
    for entry in pattern {
        if entry.starts_with('!') {
            continue;
        }
        if entry.contains('*') {
            let re = wildcard_regex(entry);
            let mut matched = Vec::new();
            pool.retain(|name| {
                if re.is_match(name) {
                    matched.push(name.clone());
                    false
                } else {
                    true
                }
            });
            resolved.extend(matched);
        } else {
            resolved.push(entry.clone());
            pool.retain(|name| name != entry);
        }
    }
    resolved
}

/// Resolve a worker's pattern against the live registry.
///
/// Redis is only consulted when the pattern actually needs the registry.
pub async fn resolved_queues(store: &Store, pattern: &[String]) -> ResqResult<Vec<String>> {
    if !needs_live_queues(pattern) {
        return Ok(pattern.to_vec());
    }
    let live = queue::queues(store).await?;
    Ok(resolve(pattern, &live))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_plain_literals_skip_the_registry() {
        let pattern = strings(&["high", "default", "low"]);
        assert!(!needs_live_queues(&pattern));
        // an absurd live set proves the snapshot is ignored
        let live = strings(&["other"]);
        assert_eq!(resolve(&pattern, &live), pattern);
    }

    #[test]
    fn test_wildcard_expands_to_live_queues() {
        let pattern = strings(&["*"]);
        let live = strings(&["a", "b", "c"]);
        let mut resolved = resolve(&pattern, &live);
        resolved.sort();
        assert_eq!(resolved, strings(&["a", "b", "c"]));
    }

    #[test]
    fn test_priority_pattern_with_exclusions() {
        let pattern = strings(&["system:high", "*:high", "*", "system:low", "!*:low"]);
        let live = strings(&["system:high", "a:high", "b", "c:low", "system:low"]);
        let resolved = resolve(&pattern, &live);

        // literals hold their positions, exclusions thin the wildcard pool
        assert_eq!(resolved, strings(&["system:high", "a:high", "b", "system:low"]));
        assert!(!resolved.contains(&"c:low".to_string()));
    }

    #[test]
    fn test_excluded_literal_is_still_served() {
        let pattern = strings(&["system:low", "!*:low"]);
        let live = strings(&["system:low", "c:low"]);
        assert_eq!(resolve(&pattern, &live), strings(&["system:low"]));
    }

    #[test]
    fn test_literal_positions_are_stable_across_runs() {
        let pattern = strings(&["head", "*:mid", "tail"]);
        let live = strings(&["a:mid", "b:mid", "c:mid", "head", "tail"]);

        for _ in 0..32 {
            let resolved = resolve(&pattern, &live);
            assert_eq!(resolved.len(), 5);
            assert_eq!(resolved[0], "head");
            assert_eq!(resolved[4], "tail");
            let mut mids = resolved[1..4].to_vec();
            mids.sort();
            assert_eq!(mids, strings(&["a:mid", "b:mid", "c:mid"]));
        }
    }

    #[test]
    fn test_literal_consumes_its_queue_from_the_pool() {
        let pattern = strings(&["b", "*"]);
        let live = strings(&["a", "b"]);
        let resolved = resolve(&pattern, &live);
        // "b" is served once, by the literal
        assert_eq!(resolved.iter().filter(|q| q.as_str() == "b").count(), 1);
        assert_eq!(resolved[0], "b");
        assert!(resolved.contains(&"a".to_string()));
    }

    #[test]
    fn test_wildcard_matching_is_anchored() {
        let pattern = strings(&["mail*"]);
        let live = strings(&["mail", "mailers", "blackmail"]);
        let mut resolved = resolve(&pattern, &live);
        resolved.sort();
        assert_eq!(resolved, strings(&["mail", "mailers"]));
    }
}
