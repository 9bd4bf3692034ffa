//! Topological ordering of collected records.
//!
//! Kahn's algorithm over the record dependency graph, with edges pointing
//! dependency -> dependent. Ties break deterministically (table name, then
//! key tuple). A cycle cannot be ordered; when the ready set runs dry the
//! smallest remaining identifier is force-emitted and flagged so the replay
//! writer can defer constraint checking around those rows.

use std::collections::{BTreeMap, BTreeSet};

use tracing::warn;

use crate::graph::{RecordData, RecordIdentifier};

/// The sorted order plus the identifiers that had to be emitted with
/// unresolved dependencies.
#[derive(Debug, Clone)]
pub struct SortOutcome {
    pub ordered: Vec<RecordIdentifier>,
    pub cycle_members: BTreeSet<RecordIdentifier>,
}

impl SortOutcome {
    pub fn has_cycles(&self) -> bool {
        !self.cycle_members.is_empty()
    }
}

/// Order records so every dependency precedes its dependents. Dependencies
/// on identifiers outside the set are ignored.
pub fn topo_sort(records: &BTreeMap<RecordIdentifier, RecordData>) -> SortOutcome {
    let mut in_degree: BTreeMap<&RecordIdentifier, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<&RecordIdentifier, Vec<&RecordIdentifier>> = BTreeMap::new();

    for (id, record) in records {
        in_degree.entry(id).or_insert(0);
        for dep in &record.dependencies {
            // Self-dependencies are unresolvable by ordering alone, and
            // external dependencies are outside this run's scope.
            if dep == id || !records.contains_key(dep) {
                continue;
            }
            *in_degree.entry(id).or_insert(0) += 1;
            dependents.entry(dep).or_default().push(id);
        }
    }

    let mut ready: BTreeSet<&RecordIdentifier> = in_degree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut remaining: BTreeSet<&RecordIdentifier> = records.keys().collect();
    let mut ordered = Vec::with_capacity(records.len());
    let mut cycle_members = BTreeSet::new();

    // Records whose own row references itself also need deferral.
    for (id, record) in records {
        if record.dependencies.contains(id) {
            cycle_members.insert(id.clone());
        }
    }

    while !remaining.is_empty() {
        if let Some(next) = ready.pop_first() {
            if !remaining.remove(next) {
                continue;
            }
            ordered.push(next.clone());
            if let Some(deps) = dependents.get(next) {
                for &dependent in deps {
                    if let Some(deg) = in_degree.get_mut(dependent) {
                        *deg = deg.saturating_sub(1);
                        if *deg == 0 && remaining.contains(dependent) {
                            ready.insert(dependent);
                        }
                    }
                }
            }
        } else {
            // Cycle: break it at the smallest remaining identifier.
            let next = remaining
                .iter()
                .next()
                .cloned()
                .expect("remaining is non-empty");
            remaining.remove(next);
            warn!("dependency cycle broken at {}", next);
            cycle_members.insert(next.clone());
            ordered.push(next.clone());
            if let Some(deps) = dependents.get(next) {
                for &dependent in deps {
                    if let Some(deg) = in_degree.get_mut(dependent) {
                        *deg = deg.saturating_sub(1);
                        if *deg == 0 && remaining.contains(dependent) {
                            ready.insert(dependent);
                        }
                    }
                }
            }
        }
    }

    SortOutcome {
        ordered,
        cycle_members,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{PkValue, RecordData};
    use crate::schema::TableRef;
    use std::collections::BTreeMap as Map;

    fn ident(table: &str, pk: i64) -> RecordIdentifier {
        RecordIdentifier::new(TableRef::new("public", table), vec![PkValue::Int(pk)])
    }

    fn record(id: &RecordIdentifier, deps: &[&RecordIdentifier]) -> RecordData {
        let mut r = RecordData::new(id.clone(), Map::new());
        for d in deps {
            r.dependencies.insert((*d).clone());
        }
        r
    }

    fn sort(records: Vec<RecordData>) -> SortOutcome {
        let map: BTreeMap<_, _> = records
            .into_iter()
            .map(|r| (r.identifier.clone(), r))
            .collect();
        topo_sort(&map)
    }

    fn position(outcome: &SortOutcome, id: &RecordIdentifier) -> usize {
        outcome.ordered.iter().position(|o| o == id).unwrap()
    }

    #[test]
    fn test_empty_set() {
        let outcome = sort(vec![]);
        assert!(outcome.ordered.is_empty());
        assert!(!outcome.has_cycles());
    }

    #[test]
    fn test_single_record_no_dependencies() {
        let a = ident("users", 1);
        let outcome = sort(vec![record(&a, &[])]);
        assert_eq!(outcome.ordered, vec![a]);
    }

    #[test]
    fn test_linear_chain() {
        // a depends on b depends on c; expected order c, b, a.
        let a = ident("a", 1);
        let b = ident("b", 2);
        let c = ident("c", 3);
        let outcome = sort(vec![
            record(&a, &[&b]),
            record(&b, &[&c]),
            record(&c, &[]),
        ]);
        assert!(position(&outcome, &c) < position(&outcome, &b));
        assert!(position(&outcome, &b) < position(&outcome, &a));
        assert!(!outcome.has_cycles());
    }

    #[test]
    fn test_diamond() {
        let top = ident("top", 1);
        let left = ident("left", 2);
        let right = ident("right", 3);
        let base = ident("base", 4);
        let outcome = sort(vec![
            record(&top, &[&left, &right]),
            record(&left, &[&base]),
            record(&right, &[&base]),
            record(&base, &[]),
        ]);
        assert!(position(&outcome, &base) < position(&outcome, &left));
        assert!(position(&outcome, &base) < position(&outcome, &right));
        assert!(position(&outcome, &left) < position(&outcome, &top));
        assert!(position(&outcome, &right) < position(&outcome, &top));
    }

    #[test]
    fn test_external_dependencies_ignored() {
        let a = ident("internal", 1);
        let external = ident("external", 999);
        let outcome = sort(vec![record(&a, &[&external])]);
        assert_eq!(outcome.ordered, vec![a]);
        assert!(!outcome.has_cycles());
    }

    #[test]
    fn test_two_node_cycle_flagged_and_complete() {
        let a = ident("categories", 10);
        let b = ident("categories", 11);
        let outcome = sort(vec![record(&a, &[&b]), record(&b, &[&a])]);
        assert_eq!(outcome.ordered.len(), 2);
        assert!(outcome.has_cycles());
        // Broken at the smallest identifier.
        assert_eq!(outcome.ordered[0], a);
        assert!(outcome.cycle_members.contains(&a));
    }

    #[test]
    fn test_self_reference_flagged() {
        let a = ident("categories", 10);
        let outcome = sort(vec![record(&a, &[&a])]);
        assert_eq!(outcome.ordered, vec![a.clone()]);
        assert!(outcome.cycle_members.contains(&a));
    }

    #[test]
    fn test_cycle_does_not_poison_rest() {
        // x <-> y cycle plus independent chain c -> d.
        let x = ident("x", 1);
        let y = ident("y", 2);
        let c = ident("c", 3);
        let d = ident("d", 4);
        let outcome = sort(vec![
            record(&x, &[&y]),
            record(&y, &[&x]),
            record(&c, &[]),
            record(&d, &[&c]),
        ]);
        assert_eq!(outcome.ordered.len(), 4);
        assert!(position(&outcome, &c) < position(&outcome, &d));
        // Only the forced node is flagged, not the chain.
        assert!(!outcome.cycle_members.contains(&c));
        assert!(!outcome.cycle_members.contains(&d));
    }

    #[test]
    fn test_deterministic_tie_break() {
        // Three independent records: emitted in identifier order.
        let r1 = ident("banks", 1);
        let r2 = ident("roles", 2);
        let r3 = ident("users", 3);
        let outcome = sort(vec![record(&r3, &[]), record(&r1, &[]), record(&r2, &[])]);
        assert_eq!(outcome.ordered, vec![r1, r2, r3]);
    }

    #[test]
    fn test_duplicate_seed_dedup_shape() {
        // A record appearing once with two dependents is emitted once.
        let shared = ident("roles", 2);
        let u3 = ident("users", 3);
        let u4 = ident("users", 4);
        let outcome = sort(vec![
            record(&shared, &[]),
            record(&u3, &[&shared]),
            record(&u4, &[&shared]),
        ]);
        assert_eq!(
            outcome.ordered.iter().filter(|o| **o == shared).count(),
            1
        );
        assert!(position(&outcome, &shared) < position(&outcome, &u3));
        assert!(position(&outcome, &shared) < position(&outcome, &u4));
    }
}
