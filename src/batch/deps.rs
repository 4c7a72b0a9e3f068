//! Issue dependency graph: body parsing and level-ordered topological sort.
//!
//! Dependencies are declared in issue bodies as `depends on #N` or
//! `blocked by #N` (case-insensitive, comma lists allowed). The sort is
//! Kahn's algorithm grouped into levels: each level is the set of issues
//! whose remaining in-degree reached zero together, so a batch can run a
//! whole level in parallel.

use crate::errors::GraphError;
use regex::Regex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::LazyLock;

static DEPS_CLAUSE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:depends on|blocked by)\s+(#\d+(?:\s*,\s*#\d+)*)").unwrap()
});

static ISSUE_REF: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"#(\d+)").unwrap());

/// Issue numbers referenced by dependency clauses in `body`, deduplicated
/// and ascending.
pub fn parse_deps(body: &str) -> Vec<u64> {
    let mut found = BTreeSet::new();
    for clause in DEPS_CLAUSE.captures_iter(body) {
        for reference in ISSUE_REF.captures_iter(&clause[1]) {
            if let Ok(number) = reference[1].parse::<u64>() {
                found.insert(number);
            }
        }
    }
    found.into_iter().collect()
}

/// Topologically sort `nodes` into parallelizable levels.
///
/// Dependencies on numbers outside `nodes` are treated as already resolved
/// (external). Nodes within a level are ascending for determinism. A cycle
/// yields an error whose message walks the cycle, e.g.
/// `dependency cycle: #1 → #2 → #1`.
pub fn topsort(
    nodes: &[u64],
    deps: &HashMap<u64, Vec<u64>>,
) -> Result<Vec<Vec<u64>>, GraphError> {
    let node_set: HashSet<u64> = nodes.iter().copied().collect();

    // Per-node dependency sets restricted to the input set.
    let remaining: HashMap<u64, BTreeSet<u64>> = nodes
        .iter()
        .map(|&n| {
            let internal = deps
                .get(&n)
                .map(|d| d.iter().copied().filter(|d| node_set.contains(d)).collect())
                .unwrap_or_default();
            (n, internal)
        })
        .collect();

    let mut pending: BTreeSet<u64> = node_set.iter().copied().collect();
    let mut resolved: HashSet<u64> = HashSet::new();
    let mut levels = Vec::new();

    while !pending.is_empty() {
        // BTreeSet iteration keeps each level ascending.
        let ready: Vec<u64> = pending
            .iter()
            .copied()
            .filter(|n| remaining[n].iter().all(|d| resolved.contains(d)))
            .collect();

        if ready.is_empty() {
            return Err(cycle_error(&pending, &remaining, &resolved));
        }

        for n in &ready {
            pending.remove(n);
            resolved.insert(*n);
        }
        levels.push(ready);
    }

    Ok(levels)
}

/// Walk the residual graph from the smallest stuck node to produce a
/// readable cycle path.
fn cycle_error(
    pending: &BTreeSet<u64>,
    remaining: &HashMap<u64, BTreeSet<u64>>,
    resolved: &HashSet<u64>,
) -> GraphError {
    let start = *pending.iter().next().expect("cycle implies stuck nodes");
    let mut path = vec![start];
    let mut seen = HashSet::from([start]);
    let mut current = start;

    loop {
        let next = remaining[&current]
            .iter()
            .copied()
            .find(|d| !resolved.contains(d));
        match next {
            Some(n) if seen.contains(&n) => {
                path.push(n);
                break;
            }
            Some(n) => {
                path.push(n);
                seen.insert(n);
                current = n;
            }
            None => break,
        }
    }

    // Trim the lead-in so the path starts where the cycle closes.
    if let Some(&last) = path.last()
        && let Some(first_idx) = path.iter().position(|&n| n == last)
        && first_idx + 1 < path.len()
    {
        path.drain(..first_idx);
    }

    let rendered = path
        .iter()
        .map(|n| format!("#{n}"))
        .collect::<Vec<_>>()
        .join(" → ");
    GraphError::Cycle { path: rendered }
}

/// Issues transitively blocked by `failed`, via a reverse walk over the
/// forward deps map. Ascending for stable reporting.
pub fn blocked_downstream(failed: u64, deps: &HashMap<u64, Vec<u64>>) -> Vec<u64> {
    let mut reverse: HashMap<u64, Vec<u64>> = HashMap::new();
    for (&issue, issue_deps) in deps {
        for &dep in issue_deps {
            reverse.entry(dep).or_default().push(issue);
        }
    }

    let mut blocked = BTreeSet::new();
    let mut queue = vec![failed];
    while let Some(current) = queue.pop() {
        for &dependent in reverse.get(&current).map(Vec::as_slice).unwrap_or(&[]) {
            if blocked.insert(dependent) {
                queue.push(dependent);
            }
        }
    }
    blocked.into_iter().collect()
}
