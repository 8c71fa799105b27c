//! Path search over the schema relation graph.
//!
//! A breadth-first search walks backward from a target entity over the
//! reversed relation graph, subject to a required ordered subsequence of
//! named relations, an exclusion set, and a no-backtrack rule. Branch
//! constraints are resolved by the cartesian product of each branch's
//! candidates, all attached to the convergence point.

use std::collections::{BTreeSet, VecDeque};

use crate::model::{RelTup, Schema};

use super::{AlgebraError, AlgebraResult, Path};

/// Depth bound for the search; paths deeper than this are treated as
/// nonexistent rather than explored forever.
const MAX_SEARCH_DEPTH: usize = 16;

/// One branch constraint for [`find_branched`]: where the branch starts
/// and which relations it must traverse (ordered from the convergence
/// point outward, same as [`Path::via`]).
#[derive(Debug, Clone)]
pub struct BranchSpec {
    pub source: String,
    pub required: Vec<String>,
}

struct SearchState {
    entity: String,
    /// Steps in traversal order: index 0 is terminal-adjacent.
    walked: Vec<RelTup>,
    used: BTreeSet<String>,
    matched: usize,
}

/// Find paths from `source` to `target`, searching backward from the
/// target over the reversed relation graph.
///
/// * `required` - relation names that must appear, in traversal order
///   (from the target outward toward the source).
/// * `excluded` - relations that may never be used.
/// * `allow_backtrack` - permit reusing an edge already used earlier in
///   the same path.
///
/// All minimal-depth candidates are returned; when several exist and a
/// required sequence was given, candidates whose outermost steps exactly
/// match the required suffix are preferred (exact-suffix tie break).
pub fn find_paths(
    schema: &Schema,
    source: &str,
    target: &str,
    required: &[&str],
    excluded: &BTreeSet<String>,
    allow_backtrack: bool,
) -> AlgebraResult<Vec<Path>> {
    schema.entity(source)?;
    schema.entity(target)?;

    if source == target && required.is_empty() {
        return Ok(vec![Path::to(target)]);
    }

    let mut queue: VecDeque<SearchState> = VecDeque::new();
    queue.push_back(SearchState {
        entity: target.to_string(),
        walked: vec![],
        used: BTreeSet::new(),
        matched: 0,
    });

    let mut results: Vec<Path> = Vec::new();
    let mut result_depth: Option<usize> = None;

    while let Some(state) = queue.pop_front() {
        if let Some(depth) = result_depth {
            // Only sibling candidates at the minimal depth are collected.
            if state.walked.len() >= depth {
                break;
            }
        }
        if state.walked.len() >= MAX_SEARCH_DEPTH {
            continue;
        }

        // Reversed-graph expansion: edges whose target is the current
        // entity, moving toward their source.
        for rel in schema.relations_into(&state.entity) {
            if excluded.contains(&rel.name) {
                continue;
            }
            if !allow_backtrack && state.used.contains(&rel.name) {
                continue;
            }
            let position = required.iter().position(|r| *r == rel.name);
            let matched = match position {
                Some(pos) if pos == state.matched => state.matched + 1,
                // Using a later requirement early would break the order.
                Some(_) => continue,
                None => state.matched,
            };

            let mut walked = state.walked.clone();
            walked.push(rel.tup());
            let mut used = state.used.clone();
            used.insert(rel.name.clone());

            let next = SearchState {
                entity: rel.source.clone(),
                walked,
                used,
                matched,
            };

            if next.entity == source && next.matched == required.len() {
                result_depth.get_or_insert(next.walked.len());
                let mut steps = next.walked.clone();
                steps.reverse();
                results.push(Path::from_steps(steps, target));
            } else {
                queue.push_back(next);
            }
        }
    }

    if results.is_empty() {
        return Err(AlgebraError::NoPath {
            from: source.into(),
            to: target.into(),
        });
    }

    if results.len() > 1 && !required.is_empty() {
        let exact: Vec<Path> = results
            .iter()
            .filter(|path| {
                let steps = path.steps();
                // Terminal-adjacent steps sit at the end of the step list;
                // required[0] is matched first when walking from the target.
                steps.len() >= required.len()
                    && steps
                        .iter()
                        .rev()
                        .take(required.len())
                        .zip(required.iter())
                        .all(|(step, want)| step.name == **want)
            })
            .cloned()
            .collect();
        if !exact.is_empty() {
            return Ok(exact);
        }
    }

    Ok(results)
}

/// Resolve branch constraints converging on `target`: each branch's
/// candidate paths are found independently, then every combination is
/// attached to the convergence point.
pub fn find_branched(
    schema: &Schema,
    target: &str,
    branches: &[BranchSpec],
) -> AlgebraResult<Vec<Path>> {
    let mut candidates: Vec<Vec<Path>> = Vec::with_capacity(branches.len());
    for branch in branches {
        let required: Vec<&str> = branch.required.iter().map(|s| s.as_str()).collect();
        candidates.push(find_paths(
            schema,
            &branch.source,
            target,
            &required,
            &BTreeSet::new(),
            false,
        )?);
    }

    let mut out = Vec::new();
    for combo in cartesian_product(&candidates) {
        let mut path = Path::to(target);
        for branch in combo {
            path = path.with_branch(branch.clone())?;
        }
        out.push(path);
    }
    Ok(out)
}

/// All combinations picking one element from each input list.
pub fn cartesian_product<'a, T>(lists: &'a [Vec<T>]) -> Vec<Vec<&'a T>> {
    let mut combos: Vec<Vec<&T>> = vec![vec![]];
    for list in lists {
        let mut next = Vec::with_capacity(combos.len() * list.len());
        for combo in &combos {
            for item in list {
                let mut extended = combo.clone();
                extended.push(item);
                next.push(extended);
            }
        }
        combos = next;
    }
    combos
}
