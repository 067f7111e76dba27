//! Reference-graph analysis: creation ordering and cycle breaking.
//!
//! The store only accepts a reference once its target exists, so resources
//! must be created targets-first. This module derives the reference graph
//! from link values and inline markup references, then:
//!
//! ```text
//! loop:
//!   peel resources with no remaining forward references  -> ordering
//!   residual non-empty? every residual node sits on a cycle:
//!     Tarjan SCC over the residual graph
//!     per non-trivial SCC, pick the cheapest source->target pair
//!     mark that pair's values for stashing (their edges disappear)
//! ```
//!
//! Stashing a markup value takes all of its references with it, so one cut
//! can remove several edges. Nested cycles are handled by the outer loop:
//! each round removes at least one edge from every remaining cycle cluster,
//! which guarantees termination.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use tracing::{debug, info, warn};

use crate::error::UploadError;
use crate::model::{Resource, ValueBody};

/// Identifies one value inside the batch by position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ValueHandle {
    /// Index into the batch resource list.
    pub resource: usize,
    /// Index into that resource's property list.
    pub property: usize,
    /// Index into that property's value list.
    pub value: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EdgeKind {
    Link,
    Markup,
}

/// One reference edge, with the value it was derived from.
#[derive(Debug, Clone, Copy)]
struct EdgeRef {
    to: usize,
    handle: ValueHandle,
    kind: EdgeKind,
}

/// Orderer output: creation order plus the values that must be deferred.
#[derive(Debug, Default)]
pub struct UploadPlan {
    /// Indices into the batch resource list, in creation order.
    pub order: Vec<usize>,
    /// Link values to remove into the stash.
    pub stash_links: BTreeSet<ValueHandle>,
    /// Markup values whose content is replaced by a placeholder token.
    pub stash_texts: BTreeSet<ValueHandle>,
}

impl UploadPlan {
    pub fn stash_size(&self) -> usize {
        self.stash_links.len() + self.stash_texts.len()
    }
}

/// Analyze the batch and produce an upload plan.
///
/// Fails fast on a link value whose target id does not exist in the batch.
/// Inline markup references to unknown ids are a content condition: they
/// produce no edge and are logged here, then reported again when the value
/// is patched.
pub fn build_plan(resources: &[Resource]) -> Result<UploadPlan, UploadError> {
    let mut index: HashMap<&str, usize> = HashMap::with_capacity(resources.len());
    for (i, resource) in resources.iter().enumerate() {
        index.insert(resource.local_id.as_str(), i);
    }

    let edges = collect_edges(resources, &index)?;
    let edge_count: usize = edges.iter().map(Vec::len).sum();

    let n = resources.len();
    let mut placed = vec![false; n];
    let mut order = Vec::with_capacity(n);
    let mut stashed: HashSet<ValueHandle> = HashSet::new();
    let mut plan = UploadPlan::default();
    let mut rounds = 0usize;

    while order.len() < n {
        // Peel everything whose remaining references all point at placed
        // resources. Passes repeat until a full pass places nothing.
        loop {
            let mut progress = false;
            for i in 0..n {
                if placed[i] {
                    continue;
                }
                let blocked = edges[i]
                    .iter()
                    .any(|e| !placed[e.to] && !stashed.contains(&e.handle));
                if !blocked {
                    placed[i] = true;
                    order.push(i);
                    progress = true;
                }
            }
            if !progress {
                break;
            }
        }
        if order.len() == n {
            break;
        }

        // Residual graph: unplaced nodes, active edges to unplaced targets.
        let mut residual: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut in_degree = vec![0usize; n];
        for i in 0..n {
            if placed[i] {
                continue;
            }
            for e in &edges[i] {
                if !placed[e.to] && !stashed.contains(&e.handle) {
                    residual[i].push(e.to);
                    in_degree[e.to] += 1;
                }
            }
        }

        rounds += 1;
        let mut cut_any = false;
        for scc in strongly_connected(n, &placed, &residual) {
            let has_self_loop = scc.len() == 1 && residual[scc[0]].contains(&scc[0]);
            if scc.len() < 2 && !has_self_loop {
                continue;
            }
            if let Some((source, target)) =
                choose_cut(&scc, &edges, &residual, &in_degree, &placed, &stashed)
            {
                let cut = stash_bundle(source, target, &edges, &mut stashed, &mut plan);
                debug!(
                    source = %resources[source].local_id,
                    target = %resources[target].local_id,
                    values = cut,
                    members = scc.len(),
                    "Deferring references to break a cycle"
                );
                cut_any = true;
            }
        }
        if !cut_any {
            return Err(UploadError::Internal(
                "resources remain blocked but no cycle was found".to_string(),
            ));
        }
    }

    info!(
        resources = n,
        references = edge_count,
        deferred_links = plan.stash_links.len(),
        deferred_texts = plan.stash_texts.len(),
        rounds,
        "Upload order computed"
    );
    plan.order = order;
    Ok(plan)
}

/// Derive reference edges from every link value and markup reference.
fn collect_edges(
    resources: &[Resource],
    index: &HashMap<&str, usize>,
) -> Result<Vec<Vec<EdgeRef>>, UploadError> {
    let mut edges: Vec<Vec<EdgeRef>> = vec![Vec::new(); resources.len()];
    for (ri, resource) in resources.iter().enumerate() {
        for (pi, property) in resource.properties.iter().enumerate() {
            for (vi, value) in property.values.iter().enumerate() {
                let handle = ValueHandle {
                    resource: ri,
                    property: pi,
                    value: vi,
                };
                match &value.body {
                    ValueBody::Link(target) => match index.get(target.as_str()) {
                        Some(&to) => edges[ri].push(EdgeRef {
                            to,
                            handle,
                            kind: EdgeKind::Link,
                        }),
                        None => {
                            return Err(UploadError::DanglingReference {
                                resource: resource.local_id.clone(),
                                property: property.name.clone(),
                                target: target.clone(),
                            })
                        }
                    },
                    ValueBody::Markup(markup) => {
                        for target in markup.refs() {
                            match index.get(target.as_str()) {
                                Some(&to) => edges[ri].push(EdgeRef {
                                    to,
                                    handle,
                                    kind: EdgeKind::Markup,
                                }),
                                None => warn!(
                                    resource_id = %resource.local_id,
                                    property = %property.name,
                                    target = %target,
                                    "Markup references an id outside the batch; kept verbatim"
                                ),
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
    }
    Ok(edges)
}

/// Pick the cheapest source->target pair inside one SCC.
///
/// A source's cost is the number of values that would have to be deferred
/// if it were cut loose, weighed against how many residual references point
/// at it (cutting a popular resource frees more of the graph). Ratios are
/// compared by cross-multiplication to stay in integers; ties fall back to
/// batch order, which makes the choice deterministic.
fn choose_cut(
    scc: &[usize],
    edges: &[Vec<EdgeRef>],
    residual: &[Vec<usize>],
    in_degree: &[usize],
    placed: &[bool],
    stashed: &HashSet<ValueHandle>,
) -> Option<(usize, usize)> {
    let members: HashSet<usize> = scc.iter().copied().collect();
    let mut ordered: Vec<usize> = scc.to_vec();
    ordered.sort_unstable();

    let mut best: Option<(u64, u64, usize, usize)> = None;
    for &u in &ordered {
        let mut handles: BTreeSet<ValueHandle> = BTreeSet::new();
        let mut targets: BTreeSet<usize> = BTreeSet::new();
        for e in &edges[u] {
            if placed[e.to] || stashed.contains(&e.handle) {
                continue;
            }
            handles.insert(e.handle);
            if members.contains(&e.to) && residual[u].contains(&e.to) {
                targets.insert(e.to);
            }
        }
        let cost = handles.len() as u64;
        let gain = (in_degree[u].max(1)) as u64;
        for &v in &targets {
            let better = match best {
                None => true,
                Some((best_cost, best_gain, bu, bv)) => {
                    let lhs = cost * best_gain;
                    let rhs = best_cost * gain;
                    lhs < rhs || (lhs == rhs && (u, v) < (bu, bv))
                }
            };
            if better {
                best = Some((cost, gain, u, v));
            }
        }
    }
    best.map(|(_, _, u, v)| (u, v))
}

/// Mark every value behind the source->target pair as stashed and record it
/// in the plan. Returns how many values were newly marked.
fn stash_bundle(
    source: usize,
    target: usize,
    edges: &[Vec<EdgeRef>],
    stashed: &mut HashSet<ValueHandle>,
    plan: &mut UploadPlan,
) -> usize {
    let mut bundle: BTreeMap<ValueHandle, EdgeKind> = BTreeMap::new();
    for e in &edges[source] {
        if e.to == target && !stashed.contains(&e.handle) {
            bundle.insert(e.handle, e.kind);
        }
    }
    let count = bundle.len();
    for (handle, kind) in bundle {
        stashed.insert(handle);
        match kind {
            EdgeKind::Link => plan.stash_links.insert(handle),
            EdgeKind::Markup => plan.stash_texts.insert(handle),
        };
    }
    count
}

/// Iterative Tarjan over the residual graph. Returns every SCC containing
/// at least one active node; trivial ones are filtered by the caller.
fn strongly_connected(n: usize, placed: &[bool], succ: &[Vec<usize>]) -> Vec<Vec<usize>> {
    let mut visit_index: Vec<Option<usize>> = vec![None; n];
    let mut lowlink = vec![0usize; n];
    let mut on_stack = vec![false; n];
    let mut stack: Vec<usize> = Vec::new();
    let mut next_index = 0usize;
    let mut sccs: Vec<Vec<usize>> = Vec::new();

    for start in 0..n {
        if placed[start] || visit_index[start].is_some() {
            continue;
        }
        let mut frames: Vec<(usize, usize)> = vec![(start, 0)];
        while let Some(&(v, child_ix)) = frames.last() {
            if visit_index[v].is_none() {
                visit_index[v] = Some(next_index);
                lowlink[v] = next_index;
                next_index += 1;
                stack.push(v);
                on_stack[v] = true;
            }
            if child_ix < succ[v].len() {
                if let Some(frame) = frames.last_mut() {
                    frame.1 += 1;
                }
                let w = succ[v][child_ix];
                if visit_index[w].is_none() {
                    frames.push((w, 0));
                } else if on_stack[w] {
                    if let Some(iw) = visit_index[w] {
                        lowlink[v] = lowlink[v].min(iw);
                    }
                }
            } else {
                frames.pop();
                if let Some(parent) = frames.last() {
                    let p = parent.0;
                    lowlink[p] = lowlink[p].min(lowlink[v]);
                }
                if visit_index[v] == Some(lowlink[v]) {
                    let mut scc = Vec::new();
                    while let Some(w) = stack.pop() {
                        on_stack[w] = false;
                        scc.push(w);
                        if w == v {
                            break;
                        }
                    }
                    sccs.push(scc);
                }
            }
        }
    }
    sccs
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Markup, Property, PropertyValue};

    fn value(body: ValueBody) -> PropertyValue {
        PropertyValue {
            body,
            comment: None,
            permissions: None,
        }
    }

    fn resource(id: &str, properties: Vec<Property>) -> Resource {
        Resource {
            local_id: id.to_string(),
            label: id.to_uppercase(),
            type_name: "Thing".to_string(),
            bitstream: None,
            permissions: None,
            created_at: None,
            legacy_iri: None,
            legacy_ark: None,
            properties,
        }
    }

    fn link_res(id: &str, prop: &str, targets: &[&str]) -> Resource {
        resource(
            id,
            vec![Property {
                name: prop.to_string(),
                values: targets
                    .iter()
                    .map(|t| value(ValueBody::Link(t.to_string())))
                    .collect(),
            }],
        )
    }

    fn markup_res(id: &str, prop: &str, html: &str) -> Resource {
        resource(
            id,
            vec![Property {
                name: prop.to_string(),
                values: vec![value(ValueBody::Markup(Markup::new(html)))],
            }],
        )
    }

    fn position(plan: &UploadPlan, idx: usize) -> usize {
        plan.order
            .iter()
            .position(|&i| i == idx)
            .expect("resource missing from ordering")
    }

    /// Every non-stashed link edge must point backwards in the ordering.
    fn assert_order_valid(resources: &[Resource], plan: &UploadPlan) {
        let index: HashMap<&str, usize> = resources
            .iter()
            .enumerate()
            .map(|(i, r)| (r.local_id.as_str(), i))
            .collect();
        for (ri, res) in resources.iter().enumerate() {
            for (pi, prop) in res.properties.iter().enumerate() {
                for (vi, val) in prop.values.iter().enumerate() {
                    let handle = ValueHandle {
                        resource: ri,
                        property: pi,
                        value: vi,
                    };
                    if plan.stash_links.contains(&handle) || plan.stash_texts.contains(&handle) {
                        continue;
                    }
                    if let Some(target) = val.link_target() {
                        let ti = index[target];
                        assert!(
                            position(plan, ti) < position(plan, ri),
                            "link {} -> {} violates ordering",
                            res.local_id,
                            target
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_acyclic_chain_passthrough() {
        let batch = vec![
            link_res("a", "points_to", &["b"]),
            link_res("b", "points_to", &["c"]),
            resource("c", vec![]),
        ];
        let plan = build_plan(&batch).unwrap();
        assert_eq!(plan.stash_size(), 0);
        assert_eq!(plan.order.len(), 3);
        assert_order_valid(&batch, &plan);
    }

    #[test]
    fn test_two_cycle_stashes_exactly_one_edge() {
        let batch = vec![
            link_res("a", "points_to", &["b"]),
            link_res("b", "points_to", &["a"]),
        ];
        let plan = build_plan(&batch).unwrap();
        assert_eq!(plan.stash_size(), 1);
        assert_eq!(plan.order.len(), 2);
        assert_order_valid(&batch, &plan);
    }

    #[test]
    fn test_self_reference_is_stashed_not_fatal() {
        let batch = vec![link_res("a", "points_to", &["a"])];
        let plan = build_plan(&batch).unwrap();
        assert_eq!(plan.stash_links.len(), 1);
        assert_eq!(plan.order, vec![0]);
    }

    #[test]
    fn test_dangling_link_is_fatal() {
        let batch = vec![link_res("a", "points_to", &["ghost"])];
        let err = build_plan(&batch).unwrap_err();
        match err {
            UploadError::DanglingReference {
                resource, target, ..
            } => {
                assert_eq!(resource, "a");
                assert_eq!(target, "ghost");
            }
            other => panic!("expected dangling reference, got {other}"),
        }
    }

    #[test]
    fn test_dangling_markup_ref_is_not_fatal() {
        let batch = vec![markup_res("a", "notes", "<a href=\"local:ghost\">?</a>")];
        let plan = build_plan(&batch).unwrap();
        assert_eq!(plan.stash_size(), 0);
        assert_eq!(plan.order, vec![0]);
    }

    #[test]
    fn test_nested_cycles_resolve_over_rounds() {
        // a <-> b and b <-> c share the node b.
        let batch = vec![
            link_res("a", "points_to", &["b"]),
            resource(
                "b",
                vec![Property {
                    name: "points_to".to_string(),
                    values: vec![
                        value(ValueBody::Link("a".to_string())),
                        value(ValueBody::Link("c".to_string())),
                    ],
                }],
            ),
            link_res("c", "points_to", &["b"]),
        ];
        let plan = build_plan(&batch).unwrap();
        assert_eq!(plan.order.len(), 3);
        assert_order_valid(&batch, &plan);
        assert_eq!(plan.stash_size(), 2, "each cycle needs its own cut");
    }

    #[test]
    fn test_cheaper_source_is_cut() {
        // a carries three link values toward b; b answers with one.
        let batch = vec![
            link_res("a", "points_to", &["b", "b", "b"]),
            link_res("b", "points_to", &["a"]),
        ];
        let plan = build_plan(&batch).unwrap();
        assert_eq!(plan.stash_links.len(), 1);
        let handle = plan.stash_links.iter().next().copied().unwrap();
        assert_eq!(handle.resource, 1, "the single-value side is cheaper");
    }

    #[test]
    fn test_markup_cut_takes_phantom_edges_along() {
        // a's one markup value points at both b and c; stashing it for the
        // a<->b cycle must also clear the a->c edge.
        let batch = vec![
            markup_res(
                "a",
                "notes",
                "<a href=\"local:b\">b</a> <a href=\"local:c\">c</a>",
            ),
            link_res("b", "points_to", &["a"]),
            link_res("c", "points_to", &["a"]),
        ];
        let plan = build_plan(&batch).unwrap();
        assert_eq!(plan.order.len(), 3);
        assert_order_valid(&batch, &plan);
        // One markup stash clears both cycles at once.
        assert_eq!(plan.stash_size(), 1);
        assert_eq!(plan.stash_texts.len(), 1);
    }

    #[test]
    fn test_reordering_is_idempotent() {
        let batch = vec![
            link_res("a", "points_to", &["b"]),
            link_res("b", "points_to", &["c"]),
            link_res("c", "points_to", &["a"]),
        ];
        let first = build_plan(&batch).unwrap();
        let second = build_plan(&batch).unwrap();
        assert_eq!(first.stash_size(), second.stash_size());
        assert_eq!(first.order, second.order);
    }

    #[test]
    fn test_empty_batch() {
        let plan = build_plan(&[]).unwrap();
        assert!(plan.order.is_empty());
        assert_eq!(plan.stash_size(), 0);
    }
}
