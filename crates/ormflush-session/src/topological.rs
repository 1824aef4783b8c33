//! Topological sorting of dependency graphs into execution trees.
//!
//! Used twice by a flush: once over mapper-level task nodes and once, for a
//! task whose mapper depends on itself, over the individual instances in that
//! task. Both sorts are deterministic: among nodes that are ready at the same
//! time, the one listed first in the input goes first.

use std::collections::{BTreeSet, HashMap};
use std::fmt::Debug;
use std::hash::Hash;

/// A node of a sorted dependency tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeNode<N> {
    pub item: N,
    /// Indices into [`SortedTree::nodes`] of the nodes that run after this one.
    pub children: Vec<usize>,
    /// The node depends on itself.
    pub circular: bool,
}

/// Result of [`sort_tree`]: every node exactly once, parents before children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortedTree<N> {
    pub nodes: Vec<TreeNode<N>>,
    pub roots: Vec<usize>,
}

impl<N: Clone> SortedTree<N> {
    /// Items in depth-first pre-order, the order the tree executes in.
    pub fn preorder(&self) -> Vec<N> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<usize> = self.roots.iter().rev().copied().collect();
        while let Some(idx) = stack.pop() {
            let node = &self.nodes[idx];
            out.push(node.item.clone());
            stack.extend(node.children.iter().rev().copied());
        }
        out
    }
}

struct Graph<'a, N> {
    items: &'a [N],
    /// item index -> indices of the items that must come after it
    successors: Vec<Vec<usize>>,
    /// item index -> indices of the items it must come after
    predecessors: Vec<Vec<usize>>,
    self_loops: Vec<bool>,
}

impl<'a, N: Clone + Eq + Hash + Debug> Graph<'a, N> {
    fn build(items: &'a [N], edges: &[(N, N)]) -> Self {
        let index: HashMap<&N, usize> = items.iter().enumerate().map(|(i, n)| (n, i)).collect();
        let mut successors = vec![Vec::new(); items.len()];
        let mut predecessors = vec![Vec::new(); items.len()];
        let mut self_loops = vec![false; items.len()];

        for (from, to) in edges {
            let (Some(&a), Some(&b)) = (index.get(from), index.get(to)) else {
                tracing::trace!(from = ?from, to = ?to, "Ignoring edge to an unsorted node");
                continue;
            };
            if a == b {
                self_loops[a] = true;
            } else if !successors[a].contains(&b) {
                successors[a].push(b);
                predecessors[b].push(a);
            }
        }

        Self {
            items,
            successors,
            predecessors,
            self_loops,
        }
    }

    /// Kahn's algorithm; ties go to the lowest input index.
    fn order(&self) -> Result<Vec<usize>, Vec<N>> {
        let mut indegree: Vec<usize> = self.predecessors.iter().map(Vec::len).collect();
        let mut ready: BTreeSet<usize> = indegree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| i)
            .collect();
        let mut out = Vec::with_capacity(self.items.len());

        while let Some(idx) = ready.pop_first() {
            out.push(idx);
            for &succ in &self.successors[idx] {
                indegree[succ] -= 1;
                if indegree[succ] == 0 {
                    ready.insert(succ);
                }
            }
        }

        if out.len() == self.items.len() {
            Ok(out)
        } else {
            let remaining: Vec<bool> = indegree.iter().map(|d| *d > 0).collect();
            Err(self.cycle_among(&remaining))
        }
    }

    /// Find one cycle among the flagged nodes, as a path that returns to its start.
    fn cycle_among(&self, candidates: &[bool]) -> Vec<N> {
        // Iterative DFS with colors: 0 unvisited, 1 on stack, 2 done.
        let mut color = vec![0u8; self.items.len()];
        for start in 0..self.items.len() {
            if !candidates[start] || color[start] != 0 {
                continue;
            }
            let mut path: Vec<usize> = vec![start];
            let mut cursor: Vec<usize> = vec![0];
            color[start] = 1;
            while let Some(&node) = path.last() {
                let pos = cursor.len() - 1;
                let succs = &self.successors[node];
                let mut next = None;
                while cursor[pos] < succs.len() {
                    let s = succs[cursor[pos]];
                    cursor[pos] += 1;
                    if candidates[s] && color[s] != 2 {
                        next = Some(s);
                        break;
                    }
                }
                match next {
                    Some(succ) => {
                        if color[succ] == 1 {
                            let begin = path.iter().position(|p| *p == succ).unwrap_or(0);
                            let mut cycle: Vec<N> =
                                path[begin..].iter().map(|i| self.items[*i].clone()).collect();
                            cycle.push(self.items[succ].clone());
                            return cycle;
                        }
                        color[succ] = 1;
                        path.push(succ);
                        cursor.push(0);
                    }
                    None => {
                        color[node] = 2;
                        path.pop();
                        cursor.pop();
                    }
                }
            }
        }
        candidates
            .iter()
            .enumerate()
            .filter(|(_, c)| **c)
            .map(|(i, _)| self.items[i].clone())
            .collect()
    }
}

/// Sort `items` so that for every edge `(a, b)`, `a` precedes `b`.
///
/// Self-loops are ignored. On a cycle, returns its members as a closed path.
pub fn sort<N: Clone + Eq + Hash + Debug>(items: &[N], edges: &[(N, N)]) -> Result<Vec<N>, Vec<N>> {
    let graph = Graph::build(items, edges);
    let order = graph.order()?;
    Ok(order.into_iter().map(|i| items[i].clone()).collect())
}

/// Find one cycle in the graph, if any. Self-loops do not count.
pub fn find_cycle<N: Clone + Eq + Hash + Debug>(items: &[N], edges: &[(N, N)]) -> Option<Vec<N>> {
    sort(items, edges).err()
}

/// Sort into a tree: each node hangs beneath its latest-ordered dependency.
///
/// If some node's dependencies do not all lie on one root path the tree
/// degrades to a chain in topological order. Nodes with a self-loop are
/// flagged `circular`.
pub fn sort_tree<N: Clone + Eq + Hash + Debug>(
    items: &[N],
    edges: &[(N, N)],
) -> Result<SortedTree<N>, Vec<N>> {
    let graph = Graph::build(items, edges);
    let order = graph.order()?;

    let mut position = vec![0usize; items.len()];
    for (pos, idx) in order.iter().enumerate() {
        position[*idx] = pos;
    }

    // tree parent of each item, by item index
    let mut parent: Vec<Option<usize>> = vec![None; items.len()];
    let mut is_chain = false;
    for &idx in &order {
        let preds = &graph.predecessors[idx];
        let Some(&latest) = preds.iter().max_by_key(|p| position[**p]) else {
            continue;
        };
        let mut on_path = vec![latest];
        let mut cur = parent[latest];
        while let Some(p) = cur {
            on_path.push(p);
            cur = parent[p];
        }
        if preds.iter().any(|p| !on_path.contains(p)) {
            is_chain = true;
            break;
        }
        parent[idx] = Some(latest);
    }

    if is_chain {
        tracing::trace!(nodes = items.len(), "Dependency tree degraded to a chain");
        parent = vec![None; items.len()];
        for pair in order.windows(2) {
            parent[pair[1]] = Some(pair[0]);
        }
    }

    // Node slots follow topological order so children stay in sorted order.
    let mut slot = vec![0usize; items.len()];
    let mut nodes = Vec::with_capacity(items.len());
    for (pos, &idx) in order.iter().enumerate() {
        slot[idx] = pos;
        nodes.push(TreeNode {
            item: items[idx].clone(),
            children: Vec::new(),
            circular: graph.self_loops[idx],
        });
    }
    let mut roots = Vec::new();
    for &idx in &order {
        match parent[idx] {
            Some(p) => nodes[slot[p]].children.push(slot[idx]),
            None => roots.push(slot[idx]),
        }
    }

    Ok(SortedTree { nodes, roots })
}
