//! Task graph construction and planning with cycle detection.

use std::collections::{BTreeSet, HashMap};

use crate::error::EngineError;
use crate::task::{EdgeKind, TaskId, TaskNode};

#[derive(Debug, Clone, Default)]
struct Edges {
    depends_on: BTreeSet<usize>,
    finalized_by: BTreeSet<usize>,
    must_run_after: BTreeSet<usize>,
}

/// All task nodes of one invocation and the edges between them.
#[derive(Debug, Default)]
pub struct TaskGraph {
    nodes: Vec<TaskNode>,
    edges: Vec<Edges>,
    index: HashMap<TaskId, usize>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node.
    ///
    /// # Errors
    /// Returns `EngineError::DuplicateTask` if the identifier is already registered.
    pub fn add_task(&mut self, node: TaskNode) -> Result<(), EngineError> {
        if self.index.contains_key(&node.id) {
            return Err(EngineError::DuplicateTask {
                id: node.id.to_string(),
            });
        }
        self.index.insert(node.id.clone(), self.nodes.len());
        self.nodes.push(node);
        self.edges.push(Edges::default());
        Ok(())
    }

    /// Add an edge `from --kind--> to`.
    ///
    /// Adding the same edge twice is a no-op.
    ///
    /// # Errors
    /// Returns `EngineError::UnknownTask` if either end is not registered.
    pub fn add_edge(&mut self, from: &TaskId, to: &TaskId, kind: EdgeKind) -> Result<(), EngineError> {
        let from_idx = self.require(from, "")?;
        let to_idx = self.require(to, &format!(" (target of {kind} from {from})"))?;
        let Some(edges) = self.edges.get_mut(from_idx) else {
            return Err(unknown(from, ""));
        };
        let set = match kind {
            EdgeKind::DependsOn => &mut edges.depends_on,
            EdgeKind::FinalizedBy => &mut edges.finalized_by,
            EdgeKind::MustRunAfter => &mut edges.must_run_after,
        };
        set.insert(to_idx);
        Ok(())
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.index.contains_key(id)
    }

    pub fn get(&self, id: &TaskId) -> Option<&TaskNode> {
        self.index.get(id).and_then(|&idx| self.nodes.get(idx))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All nodes in registration order.
    pub fn nodes(&self) -> impl Iterator<Item = &TaskNode> {
        self.nodes.iter()
    }

    /// Direct targets of `id` over edges of `kind`.
    pub fn targets(&self, id: &TaskId, kind: EdgeKind) -> Vec<&TaskId> {
        let Some(edges) = self.index.get(id).and_then(|&idx| self.edges.get(idx)) else {
            return Vec::new();
        };
        let set = match kind {
            EdgeKind::DependsOn => &edges.depends_on,
            EdgeKind::FinalizedBy => &edges.finalized_by,
            EdgeKind::MustRunAfter => &edges.must_run_after,
        };
        set.iter()
            .filter_map(|&idx| self.nodes.get(idx).map(|n| &n.id))
            .collect()
    }

    pub(crate) fn node_at(&self, idx: usize) -> Option<&TaskNode> {
        self.nodes.get(idx)
    }

    fn require(&self, id: &TaskId, context: &str) -> Result<usize, EngineError> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| unknown(id, context))
    }

    /// Compute the execution plan for `requested`.
    ///
    /// # Algorithm
    /// 1. Closure of the requested nodes over `dependsOn`, `mustRunAfter` and
    ///    `finalizedBy` edges, iterated to a fixpoint so finalizers bring in
    ///    their own dependencies (and their finalizers).
    /// 2. Ordering edges among planned nodes: dependency → dependent,
    ///    `mustRunAfter` target → source, finalized node → finalizer.
    /// 3. DFS with three-colour marking (white→gray→black) over predecessors;
    ///    a gray hit is a cycle, post-order is a topological order.
    ///
    /// # Errors
    /// Returns `EngineError::UnknownTask` for an unknown requested id and
    /// `EngineError::CycleDetected` with the offending node sequence if the
    /// planned nodes contain an ordering cycle.
    pub fn plan(&self, requested: &[TaskId]) -> Result<Plan<'_>, EngineError> {
        let mut in_plan = vec![false; self.nodes.len()];
        let mut worklist = Vec::new();
        for id in requested {
            worklist.push(self.require(id, "")?);
        }
        while let Some(idx) = worklist.pop() {
            let Some(flag) = in_plan.get_mut(idx) else {
                continue;
            };
            if *flag {
                continue;
            }
            *flag = true;
            if let Some(edges) = self.edges.get(idx) {
                worklist.extend(edges.depends_on.iter().copied());
                worklist.extend(edges.must_run_after.iter().copied());
                worklist.extend(edges.finalized_by.iter().copied());
            }
        }

        // Predecessors over ordering edges, restricted to planned nodes.
        let mut preds: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); self.nodes.len()];
        for (idx, edges) in self.edges.iter().enumerate() {
            if !in_plan.get(idx).copied().unwrap_or(false) {
                continue;
            }
            let set = preds.get_mut(idx);
            if let Some(set) = set {
                set.extend(edges.depends_on.iter().copied());
                set.extend(edges.must_run_after.iter().copied());
            }
            for &finalizer in &edges.finalized_by {
                if let Some(set) = preds.get_mut(finalizer) {
                    set.insert(idx);
                }
            }
        }

        let mut color = vec![0u8; self.nodes.len()];
        let mut topo = Vec::new();
        for idx in 0..self.nodes.len() {
            if in_plan.get(idx).copied().unwrap_or(false) {
                let mut stack = Vec::new();
                self.visit(idx, &preds, &mut color, &mut topo, &mut stack)?;
            }
        }

        Ok(Plan::new(self, requested.to_vec(), topo, &preds))
    }

    fn visit(
        &self,
        idx: usize,
        preds: &[BTreeSet<usize>],
        color: &mut [u8],
        topo: &mut Vec<usize>,
        stack: &mut Vec<usize>,
    ) -> Result<(), EngineError> {
        match color.get(idx).copied().unwrap_or(0) {
            2 => return Ok(()),
            1 => {
                let start = stack.iter().position(|&n| n == idx).unwrap_or(0);
                let cycle = stack
                    .get(start..)
                    .unwrap_or(stack.as_slice())
                    .iter()
                    .chain(std::iter::once(&idx))
                    .filter_map(|&n| self.nodes.get(n).map(|node| node.id.to_string()))
                    .collect::<Vec<_>>()
                    .join(" -> ");
                return Err(EngineError::CycleDetected { cycle });
            }
            _ => {}
        }

        if let Some(c) = color.get_mut(idx) {
            *c = 1;
        }
        stack.push(idx);
        if let Some(node_preds) = preds.get(idx) {
            for &pred in node_preds {
                self.visit(pred, preds, color, topo, stack)?;
            }
        }
        stack.pop();
        if let Some(c) = color.get_mut(idx) {
            *c = 2;
        }
        topo.push(idx);
        Ok(())
    }
}

fn unknown(id: &TaskId, context: &str) -> EngineError {
    EngineError::UnknownTask {
        name: id.to_string(),
        context: context.to_owned(),
    }
}

/// One planned node, with edges expressed as positions within the plan.
#[derive(Debug, Clone, Default)]
pub(crate) struct PlannedTask {
    /// Index of the node in the graph.
    pub node: usize,
    /// `dependsOn` predecessors (failure propagates from these).
    pub depends_on: Vec<usize>,
    /// Every ordering predecessor: dependencies, `mustRunAfter` targets, finalized nodes.
    pub preds: Vec<usize>,
    /// Nodes this node finalizes.
    pub finalizes: Vec<usize>,
}

/// A validated, topologically ordered set of nodes to execute.
#[derive(Debug)]
pub struct Plan<'g> {
    graph: &'g TaskGraph,
    requested: Vec<TaskId>,
    tasks: Vec<PlannedTask>,
}

impl<'g> Plan<'g> {
    fn new(
        graph: &'g TaskGraph,
        requested: Vec<TaskId>,
        topo: Vec<usize>,
        preds: &[BTreeSet<usize>],
    ) -> Self {
        let mut position = vec![usize::MAX; graph.nodes.len()];
        for (pos, &idx) in topo.iter().enumerate() {
            if let Some(slot) = position.get_mut(idx) {
                *slot = pos;
            }
        }
        let local = |idx: &usize| position.get(*idx).copied().filter(|&p| p != usize::MAX);

        let mut tasks: Vec<PlannedTask> = topo
            .iter()
            .map(|&idx| {
                let edges = graph.edges.get(idx).cloned().unwrap_or_default();
                PlannedTask {
                    node: idx,
                    depends_on: edges.depends_on.iter().filter_map(local).collect(),
                    preds: preds
                        .get(idx)
                        .map(|p| p.iter().filter_map(local).collect())
                        .unwrap_or_default(),
                    finalizes: Vec::new(),
                }
            })
            .collect();

        for pos in 0..tasks.len() {
            let node = tasks.get(pos).map_or(usize::MAX, |t| t.node);
            let finalizers: Vec<usize> = graph
                .edges
                .get(node)
                .map(|e| e.finalized_by.iter().filter_map(local).collect())
                .unwrap_or_default();
            for f in finalizers {
                if let Some(t) = tasks.get_mut(f) {
                    t.finalizes.push(pos);
                }
            }
        }

        Self {
            graph,
            requested,
            tasks,
        }
    }

    pub fn graph(&self) -> &'g TaskGraph {
        self.graph
    }

    pub fn requested(&self) -> &[TaskId] {
        &self.requested
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Planned nodes in topological order.
    pub fn nodes(&self) -> impl Iterator<Item = &'g TaskNode> + '_ {
        self.tasks
            .iter()
            .filter_map(|t| self.graph.node_at(t.node))
    }

    pub fn task_ids(&self) -> Vec<&'g TaskId> {
        self.nodes().map(|n| &n.id).collect()
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.nodes().any(|n| &n.id == id)
    }

    /// Position of `id` in the topological order.
    pub fn position(&self, id: &TaskId) -> Option<usize> {
        self.nodes().position(|n| &n.id == id)
    }

    pub(crate) fn planned(&self) -> &[PlannedTask] {
        &self.tasks
    }
}
