//! Step reference graph for workflow definitions.
//!
//! Nodes are steps, stored in a petgraph arena in declaration order. Edges
//! are every way control can move from one step to another:
//! - sequential: step `i` to step `i + 1`
//! - `on_error` jump targets
//! - approval `on_reject` jump targets
//! - conditional branch targets and the `default` target
//!
//! A definition is only runnable if this graph is acyclic. Cycle detection
//! is an explicit iterative DFS over a visit-state array so deep graphs
//! never recurse.

use std::collections::HashMap;

use agentflow_types::workflow::{StepKind, WorkflowDefinition};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Bfs;

use super::definition::DefinitionError;

/// Why one step can hand control to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    Sequential,
    OnError,
    OnReject,
    Branch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// Arena of steps indexed by id, with control-flow edges.
#[derive(Debug)]
pub struct StepGraph {
    graph: DiGraph<String, EdgeKind>,
    index: HashMap<String, NodeIndex>,
}

impl StepGraph {
    /// Build the graph. Fails on the first reference to an unknown step.
    ///
    /// Step ids are assumed unique; duplicates are rejected earlier by
    /// `validate_definition`.
    pub fn build(def: &WorkflowDefinition) -> Result<Self, DefinitionError> {
        let mut graph = DiGraph::with_capacity(def.steps.len(), def.steps.len() * 2);
        let mut index = HashMap::with_capacity(def.steps.len());
        for step in &def.steps {
            let node = graph.add_node(step.id.clone());
            index.insert(step.id.clone(), node);
        }

        let mut this = Self { graph, index };
        for (i, step) in def.steps.iter().enumerate() {
            if let Some(next) = def.steps.get(i + 1) {
                this.connect(&step.id, "next", &next.id, EdgeKind::Sequential)?;
            }
            if let Some(target) = step.on_error.target() {
                this.connect(&step.id, "on_error", target, EdgeKind::OnError)?;
            }
            match &step.kind {
                StepKind::Conditional(cond) => {
                    for branch in &cond.branches {
                        this.connect(&step.id, "branch", &branch.target, EdgeKind::Branch)?;
                    }
                    if let Some(default) = &cond.default {
                        this.connect(&step.id, "default", default, EdgeKind::Branch)?;
                    }
                }
                StepKind::Approval(approval) => {
                    if let Some(target) = approval.on_reject.as_ref().and_then(|p| p.target()) {
                        this.connect(&step.id, "on_reject", target, EdgeKind::OnReject)?;
                    }
                }
                StepKind::Agent(_) | StepKind::Parallel(_) | StepKind::Loop(_) => {}
            }
        }
        Ok(this)
    }

    fn connect(
        &mut self,
        from: &str,
        field: &'static str,
        to: &str,
        kind: EdgeKind,
    ) -> Result<(), DefinitionError> {
        let (Some(&a), Some(&b)) = (self.index.get(from), self.index.get(to)) else {
            return Err(DefinitionError::UnknownReference {
                step: from.to_string(),
                field,
                target: to.to_string(),
            });
        };
        self.graph.add_edge(a, b, kind);
        Ok(())
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Successors in edge insertion order.
    fn successors(&self, node: NodeIndex) -> Vec<NodeIndex> {
        // `neighbors` yields newest edges first; popping from the end of this
        // vector visits them oldest first.
        self.graph.neighbors(node).collect()
    }

    /// Return one cycle as a list of step ids (first id repeated at the end),
    /// or `None` if the graph is acyclic.
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let mut marks = vec![Mark::Unvisited; self.graph.node_count()];

        for start in self.graph.node_indices() {
            if marks[start.index()] != Mark::Unvisited {
                continue;
            }
            marks[start.index()] = Mark::InProgress;
            let mut stack: Vec<(NodeIndex, Vec<NodeIndex>)> = vec![(start, self.successors(start))];

            while let Some(frame) = stack.last_mut() {
                let node = frame.0;
                match frame.1.pop() {
                    Some(next) => match marks[next.index()] {
                        Mark::Unvisited => {
                            marks[next.index()] = Mark::InProgress;
                            stack.push((next, self.successors(next)));
                        }
                        Mark::InProgress => {
                            let from = stack.iter().position(|(n, _)| *n == next).unwrap_or(0);
                            let mut path: Vec<String> = stack[from..]
                                .iter()
                                .map(|(n, _)| self.graph[*n].clone())
                                .collect();
                            path.push(self.graph[next].clone());
                            return Some(path);
                        }
                        Mark::Done => {}
                    },
                    None => {
                        marks[node.index()] = Mark::Done;
                        stack.pop();
                    }
                }
            }
        }
        None
    }

    /// Step ids that cannot be reached from `entry`, in declaration order.
    pub fn unreachable_from(&self, entry: &str) -> Vec<String> {
        let Some(&start) = self.index.get(entry) else {
            return Vec::new();
        };
        let mut seen = vec![false; self.graph.node_count()];
        let mut bfs = Bfs::new(&self.graph, start);
        while let Some(node) = bfs.next(&self.graph) {
            seen[node.index()] = true;
        }
        self.graph
            .node_indices()
            .filter(|n| !seen[n.index()])
            .map(|n| self.graph[n].clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(json: &str) -> WorkflowDefinition {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_linear_chain_is_acyclic() {
        let d = def(
            r#"{"id":"wf","steps":[
                {"id":"a","type":"agent","agent_id":"x"},
                {"id":"b","type":"agent","agent_id":"x"},
                {"id":"c","type":"agent","agent_id":"x"}]}"#,
        );
        let graph = StepGraph::build(&d).unwrap();
        assert_eq!(graph.node_count(), 3);
        assert_eq!(graph.edge_count(), 2);
        assert!(graph.find_cycle().is_none());
    }

    #[test]
    fn test_backward_on_error_jump_is_cycle() {
        let d = def(
            r#"{"id":"wf","steps":[
                {"id":"a","type":"agent","agent_id":"x"},
                {"id":"b","type":"agent","agent_id":"x","on_error":"a"}]}"#,
        );
        let cycle = StepGraph::build(&d).unwrap().find_cycle().unwrap();
        assert_eq!(cycle, vec!["a", "b", "a"]);
    }

    #[test]
    fn test_self_reference_is_cycle() {
        let d = def(r#"{"id":"wf","steps":[{"id":"a","type":"agent","agent_id":"x","on_error":"a"}]}"#);
        let cycle = StepGraph::build(&d).unwrap().find_cycle().unwrap();
        assert_eq!(cycle, vec!["a", "a"]);
    }

    #[test]
    fn test_conditional_back_edge_is_cycle() {
        let d = def(
            r#"{"id":"wf","steps":[
                {"id":"draft","type":"agent","agent_id":"x"},
                {"id":"check","type":"conditional","condition_source":"${previous}",
                 "branches":{"retry":"draft"},"default":"publish"},
                {"id":"publish","type":"agent","agent_id":"x"}]}"#,
        );
        let cycle = StepGraph::build(&d).unwrap().find_cycle().unwrap();
        assert_eq!(cycle.first(), cycle.last());
        assert!(cycle.contains(&"check".to_string()));
        assert!(cycle.contains(&"draft".to_string()));
    }

    #[test]
    fn test_forward_branches_are_acyclic() {
        let d = def(
            r#"{"id":"wf","steps":[
                {"id":"check","type":"conditional","condition_source":"${user_input}",
                 "branches":{"urgent":"escalate"},"default":"normal"},
                {"id":"normal","type":"agent","agent_id":"x","on_error":"escalate"},
                {"id":"escalate","type":"agent","agent_id":"y"}]}"#,
        );
        assert!(StepGraph::build(&d).unwrap().find_cycle().is_none());
    }

    #[test]
    fn test_unknown_target_rejected_at_build() {
        let d = def(r#"{"id":"wf","steps":[{"id":"a","type":"agent","agent_id":"x","on_error":"ghost"}]}"#);
        let err = StepGraph::build(&d).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("ghost") && msg.contains("on_error"), "got: {msg}");
    }

    #[test]
    fn test_unreachable_from_entry() {
        let d = def(
            r#"{"id":"wf","entry_step":"b","steps":[
                {"id":"a","type":"agent","agent_id":"x"},
                {"id":"b","type":"agent","agent_id":"x"}]}"#,
        );
        let graph = StepGraph::build(&d).unwrap();
        assert_eq!(graph.unreachable_from("b"), vec!["a"]);
        assert!(graph.unreachable_from("a").is_empty());
    }
}
