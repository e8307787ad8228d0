use conclave_providers::ClientManager;
use conclave_types::{CollaborationMode, PhaseState};

use crate::phases;

/// Nodes of the phase graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Node {
    Evaluate,
    GenerateInquiry,
    Planning,
    DebateCollaborate,
    ReviewCollaborate,
    Integrate,
    End,
}

type EdgeFn = fn(&PhaseState) -> Node;

/// Small interpreter over the phase graph: each node owns one predicate that
/// picks the successor from the current state. The only cycle is the
/// collaboration node's self-loop.
#[derive(Clone)]
pub struct PipelineGraph {
    edges: Vec<(Node, EdgeFn)>,
}

impl PipelineGraph {
    pub fn new() -> Self {
        let edges: Vec<(Node, EdgeFn)> = vec![
            (Node::Evaluate, |state| {
                if state.need_inquiry {
                    Node::GenerateInquiry
                } else {
                    Node::Planning
                }
            }),
            (Node::GenerateInquiry, |_| Node::End),
            (Node::Planning, |state| match state.collaboration_mode {
                CollaborationMode::Review => Node::ReviewCollaborate,
                CollaborationMode::Debate => Node::DebateCollaborate,
            }),
            (Node::DebateCollaborate, |state| {
                if state.should_stop {
                    Node::Integrate
                } else {
                    Node::DebateCollaborate
                }
            }),
            (Node::ReviewCollaborate, |state| {
                if state.should_stop {
                    Node::Integrate
                } else {
                    Node::ReviewCollaborate
                }
            }),
            (Node::Integrate, |_| Node::End),
        ];
        Self { edges }
    }

    pub fn entry(&self) -> Node {
        Node::Evaluate
    }

    pub fn next(&self, from: Node, state: &PhaseState) -> Node {
        self.edges
            .iter()
            .find(|(node, _)| *node == from)
            .map(|(_, edge)| edge(state))
            .unwrap_or(Node::End)
    }
}

impl Default for PipelineGraph {
    fn default() -> Self {
        Self::new()
    }
}

/// Where the foreground run paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreludeOutcome {
    /// Questions generated; the task waits for the user.
    Inquiry,
    /// Information is sufficient; planning onwards belongs to the worker.
    Processing,
}

/// Runs the foreground part of the graph (phases 0-1) against `state`,
/// stopping at the inquiry pause or just before planning.
pub async fn run_prelude(
    graph: &PipelineGraph,
    manager: &ClientManager,
    state: &mut PhaseState,
) -> PreludeOutcome {
    let entry = graph.entry();
    let delta = phases::evaluate(manager, state).await;
    state.apply(delta);

    match graph.next(entry, state) {
        Node::GenerateInquiry => {
            let delta = phases::generate_inquiry(manager, state).await;
            state.apply(delta);
            PreludeOutcome::Inquiry
        }
        _ => PreludeOutcome::Processing,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> PhaseState {
        PhaseState::new("t-1", "u-1", "topic-analysis", "hello")
    }

    #[test]
    fn evaluate_branches_on_need_inquiry() {
        let graph = PipelineGraph::new();
        let mut s = state();
        s.need_inquiry = true;
        assert_eq!(graph.next(Node::Evaluate, &s), Node::GenerateInquiry);
        s.need_inquiry = false;
        assert_eq!(graph.next(Node::Evaluate, &s), Node::Planning);
    }

    #[test]
    fn planning_branches_on_mode() {
        let graph = PipelineGraph::new();
        let mut s = state();
        s.collaboration_mode = CollaborationMode::Debate;
        assert_eq!(graph.next(Node::Planning, &s), Node::DebateCollaborate);
        s.collaboration_mode = CollaborationMode::Review;
        assert_eq!(graph.next(Node::Planning, &s), Node::ReviewCollaborate);
    }

    #[test]
    fn collaboration_loops_until_stop() {
        let graph = PipelineGraph::new();
        let mut s = state();
        assert_eq!(
            graph.next(Node::DebateCollaborate, &s),
            Node::DebateCollaborate
        );
        s.should_stop = true;
        assert_eq!(graph.next(Node::DebateCollaborate, &s), Node::Integrate);
        assert_eq!(graph.next(Node::ReviewCollaborate, &s), Node::Integrate);
    }

    #[test]
    fn inquiry_and_integration_terminate() {
        let graph = PipelineGraph::new();
        let s = state();
        assert_eq!(graph.next(Node::GenerateInquiry, &s), Node::End);
        assert_eq!(graph.next(Node::Integrate, &s), Node::End);
    }
}
