//! Graph queries and validation over a workflow definition.

use std::collections::{BTreeSet, HashMap};

use crate::error::{AppError, AppResult};
use crate::workflow::types::{Node, NodeId, NodeKind, Pipeline, Workflow};

impl Workflow {
    pub fn node(&self, id: NodeId) -> AppResult<&Node> {
        self.nodes
            .get(&id)
            .ok_or_else(|| AppError::NotFound(format!("node {} in workflow {}", id, self.name)))
    }

    pub fn root(&self) -> AppResult<&Node> {
        self.node(self.root_id)
    }

    pub fn pipeline(&self, id: i64) -> AppResult<&Pipeline> {
        self.pipelines
            .get(&id)
            .ok_or_else(|| AppError::NotFound(format!("pipeline {} in workflow {}", id, self.name)))
    }

    /// Direct parents: nodes that trigger `id`, plus the declared parents of a join.
    pub fn parents(&self, id: NodeId) -> Vec<NodeId> {
        let mut parents: Vec<NodeId> = self
            .nodes
            .values()
            .filter(|n| n.triggers.contains(&id))
            .map(|n| n.id)
            .collect();
        if let Some(Node {
            kind: NodeKind::Join { parents: declared },
            ..
        }) = self.nodes.get(&id)
        {
            for parent in declared {
                if !parents.contains(parent) {
                    parents.push(*parent);
                }
            }
        }
        parents
    }

    /// Every node from which `id` is reachable.
    pub fn ancestors(&self, id: NodeId) -> BTreeSet<NodeId> {
        let mut seen = BTreeSet::new();
        let mut stack = self.parents(id);
        while let Some(current) = stack.pop() {
            if seen.insert(current) {
                stack.extend(self.parents(current));
            }
        }
        seen
    }

    /// Join nodes in ID order.
    pub fn joins(&self) -> impl Iterator<Item = (&Node, &[NodeId])> {
        self.nodes.values().filter_map(|n| match &n.kind {
            NodeKind::Join { parents } => Some((n, parents.as_slice())),
            _ => None,
        })
    }

    /// Check the DAG is runnable before a run snapshot is taken.
    pub fn validate(&self) -> AppResult<()> {
        self.root()?;

        for node in self.nodes.values() {
            for child in &node.triggers {
                if !self.nodes.contains_key(child) {
                    return Err(AppError::Validation(format!(
                        "node '{}' triggers unknown node {}",
                        node.name, child
                    )));
                }
            }
            match &node.kind {
                NodeKind::Pipeline { pipeline_id } => {
                    self.pipeline(*pipeline_id).map_err(|_| {
                        AppError::Validation(format!(
                            "node '{}' references unknown pipeline {}",
                            node.name, pipeline_id
                        ))
                    })?;
                }
                NodeKind::Join { parents } => {
                    if parents.len() < 2 {
                        return Err(AppError::Validation(format!(
                            "join '{}' needs at least two parents",
                            node.name
                        )));
                    }
                    if let Some(missing) = parents.iter().find(|p| !self.nodes.contains_key(p)) {
                        return Err(AppError::Validation(format!(
                            "join '{}' references unknown parent {}",
                            node.name, missing
                        )));
                    }
                }
                NodeKind::Fork | NodeKind::OutgoingHook(_) => {}
            }
        }

        self.check_acyclic()
    }

    fn check_acyclic(&self) -> AppResult<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        let mut children: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        for node in self.nodes.values() {
            children.entry(node.id).or_default().extend(&node.triggers);
            if let NodeKind::Join { parents } = &node.kind {
                for parent in parents {
                    children.entry(*parent).or_default().push(node.id);
                }
            }
        }

        let mut marks: HashMap<NodeId, Mark> = HashMap::new();
        for start in self.nodes.keys() {
            if marks.contains_key(start) {
                continue;
            }
            // (node, index of next child to visit)
            let mut stack = vec![(*start, 0usize)];
            marks.insert(*start, Mark::Visiting);
            while let Some((current, idx)) = stack.pop() {
                let next = children.get(&current).and_then(|c| c.get(idx)).copied();
                match next {
                    Some(child) => {
                        stack.push((current, idx + 1));
                        match marks.get(&child) {
                            Some(Mark::Visiting) => {
                                return Err(AppError::Validation(format!(
                                    "workflow '{}' has a cycle through node {}",
                                    self.name, child
                                )));
                            }
                            Some(Mark::Done) => {}
                            None => {
                                marks.insert(child, Mark::Visiting);
                                stack.push((child, 0));
                            }
                        }
                    }
                    None => {
                        marks.insert(current, Mark::Done);
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::fixtures;

    #[test]
    fn test_parents_and_ancestors() {
        let wf = fixtures::join_workflow();
        // root(1) -> a(2), b(3); join(4) over a, b; join -> end(5)
        assert_eq!(wf.parents(2), vec![1]);
        assert_eq!(wf.parents(4), vec![2, 3]);
        assert_eq!(wf.ancestors(5), BTreeSet::from([1, 2, 3, 4]));
        assert!(wf.ancestors(1).is_empty());
    }

    #[test]
    fn test_validate_accepts_fixtures() {
        assert!(fixtures::linear_workflow().validate().is_ok());
        assert!(fixtures::join_workflow().validate().is_ok());
        assert!(fixtures::fork_workflow().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_cycle() {
        let mut wf = fixtures::linear_workflow();
        wf.nodes.get_mut(&2).unwrap().triggers.push(1);
        let err = wf.validate().unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_validate_rejects_short_join() {
        let mut wf = fixtures::join_workflow();
        wf.nodes.get_mut(&4).unwrap().kind = NodeKind::Join { parents: vec![2] };
        assert!(matches!(wf.validate(), Err(AppError::Validation(_))));
    }

    #[test]
    fn test_validate_rejects_unknown_pipeline() {
        let mut wf = fixtures::linear_workflow();
        wf.pipelines.clear();
        assert!(wf.validate().is_err());
    }
}
