use std::collections::HashMap;

use crate::error::TreeError;
use crate::program::{Program, ProgramId};
use crate::sampler::ProgramSource;

/// In-memory program tree: an arena of programs plus an id index.
///
/// Nodes can only be attached under a parent that is already present, so
/// the structure is acyclic by construction.
#[derive(Clone, Debug, Default)]
pub struct SearchTree {
    nodes: Vec<Program>,
    parents: Vec<Option<usize>>,
    children: Vec<Vec<usize>>,
    index: HashMap<ProgramId, usize>,
    roots: Vec<usize>,
}

impl SearchTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a tree from programs ordered parents-first (e.g. by id).
    /// Programs whose parent is absent from `programs` are skipped.
    pub fn from_programs(programs: impl IntoIterator<Item = Program>) -> Self {
        let mut tree = Self::new();
        for program in programs {
            // Orphans are outside the window the caller loaded; ignore them.
            let _ = tree.insert(program);
        }
        tree
    }

    pub fn insert(&mut self, program: Program) -> Result<ProgramId, TreeError> {
        let id = program.id.ok_or(TreeError::MissingId)?;
        if self.index.contains_key(&id) {
            return Err(TreeError::Duplicate(id));
        }
        let parent = match program.parent_id {
            Some(parent_id) => Some(*self.index.get(&parent_id).ok_or(
                TreeError::UnknownParent {
                    program: id,
                    parent: parent_id,
                },
            )?),
            None => None,
        };

        let slot = self.nodes.len();
        self.nodes.push(program);
        self.parents.push(parent);
        self.children.push(Vec::new());
        self.index.insert(id, slot);
        match parent {
            Some(parent) => self.children[parent].push(slot),
            None => self.roots.push(slot),
        }
        Ok(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: ProgramId) -> Option<&Program> {
        self.index.get(&id).map(|&slot| &self.nodes[slot])
    }

    pub fn programs(&self) -> impl Iterator<Item = &Program> {
        self.nodes.iter()
    }

    pub fn children(&self, id: ProgramId) -> Vec<&Program> {
        self.index
            .get(&id)
            .map(|&slot| self.children[slot].iter().map(|&c| &self.nodes[c]).collect())
            .unwrap_or_default()
    }

    /// Ancestor ids, nearest parent first.
    pub fn ancestors(&self, id: ProgramId) -> Result<Vec<ProgramId>, TreeError> {
        let slot = self.slot(id)?;
        let mut out = Vec::new();
        let mut cursor = self.parents[slot];
        while let Some(parent) = cursor {
            out.push(self.node_id(parent));
            cursor = self.parents[parent];
        }
        Ok(out)
    }

    /// The program and up to `max_depth` ancestors, root-most first.
    pub fn lineage(&self, id: ProgramId, max_depth: usize) -> Result<Vec<Program>, TreeError> {
        let slot = self.slot(id)?;
        let mut chain = vec![self.nodes[slot].clone()];
        let mut cursor = self.parents[slot];
        while let Some(parent) = cursor {
            if chain.len() > max_depth {
                break;
            }
            chain.push(self.nodes[parent].clone());
            cursor = self.parents[parent];
        }
        chain.reverse();
        Ok(chain)
    }

    /// Add `reward` to every ancestor of `leaf` and count one more visit.
    pub fn backpropagate(&mut self, leaf: ProgramId, reward: f64) -> Result<usize, TreeError> {
        let slot = self.slot(leaf)?;
        let mut touched = 0;
        let mut cursor = self.parents[slot];
        while let Some(parent) = cursor {
            let node = &mut self.nodes[parent];
            node.visits += 1;
            node.value += reward;
            touched += 1;
            cursor = self.parents[parent];
        }
        Ok(touched)
    }

    /// UCT descent until a node with no children.
    ///
    /// The first step picks among all roots the same way siblings compete,
    /// using the total root visits as the parent count.
    pub fn select_uct(&self, exploration_constant: f64) -> Option<&Program> {
        let root_visits = self.roots.iter().map(|&r| self.nodes[r].visits).sum();
        let mut slot = self.best_child(&self.roots, root_visits, exploration_constant)?;
        loop {
            let children = &self.children[slot];
            match self.best_child(children, self.nodes[slot].visits, exploration_constant) {
                Some(next) => slot = next,
                None => return Some(&self.nodes[slot]),
            }
        }
    }

    fn best_child(&self, slots: &[usize], parent_visits: u64, c: f64) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for &slot in slots {
            let score = self.nodes[slot].get_uct(parent_visits, c);
            // Strict comparison keeps the first-seen node on ties.
            if best.map_or(true, |(_, top)| score > top) {
                best = Some((slot, score));
            }
        }
        best.map(|(slot, _)| slot)
    }

    fn slot(&self, id: ProgramId) -> Result<usize, TreeError> {
        self.index
            .get(&id)
            .copied()
            .ok_or(TreeError::UnknownProgram(id))
    }

    fn node_id(&self, slot: usize) -> ProgramId {
        // Every inserted node has an id.
        self.nodes[slot].id.unwrap_or_default()
    }
}

impl ProgramSource for SearchTree {
    fn candidates(&self, version: i64) -> Result<Vec<Program>, String> {
        Ok(self
            .nodes
            .iter()
            .filter(|p| p.version == version && p.is_evaluated())
            .cloned()
            .collect())
    }

    fn lineage(&self, id: ProgramId, max_depth: usize) -> Result<Vec<Program>, String> {
        SearchTree::lineage(self, id, max_depth).map_err(|err| err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::Conversation;

    fn node(id: ProgramId, parent: Option<ProgramId>, value: f64, visits: u64) -> Program {
        let mut program = Program::new(format!("step_{id}()"), Conversation::new(), 1);
        program.id = Some(id);
        program.parent_id = parent;
        program.value = value;
        program.visits = visits;
        program
    }

    #[test]
    fn rejects_missing_ids_duplicates_and_orphans() {
        let mut tree = SearchTree::new();
        let mut anonymous = node(1, None, 0.0, 0);
        anonymous.id = None;
        assert_eq!(tree.insert(anonymous), Err(TreeError::MissingId));

        tree.insert(node(1, None, 0.0, 0)).unwrap();
        assert_eq!(tree.insert(node(1, None, 0.0, 0)), Err(TreeError::Duplicate(1)));
        assert_eq!(
            tree.insert(node(3, Some(2), 0.0, 0)),
            Err(TreeError::UnknownParent {
                program: 3,
                parent: 2
            })
        );
    }

    #[test]
    fn backpropagation_updates_every_ancestor_once() {
        let mut tree = SearchTree::new();
        tree.insert(node(1, None, 0.0, 1)).unwrap();
        tree.insert(node(2, Some(1), 0.0, 1)).unwrap();
        tree.insert(node(3, Some(2), 0.0, 1)).unwrap();
        tree.insert(node(4, Some(1), 0.0, 1)).unwrap();

        assert_eq!(tree.backpropagate(3, 5.0).unwrap(), 2);
        assert_eq!(tree.get(1).unwrap().visits, 2);
        assert_eq!(tree.get(1).unwrap().value, 5.0);
        assert_eq!(tree.get(2).unwrap().visits, 2);
        assert_eq!(tree.get(3).unwrap().visits, 1);
        assert_eq!(tree.get(4).unwrap().visits, 1);
        assert_eq!(tree.ancestors(3).unwrap(), vec![2, 1]);
    }

    #[test]
    fn lineage_is_bounded_and_root_first() {
        let mut tree = SearchTree::new();
        tree.insert(node(1, None, 0.0, 1)).unwrap();
        tree.insert(node(2, Some(1), 0.0, 1)).unwrap();
        tree.insert(node(3, Some(2), 0.0, 1)).unwrap();

        let ids = |chain: Vec<Program>| chain.into_iter().filter_map(|p| p.id).collect::<Vec<_>>();
        assert_eq!(ids(tree.lineage(3, 10).unwrap()), vec![1, 2, 3]);
        assert_eq!(ids(tree.lineage(3, 1).unwrap()), vec![2, 3]);
        assert_eq!(ids(tree.lineage(3, 0).unwrap()), vec![3]);
    }

    #[test]
    fn selection_prefers_unvisited_then_first_seen() {
        let mut tree = SearchTree::new();
        tree.insert(node(1, None, 10.0, 4)).unwrap();
        tree.insert(node(2, Some(1), 3.0, 1)).unwrap();
        tree.insert(node(3, Some(1), 0.0, 0)).unwrap();
        tree.insert(node(4, Some(1), 0.0, 0)).unwrap();
        assert_eq!(tree.select_uct(1.41).and_then(|p| p.id), Some(3));
    }

    #[test]
    fn selection_descends_to_a_leaf() {
        let mut tree = SearchTree::new();
        tree.insert(node(1, None, 10.0, 3)).unwrap();
        tree.insert(node(2, Some(1), 9.0, 1)).unwrap();
        tree.insert(node(3, Some(1), 1.0, 1)).unwrap();
        tree.insert(node(4, Some(2), 2.0, 1)).unwrap();
        assert_eq!(tree.select_uct(0.0).and_then(|p| p.id), Some(4));
        assert!(SearchTree::new().select_uct(1.41).is_none());
    }

    #[test]
    fn selection_compares_every_root() {
        let mut tree = SearchTree::new();
        tree.insert(node(1, None, 1.0, 2)).unwrap();
        tree.insert(node(2, None, 10.0, 2)).unwrap();
        tree.insert(node(3, Some(2), 5.0, 1)).unwrap();
        assert_eq!(tree.select_uct(0.0).and_then(|p| p.id), Some(3));
    }
}
