use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::DebugError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(pub String);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BlockId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for BlockId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// One schedulable unit of work. `config` is opaque to the scheduler and is
/// interpreted by the `BlockExecutor`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub id: BlockId,
    pub label: String,
    #[serde(default)]
    pub depends_on: Vec<BlockId>,
    #[serde(default)]
    pub config: Value,
}

impl Block {
    pub fn new(id: impl Into<BlockId>, label: impl Into<String>) -> Self {
        Self { id: id.into(), label: label.into(), depends_on: Vec::new(), config: Value::Null }
    }

    pub fn after(mut self, dependency: impl Into<BlockId>) -> Self {
        self.depends_on.push(dependency.into());
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }
}

/// A validated set of blocks with a fixed execution order.
#[derive(Clone, Debug, PartialEq)]
pub struct BlockPlan {
    blocks: Vec<Block>,
    order: Vec<BlockId>,
}

impl BlockPlan {
    pub fn new(blocks: Vec<Block>) -> Result<Self, DebugError> {
        if blocks.is_empty() {
            return Err(DebugError::EmptyPlan);
        }

        let mut known = HashSet::new();
        for block in &blocks {
            if !known.insert(block.id.clone()) {
                return Err(DebugError::DuplicateBlock(block.id.clone()));
            }
        }
        for block in &blocks {
            if let Some(dependency) = block.depends_on.iter().find(|dep| !known.contains(*dep)) {
                return Err(DebugError::UnknownDependency {
                    block_id: block.id.clone(),
                    dependency: dependency.clone(),
                });
            }
        }

        let order = dependency_order(&blocks)?;
        Ok(Self { blocks, order })
    }

    pub fn block(&self, id: &BlockId) -> Option<&Block> {
        self.blocks.iter().find(|block| &block.id == id)
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Dependencies first; ties keep declaration order.
    pub fn execution_order(&self) -> &[BlockId] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

fn dependency_order(blocks: &[Block]) -> Result<Vec<BlockId>, DebugError> {
    let mut placed: HashSet<&BlockId> = HashSet::new();
    let mut order = Vec::with_capacity(blocks.len());

    while order.len() < blocks.len() {
        let next = blocks.iter().find(|block| {
            !placed.contains(&block.id) && block.depends_on.iter().all(|dep| placed.contains(dep))
        });

        let Some(block) = next else {
            let stuck = blocks
                .iter()
                .filter(|block| !placed.contains(&block.id))
                .map(|block| block.id.clone())
                .collect();
            return Err(DebugError::Cycle(stuck));
        };

        placed.insert(&block.id);
        order.push(block.id.clone());
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::{Block, BlockId, BlockPlan};
    use crate::errors::DebugError;

    fn ids(plan: &BlockPlan) -> Vec<&str> {
        plan.execution_order().iter().map(|id| id.0.as_str()).collect()
    }

    #[test]
    fn dependencies_run_before_dependents_regardless_of_declaration_order() {
        let plan = BlockPlan::new(vec![
            Block::new("summarize", "Summarize").after("fetch"),
            Block::new("fetch", "Fetch"),
            Block::new("notify", "Notify"),
        ])
        .expect("valid plan");

        assert_eq!(ids(&plan), vec!["fetch", "summarize", "notify"]);
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let error = BlockPlan::new(vec![Block::new("a", "A").after("ghost")])
            .expect_err("unknown dependency");

        assert!(matches!(
            error,
            DebugError::UnknownDependency { ref dependency, .. } if dependency == &BlockId::from("ghost")
        ));
    }

    #[test]
    fn cycles_and_duplicates_are_rejected() {
        let cycle = BlockPlan::new(vec![
            Block::new("a", "A").after("b"),
            Block::new("b", "B").after("a"),
        ]);
        assert!(matches!(cycle, Err(DebugError::Cycle(ref stuck)) if stuck.len() == 2));

        let duplicate = BlockPlan::new(vec![Block::new("a", "A"), Block::new("a", "A again")]);
        assert!(matches!(duplicate, Err(DebugError::DuplicateBlock(_))));

        assert!(matches!(BlockPlan::new(Vec::new()), Err(DebugError::EmptyPlan)));
    }
}
