//! Traversal specifications over the schema relation graph.

use std::ops::{Add, Sub};

use serde::{Deserialize, Serialize};

use super::{AlgebraError, AlgebraResult, Condition, FromClause, JoinKey};
use crate::model::{RelTup, Schema};

/// A (possibly branching) sequence of relation edges anchored at a
/// terminal entity, optionally terminated by a specific attribute.
///
/// Steps are stored outermost-first: `steps.last()` touches the terminal
/// entity, `steps[0]` touches the far end (the "head") where the
/// terminating attribute, if any, lives. Branches are sub-paths whose
/// terminal is this path's head; they fan the join tree out from the
/// convergence point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Path {
    steps: Vec<RelTup>,
    terminal: String,
    attr: Option<String>,
    branches: Vec<Path>,
}

impl Path {
    /// The empty path anchored at an entity.
    pub fn to(entity: &str) -> Self {
        Self {
            steps: vec![],
            terminal: entity.into(),
            attr: None,
            branches: vec![],
        }
    }

    /// Build a linear path by traversing named relations outward from the
    /// terminal entity. Each relation must touch the current entity at
    /// either endpoint; `other()` resolves the next entity.
    pub fn via(schema: &Schema, terminal: &str, rels: &[&str]) -> AlgebraResult<Self> {
        let mut entity = terminal.to_string();
        let mut walked = Vec::with_capacity(rels.len());
        for name in rels {
            let rel = schema.relation(name)?;
            entity = rel.other(&entity)?.to_string();
            walked.push(rel.tup());
        }
        walked.reverse();
        Ok(Self {
            steps: walked,
            terminal: terminal.into(),
            attr: None,
            branches: vec![],
        })
    }

    pub(crate) fn from_steps(steps: Vec<RelTup>, terminal: &str) -> Self {
        Self {
            steps,
            terminal: terminal.into(),
            attr: None,
            branches: vec![],
        }
    }

    /// Terminate the path at a specific attribute of its head entity.
    /// Existence is validated at query-compile time against the schema.
    pub fn attr(mut self, name: &str) -> Self {
        self.attr = Some(name.into());
        self
    }

    pub fn terminal(&self) -> &str {
        &self.terminal
    }

    pub fn attr_name(&self) -> Option<&str> {
        self.attr.as_deref()
    }

    pub fn steps(&self) -> &[RelTup] {
        &self.steps
    }

    pub fn is_linear(&self) -> bool {
        self.branches.is_empty()
    }

    /// The far-end entity reached after traversing every step.
    pub fn head(&self) -> AlgebraResult<String> {
        let mut entity = self.terminal.clone();
        for step in self.steps.iter().rev() {
            entity = step.other(&entity)?.to_string();
        }
        Ok(entity)
    }

    /// Every entity the path touches, terminal first.
    pub fn entities(&self) -> AlgebraResult<Vec<String>> {
        let mut entity = self.terminal.clone();
        let mut out = vec![entity.clone()];
        for step in self.steps.iter().rev() {
            entity = step.other(&entity)?.to_string();
            out.push(entity.clone());
        }
        for branch in &self.branches {
            out.extend(branch.entities()?);
        }
        Ok(out)
    }

    /// Concatenate: `other` extends this path outward from its head.
    /// Requires `other.terminal == self.head()` and both paths linear.
    pub fn concat(self, other: Path) -> AlgebraResult<Path> {
        if !self.is_linear() || !other.is_linear() {
            return Err(AlgebraError::NotLinear);
        }
        let head = self.head()?;
        if other.terminal != head {
            return Err(AlgebraError::EndpointMismatch {
                expected: head,
                found: other.terminal,
            });
        }
        let mut steps = other.steps;
        steps.extend(self.steps);
        Ok(Path {
            steps,
            terminal: self.terminal,
            attr: other.attr,
            branches: vec![],
        })
    }

    /// Difference: strip `other` (a terminal-side segment sharing this
    /// path's terminal) and re-anchor at its head.
    pub fn strip(self, other: &Path) -> AlgebraResult<Path> {
        if !self.is_linear() || !other.is_linear() {
            return Err(AlgebraError::NotLinear);
        }
        if other.terminal != self.terminal {
            return Err(AlgebraError::EndpointMismatch {
                expected: self.terminal.clone(),
                found: other.terminal.clone(),
            });
        }
        if other.steps.len() > self.steps.len()
            || self.steps[self.steps.len() - other.steps.len()..] != other.steps[..]
        {
            return Err(AlgebraError::NotASuffix(other.terminal.clone()));
        }
        let keep = self.steps.len() - other.steps.len();
        let terminal = other.head()?;
        Ok(Path {
            steps: self.steps.into_iter().take(keep).collect(),
            terminal,
            attr: self.attr,
            branches: vec![],
        })
    }

    /// Attach a branch converging on this path's head entity.
    pub fn with_branch(mut self, branch: Path) -> AlgebraResult<Path> {
        let head = self.head()?;
        if branch.terminal != head {
            return Err(AlgebraError::EndpointMismatch {
                expected: head,
                found: branch.terminal,
            });
        }
        self.branches.push(branch);
        Ok(self)
    }

    /// Compile the path into the join arena of `from`, returning the key
    /// of the head join. The terminal entity becomes a basis join.
    pub fn join(&self, schema: &Schema, from: &mut FromClause) -> AlgebraResult<JoinKey> {
        let root = from.basis(&self.terminal);
        self.join_from(schema, from, root, self.terminal.clone())
    }

    /// Compile starting from an existing join instead of a fresh basis.
    /// Used for branches, which share their convergence join.
    fn join_from(
        &self,
        schema: &Schema,
        from: &mut FromClause,
        root: JoinKey,
        root_entity: String,
    ) -> AlgebraResult<JoinKey> {
        let mut key = root;
        let mut entity = root_entity;
        for step in self.steps.iter().rev() {
            let next = step.other(&entity)?.to_string();
            let condition = Condition::single(key, &step.name);
            key = from.joined(schema, &next, condition)?;
            entity = next;
        }
        for branch in &self.branches {
            branch.join_from(schema, from, key.clone(), entity.clone())?;
        }
        Ok(key)
    }

    /// Resolve the path to an aliased column reference, compiling joins
    /// as a side effect. The path must carry a terminating attribute.
    pub fn column(
        &self,
        schema: &Schema,
        from: &mut FromClause,
    ) -> AlgebraResult<(String, String)> {
        let head = self.head()?;
        let attr = self
            .attr
            .as_deref()
            .ok_or_else(|| AlgebraError::MissingAttr(head.clone()))?;
        let entity = schema.entity(&head)?;
        if entity.attr(attr).is_none() && attr != entity.pk_column() && entity.rel(attr).is_none() {
            return Err(crate::model::ModelError::UnknownAttr {
                entity: head,
                attr: attr.into(),
            }
            .into());
        }
        let key = self.join(schema, from)?;
        let alias = from.alias(&key).to_string();
        Ok((alias, attr.to_string()))
    }
}

impl Add for Path {
    type Output = AlgebraResult<Path>;

    fn add(self, other: Path) -> Self::Output {
        self.concat(other)
    }
}

impl Sub for Path {
    type Output = AlgebraResult<Path>;

    fn sub(self, other: Path) -> Self::Output {
        self.strip(&other)
    }
}
