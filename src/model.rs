//! Immutable Step/Group/Dependency data model.
//!
//! Groups are not a separate subclass of Step: a `Node` is tagged by
//! `NodeKind` as either `Atomic` (a real command) or `Composite` (a group,
//! whose status is always derived from its children — see
//! [`crate::coordinator`]).

use std::collections::HashMap;
use std::path::PathBuf;

use petgraph::graph::NodeIndex;

/// A single step or group in the compiled flow.
#[derive(Debug, Clone)]
pub struct Node {
    /// Globally unique name after namespacing.
    pub name: String,
    pub kind: NodeKind,
    /// Index of the parent group, if this node is nested.
    pub parent: Option<NodeIndex>,
    /// Declaration order within the scenario; used as a tie-break when
    /// multiple steps become dispatchable at once.
    pub declaration_order: usize,
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    Atomic(Step),
    Composite { children: Vec<NodeIndex> },
}

impl Node {
    pub fn is_group(&self) -> bool {
        matches!(self.kind, NodeKind::Composite { .. })
    }

    pub fn as_step(&self) -> Option<&Step> {
        match &self.kind {
            NodeKind::Atomic(step) => Some(step),
            NodeKind::Composite { .. } => None,
        }
    }
}

/// An atomic executable unit, immutable once compiled.
#[derive(Debug, Clone)]
pub struct Step {
    pub name: String,
    pub command: String,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub if_predicate: Option<String>,
    pub unless_predicate: Option<String>,
    pub delay_seconds: u64,
}

/// An edge from a dependent node to one of its prerequisites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dependency {
    /// A soft edge is satisfied by any terminal status of the prerequisite;
    /// a hard edge requires the prerequisite to have succeeded.
    pub soft: bool,
}

/// Execution status of a node. Every node begins `Waiting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Waiting,
    InProgress,
    Succeeded,
    Failed,
    Skipped,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Succeeded | Status::Failed | Status::Skipped)
    }

    /// Precedence used when deriving a Group's status from its children:
    /// Failed > Skipped > Succeeded.
    fn severity(self) -> u8 {
        match self {
            Status::Failed => 2,
            Status::Skipped => 1,
            Status::Succeeded => 0,
            Status::InProgress | Status::Waiting => 0,
        }
    }

    pub fn worst_of(a: Status, b: Status) -> Status {
        if a.severity() >= b.severity() {
            a
        } else {
            b
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Waiting => "WAITING",
            Status::InProgress => "IN_PROGRESS",
            Status::Succeeded => "SUCCEEDED",
            Status::Failed => "FAILED",
            Status::Skipped => "SKIPPED",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "WAITING" => Ok(Status::Waiting),
            "IN_PROGRESS" => Ok(Status::InProgress),
            "SUCCEEDED" => Ok(Status::Succeeded),
            "FAILED" => Ok(Status::Failed),
            "SKIPPED" => Ok(Status::Skipped),
            other => Err(format!("unknown status '{other}'")),
        }
    }
}
