//! The advisory message queue filled while parsing and reconstructing.
//!
//! Messages never abort anything by themselves; the host drains them and decides how loudly to
//! present each [`Severity`].

use core::fmt;

use crate::treemodel::NodeId;

/// How serious a message is. Purely advisory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// One issue found during an operation, optionally tied to a tree node.
#[derive(Clone, Debug)]
pub struct Message {
    pub severity: Severity,
    pub text: String,
    pub index: Option<NodeId>,
}
