//! Core kernel types
//!
//! Identifiers, priority classes, and the node metadata the scheduler
//! consults. Data flowing through the graph is dynamically typed JSON.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Dynamically typed datum carried through the graph.
pub type Value = serde_json::Value;

/// Unique identifier for a compiled node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NodeId(pub u64);

impl NodeId {
    /// Allocate the next free node id.
    pub fn fresh() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        NodeId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a state ref.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RefId(pub String);

impl fmt::Display for RefId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RefId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RefId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Stable identifier matching serialized scope values to refs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Sid(pub String);

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Sid {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Priority classes, in drain order
///
/// Lower bucket index drains first. `Barrier` and `Sampler` are the join
/// classes; layers waiting in them share one heap ordered by
/// `(priority, id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Priority {
    /// Value forwarding along graph edges.
    Child,
    /// Ordinary user computations.
    Pure,
    /// Store reads feeding combined views.
    Read,
    /// De-duplicated join points.
    Barrier,
    /// Joins ordered by compile-assigned id.
    Sampler,
    /// Side effects, always last.
    Effect,
}

impl Priority {
    /// All classes in drain order
    pub const ALL: [Priority; 6] = [
        Priority::Child,
        Priority::Pure,
        Priority::Read,
        Priority::Barrier,
        Priority::Sampler,
        Priority::Effect,
    ];

    /// Bucket index of this class.
    pub fn index(self) -> usize {
        match self {
            Priority::Child => 0,
            Priority::Pure => 1,
            Priority::Read => 2,
            Priority::Barrier => 3,
            Priority::Sampler => 4,
            Priority::Effect => 5,
        }
    }

    /// Whether layers of this class wait in the shared heap.
    pub fn is_join(self) -> bool {
        matches!(self, Priority::Barrier | Priority::Sampler)
    }
}

/// Operations a node can be compiled from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OpKind {
    Watch,
    Map,
    On,
    Sample,
    Combine,
}

/// Node metadata consulted by the kernel.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NodeMeta {
    /// The operation this node was compiled from.
    pub op: Option<OpKind>,
    /// Seed the owning scope's in-flight effect counter after this node.
    pub need_fx_counter: bool,
    /// Seed the owning scope's store-change hook after this node.
    pub store_change: bool,
    /// Seed the owning scope's serialization warning hook after this node.
    pub warn_serialize: bool,
}

impl NodeMeta {
    pub fn op(op: OpKind) -> Self {
        Self {
            op: Some(op),
            ..Self::default()
        }
    }
}

/// Truthiness of a value, as observed by filter steps.
///
/// `null`, `false`, zero, NaN and the empty string are falsy; everything
/// else, including empty arrays and objects, is truthy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|v| v != 0.0 && !v.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
