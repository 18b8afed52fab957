//! Graph nodes and steps
//!
//! A node is a compiled unit of work: an ordered step sequence plus a
//! successor list. Steps are the two kernel primitives, `mov` between
//! storage locations and `compute` over the in-flight value.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::error::{Error, Result, StepFailure};
use crate::queue::Stack;
use crate::storage::StateRef;
use crate::types::{NodeId, NodeMeta, Priority, Value};

/// Arguments handed to a compute body.
pub struct ComputeArgs<'a> {
    /// In-flight value of the running activation.
    pub value: Value,
    /// The node-local bag, shared by every activation of the node.
    pub bag: &'a RefCell<Value>,
    /// The running activation record.
    pub stack: &'a Rc<RefCell<Stack>>,
}

/// Body of a compute step.
///
/// Trusted bodies cannot fail. Fallible bodies abort the node on error
/// without tearing down the drain.
#[derive(Clone)]
pub enum StepFn {
    Safe(Rc<dyn Fn(&mut ComputeArgs<'_>) -> Value>),
    Fallible(Rc<dyn Fn(&mut ComputeArgs<'_>) -> std::result::Result<Value, StepFailure>>),
}

impl StepFn {
    /// Trusted body from a plain function.
    pub fn safe(f: impl Fn(&mut ComputeArgs<'_>) -> Value + 'static) -> Self {
        StepFn::Safe(Rc::new(f))
    }

    /// Fallible body from a plain function.
    pub fn fallible(
        f: impl Fn(&mut ComputeArgs<'_>) -> std::result::Result<Value, StepFailure> + 'static,
    ) -> Self {
        StepFn::Fallible(Rc::new(f))
    }
}

impl fmt::Debug for StepFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepFn::Safe(_) => f.write_str("StepFn::Safe(..)"),
            StepFn::Fallible(_) => f.write_str("StepFn::Fallible(..)"),
        }
    }
}

/// Scheduling constraint attached to a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepOrder {
    /// Priority class this step must execute at.
    pub priority: Priority,
    /// Collapse pending arrivals at this step into one execution.
    pub barrier_id: Option<u64>,
}

/// Source of a `mov` step.
#[derive(Clone)]
pub enum MovSource {
    /// The activation's in-flight value.
    Stack,
    /// Scratch register `a`.
    RegA,
    /// Scratch register `b`.
    RegB,
    /// A literal carried by the step.
    Literal(Value),
    /// A state cell, read through the overlay resolver.
    Store {
        store: Rc<StateRef>,
        /// Read without forcing lazy derivation.
        soft_read: bool,
    },
}

impl MovSource {
    /// Plain store read.
    pub fn store(store: &Rc<StateRef>) -> Self {
        MovSource::Store {
            store: store.clone(),
            soft_read: false,
        }
    }

    /// Store read that skips derivation commands.
    pub fn store_soft(store: &Rc<StateRef>) -> Self {
        MovSource::Store {
            store: store.clone(),
            soft_read: true,
        }
    }
}

/// Destination of a `mov` step.
#[derive(Clone)]
pub enum MovTarget {
    Stack,
    RegA,
    RegB,
    /// A state cell, resolved against the active page chain and scope.
    Store(Rc<StateRef>),
}

/// The two step primitives.
#[derive(Clone)]
pub enum StepKind {
    /// Move a value between storage locations.
    Mov { from: MovSource, to: MovTarget },
    /// Run a computation over the in-flight value.
    Compute {
        /// Absent bodies make the step a no-op.
        body: Option<StepFn>,
        /// The computation runs in the pure phase.
        pure: bool,
        /// Interpret the result as a predicate; falsy terminates the node.
        filter: bool,
    },
}

/// One primitive operation inside a node.
#[derive(Clone)]
pub struct Step {
    pub kind: StepKind,
    /// Optional priority constraint enforced before the step runs.
    pub order: Option<StepOrder>,
}

impl Step {
    /// Move a value from `from` to `to`.
    pub fn mov(from: MovSource, to: MovTarget) -> Self {
        Step {
            kind: StepKind::Mov { from, to },
            order: None,
        }
    }

    /// Pure computation over the in-flight value.
    pub fn compute(body: StepFn) -> Self {
        Step {
            kind: StepKind::Compute {
                body: Some(body),
                pure: true,
                filter: false,
            },
            order: None,
        }
    }

    /// Impure computation (watch bodies, effect handlers).
    pub fn effect(body: StepFn) -> Self {
        Step {
            kind: StepKind::Compute {
                body: Some(body),
                pure: false,
                filter: false,
            },
            order: None,
        }
    }

    /// Predicate over the in-flight value; falsy terminates the node.
    pub fn filter(body: StepFn) -> Self {
        Step {
            kind: StepKind::Compute {
                body: Some(body),
                pure: true,
                filter: true,
            },
            order: None,
        }
    }

    /// Constrain the step to a priority class.
    pub fn at(mut self, priority: Priority) -> Self {
        self.order = Some(StepOrder {
            priority,
            barrier_id: None,
        });
        self
    }

    /// Constrain the step to a join class with a barrier id.
    pub fn barrier(mut self, priority: Priority, barrier_id: u64) -> Self {
        self.order = Some(StepOrder {
            priority,
            barrier_id: Some(barrier_id),
        });
        self
    }
}

/// A compiled graph vertex.
///
/// Immutable once built, except for the successor list, which graph wiring
/// appends to, and the bag, which compute bodies may use as shared state.
pub struct Node {
    pub id: NodeId,
    /// Ordered step sequence.
    pub seq: Vec<Step>,
    /// Successors seeded with this node's final value.
    pub next: RefCell<Vec<Rc<Node>>>,
    /// Node-local bag exposed to compute bodies.
    pub bag: RefCell<Value>,
    /// Metadata consulted by the kernel.
    pub meta: NodeMeta,
}

impl Node {
    pub fn builder() -> NodeBuilder {
        NodeBuilder::default()
    }

    /// Append a successor.
    pub fn link(self: &Rc<Self>, next: &Rc<Node>) {
        self.next.borrow_mut().push(next.clone());
    }
}

/// Builder for compiled nodes.
#[derive(Default)]
pub struct NodeBuilder {
    seq: Vec<Step>,
    next: Vec<Rc<Node>>,
    bag: Option<Value>,
    meta: NodeMeta,
}

impl NodeBuilder {
    /// Append a step to the sequence.
    pub fn step(mut self, step: Step) -> Self {
        self.seq.push(step);
        self
    }

    /// Append a successor.
    pub fn next(mut self, node: &Rc<Node>) -> Self {
        self.next.push(node.clone());
        self
    }

    /// Set the node-local bag.
    pub fn bag(mut self, bag: Value) -> Self {
        self.bag = Some(bag);
        self
    }

    /// Set the node metadata.
    pub fn meta(mut self, meta: NodeMeta) -> Self {
        self.meta = meta;
        self
    }

    /// Build the node, validating step constraints.
    pub fn build(self) -> Result<Rc<Node>> {
        for (i, step) in self.seq.iter().enumerate() {
            if let Some(order) = &step.order
                && let Some(barrier_id) = order.barrier_id
                && !order.priority.is_join()
            {
                return Err(Error::BarrierPriority {
                    step: i,
                    barrier_id,
                    priority: order.priority,
                });
            }
        }
        Ok(Rc::new(Node {
            id: NodeId::fresh(),
            seq: self.seq,
            next: RefCell::new(self.next),
            bag: RefCell::new(self.bag.unwrap_or(Value::Null)),
            meta: self.meta,
        }))
    }
}

/// A user-facing unit backed by exactly one node.
pub trait Unit {
    /// The compiled node behind this unit.
    fn graph(&self) -> Rc<Node>;
}

impl Unit for Rc<Node> {
    fn graph(&self) -> Rc<Node> {
        self.clone()
    }
}
