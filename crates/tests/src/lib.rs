//! Integration test harness for the ripple kernel.
//!
//! Provides a recording sink node and terse node constructors so the
//! end-to-end tests can wire small graphs without ceremony.

use std::cell::RefCell;
use std::rc::Rc;

use ripple_kernel::{Node, Step, StepFn, Value};

/// A sink node that records every value reaching it.
pub struct Recorder {
    log: Rc<RefCell<Vec<Value>>>,
    node: Rc<Node>,
}

impl Recorder {
    /// # Panics
    ///
    /// Panics if the sink node fails to build.
    pub fn new() -> Self {
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = log.clone();
        let node = Node::builder()
            .step(Step::effect(StepFn::safe(move |args| {
                sink.borrow_mut().push(args.value.clone());
                args.value.clone()
            })))
            .build()
            .expect("recorder node");
        Self { log, node }
    }

    /// The sink node; link it as a successor of the node under test.
    pub fn node(&self) -> Rc<Node> {
        self.node.clone()
    }

    /// Values recorded so far, in arrival order.
    pub fn values(&self) -> Vec<Value> {
        self.log.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.log.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.borrow().is_empty()
    }

    pub fn clear(&self) {
        self.log.borrow_mut().clear();
    }
}

impl Default for Recorder {
    fn default() -> Self {
        Self::new()
    }
}

/// A single-step node applying `f` to the in-flight value.
///
/// # Panics
///
/// Panics if the node fails to build.
pub fn compute_node(f: impl Fn(&Value) -> Value + 'static) -> Rc<Node> {
    Node::builder()
        .step(Step::compute(StepFn::safe(move |args| f(&args.value))))
        .build()
        .expect("compute node")
}
