//! Hybrid priority queue
//!
//! Six buckets scanned in drain order. Child, pure, read and effect layers
//! are FIFO ring buffers; barrier and sampler layers share one skew heap
//! ordered by `(priority, id)` so joins fire in compile-assigned order
//! regardless of arrival order. Single drainer, not thread-safe.

use std::cell::RefCell;
use std::collections::{HashSet, VecDeque};
use std::rc::Rc;

use crate::node::Node;
use crate::storage::{Page, Scope};
use crate::types::{Priority, Value};

/// Per-activation record.
///
/// Each activation carries its own scratch registers, in-flight value, and
/// overlay pointers, so priority-induced interleaving between two
/// activations of the same node cannot stomp on each other.
pub struct Stack {
    pub node: Rc<Node>,
    /// Activation that scheduled this one. Values are forwarded eagerly
    /// at seed time; the link is kept so inspectors and compute bodies
    /// can walk the activation chain.
    pub parent: Option<Rc<RefCell<Stack>>>,
    /// In-flight datum.
    pub value: Value,
    /// Scratch register `a`.
    pub a: Value,
    /// Scratch register `b`.
    pub b: Value,
    /// Page overlay active for this activation.
    pub page: Option<Rc<Page>>,
    /// Scope active for this activation.
    pub scope: Option<Rc<Scope>>,
    /// Launch metadata.
    pub meta: Option<Value>,
}

/// Canonical current value of an activation.
pub fn get_value(stack: &Rc<RefCell<Stack>>) -> Value {
    stack.borrow().value.clone()
}

/// Scope extracted from an activation.
pub fn get_fork_page(stack: &Rc<RefCell<Stack>>) -> Option<Rc<Scope>> {
    stack.borrow().scope.clone()
}

/// A queued intent to execute a node starting at step `idx`.
#[derive(Clone)]
pub struct Layer {
    /// Next step index within the node's sequence.
    pub idx: usize,
    pub stack: Rc<RefCell<Stack>>,
    /// Priority class this layer waits in.
    pub priority: Priority,
    /// Heap tie-breaker; the barrier id, or 0.
    pub id: u64,
}

/// Barrier key, namespaced by the active page when one exists.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BarrierKey {
    Bare(u64),
    Paged { page: String, id: u64 },
}

struct HeapNode {
    layer: Layer,
    left: Option<Box<HeapNode>>,
    right: Option<Box<HeapNode>>,
}

/// Whether `a` keeps priority over `b` in the heap.
///
/// `<=` on ids keeps equal-id layers in insertion order.
fn keeps_priority(a: &Layer, b: &Layer) -> bool {
    let (pa, pb) = (a.priority.index(), b.priority.index());
    pa < pb || (pa == pb && a.id <= b.id)
}

fn merge(a: Option<Box<HeapNode>>, b: Option<Box<HeapNode>>) -> Option<Box<HeapNode>> {
    let (mut root, other) = match (a, b) {
        (None, b) => return b,
        (a, None) => return a,
        (Some(a), Some(b)) => {
            if keeps_priority(&a.layer, &b.layer) {
                (a, b)
            } else {
                (b, a)
            }
        }
    };
    let merged = merge(root.right.take(), Some(other));
    root.right = root.left.take();
    root.left = merged;
    Some(root)
}

/// Hybrid scheduler queue; owned by exactly one drain at a time.
pub struct Queue {
    fifo: [VecDeque<Layer>; 6],
    /// Skew heap shared by the two join buckets.
    heap: Option<Box<HeapNode>>,
    /// Pending counts for the barrier and sampler buckets.
    heap_sizes: [usize; 2],
    /// Barrier keys currently enqueued; lives for this queue's lifetime.
    pub barriers: HashSet<BarrierKey>,
}

impl Queue {
    pub fn new() -> Self {
        Self {
            fifo: std::array::from_fn(|_| VecDeque::new()),
            heap: None,
            heap_sizes: [0, 0],
            barriers: HashSet::new(),
        }
    }

    /// Seed a fresh activation at step 0.
    #[allow(clippy::too_many_arguments)]
    pub fn push_first(
        &mut self,
        priority: Priority,
        page: Option<Rc<Page>>,
        node: Rc<Node>,
        parent: Option<Rc<RefCell<Stack>>>,
        value: Value,
        scope: Option<Rc<Scope>>,
        meta: Option<Value>,
    ) {
        let stack = Rc::new(RefCell::new(Stack {
            node,
            parent,
            value,
            a: Value::Null,
            b: Value::Null,
            page,
            scope,
            meta,
        }));
        self.push(0, stack, priority, 0);
    }

    /// Enqueue a layer.
    pub fn push(&mut self, idx: usize, stack: Rc<RefCell<Stack>>, priority: Priority, id: u64) {
        let layer = Layer {
            idx,
            stack,
            priority,
            id,
        };
        if priority.is_join() {
            self.heap_sizes[Self::heap_slot(priority)] += 1;
            let node = Box::new(HeapNode {
                layer,
                left: None,
                right: None,
            });
            self.heap = merge(self.heap.take(), Some(node));
        } else {
            self.fifo[priority.index()].push_back(layer);
        }
    }

    /// Pop the highest-priority pending layer.
    ///
    /// Buckets are scanned in order, so a bucket only yields once every
    /// earlier bucket is empty. Popping from a join bucket pops the heap
    /// root and re-merges its children.
    pub fn delete_min(&mut self) -> Option<Layer> {
        for priority in Priority::ALL {
            if priority.is_join() {
                if self.heap_sizes[Self::heap_slot(priority)] == 0 {
                    continue;
                }
                if let Some(root) = self.heap.take() {
                    self.heap = merge(root.left, root.right);
                    let layer = root.layer;
                    self.heap_sizes[Self::heap_slot(layer.priority)] -= 1;
                    return Some(layer);
                }
            } else if let Some(layer) = self.fifo[priority.index()].pop_front() {
                return Some(layer);
            }
        }
        None
    }

    /// Pending layer count across all buckets.
    pub fn len(&self) -> usize {
        self.fifo.iter().map(VecDeque::len).sum::<usize>()
            + self.heap_sizes.iter().sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn heap_slot(priority: Priority) -> usize {
        priority.index() - Priority::Barrier.index()
    }
}

impl Default for Queue {
    fn default() -> Self {
        Self::new()
    }
}
