//! Kernel driver
//!
//! Owns the drain loop: pops layers in priority order, interprets node
//! steps, seeds successors, and keeps the ambient state reentrancy-safe.
//! [`launch`] and friends are the public entry points.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::{debug, error, trace};

use crate::ambient;
use crate::error::StepFailure;
use crate::node::{ComputeArgs, MovSource, MovTarget, Node, StepFn, StepKind, Unit};
use crate::queue::{BarrierKey, Layer, Queue, Stack, get_fork_page, get_value};
use crate::storage::{
    Page, Scope, StateRef, get_page_for_ref, get_page_ref, init_ref_in_scope, read_ref,
};
use crate::types::{OpKind, Priority, RefId, Value, is_truthy};

/// Outcome of one node activation, handed to the inspector.
#[derive(Default)]
pub struct Local {
    /// A fallible step failed.
    pub fail: bool,
    /// The failure, when one occurred.
    pub fail_reason: Option<StepFailure>,
}

/// Targets of a launch.
pub enum LaunchTarget {
    /// A single unit with its payload.
    Single(Rc<Node>, Value),
    /// A batch of units, each with its own payload.
    Batch(Vec<(Rc<Node>, Value)>),
}

/// Full-control launch configuration.
///
/// Unset fields fall back to the ambient state, so a config launched from
/// inside a compute body inherits the surrounding page and scope.
pub struct LaunchConfig {
    pub target: LaunchTarget,
    /// Enqueue into the surrounding drain instead of starting a new one.
    pub defer: bool,
    /// Drain this queue instead of selecting one.
    pub queue: Option<Rc<RefCell<Queue>>>,
    /// Page overlay for the seeded activations.
    pub page: Option<Rc<Page>>,
    /// Scope for the seeded activations.
    pub scope: Option<Rc<Scope>>,
    /// Parent activation for the seeded stacks.
    pub stack: Option<Rc<RefCell<Stack>>>,
    /// Metadata attached to the seeded stacks.
    pub meta: Option<Value>,
}

impl LaunchConfig {
    /// Launch a single unit, with everything else ambient.
    pub fn new(unit: &impl Unit, payload: Value) -> Self {
        Self {
            target: LaunchTarget::Single(unit.graph(), payload),
            defer: false,
            queue: None,
            page: None,
            scope: None,
            stack: None,
            meta: None,
        }
    }

    /// Launch a batch of units, with everything else ambient.
    pub fn batch(pairs: impl IntoIterator<Item = (Rc<Node>, Value)>) -> Self {
        Self {
            target: LaunchTarget::Batch(pairs.into_iter().collect()),
            defer: false,
            queue: None,
            page: None,
            scope: None,
            stack: None,
            meta: None,
        }
    }

    pub fn deferred(mut self) -> Self {
        self.defer = true;
        self
    }

    pub fn with_scope(mut self, scope: &Rc<Scope>) -> Self {
        self.scope = Some(scope.clone());
        self
    }

    pub fn with_page(mut self, page: &Rc<Page>) -> Self {
        self.page = Some(page.clone());
        self
    }
}

/// Launch a unit with a payload and drain to completion.
pub fn launch(unit: &impl Unit, payload: Value) {
    launch_config(LaunchConfig::new(unit, payload));
}

/// Launch a unit, folding into the surrounding drain when one is active.
pub fn launch_deferred(unit: &impl Unit, payload: Value) {
    launch_config(LaunchConfig::new(unit, payload).deferred());
}

/// Launch with full control over queue, page, scope, and parent stack.
pub fn launch_config(config: LaunchConfig) {
    let LaunchConfig {
        target,
        defer,
        queue,
        page,
        scope,
        stack,
        meta,
    } = config;

    let page_for_launch = page.or_else(ambient::current_page);
    let scope_for_launch = scope.or_else(ambient::fork_page);

    // A nested launch into a different scope must not inherit the outer one.
    if let Some(wanted) = &scope_for_launch
        && let Some(active) = &ambient::fork_page()
        && !Rc::ptr_eq(wanted, active)
    {
        ambient::set_fork_page(None);
    }

    let queue = match queue {
        Some(queue) => queue,
        None if defer => ambient::current_queue()
            .unwrap_or_else(|| Rc::new(RefCell::new(Queue::new()))),
        None => Rc::new(RefCell::new(Queue::new())),
    };

    {
        let mut seeding = queue.borrow_mut();
        match target {
            LaunchTarget::Single(node, payload) => {
                debug!(node = %node.id, defer, "launch");
                seeding.push_first(
                    Priority::Pure,
                    page_for_launch,
                    node,
                    stack,
                    payload,
                    scope_for_launch,
                    meta,
                );
            }
            LaunchTarget::Batch(pairs) => {
                debug!(targets = pairs.len(), defer, "batch launch");
                for (node, payload) in pairs {
                    seeding.push_first(
                        Priority::Pure,
                        page_for_launch.clone(),
                        node,
                        stack.clone(),
                        payload,
                        scope_for_launch.clone(),
                        meta.clone(),
                    );
                }
            }
        }
    }

    if defer && !ambient::is_root() {
        trace!("deferred launch folded into the active drain");
        return;
    }
    exec(queue);
}

/// Drain `queue` until empty, then restore the ambient state.
fn exec(queue: Rc<RefCell<Queue>>) {
    let snapshot = ambient::enter_drain(queue.clone());
    trace!("drain start");
    loop {
        let layer = queue.borrow_mut().delete_min();
        let Some(layer) = layer else { break };
        run_layer(&queue, layer);
    }
    trace!("drain complete");
    ambient::restore(snapshot);
}

/// The registry a `mov` consults for materialized cells.
enum RegOwner {
    Page(Rc<Page>),
    Scope(Rc<Scope>),
    None,
}

impl RegOwner {
    fn get(&self, id: &RefId) -> Option<Rc<StateRef>> {
        match self {
            RegOwner::Page(page) => page.reg.borrow().get(id).cloned(),
            RegOwner::Scope(scope) => scope.reg.borrow().get(id).cloned(),
            RegOwner::None => None,
        }
    }

    fn contains(&self, id: &RefId) -> bool {
        match self {
            RegOwner::Page(page) => page.reg.borrow().contains_key(id),
            RegOwner::Scope(scope) => scope.reg.borrow().contains_key(id),
            RegOwner::None => false,
        }
    }
}

/// Execute one layer: run its node's steps from `layer.idx`, then seed
/// successors unless the node failed, filtered out, or deferred to a
/// different priority class.
fn run_layer(queue: &Rc<RefCell<Queue>>, layer: Layer) {
    let Layer {
        idx,
        stack,
        priority,
        ..
    } = layer;
    let node = stack.borrow().node.clone();

    let page = stack.borrow().page.clone();
    let scope = get_fork_page(&stack);
    ambient::set_current_page(page.clone());
    ambient::set_fork_page(scope.clone());

    let mut reg = match (&page, &scope) {
        (Some(page), _) => RegOwner::Page(page.clone()),
        (None, Some(scope)) => RegOwner::Scope(scope.clone()),
        (None, None) => RegOwner::None,
    };

    trace!(node = %node.id, ?priority, idx, "layer");

    let mut local = Local::default();
    let mut skip = false;

    let mut stepn = idx;
    while stepn < node.seq.len() {
        let step = &node.seq[stepn];

        if let Some(order) = &step.order {
            let key = order.barrier_id.map(|id| match &stack.borrow().page {
                Some(page) => BarrierKey::Paged {
                    page: page.full_id.clone(),
                    id,
                },
                None => BarrierKey::Bare(id),
            });
            if stepn != idx || priority != order.priority {
                let mut q = queue.borrow_mut();
                match (key, order.barrier_id) {
                    (Some(key), Some(barrier_id)) => {
                        if q.barriers.contains(&key) {
                            trace!(node = %node.id, barrier_id, "arrival collapsed into pending barrier");
                        } else {
                            q.barriers.insert(key);
                            q.push(stepn, stack.clone(), order.priority, barrier_id);
                        }
                    }
                    _ => q.push(stepn, stack.clone(), order.priority, 0),
                }
                // Abandoned; the re-enqueued layer resumes at this step.
                return;
            }
            if let Some(key) = key {
                queue.borrow_mut().barriers.remove(&key);
            }
        }

        match &step.kind {
            StepKind::Mov { from, to } => run_mov(&stack, &scope, &mut reg, from, to),
            StepKind::Compute { body, pure, filter } => {
                if let Some(body) = body {
                    let was_watch = ambient::is_watch();
                    let was_pure = ambient::is_pure();
                    ambient::set_is_watch(node.meta.op == Some(OpKind::Watch));
                    ambient::set_is_pure(*pure);

                    let mut args = ComputeArgs {
                        value: get_value(&stack),
                        bag: &node.bag,
                        stack: &stack,
                    };
                    let computed = match body {
                        StepFn::Safe(body) => Some(body(&mut args)),
                        StepFn::Fallible(body) => match body(&mut args) {
                            Ok(value) => Some(value),
                            Err(failure) => {
                                error!(node = %node.id, %failure, "compute step failed");
                                local.fail = true;
                                local.fail_reason = Some(failure);
                                None
                            }
                        },
                    };

                    if *filter {
                        skip = !computed.as_ref().is_some_and(is_truthy);
                    } else if let Some(value) = computed {
                        stack.borrow_mut().value = value;
                    }

                    ambient::set_is_watch(was_watch);
                    ambient::set_is_pure(was_pure);
                }
            }
        }

        if local.fail || skip {
            break;
        }
        stepn += 1;
    }

    if let Some(inspector) = ambient::inspector() {
        inspector(&stack, &local);
    }

    if local.fail || skip {
        return;
    }

    // Seed successors with the finalized value.
    let final_value = get_value(&stack);
    let current_page = ambient::current_page();
    let mut q = queue.borrow_mut();
    for child in node.next.borrow().iter() {
        q.push_first(
            Priority::Child,
            current_page.clone(),
            child.clone(),
            Some(stack.clone()),
            final_value.clone(),
            scope.clone(),
            None,
        );
    }
    if let Some(fork) = &scope {
        let mut seed = |link: &Rc<Node>| {
            q.push_first(
                Priority::Child,
                current_page.clone(),
                link.clone(),
                Some(stack.clone()),
                final_value.clone(),
                scope.clone(),
                None,
            );
        };
        if node.meta.need_fx_counter && let Some(counter) = &fork.fx_count {
            seed(counter);
        }
        if node.meta.store_change && let Some(hook) = &fork.store_change {
            seed(hook);
        }
        if node.meta.warn_serialize && let Some(hook) = &fork.warn_serialize_node {
            seed(hook);
        }
        if let Some(links) = fork.additional_links.borrow().get(&node.id) {
            for link in links {
                seed(link);
            }
        }
    }
}

/// Execute a `mov` step.
///
/// Reading from a store walks the page chain and may rebind the
/// activation's page (and the ambient current page) to the owning page,
/// or materialize the cell in the scope; later steps observe the rebind.
fn run_mov(
    stack: &Rc<RefCell<Stack>>,
    scope: &Option<Rc<Scope>>,
    reg: &mut RegOwner,
    from: &MovSource,
    to: &MovTarget,
) {
    let value = match from {
        MovSource::Stack => get_value(stack),
        MovSource::RegA => stack.borrow().a.clone(),
        MovSource::RegB => stack.borrow().b.clone(),
        MovSource::Literal(value) => value.clone(),
        MovSource::Store { store, soft_read } => {
            if !reg.contains(&store.id) {
                let page = stack.borrow().page.clone();
                if let Some(page) = page {
                    let owner = get_page_for_ref(&page, &store.id);
                    stack.borrow_mut().page = owner.clone();
                    ambient::set_current_page(owner.clone());
                    match owner {
                        Some(owner) => *reg = RegOwner::Page(owner),
                        None => {
                            if let Some(scope) = scope {
                                init_ref_in_scope(scope, store, false, true, *soft_read);
                                *reg = RegOwner::Scope(scope.clone());
                            }
                        }
                    }
                } else if let Some(scope) = scope {
                    init_ref_in_scope(scope, store, false, true, *soft_read);
                    *reg = RegOwner::Scope(scope.clone());
                }
            }
            match reg.get(&store.id) {
                Some(cell) => read_ref(&cell),
                None => read_ref(store),
            }
        }
    };

    match to {
        MovTarget::Stack => stack.borrow_mut().value = value,
        MovTarget::RegA => stack.borrow_mut().a = value,
        MovTarget::RegB => stack.borrow_mut().b = value,
        MovTarget::Store(target) => {
            let page = stack.borrow().page.clone();
            let cell = get_page_ref(page.as_ref(), scope.as_ref(), target, false);
            *cell.current.borrow_mut() = value;
        }
    }
}
