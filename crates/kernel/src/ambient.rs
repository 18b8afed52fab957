//! Ambient drain state
//!
//! The kernel keeps its cross-cutting execution state in a thread-local
//! context: the active page and scope, the purity flags, and the queue the
//! current drain is consuming. Drains snapshot this state on entry and
//! restore it on exit, which is what makes nested launches safe.

use std::cell::RefCell;
use std::rc::Rc;

use crate::executor::Local;
use crate::queue::{Queue, Stack};
use crate::storage::{Page, Scope};

/// Observer invoked after each node activation's step loop completes,
/// successfully or not. Best effort: no retry, no failure semantics.
pub type InspectorFn = Rc<dyn Fn(&Rc<RefCell<Stack>>, &Local)>;

pub(crate) struct Ambient {
    pub current_page: Option<Rc<Page>>,
    pub fork_page: Option<Rc<Scope>>,
    pub is_watch: bool,
    pub is_pure: bool,
    pub is_root: bool,
    pub current_queue: Option<Rc<RefCell<Queue>>>,
    pub inspector: Option<InspectorFn>,
}

impl Default for Ambient {
    fn default() -> Self {
        Self {
            current_page: None,
            fork_page: None,
            is_watch: false,
            is_pure: false,
            is_root: true,
            current_queue: None,
            inspector: None,
        }
    }
}

thread_local! {
    static AMBIENT: RefCell<Ambient> = RefCell::new(Ambient::default());
}

fn with<R>(f: impl FnOnce(&mut Ambient) -> R) -> R {
    AMBIENT.with(|ambient| f(&mut ambient.borrow_mut()))
}

/// Restorable subset of the ambient state, captured at drain entry.
pub(crate) struct Snapshot {
    current_page: Option<Rc<Page>>,
    fork_page: Option<Rc<Scope>>,
    is_watch: bool,
    is_pure: bool,
    is_root: bool,
    current_queue: Option<Rc<RefCell<Queue>>>,
}

/// Capture the restorable state and mark the drain entered: the context is
/// no longer at root and `queue` becomes the current queue.
pub(crate) fn enter_drain(queue: Rc<RefCell<Queue>>) -> Snapshot {
    with(|ambient| {
        let snapshot = Snapshot {
            current_page: ambient.current_page.clone(),
            fork_page: ambient.fork_page.clone(),
            is_watch: ambient.is_watch,
            is_pure: ambient.is_pure,
            is_root: ambient.is_root,
            current_queue: ambient.current_queue.clone(),
        };
        ambient.is_root = false;
        ambient.current_queue = Some(queue);
        snapshot
    })
}

pub(crate) fn restore(snapshot: Snapshot) {
    with(|ambient| {
        ambient.current_page = snapshot.current_page;
        ambient.fork_page = snapshot.fork_page;
        ambient.is_watch = snapshot.is_watch;
        ambient.is_pure = snapshot.is_pure;
        ambient.is_root = snapshot.is_root;
        ambient.current_queue = snapshot.current_queue;
    });
}

/// Page active for the layer currently executing.
pub fn current_page() -> Option<Rc<Page>> {
    with(|ambient| ambient.current_page.clone())
}

/// Override the ambient page (test and introspection harnesses).
pub fn set_current_page(page: Option<Rc<Page>>) {
    with(|ambient| ambient.current_page = page);
}

/// Scope active for the layer currently executing.
pub fn fork_page() -> Option<Rc<Scope>> {
    with(|ambient| ambient.fork_page.clone())
}

/// Override the ambient scope (test and introspection harnesses).
pub fn set_fork_page(scope: Option<Rc<Scope>>) {
    with(|ambient| ambient.fork_page = scope);
}

/// Whether a watch body is currently running.
pub fn is_watch() -> bool {
    with(|ambient| ambient.is_watch)
}

pub(crate) fn set_is_watch(value: bool) {
    with(|ambient| ambient.is_watch = value);
}

/// Whether a pure computation is currently running.
pub fn is_pure() -> bool {
    with(|ambient| ambient.is_pure)
}

pub(crate) fn set_is_pure(value: bool) {
    with(|ambient| ambient.is_pure = value);
}

/// Whether no drain is currently running.
pub fn is_root() -> bool {
    with(|ambient| ambient.is_root)
}

pub(crate) fn current_queue() -> Option<Rc<RefCell<Queue>>> {
    with(|ambient| ambient.current_queue.clone())
}

/// Install the inspector; replaces any prior observer. Pass `None` to
/// remove it.
pub fn set_inspector(inspector: Option<InspectorFn>) {
    with(|ambient| ambient.inspector = inspector);
}

pub(crate) fn inspector() -> Option<InspectorFn> {
    with(|ambient| ambient.inspector.clone())
}
