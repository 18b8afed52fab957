//! Ripple kernel
//!
//! A priority-ordered, reentrancy-safe reactive dataflow kernel. A launch
//! seeds a queue with root activations; the drain loop then propagates
//! values through the compiled graph, honoring per-step priority classes,
//! per-scope state isolation, and de-duplicated join barriers.
//!
//! The kernel is single-threaded cooperative: a drain owns its thread
//! until its queue is empty, and nested launches either fold into the
//! surrounding drain (deferred) or run a fresh queue to completion before
//! the outer step resumes.

pub mod ambient;
pub mod error;
pub mod executor;
pub mod node;
pub mod queue;
pub mod storage;
pub mod types;

pub use ambient::{InspectorFn, set_current_page, set_fork_page, set_inspector};
pub use error::{Error, Result, StepFailure};
pub use executor::{Local, LaunchConfig, LaunchTarget, launch, launch_config, launch_deferred};
pub use node::{
    ComputeArgs, MovSource, MovTarget, Node, NodeBuilder, Step, StepFn, StepKind, StepOrder, Unit,
};
pub use queue::{BarrierKey, Layer, Queue, Stack, get_fork_page, get_value};
pub use storage::{
    BeforeCmd, MapFn, Page, ReadFn, Reg, RefMeta, Scope, ScopeValues, SerializePolicy, StateRef,
    get_page_for_ref, get_page_ref, init_ref_in_scope, read_ref,
};
pub use types::{NodeId, NodeMeta, OpKind, Priority, RefId, Sid, Value, is_truthy};
