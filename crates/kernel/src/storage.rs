//! State cells and overlays
//!
//! A [`StateRef`] is the logical state cell. Pages overlay it with
//! per-instance values along a parent chain; scopes overlay it with an
//! isolated universe whose cells materialize lazily on first touch. Reads
//! always resolve to the innermost applicable cell: page chain, then
//! scope, then the ref itself.

use std::cell::RefCell;
use std::rc::Rc;

use indexmap::IndexMap;
use tracing::{trace, warn};

use crate::node::Node;
use crate::types::{NodeId, RefId, Sid, Value};

/// Registry of materialized cells.
pub type Reg = IndexMap<RefId, Rc<StateRef>>;

/// Mapping applied by a `map` derivation command.
pub type MapFn = Rc<dyn Fn(&Value) -> Value>;

/// Parser applied when restoring a serialized value.
pub type ReadFn = Rc<dyn Fn(&Value) -> Value>;

/// Derivation command used to lazily build a scope-local value.
#[derive(Clone)]
pub enum BeforeCmd {
    /// Derive from an upstream ref, optionally through a mapping function.
    Map {
        from: Option<Rc<StateRef>>,
        map: Option<MapFn>,
    },
    /// Patch one field from an upstream ref into the current value.
    Field { from: Rc<StateRef>, field: String },
}

/// How a cell participates in scope serialization.
#[derive(Clone)]
pub enum SerializePolicy {
    /// Serialized values bypass any codec for this cell.
    Ignore,
    /// Restore through a custom parser.
    Codec { read: Option<ReadFn> },
}

/// Cell metadata.
#[derive(Clone, Default)]
pub struct RefMeta {
    pub serialize: Option<SerializePolicy>,
}

/// A logical state cell.
pub struct StateRef {
    pub id: RefId,
    /// Live value of the cell.
    pub current: RefCell<Value>,
    /// Creation-time default, used when a scope materializes the cell.
    pub initial: Value,
    /// Stable id matching serialized scope values.
    pub sid: Option<Sid>,
    pub meta: Option<RefMeta>,
    /// Commands run when a scope materializes the cell.
    pub before: Vec<BeforeCmd>,
    /// Skip derivation during plain traversal; forced reads still derive.
    pub no_init: bool,
}

impl StateRef {
    /// New cell holding `value`.
    pub fn new(id: impl Into<RefId>, value: Value) -> Self {
        Self {
            id: id.into(),
            current: RefCell::new(value.clone()),
            initial: value,
            sid: None,
            meta: None,
            before: Vec::new(),
            no_init: false,
        }
    }

    pub fn with_sid(mut self, sid: impl Into<Sid>) -> Self {
        self.sid = Some(sid.into());
        self
    }

    pub fn with_before(mut self, before: Vec<BeforeCmd>) -> Self {
        self.before = before;
        self
    }

    pub fn with_serialize(mut self, policy: SerializePolicy) -> Self {
        self.meta = Some(RefMeta {
            serialize: Some(policy),
        });
        self
    }

    pub fn skip_init(mut self) -> Self {
        self.no_init = true;
        self
    }

    pub fn shared(self) -> Rc<Self> {
        Rc::new(self)
    }
}

/// Current value of a cell.
pub fn read_ref(cell: &Rc<StateRef>) -> Value {
    cell.current.borrow().clone()
}

/// A node in the tree of per-instance state overlays.
pub struct Page {
    /// Cells owned by this overlay.
    pub reg: RefCell<Reg>,
    pub parent: Option<Rc<Page>>,
    /// Stable identity, used to namespace barrier keys.
    pub full_id: String,
}

impl Page {
    pub fn new(full_id: impl Into<String>, parent: Option<Rc<Page>>) -> Rc<Self> {
        Rc::new(Self {
            reg: RefCell::new(Reg::default()),
            parent,
            full_id: full_id.into(),
        })
    }

    /// Place a cell into this overlay's registry.
    pub fn install(&self, cell: Rc<StateRef>) {
        self.reg.borrow_mut().insert(cell.id.clone(), cell);
    }
}

/// Initial values a scope is created with.
#[derive(Default)]
pub struct ScopeValues {
    /// Values keyed by ref id.
    pub id_map: IndexMap<RefId, Value>,
    /// Values keyed by stable serialization id.
    pub sid_map: IndexMap<Sid, Value>,
}

/// A fork: an isolated state universe.
pub struct Scope {
    /// Cells materialized so far.
    pub reg: RefCell<Reg>,
    /// Values seeded at creation.
    pub values: ScopeValues,
    /// Which ref consumed each sid; written once per sid.
    pub sid_id_map: RefCell<IndexMap<Sid, RefId>>,
    /// Seed values came from a serialized snapshot.
    pub from_serialize: bool,
    /// In-flight effect counter node.
    pub fx_count: Option<Rc<Node>>,
    /// Store-change hook node.
    pub store_change: Option<Rc<Node>>,
    /// Serialization warning hook node.
    pub warn_serialize_node: Option<Rc<Node>>,
    /// Extra successors attached per node within this scope.
    pub additional_links: RefCell<IndexMap<NodeId, Vec<Rc<Node>>>>,
}

impl Scope {
    /// Empty scope with no seed values.
    pub fn new() -> Rc<Self> {
        Self::with_values(ScopeValues::default(), false)
    }

    pub fn with_values(values: ScopeValues, from_serialize: bool) -> Rc<Self> {
        Self::bare(values, from_serialize).shared()
    }

    /// Unshared scope; set hook nodes on it before calling [`Self::shared`].
    pub fn bare(values: ScopeValues, from_serialize: bool) -> Self {
        Self {
            reg: RefCell::new(Reg::default()),
            values,
            sid_id_map: RefCell::new(IndexMap::new()),
            from_serialize,
            fx_count: None,
            store_change: None,
            warn_serialize_node: None,
            additional_links: RefCell::new(IndexMap::new()),
        }
    }

    pub fn shared(self) -> Rc<Self> {
        Rc::new(self)
    }

    /// Scope seeded from a serialized snapshot keyed by sid.
    pub fn from_serialized(snapshot: serde_json::Map<String, Value>) -> Rc<Self> {
        let mut values = ScopeValues::default();
        for (sid, value) in snapshot {
            values.sid_map.insert(Sid(sid), value);
        }
        Self::with_values(values, true)
    }

    /// Attach an extra successor to fire after `node` within this scope.
    pub fn add_link(&self, node: &Node, link: Rc<Node>) {
        self.additional_links
            .borrow_mut()
            .entry(node.id)
            .or_default()
            .push(link);
    }

    /// Read a cell as seen from this scope, materializing it if needed.
    pub fn get_state(self: &Rc<Self>, source: &Rc<StateRef>) -> Value {
        init_ref_in_scope(self, source, true, false, false);
        let reg = self.reg.borrow();
        match reg.get(&source.id) {
            Some(cell) => read_ref(cell),
            None => read_ref(source),
        }
    }
}

/// Nearest page in the parent chain owning `id`.
pub fn get_page_for_ref(page: &Rc<Page>, id: &RefId) -> Option<Rc<Page>> {
    let mut cursor = Some(page.clone());
    while let Some(p) = cursor {
        if p.reg.borrow().contains_key(id) {
            return Some(p);
        }
        cursor = p.parent.clone();
    }
    None
}

/// Resolve a ref to the innermost applicable cell.
///
/// Page chain first, then the scope (materializing on demand), then the
/// ref itself.
pub fn get_page_ref(
    page: Option<&Rc<Page>>,
    scope: Option<&Rc<Scope>>,
    source: &Rc<StateRef>,
    is_get_state: bool,
) -> Rc<StateRef> {
    if let Some(page) = page
        && let Some(owner) = get_page_for_ref(page, &source.id)
    {
        let cell = owner.reg.borrow().get(&source.id).cloned();
        if let Some(cell) = cell {
            return cell;
        }
    }
    if let Some(scope) = scope {
        init_ref_in_scope(scope, source, is_get_state, false, false);
        if let Some(cell) = scope.reg.borrow().get(&source.id).cloned() {
            return cell;
        }
    }
    source.clone()
}

/// Materialize `source` inside `scope`. Idempotent: an existing cell is
/// left untouched and derivation commands never re-run.
///
/// The fresh cell starts from the ref's initial value, then the first
/// matching seed wins: an explicit id-keyed value, a sid-keyed serialized
/// value not yet claimed by another ref, or the `before` derivation chain.
/// `soft_read` skips derivation; `is_kernel_call` forces it even for
/// `no_init` refs.
pub fn init_ref_in_scope(
    scope: &Rc<Scope>,
    source: &Rc<StateRef>,
    is_get_state: bool,
    is_kernel_call: bool,
    soft_read: bool,
) {
    if scope.reg.borrow().contains_key(&source.id) {
        return;
    }

    let cell = StateRef {
        id: source.id.clone(),
        current: RefCell::new(source.initial.clone()),
        initial: source.initial.clone(),
        sid: None,
        meta: source.meta.clone(),
        before: Vec::new(),
        no_init: false,
    };

    let sid_seed = source.sid.as_ref().and_then(|sid| {
        if scope.sid_id_map.borrow().contains_key(sid) {
            return None;
        }
        scope.values.sid_map.get(sid).cloned()
    });

    if let Some(seed) = scope.values.id_map.get(&source.id) {
        *cell.current.borrow_mut() = seed.clone();
    } else if let Some(raw) = sid_seed {
        let read = match source.meta.as_ref().and_then(|m| m.serialize.as_ref()) {
            Some(SerializePolicy::Codec { read }) if scope.from_serialize => read.clone(),
            _ => None,
        };
        *cell.current.borrow_mut() = match read {
            Some(read) => read(&raw),
            None => raw,
        };
    } else if !source.before.is_empty() && !soft_read {
        let need_to_assign = is_get_state || !source.no_init || is_kernel_call;
        let mut is_fresh = false;
        for cmd in &source.before {
            match cmd {
                BeforeCmd::Map { from, map } => {
                    if from.is_none() && map.is_none() {
                        continue;
                    }
                    if let Some(from) = from {
                        init_ref_in_scope(scope, from, is_get_state, is_kernel_call, false);
                    }
                    if need_to_assign {
                        let upstream = from
                            .as_ref()
                            .and_then(|f| scope.reg.borrow().get(&f.id).map(read_ref))
                            .unwrap_or(Value::Null);
                        let derived = match map {
                            Some(map) => map(&upstream),
                            None => upstream,
                        };
                        *cell.current.borrow_mut() = derived;
                    }
                }
                BeforeCmd::Field { from, field } => {
                    init_ref_in_scope(scope, from, is_get_state, is_kernel_call, false);
                    if need_to_assign {
                        if !is_fresh {
                            let mut current = cell.current.borrow_mut();
                            if !matches!(&*current, Value::Array(_) | Value::Object(_)) {
                                warn!(id = %source.id, "field derivation over a non-container value");
                                *current = Value::Object(serde_json::Map::new());
                            }
                            is_fresh = true;
                        }
                        let upstream = scope
                            .reg
                            .borrow()
                            .get(&from.id)
                            .map(read_ref)
                            .unwrap_or(Value::Null);
                        match &mut *cell.current.borrow_mut() {
                            Value::Object(map) => {
                                map.insert(field.clone(), upstream);
                            }
                            Value::Array(items) => {
                                if let Ok(index) = field.parse::<usize>() {
                                    if index >= items.len() {
                                        items.resize(index + 1, Value::Null);
                                    }
                                    items[index] = upstream;
                                } else {
                                    warn!(id = %source.id, field, "non-index field patch on an array");
                                }
                            }
                            _ => {}
                        }
                    }
                }
            }
        }
    }

    if let Some(sid) = source.sid.clone() {
        scope
            .sid_id_map
            .borrow_mut()
            .entry(sid)
            .or_insert_with(|| source.id.clone());
    }
    trace!(id = %source.id, "scope cell materialized");
    scope.reg.borrow_mut().insert(source.id.clone(), Rc::new(cell));
}
