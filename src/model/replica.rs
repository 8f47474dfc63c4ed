//! Replica side of a model binding: a sparse, self-invalidating cache.
//!
//! Items live in an arena keyed by [`ItemId`]s that are never reused, so a
//! [`ModelIndex`] stays meaningful across unrelated structural edits and
//! becomes invalid (instead of silently pointing elsewhere) once its row is
//! removed, evicted, or the model is reset.
//!
//! Nothing here blocks. `data()` answers from the cache or queues a fetch;
//! queued work leaves through [`ModelReplica::take_outgoing`] as one batched
//! request per flush.

use super::{model_signature, Role, DISPLAY_ROLE, MODEL_TYPE_NAME};
use crate::config::{InitialAction, ModelCacheConfig};
use crate::error::{RemoteObjectsError, Result};
use crate::packet::{CellValue, FetchItem, FetchResult, HandshakeStatus, Packet, RoleName, StructKind};
use crate::replica::ReplicaState;
use crate::types::{IndexPath, IndexStep, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{debug, error, info, warn};

const LOG_TARGET: &str = "remote_objects::models";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct ItemId(u64);

const ROOT: ItemId = ItemId(0);

/// Persistent handle to a replicated cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModelIndex {
    id: ItemId,
}

impl ModelIndex {
    pub fn is_root(&self) -> bool {
        self.id == ROOT
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DataState {
    Available(Value),
    /// A fetch is queued or in flight.
    NotYetAvailable,
}

impl DataState {
    pub fn value(&self) -> Option<&Value> {
        match self {
            DataState::Available(value) => Some(value),
            DataState::NotYetAvailable => None,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, DataState::Available(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModelEvent {
    StateChanged {
        from: ReplicaState,
        to: ReplicaState,
    },
    /// Root size known and, with `PrefetchData`, the first page loaded.
    Initialized,
    /// Every index was invalidated.
    ModelReset,
    SizeKnown {
        parent: ModelIndex,
        rows: u32,
        columns: u32,
    },
    RowsInserted {
        parent: ModelIndex,
        first: u32,
        last: u32,
    },
    RowsRemoved {
        parent: ModelIndex,
        first: u32,
        last: u32,
    },
    DataChanged {
        index: ModelIndex,
        roles: Vec<Role>,
    },
    FetchesCancelled {
        count: usize,
    },
}

#[derive(Debug)]
struct Children {
    rows: u32,
    columns: u32,
    cells: BTreeMap<(u32, u32), ItemId>,
}

impl Children {
    fn new(rows: u32, columns: u32) -> Self {
        Self {
            rows,
            columns,
            cells: BTreeMap::new(),
        }
    }

    fn row_cells(&self, row: u32) -> impl Iterator<Item = ItemId> + '_ {
        self.cells
            .range((row, 0)..=(row, u32::MAX))
            .map(|(_, id)| *id)
    }
}

#[derive(Debug)]
struct Item {
    parent: ItemId,
    row: u32,
    column: u32,
    data: HashMap<Role, Value>,
    has_children: Option<bool>,
    /// Confirmed child structure; `None` until the source reported it.
    children: Option<Children>,
    last_access: u64,
}

pub struct ModelReplica {
    name: String,
    config: ModelCacheConfig,
    state: ReplicaState,
    generation: u64,
    initialized_once: bool,

    items: HashMap<ItemId, Item>,
    next_id: u64,
    clock: u64,

    role_names: BTreeMap<Role, String>,
    available_roles: Vec<Role>,
    headers: Vec<Value>,

    /// Every (item, role) requested and not yet answered.
    pending: HashSet<(ItemId, Role)>,
    /// Subset of `pending` not sent yet.
    queued: BTreeMap<ItemId, BTreeSet<Role>>,
    fetches_in_flight: HashMap<u64, Vec<(ItemId, Vec<Role>)>>,
    size_pending: HashSet<ItemId>,
    size_queued: BTreeSet<ItemId>,
    sizes_in_flight: HashMap<u64, ItemId>,
    /// Prefetched cells that gate `Initialized`.
    awaiting_initial: HashSet<(ItemId, Role)>,
    next_request_id: u64,

    events: Vec<ModelEvent>,
    outgoing: Vec<Packet>,
}

impl ModelReplica {
    pub fn new(name: impl Into<String>, config: ModelCacheConfig) -> Self {
        let mut items = HashMap::new();
        items.insert(ROOT, Self::root_item());
        Self {
            name: name.into(),
            config,
            state: ReplicaState::Uninitialized,
            generation: 0,
            initialized_once: false,
            items,
            next_id: 1,
            clock: 0,
            role_names: BTreeMap::new(),
            available_roles: Vec::new(),
            headers: Vec::new(),
            pending: HashSet::new(),
            queued: BTreeMap::new(),
            fetches_in_flight: HashMap::new(),
            size_pending: HashSet::new(),
            size_queued: BTreeSet::new(),
            sizes_in_flight: HashMap::new(),
            awaiting_initial: HashSet::new(),
            next_request_id: 1,
            events: Vec::new(),
            outgoing: Vec::new(),
        }
    }

    fn root_item() -> Item {
        Item {
            parent: ROOT,
            row: 0,
            column: 0,
            data: HashMap::new(),
            has_children: None,
            children: None,
            last_access: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ModelCacheConfig {
        &self.config
    }

    pub fn state(&self) -> ReplicaState {
        self.state
    }

    pub fn is_valid(&self) -> bool {
        self.state == ReplicaState::Valid
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized_once
    }

    /// Structure generation mirrored from the source.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn role_names(&self) -> &BTreeMap<Role, String> {
        &self.role_names
    }

    pub fn available_roles(&self) -> &[Role] {
        &self.available_roles
    }

    pub fn header_data(&self, section: u32, role: Role) -> Option<&Value> {
        if role != DISPLAY_ROLE {
            return None;
        }
        self.headers.get(section as usize)
    }

    /// Number of (index, role) pairs requested and not yet answered.
    pub fn pending_fetches(&self) -> usize {
        self.pending.len()
    }

    /// Requests sent and not yet answered.
    pub fn requests_in_flight(&self) -> usize {
        self.fetches_in_flight.len() + self.sizes_in_flight.len()
    }

    pub fn take_events(&mut self) -> Vec<ModelEvent> {
        std::mem::take(&mut self.events)
    }

    /// Flushes queued fetches into batched requests and drains the queue.
    pub fn take_outgoing(&mut self) -> Vec<Packet> {
        self.flush_requests();
        std::mem::take(&mut self.outgoing)
    }

    fn set_state(&mut self, to: ReplicaState) {
        if self.state == to {
            return;
        }
        let from = self.state;
        self.state = to;
        debug!(target: LOG_TARGET, model = %self.name, %from, %to, "state changed");
        self.events.push(ModelEvent::StateChanged { from, to });
    }

    // ---- navigation ----------------------------------------------------

    pub fn root(&self) -> ModelIndex {
        ModelIndex { id: ROOT }
    }

    pub fn is_valid_index(&self, index: ModelIndex) -> bool {
        self.items.contains_key(&index.id)
    }

    pub fn row(&self, index: ModelIndex) -> Option<u32> {
        self.items.get(&index.id).map(|item| item.row)
    }

    pub fn column(&self, index: ModelIndex) -> Option<u32> {
        self.items.get(&index.id).map(|item| item.column)
    }

    pub fn parent(&self, index: ModelIndex) -> Option<ModelIndex> {
        if index.is_root() {
            return None;
        }
        let item = self.items.get(&index.id)?;
        Some(ModelIndex { id: item.parent })
    }

    /// Path from the root, as understood by the source.
    pub fn path(&self, index: ModelIndex) -> Option<IndexPath> {
        self.path_of(index.id)
    }

    /// `None` while the size is unknown; a size request is queued then.
    pub fn row_count(&mut self, parent: ModelIndex) -> Option<u32> {
        self.child_size(parent).map(|(rows, _)| rows)
    }

    pub fn column_count(&mut self, parent: ModelIndex) -> Option<u32> {
        self.child_size(parent).map(|(_, columns)| columns)
    }

    fn child_size(&mut self, parent: ModelIndex) -> Option<(u32, u32)> {
        let item = self.items.get(&parent.id)?;
        if let Some(children) = &item.children {
            return Some((children.rows, children.columns));
        }
        if item.has_children == Some(false) {
            return Some((0, 0));
        }
        self.request_size(parent.id);
        None
    }

    pub fn has_children(&self, index: ModelIndex) -> Option<bool> {
        let item = self.items.get(&index.id)?;
        match &item.children {
            Some(children) => Some(children.rows > 0),
            None => item.has_children,
        }
    }

    /// Child handle at `(row, column)` of `parent`.
    ///
    /// Fails with `InvalidIndex` without a round trip when the parent is gone,
    /// its size is not confirmed yet, or the position is out of bounds.
    pub fn index(&mut self, parent: ModelIndex, row: u32, column: u32) -> Result<ModelIndex> {
        let Some(item) = self.items.get(&parent.id) else {
            return Err(RemoteObjectsError::InvalidIndex(
                "parent index is no longer valid".to_string(),
            ));
        };
        let Some(children) = &item.children else {
            self.request_size(parent.id);
            return Err(RemoteObjectsError::InvalidIndex(
                "parent size is not known yet".to_string(),
            ));
        };
        if row >= children.rows || column >= children.columns {
            return Err(RemoteObjectsError::InvalidIndex(format!(
                "({row}, {column}) outside {}x{}",
                children.rows, children.columns
            )));
        }

        let id = match children.cells.get(&(row, column)).copied() {
            Some(id) => id,
            None => {
                let id = self.alloc(parent.id, row, column);
                self.touch(id);
                self.enforce_cache(parent.id, row);
                return Ok(ModelIndex { id });
            }
        };
        self.touch(id);
        Ok(ModelIndex { id })
    }

    // ---- data ----------------------------------------------------------

    /// Cached value, or `NotYetAvailable` after queueing a fetch.
    pub fn data(&mut self, index: ModelIndex, role: Role) -> Result<DataState> {
        if index.is_root() {
            return Err(RemoteObjectsError::InvalidIndex(
                "the root has no data".to_string(),
            ));
        }
        let tick = self.tick();
        let Some(item) = self.items.get_mut(&index.id) else {
            return Err(RemoteObjectsError::InvalidIndex(
                "index is no longer valid".to_string(),
            ));
        };
        item.last_access = tick;
        if let Some(value) = item.data.get(&role) {
            return Ok(DataState::Available(value.clone()));
        }
        if self.state == ReplicaState::Valid && self.pending.insert((index.id, role)) {
            self.queued.entry(index.id).or_default().insert(role);
        }
        Ok(DataState::NotYetAvailable)
    }

    /// Cached value without side effects.
    pub fn cached_data(&self, index: ModelIndex, role: Role) -> Option<&Value> {
        self.items.get(&index.id)?.data.get(&role)
    }

    /// Asks the source to write a cell. The cache changes only when the
    /// source echoes the write as dataChanged.
    pub fn set_data(&mut self, index: ModelIndex, role: Role, value: Value) -> Result<()> {
        if self.state != ReplicaState::Valid {
            return Err(RemoteObjectsError::NotValid {
                name: self.name.clone(),
                state: self.state.to_string(),
            });
        }
        let path = self
            .path_of(index.id)
            .filter(|path| !path.is_empty())
            .ok_or_else(|| RemoteObjectsError::InvalidIndex("index is no longer valid".to_string()))?;
        self.outgoing.push(Packet::ModelSetData {
            name: self.name.clone(),
            generation: self.generation,
            path,
            role,
            value,
        });
        Ok(())
    }

    /// Distinct rows of `parent` currently holding cached items.
    pub fn resident_rows(&self, parent: ModelIndex) -> usize {
        self.items
            .get(&parent.id)
            .and_then(|item| item.children.as_ref())
            .map_or(0, |children| {
                children
                    .cells
                    .keys()
                    .map(|(row, _)| *row)
                    .collect::<BTreeSet<_>>()
                    .len()
            })
    }

    // ---- binding lifecycle ---------------------------------------------

    pub fn start_handshake(&mut self) {
        if !matches!(self.state, ReplicaState::Uninitialized | ReplicaState::Suspect) {
            return;
        }
        self.set_state(ReplicaState::Handshaking);
        self.outgoing.push(Packet::Handshake {
            name: self.name.clone(),
            type_name: MODEL_TYPE_NAME.to_string(),
            signature: model_signature(),
        });
    }

    pub fn handle_packet(&mut self, packet: Packet) {
        match packet {
            Packet::HandshakeAck { status, .. } => self.handle_ack(status),
            Packet::ModelInitialState {
                generation,
                rows,
                columns,
                role_names,
                available_roles,
                headers,
                ..
            } => self.apply_initial_state(generation, rows, columns, role_names, available_roles, headers),
            Packet::ModelFetchReply {
                request_id,
                stale,
                results,
                ..
            } => self.apply_fetch_reply(request_id, stale, results),
            Packet::ModelSizeReply {
                request_id,
                stale,
                rows,
                columns,
                ..
            } => self.apply_size_reply(request_id, stale, rows, columns),
            Packet::ModelStructChanged {
                parent,
                kind,
                first,
                last,
                ..
            } if self.is_valid() => self.apply_struct_change(&parent, kind, first, last),
            Packet::ModelDataChanged {
                parent,
                top,
                left,
                bottom,
                right,
                roles,
                values,
                ..
            } if self.is_valid() => self.apply_data_change(&parent, (top, left), (bottom, right), roles, values),
            Packet::ModelReset { rows, columns, .. } if self.is_valid() => self.apply_reset(rows, columns),
            other => debug!(target: LOG_TARGET, model = %self.name, packet = ?other, "ignoring packet"),
        }
    }

    fn handle_ack(&mut self, status: HandshakeStatus) {
        match status {
            HandshakeStatus::Ok => {}
            HandshakeStatus::Mismatch { expected } => {
                error!(target: LOG_TARGET, model = %self.name, expected = %expected, "model source refused binding");
                self.cancel_requests();
                self.set_state(ReplicaState::SignatureMismatch);
            }
            HandshakeStatus::NoSuchSource => {
                info!(target: LOG_TARGET, model = %self.name, "peer does not host the model");
                self.cancel_requests();
                self.set_state(ReplicaState::Uninitialized);
            }
        }
    }

    fn apply_initial_state(
        &mut self,
        generation: u64,
        rows: u32,
        columns: u32,
        role_names: Vec<RoleName>,
        available_roles: Vec<Role>,
        headers: Vec<Value>,
    ) {
        if self.state != ReplicaState::Handshaking {
            warn!(target: LOG_TARGET, model = %self.name, state = %self.state, "unexpected initial state");
            return;
        }
        let reconnect = self.initialized_once;
        self.clear_cache(rows, columns);
        self.generation = generation;
        self.role_names = role_names.into_iter().map(|r| (r.role, r.name)).collect();
        self.available_roles = available_roles;
        self.headers = headers;
        self.set_state(ReplicaState::Valid);
        if reconnect {
            self.events.push(ModelEvent::ModelReset);
        }

        if self.config.initial_action == InitialAction::PrefetchData && rows > 0 && columns > 0 {
            let page = rows.min(u32::try_from(self.config.root_cache_size).unwrap_or(u32::MAX));
            let roles = if self.config.prefetch_roles.is_empty() {
                self.available_roles.clone()
            } else {
                self.config.prefetch_roles.clone()
            };
            for row in 0..page {
                for column in 0..columns {
                    let id = self.alloc(ROOT, row, column);
                    for role in &roles {
                        self.pending.insert((id, *role));
                        self.awaiting_initial.insert((id, *role));
                        self.queued.entry(id).or_default().insert(*role);
                    }
                }
            }
            info!(
                target: LOG_TARGET,
                model = %self.name,
                rows = page,
                roles = roles.len(),
                "prefetching first page"
            );
        }
        self.check_initialized();
    }

    fn check_initialized(&mut self) {
        if self.state == ReplicaState::Valid
            && self.awaiting_initial.is_empty()
            && !self.initialized_once
        {
            self.initialized_once = true;
            info!(target: LOG_TARGET, model = %self.name, "model replica initialized");
            self.events.push(ModelEvent::Initialized);
        }
    }

    fn apply_fetch_reply(&mut self, request_id: u64, stale: bool, results: Vec<FetchResult>) {
        let Some(wanted) = self.fetches_in_flight.remove(&request_id) else {
            debug!(target: LOG_TARGET, model = %self.name, request_id, "reply for unknown fetch");
            return;
        };

        if stale {
            // Re-issue at the positions the items have now.
            for (id, roles) in wanted {
                if !self.items.contains_key(&id) {
                    continue;
                }
                for role in roles {
                    if self.pending.contains(&(id, role)) {
                        self.queued.entry(id).or_default().insert(role);
                    }
                }
            }
            debug!(target: LOG_TARGET, model = %self.name, request_id, "stale fetch re-queued");
            return;
        }

        if results.len() != wanted.len() {
            warn!(
                target: LOG_TARGET,
                model = %self.name,
                expected = wanted.len(),
                got = results.len(),
                "fetch reply size mismatch"
            );
        }
        let mut discarded = 0usize;
        for ((id, roles), result) in wanted.into_iter().zip(results) {
            let Some(item) = self.items.get_mut(&id) else {
                // Evicted or removed while the request was in flight.
                discarded += 1;
                continue;
            };
            match result.values {
                Some(values) => {
                    item.has_children = Some(result.has_children);
                    for (role, value) in roles.iter().zip(values) {
                        item.data.insert(*role, value);
                    }
                }
                None => warn!(target: LOG_TARGET, model = %self.name, "source reported a missing index"),
            }
            for role in &roles {
                self.pending.remove(&(id, *role));
                self.awaiting_initial.remove(&(id, *role));
            }
            self.events.push(ModelEvent::DataChanged {
                index: ModelIndex { id },
                roles,
            });
        }
        if discarded > 0 {
            debug!(target: LOG_TARGET, model = %self.name, discarded, "results for dropped items discarded");
        }
        self.check_initialized();
    }

    fn apply_size_reply(&mut self, request_id: u64, stale: bool, rows: u32, columns: u32) {
        let Some(id) = self.sizes_in_flight.remove(&request_id) else {
            return;
        };
        if stale {
            if self.items.contains_key(&id) && self.size_pending.contains(&id) {
                self.size_queued.insert(id);
            }
            return;
        }
        self.size_pending.remove(&id);
        let Some(item) = self.items.get_mut(&id) else {
            return;
        };
        if item.children.is_none() {
            item.children = Some(Children::new(rows, columns));
            item.has_children = Some(rows > 0);
            self.events.push(ModelEvent::SizeKnown {
                parent: ModelIndex { id },
                rows,
                columns,
            });
        }
    }

    fn apply_struct_change(&mut self, parent: &[IndexStep], kind: StructKind, first: u32, last: u32) {
        self.generation += 1;
        if last < first {
            warn!(target: LOG_TARGET, model = %self.name, first, last, "empty structural change");
            return;
        }
        let Some(parent_id) = self.resolve_path(parent) else {
            // Nothing cached below an unknown parent.
            return;
        };
        let Some(item) = self.items.get_mut(&parent_id) else {
            return;
        };
        let Some(children) = item.children.as_mut() else {
            item.has_children = match kind {
                StructKind::Insert => Some(true),
                StructKind::Remove => None,
            };
            return;
        };

        let count = last - first + 1;
        let mut moved = Vec::new();
        let mut removed = Vec::new();
        let mut applied = (first, last);
        match kind {
            StructKind::Insert => {
                let tail = children.cells.split_off(&(first, 0));
                for ((row, column), id) in tail {
                    children.cells.insert((row + count, column), id);
                    moved.push((id, row + count));
                }
                children.rows += count;
                item.has_children = Some(true);
            }
            StructKind::Remove => {
                if first >= children.rows {
                    warn!(
                        target: LOG_TARGET,
                        model = %self.name,
                        first,
                        rows = children.rows,
                        "removal outside the known rows"
                    );
                    return;
                }
                let last = last.min(children.rows - 1);
                let count = last - first + 1;
                applied = (first, last);
                let mut tail = children.cells.split_off(&(first, 0));
                let after = tail.split_off(&(last + 1, 0));
                removed.extend(tail.into_values());
                for ((row, column), id) in after {
                    children.cells.insert((row - count, column), id);
                    moved.push((id, row - count));
                }
                children.rows -= count;
                item.has_children = Some(children.rows > 0);
            }
        }

        for (id, row) in moved {
            if let Some(item) = self.items.get_mut(&id) {
                item.row = row;
            }
        }
        let dropped = self.drop_items(removed);
        let parent = ModelIndex { id: parent_id };
        let (first, last) = applied;
        debug!(target: LOG_TARGET, model = %self.name, ?kind, first, last, dropped, "structure changed");
        self.events.push(match kind {
            StructKind::Insert => ModelEvent::RowsInserted { parent, first, last },
            StructKind::Remove => ModelEvent::RowsRemoved { parent, first, last },
        });
        if kind == StructKind::Remove {
            self.check_initialized();
        }
    }

    fn apply_data_change(
        &mut self,
        parent: &[IndexStep],
        (top, left): (u32, u32),
        (bottom, right): (u32, u32),
        roles: Vec<Role>,
        values: Vec<CellValue>,
    ) {
        let Some(parent_id) = self.resolve_path(parent) else {
            return;
        };
        let Some(children) = self.items.get(&parent_id).and_then(|i| i.children.as_ref()) else {
            return;
        };
        if bottom < top {
            return;
        }
        let targets: HashMap<(u32, u32), ItemId> = children
            .cells
            .range((top, 0)..=(bottom, u32::MAX))
            .filter(|((_, column), _)| (left..=right).contains(column))
            .map(|(key, id)| (*key, *id))
            .collect();

        for id in targets.values() {
            if let Some(item) = self.items.get_mut(id) {
                if roles.is_empty() {
                    item.data.clear();
                } else {
                    for role in &roles {
                        item.data.remove(role);
                    }
                }
            }
        }

        for cell in values {
            let Some(id) = targets.get(&(cell.row, cell.column)).copied() else {
                continue;
            };
            if let Some(item) = self.items.get_mut(&id) {
                item.data.insert(cell.role, cell.value);
            }
            // Satisfied without another round trip.
            self.pending.remove(&(id, cell.role));
            self.awaiting_initial.remove(&(id, cell.role));
            if let Some(queued) = self.queued.get_mut(&id) {
                queued.remove(&cell.role);
                if queued.is_empty() {
                    self.queued.remove(&id);
                }
            }
        }

        let mut changed: Vec<_> = targets.into_iter().collect();
        changed.sort_unstable();
        for (_, id) in changed {
            self.events.push(ModelEvent::DataChanged {
                index: ModelIndex { id },
                roles: roles.clone(),
            });
        }
        self.check_initialized();
    }

    fn apply_reset(&mut self, rows: u32, columns: u32) {
        self.generation += 1;
        self.clear_cache(rows, columns);
        info!(target: LOG_TARGET, model = %self.name, rows, columns, "model reset");
        self.events.push(ModelEvent::ModelReset);
        self.check_initialized();
    }

    /// Drops every item except the root; outstanding replies become orphans.
    fn clear_cache(&mut self, rows: u32, columns: u32) {
        self.items.clear();
        let mut root = Self::root_item();
        root.children = Some(Children::new(rows, columns));
        root.has_children = Some(rows > 0);
        self.items.insert(ROOT, root);
        self.pending.clear();
        self.queued.clear();
        self.size_pending.clear();
        self.size_queued.clear();
        self.awaiting_initial.clear();
    }

    fn cancel_requests(&mut self) -> usize {
        let count = self.pending.len() + self.size_pending.len();
        self.pending.clear();
        self.queued.clear();
        self.fetches_in_flight.clear();
        self.size_pending.clear();
        self.size_queued.clear();
        self.sizes_in_flight.clear();
        self.awaiting_initial.clear();
        self.outgoing.clear();
        if count > 0 {
            self.events.push(ModelEvent::FetchesCancelled { count });
        }
        count
    }

    /// Cached data is kept; every pending fetch is cancelled.
    pub fn channel_lost(&mut self) {
        let cancelled = self.cancel_requests();
        if cancelled > 0 {
            warn!(target: LOG_TARGET, model = %self.name, cancelled, "fetches cancelled by disconnect");
        }
        match self.state {
            ReplicaState::Valid => self.set_state(ReplicaState::Suspect),
            ReplicaState::Handshaking => {
                let next = if self.initialized_once {
                    ReplicaState::Suspect
                } else {
                    ReplicaState::Uninitialized
                };
                self.set_state(next);
            }
            _ => {}
        }
    }

    pub fn shutdown(&mut self) {
        self.cancel_requests();
        if matches!(self.state, ReplicaState::Valid | ReplicaState::Handshaking) {
            self.outgoing.push(Packet::Release {
                name: self.name.clone(),
            });
        }
    }

    // ---- arena ---------------------------------------------------------

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn touch(&mut self, id: ItemId) {
        let tick = self.tick();
        if let Some(item) = self.items.get_mut(&id) {
            item.last_access = tick;
        }
    }

    fn alloc(&mut self, parent: ItemId, row: u32, column: u32) -> ItemId {
        let id = ItemId(self.next_id);
        self.next_id += 1;
        self.items.insert(
            id,
            Item {
                parent,
                row,
                column,
                data: HashMap::new(),
                has_children: None,
                children: None,
                last_access: self.clock,
            },
        );
        if let Some(children) = self.items.get_mut(&parent).and_then(|p| p.children.as_mut()) {
            children.cells.insert((row, column), id);
        }
        id
    }

    fn path_of(&self, id: ItemId) -> Option<IndexPath> {
        let mut steps = Vec::new();
        let mut current = id;
        while current != ROOT {
            let item = self.items.get(&current)?;
            steps.push(IndexStep::new(item.row, item.column));
            current = item.parent;
        }
        steps.reverse();
        Some(steps)
    }

    fn resolve_path(&self, path: &[IndexStep]) -> Option<ItemId> {
        let mut current = ROOT;
        for step in path {
            let children = self.items.get(&current)?.children.as_ref()?;
            current = *children.cells.get(&(step.row, step.column))?;
        }
        Some(current)
    }

    /// Removes items and their subtrees, forgetting their pending requests.
    fn drop_items(&mut self, roots: Vec<ItemId>) -> usize {
        let mut removed = HashSet::new();
        let mut stack = roots;
        while let Some(id) = stack.pop() {
            if id == ROOT {
                continue;
            }
            if let Some(item) = self.items.remove(&id) {
                if let Some(children) = item.children {
                    stack.extend(children.cells.into_values());
                }
                removed.insert(id);
            }
        }
        if removed.is_empty() {
            return 0;
        }
        self.pending.retain(|(id, _)| !removed.contains(id));
        self.queued.retain(|id, _| !removed.contains(id));
        self.awaiting_initial.retain(|(id, _)| !removed.contains(id));
        self.size_pending.retain(|id| !removed.contains(id));
        self.size_queued.retain(|id| !removed.contains(id));
        removed.len()
    }

    /// Evicts least recently used rows of `parent` beyond the cache bound.
    fn enforce_cache(&mut self, parent: ItemId, keep_row: u32) {
        let limit = self.config.root_cache_size;
        let Some(children) = self.items.get(&parent).and_then(|p| p.children.as_ref()) else {
            return;
        };
        let mut row_access: BTreeMap<u32, u64> = BTreeMap::new();
        for (&(row, _), id) in &children.cells {
            let access = self.items.get(id).map_or(0, |item| item.last_access);
            let entry = row_access.entry(row).or_insert(0);
            *entry = (*entry).max(access);
        }
        if row_access.len() <= limit {
            return;
        }
        let excess = row_access.len() - limit;
        let mut candidates: Vec<(u64, u32)> = row_access
            .into_iter()
            .filter(|(row, _)| *row != keep_row)
            .map(|(row, access)| (access, row))
            .collect();
        candidates.sort_unstable();
        let victims: Vec<u32> = candidates.into_iter().take(excess).map(|(_, row)| row).collect();

        let mut evicted = Vec::new();
        if let Some(children) = self.items.get_mut(&parent).and_then(|p| p.children.as_mut()) {
            for row in &victims {
                let ids: Vec<ItemId> = children.row_cells(*row).collect();
                children.cells.retain(|(r, _), _| r != row);
                evicted.extend(ids);
            }
        }
        let dropped = self.drop_items(evicted);
        debug!(target: LOG_TARGET, model = %self.name, rows = victims.len(), dropped, "evicted rows");
    }

    fn flush_requests(&mut self) {
        if self.state != ReplicaState::Valid {
            return;
        }
        if !self.queued.is_empty() {
            let mut items = Vec::new();
            let mut wanted = Vec::new();
            for (id, roles) in std::mem::take(&mut self.queued) {
                let Some(path) = self.path_of(id) else {
                    continue;
                };
                let roles: Vec<Role> = roles.into_iter().collect();
                items.push(FetchItem {
                    path,
                    roles: roles.clone(),
                });
                wanted.push((id, roles));
            }
            if !items.is_empty() {
                let request_id = self.next_request();
                debug!(target: LOG_TARGET, model = %self.name, request_id, items = items.len(), "fetch request");
                self.fetches_in_flight.insert(request_id, wanted);
                self.outgoing.push(Packet::ModelFetchRequest {
                    name: self.name.clone(),
                    request_id,
                    generation: self.generation,
                    items,
                });
            }
        }
        for id in std::mem::take(&mut self.size_queued) {
            let Some(path) = self.path_of(id) else {
                continue;
            };
            let request_id = self.next_request();
            self.sizes_in_flight.insert(request_id, id);
            self.outgoing.push(Packet::ModelSizeRequest {
                name: self.name.clone(),
                request_id,
                generation: self.generation,
                path,
            });
        }
    }

    fn next_request(&mut self) -> u64 {
        let id = self.next_request_id;
        self.next_request_id += 1;
        id
    }

    fn request_size(&mut self, id: ItemId) {
        if self.state != ReplicaState::Valid {
            return;
        }
        if self.size_pending.insert(id) {
            self.size_queued.insert(id);
        }
    }
}
