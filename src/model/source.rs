use super::{
    child_path, contains_index, model_signature, ItemModel, ModelChange, Role, RowData,
    DISPLAY_ROLE,
};
use crate::packet::{
    CellValue, FetchItem, FetchResult, HandshakeStatus, Packet, RoleName, StructKind,
};
use crate::types::{ChannelId, IndexPath, IndexStep, Value};
use std::collections::BTreeSet;
use tracing::{debug, error, info, warn};

const LOG_TARGET: &str = "remote_objects::models";

/// Source side of a model binding.
///
/// Every structural change bumps `generation`. Replica requests carry the
/// generation their paths were computed against; requests from an older
/// structure are answered `stale` rather than resolved against shifted rows.
pub struct ModelExporter {
    name: String,
    model: Box<dyn ItemModel>,
    generation: u64,
    channels: BTreeSet<ChannelId>,
    max_pushed_cells: usize,
    outgoing: Vec<(ChannelId, Packet)>,
}

impl ModelExporter {
    pub fn new(name: impl Into<String>, model: Box<dyn ItemModel>, max_pushed_cells: usize) -> Self {
        Self {
            name: name.into(),
            model,
            generation: 0,
            channels: BTreeSet::new(),
            max_pushed_cells,
            outgoing: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn model(&self) -> &dyn ItemModel {
        self.model.as_ref()
    }

    /// Direct access for edits the caller reports with [`ModelExporter::notify`].
    pub fn model_mut(&mut self) -> &mut dyn ItemModel {
        self.model.as_mut()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_bound(&self, channel: ChannelId) -> bool {
        self.channels.contains(&channel)
    }

    pub fn bound_channels(&self) -> impl Iterator<Item = ChannelId> + '_ {
        self.channels.iter().copied()
    }

    pub fn take_outgoing(&mut self) -> Vec<(ChannelId, Packet)> {
        std::mem::take(&mut self.outgoing)
    }

    pub fn handle_packet(&mut self, channel: ChannelId, packet: Packet) {
        match packet {
            Packet::Handshake { signature, .. } => self.handle_handshake(channel, &signature),
            Packet::ModelFetchRequest {
                request_id,
                generation,
                items,
                ..
            } => self.handle_fetch(channel, request_id, generation, items),
            Packet::ModelSizeRequest {
                request_id,
                generation,
                path,
                ..
            } => self.handle_size(channel, request_id, generation, &path),
            Packet::ModelSetData {
                generation,
                path,
                role,
                value,
                ..
            } => self.handle_set_data(channel, generation, &path, role, value),
            Packet::Release { .. } => self.release(channel),
            other => debug!(
                target: LOG_TARGET,
                model = %self.name,
                packet = ?other,
                "ignoring packet not addressed to a model source"
            ),
        }
    }

    pub fn handle_handshake(&mut self, channel: ChannelId, signature: &str) {
        let expected = model_signature();
        if signature != expected {
            error!(target: LOG_TARGET, model = %self.name, %channel, "model replica signature mismatch");
            self.outgoing.push((
                channel,
                Packet::HandshakeAck {
                    name: self.name.clone(),
                    status: HandshakeStatus::Mismatch { expected },
                },
            ));
            return;
        }

        self.channels.insert(channel);
        info!(target: LOG_TARGET, model = %self.name, %channel, "model replica bound");
        let role_names = self.model.role_names();
        let columns = self.model.column_count(&[]);
        let state = Packet::ModelInitialState {
            name: self.name.clone(),
            generation: self.generation,
            rows: self.model.row_count(&[]),
            columns,
            available_roles: role_names.keys().copied().collect(),
            role_names: role_names
                .into_iter()
                .map(|(role, name)| RoleName { role, name })
                .collect(),
            headers: (0..columns)
                .map(|section| self.model.header_data(section, DISPLAY_ROLE))
                .collect(),
        };
        self.outgoing.push((
            channel,
            Packet::HandshakeAck {
                name: self.name.clone(),
                status: HandshakeStatus::Ok,
            },
        ));
        self.outgoing.push((channel, state));
    }

    fn handle_fetch(
        &mut self,
        channel: ChannelId,
        request_id: u64,
        generation: u64,
        items: Vec<FetchItem>,
    ) {
        let stale = generation != self.generation;
        let results = if stale {
            debug!(
                target: LOG_TARGET,
                model = %self.name,
                request_id,
                requested = generation,
                current = self.generation,
                "stale fetch request"
            );
            Vec::new()
        } else {
            items.iter().map(|item| self.fetch_one(item)).collect()
        };
        self.outgoing.push((
            channel,
            Packet::ModelFetchReply {
                name: self.name.clone(),
                request_id,
                stale,
                results,
            },
        ));
    }

    fn fetch_one(&self, item: &FetchItem) -> FetchResult {
        if item.path.is_empty() || !contains_index(self.model.as_ref(), &item.path) {
            return FetchResult {
                values: None,
                has_children: false,
            };
        }
        let values = item
            .roles
            .iter()
            .map(|role| self.model.data(&item.path, *role).unwrap_or_default())
            .collect();
        FetchResult {
            values: Some(values),
            has_children: self.model.has_children(&item.path),
        }
    }

    fn handle_size(&mut self, channel: ChannelId, request_id: u64, generation: u64, path: &[IndexStep]) {
        let stale = generation != self.generation;
        let (rows, columns) = if !stale && contains_index(self.model.as_ref(), path) {
            (self.model.row_count(path), self.model.column_count(path))
        } else {
            (0, 0)
        };
        self.outgoing.push((
            channel,
            Packet::ModelSizeReply {
                name: self.name.clone(),
                request_id,
                stale,
                rows,
                columns,
            },
        ));
    }

    fn handle_set_data(
        &mut self,
        channel: ChannelId,
        generation: u64,
        path: &[IndexStep],
        role: Role,
        value: Value,
    ) {
        if !self.channels.contains(&channel) {
            warn!(target: LOG_TARGET, model = %self.name, %channel, "setData from unbound channel");
            return;
        }
        if generation != self.generation {
            // The row may have moved; applying it would hit the wrong cell.
            warn!(target: LOG_TARGET, model = %self.name, "dropping setData for an outdated structure");
            return;
        }
        let Some((last, parent)) = path.split_last() else {
            return;
        };
        if self.model.set_data(path, role, value) {
            let parent = parent.to_vec();
            self.data_changed(&parent, last.row, last.column, last.row, last.column, vec![role]);
        }
    }

    /// Inserts rows through the model and notifies replicas.
    pub fn insert_rows(&mut self, parent: &[IndexStep], first: u32, rows: Vec<RowData>) -> bool {
        let count = rows.len() as u32;
        if count == 0 || !self.model.insert_rows(parent, first, rows) {
            return false;
        }
        self.notify(ModelChange::RowsInserted {
            parent: parent.to_vec(),
            first,
            last: first + count - 1,
        });
        true
    }

    pub fn remove_rows(&mut self, parent: &[IndexStep], first: u32, count: u32) -> bool {
        if count == 0 || !self.model.remove_rows(parent, first, count) {
            return false;
        }
        self.notify(ModelChange::RowsRemoved {
            parent: parent.to_vec(),
            first,
            last: first + count - 1,
        });
        true
    }

    pub fn set_data(&mut self, index: &[IndexStep], role: Role, value: Value) -> bool {
        let Some((last, parent)) = index.split_last() else {
            return false;
        };
        if !self.model.set_data(index, role, value) {
            return false;
        }
        let parent = parent.to_vec();
        self.data_changed(&parent, last.row, last.column, last.row, last.column, vec![role]);
        true
    }

    /// Publishes a change already applied to the model.
    pub fn notify(&mut self, change: ModelChange) {
        match change {
            ModelChange::RowsInserted { parent, first, last } => {
                self.generation += 1;
                self.broadcast(Packet::ModelStructChanged {
                    name: self.name.clone(),
                    parent,
                    kind: StructKind::Insert,
                    first,
                    last,
                });
            }
            ModelChange::RowsRemoved { parent, first, last } => {
                self.generation += 1;
                self.broadcast(Packet::ModelStructChanged {
                    name: self.name.clone(),
                    parent,
                    kind: StructKind::Remove,
                    first,
                    last,
                });
            }
            ModelChange::DataChanged {
                parent,
                top,
                left,
                bottom,
                right,
                roles,
            } => self.data_changed(&parent, top, left, bottom, right, roles),
            ModelChange::Reset => {
                self.generation += 1;
                self.broadcast(Packet::ModelReset {
                    name: self.name.clone(),
                    rows: self.model.row_count(&[]),
                    columns: self.model.column_count(&[]),
                });
            }
        }
    }

    fn data_changed(
        &mut self,
        parent: &[IndexStep],
        top: u32,
        left: u32,
        bottom: u32,
        right: u32,
        roles: Vec<Role>,
    ) {
        if self.channels.is_empty() || bottom < top || right < left {
            return;
        }
        let values = self.pushed_values(parent, top, left, bottom, right, &roles);
        self.broadcast(Packet::ModelDataChanged {
            name: self.name.clone(),
            parent: parent.to_vec(),
            top,
            left,
            bottom,
            right,
            roles,
            values,
        });
    }

    /// Values for small rectangles so replicas need no second round trip.
    fn pushed_values(
        &self,
        parent: &[IndexStep],
        top: u32,
        left: u32,
        bottom: u32,
        right: u32,
        roles: &[Role],
    ) -> Vec<CellValue> {
        let roles: Vec<Role> = if roles.is_empty() {
            self.model.role_names().into_keys().collect()
        } else {
            roles.to_vec()
        };
        let cells = (bottom - top + 1) as usize * (right - left + 1) as usize;
        if cells.saturating_mul(roles.len()) > self.max_pushed_cells {
            return Vec::new();
        }
        let mut values = Vec::with_capacity(cells * roles.len());
        for row in top..=bottom {
            for column in left..=right {
                let path: IndexPath = child_path(parent, row, column);
                for role in &roles {
                    if let Some(value) = self.model.data(&path, *role) {
                        values.push(CellValue {
                            row,
                            column,
                            role: *role,
                            value,
                        });
                    }
                }
            }
        }
        values
    }

    fn broadcast(&mut self, packet: Packet) {
        for channel in &self.channels {
            self.outgoing.push((*channel, packet.clone()));
        }
    }

    pub fn release(&mut self, channel: ChannelId) {
        self.channels.remove(&channel);
    }

    pub fn channel_closed(&mut self, channel: ChannelId) -> bool {
        self.outgoing.retain(|(c, _)| *c != channel);
        self.channels.remove(&channel)
    }
}
