//! Model replication: hierarchical, role-keyed data replicated on demand.
//!
//! ```text
//! source node                                replica node
//! ┌──────────────────────┐ ── InitialState ───▶ ┌──────────────────────┐
//! │ ModelExporter        │ ◀── FetchRequest ─── │ ModelReplica         │
//! │ ├─ dyn ItemModel     │ ─── FetchReply ────▶ │ ├─ item arena        │
//! │ └─ generation        │ ── StructChanged ──▶ │ ├─ pending fetches   │
//! │                      │ ── DataChanged ────▶ │ └─ per-level LRU     │
//! └──────────────────────┘                      └──────────────────────┘
//! ```
//!
//! Indices travel as paths of `(row, column)` steps from the invisible root.
//! Children always hang off column 0 of their parent row.

mod replica;
mod source;
mod tree;

pub use replica::{DataState, ModelEvent, ModelIndex, ModelReplica};
pub use source::ModelExporter;
pub use tree::TreeModel;

use crate::descriptor::ApiDescriptor;
use crate::types::{IndexPath, IndexStep, Value};
use std::collections::BTreeMap;

pub type Role = i32;

pub const DISPLAY_ROLE: Role = 0;
pub const DECORATION_ROLE: Role = 1;
pub const EDIT_ROLE: Role = 2;
pub const TOOLTIP_ROLE: Role = 3;
pub const USER_ROLE: Role = 256;

/// Type name both sides use when binding a model.
pub const MODEL_TYPE_NAME: &str = "QAbstractItemModelReplica";

/// Role -> value map of one cell.
pub type CellData = BTreeMap<Role, Value>;

/// Cells of one row, one entry per column.
pub type RowData = Vec<CellData>;

pub(crate) fn model_signature() -> String {
    ApiDescriptor::builder(MODEL_TYPE_NAME)
        .build()
        .signature_hex()
}

pub fn default_role_names() -> BTreeMap<Role, String> {
    BTreeMap::from([
        (DISPLAY_ROLE, "display".to_string()),
        (DECORATION_ROLE, "decoration".to_string()),
        (EDIT_ROLE, "edit".to_string()),
        (TOOLTIP_ROLE, "toolTip".to_string()),
    ])
}

/// A hierarchical table exposed through a [`ModelExporter`].
///
/// `parent` and `index` are paths from the root; an empty path is the root.
pub trait ItemModel: Send {
    fn row_count(&self, parent: &[IndexStep]) -> u32;

    fn column_count(&self, parent: &[IndexStep]) -> u32;

    fn has_children(&self, parent: &[IndexStep]) -> bool {
        self.row_count(parent) > 0
    }

    /// `None` when `index` does not exist; `Some(Value::Null)` for an unset role.
    fn data(&self, index: &[IndexStep], role: Role) -> Option<Value>;

    fn set_data(&mut self, _index: &[IndexStep], _role: Role, _value: Value) -> bool {
        false
    }

    fn insert_rows(&mut self, _parent: &[IndexStep], _first: u32, _rows: Vec<RowData>) -> bool {
        false
    }

    fn remove_rows(&mut self, _parent: &[IndexStep], _first: u32, _count: u32) -> bool {
        false
    }

    fn role_names(&self) -> BTreeMap<Role, String> {
        default_role_names()
    }

    fn header_data(&self, _section: u32, _role: Role) -> Value {
        Value::Null
    }
}

/// Whether every step of `path` lies inside its parent's bounds.
pub fn contains_index(model: &dyn ItemModel, path: &[IndexStep]) -> bool {
    (0..path.len()).all(|depth| {
        let parent = &path[..depth];
        let step = path[depth];
        step.row < model.row_count(parent) && step.column < model.column_count(parent)
    })
}

/// Appends one step to a parent path.
pub fn child_path(parent: &[IndexStep], row: u32, column: u32) -> IndexPath {
    let mut path = parent.to_vec();
    path.push(IndexStep::new(row, column));
    path
}

/// Structural or data change applied to an exported model.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelChange {
    RowsInserted {
        parent: IndexPath,
        first: u32,
        last: u32,
    },
    RowsRemoved {
        parent: IndexPath,
        first: u32,
        last: u32,
    },
    DataChanged {
        parent: IndexPath,
        top: u32,
        left: u32,
        bottom: u32,
        right: u32,
        roles: Vec<Role>,
    },
    Reset,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_index() {
        let mut model = TreeModel::new(2);
        model.append_row(&[], vec![CellData::new(), CellData::new()]);
        model.append_row(&[IndexStep::new(0, 0)], vec![CellData::new()]);

        assert!(contains_index(&model, &[IndexStep::new(0, 1)]));
        assert!(contains_index(&model, &[IndexStep::new(0, 0), IndexStep::new(0, 1)]));
        assert!(!contains_index(&model, &[IndexStep::new(1, 0)]));
        assert!(!contains_index(&model, &[IndexStep::new(0, 2)]));
        assert!(!contains_index(&model, &[IndexStep::new(0, 1), IndexStep::new(0, 0)]));
    }

    #[test]
    fn test_model_signature_is_stable() {
        assert_eq!(model_signature(), model_signature());
        assert_eq!(model_signature().len(), 40);
    }
}
