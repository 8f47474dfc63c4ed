use super::{default_role_names, CellData, ItemModel, Role, RowData, DISPLAY_ROLE};
use crate::types::{IndexStep, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default)]
struct Node {
    cells: RowData,
    children: Vec<Node>,
}

impl Node {
    fn new(cells: RowData) -> Self {
        Self {
            cells,
            children: Vec::new(),
        }
    }
}

/// In-memory tree of rows sharing one column count.
#[derive(Debug, Clone)]
pub struct TreeModel {
    columns: u32,
    rows: Vec<Node>,
    role_names: BTreeMap<Role, String>,
    headers: Vec<Value>,
}

impl TreeModel {
    pub fn new(columns: u32) -> Self {
        Self {
            columns,
            rows: Vec::new(),
            role_names: default_role_names(),
            headers: Vec::new(),
        }
    }

    /// Flat table with one display value per cell.
    pub fn table(rows: u32, columns: u32, display: impl Fn(u32, u32) -> Value) -> Self {
        let mut model = Self::new(columns);
        for row in 0..rows {
            let cells = (0..columns)
                .map(|column| CellData::from([(DISPLAY_ROLE, display(row, column))]))
                .collect();
            model.rows.push(Node::new(cells));
        }
        model
    }

    pub fn with_role(mut self, role: Role, name: &str) -> Self {
        self.role_names.insert(role, name.to_string());
        self
    }

    pub fn with_headers(mut self, headers: Vec<Value>) -> Self {
        self.headers = headers;
        self
    }

    /// Appends a row under `parent`. Returns `false` if `parent` does not exist.
    pub fn append_row(&mut self, parent: &[IndexStep], cells: RowData) -> bool {
        let columns = self.columns;
        match self.children_mut(parent) {
            Some(children) => {
                children.push(Node::new(normalize(cells, columns)));
                true
            }
            None => false,
        }
    }

    fn children(&self, parent: &[IndexStep]) -> Option<&Vec<Node>> {
        let mut level = &self.rows;
        for step in parent {
            if step.column != 0 {
                return None;
            }
            level = &level.get(step.row as usize)?.children;
        }
        Some(level)
    }

    fn children_mut(&mut self, parent: &[IndexStep]) -> Option<&mut Vec<Node>> {
        let mut level = &mut self.rows;
        for step in parent {
            if step.column != 0 {
                return None;
            }
            level = &mut level.get_mut(step.row as usize)?.children;
        }
        Some(level)
    }

    fn cell_mut(&mut self, index: &[IndexStep]) -> Option<&mut CellData> {
        let (last, parent) = index.split_last()?;
        if last.column >= self.columns {
            return None;
        }
        let node = self.children_mut(parent)?.get_mut(last.row as usize)?;
        node.cells.get_mut(last.column as usize)
    }
}

fn normalize(mut cells: RowData, columns: u32) -> RowData {
    cells.resize(columns as usize, CellData::new());
    cells
}

impl ItemModel for TreeModel {
    fn row_count(&self, parent: &[IndexStep]) -> u32 {
        self.children(parent).map_or(0, |c| c.len() as u32)
    }

    fn column_count(&self, parent: &[IndexStep]) -> u32 {
        if self.children(parent).is_some() {
            self.columns
        } else {
            0
        }
    }

    fn data(&self, index: &[IndexStep], role: Role) -> Option<Value> {
        let (last, parent) = index.split_last()?;
        if last.column >= self.columns {
            return None;
        }
        let node = self.children(parent)?.get(last.row as usize)?;
        let cell = node.cells.get(last.column as usize)?;
        Some(cell.get(&role).cloned().unwrap_or_default())
    }

    fn set_data(&mut self, index: &[IndexStep], role: Role, value: Value) -> bool {
        match self.cell_mut(index) {
            Some(cell) => {
                if cell.get(&role) == Some(&value) {
                    return false;
                }
                cell.insert(role, value);
                true
            }
            None => false,
        }
    }

    fn insert_rows(&mut self, parent: &[IndexStep], first: u32, rows: Vec<RowData>) -> bool {
        let columns = self.columns;
        let Some(children) = self.children_mut(parent) else {
            return false;
        };
        let first = first as usize;
        if first > children.len() || rows.is_empty() {
            return false;
        }
        let nodes: Vec<Node> = rows
            .into_iter()
            .map(|cells| Node::new(normalize(cells, columns)))
            .collect();
        children.splice(first..first, nodes);
        true
    }

    fn remove_rows(&mut self, parent: &[IndexStep], first: u32, count: u32) -> bool {
        let Some(children) = self.children_mut(parent) else {
            return false;
        };
        let (first, count) = (first as usize, count as usize);
        if count == 0 || first + count > children.len() {
            return false;
        }
        children.drain(first..first + count);
        true
    }

    fn role_names(&self) -> BTreeMap<Role, String> {
        self.role_names.clone()
    }

    fn header_data(&self, section: u32, role: Role) -> Value {
        if role != DISPLAY_ROLE {
            return Value::Null;
        }
        self.headers
            .get(section as usize)
            .cloned()
            .unwrap_or_default()
    }
}
