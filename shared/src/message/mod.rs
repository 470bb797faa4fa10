//! 实时变更消息类型定义
//!
//! The backend's change feed delivers one [`ChangeEvent`] per row change.
//! These types are shared between the hosted and in-memory backends and the
//! realtime bridge that turns them into cache invalidations.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Tables the client reads or writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Branches,
    BranchUsers,
    MenuCategories,
    MenuItems,
    /// Read-only view joining items and categories
    MenuWithCategories,
    Orders,
    OrderItems,
    Notifications,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Branches => "branches",
            Table::BranchUsers => "branch_users",
            Table::MenuCategories => "menu_categories",
            Table::MenuItems => "menu_items",
            Table::MenuWithCategories => "menu_with_categories",
            Table::Orders => "orders",
            Table::OrderItems => "order_items",
            Table::Notifications => "notifications",
        }
    }

    pub fn from_name(name: &str) -> Option<Table> {
        const ALL: [Table; 8] = [
            Table::Branches,
            Table::BranchUsers,
            Table::MenuCategories,
            Table::MenuItems,
            Table::MenuWithCategories,
            Table::Orders,
            Table::OrderItems,
            Table::Notifications,
        ];
        ALL.into_iter().find(|t| t.as_str() == name)
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of row change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    /// Parse the feed's `eventType` field
    pub fn parse(s: &str) -> Option<ChangeKind> {
        match s.to_ascii_uppercase().as_str() {
            "INSERT" => Some(ChangeKind::Insert),
            "UPDATE" => Some(ChangeKind::Update),
            "DELETE" => Some(ChangeKind::Delete),
            _ => None,
        }
    }
}

/// 一条行级变更事件
///
/// Delivery is at-least-once and unordered across tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub table: Table,
    /// Row after the change (insert / update)
    #[serde(default)]
    pub new: Option<Value>,
    /// Row before the change (update / delete; may only hold the key)
    #[serde(default)]
    pub old: Option<Value>,
}

impl ChangeEvent {
    pub fn new(kind: ChangeKind, table: Table, new: Option<Value>, old: Option<Value>) -> Self {
        Self {
            kind,
            table,
            new,
            old,
        }
    }

    /// Id of the changed row, from `new` first then `old`
    pub fn record_id(&self) -> Option<&str> {
        [self.new.as_ref(), self.old.as_ref()]
            .into_iter()
            .flatten()
            .find_map(|row| row.get("id").and_then(Value::as_str))
            .filter(|id| !id.is_empty())
    }

    /// Value of a column, from `new` first then `old`
    pub fn column(&self, name: &str) -> Option<&Value> {
        [self.new.as_ref(), self.old.as_ref()]
            .into_iter()
            .flatten()
            .find_map(|row| row.get(name))
    }

    /// Decode the `new` row into a typed model
    pub fn decode_new<T: DeserializeOwned>(&self) -> Option<Result<T, serde_json::Error>> {
        self.new.clone().map(serde_json::from_value)
    }
}

/// Server-side row filter for a subscription (`column=eq.value`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeFilter {
    pub column: String,
    pub value: String,
}

impl ChangeFilter {
    pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }

    /// Whether an event passes this filter
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        match event.column(&self.column) {
            Some(Value::String(s)) => *s == self.value,
            Some(other) => other.to_string() == self.value,
            None => false,
        }
    }
}

impl fmt::Display for ChangeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}=eq.{}", self.column, self.value)
    }
}
