//! The in-memory row representation the codecs and scanners pass around.
//!
//! A column slot is one of three states rather than a plain
//! `Option<Value>`: `Unset` (never decoded, or cleared by a projection,
//! §4.8), `Null` (a real SQL null), and `Value` (present). Collapsing
//! `Unset`/`Null` into one `None` would make projection idempotence
//! (§8 property 5) indistinguishable from "the column happens to be
//! null".

use std::collections::HashMap;

use crate::codec::Value;
use crate::schema::RowInfo;

#[derive(Debug, Clone, PartialEq, Default)]
pub enum Slot {
    #[default]
    Unset,
    Null,
    Value(Value),
}

impl Slot {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Slot::Value(v) => Some(v),
            _ => None,
        }
    }
    pub fn is_unset(&self) -> bool {
        matches!(self, Slot::Unset)
    }
}

/// A decoded row, keyed by column name through the owning [`RowInfo`].
#[derive(Debug, Clone, Default)]
pub struct Row {
    by_name: HashMap<String, Slot>,
}

impl Row {
    pub fn new() -> Self {
        Row::default()
    }

    pub fn get(&self, name: &str) -> &Slot {
        self.by_name.get(name).unwrap_or(&Slot::Unset)
    }

    pub fn set_value(&mut self, name: impl Into<String>, value: Value) {
        self.by_name.insert(name.into(), Slot::Value(value));
    }

    pub fn set_null(&mut self, name: impl Into<String>) {
        self.by_name.insert(name.into(), Slot::Null);
    }

    pub fn unset(&mut self, name: &str) {
        self.by_name.insert(name.to_string(), Slot::Unset);
    }

    pub fn unset_all_except(&mut self, info: &RowInfo, keep: &[String]) {
        for col in info.all_columns() {
            if !keep.iter().any(|k| k == &col.name) {
                self.unset(&col.name);
            }
        }
    }
}
