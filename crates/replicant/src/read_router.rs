//! Per-table "where to read" directive.
//!
//! The directive is a first-class atomic map, updated only through
//! `set_shard` and read only through `read_target`. Readers never observe a
//! torn state: the whole shard's table set flips to the same `ReadTarget`
//! under a single lock acquisition.

use crate::model::{ReadTarget, Shard, TableName};
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Default)]
pub struct ReadRouter {
    directive: RwLock<HashMap<(Shard, TableName), ReadTarget>>,
}

impl ReadRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically point every table of `shard` at `target`.
    pub fn set_shard(&self, shard: &Shard, tables: &[TableName], target: ReadTarget) {
        let mut directive = self.directive.write().unwrap();
        for table in tables {
            directive.insert((shard.clone(), table.clone()), target);
        }
    }

    /// What a reader should consult for `(shard, table)`. Tables never
    /// registered default to `Remote`, since an unknown shard cannot
    /// possibly be locally readable yet.
    pub fn read_target(&self, shard: &Shard, table: &TableName) -> ReadTarget {
        self.directive
            .read()
            .unwrap()
            .get(&(shard.clone(), table.clone()))
            .copied()
            .unwrap_or(ReadTarget::Remote)
    }
}
