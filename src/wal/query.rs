//! WAL Query
//!
//! Range reads over a namespace's WAL through the reserved `#lsn`
//! pseudo-column. Only `>` and `>=` are understood; every other column or
//! operator belongs to the general query engine and is refused here.

use std::sync::Arc;

use super::record::{Lsn, WalRecord};
use super::store::WalStore;
use crate::error::{Error, Result};

/// Reserved column name addressing the WAL position of a record
pub const LSN_COLUMN: &str = "#lsn";

/// Comparison supported on `#lsn`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondType {
    Gt,
    Ge,
}

impl CondType {
    pub fn parse(op: &str) -> Result<Self> {
        match op {
            ">" => Ok(CondType::Gt),
            ">=" => Ok(CondType::Ge),
            other => Err(Error::UnsupportedQuery(format!(
                "operator '{}' is not supported on {}",
                other, LSN_COLUMN
            ))),
        }
    }
}

/// `Select(ns).Where("#lsn", op, L)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LsnQuery {
    pub namespace: String,
    pub cond: CondType,
    pub lsn: Lsn,
}

/// Query builder
#[derive(Debug, Clone)]
pub struct Query {
    namespace: String,
}

impl Query {
    pub fn select(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    /// Attach a condition; only the `#lsn` column is accepted
    pub fn where_(self, column: &str, op: &str, lsn: Lsn) -> Result<LsnQuery> {
        if column != LSN_COLUMN {
            return Err(Error::UnsupportedQuery(format!(
                "column '{}' cannot be queried from the WAL",
                column
            )));
        }
        Ok(LsnQuery {
            namespace: self.namespace,
            cond: CondType::parse(op)?,
            lsn,
        })
    }

    pub fn where_lsn(self, cond: CondType, lsn: Lsn) -> LsnQuery {
        LsnQuery {
            namespace: self.namespace,
            cond,
            lsn,
        }
    }
}

impl LsnQuery {
    /// Run the query. `#lsn > L` is `GetFrom(L)`; `#lsn >= L` starts one
    /// record earlier.
    pub async fn execute(&self, store: &WalStore) -> Result<Vec<Arc<WalRecord>>> {
        let after = match self.cond {
            CondType::Gt => Some(self.lsn.counter),
            CondType::Ge => self.lsn.counter.checked_sub(1),
        };
        store.read_after(&self.namespace, self.lsn.epoch, after).await
    }
}
