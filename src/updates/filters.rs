//! Subscription filters

use std::collections::BTreeSet;

use crate::wal::WalRecord;

/// How a subscribe call combines with an observer's existing filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionMode {
    /// Clear the previous filter, then install the new one
    Replace,
    /// Union the new namespaces into the previous filter
    Increment,
}

/// Namespaces an observer wants to hear about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamespaceFilter {
    /// Every namespace
    All,
    Only(BTreeSet<String>),
}

impl NamespaceFilter {
    /// An empty name set means every namespace
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: BTreeSet<String> = names.into_iter().map(Into::into).collect();
        if names.is_empty() {
            NamespaceFilter::All
        } else {
            NamespaceFilter::Only(names)
        }
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, NamespaceFilter::All)
    }

    /// Combine `next` into this filter according to `mode`
    pub fn apply(&mut self, next: NamespaceFilter, mode: SubscriptionMode) {
        match mode {
            SubscriptionMode::Replace => *self = next,
            SubscriptionMode::Increment => match (&mut *self, next) {
                (NamespaceFilter::All, _) => {}
                (current, NamespaceFilter::All) => *current = NamespaceFilter::All,
                (NamespaceFilter::Only(current), NamespaceFilter::Only(more)) => {
                    current.extend(more);
                }
            },
        }
    }

    pub fn matches_namespace(&self, namespace: &str) -> bool {
        match self {
            NamespaceFilter::All => true,
            NamespaceFilter::Only(names) => names.contains(namespace),
        }
    }

    /// Raw records are never delivered; namespace lifecycle records reach
    /// every observer.
    pub fn matches(&self, record: &WalRecord) -> bool {
        if record.is_raw() {
            return false;
        }
        record.op.is_namespace_op() || self.matches_namespace(record.namespace())
    }
}
