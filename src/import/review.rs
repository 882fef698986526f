//! Items that need a human look after an import

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReviewKind {
    /// Something in the ledger has to be changed by hand (cancelled
    /// corporate action)
    ManualAction,
    /// A statement line has to be entered by hand
    ManualEntry,
    /// Placeholder country created for an unknown code
    NewCountry,
    /// Default counterparty assigned to an account
    CounterpartyAssigned,
    /// Account listed in an exchange document is missing in the ledger
    MissingAccount,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewItem {
    pub kind: ReviewKind,
    pub context: String,
}

impl ReviewItem {
    pub fn new(kind: ReviewKind, context: impl Into<String>) -> Self {
        let item = Self {
            kind,
            context: context.into(),
        };
        log::warn!("Review required ({:?}): {}", item.kind, item.context);
        item
    }
}
