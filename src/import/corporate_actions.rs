//! Corporate action reconciliation
//!
//! IBKR reports a corporate action as a primary record plus, for some
//! types, a dummy record listed on the `VALUE` exchange that carries the
//! other side of the conversion. The dummy sits right before (mergers) or
//! right after (issue changes) the primary one in transaction id order.

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};

use crate::error::{ImportError, ImportResult};
use crate::models::CorporateActionType;
use crate::statements::{AssetClass, AssetRef, CorporateActionRecord, ReorgType};

static SPIN_OFF_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r"^(.*)\(.* SPINOFF +(\d+) +FOR +(\d+) +\(.*$")
        .case_insensitive(true)
        .build()
        .expect("valid regex")
});
static SPLIT_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r"^.* SPLIT +(\d+) +FOR +(\d+) +\(.*$")
        .case_insensitive(true)
        .build()
        .expect("valid regex")
});
static ISSUE_CHANGE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(.*)\.OLD$").expect("valid regex"));

/// Ledger corporate action derived from the statement records
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedAction {
    pub action_type: CorporateActionType,
    pub asset_old: AssetRef,
    pub qty_old: f64,
    pub asset_new: AssetRef,
    pub qty_new: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reconciled {
    /// Dummy record, consumed through its primary record
    Skip,
    /// The broker cancelled the action; the ledger has to be fixed by hand
    Cancelled,
    Action(PlannedAction),
}

/// Find the dummy record with the given transaction id
pub fn find_paired_record<'r>(
    records: &[&'r CorporateActionRecord],
    dummy_exchange: &str,
    transaction_id: i64,
) -> Option<&'r CorporateActionRecord> {
    records
        .iter()
        .copied()
        .find(|r| r.listing_exchange == dummy_exchange && r.transaction_id == transaction_id)
}

/// Old symbol and `A FOR B` ratio of a spin-off description
pub fn parse_spin_off(description: &str) -> Option<(String, f64, f64)> {
    let caps = SPIN_OFF_RE.captures(description)?;
    Some((
        caps[1].trim().to_string(),
        caps[2].parse().ok()?,
        caps[3].parse().ok()?,
    ))
}

/// `A FOR B` ratio of a split description
pub fn parse_split(description: &str) -> Option<(f64, f64)> {
    let caps = SPLIT_RE.captures(description)?;
    Some((caps[1].parse().ok()?, caps[2].parse().ok()?))
}

/// Symbol before an issue change, from the `<symbol>.OLD` dummy record
pub fn parse_old_symbol(symbol: &str) -> Option<String> {
    ISSUE_CHANGE_RE
        .captures(symbol)
        .map(|caps| caps[1].to_string())
}

/// Work out which ledger corporate action `record` stands for
pub fn reconcile(
    record: &CorporateActionRecord,
    records: &[&CorporateActionRecord],
    dummy_exchange: &str,
) -> ImportResult<Reconciled> {
    if record.listing_exchange == dummy_exchange {
        return Ok(Reconciled::Skip);
    }
    if record.cancelled {
        return Ok(Reconciled::Cancelled);
    }
    if record.asset_class != AssetClass::Stock {
        log::error!(
            "Corporate action not supported for asset class: {}",
            record.asset_class.code()
        );
        return Err(ImportError::UnsupportedAssetClass(
            record.asset_class.code().to_string(),
        ));
    }

    let missing_pair = |kind: &str| {
        log::error!("Can't find paired record for {} corp.action", kind);
        ImportError::MissingPairedRecord {
            kind: kind.to_string(),
            number: record.transaction_id.to_string(),
        }
    };

    let planned = match &record.reorg {
        ReorgType::Merger => {
            let paired = find_paired_record(records, dummy_exchange, record.transaction_id - 1)
                .ok_or_else(|| missing_pair("Merger"))?;
            PlannedAction {
                action_type: CorporateActionType::Merger,
                asset_old: paired.asset.clone(),
                qty_old: -paired.quantity,
                asset_new: record.asset.clone(),
                qty_new: record.quantity,
            }
        }
        ReorgType::SpinOff => {
            let (old_symbol, mult_a, mult_b) = parse_spin_off(&record.description)
                .ok_or_else(|| ImportError::Pattern("Spin-off data".to_string()))?;
            PlannedAction {
                action_type: CorporateActionType::SpinOff,
                asset_old: AssetRef::symbol(&old_symbol),
                qty_old: mult_b * record.quantity / mult_a,
                asset_new: record.asset.clone(),
                qty_new: record.quantity,
            }
        }
        ReorgType::IssueChange => {
            let paired = find_paired_record(records, dummy_exchange, record.transaction_id + 1)
                .ok_or_else(|| missing_pair("Issue Change"))?;
            let old_symbol = parse_old_symbol(&paired.asset.symbol).ok_or_else(|| {
                ImportError::Pattern("old symbol for Issue Change corp.action".to_string())
            })?;
            PlannedAction {
                action_type: CorporateActionType::SymbolChange,
                asset_old: AssetRef {
                    symbol: old_symbol,
                    ..paired.asset.clone()
                },
                qty_old: record.quantity,
                asset_new: record.asset.clone(),
                qty_new: record.quantity,
            }
        }
        ReorgType::ChoiceDivIssue => PlannedAction {
            action_type: CorporateActionType::StockDividend,
            asset_old: record.asset.clone(),
            qty_old: 0.0,
            asset_new: record.asset.clone(),
            qty_new: record.quantity,
        },
        ReorgType::ForwardSplit => {
            let (mult_a, mult_b) = parse_split(&record.description)
                .ok_or_else(|| ImportError::Pattern("corp.action Split data".to_string()))?;
            PlannedAction {
                action_type: CorporateActionType::Split,
                asset_old: record.asset.clone(),
                qty_old: record.quantity,
                asset_new: record.asset.clone(),
                qty_new: mult_a * record.quantity / mult_b,
            }
        }
        ReorgType::Other(code) => {
            log::error!("Corporate action type is not supported: {}", code);
            return Err(ImportError::UnsupportedCorporateAction(code.clone()));
        }
    };
    Ok(Reconciled::Action(planned))
}
