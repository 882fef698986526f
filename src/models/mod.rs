use serde::{Deserialize, Serialize};

pub type AccountId = i64;
pub type AssetId = i64;
pub type CountryId = i64;
pub type AgentId = i64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssetType {
    Currency,
    Stock,
    Bond,
    Etf,
    Derivative,
}

impl AssetType {
    /// Value stored in `assets.type_id`
    pub fn id(self) -> i64 {
        match self {
            Self::Currency => 1,
            Self::Stock => 2,
            Self::Bond => 3,
            Self::Etf => 4,
            Self::Derivative => 5,
        }
    }

    pub fn from_id(id: i64) -> Option<Self> {
        match id {
            1 => Some(Self::Currency),
            2 => Some(Self::Stock),
            3 => Some(Self::Bond),
            4 => Some(Self::Etf),
            5 => Some(Self::Derivative),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Currency => "Currency",
            Self::Stock => "Stock",
            Self::Bond => "Bond",
            Self::Etf => "ETF",
            Self::Derivative => "Derivative",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum CorporateActionType {
    /// Shares converted into shares of the acquiring company
    Merger,
    /// New shares of a different company, old position kept
    SpinOff,
    /// Name/ticker change
    SymbolChange,
    /// Bonus shares
    StockDividend,
    /// Forward split
    Split,
}

impl CorporateActionType {
    /// Value stored in `corp_actions.type`
    pub fn id(self) -> i64 {
        match self {
            Self::Merger => 1,
            Self::SpinOff => 2,
            Self::SymbolChange => 3,
            Self::StockDividend => 4,
            Self::Split => 5,
        }
    }

    pub fn from_id(id: i64) -> Option<Self> {
        match id {
            1 => Some(Self::Merger),
            2 => Some(Self::SpinOff),
            3 => Some(Self::SymbolChange),
            4 => Some(Self::StockDividend),
            5 => Some(Self::Split),
            _ => None,
        }
    }
}

/// Predefined income/spending categories used by action details
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum ActionCategory {
    Fees,
    Taxes,
    Interest,
}

impl ActionCategory {
    pub fn id(self) -> i64 {
        match self {
            Self::Fees => 1,
            Self::Taxes => 2,
            Self::Interest => 3,
        }
    }

    pub fn from_id(id: i64) -> Option<Self> {
        match id {
            1 => Some(Self::Fees),
            2 => Some(Self::Taxes),
            3 => Some(Self::Interest),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Fees => "Fees",
            Self::Taxes => "Taxes",
            Self::Interest => "Interest",
        }
    }
}

// =============================================================================
// Ledger rows
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trade {
    pub id: i64,
    pub timestamp: i64,
    pub settlement: i64,
    pub number: String,
    pub account_id: AccountId,
    pub asset_id: AssetId,
    pub qty: f64,
    pub price: f64,
    pub fee: f64,
    pub coupon: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transfer {
    pub id: i64,
    pub timestamp: i64,
    pub from_account_id: AccountId,
    pub from_amount: f64,
    pub to_account_id: AccountId,
    pub to_amount: f64,
    pub fee_account_id: Option<AccountId>,
    pub fee_amount: Option<f64>,
    pub note: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dividend {
    pub id: i64,
    pub timestamp: i64,
    pub account_id: AccountId,
    pub asset_id: AssetId,
    pub amount: f64,
    pub tax: f64,
    pub tax_country_id: Option<CountryId>,
    pub note: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorporateAction {
    pub id: i64,
    pub timestamp: i64,
    pub number: String,
    pub account_id: AccountId,
    pub action_type: CorporateActionType,
    pub asset_id_old: AssetId,
    pub qty_old: f64,
    pub asset_id_new: AssetId,
    pub qty_new: f64,
    pub note: String,
}

/// An action together with its single detail line
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    pub id: i64,
    pub timestamp: i64,
    pub account_id: AccountId,
    pub peer_id: Option<AgentId>,
    pub category: ActionCategory,
    pub amount: f64,
    pub note: String,
}
