//! Broker Statement Parsing Module
//!
//! Reads broker statement files into a common, format-independent sequence
//! of events. Parsers never touch the ledger: a file either parses
//! completely or fails with a [`ParseError`] before anything is written.

pub mod ibkr;
pub mod open_portfolio;
pub mod quik;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::config::ImportSettings;
use crate::error::ParseError;
use crate::models::AssetType;

/// Supported statement formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReportType {
    /// Interactive Brokers flex-query XML
    Ibkr,
    /// Quik HTML report
    Quik,
    /// Open Portfolio JSON exchange document
    OpenPortfolio,
}

impl ReportType {
    pub fn name(self) -> &'static str {
        match self {
            Self::Ibkr => "IBKR flex-query",
            Self::Quik => "Quik HTML-report",
            Self::OpenPortfolio => "Open portfolio",
        }
    }

    /// Guess the report type from the file extension
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_lowercase();
        match ext.as_str() {
            "xml" => Some(Self::Ibkr),
            "htm" | "html" => Some(Self::Quik),
            "json" => Some(Self::OpenPortfolio),
            _ => None,
        }
    }
}

/// Account as referenced by a statement line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountRef {
    pub number: String,
    /// Currency symbol; `None` matches any currency of the account number
    pub currency: Option<String>,
}

impl AccountRef {
    pub fn new(number: &str, currency: Option<&str>) -> Self {
        Self {
            number: number.to_string(),
            currency: currency.filter(|c| !c.is_empty()).map(str::to_string),
        }
    }
}

impl std::fmt::Display for AccountRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.currency {
            Some(currency) => write!(f, "{} ({})", self.number, currency),
            None => write!(f, "{}", self.number),
        }
    }
}

/// Asset as referenced by a statement line, with what the report tells
/// about it in case it has to be created
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetRef {
    pub symbol: String,
    pub name: String,
    pub isin: String,
    pub asset_type: Option<AssetType>,
}

impl AssetRef {
    pub fn symbol(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            ..Self::default()
        }
    }
}

/// Broker asset class codes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssetClass {
    Stock,
    Bond,
    Option,
    Future,
    Cash,
    Other(String),
}

impl AssetClass {
    pub fn from_code(code: &str) -> Self {
        match code {
            "STK" => Self::Stock,
            "BOND" => Self::Bond,
            "OPT" => Self::Option,
            "FUT" => Self::Future,
            "CASH" => Self::Cash,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn code(&self) -> &str {
        match self {
            Self::Stock => "STK",
            Self::Bond => "BOND",
            Self::Option => "OPT",
            Self::Future => "FUT",
            Self::Cash => "CASH",
            Self::Other(code) => code,
        }
    }

    /// Ledger asset type of a security of this class
    pub fn asset_type(&self, sub_category: &str) -> Option<AssetType> {
        let asset_type = match self {
            Self::Stock => AssetType::Stock,
            Self::Bond => AssetType::Bond,
            Self::Option | Self::Future => AssetType::Derivative,
            Self::Cash | Self::Other(_) => return None,
        };
        if sub_category == "ETF" {
            Some(AssetType::Etf)
        } else {
            Some(asset_type)
        }
    }
}

/// Security definition, stored as an asset when it is not known yet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityDefinition {
    pub symbol: String,
    pub name: String,
    pub isin: String,
    /// Category text of the report, kept for error messages
    pub category: String,
    /// `None` when the category has no ledger counterpart
    pub asset_type: Option<AssetType>,
}

/// Account listed by an exchange document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountDefinition {
    pub account: AccountRef,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TradeAction {
    Buy,
    Sell,
    CancelBuy,
    CancelSell,
}

impl TradeAction {
    pub fn is_cancel(self) -> bool {
        matches!(self, Self::CancelBuy | Self::CancelSell)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeRecord {
    pub timestamp: i64,
    /// 0 when the report has no settlement date
    pub settlement: i64,
    pub number: String,
    pub account: AccountRef,
    pub asset: AssetRef,
    pub action: TradeAction,
    /// Signed quantity in units of the asset (multiplier/lot applied)
    pub qty: f64,
    pub price: f64,
    /// Broker commission, negative when it is a cost
    pub fee: f64,
    pub coupon: f64,
}

/// Currency exchange, e.g. `EUR.USD`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrencyTradeRecord {
    pub timestamp: i64,
    pub account_number: String,
    pub symbol: String,
    pub action: TradeAction,
    /// Amount of the base currency, negative on sell
    pub quantity: f64,
    /// Amount of the quote currency, negative on buy
    pub proceeds: f64,
    /// Commission, negative when it is a cost
    pub fee: f64,
    pub fee_currency: String,
    pub exchange: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionTaxRecord {
    pub timestamp: i64,
    pub account: AccountRef,
    /// Negative when it is paid
    pub amount: f64,
    pub note: String,
}

/// Reorganisation types of corporate actions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReorgType {
    Merger,
    SpinOff,
    IssueChange,
    ChoiceDivIssue,
    ForwardSplit,
    Other(String),
}

impl ReorgType {
    pub fn from_code(code: &str) -> Self {
        match code.to_uppercase().as_str() {
            "TC" | "MERGER" => Self::Merger,
            "SO" | "SPINOFF" => Self::SpinOff,
            "IC" | "ISSUECHANGE" => Self::IssueChange,
            "HI" | "CHOICEDIVISSUE" => Self::ChoiceDivIssue,
            "FS" | "FORWARDSPLIT" => Self::ForwardSplit,
            _ => Self::Other(code.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorporateActionRecord {
    pub timestamp: i64,
    pub transaction_id: i64,
    pub account: AccountRef,
    pub asset_class: AssetClass,
    pub reorg: ReorgType,
    /// Set when the broker cancelled the action
    pub cancelled: bool,
    pub asset: AssetRef,
    pub listing_exchange: String,
    pub quantity: f64,
    pub description: String,
}

/// Cash line (dividend, tax, fee, interest, deposit)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CashRecord {
    pub timestamp: i64,
    /// Broker id of the line, when the format has one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<i64>,
    pub account: AccountRef,
    pub asset: Option<AssetRef>,
    pub amount: f64,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UnsupportedKind {
    /// Trades in an asset class the ledger can't hold
    AssetClass,
    /// Trade direction that isn't implemented
    TradeType,
    /// Cash transaction type that isn't implemented
    CashType,
}

/// One statement line in format-independent form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum Event {
    Asset(SecurityDefinition),
    Account(AccountDefinition),
    Trade(TradeRecord),
    CurrencyTrade(CurrencyTradeRecord),
    TransactionTax(TransactionTaxRecord),
    CorporateAction(CorporateActionRecord),
    Dividend(CashRecord),
    WithholdingTax(CashRecord),
    Fee(CashRecord),
    Interest(CashRecord),
    DepositWithdraw(CashRecord),
    Unsupported {
        kind: UnsupportedKind,
        description: String,
    },
}

impl Event {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Asset(_) => "Asset",
            Self::Account(_) => "Account",
            Self::Trade(_) => "Trade",
            Self::CurrencyTrade(_) => "Currency exchange",
            Self::TransactionTax(_) => "Transaction tax",
            Self::CorporateAction(_) => "Corporate action",
            Self::Dividend(_) => "Dividend",
            Self::WithholdingTax(_) => "Withholding tax",
            Self::Fee(_) => "Fee",
            Self::Interest(_) => "Interest",
            Self::DepositWithdraw(_) => "Deposit/withdrawal",
            Self::Unsupported { .. } => "Unsupported",
        }
    }
}

/// One account's statement within a report file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Statement {
    pub report_type: ReportType,
    pub account_number: String,
    /// `[start, end]` as UTC timestamps when the report states it
    pub period: Option<(i64, i64)>,
    pub events: Vec<Event>,
}

impl Statement {
    pub fn corporate_actions(&self) -> Vec<&CorporateActionRecord> {
        self.events
            .iter()
            .filter_map(|event| match event {
                Event::CorporateAction(record) => Some(record),
                _ => None,
            })
            .collect()
    }
}

/// Statement file parser
pub trait StatementParser {
    fn parse(&self, path: &Path) -> Result<Vec<Statement>, ParseError>;
}

pub fn get_parser(report_type: ReportType, settings: &ImportSettings) -> Box<dyn StatementParser> {
    match report_type {
        ReportType::Ibkr => Box::new(ibkr::IbkrParser::new()),
        ReportType::Quik => Box::new(quik::QuikParser::new(&settings.quik_encoding)),
        ReportType::OpenPortfolio => Box::new(open_portfolio::OpenPortfolioParser::new(
            &settings.open_portfolio_max_version,
        )),
    }
}

/// Parse a statement file of the given type
pub fn parse_statement(
    path: &Path,
    report_type: ReportType,
    settings: &ImportSettings,
) -> Result<Vec<Statement>, ParseError> {
    log::info!(
        "Statement import: Parsing {} file {}",
        report_type.name(),
        path.display()
    );
    get_parser(report_type, settings).parse(path)
}

// =============================================================================
// Timestamp helpers
// =============================================================================

pub(crate) fn datetime_timestamp(dt: NaiveDateTime) -> i64 {
    dt.and_utc().timestamp()
}

pub(crate) fn date_timestamp(date: NaiveDate) -> i64 {
    date.and_hms_opt(0, 0, 0)
        .map(datetime_timestamp)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_report_type_from_extension() {
        assert_eq!(ReportType::from_path(&PathBuf::from("flex.XML")), Some(ReportType::Ibkr));
        assert_eq!(ReportType::from_path(&PathBuf::from("deals.htm")), Some(ReportType::Quik));
        assert_eq!(
            ReportType::from_path(&PathBuf::from("dump.json")),
            Some(ReportType::OpenPortfolio)
        );
        assert_eq!(ReportType::from_path(&PathBuf::from("report.pdf")), None);
        assert_eq!(ReportType::from_path(&PathBuf::from("noext")), None);
    }

    #[test]
    fn test_asset_class_mapping() {
        assert_eq!(AssetClass::from_code("STK").asset_type(""), Some(AssetType::Stock));
        assert_eq!(AssetClass::from_code("STK").asset_type("ETF"), Some(AssetType::Etf));
        assert_eq!(AssetClass::from_code("FUT").asset_type(""), Some(AssetType::Derivative));
        assert_eq!(AssetClass::from_code("BOND").asset_type(""), Some(AssetType::Bond));
        assert_eq!(AssetClass::from_code("CASH").asset_type(""), None);
        assert_eq!(AssetClass::from_code("WAR"), AssetClass::Other("WAR".to_string()));
    }

    #[test]
    fn test_reorg_codes() {
        assert_eq!(ReorgType::from_code("TC"), ReorgType::Merger);
        assert_eq!(ReorgType::from_code("so"), ReorgType::SpinOff);
        assert_eq!(ReorgType::from_code("HI"), ReorgType::ChoiceDivIssue);
        assert_eq!(ReorgType::from_code("ChoiceDivIssue"), ReorgType::ChoiceDivIssue);
        // Cash dividends are not a reorganisation the ledger books
        assert_eq!(ReorgType::from_code("CD"), ReorgType::Other("CD".to_string()));
    }

    #[test]
    fn test_account_ref_drops_empty_currency() {
        assert_eq!(AccountRef::new("U1", Some("")).currency, None);
        assert_eq!(AccountRef::new("U1", Some("USD")).to_string(), "U1 (USD)");
    }
}
