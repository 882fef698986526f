//! Open Portfolio JSON exchange documents
//!
//! The document is first normalised section by section into the shape the
//! ledger uses (a flat `symbols` list, account currencies as asset ids,
//! a `period` pair), then turned into asset and account events.

use chrono::{DateTime, NaiveDate};
use serde_json::{json, Map, Value};
use std::cmp::Ordering;
use std::path::Path;

use super::{
    date_timestamp, AccountDefinition, AccountRef, Event, ReportType, SecurityDefinition,
    Statement, StatementParser,
};
use crate::error::ParseError;
use crate::models::AssetType;

const PERIOD: &str = "period";
const SYMBOLS: &str = "symbols";

/// How a section is handled
#[derive(Debug, Clone, Copy)]
enum SectionAction {
    ValidateVersion,
    Keep,
    BuildPeriod,
    Remove,
    LoadAssets,
    TweakAccounts,
}

/// Known sections in processing order: (name, mandatory, action)
const SECTIONS: &[(&str, bool, SectionAction)] = &[
    ("version", true, SectionAction::ValidateVersion),
    ("start", true, SectionAction::Keep),
    ("end", true, SectionAction::BuildPeriod),
    ("generated", false, SectionAction::Remove),
    ("generated-by", false, SectionAction::Remove),
    ("assets", true, SectionAction::LoadAssets),
    ("accounts", true, SectionAction::TweakAccounts),
    ("cash-balances", false, SectionAction::Remove),
    ("transfers", false, SectionAction::Remove),
    ("payments", false, SectionAction::Remove),
];

pub struct OpenPortfolioParser {
    max_version: String,
}

impl OpenPortfolioParser {
    pub fn new(max_version: &str) -> Self {
        Self {
            max_version: max_version.to_string(),
        }
    }

    pub fn parse_content(&self, content: &str) -> Result<Vec<Statement>, ParseError> {
        let data: Value = serde_json::from_str(content)?;
        let data = self.normalize(data)?;
        Ok(vec![to_statement(&data)?])
    }

    /// Apply the section rewrites to a raw document
    pub fn normalize(&self, data: Value) -> Result<Map<String, Value>, ParseError> {
        let Value::Object(mut data) = data else {
            return Err(ParseError::Structure(
                "Document root is not an object".to_string(),
            ));
        };
        for (section, mandatory, action) in SECTIONS {
            if !data.contains_key(*section) {
                if *mandatory {
                    return Err(ParseError::MissingSection(section.to_string()));
                }
                continue;
            }
            match action {
                SectionAction::ValidateVersion => self.validate_version(&mut data, section)?,
                SectionAction::Keep => {}
                SectionAction::BuildPeriod => build_period(&mut data),
                SectionAction::Remove => {
                    data.remove(*section);
                }
                SectionAction::LoadAssets => load_assets(&mut data, section)?,
                SectionAction::TweakAccounts => tweak_accounts(&mut data, section)?,
            }
        }
        Ok(data)
    }

    fn validate_version(
        &self,
        data: &mut Map<String, Value>,
        section: &str,
    ) -> Result<(), ParseError> {
        let version = data
            .get(section)
            .and_then(Value::as_str)
            .ok_or_else(|| ParseError::invalid(section, &data[section].to_string()))?
            .to_string();
        if compare_versions(&version, &self.max_version)? == Ordering::Greater {
            return Err(ParseError::UnsupportedVersion(version));
        }
        data.remove(section);
        Ok(())
    }
}

impl StatementParser for OpenPortfolioParser {
    fn parse(&self, path: &Path) -> Result<Vec<Statement>, ParseError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }
}

fn parse_version(version: &str) -> Result<Vec<u64>, ParseError> {
    version
        .trim()
        .split('.')
        .map(|part| {
            part.parse::<u64>()
                .map_err(|_| ParseError::invalid("version", version))
        })
        .collect()
}

/// Compare dotted numeric versions; missing components count as 0
pub fn compare_versions(a: &str, b: &str) -> Result<Ordering, ParseError> {
    let a = parse_version(a)?;
    let b = parse_version(b)?;
    for i in 0..a.len().max(b.len()) {
        let ordering = a.get(i).unwrap_or(&0).cmp(b.get(i).unwrap_or(&0));
        if ordering != Ordering::Equal {
            return Ok(ordering);
        }
    }
    Ok(Ordering::Equal)
}

fn build_period(data: &mut Map<String, Value>) {
    let start = data.remove("start").unwrap_or(Value::Null);
    let end = data.remove("end").unwrap_or(Value::Null);
    data.insert(PERIOD.to_string(), json!([start, end]));
}

fn load_assets(data: &mut Map<String, Value>, section: &str) -> Result<(), ParseError> {
    let mut symbols = Vec::new();
    let assets = data
        .get_mut(section)
        .and_then(Value::as_array_mut)
        .ok_or_else(|| ParseError::Structure(format!("Section '{}' is not a list", section)))?;
    for asset in assets.iter_mut() {
        let Some(asset) = asset.as_object_mut() else {
            return Err(ParseError::Structure(format!("Asset is not an object: {}", asset)));
        };
        let Some(asset_id) = asset.get("id").cloned() else {
            return Err(ParseError::Structure(format!(
                "Asset without id: {}",
                Value::Object(asset.clone())
            )));
        };
        if let Some(symbol) = asset.remove("symbol") {
            let exchange = asset.remove("exchange").unwrap_or(Value::String(String::new()));
            symbols.push(json!({
                "id": symbols.len() + 1,
                "asset": asset_id,
                "symbol": symbol,
                "note": exchange,
            }));
        }
    }
    data.insert(SYMBOLS.to_string(), Value::Array(symbols));
    Ok(())
}

fn tweak_accounts(data: &mut Map<String, Value>, section: &str) -> Result<(), ParseError> {
    let symbols = data.get(SYMBOLS).and_then(Value::as_array).cloned().unwrap_or_default();
    let accounts = data
        .get_mut(section)
        .and_then(Value::as_array_mut)
        .ok_or_else(|| ParseError::Structure(format!("Section '{}' is not a list", section)))?;
    for account in accounts.iter_mut() {
        let Some(account) = account.as_object_mut() else {
            return Err(ParseError::Structure(format!("Account is not an object: {}", account)));
        };
        let currency_name = account
            .remove("valuation-currency")
            .ok_or_else(|| {
                ParseError::Structure("Account without valuation-currency".to_string())
            })?;
        let currency = symbols
            .iter()
            .find(|s| s["symbol"] == currency_name)
            .ok_or_else(|| {
                ParseError::Structure(format!("Currency not found: {}", currency_name))
            })?;
        account.insert("currency".to_string(), currency["asset"].clone());
        account.remove("valuation");
    }
    Ok(())
}

fn asset_type(type_name: &str) -> Option<AssetType> {
    match type_name.to_lowercase().as_str() {
        "stock" | "share" => Some(AssetType::Stock),
        "bond" => Some(AssetType::Bond),
        "etf" | "fund" => Some(AssetType::Etf),
        "derivative" | "option" | "future" | "futures" => Some(AssetType::Derivative),
        "currency" | "money" => Some(AssetType::Currency),
        _ => None,
    }
}

fn text(value: &Value, key: &str) -> String {
    match &value[key] {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Dates are epoch seconds, RFC 3339 or `YYYY-MM-DD`
fn period_timestamp(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.timestamp())
            .ok()
            .or_else(|| {
                NaiveDate::parse_from_str(s, "%Y-%m-%d")
                    .ok()
                    .map(date_timestamp)
            }),
        _ => None,
    }
}

fn to_statement(data: &Map<String, Value>) -> Result<Statement, ParseError> {
    let empty = Vec::new();
    let symbols = data.get(SYMBOLS).and_then(Value::as_array).unwrap_or(&empty);
    let assets = data.get("assets").and_then(Value::as_array).unwrap_or(&empty);
    let accounts = data.get("accounts").and_then(Value::as_array).unwrap_or(&empty);

    let period = data.get(PERIOD).and_then(|period| {
        Some((period_timestamp(&period[0])?, period_timestamp(&period[1])?))
    });

    let mut events = Vec::new();
    for symbol in symbols {
        let asset = assets
            .iter()
            .find(|a| a["id"] == symbol["asset"])
            .ok_or_else(|| ParseError::Structure(format!("Asset not found: {}", symbol)))?;
        let category = text(asset, "type");
        events.push(Event::Asset(SecurityDefinition {
            symbol: text(symbol, "symbol"),
            name: text(asset, "name"),
            isin: text(asset, "isin"),
            asset_type: asset_type(&category),
            category,
        }));
    }

    let mut account_number = String::new();
    for account in accounts {
        let number = match text(account, "account-number") {
            n if n.is_empty() => text(account, "id"),
            n => n,
        };
        let currency = symbols
            .iter()
            .find(|s| s["asset"] == account["currency"])
            .map(|s| text(s, "symbol"));
        if account_number.is_empty() {
            account_number = number.clone();
        }
        events.push(Event::Account(AccountDefinition {
            account: AccountRef::new(&number, currency.as_deref()),
            name: text(account, "name"),
        }));
    }

    log::info!(
        "Open portfolio import: {} symbol(s), {} account(s)",
        symbols.len(),
        accounts.len()
    );
    Ok(Statement {
        report_type: ReportType::OpenPortfolio,
        account_number,
        period,
        events,
    })
}
