//! Interactive Brokers flex-query parser
//!
//! Reads the attribute-only records of a flex XML report. One report may
//! hold several `FlexStatement` elements, one per account.

use chrono::{NaiveDate, NaiveTime};
use quick_xml::events::{BytesStart, Event as XmlEvent};
use quick_xml::Reader;
use std::collections::HashMap;
use std::path::Path;

use super::{
    date_timestamp, datetime_timestamp, AccountRef, AssetClass, AssetRef, CashRecord,
    CorporateActionRecord, CurrencyTradeRecord, Event, ReorgType, ReportType, SecurityDefinition,
    Statement, StatementParser, TradeAction, TradeRecord, TransactionTaxRecord, UnsupportedKind,
};
use crate::error::ParseError;

/// Flex code marking a cancelled corporate action
const CANCEL_CODE: &str = "Ca";

/// Attributes of one flex record
#[derive(Debug, Clone, Default)]
struct FlexRecord {
    attrs: HashMap<String, String>,
}

impl FlexRecord {
    fn from_element(e: &BytesStart) -> Self {
        let mut attrs = HashMap::new();
        for attr in e.attributes().flatten() {
            let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
            let raw = String::from_utf8_lossy(&attr.value).to_string();
            let value = match quick_xml::escape::unescape(&raw) {
                Ok(value) => value.to_string(),
                Err(_) => raw,
            };
            attrs.insert(key, value);
        }
        Self { attrs }
    }

    /// Attribute value, empty if absent
    fn text(&self, name: &str) -> &str {
        self.attrs.get(name).map(|s| s.trim()).unwrap_or("")
    }

    /// Numeric attribute; empty means 0
    fn float(&self, name: &str) -> Result<f64, ParseError> {
        let value = self.text(name);
        if value.is_empty() {
            return Ok(0.0);
        }
        value
            .replace(',', "")
            .parse::<f64>()
            .map_err(|_| ParseError::invalid(name, value))
    }

    fn timestamp(&self, name: &str) -> Result<i64, ParseError> {
        parse_flex_datetime(self.text(name))
            .ok_or_else(|| ParseError::invalid(name, self.text(name)))
    }

    fn account(&self, statement_account: &str) -> AccountRef {
        let number = match self.text("accountId") {
            "" => statement_account,
            number => number,
        };
        AccountRef::new(number, Some(self.text("currency")))
    }

    fn asset(&self) -> AssetRef {
        AssetRef {
            symbol: self.text("symbol").to_string(),
            name: self.text("description").to_string(),
            isin: self.text("isin").to_string(),
            asset_type: AssetClass::from_code(self.text("assetCategory"))
                .asset_type(self.text("subCategory")),
        }
    }
}

/// Records of one `FlexStatement`, grouped by section
#[derive(Debug, Default)]
struct FlexStatement {
    header: FlexRecord,
    securities: Vec<FlexRecord>,
    trades: Vec<FlexRecord>,
    taxes: Vec<FlexRecord>,
    corporate_actions: Vec<FlexRecord>,
    cash: Vec<FlexRecord>,
}

pub struct IbkrParser;

impl IbkrParser {
    pub fn new() -> Self {
        Self
    }

    pub fn parse_content(&self, content: &str) -> Result<Vec<Statement>, ParseError> {
        let flex_statements = read_flex_statements(content)?;
        if flex_statements.is_empty() {
            return Err(ParseError::MissingSection("FlexStatement".to_string()));
        }
        flex_statements.iter().map(convert_statement).collect()
    }
}

impl Default for IbkrParser {
    fn default() -> Self {
        Self::new()
    }
}

impl StatementParser for IbkrParser {
    fn parse(&self, path: &Path) -> Result<Vec<Statement>, ParseError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }
}

fn read_flex_statements(content: &str) -> Result<Vec<FlexStatement>, ParseError> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut statements = Vec::new();
    let mut current: Option<FlexStatement> = None;
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(XmlEvent::Start(ref e)) | Ok(XmlEvent::Empty(ref e)) => {
                if e.name().as_ref() == b"FlexStatement" {
                    if let Some(done) = current.take() {
                        statements.push(done);
                    }
                    current = Some(FlexStatement {
                        header: FlexRecord::from_element(e),
                        ..FlexStatement::default()
                    });
                } else if let Some(statement) = current.as_mut() {
                    match e.name().as_ref() {
                        b"SecurityInfo" => statement.securities.push(FlexRecord::from_element(e)),
                        b"Trade" => {
                            let record = FlexRecord::from_element(e);
                            // Order and lot summaries repeat the executions
                            match record.text("levelOfDetail") {
                                "" | "EXECUTION" => statement.trades.push(record),
                                _ => {}
                            }
                        }
                        b"TransactionTax" => statement.taxes.push(FlexRecord::from_element(e)),
                        b"CorporateAction" => {
                            statement.corporate_actions.push(FlexRecord::from_element(e))
                        }
                        b"CashTransaction" => statement.cash.push(FlexRecord::from_element(e)),
                        _ => {}
                    }
                }
            }
            Ok(XmlEvent::End(ref e)) if e.name().as_ref() == b"FlexStatement" => {
                if let Some(done) = current.take() {
                    statements.push(done);
                }
            }
            Ok(XmlEvent::Eof) => break,
            Err(e) => {
                return Err(ParseError::Xml(format!(
                    "at position {}: {}",
                    reader.error_position(),
                    e
                )))
            }
            _ => {}
        }
        buf.clear();
    }
    if let Some(done) = current.take() {
        statements.push(done);
    }
    Ok(statements)
}

fn convert_statement(flex: &FlexStatement) -> Result<Statement, ParseError> {
    let account_number = flex.header.text("accountId").to_string();
    if account_number.is_empty() {
        return Err(ParseError::Structure(
            "FlexStatement without accountId".to_string(),
        ));
    }
    let period = match (
        parse_flex_datetime(flex.header.text("fromDate")),
        parse_flex_datetime(flex.header.text("toDate")),
    ) {
        (Some(from), Some(to)) => Some((from, to)),
        _ => None,
    };
    log::info!(
        "IBKR import: Flex-statement for account {} from {} to {}",
        account_number,
        flex.header.text("fromDate"),
        flex.header.text("toDate")
    );

    let mut events = Vec::new();
    for record in &flex.securities {
        events.push(convert_security(record));
    }
    for record in &flex.trades {
        events.push(convert_trade(record, &account_number)?);
    }
    for record in &flex.taxes {
        events.push(convert_transaction_tax(record, &account_number)?);
    }
    for record in &flex.corporate_actions {
        events.push(convert_corporate_action(record, &account_number)?);
    }
    // Dividends go first so that withholding taxes find them
    let mut other_cash = Vec::new();
    for record in &flex.cash {
        match convert_cash(record, &account_number)? {
            event @ Event::Dividend(_) => events.push(event),
            event => other_cash.push(event),
        }
    }
    events.extend(other_cash);

    Ok(Statement {
        report_type: ReportType::Ibkr,
        account_number,
        period,
        events,
    })
}

fn convert_security(record: &FlexRecord) -> Event {
    let category = record.text("assetCategory");
    Event::Asset(SecurityDefinition {
        symbol: record.text("symbol").to_string(),
        name: record.text("description").to_string(),
        isin: record.text("isin").to_string(),
        category: category.to_string(),
        asset_type: AssetClass::from_code(category).asset_type(record.text("subCategory")),
    })
}

fn trade_action(buy_sell: &str) -> Option<TradeAction> {
    match buy_sell {
        "BUY" => Some(TradeAction::Buy),
        "SELL" => Some(TradeAction::Sell),
        "BUY (Ca.)" => Some(TradeAction::CancelBuy),
        "SELL (Ca.)" => Some(TradeAction::CancelSell),
        _ => None,
    }
}

fn convert_trade(record: &FlexRecord, statement_account: &str) -> Result<Event, ParseError> {
    let asset_class = AssetClass::from_code(record.text("assetCategory"));
    let buy_sell = record.text("buySell");
    let unsupported_type = || Event::Unsupported {
        kind: UnsupportedKind::TradeType,
        description: format!(
            "{} trade #{} of {}",
            buy_sell,
            record.text("tradeID"),
            record.text("symbol")
        ),
    };

    match asset_class {
        AssetClass::Stock | AssetClass::Option => {
            let Some(action) = trade_action(buy_sell) else {
                return Ok(unsupported_type());
            };
            let multiplier = match record.float("multiplier")? {
                m if m == 0.0 => 1.0,
                m => m,
            };
            let settlement = match record.text("settleDateTarget") {
                "" => 0,
                _ => record.timestamp("settleDateTarget")?,
            };
            Ok(Event::Trade(TradeRecord {
                timestamp: record.timestamp("dateTime")?,
                settlement,
                number: record.text("tradeID").to_string(),
                account: record.account(statement_account),
                asset: record.asset(),
                action,
                qty: record.float("quantity")? * multiplier,
                price: record.float("tradePrice")?,
                fee: record.float("ibCommission")?,
                coupon: 0.0,
            }))
        }
        AssetClass::Cash => {
            let action = match trade_action(buy_sell) {
                Some(action @ (TradeAction::Buy | TradeAction::Sell)) => action,
                _ => return Ok(unsupported_type()),
            };
            let symbol = record.text("symbol");
            if symbol.split('.').count() != 2 {
                return Err(ParseError::invalid("symbol", symbol));
            }
            let account_number = match record.text("accountId") {
                "" => statement_account,
                number => number,
            };
            Ok(Event::CurrencyTrade(CurrencyTradeRecord {
                timestamp: record.timestamp("dateTime")?,
                account_number: account_number.to_string(),
                symbol: symbol.to_string(),
                action,
                quantity: record.float("quantity")?,
                proceeds: record.float("proceeds")?,
                fee: record.float("ibCommission")?,
                fee_currency: record.text("ibCommissionCurrency").to_string(),
                exchange: record.text("exchange").to_string(),
            }))
        }
        other => Ok(Event::Unsupported {
            kind: UnsupportedKind::AssetClass,
            description: format!(
                "{} trade #{} of {}",
                other.code(),
                record.text("tradeID"),
                record.text("symbol")
            ),
        }),
    }
}

fn convert_transaction_tax(
    record: &FlexRecord,
    statement_account: &str,
) -> Result<Event, ParseError> {
    let note = format!(
        "{} ({}) - {} (#{})",
        record.text("symbol"),
        record.text("description"),
        record.text("taxDescription"),
        record.text("tradeId")
    );
    Ok(Event::TransactionTax(TransactionTaxRecord {
        timestamp: record.timestamp("date")?,
        account: record.account(statement_account),
        amount: record.float("taxAmount")?,
        note,
    }))
}

fn convert_corporate_action(
    record: &FlexRecord,
    statement_account: &str,
) -> Result<Event, ParseError> {
    let transaction_id = record
        .text("transactionID")
        .parse::<i64>()
        .map_err(|_| ParseError::invalid("transactionID", record.text("transactionID")))?;
    let cancelled = record
        .text("code")
        .split(';')
        .any(|code| code.trim() == CANCEL_CODE);
    Ok(Event::CorporateAction(CorporateActionRecord {
        timestamp: record.timestamp("dateTime")?,
        transaction_id,
        account: record.account(statement_account),
        asset_class: AssetClass::from_code(record.text("assetCategory")),
        reorg: ReorgType::from_code(record.text("type")),
        cancelled,
        asset: record.asset(),
        listing_exchange: record.text("listingExchange").to_string(),
        quantity: record.float("quantity")?,
        description: record.text("description").to_string(),
    }))
}

fn convert_cash(record: &FlexRecord, statement_account: &str) -> Result<Event, ParseError> {
    let cash_type = record.text("type");
    let make_record = || -> Result<CashRecord, ParseError> {
        let asset = match record.text("symbol") {
            "" => None,
            _ => Some(record.asset()),
        };
        Ok(CashRecord {
            timestamp: record.timestamp("dateTime")?,
            transaction_id: record.text("transactionID").parse::<i64>().ok(),
            account: record.account(statement_account),
            asset,
            amount: record.float("amount")?,
            description: record.text("description").to_string(),
        })
    };
    let event = match cash_type {
        "Dividends" => Event::Dividend(make_record()?),
        "Withholding Tax" => Event::WithholdingTax(make_record()?),
        "Other Fees" | "Broker Interest Paid" => Event::Fee(make_record()?),
        "Broker Interest Received" => Event::Interest(make_record()?),
        "Deposits/Withdrawals" | "Deposits & Withdrawals" => {
            Event::DepositWithdraw(make_record()?)
        }
        other => Event::Unsupported {
            kind: UnsupportedKind::CashType,
            description: format!("{}: {}", other, record.text("description")),
        },
    };
    Ok(event)
}

/// Parse flex dates: `20200315`, `2020-03-15`, optionally followed by a
/// time as `;093000`, `;09:30:00` or `, 09:30:00`. Times are UTC.
pub fn parse_flex_datetime(value: &str) -> Option<i64> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    let (date_part, time_part) = match value.find([';', ',', ' ']) {
        Some(pos) => (&value[..pos], Some(value[pos + 1..].trim())),
        None => (value, None),
    };
    let date = NaiveDate::parse_from_str(date_part, "%Y%m%d")
        .or_else(|_| NaiveDate::parse_from_str(date_part, "%Y-%m-%d"))
        .ok()?;
    match time_part {
        None | Some("") => Some(date_timestamp(date)),
        Some(time) => {
            let time = NaiveTime::parse_from_str(time, "%H%M%S")
                .or_else(|_| NaiveTime::parse_from_str(time, "%H:%M:%S"))
                .ok()?;
            Some(datetime_timestamp(date.and_time(time)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AssetType;

    const FLEX: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<FlexQueryResponse queryName="ledger" type="AF">
<FlexStatements count="1">
<FlexStatement accountId="U7654321" fromDate="20200101" toDate="20201231">
<SecuritiesInfo>
<SecurityInfo assetCategory="STK" symbol="SPY" description="SPDR S&amp;P 500 ETF" isin="US78462F1030" subCategory="ETF" />
</SecuritiesInfo>
<Trades>
<Trade accountId="U7654321" currency="USD" assetCategory="STK" symbol="SPY" description="SPDR S&amp;P 500 ETF" isin="US78462F1030" dateTime="20200302;093512" settleDateTarget="20200304" tradeID="1001" quantity="10" multiplier="1" tradePrice="300.5" proceeds="-3005" ibCommission="-1.5" ibCommissionCurrency="USD" buySell="BUY" exchange="ARCA" levelOfDetail="EXECUTION" />
<Order accountId="U7654321" assetCategory="STK" symbol="SPY" levelOfDetail="ORDER" />
<Trade accountId="U7654321" currency="USD" assetCategory="CASH" symbol="EUR.USD" dateTime="20200303;101500" tradeID="1002" quantity="1000" proceeds="-1100" ibCommission="-2" ibCommissionCurrency="USD" buySell="BUY" exchange="IDEALFX" />
<Trade accountId="U7654321" currency="USD" assetCategory="WAR" symbol="XYZW" dateTime="20200303;101500" tradeID="1003" quantity="1" tradePrice="1" buySell="BUY" />
</Trades>
<CashTransactions>
<CashTransaction accountId="U7654321" currency="USD" assetCategory="STK" symbol="SPY" dateTime="20200320" type="Withholding Tax" amount="-1.5" description="SPY CASH DIVIDEND - US TAX" transactionID="9001" />
<CashTransaction accountId="U7654321" currency="USD" assetCategory="STK" symbol="SPY" dateTime="20200320" type="Dividends" amount="10" description="SPY CASH DIVIDEND USD 1.00 PER SHARE" />
<CashTransaction accountId="U7654321" currency="USD" dateTime="20200401" type="Commission Adjustments" amount="1" description="ADJ" />
</CashTransactions>
</FlexStatement>
</FlexStatements>
</FlexQueryResponse>"#;

    #[test]
    fn test_parse_flex_datetime() {
        assert_eq!(parse_flex_datetime("20200101"), Some(1577836800));
        assert_eq!(parse_flex_datetime("2020-01-01"), Some(1577836800));
        assert_eq!(parse_flex_datetime("20200101;010203"), Some(1577836800 + 3723));
        assert_eq!(parse_flex_datetime("2020-01-01, 01:02:03"), Some(1577836800 + 3723));
        assert_eq!(parse_flex_datetime(""), None);
        assert_eq!(parse_flex_datetime("yesterday"), None);
    }

    #[test]
    fn test_parse_statement_events() {
        let statements = IbkrParser::new().parse_content(FLEX).unwrap();
        assert_eq!(statements.len(), 1);
        let statement = &statements[0];
        assert_eq!(statement.account_number, "U7654321");
        assert!(statement.period.is_some());

        let kinds: Vec<&str> = statement.events.iter().map(|e| e.kind_name()).collect();
        assert_eq!(
            kinds,
            vec![
                "Asset",
                "Trade",
                "Currency exchange",
                "Unsupported",
                "Dividend",
                "Withholding tax",
                "Unsupported"
            ]
        );

        match &statement.events[0] {
            Event::Asset(asset) => {
                assert_eq!(asset.name, "SPDR S&P 500 ETF");
                assert_eq!(asset.asset_type, Some(AssetType::Etf));
            }
            other => panic!("unexpected event {:?}", other),
        }
        match &statement.events[1] {
            Event::Trade(trade) => {
                assert_eq!(trade.action, TradeAction::Buy);
                assert_eq!(trade.qty, 10.0);
                assert_eq!(trade.fee, -1.5);
                assert_eq!(trade.settlement, 1583280000);
                assert_eq!(trade.account.currency.as_deref(), Some("USD"));
            }
            other => panic!("unexpected event {:?}", other),
        }
        match &statement.events[3] {
            Event::Unsupported { kind, .. } => assert_eq!(*kind, UnsupportedKind::AssetClass),
            other => panic!("unexpected event {:?}", other),
        }
        match (&statement.events[4], &statement.events[5]) {
            (Event::Dividend(dividend), Event::WithholdingTax(tax)) => {
                assert_eq!(dividend.transaction_id, None);
                assert_eq!(tax.transaction_id, Some(9001));
            }
            other => panic!("unexpected events {:?}", other),
        }
    }

    #[test]
    fn test_cancelled_corporate_action_code() {
        let xml = r#"<FlexQueryResponse><FlexStatements><FlexStatement accountId="U1">
<CorporateActions>
<CorporateAction accountId="U1" currency="USD" assetCategory="STK" symbol="ABC" listingExchange="NYSE" dateTime="20200601;202500" type="TC" code="Ca;P" transactionID="77" quantity="5" description="ABC MERGED" />
</CorporateActions></FlexStatement></FlexStatements></FlexQueryResponse>"#;
        let statements = IbkrParser::new().parse_content(xml).unwrap();
        let actions = statements[0].corporate_actions();
        assert_eq!(actions.len(), 1);
        assert!(actions[0].cancelled);
        assert_eq!(actions[0].reorg, ReorgType::Merger);
        assert_eq!(actions[0].transaction_id, 77);
    }

    #[test]
    fn test_malformed_report_is_rejected() {
        let empty = "<FlexQueryResponse></FlexQueryResponse>";
        assert!(IbkrParser::new().parse_content(empty).is_err());
        let bad_number = r#"<FlexStatement accountId="U1"><Trades>
<Trade assetCategory="STK" symbol="A" dateTime="20200101" quantity="ten" buySell="BUY" />
</Trades></FlexStatement>"#;
        assert!(matches!(
            IbkrParser::new().parse_content(bad_number),
            Err(ParseError::InvalidValue { .. })
        ));
    }
}
