//! Quik HTML report parser
//!
//! The report consists of a header table with the client code and a deals
//! table with fixed Russian column captions. Reports are written in a
//! single-byte Windows codepage.

use chrono::{NaiveDate, NaiveDateTime};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::path::Path;

use super::{
    date_timestamp, datetime_timestamp, AccountRef, AssetRef, Event, ReportType, Statement,
    StatementParser, TradeAction, TradeRecord,
};
use crate::error::ParseError;

const CLIENT_PATTERN: &str = r"^Код клиента: (.*)$";

const DATE_TIME: &str = "Дата и время заключения сделки";
const TRADE_NUMBER: &str = "Номер сделки";
const SYMBOL: &str = "Код инструмента";
const NAME: &str = "Краткое наименование инструмента";
const TYPE: &str = "Направление";
const QTY: &str = "Кол-во";
const PRICE: &str = "Цена";
const AMOUNT: &str = "Объём";
const COUPON: &str = "НКД";
const SETTLE_DATE: &str = "Дата расчётов";
const BUY: &str = "Купля";
const SELL: &str = "Продажа";
const FEE: &str = "Комиссия Брокера";
/// Exchange fee as one column
const FEE_EX: &str = "Суммарная комиссия ТС";
/// Exchange fee split into three columns
const FEE_EX1: &str = "Комиссия за ИТС";
const FEE_EX2: &str = "Комиссия за организацию торговли";
const FEE_EX3: &str = "Клиринговая комиссия";
const TOTAL: &str = "ИТОГО";

const DATE_TIME_FORMAT: &str = "%d.%m.%Y %H:%M:%S";
const DATE_FORMAT: &str = "%d.%m.%Y";

static TABLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<table[^>]*>(.*?)</table>").expect("valid regex"));
static ROW_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<tr[^>]*>(.*?)</tr>").expect("valid regex"));
static CELL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<t[dh][^>]*>(.*?)</t[dh]>").expect("valid regex"));
static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]*>").expect("valid regex"));
static CLIENT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(CLIENT_PATTERN).expect("valid regex"));

type Table = Vec<Vec<String>>;

pub struct QuikParser {
    encoding: String,
}

impl QuikParser {
    pub fn new(encoding: &str) -> Self {
        Self {
            encoding: encoding.to_string(),
        }
    }

    pub fn parse_bytes(&self, bytes: &[u8]) -> Result<Vec<Statement>, ParseError> {
        let encoding = encoding_rs::Encoding::for_label(self.encoding.as_bytes())
            .ok_or_else(|| ParseError::Encoding(self.encoding.clone()))?;
        let (html, _, had_errors) = encoding.decode(bytes);
        if had_errors {
            log::warn!(
                "Quik import: Report contains characters invalid in {}",
                encoding.name()
            );
        }
        self.parse_html(&html)
    }

    pub fn parse_html(&self, html: &str) -> Result<Vec<Statement>, ParseError> {
        let tables = extract_tables(html);
        if tables.len() < 2 {
            return Err(ParseError::MissingSection("deals table".to_string()));
        }

        let client = find_client_code(&tables[0]).ok_or_else(|| {
            ParseError::Structure("Can't get account number from the statement".to_string())
        })?;
        let account = AccountRef::new(&client, None);

        let deals = &tables[1];
        let header_pos = deals
            .iter()
            .position(|row| row.iter().any(|cell| cell == TYPE))
            .ok_or_else(|| ParseError::MissingColumn(TYPE.to_string()))?;
        let columns = DealColumns::from_header(&deals[header_pos])?;

        let mut events = Vec::new();
        for row in &deals[header_pos + 1..] {
            let deal_type = columns.cell(row, columns.deal_type);
            let sign = if deal_type == BUY {
                1.0
            } else if deal_type == SELL {
                -1.0
            } else if deal_type.starts_with(TOTAL) {
                break;
            } else {
                log::warn!("Quik import: Unknown operation type '{}'", deal_type);
                continue;
            };
            events.push(Event::Trade(columns.read_trade(row, &account, sign)?));
        }

        log::info!(
            "Quik import: {} deal(s) for client {}",
            events.len(),
            client
        );
        Ok(vec![Statement {
            report_type: ReportType::Quik,
            account_number: client,
            period: None,
            events,
        }])
    }
}

impl StatementParser for QuikParser {
    fn parse(&self, path: &Path) -> Result<Vec<Statement>, ParseError> {
        let bytes = std::fs::read(path)?;
        self.parse_bytes(&bytes)
    }
}

/// Broker dependent layout of the exchange fee
#[derive(Debug)]
enum ExchangeFee {
    Total(usize),
    Itemized(usize, usize, usize),
}

/// Column positions of the deals table
#[derive(Debug)]
struct DealColumns {
    date_time: usize,
    number: usize,
    symbol: usize,
    name: usize,
    deal_type: usize,
    qty: usize,
    price: usize,
    amount: usize,
    coupon: usize,
    settle_date: usize,
    fee: usize,
    exchange_fee: ExchangeFee,
}

impl DealColumns {
    fn from_header(header: &[String]) -> Result<Self, ParseError> {
        let index: HashMap<&str, usize> = header
            .iter()
            .enumerate()
            .map(|(i, caption)| (caption.as_str(), i))
            .collect();
        let column = |caption: &str| -> Result<usize, ParseError> {
            index
                .get(caption)
                .copied()
                .ok_or_else(|| ParseError::MissingColumn(caption.to_string()))
        };

        let exchange_fee = match index.get(FEE_EX) {
            Some(&i) => ExchangeFee::Total(i),
            None => ExchangeFee::Itemized(column(FEE_EX1)?, column(FEE_EX2)?, column(FEE_EX3)?),
        };
        Ok(Self {
            date_time: column(DATE_TIME)?,
            number: column(TRADE_NUMBER)?,
            symbol: column(SYMBOL)?,
            name: column(NAME)?,
            deal_type: column(TYPE)?,
            qty: column(QTY)?,
            price: column(PRICE)?,
            amount: column(AMOUNT)?,
            coupon: column(COUPON)?,
            settle_date: column(SETTLE_DATE)?,
            fee: column(FEE)?,
            exchange_fee,
        })
    }

    fn cell<'a>(&self, row: &'a [String], idx: usize) -> &'a str {
        row.get(idx).map(String::as_str).unwrap_or("")
    }

    fn amount(&self, row: &[String], idx: usize) -> f64 {
        convert_amount(self.cell(row, idx))
    }

    fn read_trade(
        &self,
        row: &[String],
        account: &AccountRef,
        sign: f64,
    ) -> Result<TradeRecord, ParseError> {
        let date_time = self.cell(row, self.date_time);
        let timestamp = NaiveDateTime::parse_from_str(date_time, DATE_TIME_FORMAT)
            .map(datetime_timestamp)
            .map_err(|_| ParseError::invalid(DATE_TIME, date_time))?;
        let settle_date = self.cell(row, self.settle_date);
        let settlement = NaiveDate::parse_from_str(settle_date, DATE_FORMAT)
            .map(date_timestamp)
            .map_err(|_| ParseError::invalid(SETTLE_DATE, settle_date))?;

        let qty = sign * self.amount(row, self.qty).trunc();
        let price = self.amount(row, self.price);
        let amount = self.amount(row, self.amount);
        let exchange_fee = match self.exchange_fee {
            ExchangeFee::Total(i) => self.amount(row, i),
            ExchangeFee::Itemized(a, b, c) => {
                self.amount(row, a) + self.amount(row, b) + self.amount(row, c)
            }
        };
        let fee = self.amount(row, self.fee) + exchange_fee;

        Ok(TradeRecord {
            timestamp,
            settlement,
            number: self.cell(row, self.number).to_string(),
            account: account.clone(),
            asset: AssetRef {
                symbol: self.cell(row, self.symbol).to_string(),
                name: self.cell(row, self.name).to_string(),
                ..AssetRef::default()
            },
            action: if sign > 0.0 {
                TradeAction::Buy
            } else {
                TradeAction::Sell
            },
            qty: qty * lot_size(amount, price, qty),
            price,
            fee: -fee,
            coupon: self.amount(row, self.coupon),
        })
    }
}

/// Number of units in one quoted lot: the power of ten closest to
/// `amount / (price * |qty|)`. Degenerate rows count as single units.
pub fn lot_size(amount: f64, price: f64, qty: f64) -> f64 {
    let denominator = price * qty.abs();
    if denominator == 0.0 || amount == 0.0 {
        return 1.0;
    }
    10f64.powf((amount / denominator).abs().log10().round())
}

/// Numbers are printed with space separated thousands; unreadable means 0
fn convert_amount(value: &str) -> f64 {
    let cleaned: String = value
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '\u{a0}')
        .collect();
    cleaned.parse::<f64>().unwrap_or(0.0)
}

fn cell_text(raw: &str) -> String {
    let text = TAG_RE.replace_all(raw, " ");
    let text = html_escape::decode_html_entities(&text).replace('\u{a0}', " ");
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn extract_tables(html: &str) -> Vec<Table> {
    TABLE_RE
        .captures_iter(html)
        .map(|table| {
            ROW_RE
                .captures_iter(&table[1])
                .map(|row| {
                    CELL_RE
                        .captures_iter(&row[1])
                        .map(|cell| cell_text(&cell[1]))
                        .collect()
                })
                .collect()
        })
        .collect()
}

fn find_client_code(table: &Table) -> Option<String> {
    table.iter().flatten().find_map(|cell| {
        CLIENT_RE
            .captures(cell)
            .map(|caps| caps[1].trim().to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn report(fee_header: &str, deals: &str) -> String {
        format!(
            r#"<html><body>
<table><tr><td>Отчет по сделкам</td></tr><tr><td>Код клиента: 12345/01</td></tr></table>
<table>
<tr><th>Дата и время заключения сделки</th><th>Номер сделки</th><th>Код инструмента</th>
<th>Краткое наименование инструмента</th><th>Направление</th><th>Кол-во</th><th>Цена</th>
<th>Объём</th><th>НКД</th><th>Дата расчётов</th><th>Комиссия Брокера</th>{}</tr>
{}
<tr><td></td><td></td><td></td><td></td><td>ИТОГО по сделкам</td></tr>
<tr><td>02.03.2020 10:00:00</td><td>999</td><td>AFTER</td><td>After total</td><td>Купля</td></tr>
</table></body></html>"#,
            fee_header, deals
        )
    }

    fn deal(kind: &str, qty: &str, price: &str, amount: &str, fees: &str) -> String {
        format!(
            "<tr><td>02.03.2020 10:15:30</td><td>5551</td><td>SBER</td><td>Сбербанк</td>\
             <td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>0</td><td>04.03.2020</td>{}</tr>",
            kind, qty, price, amount, fees
        )
    }

    #[test]
    fn test_lot_size() {
        assert_eq!(lot_size(10000.0, 100.0, 1.0), 100.0);
        assert_eq!(lot_size(250.0, 250.0, -1.0), 1.0);
        assert_eq!(lot_size(0.0, 100.0, 1.0), 1.0);
        assert_eq!(lot_size(100.0, 0.0, 1.0), 1.0);
    }

    #[test]
    fn test_convert_amount() {
        assert_eq!(convert_amount("10 000.50"), 10000.5);
        assert_eq!(convert_amount("1\u{a0}234"), 1234.0);
        assert_eq!(convert_amount("n/a"), 0.0);
    }

    #[test]
    fn test_parse_deals_with_total_fee_column() {
        let html = report(
            "<th>Суммарная комиссия ТС</th>",
            &[
                deal("Купля", "1", "100", "10 000", "<td>1.25</td><td>0.25</td>"),
                deal("Перевод", "1", "100", "100", "<td>0</td><td>0</td>"),
                deal("Продажа", "2", "50", "100", "<td>0.5</td><td>0</td>"),
            ]
            .join("\n"),
        );
        let statements = QuikParser::new("windows-1251").parse_html(&html).unwrap();
        assert_eq!(statements.len(), 1);
        assert_eq!(statements[0].account_number, "12345/01");
        assert_eq!(statements[0].events.len(), 2);

        match &statements[0].events[0] {
            Event::Trade(trade) => {
                assert_eq!(trade.qty, 100.0);
                assert_eq!(trade.fee, -1.5);
                assert_eq!(trade.timestamp, 1583144130);
                assert_eq!(trade.settlement, 1583280000);
                assert_eq!(trade.account.currency, None);
                assert_eq!(trade.asset.symbol, "SBER");
            }
            other => panic!("unexpected event {:?}", other),
        }
        match &statements[0].events[1] {
            Event::Trade(trade) => {
                assert_eq!(trade.action, TradeAction::Sell);
                assert_eq!(trade.qty, -2.0);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_itemized_fee_columns() {
        let html = report(
            "<th>Комиссия за ИТС</th><th>Комиссия за организацию торговли</th><th>Клиринговая комиссия</th>",
            &deal("Купля", "1", "10", "10", "<td>1</td><td>0.1</td><td>0.2</td><td>0.2</td>"),
        );
        let statements = QuikParser::new("windows-1251").parse_html(&html).unwrap();
        match &statements[0].events[0] {
            Event::Trade(trade) => assert!((trade.fee + 1.5).abs() < 1e-9),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_missing_fee_columns_is_error() {
        let html = report("", &deal("Купля", "1", "10", "10", "<td>1</td>"));
        assert!(matches!(
            QuikParser::new("windows-1251").parse_html(&html),
            Err(ParseError::MissingColumn(_))
        ));
    }

    #[test]
    fn test_parse_cp1251_file() {
        let html = report(
            "<th>Суммарная комиссия ТС</th>",
            &deal("Купля", "3", "20", "60", "<td>0</td><td>0</td>"),
        );
        let (bytes, _, _) = encoding_rs::WINDOWS_1251.encode(&html);
        let mut file = tempfile::Builder::new().suffix(".htm").tempfile().unwrap();
        file.write_all(&bytes).unwrap();

        let statements = QuikParser::new("windows-1251").parse(file.path()).unwrap();
        assert_eq!(statements[0].events.len(), 1);

        assert!(matches!(
            QuikParser::new("no-such-codepage").parse(file.path()),
            Err(ParseError::Encoding(_))
        ));
    }
}
