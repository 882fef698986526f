//! Idempotent ledger writes
//!
//! Every insert is preceded by a natural-key lookup, so replaying a
//! statement leaves the ledger unchanged. Writes are not wrapped in a
//! transaction; each one commits on its own.

use rusqlite::{named_params, Connection, OptionalExtension};

use crate::error::ImportResult;
use crate::models::{AccountId, ActionCategory, AgentId, AssetId, CorporateActionType, CountryId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteResult {
    Inserted(i64),
    AlreadyExists,
    Updated,
    Deleted(usize),
    NotFound,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewTrade {
    pub timestamp: i64,
    pub settlement: i64,
    pub number: String,
    pub account_id: AccountId,
    pub asset_id: AssetId,
    pub qty: f64,
    pub price: f64,
    /// Negative when it is a cost; the ledger keeps the opposite sign
    pub fee: f64,
    pub coupon: f64,
}

/// Natural key of a trade
#[derive(Debug, Clone, PartialEq)]
pub struct TradeKey {
    pub timestamp: i64,
    pub number: String,
    pub account_id: AccountId,
    pub asset_id: AssetId,
    pub qty: f64,
    pub price: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewTransfer {
    pub timestamp: i64,
    pub from_account_id: AccountId,
    pub from_amount: f64,
    pub to_account_id: AccountId,
    pub to_amount: f64,
    pub fee_account_id: AccountId,
    pub fee_amount: f64,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewCorporateAction {
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

#[derive(Debug, Clone, PartialEq)]
pub struct NewAction {
    pub timestamp: i64,
    pub account_id: AccountId,
    pub peer_id: AgentId,
    pub category: ActionCategory,
    pub amount: f64,
    pub note: String,
}

/// Withholding tax applied to an existing dividend
#[derive(Debug, Clone, PartialEq)]
pub struct NewWithholdingTax {
    pub timestamp: i64,
    pub account_id: AccountId,
    pub asset_id: AssetId,
    /// Positive when tax is withheld, negative for a reversal
    pub amount: f64,
    /// Start of the note of the dividend it belongs to
    pub dividend_prefix: String,
    pub country_id: CountryId,
    pub note: String,
    /// Identifies the statement line; see `tax_line_key`
    pub line_key: String,
}

/// Which columns identify an already loaded action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKey {
    /// Timestamp, account and amount
    Amount,
    /// Timestamp, account, category, amount and note
    Full,
}

/// Register key of one withholding tax line. Broker transaction ids are
/// used when present. Otherwise identical lines of a statement are told
/// apart by their ordinal, which is stable across re-imports.
pub fn tax_line_key(
    transaction_id: Option<i64>,
    timestamp: i64,
    amount: f64,
    note: &str,
    ordinal: usize,
) -> String {
    match transaction_id {
        Some(id) => format!("tid:{}", id),
        None => format!("{}|{:.6}|{}#{}", timestamp, amount, note, ordinal),
    }
}

/// Escape `%`, `_` and `\` for a `LIKE ... ESCAPE '\'` pattern
fn like_prefix(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

pub struct LedgerWriter<'a> {
    conn: &'a Connection,
    tolerance: f64,
}

impl<'a> LedgerWriter<'a> {
    pub fn new(conn: &'a Connection, tolerance: f64) -> Self {
        Self { conn, tolerance }
    }

    fn find_trade(&self, key: &TradeKey) -> ImportResult<Option<i64>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id FROM trades
                 WHERE timestamp = :timestamp AND asset_id = :asset AND account_id = :account
                   AND number = :number AND qty = :qty AND price = :price
                 LIMIT 1",
                named_params! {
                    ":timestamp": key.timestamp,
                    ":asset": key.asset_id,
                    ":account": key.account_id,
                    ":number": key.number,
                    ":qty": key.qty,
                    ":price": key.price,
                },
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn create_trade(&self, trade: &NewTrade) -> ImportResult<WriteResult> {
        let key = TradeKey {
            timestamp: trade.timestamp,
            number: trade.number.clone(),
            account_id: trade.account_id,
            asset_id: trade.asset_id,
            qty: trade.qty,
            price: trade.price,
        };
        if self.find_trade(&key)?.is_some() {
            log::info!("Import: Trade #{} already exists in ledger. Skipped", trade.number);
            return Ok(WriteResult::AlreadyExists);
        }
        self.conn.execute(
            "INSERT INTO trades (timestamp, settlement, number, account_id, asset_id, qty, price, fee, coupon)
             VALUES (:timestamp, :settlement, :number, :account, :asset, :qty, :price, :fee, :coupon)",
            named_params! {
                ":timestamp": trade.timestamp,
                ":settlement": trade.settlement,
                ":number": trade.number,
                ":account": trade.account_id,
                ":asset": trade.asset_id,
                ":qty": trade.qty,
                ":price": trade.price,
                ":fee": -trade.fee,
                ":coupon": trade.coupon,
            },
        )?;
        Ok(WriteResult::Inserted(self.conn.last_insert_rowid()))
    }

    /// Delete one trade matching the key
    pub fn delete_trade(&self, key: &TradeKey) -> ImportResult<WriteResult> {
        let Some(id) = self.find_trade(key)? else {
            log::warn!("Import: Trade #{} to cancel not found in ledger", key.number);
            return Ok(WriteResult::NotFound);
        };
        let deleted = self.conn.execute("DELETE FROM trades WHERE id = ?1", [id])?;
        log::info!("Import: Trade #{} cancelled", key.number);
        Ok(WriteResult::Deleted(deleted))
    }

    pub fn create_transfer(&self, transfer: &NewTransfer) -> ImportResult<WriteResult> {
        let existing: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM transfers_combined
                 WHERE from_timestamp = :timestamp AND from_acc_id = :from_acc AND to_acc_id = :to_acc",
                named_params! {
                    ":timestamp": transfer.timestamp,
                    ":from_acc": transfer.from_account_id,
                    ":to_acc": transfer.to_account_id,
                },
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_some() {
            log::info!(
                "Import: Currency exchange {}->{} already exists in ledger. Skipped",
                transfer.from_amount,
                transfer.to_amount
            );
            return Ok(WriteResult::AlreadyExists);
        }

        let has_fee = transfer.fee_amount.abs() > self.tolerance;
        let (fee_timestamp, fee_account, fee_amount) = if has_fee {
            (
                Some(transfer.timestamp),
                Some(transfer.fee_account_id),
                Some(transfer.fee_amount),
            )
        } else {
            (None, None, None)
        };
        self.conn.execute(
            "INSERT INTO transfers_combined (from_timestamp, from_acc_id, from_amount,
                 to_timestamp, to_acc_id, to_amount, fee_timestamp, fee_acc_id, fee_amount, note)
             VALUES (:timestamp, :from_acc, :from_amount, :timestamp, :to_acc, :to_amount,
                 :fee_timestamp, :fee_acc, :fee_amount, :note)",
            named_params! {
                ":timestamp": transfer.timestamp,
                ":from_acc": transfer.from_account_id,
                ":from_amount": transfer.from_amount,
                ":to_acc": transfer.to_account_id,
                ":to_amount": transfer.to_amount,
                ":fee_timestamp": fee_timestamp,
                ":fee_acc": fee_account,
                ":fee_amount": fee_amount,
                ":note": transfer.note,
            },
        )?;
        Ok(WriteResult::Inserted(self.conn.last_insert_rowid()))
    }

    pub fn create_dividend(
        &self,
        timestamp: i64,
        account_id: AccountId,
        asset_id: AssetId,
        amount: f64,
        note: &str,
    ) -> ImportResult<WriteResult> {
        let existing: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM dividends
                 WHERE timestamp = :timestamp AND account_id = :account AND asset_id = :asset AND note = :note",
                named_params! {
                    ":timestamp": timestamp,
                    ":account": account_id,
                    ":asset": asset_id,
                    ":note": note,
                },
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_some() {
            log::info!("Import: Dividend already exists: {}", note);
            return Ok(WriteResult::AlreadyExists);
        }
        self.conn.execute(
            "INSERT INTO dividends (timestamp, account_id, asset_id, sum, note)
             VALUES (:timestamp, :account, :asset, :sum, :note)",
            named_params! {
                ":timestamp": timestamp,
                ":account": account_id,
                ":asset": asset_id,
                ":sum": amount,
                ":note": note,
            },
        )?;
        Ok(WriteResult::Inserted(self.conn.last_insert_rowid()))
    }

    /// Add a withholding tax to the dividend whose note starts with
    /// `dividend_prefix`. A line already applied to that dividend (same
    /// line key) is not added again; reversals and re-applied taxes with
    /// identical text carry distinct keys and are all summed.
    pub fn add_withholding_tax(&self, tax: &NewWithholdingTax) -> ImportResult<WriteResult> {
        let dividend: Option<(i64, f64)> = self
            .conn
            .query_row(
                "SELECT id, sum_tax FROM dividends
                 WHERE timestamp = :timestamp AND account_id = :account AND asset_id = :asset
                   AND note LIKE :prefix ESCAPE '\\'
                 ORDER BY id LIMIT 1",
                named_params! {
                    ":timestamp": tax.timestamp,
                    ":account": tax.account_id,
                    ":asset": tax.asset_id,
                    ":prefix": like_prefix(&tax.dividend_prefix),
                },
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((dividend_id, old_tax)) = dividend else {
            return Ok(WriteResult::NotFound);
        };

        let applied = self.conn.execute(
            "INSERT OR IGNORE INTO dividend_taxes (dividend_id, line_key, timestamp, amount, note)
             VALUES (:dividend, :line_key, :timestamp, :amount, :note)",
            named_params! {
                ":dividend": dividend_id,
                ":line_key": tax.line_key,
                ":timestamp": tax.timestamp,
                ":amount": tax.amount,
                ":note": tax.note,
            },
        )?;
        if applied == 0 {
            log::info!("Import: Withholding tax already applied: {}", tax.note);
            return Ok(WriteResult::AlreadyExists);
        }
        self.conn.execute(
            "UPDATE dividends SET sum_tax = :tax, tax_country_id = :country WHERE id = :id",
            named_params! {
                ":tax": old_tax + tax.amount,
                ":country": tax.country_id,
                ":id": dividend_id,
            },
        )?;
        Ok(WriteResult::Updated)
    }

    pub fn create_corporate_action(
        &self,
        action: &NewCorporateAction,
    ) -> ImportResult<WriteResult> {
        let existing: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM corp_actions
                 WHERE timestamp = :timestamp AND type = :type AND account_id = :account
                   AND number = :number AND asset_id = :asset AND asset_id_new = :asset_new",
                named_params! {
                    ":timestamp": action.timestamp,
                    ":type": action.action_type.id(),
                    ":account": action.account_id,
                    ":number": action.number,
                    ":asset": action.asset_id_old,
                    ":asset_new": action.asset_id_new,
                },
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_some() {
            log::info!(
                "Import: Corp.Action #{} already exists in ledger. Skipped",
                action.number
            );
            return Ok(WriteResult::AlreadyExists);
        }
        self.conn.execute(
            "INSERT INTO corp_actions (timestamp, number, account_id, type, asset_id, qty, asset_id_new, qty_new, note)
             VALUES (:timestamp, :number, :account, :type, :asset, :qty, :asset_new, :qty_new, :note)",
            named_params! {
                ":timestamp": action.timestamp,
                ":number": action.number,
                ":account": action.account_id,
                ":type": action.action_type.id(),
                ":asset": action.asset_id_old,
                ":qty": action.qty_old,
                ":asset_new": action.asset_id_new,
                ":qty_new": action.qty_new,
                ":note": action.note,
            },
        )?;
        Ok(WriteResult::Inserted(self.conn.last_insert_rowid()))
    }

    /// Insert an action with its single detail line
    pub fn create_action(&self, action: &NewAction, key: ActionKey) -> ImportResult<WriteResult> {
        let existing: Option<i64> = match key {
            ActionKey::Amount => self
                .conn
                .query_row(
                    "SELECT a.id FROM actions a JOIN action_details d ON d.pid = a.id
                     WHERE a.timestamp = :timestamp AND a.account_id = :account AND d.sum = :amount",
                    named_params! {
                        ":timestamp": action.timestamp,
                        ":account": action.account_id,
                        ":amount": action.amount,
                    },
                    |row| row.get(0),
                )
                .optional()?,
            ActionKey::Full => self
                .conn
                .query_row(
                    "SELECT a.id FROM actions a JOIN action_details d ON d.pid = a.id
                     WHERE a.timestamp = :timestamp AND a.account_id = :account
                       AND d.category_id = :category AND d.sum = :amount AND d.note = :note",
                    named_params! {
                        ":timestamp": action.timestamp,
                        ":account": action.account_id,
                        ":category": action.category.id(),
                        ":amount": action.amount,
                        ":note": action.note,
                    },
                    |row| row.get(0),
                )
                .optional()?,
        };
        if existing.is_some() {
            log::info!(
                "Import: {} operation already exists: {}",
                action.category.name(),
                action.note
            );
            return Ok(WriteResult::AlreadyExists);
        }

        self.conn.execute(
            "INSERT INTO actions (timestamp, account_id, peer_id) VALUES (:timestamp, :account, :peer)",
            named_params! {
                ":timestamp": action.timestamp,
                ":account": action.account_id,
                ":peer": action.peer_id,
            },
        )?;
        let pid = self.conn.last_insert_rowid();
        self.conn.execute(
            "INSERT INTO action_details (pid, category_id, sum, note) VALUES (:pid, :category, :sum, :note)",
            named_params! {
                ":pid": pid,
                ":category": action.category.id(),
                ":sum": action.amount,
                ":note": action.note,
            },
        )?;
        Ok(WriteResult::Inserted(pid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing;
    use crate::models::AssetType;

    fn trade(account_id: AccountId, asset_id: AssetId, qty: f64) -> NewTrade {
        NewTrade {
            timestamp: 1583140512,
            settlement: 1583280000,
            number: "1001".to_string(),
            account_id,
            asset_id,
            qty,
            price: 300.5,
            fee: -1.5,
            coupon: 0.0,
        }
    }

    fn key(trade: &NewTrade) -> TradeKey {
        TradeKey {
            timestamp: trade.timestamp,
            number: trade.number.clone(),
            account_id: trade.account_id,
            asset_id: trade.asset_id,
            qty: trade.qty,
            price: trade.price,
        }
    }

    #[test]
    fn test_like_prefix_escapes_wildcards() {
        assert_eq!(like_prefix("ABC 100%_x"), "ABC 100\\%\\_x%");
        assert_eq!(like_prefix(""), "%");
    }

    #[test]
    fn test_trade_insert_is_idempotent_and_fee_negated() {
        let conn = testing::memory_db();
        let account = testing::add_account(&conn, "U100", "USD");
        let asset = testing::add_asset(&conn, "SPY", AssetType::Etf);
        let writer = LedgerWriter::new(&conn, 1e-10);

        let new_trade = trade(account, asset, 10.0);
        assert!(matches!(writer.create_trade(&new_trade).unwrap(), WriteResult::Inserted(_)));
        assert_eq!(writer.create_trade(&new_trade).unwrap(), WriteResult::AlreadyExists);
        assert_eq!(testing::count(&conn, "trades"), 1);

        let fee: f64 = conn.query_row("SELECT fee FROM trades", [], |row| row.get(0)).unwrap();
        assert_eq!(fee, 1.5);
    }

    #[test]
    fn test_cancel_deletes_exactly_one_trade() {
        let conn = testing::memory_db();
        let account = testing::add_account(&conn, "U100", "USD");
        let asset = testing::add_asset(&conn, "SPY", AssetType::Etf);
        let writer = LedgerWriter::new(&conn, 1e-10);
        let new_trade = trade(account, asset, 10.0);

        // Cancel before the original: nothing to delete, nothing created
        assert_eq!(writer.delete_trade(&key(&new_trade)).unwrap(), WriteResult::NotFound);
        assert_eq!(testing::count(&conn, "trades"), 0);

        writer.create_trade(&new_trade).unwrap();
        conn.execute(
            "INSERT INTO trades (timestamp, settlement, number, account_id, asset_id, qty, price, fee, coupon)
             SELECT timestamp, settlement, number, account_id, asset_id, qty, price, fee, coupon FROM trades",
            [],
        )
        .unwrap();
        assert_eq!(writer.delete_trade(&key(&new_trade)).unwrap(), WriteResult::Deleted(1));
        assert_eq!(testing::count(&conn, "trades"), 1);
    }

    #[test]
    fn test_transfer_fee_leg_above_tolerance_only() {
        let conn = testing::memory_db();
        let usd = testing::add_account(&conn, "U100", "USD");
        let eur = testing::add_account(&conn, "U100", "EUR");
        let writer = LedgerWriter::new(&conn, 1e-10);

        let mut transfer = NewTransfer {
            timestamp: 100,
            from_account_id: usd,
            from_amount: -1100.0,
            to_account_id: eur,
            to_amount: 1000.0,
            fee_account_id: usd,
            fee_amount: 0.0,
            note: "IDEALFX".to_string(),
        };
        writer.create_transfer(&transfer).unwrap();
        transfer.timestamp = 200;
        transfer.fee_amount = -2.0;
        writer.create_transfer(&transfer).unwrap();
        assert_eq!(writer.create_transfer(&transfer).unwrap(), WriteResult::AlreadyExists);

        let fees: Vec<Option<f64>> = conn
            .prepare("SELECT fee_amount FROM transfers_combined ORDER BY from_timestamp")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(fees, vec![None, Some(-2.0)]);
    }

    #[test]
    fn test_withholding_tax_merge() {
        let conn = testing::memory_db();
        let account = testing::add_account(&conn, "U100", "USD");
        let asset = testing::add_asset(&conn, "SPY", AssetType::Etf);
        let writer = LedgerWriter::new(&conn, 1e-10);
        let note_prefix = "SPY(US78462F1030) CASH DIVIDEND USD 1.00 PER SHARE";
        writer.create_dividend(100, account, asset, 10.0, note_prefix).unwrap();
        conn.execute("INSERT INTO countries (name, code) VALUES ('USA', 'us')", []).unwrap();
        let country = conn.last_insert_rowid();

        let tax = |timestamp: i64, amount: f64, note: &str, ordinal: usize| {
            writer
                .add_withholding_tax(&NewWithholdingTax {
                    timestamp,
                    account_id: account,
                    asset_id: asset,
                    amount,
                    dividend_prefix: note_prefix.to_string(),
                    country_id: country,
                    note: note.to_string(),
                    line_key: tax_line_key(None, timestamp, amount, note, ordinal),
                })
                .unwrap()
        };
        assert_eq!(tax(100, 1.5, "T1 - US TAX", 0), WriteResult::Updated);
        assert_eq!(tax(100, 0.5, "T2 - US TAX", 0), WriteResult::Updated);
        assert_eq!(tax(100, 0.5, "T2 - US TAX", 0), WriteResult::AlreadyExists);
        // A second identical line of the same statement is a new tax
        assert_eq!(tax(100, 0.5, "T2 - US TAX", 1), WriteResult::Updated);
        assert_eq!(tax(999, 1.0, "x", 0), WriteResult::NotFound);

        let (sum_tax, tax_country): (f64, Option<i64>) = conn
            .query_row("SELECT sum_tax, tax_country_id FROM dividends", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .unwrap();
        assert_eq!(sum_tax, 2.5);
        assert_eq!(tax_country, Some(country));
    }

    #[test]
    fn test_tax_line_key() {
        assert_eq!(tax_line_key(Some(42), 100, 1.5, "US TAX", 3), "tid:42");
        assert_eq!(tax_line_key(None, 100, 1.5, "US TAX", 1), "100|1.500000|US TAX#1");
        assert_ne!(
            tax_line_key(None, 100, 1.5, "US TAX", 0),
            tax_line_key(None, 100, -1.5, "US TAX", 0)
        );
    }

    #[test]
    fn test_action_keys() {
        let conn = testing::memory_db();
        let account = testing::add_account(&conn, "U100", "USD");
        conn.execute("INSERT INTO agents (pid, name) VALUES (0, 'Bank')", []).unwrap();
        let bank = conn.last_insert_rowid();
        let writer = LedgerWriter::new(&conn, 1e-10);

        let mut fee = NewAction {
            timestamp: 100,
            account_id: account,
            peer_id: bank,
            category: ActionCategory::Fees,
            amount: -10.0,
            note: "MARKET DATA".to_string(),
        };
        let full = |fee: &NewAction| writer.create_action(fee, ActionKey::Full).unwrap();
        assert!(matches!(full(&fee), WriteResult::Inserted(_)));
        assert_eq!(full(&fee), WriteResult::AlreadyExists);
        fee.note = "SNAPSHOT".to_string();
        assert!(matches!(full(&fee), WriteResult::Inserted(_)));
        // Same amount on the same day is a duplicate for the amount key
        fee.note = "OTHER".to_string();
        assert_eq!(
            writer.create_action(&fee, ActionKey::Amount).unwrap(),
            WriteResult::AlreadyExists
        );
        assert_eq!(testing::count(&conn, "action_details"), 2);
    }
}
