//! Read-only ledger queries.
//!
//! Used by the UI to display what an import wrote. Every function takes an
//! optional account filter and returns rows ordered by timestamp.

use rusqlite::{params, Connection, Result, Row};
use serde::{Deserialize, Serialize};

use crate::models::{
    AccountId, Action, ActionCategory, CorporateAction, CorporateActionType, Dividend, Trade,
    Transfer,
};

/// Number of rows per ledger table
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerCounts {
    pub trades: i64,
    pub transfers: i64,
    pub dividends: i64,
    pub corporate_actions: i64,
    pub actions: i64,
}

pub fn get_trades(conn: &Connection, account_id: Option<AccountId>) -> Result<Vec<Trade>> {
    let mut stmt = conn.prepare(
        "SELECT id, timestamp, settlement, number, account_id, asset_id, qty, price, fee, coupon
         FROM trades
         WHERE ?1 IS NULL OR account_id = ?1
         ORDER BY timestamp, id",
    )?;
    let rows = stmt.query_map(params![account_id], |row| {
        Ok(Trade {
            id: row.get(0)?,
            timestamp: row.get(1)?,
            settlement: row.get(2)?,
            number: row.get(3)?,
            account_id: row.get(4)?,
            asset_id: row.get(5)?,
            qty: row.get(6)?,
            price: row.get(7)?,
            fee: row.get(8)?,
            coupon: row.get(9)?,
        })
    })?;
    rows.collect()
}

/// Transfers where the account is on either side
pub fn get_transfers(conn: &Connection, account_id: Option<AccountId>) -> Result<Vec<Transfer>> {
    let mut stmt = conn.prepare(
        "SELECT id, from_timestamp, from_acc_id, from_amount, to_acc_id, to_amount,
                fee_acc_id, fee_amount, note
         FROM transfers_combined
         WHERE ?1 IS NULL OR from_acc_id = ?1 OR to_acc_id = ?1
         ORDER BY from_timestamp, id",
    )?;
    let rows = stmt.query_map(params![account_id], |row| {
        Ok(Transfer {
            id: row.get(0)?,
            timestamp: row.get(1)?,
            from_account_id: row.get(2)?,
            from_amount: row.get(3)?,
            to_account_id: row.get(4)?,
            to_amount: row.get(5)?,
            fee_account_id: row.get(6)?,
            fee_amount: row.get(7)?,
            note: row.get(8)?,
        })
    })?;
    rows.collect()
}

pub fn get_dividends(conn: &Connection, account_id: Option<AccountId>) -> Result<Vec<Dividend>> {
    let mut stmt = conn.prepare(
        "SELECT id, timestamp, account_id, asset_id, sum, sum_tax, tax_country_id, note
         FROM dividends
         WHERE ?1 IS NULL OR account_id = ?1
         ORDER BY timestamp, id",
    )?;
    let rows = stmt.query_map(params![account_id], |row| {
        Ok(Dividend {
            id: row.get(0)?,
            timestamp: row.get(1)?,
            account_id: row.get(2)?,
            asset_id: row.get(3)?,
            amount: row.get(4)?,
            tax: row.get(5)?,
            tax_country_id: row.get(6)?,
            note: row.get(7)?,
        })
    })?;
    rows.collect()
}

fn map_corporate_action(row: &Row) -> Result<CorporateAction> {
    let type_id: i64 = row.get(4)?;
    let action_type = CorporateActionType::from_id(type_id).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Integer,
            format!("unknown corporate action type {}", type_id).into(),
        )
    })?;
    Ok(CorporateAction {
        id: row.get(0)?,
        timestamp: row.get(1)?,
        number: row.get(2)?,
        account_id: row.get(3)?,
        action_type,
        asset_id_old: row.get(5)?,
        qty_old: row.get(6)?,
        asset_id_new: row.get(7)?,
        qty_new: row.get(8)?,
        note: row.get(9)?,
    })
}

pub fn get_corporate_actions(
    conn: &Connection,
    account_id: Option<AccountId>,
) -> Result<Vec<CorporateAction>> {
    let mut stmt = conn.prepare(
        "SELECT id, timestamp, number, account_id, type, asset_id, qty, asset_id_new, qty_new, note
         FROM corp_actions
         WHERE ?1 IS NULL OR account_id = ?1
         ORDER BY timestamp, id",
    )?;
    let rows = stmt.query_map(params![account_id], map_corporate_action)?;
    rows.collect()
}

/// Actions joined with their detail line
pub fn get_actions(conn: &Connection, account_id: Option<AccountId>) -> Result<Vec<Action>> {
    let mut stmt = conn.prepare(
        "SELECT a.id, a.timestamp, a.account_id, a.peer_id, d.category_id, d.sum, d.note
         FROM actions a
         JOIN action_details d ON d.pid = a.id
         WHERE ?1 IS NULL OR a.account_id = ?1
         ORDER BY a.timestamp, a.id",
    )?;
    let rows = stmt.query_map(params![account_id], |row| {
        let category_id: i64 = row.get(4)?;
        let category = ActionCategory::from_id(category_id).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                4,
                rusqlite::types::Type::Integer,
                format!("unknown action category {}", category_id).into(),
            )
        })?;
        Ok(Action {
            id: row.get(0)?,
            timestamp: row.get(1)?,
            account_id: row.get(2)?,
            peer_id: row.get(3)?,
            category,
            amount: row.get(5)?,
            note: row.get(6)?,
        })
    })?;
    rows.collect()
}

pub fn get_ledger_counts(conn: &Connection) -> Result<LedgerCounts> {
    let count = |table: &str| -> Result<i64> {
        conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
    };
    Ok(LedgerCounts {
        trades: count("trades")?,
        transfers: count("transfers_combined")?,
        dividends: count("dividends")?,
        corporate_actions: count("corp_actions")?,
        actions: count("actions")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing;

    #[test]
    fn test_queries_filter_by_account() {
        let conn = testing::memory_db();
        let acc1 = testing::add_account(&conn, "U100", "USD");
        let acc2 = testing::add_account(&conn, "U200", "USD");
        let asset = testing::add_asset(&conn, "AAPL", crate::models::AssetType::Stock);
        for (ts, acc) in [(1, acc1), (2, acc2), (3, acc1)] {
            conn.execute(
                "INSERT INTO trades (timestamp, account_id, asset_id, qty, price) VALUES (?1, ?2, ?3, 1, 10)",
                params![ts, acc, asset],
            )
            .unwrap();
        }

        assert_eq!(get_trades(&conn, None).unwrap().len(), 3);
        let own = get_trades(&conn, Some(acc1)).unwrap();
        assert_eq!(own.iter().map(|t| t.timestamp).collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(get_ledger_counts(&conn).unwrap().trades, 3);
    }

    #[test]
    fn test_actions_joined_with_details() {
        let conn = testing::memory_db();
        let acc = testing::add_account(&conn, "U100", "USD");
        conn.execute(
            "INSERT INTO actions (timestamp, account_id) VALUES (10, ?1)",
            [acc],
        )
        .unwrap();
        let pid = conn.last_insert_rowid();
        conn.execute(
            "INSERT INTO action_details (pid, category_id, sum, note) VALUES (?1, 3, 1.25, 'Interest')",
            [pid],
        )
        .unwrap();

        let actions = get_actions(&conn, Some(acc)).unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].category, ActionCategory::Interest);
        assert_eq!(actions[0].amount, 1.25);
        assert!(get_corporate_actions(&conn, None).unwrap().is_empty());
    }
}
