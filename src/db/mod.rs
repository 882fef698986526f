pub mod queries;

use anyhow::Result;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Mutex;

use crate::models::ActionCategory;

pub static DB: once_cell::sync::Lazy<Mutex<Option<Connection>>> =
    once_cell::sync::Lazy::new(|| Mutex::new(None));

pub fn init_database(path: &Path) -> Result<()> {
    let conn = Connection::open(path)?;

    // Enable WAL mode for better concurrent access
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

    create_schema(&conn)?;

    *DB.lock()
        .map_err(|e| anyhow::anyhow!("Failed to lock database: {}", e))? = Some(conn);
    Ok(())
}

/// Create all ledger tables on a fresh or existing connection.
pub fn create_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;

    conn.execute_batch(
        r#"
        -- =============================================================================
        -- Reference data
        -- =============================================================================

        -- Banks, brokers and other counterparties
        CREATE TABLE IF NOT EXISTS agents (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            pid INTEGER NOT NULL DEFAULT 0,
            name TEXT NOT NULL UNIQUE,
            location TEXT
        );

        -- Assets and currencies; name holds the ticker symbol
        CREATE TABLE IF NOT EXISTS assets (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            type_id INTEGER NOT NULL,
            full_name TEXT NOT NULL DEFAULT '',
            isin TEXT NOT NULL DEFAULT '',
            src_id INTEGER NOT NULL DEFAULT -1
        );

        CREATE TABLE IF NOT EXISTS accounts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            number TEXT NOT NULL DEFAULT '',
            currency_id INTEGER NOT NULL,
            organization_id INTEGER,
            active INTEGER NOT NULL DEFAULT 1,
            FOREIGN KEY (currency_id) REFERENCES assets(id),
            FOREIGN KEY (organization_id) REFERENCES agents(id) ON DELETE SET NULL
        );
        CREATE INDEX IF NOT EXISTS idx_accounts_number ON accounts(number);

        CREATE TABLE IF NOT EXISTS countries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            code TEXT NOT NULL UNIQUE,
            tax_treaty INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS categories (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL
        );

        -- =============================================================================
        -- Operations
        -- =============================================================================

        CREATE TABLE IF NOT EXISTS trades (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp INTEGER NOT NULL,
            settlement INTEGER NOT NULL DEFAULT 0,
            number TEXT NOT NULL DEFAULT '',
            account_id INTEGER NOT NULL,
            asset_id INTEGER NOT NULL,
            qty REAL NOT NULL,
            price REAL NOT NULL,
            fee REAL NOT NULL DEFAULT 0,
            coupon REAL NOT NULL DEFAULT 0,
            FOREIGN KEY (account_id) REFERENCES accounts(id) ON DELETE CASCADE,
            FOREIGN KEY (asset_id) REFERENCES assets(id)
        );
        CREATE INDEX IF NOT EXISTS idx_trades_key ON trades(timestamp, account_id, asset_id);

        -- Cash movement between two accounts with an optional fee leg
        CREATE TABLE IF NOT EXISTS transfers_combined (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            from_timestamp INTEGER NOT NULL,
            from_acc_id INTEGER NOT NULL,
            from_amount REAL NOT NULL,
            to_timestamp INTEGER NOT NULL,
            to_acc_id INTEGER NOT NULL,
            to_amount REAL NOT NULL,
            fee_timestamp INTEGER,
            fee_acc_id INTEGER,
            fee_amount REAL,
            note TEXT NOT NULL DEFAULT '',
            FOREIGN KEY (from_acc_id) REFERENCES accounts(id) ON DELETE CASCADE,
            FOREIGN KEY (to_acc_id) REFERENCES accounts(id) ON DELETE CASCADE,
            FOREIGN KEY (fee_acc_id) REFERENCES accounts(id) ON DELETE SET NULL
        );

        CREATE TABLE IF NOT EXISTS dividends (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp INTEGER NOT NULL,
            account_id INTEGER NOT NULL,
            asset_id INTEGER NOT NULL,
            sum REAL NOT NULL,
            sum_tax REAL NOT NULL DEFAULT 0,
            tax_country_id INTEGER,
            note TEXT NOT NULL DEFAULT '',
            FOREIGN KEY (account_id) REFERENCES accounts(id) ON DELETE CASCADE,
            FOREIGN KEY (asset_id) REFERENCES assets(id),
            FOREIGN KEY (tax_country_id) REFERENCES countries(id) ON DELETE SET NULL
        );
        CREATE INDEX IF NOT EXISTS idx_dividends_key ON dividends(timestamp, account_id, asset_id);

        -- Withholding taxes already added to dividends.sum_tax, one row per statement line
        CREATE TABLE IF NOT EXISTS dividend_taxes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            dividend_id INTEGER NOT NULL,
            line_key TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            amount REAL NOT NULL,
            note TEXT NOT NULL DEFAULT '',
            UNIQUE(dividend_id, line_key),
            FOREIGN KEY (dividend_id) REFERENCES dividends(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS corp_actions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp INTEGER NOT NULL,
            number TEXT NOT NULL DEFAULT '',
            account_id INTEGER NOT NULL,
            type INTEGER NOT NULL,
            asset_id INTEGER NOT NULL,
            qty REAL NOT NULL,
            asset_id_new INTEGER NOT NULL,
            qty_new REAL NOT NULL,
            note TEXT NOT NULL DEFAULT '',
            FOREIGN KEY (account_id) REFERENCES accounts(id) ON DELETE CASCADE,
            FOREIGN KEY (asset_id) REFERENCES assets(id),
            FOREIGN KEY (asset_id_new) REFERENCES assets(id)
        );

        -- Income/spending operations (fees, interest, taxes)
        CREATE TABLE IF NOT EXISTS actions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp INTEGER NOT NULL,
            account_id INTEGER NOT NULL,
            peer_id INTEGER,
            FOREIGN KEY (account_id) REFERENCES accounts(id) ON DELETE CASCADE,
            FOREIGN KEY (peer_id) REFERENCES agents(id) ON DELETE SET NULL
        );

        CREATE TABLE IF NOT EXISTS action_details (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            pid INTEGER NOT NULL,
            category_id INTEGER NOT NULL,
            sum REAL NOT NULL,
            note TEXT NOT NULL DEFAULT '',
            FOREIGN KEY (pid) REFERENCES actions(id) ON DELETE CASCADE,
            FOREIGN KEY (category_id) REFERENCES categories(id)
        );
        CREATE INDEX IF NOT EXISTS idx_action_details_pid ON action_details(pid);

        -- =============================================================================
        -- Import history
        -- =============================================================================

        CREATE TABLE IF NOT EXISTS statement_imports (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            file_path TEXT NOT NULL,
            report_type TEXT NOT NULL,
            imported_at TEXT NOT NULL DEFAULT (datetime('now')),
            succeeded INTEGER NOT NULL,
            statements_count INTEGER NOT NULL DEFAULT 0,
            inserted_count INTEGER NOT NULL DEFAULT 0,
            skipped_count INTEGER NOT NULL DEFAULT 0,
            review_count INTEGER NOT NULL DEFAULT 0
        );
        "#,
    )?;

    for category in [ActionCategory::Fees, ActionCategory::Taxes, ActionCategory::Interest] {
        conn.execute(
            "INSERT OR IGNORE INTO categories (id, name) VALUES (?1, ?2)",
            rusqlite::params![category.id(), category.name()],
        )?;
    }

    // Run migrations for existing databases
    run_migrations(conn)?;

    Ok(())
}

/// Run database migrations to add missing columns to existing tables
fn run_migrations(conn: &Connection) -> Result<()> {
    // Migration: dividends created before withholding taxes were matched
    if !column_exists(conn, "dividends", "tax_country_id") {
        conn.execute(
            "ALTER TABLE dividends ADD COLUMN tax_country_id INTEGER REFERENCES countries(id)",
            [],
        )?;
        log::info!("Migration: Added tax_country_id column to dividends");
    }

    // Migration: bond coupons on trades
    if !column_exists(conn, "trades", "coupon") {
        conn.execute(
            "ALTER TABLE trades ADD COLUMN coupon REAL NOT NULL DEFAULT 0",
            [],
        )?;
        log::info!("Migration: Added coupon column to trades");
    }

    // Migration: tax register keyed by statement line instead of line content
    if !column_exists(conn, "dividend_taxes", "line_key") {
        conn.execute_batch(
            "ALTER TABLE dividend_taxes RENAME TO dividend_taxes_old;
             CREATE TABLE dividend_taxes (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 dividend_id INTEGER NOT NULL,
                 line_key TEXT NOT NULL,
                 timestamp INTEGER NOT NULL,
                 amount REAL NOT NULL,
                 note TEXT NOT NULL DEFAULT '',
                 UNIQUE(dividend_id, line_key),
                 FOREIGN KEY (dividend_id) REFERENCES dividends(id) ON DELETE CASCADE
             );
             INSERT INTO dividend_taxes (dividend_id, line_key, timestamp, amount, note)
                 SELECT dividend_id, timestamp || '|' || printf('%.6f', amount) || '|' || note || '#0',
                        timestamp, amount, note
                 FROM dividend_taxes_old;
             DROP TABLE dividend_taxes_old;",
        )?;
        log::info!("Migration: Rebuilt dividend_taxes with line keys");
    }

    Ok(())
}

/// Check if a column exists in a table
pub(crate) fn column_exists(conn: &Connection, table: &str, column: &str) -> bool {
    let sql = format!("PRAGMA table_info({})", table);
    if let Ok(mut stmt) = conn.prepare(&sql) {
        if let Ok(rows) = stmt.query_map([], |row| {
            let name: String = row.get(1)?;
            Ok(name)
        }) {
            for name in rows.flatten() {
                if name == column {
                    return true;
                }
            }
        }
    }
    false
}

/// Check if a table exists
pub(crate) fn table_exists(conn: &Connection, table: &str) -> bool {
    conn.query_row(
        "SELECT name FROM sqlite_master WHERE type='table' AND name=?1",
        [table],
        |_| Ok(()),
    )
    .is_ok()
}

pub fn get_connection() -> Result<std::sync::MutexGuard<'static, Option<Connection>>> {
    DB.lock().map_err(|e| anyhow::anyhow!("Failed to lock database: {}", e))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_is_reentrant() {
        let conn = testing::memory_db();
        create_schema(&conn).unwrap();
        assert!(table_exists(&conn, "corp_actions"));
        assert!(column_exists(&conn, "dividends", "sum_tax"));
        assert_eq!(testing::count(&conn, "categories"), 3);
    }

    #[test]
    fn test_migration_adds_missing_columns() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE dividends (id INTEGER PRIMARY KEY, timestamp INTEGER NOT NULL,
                account_id INTEGER NOT NULL, asset_id INTEGER NOT NULL, sum REAL NOT NULL,
                sum_tax REAL NOT NULL DEFAULT 0, note TEXT NOT NULL DEFAULT '');",
        )
        .unwrap();
        create_schema(&conn).unwrap();
        assert!(column_exists(&conn, "dividends", "tax_country_id"));
    }

    #[test]
    fn test_migration_rebuilds_tax_register() {
        let conn = testing::memory_db();
        // Account 1 in USD, asset 1
        testing::add_account(&conn, "U100", "USD");
        conn.execute_batch(
            "DROP TABLE dividend_taxes;
             CREATE TABLE dividend_taxes (id INTEGER PRIMARY KEY, dividend_id INTEGER NOT NULL,
                timestamp INTEGER NOT NULL, amount REAL NOT NULL, note TEXT NOT NULL DEFAULT '',
                UNIQUE(dividend_id, timestamp, amount, note));
             INSERT INTO dividends (timestamp, account_id, asset_id, sum) VALUES (100, 1, 1, 10);
             INSERT INTO dividend_taxes (dividend_id, timestamp, amount, note)
                VALUES (1, 100, 1.5, 'US TAX');",
        )
        .unwrap();
        create_schema(&conn).unwrap();

        assert!(!table_exists(&conn, "dividend_taxes_old"));
        let key: String = conn
            .query_row("SELECT line_key FROM dividend_taxes", [], |row| row.get(0))
            .unwrap();
        assert_eq!(key, "100|1.500000|US TAX#0");
    }

    #[test]
    fn test_init_database_opens_shared_connection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        init_database(&path).unwrap();

        let guard = get_connection().unwrap();
        let conn = guard.as_ref().unwrap();
        assert!(table_exists(conn, "statement_imports"));
        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
        assert!(path.exists());
    }
}
