//! Statement Import Module
//!
//! Loads parsed statements into the ledger. Each event is dispatched to a
//! handler that resolves the referenced entities and writes through the
//! idempotent writer. A failing event stops its statement; the remaining
//! statements of the file are still loaded, but the load as a whole is
//! reported as failed. Nothing is rolled back: re-importing the file after
//! fixing the cause picks up the missing rows.

pub mod corporate_actions;
pub mod resolver;
pub mod review;
pub mod writer;

use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::config::ImportSettings;
use crate::error::{ImportError, ImportResult};
use crate::events::{emit_load_signal, LoadListener, LoadSignal};
use crate::models::{AccountId, ActionCategory, AssetId, CorporateActionType};
use crate::statements::{
    self, AssetRef, CashRecord, CorporateActionRecord, CurrencyTradeRecord, Event, ReportType,
    Statement, TradeAction, TradeRecord, TransactionTaxRecord, UnsupportedKind,
};

use corporate_actions::Reconciled;
use resolver::{AssetCreationPort, EntityResolver};
use review::{ReviewItem, ReviewKind};
use writer::{
    tax_line_key, ActionKey, LedgerWriter, NewAction, NewCorporateAction, NewTrade, NewTransfer,
    NewWithholdingTax, TradeKey, WriteResult,
};

/// Withholding tax description: `<dividend description> - <country code> TAX`
static TAX_NOTE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(.*) - (..) TAX$").expect("valid regex"));

/// Row counters of one load
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadCounters {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Rows already in the ledger
    pub duplicates: usize,
    /// Events that were not loaded (unknown types, declined assets)
    pub skipped: usize,
}

impl LoadCounters {
    fn record(&mut self, result: WriteResult) {
        match result {
            WriteResult::Inserted(_) => self.inserted += 1,
            WriteResult::Updated => self.updated += 1,
            WriteResult::Deleted(n) => self.deleted += n,
            WriteResult::AlreadyExists => self.duplicates += 1,
            WriteResult::NotFound => self.skipped += 1,
        }
    }

    fn add(&mut self, other: &LoadCounters) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.duplicates += other.duplicates;
        self.skipped += other.skipped;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatementSummary {
    pub account_number: String,
    pub events: usize,
    pub succeeded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of one `load_report` call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadOutcome {
    pub report_type: ReportType,
    pub succeeded: bool,
    /// Parse failure of the whole file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub statements: Vec<StatementSummary>,
    pub review_items: Vec<ReviewItem>,
    pub counters: LoadCounters,
}

impl LoadOutcome {
    pub fn signal(&self) -> LoadSignal {
        if self.succeeded {
            LoadSignal::Completed
        } else {
            LoadSignal::Failed
        }
    }
}

pub struct StatementLoader<'a> {
    conn: &'a Connection,
    settings: ImportSettings,
    creator: Box<dyn AssetCreationPort + 'a>,
    listeners: Vec<Box<dyn LoadListener>>,
}

impl<'a> StatementLoader<'a> {
    pub fn new(
        conn: &'a Connection,
        settings: ImportSettings,
        creator: Box<dyn AssetCreationPort + 'a>,
    ) -> Self {
        Self {
            conn,
            settings,
            creator,
            listeners: Vec::new(),
        }
    }

    pub fn add_listener(&mut self, listener: Box<dyn LoadListener>) {
        self.listeners.push(listener);
    }

    /// Parse and load a statement file. Exactly one load signal is emitted.
    pub fn load_report(&mut self, path: &Path, report_type: ReportType) -> LoadOutcome {
        log::info!(
            "Statement import: Loading {} from {}",
            report_type.name(),
            path.display()
        );
        let outcome = match statements::parse_statement(path, report_type, &self.settings) {
            Ok(parsed) => self.load_statements(report_type, &parsed),
            Err(e) => {
                log::error!(
                    "Statement import: Failed to parse {}: {}",
                    report_type.name(),
                    e
                );
                LoadOutcome {
                    report_type,
                    succeeded: false,
                    error: Some(e.to_string()),
                    statements: Vec::new(),
                    review_items: Vec::new(),
                    counters: LoadCounters::default(),
                }
            }
        };

        self.record_history(path, &outcome);
        emit_load_signal(&self.listeners, outcome.signal());
        outcome
    }

    /// Load a file whose type is guessed from its extension
    pub fn load_file(&mut self, path: &Path) -> ImportResult<LoadOutcome> {
        let report_type = ReportType::from_path(path).ok_or_else(|| {
            ImportError::Unsupported(format!("statement file {}", path.display()))
        })?;
        Ok(self.load_report(path, report_type))
    }

    /// Load already parsed statements; no signal is emitted
    pub fn load_statements(
        &mut self,
        report_type: ReportType,
        parsed: &[Statement],
    ) -> LoadOutcome {
        let mut outcome = LoadOutcome {
            report_type,
            succeeded: true,
            error: None,
            statements: Vec::new(),
            review_items: Vec::new(),
            counters: LoadCounters::default(),
        };

        for statement in parsed {
            let mut importer = StatementImporter::new(
                self.conn,
                &self.settings,
                self.creator.as_mut(),
                statement,
            );
            let result = importer.run();
            outcome.review_items.extend(importer.resolver.take_review_items());
            outcome.counters.add(&importer.counters);

            let error = match result {
                Ok(()) => {
                    log::info!(
                        "Statement import: Statement for account {} loaded successfully",
                        statement.account_number
                    );
                    None
                }
                Err(e) => {
                    log::error!(
                        "Statement import: Statement for account {} failed: {}",
                        statement.account_number,
                        e
                    );
                    outcome.succeeded = false;
                    Some(e.to_string())
                }
            };
            outcome.statements.push(StatementSummary {
                account_number: statement.account_number.clone(),
                events: statement.events.len(),
                succeeded: error.is_none(),
                error,
            });
        }
        outcome
    }

    fn record_history(&self, path: &Path, outcome: &LoadOutcome) {
        let result = self.conn.execute(
            "INSERT INTO statement_imports
                 (file_path, report_type, succeeded, statements_count,
                  inserted_count, skipped_count, review_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                path.display().to_string(),
                outcome.report_type.name(),
                outcome.succeeded,
                outcome.statements.len() as i64,
                outcome.counters.inserted as i64,
                (outcome.counters.skipped + outcome.counters.duplicates) as i64,
                outcome.review_items.len() as i64,
            ],
        );
        if let Err(e) = result {
            log::warn!("Statement import: Failed to record import history: {}", e);
        }
    }
}

/// Loads the events of one statement
struct StatementImporter<'s> {
    resolver: EntityResolver<'s>,
    writer: LedgerWriter<'s>,
    settings: &'s ImportSettings,
    statement: &'s Statement,
    corporate_actions: Vec<&'s CorporateActionRecord>,
    /// Withholding tax lines seen so far, by asset and content
    tax_lines: HashMap<(AssetId, String), usize>,
    counters: LoadCounters,
}

impl<'s> StatementImporter<'s> {
    fn new(
        conn: &'s Connection,
        settings: &'s ImportSettings,
        creator: &'s mut dyn AssetCreationPort,
        statement: &'s Statement,
    ) -> Self {
        Self {
            resolver: EntityResolver::new(conn, settings, creator),
            writer: LedgerWriter::new(conn, settings.calc_tolerance),
            settings,
            statement,
            corporate_actions: statement.corporate_actions(),
            tax_lines: HashMap::new(),
            counters: LoadCounters::default(),
        }
    }

    fn run(&mut self) -> ImportResult<()> {
        log::info!(
            "Statement import: {} statement for account {} ({} events)",
            self.statement.report_type.name(),
            self.statement.account_number,
            self.statement.events.len()
        );
        let statement = self.statement;
        for event in &statement.events {
            if let Err(e) = self.handle_event(event) {
                log::error!("Statement import: {} load failed: {:?}", event.kind_name(), event);
                return Err(e);
            }
        }
        Ok(())
    }

    fn handle_event(&mut self, event: &Event) -> ImportResult<()> {
        match event {
            Event::Asset(security) => {
                self.resolver.store_security(security)?;
            }
            Event::Account(definition) => {
                let account = &definition.account;
                if self
                    .resolver
                    .resolve_account(&account.number, account.currency.as_deref())?
                    .is_none()
                {
                    self.resolver.add_review_item(
                        ReviewKind::MissingAccount,
                        format!("Account '{}' {} is not in the ledger", definition.name, account),
                    );
                }
            }
            Event::Trade(trade) => self.load_trade(trade)?,
            Event::CurrencyTrade(trade) => self.load_currency_trade(trade)?,
            Event::TransactionTax(tax) => self.load_transaction_tax(tax)?,
            Event::CorporateAction(record) => self.load_corporate_action(record)?,
            Event::Dividend(cash) => self.load_dividend(cash)?,
            Event::WithholdingTax(cash) => self.load_withholding_tax(cash)?,
            Event::Fee(cash) => self.load_action(cash, ActionCategory::Fees)?,
            Event::Interest(cash) => self.load_action(cash, ActionCategory::Interest)?,
            Event::DepositWithdraw(cash) => {
                self.resolver.add_review_item(
                    ReviewKind::ManualEntry,
                    format!(
                        "{} {}: {} {}",
                        cash.timestamp, cash.description, cash.account, cash.amount
                    ),
                );
            }
            Event::Unsupported { kind, description } => match kind {
                UnsupportedKind::AssetClass => {
                    log::error!("Statement import: Load of {} is not implemented", description);
                    return Err(ImportError::Unsupported(description.clone()));
                }
                UnsupportedKind::TradeType | UnsupportedKind::CashType => {
                    log::warn!(
                        "Statement import: Load of {} is not implemented, skipped",
                        description
                    );
                    self.counters.skipped += 1;
                }
            },
        }
        Ok(())
    }

    /// Asset id of a statement reference. `None` when the user declined to
    /// create it and the report type allows going on without it.
    fn asset(&mut self, asset: &AssetRef) -> ImportResult<Option<AssetId>> {
        match self.resolver.resolve_asset(asset)? {
            Some(id) => Ok(Some(id)),
            None if self.statement.report_type == ReportType::Quik => {
                log::warn!("Statement import: Unknown asset '{}'", asset.symbol);
                self.counters.skipped += 1;
                Ok(None)
            }
            None => Err(ImportError::AssetCreationCancelled(asset.symbol.clone())),
        }
    }

    fn required_asset(&mut self, asset: &AssetRef) -> ImportResult<AssetId> {
        self.resolver
            .resolve_asset(asset)?
            .ok_or_else(|| ImportError::AssetCreationCancelled(asset.symbol.clone()))
    }

    fn load_trade(&mut self, trade: &TradeRecord) -> ImportResult<()> {
        let account_id = self.resolver.account(&trade.account)?;
        let Some(asset_id) = self.asset(&trade.asset)? else {
            return Ok(());
        };

        let result = match trade.action {
            TradeAction::Buy | TradeAction::Sell => self.writer.create_trade(&NewTrade {
                timestamp: trade.timestamp,
                settlement: trade.settlement,
                number: trade.number.clone(),
                account_id,
                asset_id,
                qty: trade.qty,
                price: trade.price,
                fee: trade.fee,
                coupon: trade.coupon,
            })?,
            // The cancelled trade has the opposite quantity sign
            TradeAction::CancelBuy | TradeAction::CancelSell => {
                let qty = if trade.action == TradeAction::CancelBuy {
                    trade.qty.abs()
                } else {
                    -trade.qty.abs()
                };
                self.writer.delete_trade(&TradeKey {
                    timestamp: trade.timestamp,
                    number: trade.number.clone(),
                    account_id,
                    asset_id,
                    qty,
                    price: trade.price,
                })?
            }
        };
        self.counters.record(result);
        Ok(())
    }

    fn currency_account(&self, number: &str, currency: &str) -> ImportResult<AccountId> {
        self.resolver.resolve_account(number, Some(currency))?.ok_or_else(|| {
            log::error!("Statement import: Account not found: {} ({})", number, currency);
            ImportError::AccountNotFound {
                number: number.to_string(),
                currency: currency.to_string(),
            }
        })
    }

    fn load_currency_trade(&mut self, trade: &CurrencyTradeRecord) -> ImportResult<()> {
        let Some((base, quote)) = trade.symbol.split_once('.') else {
            return Err(ImportError::Pattern(format!("currency pair {}", trade.symbol)));
        };
        // Buying the base currency pays with the quote currency
        let (from_currency, from_amount, to_currency, to_amount) = match trade.action {
            TradeAction::Buy => (quote, trade.proceeds, base, trade.quantity),
            TradeAction::Sell => (base, trade.quantity, quote, trade.proceeds),
            TradeAction::CancelBuy | TradeAction::CancelSell => {
                log::warn!(
                    "Statement import: Currency transaction type isn't implemented: {:?}",
                    trade.action
                );
                self.counters.skipped += 1;
                return Ok(());
            }
        };
        let to_account_id = self.currency_account(&trade.account_number, to_currency)?;
        let from_account_id = self.currency_account(&trade.account_number, from_currency)?;
        let fee_account_id = self.currency_account(&trade.account_number, &trade.fee_currency)?;

        let result = self.writer.create_transfer(&NewTransfer {
            timestamp: trade.timestamp,
            from_account_id,
            from_amount,
            to_account_id,
            to_amount,
            fee_account_id,
            fee_amount: trade.fee,
            note: trade.exchange.clone(),
        })?;
        self.counters.record(result);
        Ok(())
    }

    fn load_transaction_tax(&mut self, tax: &TransactionTaxRecord) -> ImportResult<()> {
        let account_id = self.resolver.account(&tax.account)?;
        let bank_id = self.resolver.resolve_counterparty_bank(account_id)?;
        let result = self.writer.create_action(
            &NewAction {
                timestamp: tax.timestamp,
                account_id,
                peer_id: bank_id,
                category: ActionCategory::Taxes,
                amount: tax.amount,
                note: tax.note.clone(),
            },
            ActionKey::Amount,
        )?;
        self.counters.record(result);
        Ok(())
    }

    fn load_corporate_action(&mut self, record: &CorporateActionRecord) -> ImportResult<()> {
        let planned = match corporate_actions::reconcile(
            record,
            &self.corporate_actions,
            &self.settings.dummy_exchange,
        )? {
            Reconciled::Skip => return Ok(()),
            Reconciled::Cancelled => {
                self.resolver.add_review_item(
                    ReviewKind::ManualAction,
                    format!(
                        "Corporate action cancelled: #{} {}",
                        record.transaction_id, record.description
                    ),
                );
                return Ok(());
            }
            Reconciled::Action(planned) => planned,
        };

        let account_id = self.resolver.account(&record.account)?;
        let asset_id_new = self.required_asset(&planned.asset_new)?;
        let asset_id_old = match planned.action_type {
            CorporateActionType::StockDividend | CorporateActionType::Split => asset_id_new,
            _ => self.required_asset(&planned.asset_old)?,
        };
        let result = self.writer.create_corporate_action(&NewCorporateAction {
            timestamp: record.timestamp,
            number: record.transaction_id.to_string(),
            account_id,
            action_type: planned.action_type,
            asset_id_old,
            qty_old: planned.qty_old,
            asset_id_new,
            qty_new: planned.qty_new,
            note: record.description.clone(),
        })?;
        self.counters.record(result);
        Ok(())
    }

    fn cash_asset(&mut self, cash: &CashRecord) -> ImportResult<AssetId> {
        match &cash.asset {
            Some(asset) => self.required_asset(asset),
            None => Err(ImportError::Pattern(format!(
                "asset of '{}'",
                cash.description
            ))),
        }
    }

    fn load_dividend(&mut self, cash: &CashRecord) -> ImportResult<()> {
        let account_id = self.resolver.account(&cash.account)?;
        let asset_id = self.cash_asset(cash)?;
        let result = self.writer.create_dividend(
            cash.timestamp,
            account_id,
            asset_id,
            cash.amount,
            &cash.description,
        )?;
        self.counters.record(result);
        Ok(())
    }

    fn load_withholding_tax(&mut self, cash: &CashRecord) -> ImportResult<()> {
        let account_id = self.resolver.account(&cash.account)?;
        let asset_id = self.cash_asset(cash)?;
        let amount = -cash.amount;

        let Some(caps) = TAX_NOTE_RE.captures(&cash.description) else {
            self.resolver.add_review_item(
                ReviewKind::ManualEntry,
                format!("Unhandled tax pattern found: {}", cash.description),
            );
            self.counters.skipped += 1;
            return Ok(());
        };
        let country_id = self.resolver.resolve_country(&caps[2])?;

        // Identical lines (tax, reversal, tax again) are separate taxes
        let line = (asset_id, tax_line_key(None, cash.timestamp, amount, &cash.description, 0));
        let ordinal = self.tax_lines.entry(line).or_insert(0);
        let line_key = tax_line_key(
            cash.transaction_id,
            cash.timestamp,
            amount,
            &cash.description,
            *ordinal,
        );
        *ordinal += 1;

        let result = self.writer.add_withholding_tax(&NewWithholdingTax {
            timestamp: cash.timestamp,
            account_id,
            asset_id,
            amount,
            dividend_prefix: caps[1].to_string(),
            country_id,
            note: cash.description.clone(),
            line_key,
        })?;
        if result == WriteResult::NotFound {
            self.resolver.add_review_item(
                ReviewKind::ManualEntry,
                format!("Dividend not found for withholding tax: {}", cash.description),
            );
        }
        self.counters.record(result);
        Ok(())
    }

    fn load_action(&mut self, cash: &CashRecord, category: ActionCategory) -> ImportResult<()> {
        let account_id = self.resolver.account(&cash.account)?;
        let bank_id = self.resolver.resolve_counterparty_bank(account_id)?;
        let result = self.writer.create_action(
            &NewAction {
                timestamp: cash.timestamp,
                account_id,
                peer_id: bank_id,
                category,
                amount: cash.amount,
                note: cash.description.clone(),
            },
            ActionKey::Full,
        )?;
        self.counters.record(result);
        Ok(())
    }
}
