//! Entity resolution
//!
//! Maps the references found in statements (account numbers, symbols,
//! country codes) to ledger ids. Assets, countries and counterparties are
//! created on demand; accounts never are.

use rusqlite::{named_params, params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::review::{ReviewItem, ReviewKind};
use crate::config::ImportSettings;
use crate::error::{ImportError, ImportResult};
use crate::models::{AccountId, AgentId, AssetId, AssetType, CountryId};
use crate::statements::{AccountRef, AssetRef, SecurityDefinition};

/// What is known about a symbol that isn't in the ledger yet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetRequest {
    pub symbol: String,
    pub asset_type: AssetType,
    pub isin: String,
    pub name: String,
}

/// Asset confirmed by the user (or a headless policy)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetDetails {
    pub symbol: String,
    pub name: String,
    pub asset_type: AssetType,
    pub isin: String,
    /// Quote source id, -1 for none
    pub data_source: i64,
}

impl From<&AssetRequest> for AssetDetails {
    fn from(request: &AssetRequest) -> Self {
        Self {
            symbol: request.symbol.clone(),
            name: request.name.clone(),
            asset_type: request.asset_type,
            isin: request.isin.clone(),
            data_source: -1,
        }
    }
}

/// Asks for the details of a new asset. Returning `None` abandons the
/// creation.
pub trait AssetCreationPort {
    fn create_asset(&mut self, request: &AssetRequest) -> Option<AssetDetails>;
}

/// Creates every requested asset as proposed
#[derive(Debug, Default)]
pub struct AcceptProposedAssets;

impl AssetCreationPort for AcceptProposedAssets {
    fn create_asset(&mut self, request: &AssetRequest) -> Option<AssetDetails> {
        Some(AssetDetails::from(request))
    }
}

/// Declines every request
#[derive(Debug, Default)]
pub struct DeclineAssetCreation;

impl AssetCreationPort for DeclineAssetCreation {
    fn create_asset(&mut self, request: &AssetRequest) -> Option<AssetDetails> {
        log::debug!("Asset creation declined for {}", request.symbol);
        None
    }
}

pub struct EntityResolver<'a> {
    conn: &'a Connection,
    settings: &'a ImportSettings,
    creator: &'a mut dyn AssetCreationPort,
    review_items: Vec<ReviewItem>,
}

impl<'a> EntityResolver<'a> {
    pub fn new(
        conn: &'a Connection,
        settings: &'a ImportSettings,
        creator: &'a mut dyn AssetCreationPort,
    ) -> Self {
        Self {
            conn,
            settings,
            creator,
            review_items: Vec::new(),
        }
    }

    /// Review items raised so far; the list is emptied
    pub fn take_review_items(&mut self) -> Vec<ReviewItem> {
        std::mem::take(&mut self.review_items)
    }

    pub fn add_review_item(&mut self, kind: ReviewKind, context: impl Into<String>) {
        self.review_items.push(ReviewItem::new(kind, context));
    }

    // =========================================================================
    // Accounts
    // =========================================================================

    /// Find an account by number and, if given, currency symbol
    pub fn resolve_account(
        &self,
        number: &str,
        currency: Option<&str>,
    ) -> ImportResult<Option<AccountId>> {
        let id = match currency {
            Some(currency) => self
                .conn
                .query_row(
                    "SELECT a.id FROM accounts a
                     LEFT JOIN assets c ON c.id = a.currency_id
                     WHERE a.number = :number AND c.name = :currency",
                    named_params! { ":number": number, ":currency": currency },
                    |row| row.get(0),
                )
                .optional()?,
            None => self
                .conn
                .query_row(
                    "SELECT id FROM accounts WHERE number = :number ORDER BY id LIMIT 1",
                    named_params! { ":number": number },
                    |row| row.get(0),
                )
                .optional()?,
        };
        Ok(id)
    }

    /// Like `resolve_account`, failing when there is no such account
    pub fn account(&self, account: &AccountRef) -> ImportResult<AccountId> {
        self.resolve_account(&account.number, account.currency.as_deref())?
            .ok_or_else(|| {
                log::error!("Import: Account not found: {}", account);
                ImportError::AccountNotFound {
                    number: account.number.clone(),
                    currency: account.currency.clone().unwrap_or_default(),
                }
            })
    }

    // =========================================================================
    // Assets
    // =========================================================================

    pub fn find_asset(&self, symbol: &str) -> ImportResult<Option<AssetId>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id FROM assets WHERE name = :symbol",
                named_params! { ":symbol": symbol },
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Find an asset by symbol, asking the creation port on a miss.
    /// `None` means the creation was abandoned.
    pub fn resolve_asset(&mut self, asset: &AssetRef) -> ImportResult<Option<AssetId>> {
        if let Some(id) = self.find_asset(&asset.symbol)? {
            return Ok(Some(id));
        }
        let request = AssetRequest {
            symbol: asset.symbol.clone(),
            asset_type: asset.asset_type.unwrap_or(self.settings.default_asset_type),
            isin: asset.isin.clone(),
            name: asset.name.clone(),
        };
        let Some(details) = self.creator.create_asset(&request) else {
            log::warn!("Import: Creation of asset '{}' abandoned", asset.symbol);
            return Ok(None);
        };
        // The dialog may have changed the symbol to one that exists already
        if let Some(id) = self.find_asset(&details.symbol)? {
            return Ok(Some(id));
        }
        let id = self.insert_asset(&details)?;
        Ok(Some(id))
    }

    /// Store a security definition unless its symbol is known
    pub fn store_security(&self, security: &SecurityDefinition) -> ImportResult<AssetId> {
        if let Some(id) = self.find_asset(&security.symbol)? {
            return Ok(id);
        }
        let asset_type = security.asset_type.ok_or_else(|| {
            log::error!("Import: Asset type {} is not supported", security.category);
            ImportError::UnsupportedAssetClass(security.category.clone())
        })?;
        self.insert_asset(&AssetDetails {
            symbol: security.symbol.clone(),
            name: security.name.clone(),
            asset_type,
            isin: security.isin.clone(),
            data_source: -1,
        })
    }

    fn insert_asset(&self, details: &AssetDetails) -> ImportResult<AssetId> {
        self.conn.execute(
            "INSERT INTO assets (name, type_id, full_name, isin, src_id)
             VALUES (:symbol, :type, :full_name, :isin, :data_src)",
            named_params! {
                ":symbol": details.symbol,
                ":type": details.asset_type.id(),
                ":full_name": details.name,
                ":isin": details.isin,
                ":data_src": details.data_source,
            },
        )?;
        let id = self.conn.last_insert_rowid();
        log::info!(
            "Import: New asset {} ({}) added",
            details.symbol,
            details.asset_type.name()
        );
        Ok(id)
    }

    // =========================================================================
    // Counterparties and countries
    // =========================================================================

    /// Bank of the account. Accounts without one get the default
    /// counterparty, which is stored on the account.
    pub fn resolve_counterparty_bank(&mut self, account_id: AccountId) -> ImportResult<AgentId> {
        let bank_id: Option<AgentId> = self.conn.query_row(
            "SELECT organization_id FROM accounts WHERE id = ?1",
            [account_id],
            |row| row.get(0),
        )?;
        if let Some(bank_id) = bank_id {
            return Ok(bank_id);
        }

        let name = self.settings.default_counterparty.as_str();
        let existing: Option<AgentId> = self
            .conn
            .query_row("SELECT id FROM agents WHERE name = ?1", [name], |row| row.get(0))
            .optional()?;
        let bank_id = match existing {
            Some(id) => id,
            None => {
                self.conn.execute(
                    "INSERT INTO agents (pid, name) VALUES (0, ?1)",
                    [name],
                )?;
                self.conn.last_insert_rowid()
            }
        };
        self.conn.execute(
            "UPDATE accounts SET organization_id = ?1 WHERE id = ?2",
            params![bank_id, account_id],
        )?;
        self.add_review_item(
            ReviewKind::CounterpartyAssigned,
            format!("Account #{} assigned to bank '{}'", account_id, name),
        );
        Ok(bank_id)
    }

    /// Country by two-letter code; unknown codes get a placeholder
    pub fn resolve_country(&mut self, code: &str) -> ImportResult<CountryId> {
        let code = code.to_lowercase();
        let existing: Option<CountryId> = self
            .conn
            .query_row(
                "SELECT id FROM countries WHERE code = ?1",
                [&code],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = existing {
            return Ok(id);
        }
        self.conn.execute(
            "INSERT INTO countries (name, code, tax_treaty) VALUES (?1, ?2, 0)",
            params![format!("Country_{}", code), code],
        )?;
        let id = self.conn.last_insert_rowid();
        self.add_review_item(
            ReviewKind::NewCountry,
            format!("New dummy country added with code {}", code),
        );
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing;

    /// Records requests and answers them with a fixed type
    struct RecordingCreator {
        requests: Vec<AssetRequest>,
    }

    impl AssetCreationPort for RecordingCreator {
        fn create_asset(&mut self, request: &AssetRequest) -> Option<AssetDetails> {
            self.requests.push(request.clone());
            Some(AssetDetails::from(request))
        }
    }

    #[test]
    fn test_resolve_account_with_and_without_currency() {
        let conn = testing::memory_db();
        let usd = testing::add_account(&conn, "U100", "USD");
        let eur = testing::add_account(&conn, "U100", "EUR");
        let settings = ImportSettings::default();
        let mut creator = DeclineAssetCreation;
        let resolver = EntityResolver::new(&conn, &settings, &mut creator);

        assert_eq!(resolver.resolve_account("U100", Some("EUR")).unwrap(), Some(eur));
        assert_eq!(resolver.resolve_account("U100", None).unwrap(), Some(usd));
        assert_eq!(resolver.resolve_account("U100", Some("GBP")).unwrap(), None);
        assert!(matches!(
            resolver.account(&AccountRef::new("U999", None)),
            Err(ImportError::AccountNotFound { .. })
        ));
    }

    #[test]
    fn test_resolve_asset_uses_port_once() {
        let conn = testing::memory_db();
        let settings = ImportSettings::default();
        let mut creator = RecordingCreator { requests: vec![] };
        {
            let mut resolver = EntityResolver::new(&conn, &settings, &mut creator);
            let asset = AssetRef {
                symbol: "VWRL".to_string(),
                name: "Vanguard FTSE All-World".to_string(),
                isin: "IE00B3RBWM25".to_string(),
                asset_type: Some(AssetType::Etf),
            };
            let first = resolver.resolve_asset(&asset).unwrap();
            let second = resolver.resolve_asset(&asset).unwrap();
            assert!(first.is_some());
            assert_eq!(first, second);
        }
        assert_eq!(creator.requests.len(), 1);
        assert_eq!(creator.requests[0].asset_type, AssetType::Etf);

        let type_id: i64 = conn
            .query_row("SELECT type_id FROM assets WHERE name = 'VWRL'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(type_id, AssetType::Etf.id());
    }

    #[test]
    fn test_declined_asset_is_none() {
        let conn = testing::memory_db();
        let settings = ImportSettings::default();
        let mut creator = DeclineAssetCreation;
        let mut resolver = EntityResolver::new(&conn, &settings, &mut creator);
        assert_eq!(resolver.resolve_asset(&AssetRef::symbol("NEW")).unwrap(), None);
        assert_eq!(testing::count(&conn, "assets"), 0);
    }

    #[test]
    fn test_unsupported_security_category() {
        let conn = testing::memory_db();
        let settings = ImportSettings::default();
        let mut creator = DeclineAssetCreation;
        let resolver = EntityResolver::new(&conn, &settings, &mut creator);
        let security = SecurityDefinition {
            symbol: "XYZ".to_string(),
            name: "Warrant".to_string(),
            isin: String::new(),
            category: "WAR".to_string(),
            asset_type: None,
        };
        assert!(matches!(
            resolver.store_security(&security),
            Err(ImportError::UnsupportedAssetClass(c)) if c == "WAR"
        ));
    }

    #[test]
    fn test_counterparty_assigned_once() {
        let conn = testing::memory_db();
        let account = testing::add_account(&conn, "U100", "USD");
        let settings = ImportSettings::default();
        let mut creator = DeclineAssetCreation;
        let mut resolver = EntityResolver::new(&conn, &settings, &mut creator);

        let bank = resolver.resolve_counterparty_bank(account).unwrap();
        assert_eq!(resolver.resolve_counterparty_bank(account).unwrap(), bank);
        assert_eq!(testing::count(&conn, "agents"), 1);

        let items = resolver.take_review_items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].kind, ReviewKind::CounterpartyAssigned);
        let org: Option<i64> = conn
            .query_row(
                "SELECT organization_id FROM accounts WHERE id = ?1",
                [account],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(org, Some(bank));
    }

    #[test]
    fn test_unknown_country_gets_placeholder() {
        let conn = testing::memory_db();
        let settings = ImportSettings::default();
        let mut creator = DeclineAssetCreation;
        let mut resolver = EntityResolver::new(&conn, &settings, &mut creator);

        let id = resolver.resolve_country("US").unwrap();
        assert_eq!(resolver.resolve_country("us").unwrap(), id);
        let (name, treaty): (String, i64) = conn
            .query_row("SELECT name, tax_treaty FROM countries WHERE id = ?1", [id], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .unwrap();
        assert_eq!(name, "Country_us");
        assert_eq!(treaty, 0);
        assert_eq!(resolver.take_review_items().len(), 1);
    }
}
