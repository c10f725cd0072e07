//! Resolved configuration shared by all commands.

use std::path::PathBuf;

use anyhow::{Context, Result};

use ciledger_core::budget::{BudgetEnforcer, BudgetStore};
use ciledger_core::config::{Config, WorkspaceLayout};
use ciledger_core::ledger::LedgerStore;
use ciledger_core::lock::FileLockManager;
use ciledger_core::pricing::PricingConfig;
use ciledger_core::usage::UsageAggregator;

pub struct AppContext {
    pub config: Config,
    pub layout: WorkspaceLayout,
}

impl AppContext {
    pub fn new(workspace: PathBuf, config: Config) -> Self {
        let layout = WorkspaceLayout::from_config(workspace, &config);
        Self { config, layout }
    }

    fn locks(&self) -> FileLockManager {
        FileLockManager::from_config(&self.layout.lock_dir, &self.config.lock)
    }

    pub fn ledger(&self) -> LedgerStore {
        LedgerStore::new(
            &self.layout.ledger_file,
            self.locks(),
            self.config.lock.timeout(),
            self.config.ledger.max_entries,
        )
    }

    pub fn budget_store(&self) -> BudgetStore {
        BudgetStore::new(
            &self.layout.budget_state,
            self.locks(),
            self.config.lock.timeout(),
        )
    }

    pub fn usage(&self) -> UsageAggregator {
        UsageAggregator::new(&self.layout.usage_dir)
    }

    /// Builds the enforcer. Fails before touching any state when the
    /// pricing config is missing or unreadable.
    pub fn enforcer(&self) -> Result<BudgetEnforcer> {
        let pricing = PricingConfig::load(&self.layout.pricing_config).with_context(|| {
            format!(
                "loading pricing config {}",
                self.layout.pricing_config.display()
            )
        })?;
        Ok(BudgetEnforcer::new(
            pricing,
            self.usage(),
            self.budget_store(),
        ))
    }
}
