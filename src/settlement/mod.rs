// Settlement reconciliation: collections against sales and the journal behind them
pub mod correction;
pub mod engine;
pub mod journal;
pub mod ledger;

pub use correction::SaleCorrection;
pub use engine::ReconciliationEngine;
pub use journal::PaymentJournal;
pub use ledger::{LedgerCheck, SettlementLedger};
