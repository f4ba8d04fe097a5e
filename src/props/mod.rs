pub mod ledger;
pub mod store;

pub use ledger::LineMovementLedger;
pub use store::PropositionStore;
