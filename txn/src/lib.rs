//! Cross-cluster transactions for pg-multiverse.
//!
//! A transaction borrows one write connection per involved cluster for its
//! lifetime. Single-cluster transactions commit with a plain `COMMIT`;
//! multi-cluster transactions run two-phase commit: `PREPARE TRANSACTION`
//! on every participant, then `COMMIT PREPARED`. A prepare failure rolls
//! everything back; a partial commit-prepared failure leaves the global
//! transaction in doubt and is surfaced, never swallowed.

mod distributed;

pub use distributed::{
    TransactionManager, TxnError, TxnMetricsSnapshot, TxnOptions, TxnState, TxnStatement,
};
