//! Inventory domain rules for the channel sync engine.
//!
//! Pure, deterministic logic (no IO, no storage): per-date allotment days,
//! all-or-nothing multi-night holds, and the mapping from reservation status
//! to ledger effect. The ledger stores in `innsync-infra` wrap these rules in
//! a lock or a database transaction.

pub mod book;
pub mod day;
pub mod error;
pub mod reservation;

pub use book::{HoldOutcome, InventoryBook, ReleaseReport, StayHold};
pub use day::{InventoryDay, InventoryDayLoad, InventoryKey, ReleaseEffect, Restrictions};
pub use error::InsufficientInventory;
pub use reservation::{LedgerEffect, ReservationSnapshot, ReservationStatus};
