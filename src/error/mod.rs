/// Failure bookkeeping that outlives a single I/O call
///
/// - bad_sector.rs: skip-and-log ledger for unwritable sectors
/// - journal.rs: SQLite job journal used to detect jobs interrupted by a crash
///
/// The error taxonomy itself (`EngineError`) lives at the crate root.
pub mod bad_sector;
pub mod journal;



pub use bad_sector::{BadSectorLog, BadSectorReport, SkippedSector};
pub use journal::{JobJournal, JobOwner, JournalEntry, JournalState};
