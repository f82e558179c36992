//! Result pipeline: key recovery, summaries, archive and delivery.
//!
//! Runs after the stages of a batch. Key recovery augments key-record files in
//! place, the collector writes the support and performance summaries, the
//! archive zips the whole run directory, and delivery hands the archive to the
//! result volume or the remote depository.

pub mod archive;
pub mod capability;
pub mod collector;
pub mod distribute;
pub mod keys;
pub mod perf;

pub use archive::create_archive;
pub use collector::{ResultCollector, Summaries};
pub use distribute::{store_to_volume, Uploader};
pub use keys::{recover_file, RecoveryReport};
