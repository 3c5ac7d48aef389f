//! OrcaNet content metadata.
//!
//! Content identifiers derived from file bytes, the metadata record a node
//! advertises for each file, and the per-node ledger those records are
//! persisted in.

pub mod content_id;
pub mod ledger;
pub mod record;

pub use content_id::{ContentId, ContentIdError};
pub use ledger::{ledger_path, read_ledger, AppendOutcome, LedgerError, MetadataLedger};
pub use record::{price_is_representable, MetadataRecord};
