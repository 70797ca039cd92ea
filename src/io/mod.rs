//! I/O: job ledger, remote staging, the external stitcher and notifications.

mod ledger;
mod notify;
mod stitcher;
mod store;

pub use ledger::{EntryStatus, JobLedger, LedgerEntry, LedgerSnapshot};
pub use notify::{build_sink, deliver, LogSink, NotificationSink, StageEvent, WebhookSink};
pub use stitcher::{StitchPhase, Stitcher};
pub use store::{
    create_output_store, create_s3_store, output_prefix, parse_s3_uri, store_for_uri,
    FetchOutcome, RemoteStagingClient, UploadSummary,
};
