//! Phase handlers
//!
//! One handler per workflow state. A handler re-checks the condition that
//! gates its side effect before acting, persists every checkpoint it
//! records, and tells the dispatch loop whether the queue moved on.

mod cleanup;
mod collect;
mod deploy;
mod disposition;
mod image_missing;

pub use cleanup::{clean_after, clean_before, wait_for_components_cleaned, CleanupStatus};
pub use collect::{collect, history_name};
pub use deploy::{deploy, resources_ready};
pub use disposition::{decide, dispose, Disposition, REVERIFY_DELAY_HOURS};
pub use image_missing::detect_image_missing;
pub use test::test;

use std::time::Duration;

use chrono::{DateTime, Utc};

/// What a handler did with the queue
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Progress {
    /// State advanced; run the next phase right away
    Advanced,
    /// Nothing to do until the cluster catches up
    Wait(Duration),
    /// The queue is done with; release the current pointer
    Released,
}

/// Time since `since`, zero when it lies in the future
pub(crate) fn elapsed_since(since: DateTime<Utc>) -> Duration {
    (Utc::now() - since).to_std().unwrap_or_default()
}
