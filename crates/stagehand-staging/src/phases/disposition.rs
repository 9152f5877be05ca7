//! Disposition of a finished run

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use kube::ResourceExt;
use stagehand_common::crd::Queue;
use tracing::{info, instrument};

use super::Progress;
use crate::context::Context;
use crate::Result;

/// Hours before a reverify run is repeated
pub const REVERIFY_DELAY_HOURS: i64 = 24;

/// What happens to a queue after its run
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// The version is stable; the queue is done
    Delete,
    /// Run again at `at` with the retry count reset
    Reschedule {
        /// Next run
        at: DateTime<Utc>,
    },
    /// Run again at the back of the order
    Retry {
        /// Retry count after this failure
        no_of_retry: u32,
        /// Next run
        at: DateTime<Utc>,
    },
    /// Too many failures: check the stable version next
    Reverify,
}

/// Decide the fate of a queue whose run ended
pub fn decide(queue: &Queue, max_retry: u32, now: DateTime<Utc>) -> Disposition {
    if queue.is_reverify() {
        return Disposition::Reschedule {
            at: now + ChronoDuration::hours(REVERIFY_DELAY_HOURS),
        };
    }
    if queue.is_deploy_success() && queue.is_test_success() {
        return Disposition::Delete;
    }
    let no_of_retry = queue.spec.no_of_retry + 1;
    if no_of_retry > max_retry {
        Disposition::Reverify
    } else {
        Disposition::Retry { no_of_retry, at: now }
    }
}

/// `deleting`: apply the disposition and release the queue
#[instrument(skip_all, fields(queue = %queue.spec.name))]
pub async fn dispose(ctx: &Context, queue: &mut Queue) -> Result<Progress> {
    let config = ctx.team_config().await?;
    let disposition = decide(queue, config.max_retry(), Utc::now());

    let applied = match disposition {
        Disposition::Delete => ctx.store.delete(&queue.name_any()).await,
        Disposition::Reschedule { at } => ctx.store.set_retry_queue(queue, 0, at).await,
        Disposition::Retry { no_of_retry, at } => {
            ctx.store.set_retry_queue(queue, no_of_retry, at).await
        }
        Disposition::Reverify => ctx.store.set_reverify_queue_at_first(queue).await,
    };

    match applied {
        Ok(()) => info!(disposition = ?disposition, "Run disposed"),
        // Deleted out of band; nothing left to reschedule
        Err(e) if e.is_not_found() => {
            info!(disposition = ?disposition, "Queue already gone, releasing")
        }
        Err(e) => return Err(e),
    }
    Ok(Progress::Released)
}
