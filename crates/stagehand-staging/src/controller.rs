//! Dispatch loop
//!
//! A single worker holds at most one current queue. Each tick re-reads it
//! from the store, runs the handler of its state, and keeps the updated copy.
//! When nothing is current the store is asked for the next eligible queue.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kube::ResourceExt;
use parking_lot::Mutex;
use rand::Rng;
use stagehand_common::crd::{Queue, QueueState};
use stagehand_rpc::types::QueueSummary;
use stagehand_rpc::QueueStatusProvider;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::context::Context;
use crate::phases::{self, Progress};
use crate::{Result, StagingError};

/// Outcome of one tick
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tick {
    /// No queue is eligible
    Idle,
    /// The current queue advanced or was released
    Progressed,
    /// The current queue waits on something external
    Wait(Duration),
}

/// The staging controller
pub struct Controller {
    ctx: Arc<Context>,
    current: Mutex<Option<Queue>>,
}

impl Controller {
    /// Controller driving queues with `ctx`
    pub fn new(ctx: Arc<Context>) -> Self {
        Self {
            ctx,
            current: Mutex::new(None),
        }
    }

    /// Copy of the queue being processed
    pub fn current(&self) -> Option<Queue> {
        self.current.lock().clone()
    }

    /// Run one phase of the current queue, picking one up first if needed
    pub async fn tick(&self) -> Result<Tick> {
        let current = self.current.lock().clone();
        let mut queue = match current {
            Some(queue) => queue,
            None => match self.ctx.store.first().await? {
                Some(queue) => {
                    info!(
                        queue = %queue.name_any(),
                        queue_type = %queue.spec.type_,
                        version = %queue.spec.version,
                        "Picked up queue"
                    );
                    *self.current.lock() = Some(queue.clone());
                    queue
                }
                None => return Ok(Tick::Idle),
            },
        };

        if !queue.state().skips_sync() {
            self.sync(&mut queue).await?;
        }

        let state = queue.state();
        let progress = self.dispatch(&mut queue).await?;
        if queue.state() != state {
            info!(queue = %queue.name_any(), from = %state, to = %queue.state(), "State changed");
        }

        match progress {
            Progress::Released => {
                *self.current.lock() = None;
                Ok(Tick::Progressed)
            }
            Progress::Advanced => {
                *self.current.lock() = Some(queue);
                Ok(Tick::Progressed)
            }
            Progress::Wait(delay) => {
                *self.current.lock() = Some(queue);
                Ok(Tick::Wait(delay))
            }
        }
    }

    /// Adopt the stored copy of the queue, or cancel it when it is gone
    async fn sync(&self, queue: &mut Queue) -> Result<()> {
        let name = queue.name_any();
        match self.ctx.store.get(&name).await? {
            Some(stored) if stored != *queue => {
                debug!(queue = %name, "Queue changed in store");
                *queue = stored;
            }
            Some(_) => {}
            None => {
                info!(queue = %name, "Queue deleted, cancelling");
                queue.set_state(QueueState::Cancelling);
            }
        }
        Ok(())
    }

    async fn dispatch(&self, queue: &mut Queue) -> Result<Progress> {
        let ctx = self.ctx.as_ref();
        match (queue.is_promotion(), queue.state()) {
            (_, QueueState::Cancelling) => Ok(Progress::Released),
            (_, QueueState::Finished) => Ok(Progress::Wait(ctx.timings.wait)),
            (promotion, QueueState::Waiting) => {
                let status = queue.status_mut();
                if status.created_at.is_none() {
                    status.created_at = Some(Utc::now());
                }
                queue.set_state(if promotion {
                    QueueState::DetectingImageMissing
                } else {
                    QueueState::CleaningBefore
                });
                ctx.save(queue).await?;
                Ok(Progress::Advanced)
            }
            (false, QueueState::CleaningBefore) => phases::clean_before(ctx, queue).await,
            (_, QueueState::DetectingImageMissing) => phases::detect_image_missing(ctx, queue).await,
            (_, QueueState::Creating) => phases::deploy(ctx, queue).await,
            (true, QueueState::Testing) => {
                queue.set_state(QueueState::Collecting);
                ctx.save(queue).await?;
                Ok(Progress::Advanced)
            }
            (false, QueueState::Testing) => phases::test(ctx, queue).await,
            (_, QueueState::Collecting) => phases::collect(ctx, queue).await,
            (false, QueueState::CleaningAfter) => phases::clean_after(ctx, queue).await,
            (false, QueueState::Deleting) => phases::dispose(ctx, queue).await,
            (true, state) => Err(StagingError::InvalidState {
                queue: queue.name_any(),
                state: state.to_string(),
            }),
        }
    }

    fn idle_delay(&self) -> Duration {
        let timings = self.ctx.timings;
        let jitter_ms = timings.idle_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        timings.idle + Duration::from_millis(jitter)
    }

    /// Tick until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) {
        info!(namespace = %self.ctx.namespace, team = %self.ctx.team, "Staging controller started");
        loop {
            let delay = match self.tick().await {
                Ok(Tick::Idle) => self.idle_delay(),
                Ok(Tick::Progressed) => Duration::ZERO,
                Ok(Tick::Wait(delay)) => delay,
                Err(e) => {
                    error!(error = %e, "Tick failed");
                    self.ctx.timings.wait
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Staging controller stopped");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

impl QueueStatusProvider for Controller {
    fn current_queue(&self) -> Option<QueueSummary> {
        self.current.lock().as_ref().map(|queue| QueueSummary {
            name: queue.name_any(),
            queue_type: queue.spec.type_,
            state: queue.state().to_string(),
            repository: queue.spec.repository.clone(),
            version: queue.spec.version.clone(),
            no_of_retry: queue.spec.no_of_retry,
        })
    }
}
