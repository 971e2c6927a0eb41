//! Sources: paginated bucket listing, or replay of a previous retry set.

use crate::{
    models::object::ObjectDescriptor,
    pipeline::{
        error::ErrorRecord,
        stage::{Emitter, SourceFn, StepContext},
    },
    services::storage::{ListPage, StorageErrorKind},
};
use async_trait::async_trait;
use std::{
    sync::{Mutex, PoisonError},
    time::Duration,
};
use tracing::{debug, info, warn};

/// Keys requested per listing call.
pub const KEYS_PER_REQUEST: usize = 1000;
pub const LIST_ATTEMPTS: u32 = 3;
pub const LIST_BACKOFF: Duration = Duration::from_secs(1);

/// Enumerates the source bucket page by page.
#[derive(Debug, Clone)]
pub struct ListSource {
    page_size: usize,
    attempts: u32,
    backoff: Duration,
}

impl Default for ListSource {
    fn default() -> Self {
        Self {
            page_size: KEYS_PER_REQUEST,
            attempts: LIST_ATTEMPTS,
            backoff: LIST_BACKOFF,
        }
    }
}

impl ListSource {
    pub fn new(page_size: usize, attempts: u32, backoff: Duration) -> Self {
        Self {
            page_size: page_size.max(1),
            attempts: attempts.max(1),
            backoff,
        }
    }

    /// Fetch one page, retrying transient failures locally. `Ok(None)` means
    /// the run started draining while backing off.
    async fn fetch_page(
        &self,
        ctx: &StepContext,
        token: Option<String>,
    ) -> Result<Option<ListPage>, ErrorRecord> {
        let mut attempt = 1;
        loop {
            let err = match ctx.source.list_page(token.clone(), self.page_size).await {
                Ok(page) => return Ok(Some(page)),
                Err(err) => err,
            };

            match err.kind() {
                StorageErrorKind::InvalidConfiguration
                | StorageErrorKind::PermissionDenied
                | StorageErrorKind::NotFound => {
                    return Err(ErrorRecord::configuration(
                        &ctx.stage,
                        format!("listing {} failed: {}", ctx.source.describe(), err),
                    ));
                }
                kind if kind.is_retryable() && attempt < self.attempts => {
                    warn!(
                        stage = %ctx.stage,
                        attempt,
                        attempts = self.attempts,
                        error = %err,
                        "listing page failed, retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = ctx.control.drained() => {
                            ctx.control.note_cut_short();
                            return Ok(None);
                        }
                        _ = tokio::time::sleep(self.backoff) => {}
                    }
                    attempt += 1;
                }
                StorageErrorKind::Transient | StorageErrorKind::Other => {
                    return Err(ErrorRecord::configuration(
                        &ctx.stage,
                        format!(
                            "listing {} failed after {} attempts: {}",
                            ctx.source.describe(),
                            attempt,
                            err
                        ),
                    ));
                }
            }
        }
    }
}

#[async_trait]
impl SourceFn for ListSource {
    async fn produce(&self, ctx: &StepContext, out: &Emitter) -> Result<(), ErrorRecord> {
        let mut token = None;
        let mut pages = 0usize;
        loop {
            if out.should_stop() {
                info!(stage = %ctx.stage, pages, "listing stopped early");
                return Ok(());
            }
            let Some(page) = self.fetch_page(ctx, token.take()).await? else {
                return Ok(());
            };
            pages += 1;
            debug!(stage = %ctx.stage, page = pages, objects = page.objects.len(), "listed page");

            for object in page.objects {
                if !out.emit(object).await {
                    return Ok(());
                }
            }
            match page.next_continuation_token {
                Some(next) => token = Some(next),
                None => return Ok(()),
            }
        }
    }
}

/// Emits exactly the objects of a previous pass's retry set, once.
#[derive(Debug, Default)]
pub struct ReplayRetrySet {
    objects: Mutex<Option<Vec<ObjectDescriptor>>>,
}

impl ReplayRetrySet {
    pub fn new(objects: Vec<ObjectDescriptor>) -> Self {
        Self {
            objects: Mutex::new(Some(objects)),
        }
    }
}

#[async_trait]
impl SourceFn for ReplayRetrySet {
    async fn produce(&self, ctx: &StepContext, out: &Emitter) -> Result<(), ErrorRecord> {
        let objects = self
            .objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .unwrap_or_default();
        info!(stage = %ctx.stage, objects = objects.len(), "replaying retry set");

        for object in objects {
            if !out.emit(object).await {
                break;
            }
        }
        Ok(())
    }
}
