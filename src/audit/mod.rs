//! Write-once change log for sale and settlement mutations.

use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use std::sync::Arc;
use tracing::debug;

use crate::error::{AppError, AppResult};
use crate::ledger::models::{AuditRecord, NewAuditRecord};
use crate::ledger::{AuditCursor, AuditFilter, LedgerStore, LedgerUnit};

/// Records pulled from the store per round trip while streaming a query
pub const DEFAULT_PAGE_SIZE: usize = 200;

pub struct AuditLog {
    store: Arc<dyn LedgerStore>,
    page_size: usize,
}

struct AuditPager {
    store: Arc<dyn LedgerStore>,
    filter: AuditFilter,
    cursor: Option<AuditCursor>,
    page_size: usize,
    exhausted: bool,
}

impl AuditPager {
    async fn next_page(mut self) -> AppResult<Option<(Vec<AuditRecord>, AuditPager)>> {
        if self.exhausted {
            return Ok(None);
        }

        let page = self
            .store
            .audit_page(&self.filter, self.cursor, self.page_size)
            .await?;
        if page.is_empty() {
            return Ok(None);
        }

        self.exhausted = page.len() < self.page_size;
        self.cursor = page.last().map(AuditCursor::after);
        Ok(Some((page, self)))
    }
}

impl AuditLog {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self::with_page_size(store, DEFAULT_PAGE_SIZE)
    }

    pub fn with_page_size(store: Arc<dyn LedgerStore>, page_size: usize) -> Self {
        Self {
            store,
            page_size: page_size.max(1),
        }
    }

    /// Append a standalone audit record
    pub async fn record(&self, draft: NewAuditRecord) -> AppResult<AuditRecord> {
        let record = draft.stamp(Utc::now())?;
        self.store.append_audit(&record).await?;
        debug!(
            "Audit {} {} {:?} by {}",
            record.entity_type, record.entity_id, record.field, record.changed_by
        );
        Ok(record)
    }

    /// Append an audit record inside an open unit of work, so it commits or
    /// rolls back with the change it describes
    pub async fn record_in(
        &self,
        unit: &mut dyn LedgerUnit,
        draft: NewAuditRecord,
    ) -> AppResult<AuditRecord> {
        let record = draft.stamp(Utc::now())?;
        unit.append_audit(&record).await?;
        Ok(record)
    }

    /// Matching records ordered by `changed_at`, fetched page by page as the
    /// stream is polled. Dropping the stream stops further fetches.
    pub fn query(&self, filter: AuditFilter) -> BoxStream<'static, AppResult<AuditRecord>> {
        if let Err(e) = filter.validate() {
            return stream::once(async move { Err::<AuditRecord, AppError>(e) }).boxed();
        }

        let pager = AuditPager {
            store: self.store.clone(),
            filter,
            cursor: None,
            page_size: self.page_size,
            exhausted: false,
        };

        stream::try_unfold(pager, AuditPager::next_page)
            .map_ok(|page| stream::iter(page.into_iter().map(Ok::<AuditRecord, AppError>)))
            .try_flatten()
            .boxed()
    }
}
