//! Read-side queries over the user read models.

use std::time::Duration;

use common::AggregateId;

use crate::error::QueryError;
use crate::read_model::{DetailStore, ScanRequest, SummaryStore, UserDetail, UserSummary};

/// Serves detail lookups and full summary listings.
///
/// Queries only read; they never touch the event store.
#[derive(Clone)]
pub struct QueryService<R> {
    models: R,
    page_size: usize,
}

impl<R: SummaryStore + DetailStore> QueryService<R> {
    pub fn new(models: R) -> Self {
        Self::with_page_size(models, 100)
    }

    /// `page_size` is the store-side scan limit; zero is treated as one.
    pub fn with_page_size(models: R, page_size: usize) -> Self {
        Self {
            models,
            page_size: page_size.max(1),
        }
    }

    pub fn models(&self) -> &R {
        &self.models
    }

    /// Looks up one user's detail record.
    #[tracing::instrument(skip(self))]
    pub async fn get_detail(&self, user_id: Option<&str>) -> Result<UserDetail, QueryError> {
        let user_id = user_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| QueryError::Validation("Missing user_id".to_string()))?;

        self.models
            .get_detail(&AggregateId::new(user_id))
            .await
            .map_err(QueryError::StoreRead)?
            .ok_or_else(|| QueryError::NotFound("User not found".to_string()))
    }

    /// Returns every summary, following the store's pages until exhausted.
    #[tracing::instrument(skip(self))]
    pub async fn list_summaries(&self) -> Result<Vec<UserSummary>, QueryError> {
        let mut users = Vec::new();
        let mut request = ScanRequest::first(self.page_size);
        let mut pages = 0u32;

        loop {
            let page = self
                .models
                .scan_summaries(request)
                .await
                .map_err(QueryError::StoreRead)?;
            pages += 1;
            users.extend(page.items);

            match page.last_key {
                Some(key) => request = ScanRequest::after(key, self.page_size),
                None => break,
            }
        }

        tracing::debug!(users = users.len(), pages, "summaries listed");
        Ok(users)
    }

    /// Like [`list_summaries`](Self::list_summaries), but gives up after
    /// `timeout`. The partial result is discarded; the store is only ever
    /// read, so abandoning the scan leaves it untouched.
    pub async fn list_summaries_within(
        &self,
        timeout: Duration,
    ) -> Result<Vec<UserSummary>, QueryError> {
        tokio::time::timeout(timeout, self.list_summaries())
            .await
            .map_err(|_| {
                tracing::warn!(?timeout, "summary listing timed out");
                QueryError::Timeout(timeout)
            })?
    }
}
