//! # Pagination Module
//!
//! Page-based slicing of a [`Session`]: the total is counted with the session's
//! predicates, then one page of rows is fetched with `LIMIT`/`OFFSET` applied.

use serde::{Deserialize, Serialize};

use crate::query_builder::Session;
use crate::{Model, Record, Result};

const FALLBACK_LIMIT: usize = 10;

/// One page of results and the counts around it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Paginated<T> {
    pub data: Vec<T>,
    /// Rows matching the query, ignoring pagination.
    pub total: i64,
    /// Zero-based page index.
    pub page: usize,
    pub limit: usize,
    pub total_pages: i64,
}

/// Pagination settings.
///
/// A `limit` above `max_limit` falls back to 10 rows per page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    /// Zero-based page index.
    pub page: usize,
    pub limit: usize,
    /// Upper bound accepted for `limit`.
    pub max_limit: usize,
}

impl Pagination {
    pub fn new_with_limit(page: usize, limit: usize, max_limit: usize) -> Self {
        let limit = if limit > max_limit || limit == 0 { FALLBACK_LIMIT } else { limit };
        Self { page, limit, max_limit }
    }

    /// Pagination with a maximum of 100 rows per page.
    pub fn new(page: usize, limit: usize) -> Self {
        Self::new_with_limit(page, limit, 100)
    }

    fn effective_limit(&self) -> usize {
        if self.limit > self.max_limit || self.limit == 0 { FALLBACK_LIMIT } else { self.limit }
    }

    /// Sets `limit` and `offset` on the session.
    pub fn apply<'s>(&self, session: &'s mut Session) -> &'s mut Session {
        let limit = self.effective_limit();
        session.limit(limit as i64).offset((self.page * limit) as i64)
    }

    /// Counts the matching rows and fetches the requested page as column maps.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let mut session = orm.table("orders");
    /// session.order_by_asc("id");
    /// let page = Pagination::new(0, 20).paginate(&mut session).await?;
    /// assert!(page.data.len() <= 20);
    /// ```
    pub async fn paginate(&self, session: &mut Session) -> Result<Paginated<Record>> {
        let total = self.count(session).await?;
        self.apply(session);
        let data = session.find().await?;
        Ok(self.page_of(data, total))
    }

    /// Like [`Pagination::paginate`], decoding each row into `T`.
    pub async fn paginate_as<T: Model>(&self, session: &mut Session) -> Result<Paginated<T>> {
        let total = self.count(session).await?;
        self.apply(session);
        let data = session.find_as::<T>().await?;
        Ok(self.page_of(data, total))
    }

    async fn count(&self, session: &mut Session) -> Result<i64> {
        session.ready()?;
        session.predicates.clear_paging();
        session.count().await
    }

    fn page_of<T>(&self, data: Vec<T>, total: i64) -> Paginated<T> {
        let limit = self.effective_limit();
        let total_pages = (total as f64 / limit as f64).ceil() as i64;
        Paginated { data, total, page: self.page, limit, total_pages }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_limit_falls_back() {
        let pagination = Pagination::new(2, 500);
        assert_eq!(pagination.limit, 10);
        assert_eq!(pagination.max_limit, 100);
    }

    #[test]
    fn total_pages_round_up() {
        let page = Pagination::new(0, 20).page_of(Vec::<Record>::new(), 41);
        assert_eq!(page.total_pages, 3);
        assert_eq!(page.limit, 20);
    }
}
