//! Ranking queries over committed aggregates

use super::store::{AggregateStore, StoreError};
use super::types::RangeView;
use std::sync::Arc;

/// Read-only leaderboard access for presentation layers
#[derive(Clone)]
pub struct RankingService {
    store: Arc<dyn AggregateStore>,
}

impl RankingService {
    pub fn new(store: Arc<dyn AggregateStore>) -> Self {
        Self { store }
    }

    /// Busiest ranges: calls desc, then CLI count desc
    pub fn top_ranges(&self, limit: usize) -> Result<Vec<RangeView>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.store.top_ranges(limit)
    }

    /// Same ordering, restricted to ranges whose name or source key contains
    /// `keyword`, ignoring case. A blank keyword matches everything.
    pub fn search(&self, keyword: &str, limit: usize) -> Result<Vec<RangeView>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.store.search_ranges(keyword, limit)
    }

    pub fn leader(&self) -> Result<Option<RangeView>, StoreError> {
        Ok(self.top_ranges(1)?.into_iter().next())
    }
}
