//! In-memory symbol-master index.
//!
//! Lookup by (exchange, symbol) must stay O(1) average over hundreds of
//! thousands of instruments, so the index is a read-mostly map behind a
//! whole-map copy-on-write swap: readers clone an `Arc`, rebuilds construct
//! a fresh map on the blocking pool and swap it in one write.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::db::{self, DbPool};
use crate::error::{CoreError, CoreResult};
use crate::types::Instrument;

type SymbolMap = HashMap<(String, String), Instrument>;

pub struct SymbolIndex {
    map: RwLock<Arc<SymbolMap>>,
}

impl SymbolIndex {
    pub fn new() -> Self {
        Self {
            map: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    /// O(1) average lookup. Keys are case-insensitive.
    pub fn lookup(&self, exchange: &str, symbol: &str) -> Option<Instrument> {
        let snapshot = Arc::clone(&self.map.read());
        snapshot
            .get(&(exchange.to_uppercase(), symbol.to_uppercase()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    /// Swap in a freshly built map. Readers in flight keep their snapshot.
    pub fn swap(&self, map: SymbolMap) {
        *self.map.write() = Arc::new(map);
    }

    /// Rebuild the index from the persisted symbol master. Map construction
    /// is CPU-bound for large masters and runs on the blocking pool.
    pub async fn load_from_db(self: &Arc<Self>, pool: &DbPool) -> CoreResult<usize> {
        let instruments = db::all_symbols(pool).await?;
        let index = Arc::clone(self);
        let count = tokio::task::spawn_blocking(move || {
            let map = build_map(instruments);
            let count = map.len();
            index.swap(map);
            count
        })
        .await
        .map_err(|e| CoreError::internal(format!("symbol index build task: {e}")))?;
        tracing::info!(instruments = count, "symbol index rebuilt");
        Ok(count)
    }
}

impl Default for SymbolIndex {
    fn default() -> Self {
        Self::new()
    }
}

fn build_map(instruments: Vec<Instrument>) -> SymbolMap {
    let mut map = HashMap::with_capacity(instruments.len());
    for inst in instruments {
        map.insert(
            (inst.exchange.to_uppercase(), inst.symbol.to_uppercase()),
            inst,
        );
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instrument(exchange: &str, symbol: &str) -> Instrument {
        Instrument {
            exchange: exchange.into(),
            symbol: symbol.into(),
            token: "1".into(),
            name: symbol.into(),
            instrument_type: "EQ".into(),
            lot_size: 1,
            tick_size: 0.05,
            expiry: None,
            strike: None,
        }
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let index = SymbolIndex::new();
        index.swap(build_map(vec![instrument("NSE", "RELIANCE")]));
        assert!(index.lookup("nse", "reliance").is_some());
        assert!(index.lookup("NSE", "RELIANCE").is_some());
        assert!(index.lookup("NSE", "TCS").is_none());
    }

    #[test]
    fn test_swap_replaces_whole_map() {
        let index = SymbolIndex::new();
        index.swap(build_map(vec![instrument("NSE", "RELIANCE")]));
        index.swap(build_map(vec![instrument("NSE", "TCS")]));
        assert!(index.lookup("NSE", "RELIANCE").is_none());
        assert!(index.lookup("NSE", "TCS").is_some());
        assert_eq!(index.len(), 1);
    }

    #[tokio::test]
    async fn test_load_from_db() {
        let pool = db::create_test_pool().await;
        db::replace_symbol_master(&pool, &[instrument("NSE", "INFY")])
            .await
            .unwrap();
        let index = Arc::new(SymbolIndex::new());
        let count = index.load_from_db(&pool).await.unwrap();
        assert_eq!(count, 1);
        assert!(index.lookup("NSE", "INFY").is_some());
    }
}
