//! Compiled-plan cache keyed by the structure of the query pipeline.

use crate::error::Result;
use crate::query::Query;
use crate::translate::CompiledQuery;
use indexmap::IndexMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Bounded least-recently-used map from pipelines to compiled plans. Parameter values are not
/// part of the key, so one plan serves every execution of the same pipeline.
#[derive(Debug)]
pub struct PlanCache {
    capacity: usize,
    entries: Mutex<IndexMap<Query, Arc<CompiledQuery>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

impl PlanCache {
    /// A capacity of zero disables caching.
    pub fn new(capacity: usize) -> Self {
        PlanCache {
            capacity,
            entries: Mutex::new(IndexMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get_or_compile(
        &self,
        query: &Query,
        compile: impl FnOnce(&Query) -> Result<CompiledQuery>,
    ) -> Result<Arc<CompiledQuery>> {
        if self.capacity == 0 {
            return compile(query).map(Arc::new);
        }
        {
            let mut entries = self.lock();
            if let Some(index) = entries.get_index_of(query) {
                let last = entries.len() - 1;
                entries.move_index(index, last);
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(query = %query, "plan cache hit");
                return Ok(entries[last].clone());
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!(query = %query, "plan cache miss");
        let compiled = Arc::new(compile(query)?);
        let mut entries = self.lock();
        entries.insert(query.clone(), compiled.clone());
        while entries.len() > self.capacity {
            entries.shift_remove_index(0);
        }
        Ok(compiled)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.lock().len(),
        }
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, IndexMap<Query, Arc<CompiledQuery>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::from_json;
    use crate::options::QueryOptions;
    use crate::query::{lambda, param, var};
    use crate::translate::QueryCompiler;
    use crate::value::ClrType;
    use crate::translate::BLOGGING;

    fn compiler() -> QueryCompiler {
        QueryCompiler::new(Arc::new(from_json(BLOGGING).unwrap()), QueryOptions::default())
    }

    fn by_rating(name: &str) -> Query {
        Query::from("Blog").filter(lambda(&["b"], var("b").member("Rating").gt(param(name, ClrType::Int32))))
    }

    #[test]
    fn identical_pipelines_share_a_plan() {
        let compiler = compiler();
        let cache = PlanCache::new(4);
        let a = cache.get_or_compile(&by_rating("rating"), |q| compiler.compile(q)).unwrap();
        let b = cache.get_or_compile(&by_rating("rating"), |q| compiler.compile(q)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(
            cache.stats(),
            CacheStats {
                hits: 1,
                misses: 1,
                entries: 1
            }
        );
    }

    #[test]
    fn least_recently_used_plan_is_evicted() {
        let compiler = compiler();
        let cache = PlanCache::new(2);
        let first = cache.get_or_compile(&by_rating("a"), |q| compiler.compile(q)).unwrap();
        cache.get_or_compile(&by_rating("b"), |q| compiler.compile(q)).unwrap();
        cache.get_or_compile(&by_rating("a"), |q| compiler.compile(q)).unwrap();
        cache.get_or_compile(&by_rating("c"), |q| compiler.compile(q)).unwrap();
        assert_eq!(cache.stats().entries, 2);
        let again = cache.get_or_compile(&by_rating("a"), |q| compiler.compile(q)).unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(cache.stats().misses, 3);
    }

    #[test]
    fn zero_capacity_always_compiles() {
        let compiler = compiler();
        let cache = PlanCache::new(0);
        let a = cache.get_or_compile(&by_rating("rating"), |q| compiler.compile(q)).unwrap();
        let b = cache.get_or_compile(&by_rating("rating"), |q| compiler.compile(q)).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(cache.stats().entries, 0);
    }
}
