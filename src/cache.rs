//! Invalidation hook for caches derived from configuration values.

use crate::error::Result;

pub trait CacheInvalidator {
    fn invalidate(&self) -> Result<()>;
}

/// For deployments with nothing to invalidate.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCache;

impl CacheInvalidator for NoopCache {
    fn invalidate(&self) -> Result<()> {
        Ok(())
    }
}

impl<F> CacheInvalidator for F
where
    F: Fn() -> Result<()>,
{
    fn invalidate(&self) -> Result<()> {
        self()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn closures_are_invalidators() {
        let calls = Cell::new(0);
        let cache = || -> Result<()> {
            calls.set(calls.get() + 1);
            Ok(())
        };
        cache.invalidate().unwrap();
        cache.invalidate().unwrap();
        assert_eq!(calls.get(), 2);
        assert!(NoopCache.invalidate().is_ok());
    }
}
