//! Module state resolution and reuse
//!
//! Entering a function needs the execution state of the function's module.
//! A call that stays inside the caller's module reuses the caller's cached
//! state; a call that crosses into another module asks the resolver once and
//! caches the answer on the new frame.

use crate::error::StackResult;
use crate::module::{Module, ModuleId, ModuleState};

/// Looks up (or lazily creates) the execution state of a module
pub trait StateResolver {
    fn query_module_state(&mut self, module: &dyn Module) -> StackResult<ModuleState>;
}

impl<F> StateResolver for F
where
    F: FnMut(&dyn Module) -> StackResult<ModuleState>,
{
    fn query_module_state(&mut self, module: &dyn Module) -> StackResult<ModuleState> {
        self(module)
    }
}

/// Counters describing how module state was obtained
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Calls made to the resolver
    pub queries: u64,
    /// Frames that reused their parent's state
    pub reused: u64,
}

/// Resolver wrapper that reuses the parent frame's state within a module
pub struct ModuleStateCache<'s> {
    resolver: Box<dyn StateResolver + 's>,
    stats: CacheStats,
}

impl<'s> ModuleStateCache<'s> {
    pub fn new(resolver: Box<dyn StateResolver + 's>) -> Self {
        Self {
            resolver,
            stats: CacheStats::default(),
        }
    }

    /// State for a frame in `module` whose parent (if any) runs in `parent.0`
    /// with cached state `parent.1`.
    pub fn resolve(
        &mut self,
        module: &dyn Module,
        parent: Option<(ModuleId, &ModuleState)>,
    ) -> StackResult<ModuleState> {
        if let Some((parent_module, state)) = parent {
            if parent_module == module.id() {
                self.stats.reused += 1;
                return Ok(state.clone());
            }
        }
        self.query(module)
    }

    /// Ask the resolver directly, bypassing reuse
    pub fn query(&mut self, module: &dyn Module) -> StackResult<ModuleState> {
        self.stats.queries += 1;
        log::debug!("resolving state for module {} ({})", module.name(), module.id());
        self.resolver.query_module_state(module)
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, StackError};

    #[derive(Debug)]
    struct Fixed(u32);

    impl Module for Fixed {
        fn id(&self) -> ModuleId {
            ModuleId(self.0)
        }
        fn name(&self) -> &str {
            "fixed"
        }
    }

    fn counting_cache() -> ModuleStateCache<'static> {
        ModuleStateCache::new(Box::new(
            |module: &dyn Module| -> StackResult<ModuleState> {
                Ok(ModuleState::new(module.id().0))
            },
        ))
    }

    #[test]
    fn test_reuses_parent_state_in_same_module() {
        let mut cache = counting_cache();
        let module = Fixed(1);
        let parent_state = cache.resolve(&module, None).unwrap();

        let child_state = cache
            .resolve(&module, Some((ModuleId(1), &parent_state)))
            .unwrap();

        assert!(child_state.ptr_eq(&parent_state));
        assert_eq!(cache.stats(), CacheStats { queries: 1, reused: 1 });
    }

    #[test]
    fn test_queries_on_module_transition() {
        let mut cache = counting_cache();
        let parent_state = cache.resolve(&Fixed(1), None).unwrap();

        let child_state = cache
            .resolve(&Fixed(2), Some((ModuleId(1), &parent_state)))
            .unwrap();

        assert_eq!(child_state.downcast_ref::<u32>(), Some(&2));
        assert_eq!(cache.stats().queries, 2);
    }

    #[test]
    fn test_resolver_failure_propagates() {
        let mut cache = ModuleStateCache::new(Box::new(
            |module: &dyn Module| -> StackResult<ModuleState> {
                Err(StackError::ModuleNotFound {
                    id: module.id(),
                    name: module.name().to_string(),
                })
            },
        ));
        let err = cache.resolve(&Fixed(9), None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
