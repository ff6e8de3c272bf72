//! Shared test utilities for stack tests

#![allow(dead_code)]

use std::cell::Cell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use vm_stack::{
    FrameKind, FrameMut, Function, Module, ModuleId, ModuleState, SourceLocation, StackError,
    StackResult,
};

/// Module with named functions and a fixed bytecode line table
#[derive(Debug)]
pub struct TestModule {
    id: u32,
    name: String,
    functions: Vec<&'static str>,
    /// (ordinal, pc) -> location
    locations: HashMap<(u32, u64), SourceLocation>,
}

impl TestModule {
    pub fn new(id: u32, name: &str, functions: &[&'static str]) -> Self {
        Self {
            id,
            name: name.to_string(),
            functions: functions.to_vec(),
            locations: HashMap::new(),
        }
    }

    pub fn with_location(mut self, ordinal: u32, pc: u64, location: SourceLocation) -> Self {
        self.locations.insert((ordinal, pc), location);
        self
    }

    pub fn shared(self) -> Arc<dyn Module> {
        Arc::new(self)
    }
}

impl Module for TestModule {
    fn id(&self) -> ModuleId {
        ModuleId(self.id)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn function_name(&self, ordinal: u32) -> Option<&str> {
        self.functions.get(ordinal as usize).copied()
    }

    fn source_location(&self, ordinal: u32, pc: u64) -> Option<SourceLocation> {
        self.locations.get(&(ordinal, pc)).cloned()
    }
}

/// Resolver handing out a fresh state per query, tagged with the module id
pub fn resolver(module: &dyn Module) -> StackResult<ModuleState> {
    Ok(ModuleState::new(module.id().0))
}

/// Resolver that counts its queries in `counter`
pub fn counting_resolver(
    counter: Rc<Cell<usize>>,
) -> impl FnMut(&dyn Module) -> StackResult<ModuleState> {
    move |module: &dyn Module| -> StackResult<ModuleState> {
        counter.set(counter.get() + 1);
        Ok(ModuleState::new(module.id().0))
    }
}

/// Resolver that knows no modules
pub fn empty_resolver(module: &dyn Module) -> StackResult<ModuleState> {
    Err(StackError::ModuleNotFound {
        id: module.id(),
        name: module.name().to_string(),
    })
}

/// Function `ordinal` of `module`
pub fn function(module: &Arc<dyn Module>, ordinal: u32, kind: FrameKind) -> Function {
    Function::new(module.clone(), ordinal, kind)
}

/// Cleanup that bumps `counter`; returns the counter for assertions
pub fn cleanup_counter() -> (Rc<Cell<usize>>, impl FnOnce(&mut FrameMut<'_>) + 'static) {
    let counter = Rc::new(Cell::new(0));
    let hits = counter.clone();
    (counter, move |_: &mut FrameMut<'_>| hits.set(hits.get() + 1))
}
