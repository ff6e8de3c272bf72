//! vm-stack - Fiber call stack for a module-based virtual machine
//!
//! This library provides the call stack used by the dispatch loop:
//! - A bump-allocated storage arena that grows by doubling up to a hard maximum
//! - A chain of typed frames (external, native, bytecode) with trailing storage
//! - Per-frame module state, reused within a module and resolved on transition
//! - Backtrace rendering and error annotation

/// vm-stack version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod arena;
pub mod backtrace;
pub mod cache;
pub mod error;
pub mod frame;
pub mod module;
pub mod stack;

// Re-export commonly used types
pub use arena::{
    Allocator, Arena, NullAllocator, Reservation, SystemAllocator, DEFAULT_STACK_SIZE,
    MAX_STACK_SIZE, MIN_STACK_SIZE,
};
pub use backtrace::{Backtrace, BacktraceEntry};
pub use cache::{CacheStats, ModuleStateCache, StateResolver};
pub use error::{ErrorKind, StackError, StackResult};
pub use frame::{
    frame_size, Frame, FrameCleanup, FrameHandle, FrameMut, Registers, RegistersMut,
    FRAME_ALIGNMENT, FRAME_HEADER_SIZE,
};
pub use module::{FrameKind, Function, Module, ModuleId, ModuleState, SourceLocation};
pub use stack::{InvocationFlags, Stack};
pub use vm_stack_config::{ConfigLoader, StackConfig};
