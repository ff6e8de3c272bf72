//! Fiber call stack
//!
//! A [`Stack`] tracks the nested function activations of one fiber. The
//! dispatch loop calls [`Stack::enter`] before running a function body and
//! [`Stack::leave`] when it returns; on error it unwinds with repeated
//! `leave` calls (or [`Stack::unwind_to`]) and can attach a backtrace to the
//! error it propagates.
//!
//! All state lives in the stack itself. The module state resolver and the
//! storage allocator are passed in at construction, so several fibers can
//! share a host thread by each owning their own stack.

use crate::arena::{Allocator, Arena, DEFAULT_STACK_SIZE, MAX_STACK_SIZE};
use crate::cache::{CacheStats, ModuleStateCache, StateResolver};
use crate::error::{StackError, StackResult};
use crate::frame::{
    frame_size, Frame, FrameCleanup, FrameHandle, FrameMut, FrameRecord, FRAME_HEADER_SIZE,
};
use crate::module::{FrameKind, Function, Module, ModuleState};
use crate::SystemAllocator;
use vm_stack_config::{GrowthPolicy, StackConfig};

/// Flags fixed for the lifetime of a stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvocationFlags {
    /// Log every frame entered and left at trace level
    pub trace_execution: bool,
    /// Attach backtraces in [`Stack::annotate_backtrace`]
    pub annotate_backtraces: bool,
}

impl InvocationFlags {
    /// Default flags with execution tracing on
    pub fn traced() -> Self {
        Self {
            trace_execution: true,
            ..Self::default()
        }
    }

    pub fn from_config(config: &StackConfig) -> Self {
        Self {
            trace_execution: config.trace_execution(),
            annotate_backtraces: config.backtrace_enabled(),
        }
    }
}

impl Default for InvocationFlags {
    fn default() -> Self {
        Self {
            trace_execution: false,
            annotate_backtraces: true,
        }
    }
}

/// A live frame and its pending cleanup
struct LiveFrame<'s> {
    record: FrameRecord,
    cleanup: Option<FrameCleanup<'s>>,
}

/// Call stack of a single fiber
pub struct Stack<'s> {
    flags: InvocationFlags,
    arena: Arena<'s>,
    modules: ModuleStateCache<'s>,
    /// Live frames, base first
    frames: Vec<LiveFrame<'s>>,
    next_serial: u64,
}

impl<'s> Stack<'s> {
    /// Create a stack over caller-supplied storage.
    ///
    /// `allocator` is only used to grow past `storage`; pass
    /// [`NullAllocator`](crate::NullAllocator) to keep the stack inside it.
    /// Storage smaller than [`MIN_STACK_SIZE`](crate::MIN_STACK_SIZE) is rejected.
    pub fn with_storage(
        storage: &'s mut [u8],
        flags: InvocationFlags,
        resolver: impl StateResolver + 's,
        allocator: impl Allocator + 's,
    ) -> StackResult<Self> {
        let arena = Arena::borrowed(storage, MAX_STACK_SIZE, Box::new(allocator))?;
        Ok(Self::from_parts(flags, arena, Box::new(resolver)))
    }

    /// Create a growable stack whose storage comes from `allocator`
    pub fn allocate(
        flags: InvocationFlags,
        resolver: impl StateResolver + 's,
        allocator: impl Allocator + 's,
    ) -> StackResult<Self> {
        Self::allocate_with_limits(
            DEFAULT_STACK_SIZE,
            MAX_STACK_SIZE,
            flags,
            resolver,
            allocator,
        )
    }

    /// Create a dynamically allocated stack with explicit size limits
    pub fn allocate_with_limits(
        initial_size: usize,
        max_size: usize,
        flags: InvocationFlags,
        resolver: impl StateResolver + 's,
        allocator: impl Allocator + 's,
    ) -> StackResult<Self> {
        let arena = Arena::allocate(initial_size, max_size, Box::new(allocator))?;
        Ok(Self::from_parts(flags, arena, Box::new(resolver)))
    }

    /// Create a stack from loaded configuration using the system allocator.
    ///
    /// With growth disabled the stack is capped at its initial size.
    pub fn from_config(
        config: &StackConfig,
        resolver: impl StateResolver + 's,
    ) -> StackResult<Self> {
        let max_size = match config.growth() {
            GrowthPolicy::None => config.initial_size(),
            GrowthPolicy::System => config.max_size(),
        };
        Self::allocate_with_limits(
            config.initial_size(),
            max_size,
            InvocationFlags::from_config(config),
            resolver,
            SystemAllocator,
        )
    }

    fn from_parts(
        flags: InvocationFlags,
        arena: Arena<'s>,
        resolver: Box<dyn StateResolver + 's>,
    ) -> Self {
        Self {
            flags,
            arena,
            modules: ModuleStateCache::new(resolver),
            frames: Vec::with_capacity(16),
            next_serial: 0,
        }
    }

    /// Leave every live frame, running cleanups top to base, and release storage.
    ///
    /// Dropping the stack does the same.
    pub fn teardown(self) {
        drop(self);
    }

    pub fn flags(&self) -> InvocationFlags {
        self.flags
    }

    /// Number of live frames
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Current storage capacity in bytes
    pub fn capacity(&self) -> usize {
        self.arena.capacity()
    }

    /// Bytes used by live frames
    pub fn used(&self) -> usize {
        self.arena.used()
    }

    /// Hard limit on storage size
    pub fn max_size(&self) -> usize {
        self.arena.max_size()
    }

    /// Storage generation; changes whenever the stack relocates
    pub fn generation(&self) -> u64 {
        self.arena.generation()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.modules.stats()
    }

    /// The topmost frame
    pub fn current(&self) -> Option<Frame<'_>> {
        self.frames.last().map(|live| self.view(live))
    }

    /// The frame below the topmost one
    pub fn parent(&self) -> Option<Frame<'_>> {
        let len = self.frames.len();
        if len < 2 {
            return None;
        }
        self.frames.get(len - 2).map(|live| self.view(live))
    }

    /// Mutable view of the topmost frame
    pub fn current_mut(&mut self) -> Option<FrameMut<'_>> {
        let record = &mut self.frames.last_mut()?.record;
        let storage = self
            .arena
            .bytes_mut(record.storage_offset(), record.storage_size);
        Some(FrameMut { record, storage })
    }

    /// Resolve a handle returned by [`Stack::enter`]
    pub fn frame(&self, handle: FrameHandle) -> StackResult<Frame<'_>> {
        let index = self.check_handle(handle)?;
        Ok(self.view(&self.frames[index]))
    }

    /// Resolve a handle returned by [`Stack::enter`] for mutation
    pub fn frame_mut(&mut self, handle: FrameHandle) -> StackResult<FrameMut<'_>> {
        let index = self.check_handle(handle)?;
        let record = &mut self.frames[index].record;
        let storage = self
            .arena
            .bytes_mut(record.storage_offset(), record.storage_size);
        Ok(FrameMut { record, storage })
    }

    /// Query the state of `module` from the resolver, without reuse
    pub fn query_module_state(&mut self, module: &dyn Module) -> StackResult<ModuleState> {
        self.modules.query(module)
    }

    /// Enter `function` in a new frame with `storage_size` bytes of zeroed trailing storage.
    ///
    /// May relocate the stack storage: handles issued before this call become
    /// stale if [`Stack::generation`] changes. On failure the frames and storage
    /// are unchanged, although the resolver may already have been queried.
    pub fn enter(
        &mut self,
        function: &Function,
        kind: FrameKind,
        storage_size: usize,
    ) -> StackResult<FrameHandle> {
        self.push_frame(function, kind, storage_size, None)
    }

    /// Like [`Stack::enter`], registering `cleanup` to run exactly once when
    /// the frame is left or the stack is torn down.
    ///
    /// If entering fails, `cleanup` is dropped without being called.
    pub fn enter_with_cleanup<F>(
        &mut self,
        function: &Function,
        kind: FrameKind,
        storage_size: usize,
        cleanup: F,
    ) -> StackResult<FrameHandle>
    where
        F: FnOnce(&mut FrameMut<'_>) + 's,
    {
        self.push_frame(function, kind, storage_size, Some(Box::new(cleanup)))
    }

    fn push_frame(
        &mut self,
        function: &Function,
        kind: FrameKind,
        storage_size: usize,
        cleanup: Option<FrameCleanup<'s>>,
    ) -> StackResult<FrameHandle> {
        if !kind.accepts(function.kind()) {
            return Err(StackError::FrameKindMismatch {
                function: function.to_string(),
                declared: function.kind(),
                requested: kind,
            });
        }

        let size = frame_size(storage_size)?;

        // A failed lookup must not grow the arena
        let parent = self.frames.last().map(|live| {
            (
                live.record.function.module_id(),
                &live.record.module_state,
            )
        });
        let module_state = self.modules.resolve(function.module().as_ref(), parent)?;
        let reservation = self.arena.reserve(size)?;

        self.arena.bytes_mut(reservation.offset, size).fill(0);

        let depth = self.frames.len();
        let serial = self.next_serial;
        self.next_serial += 1;
        self.frames.push(LiveFrame {
            record: FrameRecord {
                kind,
                function: function.clone(),
                module_state,
                pc: 0,
                depth,
                offset: reservation.offset,
                size,
                storage_size,
                serial,
            },
            cleanup,
        });

        if self.flags.trace_execution {
            log::trace!(
                "enter [{}] {} as {} ({} bytes at {}{})",
                depth,
                function,
                kind,
                size,
                reservation.offset,
                if reservation.grew { ", grew" } else { "" }
            );
        }

        Ok(FrameHandle {
            depth,
            offset: reservation.offset,
            serial,
            generation: self.arena.generation(),
        })
    }

    /// Leave the topmost frame, running its cleanup.
    ///
    /// Fails with [`StackError::LeaveOnEmpty`] if no frame is live.
    pub fn leave(&mut self) -> StackResult<()> {
        let live = self.frames.pop().ok_or(StackError::LeaveOnEmpty)?;
        self.retire(live);
        Ok(())
    }

    /// Leave frames until `depth` remain; returns how many were left.
    pub fn unwind_to(&mut self, depth: usize) -> StackResult<usize> {
        if depth > self.frames.len() {
            return Err(StackError::InvalidUnwindTarget {
                target: depth,
                depth: self.frames.len(),
            });
        }

        let mut left = 0;
        while self.frames.len() > depth {
            self.leave()?;
            left += 1;
        }
        Ok(left)
    }

    /// Frames from the topmost down to the base
    pub(crate) fn walk(&self) -> impl Iterator<Item = Frame<'_>> + '_ {
        self.frames.iter().rev().map(move |live| self.view(live))
    }

    fn retire(&mut self, live: LiveFrame<'s>) {
        let LiveFrame {
            mut record,
            cleanup,
        } = live;
        if self.flags.trace_execution {
            log::trace!(
                "leave [{}] {} at pc {}",
                record.depth,
                record.function,
                record.pc
            );
        }

        if let Some(cleanup) = cleanup {
            let storage = self
                .arena
                .bytes_mut(record.storage_offset(), record.storage_size);
            let mut frame = FrameMut {
                record: &mut record,
                storage,
            };
            cleanup(&mut frame);
        }

        self.arena.release(record.size);
    }

    fn view<'a>(&'a self, live: &'a LiveFrame<'s>) -> Frame<'a> {
        let record = &live.record;
        Frame {
            record,
            storage: self
                .arena
                .bytes(record.offset + FRAME_HEADER_SIZE, record.storage_size),
            has_cleanup: live.cleanup.is_some(),
        }
    }

    fn check_handle(&self, handle: FrameHandle) -> StackResult<usize> {
        let live = self.frames.get(handle.depth).is_some_and(|live| {
            live.record.serial == handle.serial && live.record.offset == handle.offset
        });
        if !live || handle.generation != self.arena.generation() {
            return Err(StackError::StaleFrame {
                depth: handle.depth,
            });
        }
        Ok(handle.depth)
    }
}

impl Drop for Stack<'_> {
    fn drop(&mut self) {
        if !self.frames.is_empty() {
            log::debug!(
                "tearing down stack with {} live frame(s)",
                self.frames.len()
            );
        }
        while let Some(live) = self.frames.pop() {
            self.retire(live);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::module::ModuleId;
    use crate::{NullAllocator, SystemAllocator};
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::Arc;

    #[derive(Debug)]
    struct TestModule;

    impl Module for TestModule {
        fn id(&self) -> ModuleId {
            ModuleId(1)
        }
        fn name(&self) -> &str {
            "test"
        }
    }

    fn resolver(module: &dyn Module) -> StackResult<ModuleState> {
        Ok(ModuleState::new(module.id()))
    }

    fn function(kind: FrameKind) -> Function {
        Function::new(Arc::new(TestModule), 0, kind)
    }

    #[test]
    fn test_empty_stack() {
        let stack = Stack::allocate(InvocationFlags::default(), resolver, SystemAllocator).unwrap();
        assert!(stack.current().is_none());
        assert!(stack.parent().is_none());
        assert_eq!(stack.depth(), 0);
        assert_eq!(stack.capacity(), DEFAULT_STACK_SIZE);
    }

    #[test]
    fn test_enter_initializes_frame() {
        let mut stack =
            Stack::allocate(InvocationFlags::default(), resolver, SystemAllocator).unwrap();
        let f = function(FrameKind::Bytecode);
        stack.enter(&f, FrameKind::Bytecode, 24).unwrap();

        let frame = stack.current().unwrap();
        assert_eq!(frame.depth(), 0);
        assert_eq!(frame.pc(), 0);
        assert_eq!(frame.kind(), FrameKind::Bytecode);
        assert_eq!(frame.function(), &f);
        assert_eq!(frame.storage(), &[0u8; 24]);
        assert!(stack.parent().is_none());
    }

    #[test]
    fn test_trailing_storage_is_zeroed_on_reuse() {
        let mut stack =
            Stack::allocate(InvocationFlags::default(), resolver, SystemAllocator).unwrap();
        let f = function(FrameKind::Native);
        stack.enter(&f, FrameKind::Native, 16).unwrap();
        stack
            .current_mut()
            .unwrap()
            .storage_mut()
            .copy_from_slice(&[0xAB; 16]);
        stack.leave().unwrap();

        stack.enter(&f, FrameKind::Native, 16).unwrap();
        assert_eq!(stack.current().unwrap().storage(), &[0u8; 16]);
    }

    #[test]
    fn test_leave_on_empty() {
        let mut stack =
            Stack::allocate(InvocationFlags::default(), resolver, SystemAllocator).unwrap();
        let err = stack.leave().unwrap_err();
        assert!(matches!(err, StackError::LeaveOnEmpty));
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_kind_mismatch_leaves_stack_untouched() {
        let mut stack =
            Stack::allocate(InvocationFlags::default(), resolver, SystemAllocator).unwrap();
        let f = function(FrameKind::Bytecode);
        let err = stack.enter(&f, FrameKind::Native, 0).unwrap_err();
        assert!(matches!(
            err,
            StackError::FrameKindMismatch {
                declared: FrameKind::Bytecode,
                requested: FrameKind::Native,
                ..
            }
        ));
        assert_eq!(stack.depth(), 0);
        assert_eq!(stack.used(), 0);
    }

    #[test]
    fn test_resolver_failure_rolls_back() {
        let failing = |_: &dyn Module| -> StackResult<ModuleState> {
            Err(StackError::resolver("no state slots left"))
        };
        let mut stack = Stack::allocate(InvocationFlags::default(), failing, SystemAllocator).unwrap();
        let calls = Rc::new(RefCell::new(0));
        let counter = calls.clone();

        let err = stack
            .enter_with_cleanup(&function(FrameKind::Native), FrameKind::Native, 32, move |_| {
                *counter.borrow_mut() += 1;
            })
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ResolverFailure);
        assert_eq!(stack.depth(), 0);
        assert_eq!(stack.used(), 0);
        drop(stack);
        assert_eq!(*calls.borrow(), 0);
    }

    #[test]
    fn test_set_pc_through_handle() {
        let mut stack =
            Stack::allocate(InvocationFlags::default(), resolver, SystemAllocator).unwrap();
        let f = function(FrameKind::Bytecode);
        let handle = stack.enter(&f, FrameKind::Bytecode, 0).unwrap();
        stack.frame_mut(handle).unwrap().set_pc(0x40);
        assert_eq!(stack.frame(handle).unwrap().pc(), 0x40);
    }

    #[test]
    fn test_handle_stale_after_leave() {
        let mut stack =
            Stack::allocate(InvocationFlags::default(), resolver, SystemAllocator).unwrap();
        let f = function(FrameKind::Native);
        let first = stack.enter(&f, FrameKind::Native, 0).unwrap();
        stack.leave().unwrap();
        let second = stack.enter(&f, FrameKind::Native, 0).unwrap();

        assert_eq!(first.offset(), second.offset());
        assert!(matches!(
            stack.frame(first),
            Err(StackError::StaleFrame { depth: 0 })
        ));
        assert!(stack.frame(second).is_ok());
    }

    #[test]
    fn test_unwind_to() {
        let mut stack =
            Stack::allocate(InvocationFlags::default(), resolver, SystemAllocator).unwrap();
        let f = function(FrameKind::Native);
        for _ in 0..5 {
            stack.enter(&f, FrameKind::Native, 8).unwrap();
        }

        assert!(matches!(
            stack.unwind_to(6),
            Err(StackError::InvalidUnwindTarget {
                target: 6,
                depth: 5
            })
        ));
        assert_eq!(stack.unwind_to(2).unwrap(), 3);
        assert_eq!(stack.depth(), 2);
        assert_eq!(stack.unwind_to(2).unwrap(), 0);
        assert_eq!(stack.unwind_to(0).unwrap(), 2);
        assert!(stack.is_empty());
        assert_eq!(stack.used(), 0);
    }

    #[test]
    fn test_with_storage_too_small() {
        let mut storage = [0u8; 1000];
        let result = Stack::with_storage(
            &mut storage,
            InvocationFlags::default(),
            resolver,
            NullAllocator,
        );
        assert_eq!(
            result.err().map(|e| e.kind()),
            Some(ErrorKind::InvalidArgument)
        );
    }

    #[test]
    fn test_from_config_without_growth() {
        let config: StackConfig = toml::from_str(
            r#"
[stack]
initial_size = 2048
growth = "none"

[invocation]
trace_execution = true
"#,
        )
        .unwrap();
        let mut stack = Stack::from_config(&config, resolver).unwrap();
        assert!(stack.flags().trace_execution);
        assert_eq!(stack.capacity(), 2048);
        assert_eq!(stack.max_size(), 2048);

        let f = function(FrameKind::Native);
        let err = stack.enter(&f, FrameKind::Native, 4096).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
        assert_eq!(stack.capacity(), 2048);
    }
}
