//! Call frame implementation for function calls
//!
//! Each `enter` creates one frame: a typed record kept by the stack plus a
//! region of the arena holding the frame header and the caller-sized
//! trailing storage.
//!
//! ## Arena Layout Example
//!
//! ```text
//! Stack with two frames (external entry called bytecode "add" with 4 registers):
//!
//! [header 64][pad] | [header 64][r0][r1][r2][r3]
//!  ^                ^           ^
//!  frame 0 offset   frame 1     frame 1 storage
//! ```
//!
//! Views ([`Frame`], [`FrameMut`]) borrow the stack and cannot outlive the
//! next `enter`. [`FrameHandle`] is a plain token that can be kept across
//! calls and is checked when resolved.

use crate::error::{StackError, StackResult};
use crate::module::{FrameKind, Function, ModuleState};

/// Bytes reserved in the arena for every frame ahead of its trailing storage
pub const FRAME_HEADER_SIZE: usize = 64;

/// Frame sizes are rounded up to this many bytes
pub const FRAME_ALIGNMENT: usize = 16;

/// Runs exactly once when a frame is left or torn down, before its storage is reclaimed.
///
/// May borrow anything that outlives the stack.
pub type FrameCleanup<'s> = Box<dyn FnOnce(&mut FrameMut<'_>) + 's>;

/// Total arena bytes for a frame with `storage_size` trailing bytes
pub fn frame_size(storage_size: usize) -> StackResult<usize> {
    FRAME_HEADER_SIZE
        .checked_add(storage_size)
        .and_then(|size| size.checked_add(FRAME_ALIGNMENT - 1))
        .map(|size| size & !(FRAME_ALIGNMENT - 1))
        .ok_or(StackError::GrowthLimit {
            required: usize::MAX,
            max: crate::arena::MAX_STACK_SIZE,
        })
}

pub(crate) struct FrameRecord {
    pub(crate) kind: FrameKind,
    pub(crate) function: Function,
    pub(crate) module_state: ModuleState,
    pub(crate) pc: u64,
    pub(crate) depth: usize,
    /// Start of the frame in the arena
    pub(crate) offset: usize,
    /// Aligned total size, header included
    pub(crate) size: usize,
    /// Trailing storage requested by the caller
    pub(crate) storage_size: usize,
    /// Distinguishes frames that reuse the same offset and depth
    pub(crate) serial: u64,
}

impl FrameRecord {
    pub(crate) fn storage_offset(&self) -> usize {
        self.offset + FRAME_HEADER_SIZE
    }
}

/// Token naming a frame across calls
///
/// Resolving a handle fails with [`StackError::StaleFrame`] once the frame has
/// been left or the arena has grown since the handle was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameHandle {
    pub(crate) depth: usize,
    pub(crate) offset: usize,
    pub(crate) serial: u64,
    pub(crate) generation: u64,
}

impl FrameHandle {
    /// Depth of the frame; stable across growth
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Arena offset of the frame; stable across growth
    pub fn offset(&self) -> usize {
        self.offset
    }
}

/// Read-only view of a live frame
pub struct Frame<'a> {
    pub(crate) record: &'a FrameRecord,
    pub(crate) storage: &'a [u8],
    pub(crate) has_cleanup: bool,
}

impl<'a> Frame<'a> {
    pub fn kind(&self) -> FrameKind {
        self.record.kind
    }

    pub fn function(&self) -> &'a Function {
        &self.record.function
    }

    /// State of the function's module, cached when the frame was entered
    pub fn module_state(&self) -> &'a ModuleState {
        &self.record.module_state
    }

    /// Program counter. A byte offset for bytecode frames, opaque otherwise.
    pub fn pc(&self) -> u64 {
        self.record.pc
    }

    pub fn depth(&self) -> usize {
        self.record.depth
    }

    /// Arena offset of the frame
    pub fn offset(&self) -> usize {
        self.record.offset
    }

    /// Trailing storage requested at enter
    pub fn storage(&self) -> &'a [u8] {
        self.storage
    }

    pub fn registers(&self) -> Registers<'a> {
        Registers {
            bytes: self.storage,
        }
    }

    pub fn has_cleanup(&self) -> bool {
        self.has_cleanup
    }
}

/// Mutable view of a live frame
pub struct FrameMut<'a> {
    pub(crate) record: &'a mut FrameRecord,
    pub(crate) storage: &'a mut [u8],
}

impl FrameMut<'_> {
    pub fn kind(&self) -> FrameKind {
        self.record.kind
    }

    pub fn function(&self) -> &Function {
        &self.record.function
    }

    pub fn module_state(&self) -> &ModuleState {
        &self.record.module_state
    }

    pub fn pc(&self) -> u64 {
        self.record.pc
    }

    pub fn set_pc(&mut self, pc: u64) {
        self.record.pc = pc;
    }

    pub fn depth(&self) -> usize {
        self.record.depth
    }

    pub fn storage(&self) -> &[u8] {
        &*self.storage
    }

    pub fn storage_mut(&mut self) -> &mut [u8] {
        &mut *self.storage
    }

    pub fn registers(&self) -> Registers<'_> {
        Registers {
            bytes: &*self.storage,
        }
    }

    pub fn registers_mut(&mut self) -> RegistersMut<'_> {
        RegistersMut {
            bytes: &mut *self.storage,
        }
    }
}

/// Trailing storage viewed as a little-endian register file.
///
/// Registers are 32-bit slots; i64 register `n` spans i32 slots `n` and `n + 1`.
#[derive(Clone, Copy)]
pub struct Registers<'a> {
    bytes: &'a [u8],
}

impl Registers<'_> {
    /// Number of 32-bit slots
    pub fn len(&self) -> usize {
        self.bytes.len() / 4
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn i32(&self, ordinal: usize) -> Option<i32> {
        read_slot(self.bytes, ordinal).map(i32::from_le_bytes)
    }

    pub fn i64(&self, ordinal: usize) -> Option<i64> {
        read_slot(self.bytes, ordinal).map(i64::from_le_bytes)
    }
}

/// Writable register file
pub struct RegistersMut<'a> {
    bytes: &'a mut [u8],
}

impl RegistersMut<'_> {
    pub fn len(&self) -> usize {
        self.bytes.len() / 4
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn i32(&self, ordinal: usize) -> Option<i32> {
        read_slot(self.bytes, ordinal).map(i32::from_le_bytes)
    }

    pub fn i64(&self, ordinal: usize) -> Option<i64> {
        read_slot(self.bytes, ordinal).map(i64::from_le_bytes)
    }

    /// Returns false if the register is out of range
    pub fn set_i32(&mut self, ordinal: usize, value: i32) -> bool {
        write_slot(self.bytes, ordinal, value.to_le_bytes())
    }

    /// Returns false if the register is out of range
    pub fn set_i64(&mut self, ordinal: usize, value: i64) -> bool {
        write_slot(self.bytes, ordinal, value.to_le_bytes())
    }
}

fn slot_range(ordinal: usize, width: usize) -> Option<std::ops::Range<usize>> {
    let start = ordinal.checked_mul(4)?;
    Some(start..start.checked_add(width)?)
}

fn read_slot<const N: usize>(bytes: &[u8], ordinal: usize) -> Option<[u8; N]> {
    bytes.get(slot_range(ordinal, N)?)?.try_into().ok()
}

fn write_slot<const N: usize>(bytes: &mut [u8], ordinal: usize, value: [u8; N]) -> bool {
    match slot_range(ordinal, N).and_then(|range| bytes.get_mut(range)) {
        Some(slot) => {
            slot.copy_from_slice(&value);
            true
        }
        None => false,
    }
}
