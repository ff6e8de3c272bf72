//! Storage arena backing the frame chain
//!
//! A single contiguous byte region that frames are bump-allocated from.
//! The region is either borrowed from the caller or owned and obtained from
//! an [`Allocator`]. When a reservation does not fit and the allocator allows
//! it, the arena moves to a larger owned buffer and bumps its generation.
//!
//! ## Layout
//!
//! ```text
//! [frame 0 .....][frame 1 ...][frame 2 .........]|<- free ->|
//!  ^ offset 0                                     ^ used     ^ capacity
//! ```
//!
//! Offsets survive growth; anything derived from the old buffer does not.

use crate::error::{StackError, StackResult};
use std::mem;

pub use vm_stack_config::{DEFAULT_STACK_SIZE, MAX_STACK_SIZE, MIN_STACK_SIZE};

/// Source of owned stack storage
pub trait Allocator {
    /// Allocate a zero-filled buffer of exactly `size` bytes
    fn allocate(&mut self, size: usize) -> StackResult<Vec<u8>>;

    /// Take back a buffer previously returned by `allocate`
    fn release(&mut self, buffer: Vec<u8>) {
        drop(buffer);
    }

    /// Whether this allocator can ever satisfy a request.
    /// Arenas with a non-growing allocator fail reservations without trying to grow.
    fn can_grow(&self) -> bool {
        true
    }
}

/// Allocator that never provides memory; disables growth
#[derive(Debug, Clone, Copy, Default)]
pub struct NullAllocator;

impl Allocator for NullAllocator {
    fn allocate(&mut self, size: usize) -> StackResult<Vec<u8>> {
        Err(StackError::AllocationFailed { size })
    }

    fn can_grow(&self) -> bool {
        false
    }
}

/// Allocator backed by the global heap
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemAllocator;

impl Allocator for SystemAllocator {
    fn allocate(&mut self, size: usize) -> StackResult<Vec<u8>> {
        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(size)
            .map_err(|_| StackError::AllocationFailed { size })?;
        buffer.resize(size, 0);
        Ok(buffer)
    }
}

enum Backing<'s> {
    Borrowed(&'s mut [u8]),
    Owned(Vec<u8>),
}

impl Backing<'_> {
    fn as_slice(&self) -> &[u8] {
        match self {
            Backing::Borrowed(storage) => storage,
            Backing::Owned(buffer) => buffer,
        }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            Backing::Borrowed(storage) => storage,
            Backing::Owned(buffer) => buffer,
        }
    }
}

/// Location of a successful reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    /// Offset of the reserved region from the start of the arena
    pub offset: usize,
    /// True if the arena moved to new storage to satisfy the request
    pub grew: bool,
}

/// Bump-allocated byte region with bounded growth
pub struct Arena<'s> {
    backing: Backing<'s>,
    /// High-water mark
    used: usize,
    max_size: usize,
    /// Bumped on every relocation
    generation: u64,
    allocator: Box<dyn Allocator + 's>,
}

impl<'s> Arena<'s> {
    /// Create an arena over caller-supplied storage.
    ///
    /// `allocator` is only used to grow beyond `storage`; pass [`NullAllocator`]
    /// to forbid growth.
    pub fn borrowed(
        storage: &'s mut [u8],
        max_size: usize,
        allocator: Box<dyn Allocator + 's>,
    ) -> StackResult<Self> {
        if storage.len() < MIN_STACK_SIZE {
            return Err(StackError::StorageTooSmall {
                size: storage.len(),
                minimum: MIN_STACK_SIZE,
            });
        }
        check_max_size(max_size)?;

        Ok(Self {
            backing: Backing::Borrowed(storage),
            used: 0,
            max_size,
            generation: 0,
            allocator,
        })
    }

    /// Create an arena that owns `initial_size` bytes obtained from `allocator`.
    pub fn allocate(
        initial_size: usize,
        max_size: usize,
        mut allocator: Box<dyn Allocator + 's>,
    ) -> StackResult<Self> {
        check_max_size(max_size)?;
        if initial_size < MIN_STACK_SIZE || initial_size > max_size {
            return Err(StackError::InvalidLimits {
                reason: format!(
                    "initial size {} must be between {} and {}",
                    initial_size, MIN_STACK_SIZE, max_size
                ),
            });
        }

        let buffer = allocator.allocate(initial_size)?;
        if buffer.len() < initial_size {
            return Err(StackError::AllocationFailed { size: initial_size });
        }

        Ok(Self {
            backing: Backing::Owned(buffer),
            used: 0,
            max_size,
            generation: 0,
            allocator,
        })
    }

    /// Bytes currently available without growing
    pub fn capacity(&self) -> usize {
        self.backing.as_slice().len()
    }

    /// High-water mark
    pub fn used(&self) -> usize {
        self.used
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Relocation counter; changes whenever previously derived locations become invalid
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether the arena has moved off caller storage (or started off it)
    pub fn is_owned(&self) -> bool {
        matches!(self.backing, Backing::Owned(_))
    }

    /// Reserve `size` bytes at the high-water mark, growing if required and permitted.
    ///
    /// On failure nothing changes.
    pub fn reserve(&mut self, size: usize) -> StackResult<Reservation> {
        let required = self
            .used
            .checked_add(size)
            .ok_or(StackError::GrowthLimit {
                required: usize::MAX,
                max: self.max_size,
            })?;

        let mut grew = false;
        if required > self.capacity() {
            if !self.allocator.can_grow() {
                return Err(StackError::ArenaExhausted {
                    requested: size,
                    used: self.used,
                    capacity: self.capacity(),
                });
            }
            self.grow(required)?;
            grew = true;
        }

        let offset = self.used;
        self.used = required;
        Ok(Reservation { offset, grew })
    }

    /// Move the high-water mark back by `size` bytes. Never relocates.
    pub fn release(&mut self, size: usize) {
        debug_assert!(size <= self.used, "release past the arena base");
        self.used = self.used.saturating_sub(size);
    }

    pub fn bytes(&self, offset: usize, len: usize) -> &[u8] {
        &self.backing.as_slice()[offset..offset + len]
    }

    pub fn bytes_mut(&mut self, offset: usize, len: usize) -> &mut [u8] {
        &mut self.backing.as_mut_slice()[offset..offset + len]
    }

    fn grow(&mut self, required: usize) -> StackResult<()> {
        if required > self.max_size {
            log::warn!(
                "stack growth refused: {} bytes required, maximum is {}",
                required,
                self.max_size
            );
            return Err(StackError::GrowthLimit {
                required,
                max: self.max_size,
            });
        }

        let old_capacity = self.capacity();
        let new_capacity = old_capacity
            .saturating_mul(2)
            .max(required)
            .min(self.max_size);

        let mut buffer = self.allocator.allocate(new_capacity)?;
        if buffer.len() < new_capacity {
            self.allocator.release(buffer);
            return Err(StackError::AllocationFailed { size: new_capacity });
        }
        buffer[..self.used].copy_from_slice(&self.backing.as_slice()[..self.used]);

        if let Backing::Owned(old) = mem::replace(&mut self.backing, Backing::Owned(buffer)) {
            self.allocator.release(old);
        }
        self.generation += 1;

        log::debug!(
            "stack storage grew from {} to {} bytes ({} in use, generation {})",
            old_capacity,
            new_capacity,
            self.used,
            self.generation
        );
        Ok(())
    }
}

impl Drop for Arena<'_> {
    fn drop(&mut self) {
        if let Backing::Owned(buffer) = &mut self.backing {
            let buffer = mem::take(buffer);
            self.allocator.release(buffer);
        }
    }
}

fn check_max_size(max_size: usize) -> StackResult<()> {
    if !(MIN_STACK_SIZE..=MAX_STACK_SIZE).contains(&max_size) {
        return Err(StackError::InvalidLimits {
            reason: format!(
                "maximum size {} must be between {} and {}",
                max_size, MIN_STACK_SIZE, MAX_STACK_SIZE
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::cell::Cell;
    use std::rc::Rc;

    /// Counts live bytes handed out by the system allocator
    struct Tracking {
        live: Rc<Cell<usize>>,
    }

    impl Allocator for Tracking {
        fn allocate(&mut self, size: usize) -> StackResult<Vec<u8>> {
            self.live.set(self.live.get() + size);
            SystemAllocator.allocate(size)
        }

        fn release(&mut self, buffer: Vec<u8>) {
            self.live.set(self.live.get() - buffer.len());
        }
    }

    #[test]
    fn test_borrowed_rejects_small_storage() {
        let mut storage = [0u8; 512];
        let result = Arena::borrowed(&mut storage, MAX_STACK_SIZE, Box::new(NullAllocator));
        assert!(matches!(
            result,
            Err(StackError::StorageTooSmall {
                size: 512,
                minimum: 1024
            })
        ));
    }

    #[test]
    fn test_reserve_and_release() {
        let mut storage = vec![0u8; 1024];
        let mut arena =
            Arena::borrowed(&mut storage, MAX_STACK_SIZE, Box::new(NullAllocator)).unwrap();

        let a = arena.reserve(100).unwrap();
        let b = arena.reserve(200).unwrap();
        assert_eq!(a, Reservation { offset: 0, grew: false });
        assert_eq!(b.offset, 100);
        assert_eq!(arena.used(), 300);

        arena.release(200);
        assert_eq!(arena.used(), 100);
        assert_eq!(arena.reserve(50).unwrap().offset, 100);
    }

    #[test]
    fn test_no_growth_allocator_exhausts() {
        let mut storage = vec![0u8; 1024];
        let mut arena =
            Arena::borrowed(&mut storage, MAX_STACK_SIZE, Box::new(NullAllocator)).unwrap();
        arena.reserve(1000).unwrap();

        let err = arena.reserve(100).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
        assert_eq!(arena.used(), 1000);
        assert_eq!(arena.capacity(), 1024);
        assert_eq!(arena.generation(), 0);
    }

    #[test]
    fn test_growth_doubles_and_copies() {
        let mut storage = vec![0u8; 1024];
        let mut arena =
            Arena::borrowed(&mut storage, MAX_STACK_SIZE, Box::new(SystemAllocator)).unwrap();
        let first = arena.reserve(16).unwrap();
        arena
            .bytes_mut(first.offset, 16)
            .copy_from_slice(&[7u8; 16]);

        let second = arena.reserve(1200).unwrap();
        assert!(second.grew);
        assert_eq!(second.offset, 16);
        assert_eq!(arena.capacity(), 2048);
        assert_eq!(arena.generation(), 1);
        assert!(arena.is_owned());
        assert_eq!(arena.bytes(0, 16), &[7u8; 16]);
    }

    #[test]
    fn test_growth_takes_exact_size_when_larger_than_double() {
        let mut arena =
            Arena::allocate(1024, MAX_STACK_SIZE, Box::new(SystemAllocator)).unwrap();
        arena.reserve(5000).unwrap();
        assert_eq!(arena.capacity(), 5000);
    }

    #[test]
    fn test_growth_capped_at_max() {
        let mut arena = Arena::allocate(4096, 6000, Box::new(SystemAllocator)).unwrap();
        arena.reserve(4097).unwrap();
        assert_eq!(arena.capacity(), 6000);

        let err = arena.reserve(2000).unwrap_err();
        assert!(matches!(
            err,
            StackError::GrowthLimit {
                required: 6097,
                max: 6000
            }
        ));
        assert_eq!(arena.used(), 4097);
    }

    #[test]
    fn test_allocate_with_null_allocator_fails() {
        let result = Arena::allocate(DEFAULT_STACK_SIZE, MAX_STACK_SIZE, Box::new(NullAllocator));
        assert_eq!(
            result.err().map(|e| e.kind()),
            Some(ErrorKind::ResourceExhausted)
        );
    }

    #[test]
    fn test_allocate_rejects_bad_limits() {
        let too_small = Arena::allocate(512, MAX_STACK_SIZE, Box::new(SystemAllocator));
        let too_large = Arena::allocate(4096, MAX_STACK_SIZE + 1, Box::new(SystemAllocator));
        assert!(matches!(too_small, Err(StackError::InvalidLimits { .. })));
        assert!(matches!(too_large, Err(StackError::InvalidLimits { .. })));
    }

    #[test]
    fn test_owned_storage_returned_to_allocator() {
        let live = Rc::new(Cell::new(0));
        {
            let mut arena = Arena::allocate(
                1024,
                MAX_STACK_SIZE,
                Box::new(Tracking { live: live.clone() }),
            )
            .unwrap();
            assert_eq!(live.get(), 1024);
            arena.reserve(3000).unwrap();
            // Old buffer released, new one live
            assert_eq!(live.get(), 3000);
        }
        assert_eq!(live.get(), 0);
    }
}
