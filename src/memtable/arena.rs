//! Memory arena for efficient allocation.
//!
//! The arena provides fast, bump-pointer allocation for data that is freed
//! all at once (like when a MemTable is discarded). Each slab is carved
//! from both ends: aligned allocations advance from the low end, unaligned
//! allocations retreat from the high end, so alignment slop is only paid
//! on the aligned side.
//!
//! The arena is not thread-safe; callers that share one across threads
//! must provide their own exclusion (the MemTable wraps its arena in a
//! short-critical-section mutex).

use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::cell::{Cell, UnsafeCell};
use std::ptr::NonNull;

/// Size of the bootstrap slab carved at construction, so first allocations
/// skip the fallback path.
pub const INLINE_SIZE: usize = 2048;

/// Smallest permitted slab size.
pub const MIN_BLOCK_SIZE: usize = 4 * 1024;

/// Largest permitted slab size.
pub const MAX_BLOCK_SIZE: usize = 2 << 30;

/// Alignment unit for aligned allocations.
const ALIGN_UNIT: usize = std::mem::size_of::<usize>() * 2;

/// Clamp and round a requested slab size so it is in
/// `[MIN_BLOCK_SIZE, MAX_BLOCK_SIZE]` and a multiple of the alignment
/// unit.
pub fn optimize_block_size(block_size: usize) -> usize {
    let mut size = block_size.clamp(MIN_BLOCK_SIZE, MAX_BLOCK_SIZE);
    let rem = size % ALIGN_UNIT;
    if rem != 0 {
        size += ALIGN_UNIT - rem;
    }
    size
}

/// One heap slab and the layout it was allocated with.
struct Slab {
    ptr: NonNull<u8>,
    layout: Layout,
}

/// Bump-pointer arena.
///
/// Returned pointers stay valid until the arena is dropped; all slabs are
/// released together at that point.
pub struct Arena {
    /// Slab size for regular allocations.
    block_size: usize,
    /// Every slab allocated so far, including the bootstrap slab.
    blocks: UnsafeCell<Vec<Slab>>,
    /// Count of oversize allocations given dedicated slabs.
    irregular_block_num: Cell<usize>,
    /// Low-end bump pointer of the active slab (aligned allocations).
    aligned_alloc_ptr: Cell<*mut u8>,
    /// High-end bump pointer of the active slab (unaligned allocations).
    unaligned_alloc_ptr: Cell<*mut u8>,
    /// Unused bytes left between the two pointers.
    alloc_bytes_remaining: Cell<usize>,
    /// Total slab bytes allocated so far.
    blocks_memory: Cell<usize>,
    /// Huge-page hint recorded at construction. The portable build always
    /// takes the normal-slab path, which the contract permits: huge-page
    /// failures fall back silently.
    huge_page_size: usize,
}

// The arena is single-owner; Sync is deliberately not implemented.
unsafe impl Send for Arena {}

impl Arena {
    /// Create an arena with the default slab size.
    pub fn new() -> Self {
        Self::with_block_size(MIN_BLOCK_SIZE)
    }

    /// Create an arena with the given slab size (clamped and rounded).
    pub fn with_block_size(block_size: usize) -> Self {
        Self::with_options(block_size, 0)
    }

    /// Create an arena with a slab size and a huge-page hint.
    pub fn with_options(block_size: usize, huge_page_size: usize) -> Self {
        let arena = Self {
            block_size: optimize_block_size(block_size),
            blocks: UnsafeCell::new(Vec::new()),
            irregular_block_num: Cell::new(0),
            aligned_alloc_ptr: Cell::new(std::ptr::null_mut()),
            unaligned_alloc_ptr: Cell::new(std::ptr::null_mut()),
            alloc_bytes_remaining: Cell::new(0),
            blocks_memory: Cell::new(0),
            huge_page_size,
        };

        // Bootstrap slab: first allocations bump straight away.
        let head = arena.allocate_new_block(INLINE_SIZE);
        arena.aligned_alloc_ptr.set(head);
        arena
            .unaligned_alloc_ptr
            .set(unsafe { head.add(INLINE_SIZE) });
        arena.alloc_bytes_remaining.set(INLINE_SIZE);
        arena
    }

    /// Allocate `bytes` with no alignment guarantee.
    ///
    /// The returned pointer is valid until the arena is dropped. The
    /// memory is uninitialized.
    pub fn allocate(&self, bytes: usize) -> *mut u8 {
        // 0-byte allocations would make the return value ambiguous.
        assert!(bytes > 0);

        if bytes <= self.alloc_bytes_remaining.get() {
            let ptr = unsafe { self.unaligned_alloc_ptr.get().sub(bytes) };
            self.unaligned_alloc_ptr.set(ptr);
            self.alloc_bytes_remaining
                .set(self.alloc_bytes_remaining.get() - bytes);
            return ptr;
        }

        self.allocate_fallback(bytes, false)
    }

    /// Allocate `bytes` aligned to the arena's alignment unit.
    ///
    /// `huge_page_hint` requests huge-page backing for the slab; when huge
    /// pages are unavailable the allocation silently comes from a normal
    /// slab.
    pub fn allocate_aligned(&self, bytes: usize, huge_page_hint: usize) -> *mut u8 {
        assert!(bytes > 0);
        let _ = huge_page_hint.max(self.huge_page_size);

        let current = self.aligned_alloc_ptr.get() as usize;
        let current_mod = current & (ALIGN_UNIT - 1);
        let slop = if current_mod == 0 {
            0
        } else {
            ALIGN_UNIT - current_mod
        };
        let needed = bytes + slop;

        if needed <= self.alloc_bytes_remaining.get() {
            let result = unsafe { self.aligned_alloc_ptr.get().add(slop) };
            self.aligned_alloc_ptr.set(unsafe { result.add(bytes) });
            self.alloc_bytes_remaining
                .set(self.alloc_bytes_remaining.get() - needed);
            debug_assert_eq!(result as usize & (ALIGN_UNIT - 1), 0);
            return result;
        }

        // Fresh slabs start aligned.
        self.allocate_fallback(bytes, true)
    }

    /// Allocate and copy bytes.
    pub fn allocate_copy(&self, data: &[u8]) -> *mut u8 {
        let ptr = self.allocate(data.len().max(1));
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len());
        }
        ptr
    }

    /// Slow path: carve from a fresh slab.
    fn allocate_fallback(&self, bytes: usize, aligned: bool) -> *mut u8 {
        if bytes > self.block_size / 4 {
            // Oversize: dedicated slab, so the active slab's remaining
            // space is not wasted.
            self.irregular_block_num
                .set(self.irregular_block_num.get() + 1);
            return self.allocate_new_block(bytes);
        }

        // The remaining space of the old slab is abandoned.
        let head = self.allocate_new_block(self.block_size);
        self.alloc_bytes_remaining.set(self.block_size - bytes);
        if aligned {
            self.aligned_alloc_ptr.set(unsafe { head.add(bytes) });
            self.unaligned_alloc_ptr
                .set(unsafe { head.add(self.block_size) });
            head
        } else {
            self.aligned_alloc_ptr.set(head);
            let ptr = unsafe { head.add(self.block_size - bytes) };
            self.unaligned_alloc_ptr.set(ptr);
            ptr
        }
    }

    /// Allocate a raw slab and record it for teardown.
    fn allocate_new_block(&self, size: usize) -> *mut u8 {
        let layout = Layout::from_size_align(size, ALIGN_UNIT).expect("invalid slab layout");

        let ptr = unsafe { alloc(layout) };
        let Some(non_null) = NonNull::new(ptr) else {
            handle_alloc_error(layout);
        };

        unsafe {
            (*self.blocks.get()).push(Slab {
                ptr: non_null,
                layout,
            });
        }

        self.blocks_memory.set(self.blocks_memory.get() + size);
        ptr
    }

    /// Estimate of total memory held by the arena: slab bytes plus slab
    /// bookkeeping, minus space not yet handed out.
    pub fn approximate_memory_usage(&self) -> usize {
        let vec_overhead =
            unsafe { (*self.blocks.get()).capacity() } * std::mem::size_of::<Slab>();
        self.blocks_memory.get() + vec_overhead - self.alloc_bytes_remaining.get()
    }

    /// Total slab bytes allocated.
    pub fn memory_allocated_bytes(&self) -> usize {
        self.blocks_memory.get()
    }

    /// Bytes carved from slabs but not yet handed out.
    pub fn allocated_and_unused(&self) -> usize {
        self.alloc_bytes_remaining.get()
    }

    /// Number of oversize allocations served by dedicated slabs.
    pub fn irregular_block_num(&self) -> usize {
        self.irregular_block_num.get()
    }

    /// Effective slab size.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// True while only the bootstrap slab has been allocated.
    pub fn is_in_inline_block(&self) -> bool {
        unsafe { (*self.blocks.get()).len() <= 1 }
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        let blocks = unsafe { &mut *self.blocks.get() };
        for slab in blocks.drain(..) {
            unsafe {
                dealloc(slab.ptr.as_ptr(), slab.layout);
            }
        }
    }
}
