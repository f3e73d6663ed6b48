//! [`Segment`] trait and structures that implement it.
//!
//! A segment is the allocator's backing store: a single contiguous region
//! of raw bytes with fixed bounds that can only grow monotonically, in the
//! manner of the classic `sbrk` primitive. The allocators in
//! [`par_malloc::allocators`](crate::allocators) are generic over their
//! segment so that the same engine can run on a process heap in production
//! and on a plain buffer in tests.

use crate::classes::PAGE_SIZE;
use crate::util::checked_add;

use core::ptr::{null_mut, NonNull};
use core::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Mutex;

use tracing::{debug, error};

/// A trait for types that act as a bounded, monotonically growing
/// byte region.
///
/// # Safety
/// Implementors must guarantee that after a successful [`init`](Segment::init):
/// * `lo` is page-aligned and `lo`/`hi` never change,
/// * every successful `sbrk(n)` returns a region of `n` bytes inside
///   `[lo, hi)` that no previous call has returned,
/// * `sbrk` calls are serialized against each other (the growth lock
///   lives inside the segment).
pub unsafe trait Segment {
    /// Prepares the segment for use. Idempotent; returns `Err(())` if the
    /// underlying storage can not be obtained.
    fn init(&self) -> Result<(), ()>;

    /// Grows the used part of the segment by `size` bytes and returns a
    /// pointer to the start of the newly usable region, or `None` if the
    /// segment is exhausted or uninitialized.
    fn sbrk(&self, size: usize) -> Option<NonNull<u8>>;

    /// The inclusive lower bound of the segment. Null before `init`.
    fn lo(&self) -> *mut u8;

    /// The exclusive upper bound of the segment. Null before `init`.
    fn hi(&self) -> *mut u8;
}

/// The break pointer, boxed so the growth mutex can own it.
struct Brk(*mut u8);

// The pointer only ever refers to the segment's own region, which lives for
// the whole process; handing it between threads is fine.
unsafe impl Send for Brk {}

/// A segment backed by one fixed anonymous mapping.
///
/// The whole region is reserved up front with `mmap` on the first call to
/// [`init`](Segment::init) and paged in lazily by the kernel; `sbrk` just
/// bumps a pointer under the growth lock.
pub struct MmapSegment {
    capacity: usize,
    lo: AtomicPtr<u8>,
    hi: AtomicPtr<u8>,
    brk: Mutex<Brk>,
}

impl MmapSegment {
    /// Creates a segment that will reserve `capacity` bytes when
    /// initialized. `capacity` is rounded up to a whole number of pages.
    #[inline(always)]
    pub const fn new(capacity: usize) -> Self {
        MmapSegment {
            capacity,
            lo: AtomicPtr::new(null_mut()),
            hi: AtomicPtr::new(null_mut()),
            brk: Mutex::new(Brk(null_mut())),
        }
    }
}

unsafe impl Segment for MmapSegment {
    fn init(&self) -> Result<(), ()> {
        let mut brk = self.brk.lock().unwrap();
        if !self.lo.load(Ordering::Acquire).is_null() {
            return Ok(());
        }

        let capacity = crate::util::align_up(self.capacity, PAGE_SIZE);
        let raw = unsafe {
            libc::mmap(
                null_mut(),
                capacity,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            error!(capacity, "Could not map the heap segment.");
            return Err(());
        }

        let lo = raw as *mut u8;
        debug_assert_eq!(lo as usize % PAGE_SIZE, 0);
        brk.0 = lo;
        self.hi.store(lo.wrapping_add(capacity), Ordering::Release);
        self.lo.store(lo, Ordering::Release);
        debug!(?lo, capacity, "Heap segment mapped.");
        Ok(())
    }

    fn sbrk(&self, size: usize) -> Option<NonNull<u8>> {
        let mut brk = self.brk.lock().unwrap();
        let old = brk.0;
        if old.is_null() {
            return None;
        }
        let new = checked_add(old, size)? as *mut u8;
        if new > self.hi.load(Ordering::Acquire) {
            debug!(size, "Heap segment exhausted.");
            return None;
        }
        brk.0 = new;
        NonNull::new(old)
    }

    fn lo(&self) -> *mut u8 {
        self.lo.load(Ordering::Acquire)
    }

    fn hi(&self) -> *mut u8 {
        self.hi.load(Ordering::Acquire)
    }
}
