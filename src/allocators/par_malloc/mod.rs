//! A parallel multi-arena memory allocator.
//
// For a general view of the allocator's operational semantics see the
// [`crate`] level documentation.
//
// # Additional implementation notes
// ## The arena directory
// All state that depends on the processor count lives in segment memory
// laid out at init time: first the directory of
// `num_processors * NUM_CLASS` page-ref list heads, then one mutex per
// processor placed at cache-line strides so two processors never contend
// on the same line. Directory slots are only read and written while the
// owning processor's mutex is held.
//
// ## Lock ordering
// To stay deadlock free, locks are always taken in the order
// arena -> pool -> growth. The large allocator takes its own list lock and
// drops it before growing the segment.

use crate::classes::{
    class_index, CACHELINE_SIZE, MAX_SUBPAGE_SIZE, NUM_CLASS, PAGE_META_SIZE, PAGE_SIZE,
};
use crate::large::{BigList, LARGE_SENTINEL, SPAN_HEADER_SIZE};
use crate::pageref::{AcquiredRef, PageRef, RefPool};
use crate::segments::Segment;
use crate::util::{align_up, raw_ptr};

use core::alloc::{GlobalAlloc, Layout};
use core::mem::size_of;
use core::ptr::{self, null_mut, NonNull};
use std::fmt::Debug;
use std::sync::{Mutex, OnceLock};

use static_assertions::const_assert;
use tracing::{debug, error, instrument, Level};

// Arena mutexes are written raw into segment memory at cache-line strides.
const_assert!(size_of::<Mutex<()>>() <= CACHELINE_SIZE);
const_assert!(core::mem::align_of::<Mutex<()>>() <= CACHELINE_SIZE);

/// A parallel multi-arena memory allocator.
///
/// Subpage requests (at most half a page) are served from per-processor
/// arenas of size-classed pages; larger requests go through one global
/// span freelist. See the [`crate`] level documentation for the full
/// picture.
#[repr(C)]
pub struct ParMalloc<S: Segment> {
    segment: S,
    arenas: OnceLock<ArenaTable>,
    pool: RefPool,
    big: BigList,
    init_lock: Mutex<()>,
    num_processors: Option<usize>,
}

// All interior raw pointers refer to segment memory and every access to
// them is guarded by one of the allocator's locks.
unsafe impl<S: Segment + Send> Send for ParMalloc<S> {}
unsafe impl<S: Segment + Sync> Sync for ParMalloc<S> {}

impl<S: Segment> Debug for ParMalloc<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParMalloc")
            .field("initialized", &self.arenas.get().is_some())
            .finish()
    }
}

/// The arena state established by `init`: where the directory and the
/// per-processor mutexes live inside the segment.
struct ArenaTable {
    /// Base of the `num_processors * NUM_CLASS` array of list heads.
    directory: *mut *mut PageRef,
    /// Base of the per-processor mutex array, cache-line aligned.
    locks: *mut u8,
    num_processors: usize,
    /// Cached segment lower bound, used for page arithmetic.
    lo: *mut u8,
}

unsafe impl Send for ArenaTable {}
unsafe impl Sync for ArenaTable {}

impl ArenaTable {
    #[inline]
    fn slot(&self, processor: usize, class: usize) -> *mut *mut PageRef {
        debug_assert!(processor < self.num_processors && class < NUM_CLASS);
        unsafe { self.directory.add(processor * NUM_CLASS + class) }
    }

    /// Head of the page-ref list serving `(processor, class)`.
    ///
    /// # Safety
    /// The processor's mutex must be held.
    #[inline]
    unsafe fn head(&self, processor: usize, class: usize) -> *mut PageRef {
        *self.slot(processor, class)
    }

    /// # Safety
    /// The processor's mutex must be held.
    #[inline]
    unsafe fn set_head(&self, processor: usize, class: usize, head: *mut PageRef) {
        *self.slot(processor, class) = head;
    }

    /// The mutex serializing all subpage operations of one processor.
    #[inline]
    fn lock(&self, processor: usize) -> &Mutex<()> {
        debug_assert!(processor < self.num_processors);
        unsafe { &*(self.locks.add(processor * CACHELINE_SIZE) as *const Mutex<()>) }
    }

    /// The base of the page containing `ptr`.
    #[inline]
    fn page_base(&self, ptr: *mut u8) -> *mut u8 {
        debug_assert!(ptr >= self.lo);
        let offset = ptr as usize - self.lo as usize;
        unsafe { self.lo.add((offset / PAGE_SIZE) * PAGE_SIZE) }
    }
}

impl<S: Segment> ParMalloc<S> {
    /// Creates an allocator instance on the specified segment. The
    /// processor count is discovered on first use.
    ///
    /// # Safety
    /// Callers must make sure that the provided segment will be the only
    /// object managing its underlying region for the lifetime of the
    /// returned allocator.
    pub const unsafe fn with_segment(segment: S) -> Self {
        Self::with_config(segment, None)
    }

    /// Creates an allocator with a fixed processor count. Useful when the
    /// caller wants deterministic arena placement, e.g. in tests.
    ///
    /// # Safety
    /// Same contract as [`with_segment`](ParMalloc::with_segment).
    pub const unsafe fn with_segment_and_processors(segment: S, num_processors: usize) -> Self {
        Self::with_config(segment, Some(num_processors))
    }

    const unsafe fn with_config(segment: S, num_processors: Option<usize>) -> Self {
        ParMalloc {
            segment,
            arenas: OnceLock::new(),
            pool: RefPool::new(),
            big: BigList::new(),
            init_lock: Mutex::new(()),
            num_processors,
        }
    }

    /// Prepares the allocator for use: initializes the segment, discovers
    /// the processor count and lays out the arena directory and the
    /// per-processor mutexes in segment memory.
    ///
    /// Idempotent; returns `Err(())` only if the segment fails to
    /// initialize or can not hold the directory.
    #[instrument(level = "info", skip(self), ret(level = Level::INFO), err(Debug, level = Level::ERROR))]
    pub fn init(&self) -> Result<(), ()> {
        let _guard = self.init_lock.lock().unwrap();
        if self.arenas.get().is_some() {
            return Ok(());
        }

        self.segment.init().inspect_err(|_| {
            error!("Could not initialize the heap segment.");
        })?;

        let num_processors = match self.num_processors {
            Some(n) => n.max(1),
            None => num_processors(),
        };

        let directory_bytes = num_processors * NUM_CLASS * size_of::<*mut PageRef>();
        let locks_offset = align_up(directory_bytes, CACHELINE_SIZE);
        let total = locks_offset + num_processors * CACHELINE_SIZE;
        let region = self
            .segment
            .sbrk(align_up(total, PAGE_SIZE))
            .ok_or(())
            .inspect_err(|_| error!("Segment too small for the arena directory."))?
            .as_ptr();

        unsafe {
            ptr::write_bytes(region, 0, align_up(total, PAGE_SIZE));
            let locks = region.add(locks_offset);
            for i in 0..num_processors {
                ptr::write(locks.add(i * CACHELINE_SIZE) as *mut Mutex<()>, Mutex::new(()));
            }

            debug!(num_processors, ?region, "Arena directory initialized.");
            let _ = self.arenas.set(ArenaTable {
                directory: region as *mut *mut PageRef,
                locks,
                num_processors,
                lo: self.segment.lo(),
            });
        }
        Ok(())
    }

    /// Allocates `size` bytes and returns a pointer to them, or `None` if
    /// the heap segment can not grow to satisfy the request.
    ///
    /// Requests up to half a page are served by the subpage allocator,
    /// anything larger by the large-object allocator with two header words
    /// reserved in front of the payload.
    #[instrument(level = "info", skip(self), ret(level = Level::DEBUG))]
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        let table = self.table_or_init()?;
        if size <= MAX_SUBPAGE_SIZE {
            self.subpage_allocate(table, size)
        } else {
            let total = size.checked_add(SPAN_HEADER_SIZE)?;
            unsafe { self.big.allocate(&self.segment, total) }
        }
    }

    /// Frees a pointer previously returned by
    /// [`allocate`](ParMalloc::allocate). Freeing a null pointer is a
    /// no-op; freeing any other foreign pointer is a contract violation
    /// with undefined results.
    #[instrument(level = "info", skip(self))]
    pub fn free(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let Some(table) = self.arenas.get() else {
            debug_assert!(false, "free() before any allocation");
            return;
        };
        if !self.subpage_free(table, ptr) {
            unsafe { self.big.free(ptr) };
        }
    }

    /// A shared reference to the underlying segment.
    #[inline]
    pub fn segment(&self) -> &S {
        &self.segment
    }

    fn table_or_init(&self) -> Option<&ArenaTable> {
        if let Some(table) = self.arenas.get() {
            return Some(table);
        }
        self.init().ok()?;
        self.arenas.get()
    }

    /// Serves a request of at most half a page from the current
    /// processor's arena.
    #[instrument(level = "debug", skip(self, table))]
    fn subpage_allocate(&self, table: &ArenaTable, size: usize) -> Option<NonNull<u8>> {
        let class = class_index(size)?;
        let processor = current_processor(table.num_processors);

        let _guard = table.lock(processor).lock().unwrap();
        unsafe {
            // Find the first page that can serve the request.
            let mut page_ref = table.head(processor, class);
            while !page_ref.is_null() {
                if let Some(block) = (*page_ref).take_block(class, size) {
                    return Some(block);
                }
                page_ref = (*page_ref).next;
            }

            // No page can; pull a page-ref from the pool and, unless it
            // still owns a page from an earlier life, bind a fresh one.
            let page_ref = match self.pool.acquire(&self.segment).ok()? {
                AcquiredRef::Bound(r) => r,
                AcquiredRef::Unbound(r) => match self.segment.sbrk(PAGE_SIZE) {
                    Some(page) => {
                        (*r.as_ptr()).bind_page(page.as_ptr());
                        r
                    }
                    None => {
                        debug!("No memory for a data page, returning the page-ref.");
                        self.pool.restore_fresh(r);
                        return None;
                    }
                },
            };

            let page_ref = page_ref.as_ptr();
            (*page_ref).build_freelist(processor, class);
            (*page_ref).next = table.head(processor, class);
            table.set_head(processor, class, page_ref);
            debug!(?page_ref, processor, class, "Attached a page to the arena.");

            (*page_ref).take_block(class, size)
        }
    }

    /// Attempts the subpage free path. Returns `false` if the page's
    /// stored processor word is the large-span sentinel, in which case the
    /// caller must redirect to the large allocator.
    fn subpage_free(&self, table: &ArenaTable, ptr: *mut u8) -> bool {
        let page = table.page_base(ptr);

        // The words at the page base are stable as long as the page holds
        // at least one live block, which `ptr` is.
        let processor = unsafe { *(page as *const i32) };
        if processor == LARGE_SENTINEL {
            return false;
        }
        let class = unsafe { *(page as *const i32).add(1) } as usize;
        debug_assert!((processor as usize) < table.num_processors);
        debug_assert!(class < NUM_CLASS);
        let processor = processor as usize;

        let _guard = table.lock(processor).lock().unwrap();
        unsafe {
            let mut prior: *mut PageRef = null_mut();
            let mut page_ref = table.head(processor, class);
            while !page_ref.is_null() && (*page_ref).page() != page {
                prior = page_ref;
                page_ref = (*page_ref).next;
            }

            // A pointer whose page is not on its arena's list means the
            // caller freed something it never owned.
            debug_assert!(!page_ref.is_null(), "freed an unknown pointer");
            let Some(page_ref) = NonNull::new(page_ref) else {
                return true;
            };
            let page_ref = page_ref.as_ptr();

            (*page_ref).release_block(ptr);

            // A fully empty page goes back to the pool for reuse by any
            // arena, wiped so its next life starts clean.
            if (*page_ref).is_page_empty(class) {
                match NonNull::new(prior) {
                    Some(prior) => (*prior.as_ptr()).next = (*page_ref).next,
                    None => table.set_head(processor, class, (*page_ref).next),
                }
                ptr::write_bytes(page, 0, PAGE_SIZE);
                debug!(?page, processor, class, "Recycling an empty page.");
                self.pool.recycle(NonNull::new_unchecked(page_ref));
            }
        }
        true
    }
}

/// The number of online processors.
///
/// Queried through `sysconf` directly: this runs inside `init`, possibly
/// with the allocator installed as the global one, so it must not allocate.
fn num_processors() -> usize {
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if n < 1 {
        1
    } else {
        n as usize
    }
}

/// The arena index for the calling thread, derived from the CPU it is
/// currently running on. Purely advisory: a thread may migrate between an
/// allocation and the matching free, so the free path never consults it
/// and trusts the processor word stored in the page instead.
#[cfg(target_os = "linux")]
fn current_processor(num_processors: usize) -> usize {
    let cpu = unsafe { libc::sched_getcpu() };
    if cpu < 0 {
        0
    } else {
        cpu as usize % num_processors
    }
}

/// Fallback for platforms without a cheap CPU id: spread threads over the
/// arenas round-robin by a thread-local ticket.
#[cfg(not(target_os = "linux"))]
fn current_processor(num_processors: usize) -> usize {
    use core::sync::atomic::{AtomicUsize, Ordering};

    thread_local! {
        static TICKET: usize = {
            static NEXT: AtomicUsize = AtomicUsize::new(0);
            NEXT.fetch_add(1, Ordering::Relaxed)
        };
    }
    TICKET.with(|&t| t % num_processors)
}

//---------------impl GlobalAlloc for ParMalloc---------------//

unsafe impl<S: Segment> GlobalAlloc for ParMalloc<S> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        match class_request(layout) {
            Some(size) => raw_ptr(self.allocate(size)),
            None => null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.free(ptr);
    }
}

/// Maps a layout onto a request size the allocator can serve.
///
/// Allocations are naturally aligned to two header words. Stronger
/// alignments ride on the class machinery: a request for a full class size
/// is never served from a page's base block, so rounding the request up to
/// the next power of two yields a block aligned to that power. Alignments
/// above the largest class are not supported.
fn class_request(layout: Layout) -> Option<usize> {
    let size = layout.size().max(1);
    if layout.align() <= PAGE_META_SIZE {
        return Some(size);
    }
    let rounded = size.max(layout.align()).checked_next_power_of_two()?;
    (rounded <= MAX_SUBPAGE_SIZE).then_some(rounded)
}

#[cfg(test)]
mod tests;
