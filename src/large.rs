//! The large-object allocator.
//!
//! Requests bigger than half a page are served in whole multi-page spans
//! from a single global freelist. Large allocations are assumed to be rare,
//! so one lock serializing them is an acceptable trade for simplicity.
//!
//! Every span carries a two-word header right before its payload: the
//! sentinel `-1` marking the page as a large span, followed by the span's
//! page count. `free` reads the count back from the header and pushes the
//! span onto the freelist in place; freed spans are never coalesced.

use crate::classes::{PAGE_SIZE, WORD_SIZE};
use crate::segments::Segment;

use core::mem::size_of;
use core::ptr::{null_mut, NonNull};
use std::sync::Mutex;

use static_assertions::const_assert;
use tracing::{debug, instrument};

/// Word written at a span's base to mark it as a large allocation. A
/// subpage page stores a non-negative processor index in the same position,
/// which is how `free` tells the two kinds apart.
pub(crate) const LARGE_SENTINEL: i32 = -1;

/// Span header preceding every large payload.
#[repr(C)]
pub(crate) struct SpanHeader {
    /// [`LARGE_SENTINEL`] for every span, fresh or carved from a split.
    kind: i32,
    /// Number of pages in the span.
    num_pages: i32,
}

pub(crate) const SPAN_HEADER_SIZE: usize = size_of::<SpanHeader>();
const_assert!(SPAN_HEADER_SIZE == 2 * WORD_SIZE);

/// A freelist entry living in the first bytes of a freed span. The header
/// part stays exactly where the allocation's header was, so the page count
/// needs no rewrite on free.
#[repr(C)]
struct BigEntry {
    header: SpanHeader,
    next: *mut BigEntry,
}

struct BigHead(*mut BigEntry);

// Entries live in segment memory and are only touched under the list lock.
unsafe impl Send for BigHead {}

/// The global freelist of free multi-page spans.
pub(crate) struct BigList {
    head: Mutex<BigHead>,
}

impl BigList {
    pub const fn new() -> Self {
        BigList {
            head: Mutex::new(BigHead(null_mut())),
        }
    }

    /// Allocates a span of at least `size` bytes, header included, and
    /// returns a pointer to the payload past the header.
    ///
    /// The freelist is scanned for the first entry with enough pages. A
    /// larger entry is split: the low-address remainder stays on the list
    /// untouched and the carved-off tail is handed out, which keeps the
    /// metadata update confined to one page count. On a miss the list lock
    /// is dropped before the segment grows.
    ///
    /// # Safety
    /// The segment must be initialized.
    #[instrument(level = "debug", skip(self, segment))]
    pub unsafe fn allocate<S: Segment>(&self, segment: &S, size: usize) -> Option<NonNull<u8>> {
        let num_pages = size.div_ceil(PAGE_SIZE);
        debug_assert!(num_pages <= i32::MAX as usize);

        {
            let mut head = self.head.lock().unwrap();
            let mut prior: *mut BigEntry = null_mut();
            let mut curr = head.0;

            while !curr.is_null() {
                let available = (*curr).header.num_pages as usize;
                if available > num_pages {
                    // Larger entry than needed: keep the remainder where it
                    // is and hand out the tail.
                    let remainder = available - num_pages;
                    (*curr).header.num_pages = remainder as i32;
                    let tail = (curr as *mut u8).add(remainder * PAGE_SIZE);
                    debug!(?curr, num_pages, remainder, "Splitting a freelist span.");
                    return Some(write_span_header(tail, num_pages));
                } else if available == num_pages {
                    // Perfectly sized entry: unlink and reuse whole.
                    match NonNull::new(prior) {
                        Some(prior) => (*prior.as_ptr()).next = (*curr).next,
                        None => head.0 = (*curr).next,
                    }
                    debug!(?curr, num_pages, "Reusing a freelist span.");
                    return Some(write_span_header(curr as *mut u8, num_pages));
                }
                prior = curr;
                curr = (*curr).next;
            }
        }

        // Nothing on the freelist fits; grow the segment by whole pages.
        // The list lock is already released at this point.
        let span = segment.sbrk(num_pages * PAGE_SIZE)?;
        Some(write_span_header(span.as_ptr(), num_pages))
    }

    /// Returns a span to the freelist. The span's page count is taken from
    /// the header preceding `ptr`; contiguity with neighbouring free spans
    /// is not restored.
    ///
    /// # Safety
    /// `ptr` must be a payload pointer previously returned by
    /// [`allocate`](BigList::allocate) and not freed since.
    pub unsafe fn free(&self, ptr: *mut u8) {
        let entry = ptr.sub(SPAN_HEADER_SIZE) as *mut BigEntry;
        debug_assert_eq!((*entry).header.kind, LARGE_SENTINEL);
        debug_assert!((*entry).header.num_pages > 0);

        let mut head = self.head.lock().unwrap();
        (*entry).next = head.0;
        head.0 = entry;
    }
}

/// Writes the `(sentinel, page count)` header at `base` and returns the
/// payload address past it.
unsafe fn write_span_header(base: *mut u8, num_pages: usize) -> NonNull<u8> {
    let header = base as *mut SpanHeader;
    (*header).kind = LARGE_SENTINEL;
    (*header).num_pages = num_pages as i32;
    NonNull::new_unchecked(base.add(SPAN_HEADER_SIZE))
}
