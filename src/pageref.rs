//! Page-ref records and the global page-ref pool.
//!
//! A [`PageRef`] is a fixed-size metadata record describing one 4 KiB page
//! used for subpage allocations: the page's address, the freelist of its
//! blocks and how many of them are free. Page-refs are carved out of whole
//! metadata pages at cache-line strides and never freed; a page-ref whose
//! page becomes fully empty moves to the reusable side of the [`RefPool`]
//! together with its page, ready to serve another `(processor, class)`
//! arena without touching the heap segment again.

use crate::classes::{class_size, page_capacity, CACHELINE_SIZE, PAGE_META_SIZE, PAGE_SIZE};
use crate::freelist::{FreeNode, Freelist};
use crate::segments::Segment;

use core::mem::size_of;
use core::ptr::{self, null_mut, NonNull};
use std::sync::Mutex;

use static_assertions::const_assert;
use tracing::{debug, instrument, Level};

// Page-refs are laid out one per cache line so that neighbouring records
// never share a line.
const_assert!(size_of::<PageRef>() <= CACHELINE_SIZE);
const_assert!(PAGE_SIZE % CACHELINE_SIZE == 0);

/// Metadata record for one subpage page.
#[repr(C)]
pub(crate) struct PageRef {
    /// The next page-ref on whatever list currently owns this record.
    pub next: *mut PageRef,
    /// Free blocks of the page.
    freelist: Freelist,
    /// Address of the managed 4 KiB page. Null while the record sits on the
    /// fresh list.
    freelist_base: *mut u8,
    /// Number of nodes reachable from `freelist`.
    num_free: usize,
}

impl PageRef {
    /// The address of the managed page.
    #[inline]
    pub fn page(&self) -> *mut u8 {
        self.freelist_base
    }

    #[inline]
    pub fn num_free(&self) -> usize {
        self.num_free
    }

    /// Whether every block of the page is free again.
    #[inline]
    pub fn is_page_empty(&self, class: usize) -> bool {
        self.num_free == page_capacity(class)
    }

    /// Binds a data page to a record taken from the fresh list.
    ///
    /// # Safety
    /// `page` must point to an unused, page-sized region of the segment.
    pub unsafe fn bind_page(&mut self, page: *mut u8) {
        debug_assert!(self.freelist_base.is_null());
        self.freelist_base = page;
    }

    /// Writes the `(processor, class)` header into the page and rebuilds
    /// its freelist from scratch, chaining every block of the class size.
    ///
    /// The blocks are chained from the highest offset down so that the base
    /// block ends up at the head of the list. The base block's node lives
    /// past the metadata header, at `page + PAGE_META_SIZE`, which is also
    /// the address handed out for it. Class-0 pages have no usable base
    /// block at all and track one block less.
    ///
    /// # Safety
    /// The record must have a bound page that contains no live allocations.
    pub unsafe fn build_freelist(&mut self, processor: usize, class: usize) {
        let base = self.freelist_base;
        debug_assert!(!base.is_null());

        let meta = base as *mut i32;
        meta.write(processor as i32);
        meta.add(1).write(class as i32);

        let size = class_size(class);
        self.freelist = Freelist::new();
        self.num_free = 0;

        let mut offset = PAGE_SIZE - size;
        while offset >= size {
            self.freelist.push_front(base.add(offset).cast());
            self.num_free += 1;
            offset -= size;
        }
        if size > PAGE_META_SIZE {
            self.freelist.push_front(base.add(PAGE_META_SIZE).cast());
            self.num_free += 1;
        }

        debug_assert_eq!(self.num_free, page_capacity(class));
    }

    /// Detaches a block that can hold `size` bytes from the page, or
    /// returns `None` if the page has no suitable block.
    ///
    /// The base block of a page overlaps the metadata header and offers
    /// `PAGE_META_SIZE` fewer usable bytes. When it sits at the head of the
    /// list and the request does not fit, it is swapped with its successor
    /// so that the full-sized block behind it is allocated instead.
    ///
    /// # Safety
    /// The record must be bound to a page with a built freelist.
    pub unsafe fn take_block(&mut self, class: usize, size: usize) -> Option<NonNull<u8>> {
        if self.num_free == 0 {
            return None;
        }
        let head = self.freelist.head()?;

        let base_node = self.freelist_base.add(PAGE_META_SIZE);
        if class_size(class) > PAGE_META_SIZE && head.as_ptr().cast::<u8>() == base_node {
            if size + PAGE_META_SIZE > class_size(class) {
                if self.num_free < 2 {
                    return None;
                }
                self.freelist.swap_head();
            }
        }

        let block = self.freelist.pop_front()?;
        self.num_free -= 1;
        Some(block.cast())
    }

    /// Puts a freed block back onto the page's freelist.
    ///
    /// # Safety
    /// `ptr` must be a pointer previously handed out from this page and not
    /// currently on the freelist.
    pub unsafe fn release_block(&mut self, ptr: *mut u8) {
        self.freelist.push_front(ptr.cast());
        self.num_free += 1;
    }
}

/// A page-ref handed out by the pool.
pub(crate) enum AcquiredRef {
    /// The record still owns the data page it managed before; no segment
    /// growth is needed.
    Bound(NonNull<PageRef>),
    /// A fresh record with no data page yet; the caller must bind one.
    Unbound(NonNull<PageRef>),
}

struct PoolLists {
    /// Records whose page became fully empty, page still attached.
    reusable: *mut PageRef,
    /// Records carved from a metadata page, no data page yet.
    fresh: *mut PageRef,
}

// The raw heads only refer to segment memory owned by the pool.
unsafe impl Send for PoolLists {}

/// The process-wide pool that manufactures, recycles and hands out
/// page-refs. One lock guards both internal lists.
pub(crate) struct RefPool {
    lists: Mutex<PoolLists>,
}

impl RefPool {
    pub const fn new() -> Self {
        RefPool {
            lists: Mutex::new(PoolLists {
                reusable: null_mut(),
                fresh: null_mut(),
            }),
        }
    }

    /// Hands out a page-ref, preferring recycled records over fresh ones.
    ///
    /// When both lists are empty, one metadata page is taken from the
    /// segment and carved into records at cache-line strides; the first
    /// record is returned directly and the rest join the fresh list. This
    /// amortizes the growth cost of metadata across many subpage pages.
    #[instrument(level = "debug", skip(self, segment), err(Debug, level = Level::DEBUG))]
    pub fn acquire<S: Segment>(&self, segment: &S) -> Result<AcquiredRef, ()> {
        let mut lists = self.lists.lock().unwrap();

        if let Some(head) = NonNull::new(lists.reusable) {
            lists.reusable = unsafe { (*head.as_ptr()).next };
            debug!(page_ref = ?head, "Reusing a page-ref with its page.");
            return Ok(AcquiredRef::Bound(head));
        }

        if let Some(head) = NonNull::new(lists.fresh) {
            lists.fresh = unsafe { (*head.as_ptr()).next };
            return Ok(AcquiredRef::Unbound(head));
        }

        let page = segment.sbrk(PAGE_SIZE).ok_or(())?.as_ptr();
        debug!(?page, "Carving a new metadata page into page-refs.");
        let mut offset = CACHELINE_SIZE;
        while offset < PAGE_SIZE {
            let record = unsafe { page.add(offset) } as *mut PageRef;
            unsafe {
                ptr::write(
                    record,
                    PageRef {
                        next: lists.fresh,
                        freelist: Freelist::new(),
                        freelist_base: null_mut(),
                        num_free: 0,
                    },
                );
            }
            lists.fresh = record;
            offset += CACHELINE_SIZE;
        }

        let first = page as *mut PageRef;
        unsafe {
            ptr::write(
                first,
                PageRef {
                    next: null_mut(),
                    freelist: Freelist::new(),
                    freelist_base: null_mut(),
                    num_free: 0,
                },
            );
        }
        Ok(AcquiredRef::Unbound(unsafe {
            NonNull::new_unchecked(first)
        }))
    }

    /// Returns an empty page-ref (page still bound) to the reusable list.
    pub fn recycle(&self, page_ref: NonNull<PageRef>) {
        let mut lists = self.lists.lock().unwrap();
        unsafe { (*page_ref.as_ptr()).next = lists.reusable };
        lists.reusable = page_ref.as_ptr();
    }

    /// Puts an unbound record back onto the fresh list. Used when binding
    /// a data page to it failed.
    pub fn restore_fresh(&self, page_ref: NonNull<PageRef>) {
        let mut lists = self.lists.lock().unwrap();
        debug_assert!(unsafe { (*page_ref.as_ptr()).page().is_null() });
        unsafe { (*page_ref.as_ptr()).next = lists.fresh };
        lists.fresh = page_ref.as_ptr();
    }
}
