//! A parallel multi-arena memory allocator written in Rust.
//!
//! This crate implements a general-purpose `malloc`/`free` engine designed
//! for multithreaded programs: per-processor arenas keep the common
//! allocation path almost contention free, while one shared freelist
//! handles the rare large requests.
//!
//! # Usage
//! The allocator runs on top of a [`Segment`](segments::Segment), a single
//! contiguous heap region that grows monotonically in the manner of `sbrk`.
//! Construction is `const`, so it can be installed as the global allocator:
//!
//! ```
//! use par_malloc::segments::MmapSegment;
//! use par_malloc::ParMalloc;
//!
//! #[global_allocator]
//! static ALLOCATOR: ParMalloc<MmapSegment> =
//!     unsafe { ParMalloc::with_segment(MmapSegment::new(1 << 30)) };
//!
//! fn main() {
//!     let v1: Vec<u32> = vec![1, 2, 3];
//!     println!("Arenas are cool {:?}", v1);
//! }
//! ```
//!
//! It can just as well be used directly through
//! [`allocate`](ParMalloc::allocate) and [`free`](ParMalloc::free).
//!
//! # Mode of operation
//! Requests are split at half a page (2048 bytes):
//! - Small requests are rounded up to one of nine power-of-two *size
//!   classes* (8 to 2048 bytes) and served from the arena of the processor
//!   the calling thread happens to run on. An arena is a set of 4 KiB pages
//!   per size class, each carved into equal blocks that are threaded onto
//!   an in-page freelist. A page that becomes fully free is wiped and
//!   parked in a global pool, ready to serve any arena and any class again
//!   without growing the heap.
//! - Large requests are served in whole multi-page *spans* from one global
//!   freelist. Oversized entries are split from their tail; freed spans go
//!   back to the list and are never coalesced or returned to the system.
//!
//! Bellow is a list of the abstractions used by the allocator:
//!
//! ## Pages and blocks
//! Every subpage page stores its owning processor and its size class in
//! the two words at its base. That tiny header is what makes `free` O(1)
//! to route: the page base is computed from the pointer, and the header
//! names the arena that owns it, no matter which thread calls. The first
//! block of a page overlaps the header and therefore hands out two words
//! less; a request that needs the full block size is transparently steered
//! to the block behind it.
//!
//! ## Page-refs
//! Page metadata that does not fit in the page itself (the freelist head,
//! the free count) lives in a fixed-size *page-ref* record. Records are
//! carved in bulk out of dedicated metadata pages, one per cache line, and
//! are recycled together with their page.
//!
//! ## Arenas and locks
//! Arenas are indexed by `(processor, class)`. Each processor owns one
//! mutex, padded to its own cache line so that two cores never write the
//! same line when they lock different arenas. The allocator is safe to
//! call from any number of threads; a thread that migrates between
//! `allocate` and `free` is handled by the page header, not by guessing.
//! It is not async-signal-safe: a thread must not re-enter the allocator
//! from a signal handler.
//!
//! ## Segments
//! The heap itself is abstracted behind the [`Segment`](segments::Segment)
//! trait: anything that can hand out monotonically increasing page-aligned
//! memory within fixed bounds can back the allocator. [`MmapSegment`]
//! reserves one big private mapping up front; tests run the exact same
//! engine on plain buffers.
//!
//! [`MmapSegment`]: segments::MmapSegment

pub use crate::allocators::ParMalloc;

pub mod allocators;
mod classes;
mod freelist;
mod large;
mod pageref;
pub mod segments;
mod util;
