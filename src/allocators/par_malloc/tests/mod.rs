#![allow(unused_imports)]

use super::*;
use crate::classes::{class_size, page_capacity, NUM_CLASS, PAGE_META_SIZE, PAGE_SIZE};
use crate::segments::arena_segment::ArenaSegment;

use core::alloc::{GlobalAlloc, Layout};
use std::thread;

use rand::seq::SliceRandom;
use rand::{Rng, RngCore, SeedableRng};

/// Builds an allocator with a fixed processor count on a fresh buffer.
fn allocator_on(buf: &mut Vec<u8>, num_processors: usize) -> ParMalloc<ArenaSegment> {
    let segment = ArenaSegment::new(buf.as_mut_ptr(), buf.len());
    let allocator = unsafe { ParMalloc::with_segment_and_processors(segment, num_processors) };
    allocator.init().unwrap();
    allocator
}

fn pages(n: usize) -> Vec<u8> {
    // One extra page absorbs the alignment of the buffer start.
    vec![0_u8; (n + 1) * PAGE_SIZE]
}

/// A segment of exactly `n` pages carved out of `buf`, independent of the
/// buffer's own alignment.
fn exact_segment(buf: &mut Vec<u8>, n: usize) -> ArenaSegment {
    let ptr = buf.as_mut_ptr();
    let skipped = ptr.align_offset(PAGE_SIZE);
    assert!(skipped + n * PAGE_SIZE <= buf.len());
    ArenaSegment::new(ptr, skipped + n * PAGE_SIZE)
}

/// The base of the page that `ptr` lives on.
fn page_of(allocator: &ParMalloc<ArenaSegment>, ptr: *mut u8) -> usize {
    let lo = allocator.segment().lo() as usize;
    let offset = ptr as usize - lo;
    lo + (offset / PAGE_SIZE) * PAGE_SIZE
}

#[test]
fn test_1() {
    // Requests of 8 and 9 bytes land in different classes; the class index
    // is stored in the second word of each page.
    let mut buf = pages(16);
    let allocator = allocator_on(&mut buf, 1);
    let lo = allocator.segment().lo() as usize;

    let p1 = allocator.allocate(8).unwrap().as_ptr();
    let p2 = allocator.allocate(9).unwrap().as_ptr();
    assert_ne!(p1, p2);

    // Page 0 holds the directory, page 1 the page-refs; data pages follow.
    assert_eq!(p1 as usize, lo + 2 * PAGE_SIZE + PAGE_META_SIZE);
    assert_eq!(p2 as usize, lo + 3 * PAGE_SIZE + class_size(1));

    unsafe {
        assert_eq!(*(page_of(&allocator, p1) as *const i32), 0);
        assert_eq!(*(page_of(&allocator, p1) as *const i32).add(1), 0);
        assert_eq!(*(page_of(&allocator, p2) as *const i32).add(1), 1);
    }
}

#[test]
fn test_2() {
    // A full 2048-byte request never fits the base block, so the swap rule
    // serves the non-base block of a fresh page.
    let mut buf = pages(16);
    let allocator = allocator_on(&mut buf, 1);

    let p1 = allocator.allocate(2048).unwrap().as_ptr();
    let p2 = allocator.allocate(2048).unwrap().as_ptr();
    assert_eq!(p1 as usize % PAGE_SIZE, 2048);
    assert_eq!(p2 as usize % PAGE_SIZE, 2048);
    assert_ne!(page_of(&allocator, p1), page_of(&allocator, p2));

    // Both blocks hold their full 2048 bytes without touching each other.
    unsafe {
        core::ptr::write_bytes(p1, 0xAA, 2048);
        core::ptr::write_bytes(p2, 0xBB, 2048);
        for i in 0..2048 {
            assert_eq!(*p1.add(i), 0xAA);
        }
    }
}

#[test]
fn test_3() {
    // A freed three-page span is split twice to serve two one-page
    // requests without growing the segment.
    let mut buf = pages(16);
    let allocator = allocator_on(&mut buf, 1);

    let p1 = allocator.allocate(10_000).unwrap().as_ptr();
    let used = allocator.segment().used();
    allocator.free(p1);

    let span = p1 as usize - SPAN_HEADER_SIZE;
    let p2 = allocator.allocate(4000).unwrap().as_ptr();
    let p3 = allocator.allocate(4000).unwrap().as_ptr();

    assert_eq!(allocator.segment().used(), used, "the span should be reused");
    for p in [p2, p3] {
        assert!(span <= p as usize && (p as usize) + 4000 <= span + 3 * PAGE_SIZE);
    }
    assert!(p2 as usize >= p3 as usize + 4000 || p3 as usize >= p2 as usize + 4000);
}

#[test]
fn test_4() {
    // Fully freed pages return to the reusable pool together with their
    // page-refs; refilling the class reuses them without segment growth.
    let mut buf = pages(16);
    let allocator = allocator_on(&mut buf, 1);

    let mut blocks = vec![];
    for _ in 0..512 {
        blocks.push(allocator.allocate(8).unwrap().as_ptr());
    }
    let used = allocator.segment().used();
    let pages_touched: Vec<usize> = blocks.iter().map(|&p| page_of(&allocator, p)).collect();

    for &p in &blocks {
        allocator.free(p);
    }

    let p = allocator.allocate(8).unwrap().as_ptr();
    assert!(pages_touched.contains(&page_of(&allocator, p)));
    assert_eq!(allocator.segment().used(), used, "no page should be mapped twice");
}

#[test]
fn test_5() {
    // A pointer may be freed by a different thread than the one that
    // allocated it; the owning arena is found through the page header.
    let mut buf = pages(16);
    let allocator = allocator_on(&mut buf, 1);

    let p = allocator.allocate(16).unwrap().as_ptr() as usize;
    thread::scope(|s| {
        s.spawn(|| allocator.free(p as *mut u8));
    });

    // The block is free again and first in line for its class.
    let q = allocator.allocate(16).unwrap().as_ptr() as usize;
    assert_eq!(p, q);
}

#[test]
fn test_6() {
    // Freeing null is a no-op, initialized or not.
    let mut buf = pages(4);
    let segment = ArenaSegment::new(buf.as_mut_ptr(), buf.len());
    let allocator = unsafe { ParMalloc::with_segment_and_processors(segment, 1) };
    allocator.free(core::ptr::null_mut());

    allocator.init().unwrap();
    allocator.init().unwrap(); // idempotent
    allocator.free(core::ptr::null_mut());
}

#[test]
fn test_7() {
    // One class-64 page holds its full capacity of 56-byte objects, none
    // of them overlapping, and the page's free count stays consistent.
    let mut buf = pages(16);
    let allocator = allocator_on(&mut buf, 1);
    let class = class_index(56).unwrap();

    let mut blocks = vec![];
    for _ in 0..page_capacity(class) {
        blocks.push(allocator.allocate(56).unwrap().as_ptr());
    }

    let page = page_of(&allocator, blocks[0]);
    let mut offsets: Vec<usize> = blocks
        .iter()
        .map(|&p| {
            assert_eq!(page_of(&allocator, p), page, "all blocks share one page");
            p as usize - page
        })
        .collect();
    offsets.sort_unstable();
    for pair in offsets.windows(2) {
        assert!(pair[0] + 56 <= pair[1], "live blocks must not overlap");
    }

    let table = allocator.arenas.get().unwrap();
    let head = unsafe { table.head(0, class) };
    assert_eq!(unsafe { (*head).num_free() }, 0);

    // The next allocation of the class opens a second page.
    let p = allocator.allocate(56).unwrap().as_ptr();
    assert_ne!(page_of(&allocator, p), page);
}

#[test]
fn test_8() {
    // Substrate exhaustion surfaces as None from every path and leaves the
    // allocator in a usable state.
    let mut buf = pages(3);
    let segment = exact_segment(&mut buf, 2);
    let allocator = unsafe { ParMalloc::with_segment_and_processors(segment, 1) };
    allocator.init().unwrap();

    // The metadata page can still be carved, but no data page is left.
    assert!(allocator.allocate(8).is_none());
    assert!(allocator.allocate(8).is_none());
    assert!(allocator.allocate(4000).is_none());
    allocator.free(core::ptr::null_mut());
}

#[test]
fn test_9() {
    // Live allocations plus freelist length always add up to the page
    // capacity of the class.
    let mut buf = pages(16);
    let allocator = allocator_on(&mut buf, 1);
    let class = class_index(32).unwrap();

    let mut blocks = vec![];
    for i in 1..=20 {
        blocks.push(allocator.allocate(32).unwrap().as_ptr());
        let table = allocator.arenas.get().unwrap();
        let head = unsafe { table.head(0, class) };
        assert_eq!(unsafe { (*head).num_free() }, page_capacity(class) - i);
    }
    for (i, &p) in blocks.iter().enumerate() {
        allocator.free(p);
        let table = allocator.arenas.get().unwrap();
        let head = unsafe { table.head(0, class) };
        assert_eq!(
            unsafe { (*head).num_free() },
            page_capacity(class) - blocks.len() + i + 1
        );
    }
}

#[test]
fn test_10() {
    // The GlobalAlloc surface: zero-size requests are clamped, strong
    // alignments ride on the class sizes, absurd alignments are refused.
    let mut buf = pages(16);
    let allocator = allocator_on(&mut buf, 1);

    unsafe {
        let p = allocator.alloc(Layout::from_size_align(0, 1).unwrap());
        assert!(!p.is_null());
        allocator.dealloc(p, Layout::from_size_align(0, 1).unwrap());

        for align in [16, 64, 256, 2048] {
            let layout = Layout::from_size_align(align / 2 + 1, align).unwrap();
            let p = allocator.alloc(layout);
            assert!(!p.is_null());
            assert_eq!(p as usize % align, 0);
            allocator.dealloc(p, layout);
        }

        let huge_align = Layout::from_size_align(16, 4096).unwrap();
        assert!(allocator.alloc(huge_align).is_null());
    }
}

#[test]
fn test_11() {
    // Concurrent allocate/free traffic from several threads over two
    // arenas completes and every block holds its own pattern.
    let mut buf = vec![0_u8; (1 << 22) + PAGE_SIZE];
    let segment = ArenaSegment::new(buf.as_mut_ptr(), buf.len());
    let allocator = unsafe { ParMalloc::with_segment_and_processors(segment, 2) };
    allocator.init().unwrap();

    thread::scope(|s| {
        for t in 0..4_u8 {
            let allocator = &allocator;
            s.spawn(move || {
                let mut rng = rand::rngs::StdRng::seed_from_u64(t as u64);
                let mut live: Vec<(*mut u8, usize)> = vec![];
                for _ in 0..2000 {
                    if live.len() < 32 && rng.gen_bool(0.6) {
                        let size = rng.gen_range(1..=3000);
                        let Some(p) = allocator.allocate(size) else {
                            continue;
                        };
                        unsafe { core::ptr::write_bytes(p.as_ptr(), t, size) };
                        live.push((p.as_ptr(), size));
                    } else if let Some((p, size)) = live.pop() {
                        for i in 0..size {
                            assert_eq!(unsafe { *p.add(i) }, t, "block was clobbered");
                        }
                        allocator.free(p);
                    }
                }
                for (p, _) in live {
                    allocator.free(p);
                }
            });
        }
    });
}

#[test]
fn test_12() {
    // Randomized churn against a single arena, with every block carrying a
    // distinct fill byte. Exercises page recycling and span reuse.
    let mut buf = vec![0_u8; (1 << 20) + PAGE_SIZE];
    let segment = ArenaSegment::new(buf.as_mut_ptr(), buf.len());
    let allocator = unsafe { ParMalloc::with_segment_and_processors(segment, 1) };
    allocator.init().unwrap();

    let seed = rand::thread_rng().next_u64();
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let mut live: Vec<(*mut u8, usize, u8)> = vec![];

    for round in 0..10_000_u32 {
        if live.len() < 64 && rng.gen_bool(0.55) {
            let size = *[1, 7, 8, 9, 63, 64, 513, 2048, 2049, 5000]
                .choose(&mut rng)
                .unwrap();
            let Some(p) = allocator.allocate(size) else {
                panic!("allocation failed with seed {seed} on round {round}");
            };
            let fill = (round % 251) as u8;
            unsafe { core::ptr::write_bytes(p.as_ptr(), fill, size) };
            live.push((p.as_ptr(), size, fill));
        } else if !live.is_empty() {
            let at = rng.gen_range(0..live.len());
            let (p, size, fill) = live.swap_remove(at);
            for i in 0..size {
                assert_eq!(
                    unsafe { *p.add(i) },
                    fill,
                    "block was clobbered (seed {seed}, round {round})"
                );
            }
            allocator.free(p);
        }
    }
}

#[test]
fn test_13() {
    // The instrumented paths run under an installed subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let mut buf = pages(16);
    let allocator = allocator_on(&mut buf, 1);
    let p = allocator.allocate(100).unwrap();
    let q = allocator.allocate(3000).unwrap();
    allocator.free(p.as_ptr());
    allocator.free(q.as_ptr());
}
