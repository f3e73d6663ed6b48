//! The [`ParMalloc`] allocator.

pub mod par_malloc;

pub use par_malloc::ParMalloc;
