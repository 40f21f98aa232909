use std::alloc::{GlobalAlloc, Layout};
use std::ffi::c_void;

use crate::engine;
use crate::node::CallKind;

/// The underlying allocator the interposer delegates to. Implementations
/// must be callable from any thread at any time (including during TLS
/// teardown) and must be able to report `usable_size` for a live block
/// *before* it is freed, since free tracking only ever sees the pointer.
pub trait RawAllocator {
  /// # Safety
  ///
  /// Same contract as C `malloc`.
  unsafe fn raw_alloc(&self, size: usize) -> *mut c_void;

  /// # Safety
  ///
  /// Same contract as C `realloc`: `ptr` is null or was produced by this
  /// allocator and not yet freed.
  unsafe fn raw_realloc(&self, ptr: *mut c_void, size: usize) -> *mut c_void;

  /// # Safety
  ///
  /// Same contract as C `calloc`.
  unsafe fn raw_calloc(&self, nmemb: usize, size: usize) -> *mut c_void;

  /// # Safety
  ///
  /// Same contract as C `memalign`: `align` is a power of two.
  unsafe fn raw_memalign(&self, align: usize, size: usize) -> *mut c_void;

  /// # Safety
  ///
  /// Same contract as C `valloc`.
  unsafe fn raw_valloc(&self, size: usize) -> *mut c_void;

  /// # Safety
  ///
  /// Same contract as C `pvalloc`.
  unsafe fn raw_pvalloc(&self, size: usize) -> *mut c_void;

  /// # Safety
  ///
  /// Same contract as C `free`: `ptr` is null or was produced by this
  /// allocator and not yet freed.
  unsafe fn raw_free(&self, ptr: *mut c_void);

  /// Reportable capacity of a live block; 0 when unknown.
  ///
  /// # Safety
  ///
  /// `ptr` was produced by this allocator and not yet freed.
  unsafe fn usable_size(&self, ptr: *mut c_void) -> usize;
}

/// Direct libc allocator. The right choice whenever the process's `malloc`
/// symbol is *not* shadowed (tests, `TagAllocator` builds); an interposing
/// shim must resolve the real functions through `RTLD_NEXT` instead.
pub struct LibcAllocator;

fn page_size() -> usize {
  // SAFETY: sysconf with a valid name has no preconditions.
  let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
  if page > 0 {
    page as usize
  } else {
    4096
  }
}

impl RawAllocator for LibcAllocator {
  unsafe fn raw_alloc(&self, size: usize) -> *mut c_void {
    libc::malloc(size)
  }

  unsafe fn raw_realloc(&self, ptr: *mut c_void, size: usize) -> *mut c_void {
    libc::realloc(ptr, size)
  }

  unsafe fn raw_calloc(&self, nmemb: usize, size: usize) -> *mut c_void {
    libc::calloc(nmemb, size)
  }

  unsafe fn raw_memalign(&self, align: usize, size: usize) -> *mut c_void {
    libc::memalign(align, size)
  }

  unsafe fn raw_valloc(&self, size: usize) -> *mut c_void {
    libc::memalign(page_size(), size)
  }

  unsafe fn raw_pvalloc(&self, size: usize) -> *mut c_void {
    let page = page_size();
    let rounded = size.checked_add(page - 1).map_or(size, |s| s & !(page - 1));
    libc::memalign(page, rounded)
  }

  unsafe fn raw_free(&self, ptr: *mut c_void) {
    libc::free(ptr);
  }

  unsafe fn usable_size(&self, ptr: *mut c_void) -> usize {
    libc::malloc_usable_size(ptr)
  }
}

fn errno() -> i32 {
  // SAFETY: __errno_location always returns a valid thread-local pointer.
  unsafe { *libc::__errno_location() }
}

fn set_errno(value: i32) {
  // SAFETY: as above.
  unsafe {
    *libc::__errno_location() = value;
  }
}

// Measures `ptr` and charges it to the current scope, keeping the raw
// call's errno intact across the tracking work.
#[inline]
unsafe fn charge_alloc<A: RawAllocator>(raw: &A, kind: CallKind, ptr: *mut c_void) {
  if ptr.is_null() {
    return;
  }
  let saved_errno = errno();
  engine::on_alloc(kind, raw.usable_size(ptr) as u64);
  set_errno(saved_errno);
}

/// `malloc` interposer body: raw call first, then charge `usable_size` of
/// the result. Null results are returned untouched and untracked.
///
/// # Safety
///
/// Same contract as C `malloc`.
#[inline]
pub unsafe fn intercepted_malloc<A: RawAllocator>(raw: &A, size: usize) -> *mut c_void {
  let ptr = raw.raw_alloc(size);
  charge_alloc(raw, CallKind::Malloc, ptr);
  ptr
}

/// `realloc` interposer body. The move is charged as a fresh allocation of
/// the new block's usable size with no matching free; net accessors
/// saturate to mask the deliberate overcount.
///
/// # Safety
///
/// Same contract as C `realloc`.
#[inline]
pub unsafe fn intercepted_realloc<A: RawAllocator>(
  raw: &A,
  ptr: *mut c_void,
  size: usize,
) -> *mut c_void {
  let new_ptr = raw.raw_realloc(ptr, size);
  charge_alloc(raw, CallKind::Realloc, new_ptr);
  new_ptr
}

/// `calloc` interposer body.
///
/// # Safety
///
/// Same contract as C `calloc`.
#[inline]
pub unsafe fn intercepted_calloc<A: RawAllocator>(
  raw: &A,
  nmemb: usize,
  size: usize,
) -> *mut c_void {
  let ptr = raw.raw_calloc(nmemb, size);
  charge_alloc(raw, CallKind::Calloc, ptr);
  ptr
}

/// `memalign` interposer body; charged as a `malloc`.
///
/// # Safety
///
/// Same contract as C `memalign`.
#[inline]
pub unsafe fn intercepted_memalign<A: RawAllocator>(
  raw: &A,
  align: usize,
  size: usize,
) -> *mut c_void {
  let ptr = raw.raw_memalign(align, size);
  charge_alloc(raw, CallKind::Malloc, ptr);
  ptr
}

/// `valloc` interposer body; charged as a `malloc`.
///
/// # Safety
///
/// Same contract as C `valloc`.
#[inline]
pub unsafe fn intercepted_valloc<A: RawAllocator>(raw: &A, size: usize) -> *mut c_void {
  let ptr = raw.raw_valloc(size);
  charge_alloc(raw, CallKind::Malloc, ptr);
  ptr
}

/// `pvalloc` interposer body; charged as a `malloc`.
///
/// # Safety
///
/// Same contract as C `pvalloc`.
#[inline]
pub unsafe fn intercepted_pvalloc<A: RawAllocator>(raw: &A, size: usize) -> *mut c_void {
  let ptr = raw.raw_pvalloc(size);
  charge_alloc(raw, CallKind::Malloc, ptr);
  ptr
}

/// `free` interposer body. The block is measured *before* the raw free so
/// the charge uses the same yardstick as allocation tracking.
///
/// # Safety
///
/// Same contract as C `free`.
#[inline]
pub unsafe fn intercepted_free<A: RawAllocator>(raw: &A, ptr: *mut c_void) {
  if ptr.is_null() {
    raw.raw_free(ptr);
    return;
  }

  let bytes = raw.usable_size(ptr) as u64;
  raw.raw_free(ptr);

  let saved_errno = errno();
  engine::on_free(bytes);
  set_errno(saved_errno);
}

/// Global-allocator wrapper for pure-Rust programs: routes every Rust
/// allocation through the same charge path as the C interposer, with the
/// layout size as the reportable measure.
///
/// ```ignore
/// #[global_allocator]
/// static GLOBAL: mtag::TagAllocator<std::alloc::System> =
///   mtag::TagAllocator::new(std::alloc::System);
/// ```
pub struct TagAllocator<A> {
  inner: A,
}

impl<A> TagAllocator<A> {
  pub const fn new(inner: A) -> Self {
    Self { inner }
  }
}

// SAFETY: allocation is fully delegated to the inner allocator; tracking
// only reads layout sizes and per-thread counters.
unsafe impl<A: GlobalAlloc> GlobalAlloc for TagAllocator<A> {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    let ptr = self.inner.alloc(layout);
    if !ptr.is_null() && layout.size() > 0 {
      engine::on_alloc(CallKind::Malloc, layout.size() as u64);
    }
    ptr
  }

  unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
    let ptr = self.inner.alloc_zeroed(layout);
    if !ptr.is_null() && layout.size() > 0 {
      engine::on_alloc(CallKind::Calloc, layout.size() as u64);
    }
    ptr
  }

  unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    let new_ptr = self.inner.realloc(ptr, layout, new_size);
    if !new_ptr.is_null() && new_size > 0 {
      engine::on_alloc(CallKind::Realloc, new_size as u64);
    }
    new_ptr
  }

  unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
    self.inner.dealloc(ptr, layout);
    if layout.size() > 0 {
      engine::on_free(layout.size() as u64);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::alloc::System;

  #[test]
  fn libc_round_trip_reports_usable_size() {
    unsafe {
      let ptr = intercepted_malloc(&LibcAllocator, 100);
      assert!(!ptr.is_null());
      assert!(LibcAllocator.usable_size(ptr) >= 100);
      intercepted_free(&LibcAllocator, ptr);
    }
  }

  #[test]
  fn calloc_zeroes_and_realloc_preserves() {
    unsafe {
      let ptr = intercepted_calloc(&LibcAllocator, 4, 32).cast::<u8>();
      assert!(!ptr.is_null());
      for offset in 0..128 {
        assert_eq!(*ptr.add(offset), 0);
      }
      *ptr = 0xAB;

      let grown = intercepted_realloc(&LibcAllocator, ptr.cast(), 4096).cast::<u8>();
      assert!(!grown.is_null());
      assert_eq!(*grown, 0xAB);
      intercepted_free(&LibcAllocator, grown.cast());
    }
  }

  #[test]
  fn aligned_variants_respect_their_alignment() {
    unsafe {
      let ptr = intercepted_memalign(&LibcAllocator, 64, 200);
      assert!(!ptr.is_null());
      assert_eq!(ptr as usize % 64, 0);
      intercepted_free(&LibcAllocator, ptr);

      let page = page_size();
      let ptr = intercepted_valloc(&LibcAllocator, 10);
      assert_eq!(ptr as usize % page, 0);
      intercepted_free(&LibcAllocator, ptr);

      let ptr = intercepted_pvalloc(&LibcAllocator, 10);
      assert_eq!(ptr as usize % page, 0);
      assert!(LibcAllocator.usable_size(ptr) >= page);
      intercepted_free(&LibcAllocator, ptr);
    }
  }

  #[test]
  fn free_of_null_passes_through() {
    unsafe {
      intercepted_free(&LibcAllocator, std::ptr::null_mut());
    }
  }

  #[test]
  fn errno_survives_tracking() {
    unsafe {
      set_errno(0);
      let ptr = intercepted_malloc(&LibcAllocator, 64);
      set_errno(7);
      intercepted_free(&LibcAllocator, ptr);
      assert_eq!(errno(), 7);
    }
  }

  #[test]
  fn tag_allocator_delegates_to_its_inner() {
    let allocator = TagAllocator::new(System);
    let layout = Layout::from_size_align(256, 8).expect("layout");
    unsafe {
      let ptr = allocator.alloc(layout);
      assert!(!ptr.is_null());
      *ptr = 42;
      assert_eq!(*ptr, 42);

      let zeroed = allocator.alloc_zeroed(layout);
      assert!(!zeroed.is_null());
      assert_eq!(*zeroed, 0);

      allocator.dealloc(ptr, layout);
      allocator.dealloc(zeroed, layout);
    }
  }
}
