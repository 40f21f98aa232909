//! `LD_PRELOAD` shim for the `mtag` profiler.
//!
//! Compiles into a dynamic library exporting the C allocation family
//! (`malloc`, `free`, `realloc`, `calloc`, `memalign`, `valloc`, `pvalloc`).
//! Loaded first, these symbols shadow the libc allocator for the whole
//! process:
//!
//! ```bash
//! LD_PRELOAD=libmtag_preload.so ./my_program
//! ```
//!
//! Every call delegates to the real allocator resolved through
//! `dlsym(RTLD_NEXT)` and is then charged to the calling thread's current
//! scope. Tracking activates once the host process calls `mtag::init`;
//! until then allocations are only summed into the before-init counter.
//!
//! `dlsym` itself may call `calloc` while we are busy resolving it. Those
//! re-entrant requests are served from a small static bump heap that is
//! never returned to libc.

use std::cell::Cell;
use std::ffi::c_void;
use std::sync::atomic::{AtomicUsize, Ordering};

use once_cell::sync::Lazy;

use mtag::{
  intercepted_calloc, intercepted_free, intercepted_malloc, intercepted_memalign,
  intercepted_pvalloc, intercepted_realloc, intercepted_valloc, RawAllocator,
};

// ---------------------------------------------------------------------------
// Bootstrap heap: serves allocations that arrive while dlsym is resolving
// the real allocator. Blocks carry a size header and are never freed.
// ---------------------------------------------------------------------------

const BOOTSTRAP_CAPACITY: usize = 64 * 1024;
const BOOTSTRAP_ALIGN: usize = 16;

#[repr(align(16))]
struct BootstrapHeap {
  storage: std::cell::UnsafeCell<[u8; BOOTSTRAP_CAPACITY]>,
}

// SAFETY: chunks are carved out with an atomic bump pointer, so two threads
// never touch the same region.
unsafe impl Sync for BootstrapHeap {}

static BOOTSTRAP: BootstrapHeap = BootstrapHeap {
  storage: std::cell::UnsafeCell::new([0; BOOTSTRAP_CAPACITY]),
};
static BOOTSTRAP_USED: AtomicUsize = AtomicUsize::new(0);

fn bootstrap_base() -> *mut u8 {
  BOOTSTRAP.storage.get().cast::<u8>()
}

// One aligned header slot in front of each payload keeps the payload
// 16-aligned and remembers the requested size for usable_size/realloc.
fn bootstrap_alloc(size: usize) -> *mut c_void {
  let Some(payload) = size.checked_next_multiple_of(BOOTSTRAP_ALIGN) else {
    return std::ptr::null_mut();
  };
  let need = payload + BOOTSTRAP_ALIGN;

  let offset = BOOTSTRAP_USED.fetch_add(need, Ordering::Relaxed);
  if offset.saturating_add(need) > BOOTSTRAP_CAPACITY {
    return std::ptr::null_mut();
  }

  // SAFETY: the bump reservation above makes [offset, offset+need) ours
  // alone; the storage is static and 16-aligned.
  unsafe {
    let header = bootstrap_base().add(offset);
    header.cast::<usize>().write(size);
    header.add(BOOTSTRAP_ALIGN).cast::<c_void>()
  }
}

fn bootstrap_contains(ptr: *mut c_void) -> bool {
  let base = bootstrap_base() as usize;
  let addr = ptr as usize;
  addr >= base && addr < base + BOOTSTRAP_CAPACITY
}

fn bootstrap_size(ptr: *mut c_void) -> usize {
  debug_assert!(bootstrap_contains(ptr));
  // SAFETY: every bootstrap pointer sits one header slot after its size.
  unsafe { ptr.cast::<u8>().sub(BOOTSTRAP_ALIGN).cast::<usize>().read() }
}

// ---------------------------------------------------------------------------
// The real allocator, resolved once through RTLD_NEXT.
// ---------------------------------------------------------------------------

type AllocFn = unsafe extern "C" fn(usize) -> *mut c_void;
type ReallocFn = unsafe extern "C" fn(*mut c_void, usize) -> *mut c_void;
type CallocFn = unsafe extern "C" fn(usize, usize) -> *mut c_void;
type MemalignFn = unsafe extern "C" fn(usize, usize) -> *mut c_void;
type FreeFn = unsafe extern "C" fn(*mut c_void);
type UsableSizeFn = unsafe extern "C" fn(*mut c_void) -> usize;

struct RealFns {
  malloc: AllocFn,
  realloc: ReallocFn,
  calloc: CallocFn,
  memalign: MemalignFn,
  valloc: Option<AllocFn>,
  pvalloc: Option<AllocFn>,
  free: FreeFn,
  usable_size: Option<UsableSizeFn>,
}

unsafe fn next_symbol(name: &'static std::ffi::CStr) -> *mut c_void {
  libc::dlsym(libc::RTLD_NEXT, name.as_ptr())
}

static REAL: Lazy<RealFns> = Lazy::new(|| {
  let must = |name: &'static std::ffi::CStr| {
    // SAFETY: dlsym only reads the symbol name.
    let sym = unsafe { next_symbol(name) };
    if sym.is_null() {
      // Without a real allocator underneath there is nothing sensible left
      // to do in this process.
      panic!("mtag-preload: {name:?} not found below us in link order");
    }
    sym
  };

  // SAFETY: the transmutes match the C prototypes of the looked-up symbols.
  unsafe {
    RealFns {
      malloc: std::mem::transmute::<*mut c_void, AllocFn>(must(c"malloc")),
      realloc: std::mem::transmute::<*mut c_void, ReallocFn>(must(c"realloc")),
      calloc: std::mem::transmute::<*mut c_void, CallocFn>(must(c"calloc")),
      memalign: std::mem::transmute::<*mut c_void, MemalignFn>(must(c"memalign")),
      valloc: optional_fn(next_symbol(c"valloc")),
      pvalloc: optional_fn(next_symbol(c"pvalloc")),
      free: std::mem::transmute::<*mut c_void, FreeFn>(must(c"free")),
      usable_size: optional_usable(next_symbol(c"malloc_usable_size")),
    }
  }
});

// SAFETY contract for both helpers: `sym` is null or a function matching
// the target prototype.
unsafe fn optional_fn(sym: *mut c_void) -> Option<AllocFn> {
  if sym.is_null() {
    None
  } else {
    Some(std::mem::transmute::<*mut c_void, AllocFn>(sym))
  }
}

unsafe fn optional_usable(sym: *mut c_void) -> Option<UsableSizeFn> {
  if sym.is_null() {
    None
  } else {
    Some(std::mem::transmute::<*mut c_void, UsableSizeFn>(sym))
  }
}

thread_local! {
  /// True only while this thread is inside the dlsym resolution window.
  static RESOLVING: Cell<bool> = const { Cell::new(false) };
}

fn resolving() -> bool {
  RESOLVING.try_with(Cell::get).unwrap_or(false)
}

fn real() -> &'static RealFns {
  if let Some(fns) = Lazy::get(&REAL) {
    return fns;
  }

  let was = RESOLVING
    .try_with(|flag| {
      let previous = flag.get();
      flag.set(true);
      previous
    })
    .unwrap_or(false);
  let fns = Lazy::force(&REAL);
  let _ = RESOLVING.try_with(|flag| flag.set(was));
  fns
}

fn page_size() -> usize {
  // SAFETY: sysconf with a valid name has no preconditions.
  let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
  if page > 0 {
    page as usize
  } else {
    4096
  }
}

/// `RawAllocator` over the functions found below us in link order.
struct RealAllocator;

impl RawAllocator for RealAllocator {
  unsafe fn raw_alloc(&self, size: usize) -> *mut c_void {
    (real().malloc)(size)
  }

  unsafe fn raw_realloc(&self, ptr: *mut c_void, size: usize) -> *mut c_void {
    (real().realloc)(ptr, size)
  }

  unsafe fn raw_calloc(&self, nmemb: usize, size: usize) -> *mut c_void {
    (real().calloc)(nmemb, size)
  }

  unsafe fn raw_memalign(&self, align: usize, size: usize) -> *mut c_void {
    (real().memalign)(align, size)
  }

  unsafe fn raw_valloc(&self, size: usize) -> *mut c_void {
    match real().valloc {
      Some(valloc) => valloc(size),
      None => (real().memalign)(page_size(), size),
    }
  }

  unsafe fn raw_pvalloc(&self, size: usize) -> *mut c_void {
    match real().pvalloc {
      Some(pvalloc) => pvalloc(size),
      None => {
        let page = page_size();
        let rounded = size.checked_next_multiple_of(page).unwrap_or(size);
        (real().memalign)(page, rounded)
      }
    }
  }

  unsafe fn raw_free(&self, ptr: *mut c_void) {
    (real().free)(ptr);
  }

  unsafe fn usable_size(&self, ptr: *mut c_void) -> usize {
    if bootstrap_contains(ptr) {
      return bootstrap_size(ptr);
    }
    match real().usable_size {
      Some(usable_size) => usable_size(ptr),
      None => 0,
    }
  }
}

// ---------------------------------------------------------------------------
// Exported symbols. Raw allocator first, charge second, errno preserved;
// none of these may panic or allocate through themselves.
// ---------------------------------------------------------------------------

/// # Safety
///
/// C `malloc` contract.
#[no_mangle]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
  if resolving() {
    return bootstrap_alloc(size);
  }
  intercepted_malloc(&RealAllocator, size)
}

/// # Safety
///
/// C `free` contract.
#[no_mangle]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
  if ptr.is_null() || bootstrap_contains(ptr) {
    return;
  }
  intercepted_free(&RealAllocator, ptr);
}

/// # Safety
///
/// C `realloc` contract.
#[no_mangle]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
  if resolving() {
    return bootstrap_realloc(ptr, size);
  }

  if bootstrap_contains(ptr) {
    // Migrate a bootstrap block into the real heap; the old chunk stays in
    // the bump buffer for good.
    let out = intercepted_malloc(&RealAllocator, size);
    if !out.is_null() {
      let copy = bootstrap_size(ptr).min(size);
      std::ptr::copy_nonoverlapping(ptr.cast::<u8>(), out.cast::<u8>(), copy);
    }
    return out;
  }

  intercepted_realloc(&RealAllocator, ptr, size)
}

unsafe fn bootstrap_realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
  if ptr.is_null() {
    return bootstrap_alloc(size);
  }
  let out = bootstrap_alloc(size);
  if !out.is_null() && bootstrap_contains(ptr) {
    let copy = bootstrap_size(ptr).min(size);
    std::ptr::copy_nonoverlapping(ptr.cast::<u8>(), out.cast::<u8>(), copy);
  }
  out
}

/// # Safety
///
/// C `calloc` contract.
#[no_mangle]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut c_void {
  if resolving() {
    // The bump heap is statically zeroed, so a fresh chunk satisfies the
    // calloc guarantee as-is.
    let Some(total) = nmemb.checked_mul(size) else {
      return std::ptr::null_mut();
    };
    return bootstrap_alloc(total);
  }
  intercepted_calloc(&RealAllocator, nmemb, size)
}

/// # Safety
///
/// C `memalign` contract.
#[no_mangle]
pub unsafe extern "C" fn memalign(align: usize, size: usize) -> *mut c_void {
  if resolving() {
    if align <= BOOTSTRAP_ALIGN {
      return bootstrap_alloc(size);
    }
    return std::ptr::null_mut();
  }
  intercepted_memalign(&RealAllocator, align, size)
}

/// # Safety
///
/// C `valloc` contract.
#[no_mangle]
pub unsafe extern "C" fn valloc(size: usize) -> *mut c_void {
  if resolving() {
    return std::ptr::null_mut();
  }
  intercepted_valloc(&RealAllocator, size)
}

/// # Safety
///
/// C `pvalloc` contract.
#[no_mangle]
pub unsafe extern "C" fn pvalloc(size: usize) -> *mut c_void {
  if resolving() {
    return std::ptr::null_mut();
  }
  intercepted_pvalloc(&RealAllocator, size)
}
