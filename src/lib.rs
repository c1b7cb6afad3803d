#![allow(clippy::missing_safety_doc)]

//! Best-fit heap allocator over a cyclic, address-ordered free list.
//!
//! Two thread-safe variants share the same engine: [`alloc_locked`] /
//! [`free_locked`] run every operation on one global arena under a lock,
//! while [`alloc_nolock`] / [`free_nolock`] give each thread a private
//! arena so the fast path never contends. Memory comes from a single
//! grow-only segment and is never handed back to the OS.

use core::{
  alloc::{GlobalAlloc, Layout},
  cell::UnsafeCell,
  hint,
  mem::{align_of, size_of},
  ptr::null_mut,
  sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
};
use std::sync::OnceLock;

// =============================================================================
// Constants
// =============================================================================

/// Address space reserved for the heap segment up front.
const SEGMENT_RESERVE: usize = 1 << 30; // 1GB

/// Minimum segment growth in header units. Smaller requests are scaled up
/// so frequent small allocations do not hammer the break lock.
const MIN_ALLOC: usize = 1024;

/// Allocation atom: every size in the engine is a multiple of the header.
const UNIT: usize = size_of::<Header>();

/// Owner tag of the shared arena. Per-thread ids start at 1.
const TID_SHARED: u32 = 0;

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(UNIT.is_power_of_two());
const _: () = assert!(align_of::<Header>() == 16);
const _: () = assert!(UNIT <= 4096); // a page-aligned segment base keeps every header UNIT-aligned
const _: () = assert!(MIN_ALLOC >= 2);
const _: () = assert!(SEGMENT_RESERVE % UNIT == 0);

// =============================================================================
// Block header
// =============================================================================

/// In-band metadata at the start of every managed block, free or live.
/// The header is also the size unit: a block of `size` units spans `size`
/// headers worth of bytes, the first of which is the header itself.
#[repr(C, align(16))]
struct Header {
  /// Next free block in cyclic address order. Unused while the block is live.
  next: *mut Header,
  /// Total block size in units, header included.
  size: usize,
  /// Arena tag: `TID_SHARED`, or the owning thread's id.
  tid: u32,
}

/// Upper neighbor in the address space: one past the block's last unit.
#[inline]
unsafe fn upper(h: *mut Header) -> *mut Header {
  unsafe { h.add((*h).size) }
}

/// The caller-visible payload starts one unit past the header.
#[inline]
unsafe fn payload(h: *mut Header) -> *mut u8 {
  unsafe { h.add(1) as *mut u8 }
}

/// Recover the header from a pointer handed out by `payload`.
#[inline]
unsafe fn header_of(p: *mut u8) -> *mut Header {
  unsafe { (p as *mut Header).sub(1) }
}

/// Byte request to unit count, header unit included. `None` on overflow.
/// A zero-byte request still gets one payload unit.
#[inline]
fn request_units(bytes: usize) -> Option<usize> {
  let bytes = bytes.max(1);
  Some(bytes.checked_add(UNIT - 1)? / UNIT + 1)
}

// =============================================================================
// Spin lock
// =============================================================================

struct SpinLock {
  locked: AtomicBool,
}

impl SpinLock {
  const fn new() -> Self {
    Self {
      locked: AtomicBool::new(false),
    }
  }

  #[inline]
  fn lock(&self) {
    while self
      .locked
      .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
      .is_err()
    {
      while self.locked.load(Ordering::Relaxed) {
        hint::spin_loop();
      }
    }
  }

  #[inline]
  fn unlock(&self) {
    self.locked.store(false, Ordering::Release);
  }
}

// =============================================================================
// Platform
// =============================================================================

unsafe fn os_mmap(size: usize) -> *mut u8 {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    null_mut()
  } else {
    ptr as *mut u8
  }
}

// Each thread gets a different ID. 0 is reserved for the shared arena.
fn thread_id_u32() -> u32 {
  thread_local! {
    static TID: u32 = {
      static CTR: AtomicU32 = AtomicU32::new(1);
      CTR.fetch_add(1, Ordering::Relaxed) // We only need uniqueness, not synchronization
    };
  }
  TID.with(|&id| id)
}

// =============================================================================
// Heap segment
// =============================================================================

/// One contiguous grow-only reservation standing in for the process data
/// segment. `extend` follows the classic break protocol: move the break up,
/// hand back the previous break, null when the reservation runs out. The
/// break never moves down.
struct Segment {
  base: *mut u8,
  limit: usize,
  /// Serializes every break move. Distinct from any list lock.
  lock: SpinLock,
  /// Break offset from `base`. Written only under `lock`.
  brk: AtomicUsize,
}

unsafe impl Sync for Segment {}
unsafe impl Send for Segment {}

static SEGMENT: OnceLock<Segment> = OnceLock::new();

impl Segment {
  fn get() -> &'static Segment {
    SEGMENT.get_or_init(|| {
      let base = unsafe { os_mmap(SEGMENT_RESERVE) };
      debug_assert!(base as usize % UNIT == 0);
      Segment {
        base,
        limit: if base.is_null() { 0 } else { SEGMENT_RESERVE },
        lock: SpinLock::new(),
        brk: AtomicUsize::new(0),
      }
    })
  }

  /// Move the break up by `bytes`, returning the previous break. Null once
  /// the reservation is exhausted, or forever if the initial map failed.
  fn extend(&self, bytes: usize) -> *mut u8 {
    self.lock.lock();
    let brk = self.brk.load(Ordering::Relaxed);
    let ptr = if bytes > self.limit - brk {
      null_mut()
    } else {
      self.brk.store(brk + bytes, Ordering::Relaxed);
      unsafe { self.base.add(brk) }
    };
    self.lock.unlock();
    ptr
  }

  /// Whether `ptr` lies in memory already handed out by `extend`.
  fn contains(&self, ptr: *mut u8) -> bool {
    let base = self.base as usize;
    let addr = ptr as usize;
    addr >= base && addr < base + self.brk.load(Ordering::Relaxed)
  }
}

/// Total bytes acquired from the OS so far.
pub fn heap_size() -> usize {
  Segment::get().brk.load(Ordering::Relaxed)
}

// =============================================================================
// Arena / free-list engine
// =============================================================================

/// One cyclic address-ordered free list: an embedded zero-sized sentinel
/// that is always a member, plus a roving cursor. The sentinel is
/// self-linked at init, so an arena must never move afterwards; arenas
/// live in statics or in thread-local storage.
struct Arena {
  /// Permanent zero-sized member. Search entry point and sort anchor.
  base: Header,
  /// Some current member of the ring. Repositioned after every mutation
  /// so the next operation starts near the last one.
  head: *mut Header,
  /// Tag stamped on every block this arena hands out.
  tid: u32,
}

impl Arena {
  const fn new() -> Self {
    Self {
      base: Header {
        next: null_mut(),
        size: 0,
        tid: TID_SHARED,
      },
      head: null_mut(),
      tid: TID_SHARED,
    }
  }

  /// First-use setup: close the ring over the sentinel.
  fn init(&mut self, tid: u32) {
    let base: *mut Header = &mut self.base;
    self.base.next = base;
    self.base.tid = tid;
    self.head = base;
    self.tid = tid;
  }

  #[inline]
  fn ready(&self) -> bool {
    !self.head.is_null()
  }
}

/// One full lap of best-fit search. An exact fit is unlinked and returned
/// on the spot. Otherwise the smallest block that fits donates `units`
/// from its high end, so the resident node keeps its links and only its
/// size changes. Null after a dry lap; the caller grows the segment and
/// retries with fresh state.
unsafe fn search(arena: &mut Arena, units: usize) -> *mut u8 {
  let mut prev = arena.head;
  let mut curr = unsafe { (*prev).next };
  let mut best: *mut Header = null_mut();
  let mut best_prev: *mut Header = null_mut();
  let mut best_slack = usize::MAX;

  loop {
    let size = unsafe { (*curr).size };
    if size == units {
      unsafe { (*prev).next = (*curr).next };
      arena.head = prev;
      return unsafe { payload(curr) };
    }
    // First encountered wins among equal sizes.
    if size > units && size - units < best_slack {
      best_slack = size - units;
      best = curr;
      best_prev = prev;
    }
    if curr == arena.head {
      break;
    }
    prev = curr;
    curr = unsafe { (*curr).next };
  }

  if best.is_null() {
    return null_mut();
  }

  unsafe {
    (*best).size -= units;
    let out = upper(best);
    (*out).size = units;
    (*out).tid = arena.tid;
    arena.head = best_prev;
    payload(out)
  }
}

/// Insert a free block at its address position, merging with whichever
/// neighbors are contiguous. The upper merge runs first so that when both
/// neighbors are free, the lower merge folds the already-combined block
/// into its predecessor.
unsafe fn insert(arena: &mut Arena, blk: *mut Header) {
  unsafe {
    // Find t with blk inside the open interval (t, t.next). The wrap pair
    // is the one place where t >= t.next; there blk belongs if it sits
    // above the wrap or below the list minimum.
    let mut t = arena.head;
    loop {
      let next = (*t).next;
      if (t < blk && blk < next) || (t >= next && (blk > t || blk < next)) {
        break;
      }
      t = next;
    }

    let next = (*t).next;
    if upper(blk) == next {
      (*blk).size += (*next).size;
      (*blk).next = (*next).next;
    } else {
      (*blk).next = next;
    }
    if upper(t) == blk {
      (*t).size += (*blk).size;
      (*t).next = (*blk).next;
    } else {
      (*t).next = blk;
    }
    arena.head = t;
  }
}

// =============================================================================
// Segment growth
// =============================================================================

/// Ask the segment for at least `units` fresh units, wrapped as one free
/// block tagged for `tid`. Small requests are scaled up to the largest
/// multiple of `units` not exceeding `MIN_ALLOC`.
fn grow(mut units: usize, tid: u32) -> *mut Header {
  if units < MIN_ALLOC {
    units *= MIN_ALLOC / units;
  }
  let Some(bytes) = units.checked_mul(UNIT) else {
    return null_mut();
  };
  let ptr = Segment::get().extend(bytes);
  if ptr.is_null() {
    return null_mut();
  }
  let blk = ptr as *mut Header;
  unsafe {
    (*blk).next = null_mut();
    (*blk).size = units;
    (*blk).tid = tid;
  }
  blk
}

// =============================================================================
// Locked variant
// =============================================================================

/// The shared arena and the lock serializing every mutation of it.
struct SharedArena {
  lock: SpinLock,
  arena: UnsafeCell<Arena>,
}

unsafe impl Sync for SharedArena {}

static SHARED: SharedArena = SharedArena {
  lock: SpinLock::new(),
  arena: UnsafeCell::new(Arena::new()),
};

/// Allocate `size` bytes from the shared arena. Thread-safe. Null when the
/// segment cannot grow or the unit conversion overflows.
pub unsafe fn alloc_locked(size: usize) -> *mut u8 {
  let Some(units) = request_units(size) else {
    return null_mut();
  };

  SHARED.lock.lock();
  loop {
    let p = {
      let arena = unsafe { &mut *SHARED.arena.get() };
      if !arena.ready() {
        arena.init(TID_SHARED);
      }
      unsafe { search(arena, units) }
    };
    if !p.is_null() {
      SHARED.lock.unlock();
      return p;
    }

    // The list lock is never held across a break move.
    SHARED.lock.unlock();
    let blk = grow(units, TID_SHARED);
    if blk.is_null() {
      return null_mut();
    }
    // Insert and retry inside the same critical section.
    SHARED.lock.lock();
    unsafe { insert(&mut *SHARED.arena.get(), blk) };
  }
}

/// Return `ptr` to the shared arena, coalescing with free neighbors.
/// `ptr` must come from `alloc_locked` and not have been freed since.
pub unsafe fn free_locked(ptr: *mut u8) {
  if ptr.is_null() {
    return;
  }
  debug_assert!(Segment::get().contains(ptr));
  let blk = unsafe { header_of(ptr) };
  SHARED.lock.lock();
  let arena = unsafe { &mut *SHARED.arena.get() };
  debug_assert!(arena.ready());
  unsafe { insert(arena, blk) };
  SHARED.lock.unlock();
}

// =============================================================================
// Per-thread variant
// =============================================================================

thread_local! {
  static ARENA: UnsafeCell<Arena> = const { UnsafeCell::new(Arena::new()) };
}

/// Run `f` on the calling thread's arena, initializing it on first use.
/// None once TLS is being torn down.
fn with_arena<R>(f: impl FnOnce(&mut Arena) -> R) -> Option<R> {
  ARENA
    .try_with(|cell| {
      let arena = unsafe { &mut *cell.get() };
      if !arena.ready() {
        arena.init(thread_id_u32());
      }
      f(arena)
    })
    .ok()
}

/// Allocate `size` bytes from the calling thread's private arena. The list
/// is touched without any lock; only segment growth contends. The payload
/// must be freed on this same thread.
pub unsafe fn alloc_nolock(size: usize) -> *mut u8 {
  let Some(units) = request_units(size) else {
    return null_mut();
  };

  with_arena(|arena| loop {
    let p = unsafe { search(arena, units) };
    if !p.is_null() {
      return p;
    }
    let blk = grow(units, arena.tid);
    if blk.is_null() {
      return null_mut();
    }
    unsafe { insert(arena, blk) };
  })
  .unwrap_or(null_mut())
}

/// Return `ptr` to the arena of the thread that allocated it. Called from
/// any other thread, the free is dropped and the block leaks until that
/// thread's arena is torn down.
pub unsafe fn free_nolock(ptr: *mut u8) {
  if ptr.is_null() {
    return;
  }
  debug_assert!(Segment::get().contains(ptr));
  let blk = unsafe { header_of(ptr) };
  with_arena(|arena| {
    // Blocks tagged for another thread are dropped, not spliced in.
    if unsafe { (*blk).tid } != arena.tid {
      return;
    }
    unsafe { insert(arena, blk) };
  });
}

// =============================================================================
// GlobalAlloc
// =============================================================================

/// The locked variant as a Rust allocator. Payloads are naturally
/// `UNIT`-aligned; larger alignments are met by over-allocating and
/// aligning inside the payload.
pub struct Ouros;

unsafe impl GlobalAlloc for Ouros {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    let align = layout.align();
    if align <= UNIT {
      return unsafe { alloc_locked(layout.size()) };
    }

    // Over-aligned: pad the request, then stash the true payload start one
    // pointer below the aligned address for dealloc. The gap is a multiple
    // of UNIT and at least UNIT, so the stash always fits.
    let Some(size) = layout.size().checked_add(align) else {
      return null_mut();
    };
    let raw = unsafe { alloc_locked(size) };
    if raw.is_null() {
      return null_mut();
    }
    let aligned = (raw as usize + align) & !(align - 1);
    unsafe { (aligned as *mut *mut u8).sub(1).write(raw) };
    aligned as *mut u8
  }

  unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
    if layout.align() <= UNIT {
      unsafe { free_locked(ptr) };
      return;
    }
    let raw = unsafe { (ptr as *mut *mut u8).sub(1).read() };
    unsafe { free_locked(raw) };
  }
}

// =============================================================================
// C API (enabled with --features c_api)
// =============================================================================

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ouros_malloc_lock(size: usize) -> *mut u8 {
  unsafe { alloc_locked(size) }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ouros_free_lock(ptr: *mut u8) {
  unsafe { free_locked(ptr) }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ouros_malloc_nolock(size: usize) -> *mut u8 {
  unsafe { alloc_nolock(size) }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ouros_free_nolock(ptr: *mut u8) {
  unsafe { free_nolock(ptr) }
}
