//! Whole-cache invalidation: INVD and WBINVD.
//!
//! Both instructions act on every cache level visible to the *issuing*
//! logical processor and nothing else. Nothing in this module broadcasts to
//! other CPUs; a caller that needs system-wide invalidation has to run the
//! operation on each CPU itself (typically from an IPI handler).
//!
//! [`invd`] and [`wbinvd`] are `#[inline(always)]` and expand to exactly one
//! instruction at the call site. The same two instructions are also emitted
//! out of line (instruction + `ret`) for assembly trampolines and
//! function-pointer dispatch, see [`invd_entry`] and [`wbinvd_entry`].

use core::arch::asm;

use spin::Mutex;

use crate::klog_trace;

/// `INVD` encoding.
pub const INVD_OPCODE: [u8; 2] = [0x0F, 0x08];
/// `WBINVD` encoding.
pub const WBINVD_OPCODE: [u8; 2] = [0x0F, 0x09];
/// Near `RET` encoding, terminates each out-of-line primitive.
pub const RET_OPCODE: u8 = 0xC3;

/// Length of an out-of-line primitive: the instruction followed by `ret`.
pub const PRIMITIVE_LEN: usize = 3;

// =============================================================================
// Facade
// =============================================================================

/// Invalidate all caches of this CPU without writing back modified lines.
///
/// # Safety
///
/// Every dirty line held by this logical processor is dropped, including
/// lines backing the caller's own stack. The caller must know that no live
/// dirty data exists (memory was just reset, or a [`wbinvd`] ran with nothing
/// written since) or accept the loss. Interrupts should be masked around the
/// call, see [`invd_irqsave`](super::interrupts::invd_irqsave).
///
/// Outside CPL 0 the instruction raises `#GP`; that fault belongs to the
/// exception layer, not to this function.
#[inline(always)]
pub unsafe fn invd() {
    unsafe {
        asm!("invd", options(nostack, preserves_flags));
    }
}

/// Write back all modified cache lines of this CPU, then invalidate.
///
/// No data is lost. The instruction is not interruptible and can stall the
/// issuing CPU for a time proportional to cache size.
#[inline(always)]
pub fn wbinvd() {
    unsafe {
        asm!("wbinvd", options(nostack, preserves_flags));
    }
}

// =============================================================================
// Out-of-line primitives
// =============================================================================

mod raw {
    use core::arch::global_asm;

    global_asm!(
        ".pushsection .text",
        ".balign 16",
        ".global hvx_invd",
        "hvx_invd:",
        "    invd",
        "    ret",
        ".balign 16",
        ".global hvx_wbinvd",
        "hvx_wbinvd:",
        "    wbinvd",
        "    ret",
        ".popsection",
    );

    unsafe extern "C" {
        pub(super) fn hvx_invd();
        pub(super) fn hvx_wbinvd();
    }
}

/// Address of an out-of-line cache primitive.
///
/// Calling it has the same contract as the corresponding inline operation.
/// The primitives clobber no register and no flag; only `rsp` moves for the
/// `call`/`ret` pair.
pub type CacheEntryFn = unsafe extern "C" fn();

/// Out-of-line `INVD; RET`. Same safety contract as [`invd`].
///
/// The `call` stores a return address that the INVD can drop along with
/// every other dirty line. Only assembly that owns its stack discipline
/// (for example a trampoline that calls it on a stack written back and left
/// untouched) should use it; Rust code uses [`invd`] or
/// [`invd_irqsave`](super::interrupts::invd_irqsave).
#[inline]
pub fn invd_entry() -> CacheEntryFn {
    raw::hvx_invd
}

/// Out-of-line `WBINVD; RET`.
#[inline]
pub fn wbinvd_entry() -> CacheEntryFn {
    raw::hvx_wbinvd
}

// =============================================================================
// Operation labels
// =============================================================================

/// Names one of the two cache operations.
///
/// This is a label for recording and inspection only. There is deliberately
/// no `flush(CacheOp)` entry point: call sites name [`invd`] or [`wbinvd`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CacheOp {
    InvalidateNoWriteback,
    InvalidateWithWriteback,
}

impl CacheOp {
    pub const fn mnemonic(self) -> &'static str {
        match self {
            CacheOp::InvalidateNoWriteback => "invd",
            CacheOp::InvalidateWithWriteback => "wbinvd",
        }
    }

    pub const fn opcode(self) -> [u8; 2] {
        match self {
            CacheOp::InvalidateNoWriteback => INVD_OPCODE,
            CacheOp::InvalidateWithWriteback => WBINVD_OPCODE,
        }
    }

    /// True if dirty lines may be lost.
    pub const fn is_destructive(self) -> bool {
        matches!(self, CacheOp::InvalidateNoWriteback)
    }

    /// Bytes the out-of-line primitive for this operation must consist of.
    pub const fn expected_primitive(self) -> [u8; PRIMITIVE_LEN] {
        let op = self.opcode();
        [op[0], op[1], RET_OPCODE]
    }

    pub const fn entry(self) -> fn() -> CacheEntryFn {
        match self {
            CacheOp::InvalidateNoWriteback => invd_entry,
            CacheOp::InvalidateWithWriteback => wbinvd_entry,
        }
    }
}

impl core::fmt::Display for CacheOp {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// Read the first [`PRIMITIVE_LEN`] bytes of the out-of-line primitive for `op`.
///
/// Reads code memory, never executes it, so it works at any privilege level
/// as long as the text segment is readable.
pub fn primitive_bytes(op: CacheOp) -> [u8; PRIMITIVE_LEN] {
    let base = (op.entry())() as usize as *const u8;
    let mut bytes = [0u8; PRIMITIVE_LEN];
    for (i, byte) in bytes.iter_mut().enumerate() {
        // SAFETY: the primitive is PRIMITIVE_LEN bytes of mapped text.
        *byte = unsafe { base.add(i).read_volatile() };
    }
    bytes
}

// =============================================================================
// Seam for higher layers
// =============================================================================

/// Cache maintenance as seen by code that wants to be testable off-hardware.
///
/// Two methods, one per instruction, so the destructive call stays visible
/// at every call site.
pub trait CacheControl {
    /// # Safety
    ///
    /// Same contract as [`invd`].
    unsafe fn invalidate_no_writeback(&self);

    fn invalidate_with_writeback(&self);
}

/// The real processor. Zero-sized; forwards straight to [`invd`]/[`wbinvd`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HardwareCache;

impl CacheControl for HardwareCache {
    #[inline(always)]
    unsafe fn invalidate_no_writeback(&self) {
        unsafe { invd() }
    }

    #[inline(always)]
    fn invalidate_with_writeback(&self) {
        wbinvd()
    }
}

impl<C: CacheControl + ?Sized> CacheControl for &C {
    #[inline(always)]
    unsafe fn invalidate_no_writeback(&self) {
        unsafe { (**self).invalidate_no_writeback() }
    }

    #[inline(always)]
    fn invalidate_with_writeback(&self) {
        (**self).invalidate_with_writeback()
    }
}

pub const RECORDING_CACHE_CAPACITY: usize = 32;

struct RecordLog {
    ops: [Option<CacheOp>; RECORDING_CACHE_CAPACITY],
    len: usize,
    dropped: usize,
}

/// Records requested operations in order instead of executing them.
///
/// Holds no model of cache contents. Once [`RECORDING_CACHE_CAPACITY`]
/// entries are stored further requests are only counted in [`dropped`].
///
/// [`dropped`]: RecordingCache::dropped
pub struct RecordingCache {
    log: Mutex<RecordLog>,
}

impl RecordingCache {
    pub const fn new() -> Self {
        Self {
            log: Mutex::new(RecordLog {
                ops: [None; RECORDING_CACHE_CAPACITY],
                len: 0,
                dropped: 0,
            }),
        }
    }

    fn record(&self, op: CacheOp) {
        let mut log = self.log.lock();
        if log.len < RECORDING_CACHE_CAPACITY {
            let idx = log.len;
            log.ops[idx] = Some(op);
            log.len += 1;
        } else {
            log.dropped += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.log.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, idx: usize) -> Option<CacheOp> {
        let log = self.log.lock();
        if idx < log.len { log.ops[idx] } else { None }
    }

    pub fn last(&self) -> Option<CacheOp> {
        let log = self.log.lock();
        log.len.checked_sub(1).and_then(|idx| log.ops[idx])
    }

    pub fn count(&self, op: CacheOp) -> usize {
        let log = self.log.lock();
        log.ops[..log.len]
            .iter()
            .filter(|recorded| **recorded == Some(op))
            .count()
    }

    /// Requests that arrived after the log was full.
    pub fn dropped(&self) -> usize {
        self.log.lock().dropped
    }

    /// Copy of the recorded operations; only the first `len` slots are set.
    pub fn snapshot(&self) -> ([Option<CacheOp>; RECORDING_CACHE_CAPACITY], usize) {
        let log = self.log.lock();
        (log.ops, log.len)
    }

    pub fn clear(&self) {
        let mut log = self.log.lock();
        log.ops = [None; RECORDING_CACHE_CAPACITY];
        log.len = 0;
        log.dropped = 0;
    }
}

impl Default for RecordingCache {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheControl for RecordingCache {
    unsafe fn invalidate_no_writeback(&self) {
        self.record(CacheOp::InvalidateNoWriteback);
    }

    fn invalidate_with_writeback(&self) {
        self.record(CacheOp::InvalidateWithWriteback);
    }
}

/// Emits a trace line per request, then forwards to `C`.
pub struct LoggedCache<C> {
    inner: C,
    tag: &'static str,
}

impl<C: CacheControl> LoggedCache<C> {
    pub const fn new(inner: C, tag: &'static str) -> Self {
        Self { inner, tag }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    pub fn into_inner(self) -> C {
        self.inner
    }
}

impl<C: CacheControl> CacheControl for LoggedCache<C> {
    unsafe fn invalidate_no_writeback(&self) {
        klog_trace!("cache[{}]: {}", self.tag, CacheOp::InvalidateNoWriteback);
        unsafe { self.inner.invalidate_no_writeback() }
    }

    fn invalidate_with_writeback(&self) {
        klog_trace!("cache[{}]: {}", self.tag, CacheOp::InvalidateWithWriteback);
        self.inner.invalidate_with_writeback()
    }
}
