//! Cache facade suites. Everything here runs at CPL 0.
//!
//! `cache_encoding` and `cache_writeback` are always safe to run.
//! `cache_invalidate` executes INVD and only runs with
//! `itests.destructive=on`; every INVD in it is preceded by a WBINVD with
//! interrupts masked so no live dirty line can be lost.

use core::arch::asm;
use core::ffi::c_char;
use core::hint::black_box;
use core::ptr;

use hvx_lib::cpu::cache::{self, CacheEntryFn, CacheOp, PRIMITIVE_LEN, primitive_bytes};
use hvx_lib::cpu::{CacheControl, HardwareCache, IrqSaveGuard, are_interrupts_enabled};
use hvx_lib::testing::{
    TestConfig, TestResult, TestSuiteDesc, TestSuiteResult, measure_elapsed_ms, run_single_test,
};
use hvx_lib::{
    assert_eq_test, assert_slice_eq_test, assert_test, define_test_suite, klog_info, pass, run_test,
    skip,
};

/// Eight cache lines.
const WORDS: usize = 64;

const SEED_CLEAN: u64 = 0x0123_4567_89AB_CDEF;
const SEED_DIRTY: u64 = 0xDEAD_BEEF_CAFE_BABE;
const SEED_INVD: u64 = 0x5A5A_A5A5_0F0F_F0F0;

#[repr(C, align(64))]
struct LineBuffer([u64; WORDS]);

fn pattern_word(seed: u64, idx: usize) -> u64 {
    seed.rotate_left(idx as u32) ^ (idx as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

fn expected(seed: u64) -> [u64; WORDS] {
    let mut words = [0u64; WORDS];
    for (idx, word) in words.iter_mut().enumerate() {
        *word = pattern_word(seed, idx);
    }
    words
}

impl LineBuffer {
    fn new() -> Self {
        Self([0; WORDS])
    }

    fn fill(&mut self, seed: u64) {
        for (idx, word) in self.0.iter_mut().enumerate() {
            unsafe { ptr::write_volatile(word, pattern_word(seed, idx)) };
        }
    }

    /// Touch every line so it is resident before the test dirties it.
    fn warm(&self) -> u64 {
        self.0
            .iter()
            .fold(0, |acc, word| acc ^ unsafe { ptr::read_volatile(word) })
    }

    fn snapshot(&self) -> [u64; WORDS] {
        let mut out = [0u64; WORDS];
        for (dst, word) in out.iter_mut().zip(self.0.iter()) {
            *dst = unsafe { ptr::read_volatile(word) };
        }
        out
    }

    /// Memory holds the clean pattern, the cache holds the dirty one.
    fn prepare_dirty(&mut self) {
        self.fill(SEED_CLEAN);
        cache::wbinvd();
        let _ = black_box(self.warm());
        self.fill(SEED_DIRTY);
    }
}

// =============================================================================
// Out-of-line call observation
// =============================================================================

const REG_SEEDS: [u64; 9] = [
    0x1111_0000_0000_0001,
    0x2222_0000_0000_0002,
    0x3333_0000_0000_0003,
    0x4444_0000_0000_0004,
    0x5555_0000_0000_0005,
    0x6666_0000_0000_0006,
    0x7777_0000_0000_0007,
    0x8888_0000_0000_0008,
    0x9999_0000_0000_0009,
];

struct CallObservation {
    regs: [u64; 9],
    flags_before: u64,
    flags_after: u64,
}

/// Call a primitive with known values in every caller-saved GPR and CF set,
/// capturing RFLAGS immediately before and after the call.
fn observe_call(entry: CacheEntryFn) -> CallObservation {
    let [mut rax, mut rcx, mut rdx, mut rsi, mut rdi, mut r8, mut r9, mut r10, mut r11] = REG_SEEDS;
    let flags_before: u64;
    let flags_after: u64;
    unsafe {
        asm!(
            "stc",
            "pushfq",
            "pop r12",
            "call {entry}",
            "pushfq",
            "pop r13",
            entry = in(reg) entry as usize,
            inout("rax") rax,
            inout("rcx") rcx,
            inout("rdx") rdx,
            inout("rsi") rsi,
            inout("rdi") rdi,
            inout("r8") r8,
            inout("r9") r9,
            inout("r10") r10,
            inout("r11") r11,
            out("r12") flags_before,
            out("r13") flags_after,
        );
    }
    CallObservation {
        regs: [rax, rcx, rdx, rsi, rdi, r8, r9, r10, r11],
        flags_before,
        flags_after,
    }
}

/// Arithmetic flags as stored by `lahf`: SF, ZF, AF, PF, CF.
const LAHF_MASK: u64 = 0xD5;

struct InlineObservation {
    regs: [u64; 8],
    flags_before: u64,
    flags_after: u64,
}

/// WBINVD then INVD inline, with known values in every caller-saved GPR
/// except RAX and CF set. Flags go through `lahf` into registers so nothing
/// is stored between the write-back and the INVD.
fn observe_inline_invd() -> InlineObservation {
    let [_, mut rcx, mut rdx, mut rsi, mut rdi, mut r8, mut r9, mut r10, mut r11] = REG_SEEDS;
    let ah_before: u64;
    let ah_after: u64;
    unsafe {
        asm!(
            "stc",
            "lahf",
            "mov {before}, rax",
            "wbinvd",
            "invd",
            "lahf",
            before = out(reg) ah_before,
            out("rax") ah_after,
            inout("rcx") rcx,
            inout("rdx") rdx,
            inout("rsi") rsi,
            inout("rdi") rdi,
            inout("r8") r8,
            inout("r9") r9,
            inout("r10") r10,
            inout("r11") r11,
            options(nostack),
        );
    }
    InlineObservation {
        regs: [rcx, rdx, rsi, rdi, r8, r9, r10, r11],
        flags_before: (ah_before >> 8) & LAHF_MASK,
        flags_after: (ah_after >> 8) & LAHF_MASK,
    }
}

fn check_observation(obs: &CallObservation, what: &str) -> TestResult {
    assert_test!(obs.flags_before & 1 == 1, "{}: CF not set before call", what);
    assert_eq_test!(obs.flags_after, obs.flags_before, what);
    assert_slice_eq_test!(obs.regs, REG_SEEDS, what);
    pass!()
}

// =============================================================================
// cache_encoding
// =============================================================================

pub fn test_invd_primitive_encoding() -> TestResult {
    assert_eq_test!(
        primitive_bytes(CacheOp::InvalidateNoWriteback),
        [0x0F, 0x08, 0xC3],
        "invd primitive"
    );
    pass!()
}

pub fn test_wbinvd_primitive_encoding() -> TestResult {
    assert_eq_test!(
        primitive_bytes(CacheOp::InvalidateWithWriteback),
        [0x0F, 0x09, 0xC3],
        "wbinvd primitive"
    );
    pass!()
}

pub fn test_primitives_distinct() -> TestResult {
    let invd = cache::invd_entry() as usize;
    let wbinvd = cache::wbinvd_entry() as usize;
    assert_test!(invd != wbinvd, "primitives share an address");
    assert_test!(
        invd.abs_diff(wbinvd) >= PRIMITIVE_LEN,
        "primitives overlap: {:#x} {:#x}",
        invd,
        wbinvd
    );
    pass!()
}

define_test_suite!(
    cache_encoding,
    [
        test_invd_primitive_encoding,
        test_wbinvd_primitive_encoding,
        test_primitives_distinct,
    ]
);

// =============================================================================
// cache_writeback
// =============================================================================

pub fn test_wbinvd_preserves_dirty_lines() -> TestResult {
    let mut buf = LineBuffer::new();
    buf.prepare_dirty();
    cache::wbinvd();
    assert_slice_eq_test!(buf.snapshot(), expected(SEED_DIRTY), "after wbinvd");
    pass!()
}

pub fn test_wbinvd_twice_is_idempotent() -> TestResult {
    let mut buf = LineBuffer::new();
    buf.prepare_dirty();
    cache::wbinvd();
    cache::wbinvd();
    assert_slice_eq_test!(buf.snapshot(), expected(SEED_DIRTY), "after second wbinvd");
    pass!()
}

pub fn test_hardware_cache_writeback() -> TestResult {
    let mut buf = LineBuffer::new();
    buf.prepare_dirty();
    HardwareCache.invalidate_with_writeback();
    assert_slice_eq_test!(buf.snapshot(), expected(SEED_DIRTY), "through HardwareCache");
    pass!()
}

pub fn test_wbinvd_primitive_preserves_registers() -> TestResult {
    let obs = observe_call(cache::wbinvd_entry());
    check_observation(&obs, "wbinvd primitive")
}

pub fn test_wbinvd_keeps_interrupt_state() -> TestResult {
    let before = are_interrupts_enabled();
    cache::wbinvd();
    assert_eq_test!(are_interrupts_enabled(), before, "IF after wbinvd");
    pass!()
}

pub fn test_wbinvd_cost_reported() -> TestResult {
    let mut buf = LineBuffer::new();
    buf.prepare_dirty();
    let start = hvx_lib::tsc::rdtsc();
    cache::wbinvd();
    let end = hvx_lib::tsc::rdtsc();
    assert_test!(end >= start, "TSC went backwards");
    klog_info!(
        "cache: wbinvd took {} cycles ({}ms)",
        end - start,
        measure_elapsed_ms(start, end)
    );
    pass!()
}

define_test_suite!(
    cache_writeback,
    [
        test_wbinvd_preserves_dirty_lines,
        test_wbinvd_twice_is_idempotent,
        test_hardware_cache_writeback,
        test_wbinvd_primitive_preserves_registers,
        test_wbinvd_keeps_interrupt_state,
        test_wbinvd_cost_reported,
    ]
);

// =============================================================================
// cache_invalidate (destructive)
// =============================================================================

pub fn test_invd_after_writeback_keeps_pattern() -> TestResult {
    let mut buf = LineBuffer::new();
    buf.fill(SEED_INVD);
    {
        let _irq = IrqSaveGuard::new();
        cache::wbinvd();
        unsafe { cache::invd() };
    }
    assert_slice_eq_test!(buf.snapshot(), expected(SEED_INVD), "after wbinvd+invd");
    pass!()
}

pub fn test_invd_twice_is_idempotent() -> TestResult {
    let mut buf = LineBuffer::new();
    buf.fill(SEED_INVD);
    {
        let _irq = IrqSaveGuard::new();
        cache::wbinvd();
        unsafe {
            cache::invd();
            cache::invd();
        }
    }
    assert_slice_eq_test!(buf.snapshot(), expected(SEED_INVD), "after second invd");
    pass!()
}

pub fn test_invd_preserves_flags_and_registers() -> TestResult {
    let obs = {
        let _irq = IrqSaveGuard::new();
        observe_inline_invd()
    };
    assert_test!(obs.flags_before & 1 == 1, "CF not set before invd");
    assert_eq_test!(obs.flags_after, obs.flags_before, "flags across invd");
    assert_slice_eq_test!(obs.regs, REG_SEEDS[1..], "GPRs across invd");
    pass!()
}

pub fn test_invd_irqsave_keeps_masked_state() -> TestResult {
    let before = are_interrupts_enabled();
    let inside = {
        let _irq = IrqSaveGuard::new();
        cache::wbinvd();
        unsafe { hvx_lib::invd_irqsave() };
        are_interrupts_enabled()
    };
    assert_test!(!inside, "invd_irqsave enabled interrupts it did not mask");
    assert_eq_test!(are_interrupts_enabled(), before, "IF after guard");
    pass!()
}

fn skip_destructive() -> TestResult {
    skip!("cache_invalidate needs itests.destructive=on")
}

const CACHE_INVALIDATE_NAME: &[u8] = b"cache_invalidate\0";

fn run_cache_invalidate_suite(config: *const (), out: *mut TestSuiteResult) -> i32 {
    let start = hvx_lib::tsc::rdtsc();
    let destructive = unsafe { TestConfig::from_runner_arg(config) }.is_some_and(|cfg| cfg.destructive);

    let mut passed = 0u32;
    let mut total = 0u32;
    if destructive {
        run_test!(passed, total, test_invd_after_writeback_keeps_pattern);
        run_test!(passed, total, test_invd_twice_is_idempotent);
        run_test!(passed, total, test_invd_preserves_flags_and_registers);
        run_test!(passed, total, test_invd_irqsave_keeps_masked_state);
    } else {
        run_single_test("cache_invalidate", skip_destructive);
    }

    let elapsed = measure_elapsed_ms(start, hvx_lib::tsc::rdtsc());
    if let Some(out_ref) = unsafe { out.as_mut() } {
        out_ref.name = CACHE_INVALIDATE_NAME.as_ptr() as *const c_char;
        out_ref.fill(passed, total, elapsed);
    }
    if passed == total { 0 } else { -1 }
}

#[used]
#[unsafe(link_section = ".test_registry")]
pub static CACHE_INVALIDATE_SUITE_DESC: TestSuiteDesc = TestSuiteDesc {
    name: CACHE_INVALIDATE_NAME.as_ptr() as *const c_char,
    run: Some(run_cache_invalidate_suite),
};
