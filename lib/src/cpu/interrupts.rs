//! Interrupt flag management: irqsave/irqrestore around cache maintenance.

use core::arch::asm;
use core::marker::PhantomData;

use x86_64::instructions::interrupts;
use x86_64::registers::rflags::{self, RFlags};

use super::cache;

/// Read RFLAGS without modifying interrupt state.
#[inline(always)]
pub fn read_rflags() -> RFlags {
    rflags::read()
}

/// Returns true if interrupts are currently enabled (IF set).
#[inline(always)]
pub fn are_interrupts_enabled() -> bool {
    interrupts::are_enabled()
}

/// Save RFLAGS and disable interrupts (irqsave pattern).
#[inline(always)]
pub fn save_flags_cli() -> RFlags {
    let flags = rflags::read();
    interrupts::disable();
    flags
}

/// Restore the interrupt flag from saved RFLAGS (irqrestore pattern).
/// Only re-enables interrupts if they were enabled in the saved flags.
#[inline(always)]
pub fn restore_flags(flags: RFlags) {
    if flags.contains(RFlags::INTERRUPT_FLAG) {
        interrupts::enable();
    }
}

/// RAII irqsave: interrupts are masked on this CPU while the guard lives.
/// !Send/!Sync: must be dropped on the CPU that created it.
#[must_use = "if unused, interrupts will be immediately restored"]
pub struct IrqSaveGuard {
    saved: RFlags,
    _marker: PhantomData<*mut ()>,
}

impl IrqSaveGuard {
    #[inline]
    pub fn new() -> Self {
        Self {
            saved: save_flags_cli(),
            _marker: PhantomData,
        }
    }

    /// RFLAGS as they were before the guard masked interrupts.
    #[inline]
    pub fn saved_flags(&self) -> RFlags {
        self.saved
    }
}

impl Default for IrqSaveGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for IrqSaveGuard {
    #[inline]
    fn drop(&mut self) {
        restore_flags(self.saved);
    }
}

/// RFLAGS.IF as seen by `test` on the low dword.
const IF_MASK: u32 = 1 << 9;

/// INVD with interrupts masked for the duration.
///
/// Save, mask, invalidate and conditional re-enable are one asm block: the
/// saved RFLAGS lives in a register from `pushfq` until the `sti` decision,
/// and nothing between the `cli` and the `invd` stores to memory. The only
/// store is the transient `pushfq` slot below RSP, consumed by the `pop`
/// before INVD runs.
///
/// # Safety
///
/// Same contract as [`cache::invd`]. The caller must have written back
/// everything it needs (usually a [`cache::wbinvd`] under its own
/// [`IrqSaveGuard`]) and must not write memory between that write-back and
/// this call.
#[inline(always)]
pub unsafe fn invd_irqsave() {
    unsafe {
        asm!(
            "pushfq",
            "pop {flags}",
            "cli",
            "invd",
            "test {flags:e}, {if_mask}",
            "jz 2f",
            "sti",
            "2:",
            flags = out(reg) _,
            if_mask = const IF_MASK,
        );
    }
}

/// [`cache::wbinvd`] with interrupts masked for the duration.
#[inline]
pub fn wbinvd_irqsave() {
    let _guard = IrqSaveGuard::new();
    cache::wbinvd();
}
