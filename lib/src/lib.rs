#![cfg_attr(not(test), no_std)]

pub mod cpu;
pub mod klog;
pub mod spinlock;
pub mod testing;

pub mod tsc {
    use core::arch::asm;

    #[inline(always)]
    pub fn rdtsc() -> u64 {
        let lo: u32;
        let hi: u32;
        unsafe {
            asm!(
                "rdtsc",
                out("eax") lo,
                out("edx") hi,
                options(nomem, nostack, preserves_flags)
            );
        }
        ((hi as u64) << 32) | (lo as u64)
    }
}

#[doc(hidden)]
pub use paste;

pub use cpu::cache::{CacheControl, CacheOp, HardwareCache, LoggedCache, RecordingCache};
pub use cpu::interrupts::{IrqSaveGuard, invd_irqsave, wbinvd_irqsave};
pub use klog::{
    KlogLevel, klog_get_level, klog_init, klog_init_serial, klog_is_enabled,
    klog_register_backend, klog_set_level,
};
pub use spinlock::{IrqMutex, IrqMutexGuard};
