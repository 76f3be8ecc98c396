//! CPU identification.

use core::arch::x86_64::__cpuid;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::config::NCPU;

const NO_CPU: u32 = u32::MAX;

/// Local APIC id of the executing CPU (CPUID leaf 1, EBX[31:24]).
pub fn apic_id() -> u32 {
    let cpuid = unsafe { __cpuid(1) };
    cpuid.ebx >> 24
}

/// Mapping from local APIC ids to dense CPU indices.
pub struct CpuMap {
    apic_ids: [AtomicU32; NCPU],
    online: AtomicUsize,
}

impl CpuMap {
    pub const fn new() -> Self {
        Self {
            apic_ids: [const { AtomicU32::new(NO_CPU) }; NCPU],
            online: AtomicUsize::new(0),
        }
    }

    /// Give the executing CPU the next free index. Called once per CPU
    /// during bring-up; returns `None` past `NCPU` CPUs.
    pub fn register(&self) -> Option<usize> {
        let index = self.online.fetch_add(1, Ordering::SeqCst);
        let slot = self.apic_ids.get(index)?;
        slot.store(apic_id(), Ordering::SeqCst);
        Some(index)
    }

    /// Index of the executing CPU, or `None` if it never registered.
    pub fn index(&self) -> Option<usize> {
        let id = apic_id();
        self.apic_ids
            .iter()
            .position(|slot| slot.load(Ordering::Relaxed) == id)
    }
}

impl Default for CpuMap {
    fn default() -> Self {
        Self::new()
    }
}
