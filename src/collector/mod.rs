pub mod copy;
pub mod proxy;
pub mod resources;
pub mod task_queue;
pub mod thread_pool;
pub mod trace;

use std::sync::atomic::{AtomicBool, AtomicU64};

use atomic::{Atomic, Ordering};

/// Collection phases, in the order a cycle walks through them.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[repr(u8)]
pub enum GCPhase {
    Idle = 0,
    Start,
    Enum,
    Mark,
    RemarkSatb,
    FinalMark,
    PostMark,
    Precopy,
    Copy,
    Fix,
}

impl GCPhase {
    /// Phases during which stores must record the overwritten value.
    #[inline]
    pub fn is_marking(self) -> bool {
        self >= GCPhase::Enum && self <= GCPhase::PostMark
    }

    #[inline]
    pub fn is_evacuating(self) -> bool {
        self >= GCPhase::Precopy && self <= GCPhase::Fix
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
#[repr(u8)]
pub enum GCReason {
    User = 0,
    Oom,
    Backup,
    Heu,
    Young,
    Native,
    HeuSync,
    NativeSync,
    Force,
    AppSpawn,
    Background,
    Hint,
    Idle,
}

impl GCReason {
    pub const COUNT: usize = 13;
    pub const ALL: [GCReason; Self::COUNT] = [
        GCReason::User,
        GCReason::Oom,
        GCReason::Backup,
        GCReason::Heu,
        GCReason::Young,
        GCReason::Native,
        GCReason::HeuSync,
        GCReason::NativeSync,
        GCReason::Force,
        GCReason::AppSpawn,
        GCReason::Background,
        GCReason::Hint,
        GCReason::Idle,
    ];

    pub fn name(self) -> &'static str {
        match self {
            GCReason::User => "user",
            GCReason::Oom => "oom",
            GCReason::Backup => "backup",
            GCReason::Heu => "heuristic",
            GCReason::Young => "young",
            GCReason::Native => "native",
            GCReason::HeuSync => "heuristic_sync",
            GCReason::NativeSync => "native_sync",
            GCReason::Force => "force",
            GCReason::AppSpawn => "appspawn",
            GCReason::Background => "background",
            GCReason::Hint => "hint",
            GCReason::Idle => "idle",
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum CollectorStrategy {
    Concurrent = 0,
    StopTheWorld,
    Young,
}

/// Published collector state that mutators and allocators consult.
pub struct GcState {
    phase: Atomic<GCPhase>,
    strategy: Atomic<CollectorStrategy>,
    running: AtomicBool,
    gc_index: AtomicU64,
}

impl Default for GcState {
    fn default() -> Self {
        Self {
            phase: Atomic::new(GCPhase::Idle),
            strategy: Atomic::new(CollectorStrategy::Concurrent),
            running: AtomicBool::new(false),
            gc_index: AtomicU64::new(0),
        }
    }
}

impl GcState {
    #[inline(always)]
    pub fn phase(&self) -> GCPhase {
        self.phase.load(Ordering::Acquire)
    }

    pub(crate) fn set_phase(&self, phase: GCPhase) {
        log::trace!("gc phase -> {:?}", phase);
        self.phase.store(phase, Ordering::Release);
    }

    pub fn strategy(&self) -> CollectorStrategy {
        self.strategy.load(Ordering::Acquire)
    }

    pub(crate) fn set_strategy(&self, strategy: CollectorStrategy) {
        self.strategy.store(strategy, Ordering::Release);
    }

    /// True while a young-only cycle is between its first pause and its end.
    #[inline]
    pub fn is_young_cycle(&self) -> bool {
        self.phase() != GCPhase::Idle && self.strategy() == CollectorStrategy::Young
    }

    pub fn is_gc_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    pub fn gc_index(&self) -> u64 {
        self.gc_index.load(Ordering::Acquire)
    }

    pub(crate) fn set_gc_index(&self, index: u64) {
        self.gc_index.store(index, Ordering::Release);
    }
}

/// Lets the region manager ask for a collection without owning the collector.
pub trait GcTrigger: Send + Sync {
    fn trigger_gc(&self, reason: GCReason);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_ranges() {
        assert!(!GCPhase::Idle.is_marking());
        assert!(GCPhase::Enum.is_marking());
        assert!(GCPhase::PostMark.is_marking());
        assert!(!GCPhase::Precopy.is_marking());
        assert!(GCPhase::Precopy.is_evacuating());
        assert!(GCPhase::Fix.is_evacuating());
    }

    #[test]
    fn reasons_are_indexed_by_ordinal() {
        for (i, reason) in GCReason::ALL.iter().enumerate() {
            assert_eq!(*reason as usize, i);
        }
    }
}
