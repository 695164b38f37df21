use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::region::RegionListStats;

/// Counters shared by the collector, the region manager's pacing and heuristics.
#[derive(Default)]
pub struct GcStats {
    gc_count: AtomicUsize,
    young_gc_count: AtomicUsize,
    live_bytes_after_gc: AtomicUsize,
    heap_threshold: AtomicUsize,
    last_gc_end_ns: AtomicU64,
    total_pause_ns: AtomicU64,
    max_pause_ns: AtomicU64,
    total_gc_ns: AtomicU64,
    copied_bytes: AtomicUsize,
    freed_bytes: AtomicUsize,
    /// Bytes freed per second of collection time, last cycle.
    collection_rate: AtomicU64,
}

impl GcStats {
    pub fn new(initial_threshold: usize) -> Self {
        let stats = Self::default();
        stats
            .heap_threshold
            .store(initial_threshold, Ordering::Relaxed);
        stats
    }

    pub fn gc_count(&self) -> usize {
        self.gc_count.load(Ordering::Acquire)
    }

    pub fn young_gc_count(&self) -> usize {
        self.young_gc_count.load(Ordering::Acquire)
    }

    pub fn live_bytes_after_gc(&self) -> usize {
        self.live_bytes_after_gc.load(Ordering::Acquire)
    }

    pub fn heap_threshold(&self) -> usize {
        self.heap_threshold.load(Ordering::Acquire)
    }

    pub fn last_gc_end_ns(&self) -> u64 {
        self.last_gc_end_ns.load(Ordering::Acquire)
    }

    pub fn collection_rate(&self) -> u64 {
        self.collection_rate.load(Ordering::Acquire)
    }

    pub fn copied_bytes(&self) -> usize {
        self.copied_bytes.load(Ordering::Acquire)
    }

    pub fn freed_bytes(&self) -> usize {
        self.freed_bytes.load(Ordering::Acquire)
    }

    pub(crate) fn record_pause(&self, pause_ns: u64) {
        self.total_pause_ns.fetch_add(pause_ns, Ordering::AcqRel);
        self.max_pause_ns.fetch_max(pause_ns, Ordering::AcqRel);
    }

    pub(crate) fn add_copied_bytes(&self, bytes: usize) {
        self.copied_bytes.fetch_add(bytes, Ordering::AcqRel);
    }

    pub(crate) fn record_cycle(&self, record: CycleRecord) {
        self.gc_count.fetch_add(1, Ordering::AcqRel);
        if record.young {
            self.young_gc_count.fetch_add(1, Ordering::AcqRel);
        }
        self.live_bytes_after_gc
            .store(record.live_bytes, Ordering::Release);
        self.heap_threshold
            .store(record.next_threshold, Ordering::Release);
        self.freed_bytes
            .fetch_add(record.freed_bytes, Ordering::AcqRel);
        let duration = record.end_ns.saturating_sub(record.start_ns).max(1);
        self.total_gc_ns.fetch_add(duration, Ordering::AcqRel);
        let rate = (record.freed_bytes as u128 * 1_000_000_000 / duration as u128) as u64;
        self.collection_rate.store(rate, Ordering::Release);
        self.last_gc_end_ns.store(record.end_ns, Ordering::Release);
    }
}

pub(crate) struct CycleRecord {
    pub young: bool,
    pub start_ns: u64,
    pub end_ns: u64,
    pub live_bytes: usize,
    pub freed_bytes: usize,
    pub next_threshold: usize,
}

/// Snapshot of heap occupancy, produced by heap dumps and [`Heap::statistics`](crate::heap::Heap::statistics).
#[derive(Clone, Debug, Default)]
pub struct HeapStatistics {
    pub heap_size: usize,
    pub used_units: usize,
    pub dirty_free_units: usize,
    pub released_free_units: usize,
    pub lists: Vec<(&'static str, RegionListStats)>,
    pub total_gc_cycles_count: usize,
    pub young_gc_cycles_count: usize,
    pub live_bytes_after_gc: usize,
    pub heap_threshold: usize,
    pub total_pause_ns: u64,
    pub max_pause_ns: u64,
    pub copied_bytes: usize,
    pub freed_bytes: usize,
}

impl HeapStatistics {
    pub(crate) fn fill_gc_counters(&mut self, stats: &GcStats) {
        self.total_gc_cycles_count = stats.gc_count();
        self.young_gc_cycles_count = stats.young_gc_count();
        self.live_bytes_after_gc = stats.live_bytes_after_gc();
        self.heap_threshold = stats.heap_threshold();
        self.total_pause_ns = stats.total_pause_ns.load(Ordering::Acquire);
        self.max_pause_ns = stats.max_pause_ns.load(Ordering::Acquire);
        self.copied_bytes = stats.copied_bytes();
        self.freed_bytes = stats.freed_bytes();
    }

    pub fn list(&self, name: &str) -> Option<RegionListStats> {
        self.lists
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, stats)| *stats)
    }

    pub fn allocated_bytes(&self) -> usize {
        self.lists.iter().map(|(_, s)| s.allocated_bytes).sum()
    }
}

pub struct FormattedSize {
    pub size: usize,
}

impl std::fmt::Display for FormattedSize {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let ksize = (self.size as f64) / 1024f64;

        if ksize < 1f64 {
            return write!(f, "{}B", self.size);
        }

        let msize = ksize / 1024f64;

        if msize < 1f64 {
            return write!(f, "{:.1}K", ksize);
        }

        let gsize = msize / 1024f64;

        if gsize < 1f64 {
            write!(f, "{:.1}M", msize)
        } else {
            write!(f, "{:.1}G", gsize)
        }
    }
}

pub fn formatted_size(size: usize) -> FormattedSize {
    FormattedSize { size }
}

impl std::fmt::Display for HeapStatistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Heap statistics:")?;
        writeln!(
            f,
            "  Units in use: {} of {} ({} dirty, {} released)",
            self.used_units,
            formatted_size(self.heap_size),
            self.dirty_free_units,
            self.released_free_units
        )?;
        for (name, list) in &self.lists {
            if list.regions == 0 {
                continue;
            }
            writeln!(
                f,
                "  {:<18} {:>5} regions {:>6} units {:>9} allocated {:>9} live",
                name,
                list.regions,
                list.units,
                formatted_size(list.allocated_bytes),
                formatted_size(list.live_bytes)
            )?;
        }
        writeln!(
            f,
            "  GC cycles: {} ({} young)",
            self.total_gc_cycles_count, self.young_gc_cycles_count
        )?;
        writeln!(
            f,
            "  Live after last GC: {}",
            formatted_size(self.live_bytes_after_gc)
        )?;
        writeln!(
            f,
            "  Heap threshold: {}",
            formatted_size(self.heap_threshold)
        )?;
        writeln!(
            f,
            "  Pauses: {:.3}ms total, {:.3}ms max",
            self.total_pause_ns as f64 / 1e6,
            self.max_pause_ns as f64 / 1e6
        )?;
        writeln!(
            f,
            "  Copied: {}, freed: {}",
            formatted_size(self.copied_bytes),
            formatted_size(self.freed_bytes)
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formatted_sizes() {
        assert_eq!(formatted_size(512).to_string(), "512B");
        assert_eq!(formatted_size(2048).to_string(), "2.0K");
        assert_eq!(formatted_size(3 * 1024 * 1024).to_string(), "3.0M");
    }

    #[test]
    fn cycle_updates_rate_and_threshold() {
        let stats = GcStats::new(1024);
        stats.record_cycle(CycleRecord {
            young: true,
            start_ns: 0,
            end_ns: 1_000_000_000,
            live_bytes: 100,
            freed_bytes: 4096,
            next_threshold: 2048,
        });
        assert_eq!(stats.gc_count(), 1);
        assert_eq!(stats.young_gc_count(), 1);
        assert_eq!(stats.collection_rate(), 4096);
        assert_eq!(stats.heap_threshold(), 2048);
    }
}
