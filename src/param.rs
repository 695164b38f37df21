use std::time::Duration;

use crate::{
    error::{HeapError, Result},
    globals::{HUGE_PAGE_UNITS, MB, PAGE_SIZE, UNIT_SIZE},
};

/// Heap layout and allocation pacing.
#[derive(Clone, Debug)]
pub struct HeapParam {
    /// Size of the managed heap reservation. Rounded up to the unit size.
    pub heap_size: usize,
    /// Size of the native page pool used by internal containers (mark stacks etc).
    pub page_pool_size: usize,
    /// Target allocation rate in MB/s used by region pacing. 0 disables pacing.
    pub allocation_rate: usize,
    /// Longest time a single region request may be delayed by pacing.
    pub allocation_wait_time: Duration,
    /// Old regions whose live ratio is above this are not evacuated.
    pub exemption_threshold: f64,
    /// How fast heap threshold should grow after a collection.
    pub heap_growth_factor: f64,
    /// Lower bound of the heuristic collection threshold.
    pub min_gc_threshold: usize,
    /// Fraction of the heap young regions may take before a young collection is requested.
    pub young_budget_ratio: f64,
    /// Dirty free units kept committed when the collector releases memory.
    pub cache_units: usize,
    /// Regions spanning at least this many units are advised as huge-page backed.
    pub huge_page_units: usize,
}

impl Default for HeapParam {
    fn default() -> Self {
        Self {
            heap_size: 256 * MB,
            page_pool_size: 16 * MB,
            allocation_rate: 10240,
            allocation_wait_time: Duration::from_millis(1),
            exemption_threshold: 0.8,
            heap_growth_factor: 1.5,
            min_gc_threshold: 16 * MB,
            young_budget_ratio: 0.25,
            cache_units: 64,
            huge_page_units: HUGE_PAGE_UNITS,
        }
    }
}

/// Collector threads and request policy.
#[derive(Clone, Debug)]
pub struct GCParam {
    /// Helper threads in the GC pool. The GC main thread is not counted.
    pub gc_threads: usize,
    /// Run marking, copying and fixing concurrently with mutators.
    pub enable_concurrent_gc: bool,
    /// Allow young-only collections for `GCReason::Young`.
    pub enable_young_gc: bool,
    /// Heuristic requests closer than this to the previous collection are ignored.
    pub min_heu_gc_interval: Duration,
    /// Native-triggered requests closer than this to the previous one are ignored.
    pub min_native_gc_interval: Duration,
    /// Idle time after which the GC thread releases cached free memory. `None` disables it.
    pub gc_timeout_interval: Option<Duration>,
    /// How long the finalizer thread sleeps between checks.
    pub finalizer_wait_time: Duration,
    /// Enables verbose per-cycle logging at `info` level.
    pub verbose: bool,
}

impl Default for GCParam {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        Self {
            gc_threads: cpus.saturating_sub(1).clamp(1, 8),
            enable_concurrent_gc: true,
            enable_young_gc: false,
            min_heu_gc_interval: Duration::from_millis(100),
            min_native_gc_interval: Duration::from_millis(500),
            gc_timeout_interval: Some(Duration::from_secs(5)),
            finalizer_wait_time: Duration::from_millis(2000),
            verbose: false,
        }
    }
}

/// Configuration for heap constructor. Consumed once by [`Heap::new`](crate::heap::Heap::new).
#[derive(Clone, Debug, Default)]
pub struct RuntimeParam {
    pub heap: HeapParam,
    pub gc: GCParam,
}

impl RuntimeParam {
    pub fn validate(&self) -> Result<()> {
        let heap = &self.heap;
        if heap.heap_size < 4 * UNIT_SIZE {
            return Err(HeapError::InvalidConfig(format!(
                "heap size {} is smaller than four units",
                heap.heap_size
            )));
        }
        if heap.heap_size > u32::MAX as usize / 2 * UNIT_SIZE {
            return Err(HeapError::InvalidConfig(format!(
                "heap size {} exceeds the addressable unit count",
                heap.heap_size
            )));
        }
        if heap.page_pool_size < 16 * PAGE_SIZE {
            return Err(HeapError::InvalidConfig(format!(
                "page pool size {} is smaller than sixteen pages",
                heap.page_pool_size
            )));
        }
        if !(0.0..=1.0).contains(&heap.exemption_threshold) {
            return Err(HeapError::InvalidConfig(format!(
                "exemption threshold {} is outside [0, 1]",
                heap.exemption_threshold
            )));
        }
        if !(0.0..=1.0).contains(&heap.young_budget_ratio) {
            return Err(HeapError::InvalidConfig(format!(
                "young budget ratio {} is outside [0, 1]",
                heap.young_budget_ratio
            )));
        }
        if heap.heap_growth_factor < 1.0 {
            return Err(HeapError::InvalidConfig(format!(
                "heap growth factor {} is below 1.0",
                heap.heap_growth_factor
            )));
        }
        if heap.huge_page_units == 0 {
            return Err(HeapError::InvalidConfig(
                "huge page unit threshold must be at least one".to_string(),
            ));
        }
        Ok(())
    }

    /// Total unit count of the heap.
    pub fn unit_count(&self) -> usize {
        (self.heap.heap_size + UNIT_SIZE - 1) / UNIT_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_param_is_valid() {
        assert!(RuntimeParam::default().validate().is_ok());
    }

    #[test]
    fn tiny_heap_is_rejected() {
        let mut param = RuntimeParam::default();
        param.heap.heap_size = UNIT_SIZE;
        assert!(matches!(
            param.validate(),
            Err(HeapError::InvalidConfig(_))
        ));
    }

    #[test]
    fn bad_threshold_is_rejected() {
        let mut param = RuntimeParam::default();
        param.heap.exemption_threshold = 1.5;
        assert!(param.validate().is_err());
    }
}
