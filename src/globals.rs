/// Size of a heap unit. Regions are built from one or more contiguous units.
pub const UNIT_SIZE: usize = 256 * 1024;
pub const UNIT_SHIFT: usize = 18;
/// Granularity of object starts and of the mark bitmap.
pub const ALLOC_ALIGN: usize = 8;
pub const MIN_OBJECT_SIZE: usize = 8;
pub const PAGE_SIZE: usize = 4096;
/// Objects at least this large get a dedicated large region.
pub const LARGE_OBJECT_THRESHOLD: usize = UNIT_SIZE / 8;
/// Regions of at least this many units are advised as huge-page backed.
pub const HUGE_PAGE_UNITS: usize = 8;
/// Number of live-byte parts each region bitmap is split into.
pub const BITMAP_PARTS: usize = 16;
/// Words of mark bitmap covering one unit.
pub const BITMAP_WORDS_PER_UNIT: usize = UNIT_SIZE / ALLOC_ALIGN / 64;

pub const PREFETCH_DISTANCE: usize = 4;
pub const PREFETCH_QUEUE_CAPACITY: usize = 8;

/// Attempts below this count just yield before retrying an allocation.
pub const RESCHEDULE_TRIES: usize = 3;
/// Attempt at which an emergency collection is requested.
pub const OOM_TRIES: usize = 8;

pub const KB: usize = 1024;
pub const MB: usize = 1024 * KB;
pub const GB: usize = 1024 * MB;

const _: () = assert!(1 << UNIT_SHIFT == UNIT_SIZE);
const _: () = assert!(PREFETCH_QUEUE_CAPACITY.is_power_of_two());
const _: () = assert!(PREFETCH_QUEUE_CAPACITY > PREFETCH_DISTANCE);
