use std::{
    mem::size_of,
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
};

#[cfg(not(target_arch = "wasm32"))]
use memmap2::MmapMut;

use crate::{
    error::{HeapError, Result},
    globals::{ALLOC_ALIGN, BITMAP_PARTS, BITMAP_WORDS_PER_UNIT, UNIT_SIZE},
    region::{RegionId, RegionTable},
};

const BITS_PER_WORD: usize = size_of::<u64>() * 8;

#[inline(always)]
const fn offset_to_index(offset: usize) -> usize {
    offset / ALLOC_ALIGN / BITS_PER_WORD
}

#[inline(always)]
const fn offset_to_mask(offset: usize) -> u64 {
    1 << ((offset / ALLOC_ALIGN) % BITS_PER_WORD)
}

/// One bit per 8-byte word of the whole heap, backed by an anonymous mapping.
pub struct HeapBitmap {
    mem_map: MmapMut,
    word_count: usize,
    name: &'static str,
}

impl HeapBitmap {
    pub fn new(name: &'static str, unit_count: usize) -> Result<Self> {
        let word_count = unit_count * BITMAP_WORDS_PER_UNIT;
        let bytes = word_count * size_of::<u64>();
        let mem_map = MmapMut::map_anon(bytes).map_err(|err| {
            log::error!("failed to map {} bitmap: {}", name, err);
            HeapError::ReservationFailed(bytes)
        })?;
        Ok(Self {
            mem_map,
            word_count,
            name,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline(always)]
    fn words(&self) -> &[AtomicU64] {
        unsafe {
            std::slice::from_raw_parts(self.mem_map.as_ptr() as *const AtomicU64, self.word_count)
        }
    }

    /// Words covering `unit_count` units starting at `unit_index`.
    #[inline]
    pub fn unit_words(&self, unit_index: usize, unit_count: usize) -> &[AtomicU64] {
        let begin = unit_index * BITMAP_WORDS_PER_UNIT;
        &self.words()[begin..begin + unit_count * BITMAP_WORDS_PER_UNIT]
    }

    pub fn clear_units(&self, unit_index: usize, unit_count: usize) {
        for word in self.unit_words(unit_index, unit_count) {
            word.store(0, Ordering::Relaxed);
        }
    }

    pub fn clear_all(&self) {
        for word in self.words() {
            if word.load(Ordering::Relaxed) != 0 {
                word.store(0, Ordering::Relaxed);
            }
        }
    }

    /// Visits the heap offset of every set bit, in address order.
    pub fn for_each_set(&self, mut f: impl FnMut(usize)) {
        for (index, word) in self.words().iter().enumerate() {
            let mut bits = word.load(Ordering::Acquire);
            while bits != 0 {
                let bit = bits.trailing_zeros() as usize;
                bits &= bits - 1;
                f((index * BITS_PER_WORD + bit) * ALLOC_ALIGN);
            }
        }
    }
}

/// View of the mark bitmap over one region plus the region's live-byte parts.
pub struct RegionBitmap<'a> {
    words: &'a [AtomicU64],
    parts: Option<&'a [AtomicUsize; BITMAP_PARTS]>,
    part_bytes: usize,
}

impl<'a> RegionBitmap<'a> {
    pub fn new(
        words: &'a [AtomicU64],
        parts: Option<&'a [AtomicUsize; BITMAP_PARTS]>,
        region_size: usize,
    ) -> Self {
        Self {
            words,
            parts,
            part_bytes: region_size / BITMAP_PARTS,
        }
    }

    /// Marks the object at `offset`. Returns true if it was already marked; the object's
    /// size is only added to its live-byte part by the call that set the bit.
    #[inline]
    pub fn mark_bits(&self, offset: usize, size: usize) -> bool {
        let entry = &self.words[offset_to_index(offset)];
        let mask = offset_to_mask(offset);
        let mut old_word = entry.load(Ordering::Relaxed);
        loop {
            if old_word & mask != 0 {
                return true;
            }
            match entry.compare_exchange_weak(
                old_word,
                old_word | mask,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => old_word = actual,
            }
        }
        if let Some(parts) = self.parts {
            parts[offset / self.part_bytes].fetch_add(size, Ordering::AcqRel);
        }
        false
    }

    #[inline]
    pub fn is_marked(&self, offset: usize) -> bool {
        self.words[offset_to_index(offset)].load(Ordering::Acquire) & offset_to_mask(offset) != 0
    }

    /// Visits marked offsets below `limit` in address order.
    pub fn for_each_marked(&self, limit: usize, mut f: impl FnMut(usize)) {
        let last_word = offset_to_index(limit.saturating_sub(1)).min(self.words.len() - 1);
        for (index, word) in self.words[..=last_word].iter().enumerate() {
            let mut bits = word.load(Ordering::Acquire);
            while bits != 0 {
                let bit = bits.trailing_zeros() as usize;
                bits &= bits - 1;
                let offset = (index * BITS_PER_WORD + bit) * ALLOC_ALIGN;
                if offset >= limit {
                    return;
                }
                f(offset);
            }
        }
    }

    /// Live bytes of marked objects starting before `offset`. Whole parts come from the part
    /// counters; only the part containing `offset` is scanned, using `size_at` for object sizes.
    pub fn live_bytes_before(&self, offset: usize, size_at: impl Fn(usize) -> usize) -> usize {
        let parts = match self.parts {
            Some(parts) => parts,
            None => return 0,
        };
        let part = (offset / self.part_bytes).min(BITMAP_PARTS - 1);
        let mut bytes: usize = parts[..part]
            .iter()
            .map(|p| p.load(Ordering::Acquire))
            .sum();
        let part_start = part * self.part_bytes;
        let first_word = offset_to_index(part_start);
        let words_per_part = self.words.len() / BITMAP_PARTS;
        for index in first_word..first_word + words_per_part {
            let mut bits = self.words[index].load(Ordering::Acquire);
            while bits != 0 {
                let bit = bits.trailing_zeros() as usize;
                bits &= bits - 1;
                let marked = (index * BITS_PER_WORD + bit) * ALLOC_ALIGN;
                if marked >= offset {
                    return bytes;
                }
                bytes += size_at(marked);
            }
        }
        bytes
    }
}

/// Owns the heap-wide mark bitmap and the two remembered-set bitmaps.
///
/// Mutators record into the active remembered set. A collection flips the active set at its
/// first pause and folds the records made during marking into that snapshot before copying,
/// so only records made after copying started survive into the next cycle.
pub struct HeapBitmapManager {
    mark: HeapBitmap,
    rsets: [HeapBitmap; 2],
    active_rset: AtomicUsize,
    heap_start: usize,
}

impl HeapBitmapManager {
    pub fn new(heap_start: usize, unit_count: usize) -> Result<Self> {
        Ok(Self {
            mark: HeapBitmap::new("mark", unit_count)?,
            rsets: [
                HeapBitmap::new("remembered set", unit_count)?,
                HeapBitmap::new("remembered set", unit_count)?,
            ],
            active_rset: AtomicUsize::new(0),
            heap_start,
        })
    }

    pub fn region_bitmap<'a>(&'a self, table: &'a RegionTable, id: RegionId) -> RegionBitmap<'a> {
        let desc = table.desc(id);
        RegionBitmap::new(
            self.mark.unit_words(id.index(), desc.unit_count()),
            Some(desc.live_parts()),
            desc.unit_count() * UNIT_SIZE,
        )
    }

    pub fn clear_marks(&self) {
        self.mark.clear_all();
    }

    /// Clears all bitmaps of the units of a region being freed or reused.
    pub fn clear_region(&self, unit_index: usize, unit_count: usize) {
        self.mark.clear_units(unit_index, unit_count);
        for rset in &self.rsets {
            rset.clear_units(unit_index, unit_count);
        }
    }

    /// Records `holder` as an object that may reference young objects.
    #[inline]
    pub fn remember(&self, holder: usize) {
        let offset = holder - self.heap_start;
        let rset = &self.rsets[self.active_rset.load(Ordering::Acquire)];
        let entry = &rset.words()[offset_to_index(offset)];
        let mask = offset_to_mask(offset);
        if entry.load(Ordering::Relaxed) & mask == 0 {
            entry.fetch_or(mask, Ordering::AcqRel);
        }
    }

    pub fn is_remembered(&self, holder: usize) -> bool {
        let offset = holder - self.heap_start;
        self.rsets.iter().any(|rset| {
            rset.words()[offset_to_index(offset)].load(Ordering::Acquire) & offset_to_mask(offset)
                != 0
        })
    }

    /// Flips the active remembered set. Must run while mutators are stopped.
    pub fn flip_remembered_set(&self) {
        let active = self.active_rset.load(Ordering::Acquire);
        self.rsets[1 - active].clear_all();
        self.active_rset.store(1 - active, Ordering::Release);
    }

    /// Folds records made since the flip into the snapshot and empties the active set.
    /// Must run while mutators are stopped.
    pub fn merge_active_into_snapshot(&self) {
        let active = self.active_rset.load(Ordering::Acquire);
        let live = self.rsets[active].words();
        let snapshot = self.rsets[1 - active].words();
        for (from, into) in live.iter().zip(snapshot) {
            let bits = from.swap(0, Ordering::AcqRel);
            if bits != 0 {
                into.fetch_or(bits, Ordering::AcqRel);
            }
        }
    }

    /// Visits every holder address in the snapshot.
    pub fn for_each_remembered_snapshot(&self, mut f: impl FnMut(usize)) {
        let heap_start = self.heap_start;
        let active = self.active_rset.load(Ordering::Acquire);
        self.rsets[1 - active].for_each_set(|offset| f(heap_start + offset));
    }

    /// Drops the snapshot once a collection no longer needs it.
    pub fn clear_remembered_snapshot(&self) {
        let active = self.active_rset.load(Ordering::Acquire);
        self.rsets[1 - active].clear_all();
    }
}

unsafe impl Send for HeapBitmapManager {}
unsafe impl Sync for HeapBitmapManager {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::RegionType;

    #[test]
    fn mark_is_idempotent() {
        let table = RegionTable::new(0x1000_0000, 2);
        table.init_region(RegionId(0), 1, RegionType::RecentFull);
        let bitmaps = HeapBitmapManager::new(table.heap_start(), 2).unwrap();
        let bitmap = bitmaps.region_bitmap(&table, RegionId(0));
        assert!(!bitmap.mark_bits(64, 32));
        assert!(bitmap.mark_bits(64, 32));
        assert!(bitmap.is_marked(64));
        assert!(!bitmap.is_marked(72));
        let parts: usize = table
            .desc(RegionId(0))
            .live_parts()
            .iter()
            .map(|p| p.load(Ordering::Relaxed))
            .sum();
        assert_eq!(parts, 32);
    }

    #[test]
    fn live_bytes_before_uses_parts() {
        let table = RegionTable::new(0x1000_0000, 1);
        table.init_region(RegionId(0), 1, RegionType::Old);
        let bitmaps = HeapBitmapManager::new(table.heap_start(), 1).unwrap();
        let bitmap = bitmaps.region_bitmap(&table, RegionId(0));
        let part = UNIT_SIZE / BITMAP_PARTS;
        bitmap.mark_bits(0, 16);
        bitmap.mark_bits(part + 8, 24);
        bitmap.mark_bits(part * 3, 40);
        bitmap.mark_bits(part * 3 + 64, 8);
        let size_at = |offset: usize| match offset {
            0 => 16,
            o if o == part + 8 => 24,
            o if o == part * 3 => 40,
            _ => 8,
        };
        assert_eq!(bitmap.live_bytes_before(0, size_at), 0);
        assert_eq!(bitmap.live_bytes_before(part, size_at), 16);
        assert_eq!(bitmap.live_bytes_before(part * 3 + 8, size_at), 80);
        assert_eq!(bitmap.live_bytes_before(UNIT_SIZE - 8, size_at), 88);
    }

    #[test]
    fn marked_offsets_in_order() {
        let table = RegionTable::new(0x1000_0000, 1);
        table.init_region(RegionId(0), 1, RegionType::Old);
        let bitmaps = HeapBitmapManager::new(table.heap_start(), 1).unwrap();
        let bitmap = bitmaps.region_bitmap(&table, RegionId(0));
        for offset in [4096usize, 8, 520, 16] {
            bitmap.mark_bits(offset, 8);
        }
        let mut seen = Vec::new();
        bitmap.for_each_marked(4096, |o| seen.push(o));
        assert_eq!(seen, vec![8, 16, 520]);
    }

    #[test]
    fn remembered_set_snapshot() {
        let base = 0x1000_0000;
        let bitmaps = HeapBitmapManager::new(base, 2).unwrap();
        let snapshot = |bitmaps: &HeapBitmapManager| {
            let mut seen = Vec::new();
            bitmaps.for_each_remembered_snapshot(|a| seen.push(a - base));
            seen
        };
        bitmaps.remember(base + 64);
        bitmaps.flip_remembered_set();
        assert_eq!(snapshot(&bitmaps), vec![64]);
        bitmaps.remember(base + 128);
        assert_eq!(snapshot(&bitmaps), vec![64]);
        bitmaps.merge_active_into_snapshot();
        assert_eq!(snapshot(&bitmaps), vec![64, 128]);
        bitmaps.remember(base + 256);
        bitmaps.clear_remembered_snapshot();
        assert!(snapshot(&bitmaps).is_empty());
        assert!(bitmaps.is_remembered(base + 256));
        assert!(!bitmaps.is_remembered(base + 64));
        bitmaps.flip_remembered_set();
        assert_eq!(snapshot(&bitmaps), vec![256]);
    }
}
