//! Physical Tile Pool
//!
//! Slot allocator for the fixed-capacity backing memory tiles are mapped into.
//! Slots `0..reserved` hold packed mips and are handed out in ranges at
//! registration; the remaining slots serve streamed tiles one at a time.

use std::ops::Range;

/// Fixed-capacity physical tile pool
#[derive(Debug, Clone)]
pub struct PhysicalTilePool {
    capacity: u32,
    reserved: u32,
    /// Free ranges of the reserved region, sorted and coalesced
    reserved_free: Vec<Range<u32>>,
    /// Next never-used streaming slot
    next_free: u32,
    /// Streaming slots returned by unregistered resources
    free_list: Vec<u32>,
    in_use: u32,
}

impl PhysicalTilePool {
    /// Create a pool of `capacity` tiles, the first `reserved` set aside
    pub fn new(capacity: u32, reserved: u32) -> Self {
        let reserved = reserved.min(capacity);
        Self {
            capacity,
            reserved,
            reserved_free: if reserved > 0 { vec![0..reserved] } else { Vec::new() },
            next_free: reserved,
            free_list: Vec::new(),
            in_use: 0,
        }
    }

    /// Total slots
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Slots set aside for packed mips
    pub fn reserved(&self) -> u32 {
        self.reserved
    }

    /// Slots available to streamed tiles
    pub fn streaming_capacity(&self) -> u32 {
        self.capacity - self.reserved
    }

    /// Streaming slots currently handed out
    pub fn in_use(&self) -> u32 {
        self.in_use
    }

    /// Whether a streaming slot can be handed out without evicting
    pub fn has_spare_capacity(&self) -> bool {
        self.in_use < self.streaming_capacity()
    }

    /// Hand out a streaming slot if one is free
    pub fn allocate(&mut self) -> Option<u32> {
        if let Some(slot) = self.free_list.pop() {
            self.in_use += 1;
            return Some(slot);
        }
        if self.next_free < self.capacity {
            let slot = self.next_free;
            self.next_free += 1;
            self.in_use += 1;
            return Some(slot);
        }
        None
    }

    /// Return a streaming slot
    pub fn release(&mut self, slot: u32) {
        debug_assert!(slot >= self.reserved && slot < self.next_free);
        self.free_list.push(slot);
        self.in_use = self.in_use.saturating_sub(1);
    }

    /// Reserved slots not handed out
    pub fn reserved_available(&self) -> u32 {
        self.reserved_free.iter().map(|r| r.end - r.start).sum()
    }

    /// Hand out `count` contiguous reserved slots, first fit
    pub fn allocate_reserved(&mut self, count: u32) -> Option<Range<u32>> {
        if count == 0 {
            return Some(0..0);
        }
        let index = self.reserved_free.iter().position(|r| r.end - r.start >= count)?;
        let range = &mut self.reserved_free[index];
        let allocated = range.start..range.start + count;
        range.start += count;
        if range.start == range.end {
            self.reserved_free.remove(index);
        }
        Some(allocated)
    }

    /// Return a reserved range
    pub fn release_reserved(&mut self, range: Range<u32>) {
        if range.start >= range.end {
            return;
        }
        self.reserved_free.push(range);
        self.reserved_free.sort_by_key(|r| r.start);

        let mut merged: Vec<Range<u32>> = Vec::with_capacity(self.reserved_free.len());
        for range in self.reserved_free.drain(..) {
            match merged.last_mut() {
                Some(last) if last.end == range.start => last.end = range.end,
                _ => merged.push(range),
            }
        }
        self.reserved_free = merged;
    }
}
