// Copyright 2026 Gart Contributors
// SPDX-License-Identifier: Apache-2.0

//! Page-directory cache.
//!
//! Page directories below one CPU page are packed: same-size-class
//! directories share a page-sized backing allocation, tracked by a
//! per-chunk allocation bitmap. Page-sized and larger directories get a
//! dedicated backing ("direct"). Callers hold index-based handles into the
//! arena, never pointers; a chunk is released when its last sub-allocation
//! goes away.

use crate::device::Gpu;
use crate::mm::mem::{Mem, MemError};
use crate::mm::PAGE_SIZE;

/// Smallest page-directory allocation the cache hands out.
pub const PD_CACHE_MIN: u32 = 256;
const PD_CACHE_MIN_SHIFT: u32 = PD_CACHE_MIN.trailing_zeros();
/// Backing-chunk size; requests of at least this size become direct
/// allocations.
pub const PD_CACHE_SIZE: u32 = PAGE_SIZE as u32;
const PD_CACHE_CLASSES: usize =
    (PD_CACHE_SIZE.trailing_zeros() - PD_CACHE_MIN_SHIFT) as usize;

static_assertions::const_assert!(PD_CACHE_CLASSES == 4);

/// Handle to a sub-allocation inside the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PdAlloc {
    chunk: usize,
    /// Byte offset of this directory within the chunk's backing.
    pub offs: u32,
}

/// One level's page directory: an arena handle plus the child directories
/// hanging off it (interior levels only).
#[derive(Debug, Default)]
pub struct Pd {
    pub(crate) alloc: Option<PdAlloc>,
    pub pd_size: u32,
    pub(crate) entries: Vec<Pd>,
    /// Non-empty entries at this level: valid/sparse PTEs for the leaf
    /// level, allocated children for interior levels. Drives eager
    /// directory reclamation on unmap.
    pub(crate) num_live: u32,
}

impl Pd {
    pub fn is_allocated(&self) -> bool {
        self.alloc.is_some()
    }
}

struct PdChunk {
    mem: Mem,
    /// Sub-allocation size; equals the backing size for direct allocs.
    pd_size: u32,
    alloc_map: u32,
    nr_allocated: u32,
    /// Size-class index, `None` for direct allocations.
    class: Option<usize>,
}

/// The arena. One per GPU, guarded by the MM state's mutex.
#[derive(Default)]
pub struct PdCache {
    chunks: Vec<Option<PdChunk>>,
    free_chunk_slots: Vec<usize>,
    /// Chunks with at least one free sub-allocation, per size class.
    partial: [Vec<usize>; PD_CACHE_CLASSES],
}

fn size_class(bytes: u32) -> usize {
    let rounded = bytes.next_power_of_two().max(PD_CACHE_MIN);
    (rounded.trailing_zeros() - PD_CACHE_MIN_SHIFT) as usize
}

impl PdCache {
    pub fn new() -> PdCache {
        PdCache::default()
    }

    fn insert_chunk(&mut self, chunk: PdChunk) -> usize {
        match self.free_chunk_slots.pop() {
            Some(slot) => {
                self.chunks[slot] = Some(chunk);
                slot
            }
            None => {
                self.chunks.push(Some(chunk));
                self.chunks.len() - 1
            }
        }
    }

    /// Allocates backing for `pd`, packing sub-page sizes into shared
    /// chunks. The returned directory is zeroed.
    pub fn alloc(&mut self, g: &Gpu, pd: &mut Pd, bytes: u32) -> Result<(), MemError> {
        debug_assert!(!pd.is_allocated(), "pd already has backing");

        if bytes >= PD_CACHE_SIZE {
            return self.alloc_direct(g, pd, bytes);
        }

        let class = size_class(bytes);
        let class_bytes = PD_CACHE_MIN << class;
        let slots = PD_CACHE_SIZE / class_bytes;

        let chunk_id = match self.partial[class].last() {
            Some(&id) => id,
            None => {
                let mem = g.dma_alloc_sys(PD_CACHE_SIZE as u64);
                let id = self.insert_chunk(PdChunk {
                    mem,
                    pd_size: class_bytes,
                    alloc_map: 0,
                    nr_allocated: 0,
                    class: Some(class),
                });
                self.partial[class].push(id);
                id
            }
        };

        let chunk = self.chunks[chunk_id].as_mut().expect("partial list is stale");
        let slot = (0..slots)
            .find(|bit| chunk.alloc_map & (1 << bit) == 0)
            .expect("partial chunk has no free slot");
        chunk.alloc_map |= 1 << slot;
        chunk.nr_allocated += 1;

        let offs = slot * class_bytes;
        for w in 0..class_bytes / 4 {
            chunk.mem.cpu_va[(offs / 4 + w) as usize] = 0;
        }

        if chunk.nr_allocated == slots {
            self.partial[class].retain(|&id| id != chunk_id);
        }

        pd.alloc = Some(PdAlloc { chunk: chunk_id, offs });
        pd.pd_size = class_bytes;
        Ok(())
    }

    /// Dedicated, page-aligned backing at offset zero. Used for the
    /// top-level PDB, whose address must be full-page aligned for the TLB
    /// invalidate interface.
    pub fn alloc_direct(&mut self, g: &Gpu, pd: &mut Pd, bytes: u32) -> Result<(), MemError> {
        debug_assert!(!pd.is_allocated(), "pd already has backing");

        let size = (bytes as u64).next_multiple_of(PAGE_SIZE);
        let mem = g.dma_alloc_sys(size);
        let id = self.insert_chunk(PdChunk {
            mem,
            pd_size: size as u32,
            alloc_map: 1,
            nr_allocated: 1,
            class: None,
        });

        pd.alloc = Some(PdAlloc { chunk: id, offs: 0 });
        pd.pd_size = size as u32;
        Ok(())
    }

    /// Releases `pd`'s backing; the chunk itself is freed once its last
    /// sub-allocation is gone.
    pub fn free(&mut self, pd: &mut Pd) {
        let Some(alloc) = pd.alloc.take() else {
            return;
        };
        pd.pd_size = 0;

        let chunk = self.chunks[alloc.chunk].as_mut().expect("freeing into a dead chunk");
        match chunk.class {
            None => {
                let mut chunk = self.chunks[alloc.chunk].take().unwrap();
                chunk.mem.free();
                self.free_chunk_slots.push(alloc.chunk);
            }
            Some(class) => {
                let slots = PD_CACHE_SIZE / chunk.pd_size;
                let slot = alloc.offs / chunk.pd_size;
                debug_assert!(chunk.alloc_map & (1 << slot) != 0, "double free of pd slot");
                chunk.alloc_map &= !(1 << slot);
                chunk.nr_allocated -= 1;

                if chunk.nr_allocated == 0 {
                    let mut chunk = self.chunks[alloc.chunk].take().unwrap();
                    chunk.mem.free();
                    self.free_chunk_slots.push(alloc.chunk);
                    self.partial[class].retain(|&id| id != alloc.chunk);
                } else if chunk.nr_allocated == slots - 1 {
                    // Was full; it has room again.
                    self.partial[class].push(alloc.chunk);
                }
            }
        }
    }

    /// Reads entry word `word` (relative to the directory base).
    pub fn pd_read(&self, g: &Gpu, pd: &Pd, word: u32) -> u32 {
        let alloc = pd.alloc.expect("reading an unallocated pd");
        let chunk = self.chunks[alloc.chunk].as_ref().expect("pd chunk gone");
        g.mem_rd32(&chunk.mem, (alloc.offs / 4 + word) as u64)
    }

    /// Writes entry word `word` (relative to the directory base). The
    /// caller fences once after the whole update sequence.
    pub fn pd_write(&mut self, g: &Gpu, pd: &Pd, word: u32, value: u32) {
        let alloc = pd.alloc.expect("writing an unallocated pd");
        let chunk = self.chunks[alloc.chunk].as_mut().expect("pd chunk gone");
        g.mem_wr32(&mut chunk.mem, (alloc.offs / 4 + word) as u64, value);
    }

    /// Bus address the GMMU uses to point a PDE at this directory.
    pub fn gpu_addr(&self, pd: &Pd) -> u64 {
        let alloc = pd.alloc.expect("unallocated pd has no address");
        let chunk = self.chunks[alloc.chunk].as_ref().expect("pd chunk gone");
        chunk.mem.phys + alloc.offs as u64
    }

    /// Live backing-chunk count; directory-block conservation is asserted
    /// against this.
    pub fn allocated_chunks(&self) -> usize {
        self.chunks.iter().filter(|c| c.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::test_support::test_gpu;

    #[test]
    fn sub_page_allocs_pack_into_one_chunk() {
        let g = test_gpu();
        let mut cache = PdCache::new();
        let mut pds: Vec<Pd> = (0..16).map(|_| Pd::default()).collect();

        for pd in &mut pds {
            cache.alloc(&g, pd, 256).unwrap();
        }
        // 16 x 256 B fits exactly one 4 KiB chunk.
        assert_eq!(cache.allocated_chunks(), 1);

        let offsets: Vec<u32> = pds.iter().map(|pd| pd.alloc.unwrap().offs).collect();
        for (i, offs) in offsets.iter().enumerate() {
            assert_eq!(*offs % 256, 0);
            assert!(!offsets[..i].contains(offs));
        }

        for pd in &mut pds {
            cache.free(&mut *pd);
        }
        assert_eq!(cache.allocated_chunks(), 0);
    }

    #[test]
    fn odd_sizes_round_up_to_class() {
        let g = test_gpu();
        let mut cache = PdCache::new();
        let mut pd = Pd::default();
        cache.alloc(&g, &mut pd, 300).unwrap();
        assert_eq!(pd.pd_size, 512);
        cache.free(&mut pd);
    }

    #[test]
    fn direct_alloc_is_page_aligned_at_offset_zero() {
        let g = test_gpu();
        let mut cache = PdCache::new();
        let mut pd = Pd::default();
        cache.alloc_direct(&g, &mut pd, PD_CACHE_SIZE).unwrap();

        let alloc = pd.alloc.unwrap();
        assert_eq!(alloc.offs, 0);
        assert_eq!(cache.gpu_addr(&pd) % PAGE_SIZE, 0);
        cache.free(&mut pd);
        assert_eq!(cache.allocated_chunks(), 0);
    }

    #[test]
    fn refilled_slot_comes_back_zeroed() {
        let g = test_gpu();
        let mut cache = PdCache::new();
        let mut pd = Pd::default();
        cache.alloc(&g, &mut pd, 256).unwrap();
        cache.pd_write(&g, &pd, 0, 0xffff_ffff);
        cache.free(&mut pd);

        let mut pd2 = Pd::default();
        cache.alloc(&g, &mut pd2, 256).unwrap();
        assert_eq!(cache.pd_read(&g, &pd2, 0), 0);
        cache.free(&mut pd2);
    }

    #[test]
    fn chunk_returns_to_partial_after_free() {
        let g = test_gpu();
        let mut cache = PdCache::new();
        let mut pds: Vec<Pd> = (0..17).map(|_| Pd::default()).collect();

        for pd in pds.iter_mut().take(16) {
            cache.alloc(&g, pd, 256).unwrap();
        }
        assert_eq!(cache.allocated_chunks(), 1);

        // Full chunk forces a second one.
        cache.alloc(&g, &mut pds[16], 256).unwrap();
        assert_eq!(cache.allocated_chunks(), 2);

        // Freeing one slot of the first chunk makes it reusable.
        cache.free(&mut pds[0]);
        let mut pd = Pd::default();
        cache.alloc(&g, &mut pd, 256).unwrap();
        assert_eq!(cache.allocated_chunks(), 2);

        cache.free(&mut pd);
        for pd in pds.iter_mut().skip(1) {
            cache.free(pd);
        }
        assert_eq!(cache.allocated_chunks(), 0);
    }
}
