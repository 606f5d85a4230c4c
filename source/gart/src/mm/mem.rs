// Copyright 2026 Gart Contributors
// SPDX-License-Identifier: Apache-2.0

//! Memory descriptors and aperture-dispatched accessors.
//!
//! A [`Mem`] describes one allocation that lives either in system memory
//! (CPU-addressable backing owned by the descriptor) or in device-local
//! memory (reached indirectly through the PRAMIN paging window). Word
//! accessors dispatch on the aperture; touching an `Invalid` descriptor is
//! a driver defect and hits the assert path, not silent data.

use std::sync::atomic::{fence, Ordering};

use crate::device::Gpu;
use crate::mm::sgt::{Sgt, SgtSegment};
use crate::mm::PAGE_SIZE;

/// Memory domain an allocation resolves into.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Aperture {
    /// Unallocated or torn-down descriptor.
    #[default]
    Invalid,
    /// Non-coherent system memory.
    Sysmem,
    /// IO-coherent system memory.
    SysmemCoh,
    /// Device-local video memory.
    Vidmem,
}

impl Aperture {
    pub fn is_sysmem(self) -> bool {
        matches!(self, Aperture::Sysmem | Aperture::SysmemCoh)
    }
}

bitflags::bitflags! {
    /// Descriptor-level flags.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct MemFlags: u32 {
        /// Raw physical mapping that never went through the DMA allocation
        /// path; the generic free path must not try to unmap it there.
        const NO_DMA = 1 << 0;
        const READ_ONLY = 1 << 1;
        const SHADOW_COPY = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MemError {
    #[error("out of memory")]
    NoMemory,
}

/// One allocation, in whichever aperture it lives.
#[derive(Debug, Default)]
pub struct Mem {
    pub aperture: Aperture,
    pub size: u64,
    pub aligned_size: u64,
    /// Physical (or bus) address of the backing.
    pub phys: u64,
    /// CPU backing, words. Only populated for sysmem allocations obtained
    /// through the DMA path; `create_from_phys` descriptors have none.
    pub(crate) cpu_va: Vec<u32>,
    /// Byte offset into device-local memory for vidmem descriptors.
    pub(crate) vid_base: u64,
    pub(crate) sgt: Option<Sgt>,
    pub gpu_va: u64,
    pub mem_flags: MemFlags,
    /// Suppress the per-write store fence on vidmem writes; the caller
    /// issues one fence after the whole batch.
    pub skip_wmb: bool,
}

impl Mem {
    /// Fresh zeroed sysmem descriptor. `phys` is the bus address the
    /// backing was given by the allocator.
    pub(crate) fn new_sys(size: u64, phys: u64) -> Mem {
        let words = (size as usize).div_ceil(4);
        Mem {
            aperture: Aperture::Sysmem,
            size,
            aligned_size: size.next_multiple_of(PAGE_SIZE),
            phys,
            cpu_va: vec![0u32; words],
            ..Default::default()
        }
    }

    /// Descriptor for a device-local range starting at `vid_base`.
    pub fn new_vidmem(vid_base: u64, size: u64) -> Mem {
        Mem {
            aperture: Aperture::Vidmem,
            size,
            aligned_size: size.next_multiple_of(PAGE_SIZE),
            phys: vid_base,
            vid_base,
            ..Default::default()
        }
    }

    pub fn is_valid(&self) -> bool {
        self.aperture != Aperture::Invalid
    }

    pub fn sgt(&self) -> Option<&Sgt> {
        self.sgt.as_ref()
    }

    /// Releases the backing and the owned SGT; the descriptor reads as
    /// `Invalid` afterwards.
    pub fn free(&mut self) {
        self.sgt = None;
        self.cpu_va = Vec::new();
        self.aperture = Aperture::Invalid;
        self.size = 0;
        self.aligned_size = 0;
    }
}

/// Maps a logical aperture onto chip-supplied target-field masks. The
/// caller passes the chip's literal bit patterns for the three targets.
pub fn aperture_mask_raw(
    honors_aperture: bool,
    aperture: Aperture,
    sysmem_mask: u32,
    sysmem_coh_mask: u32,
    vidmem_mask: u32,
) -> u32 {
    // Some iGPUs treat SoC DRAM as vidmem; in that case every aperture
    // resolves to the vidmem target.
    let aperture = if honors_aperture { aperture } else { Aperture::Vidmem };

    match aperture {
        Aperture::Sysmem => sysmem_mask,
        Aperture::SysmemCoh => sysmem_coh_mask,
        Aperture::Vidmem => vidmem_mask,
        Aperture::Invalid => {
            log::error!("bad aperture");
            debug_assert!(false, "bad aperture");
            0
        }
    }
}

/// Builds a descriptor over a contiguous physical run of `nr_pages` CPU
/// pages, with a single-segment SGT. The destination is only touched once
/// nothing can fail; on error it is left exactly as passed in.
pub fn create_from_phys(dest: &mut Mem, src_phys: u64, nr_pages: u64) -> Result<(), MemError> {
    let size = nr_pages * PAGE_SIZE;
    let sgt = Sgt::from_segments(vec![SgtSegment::contiguous(src_phys, size)], false)
        .ok_or(MemError::NoMemory)?;

    *dest = Mem {
        aperture: Aperture::Sysmem,
        size,
        aligned_size: size,
        phys: src_phys,
        mem_flags: MemFlags::NO_DMA,
        sgt: Some(sgt),
        ..Default::default()
    };
    Ok(())
}

// PRAMIN paging window: device-local memory is reached by pointing the
// BAR0 window at the 64 KiB-aligned base and accessing the fixed PRAM
// range at the offset within that window.
pub(crate) const BUS_BAR0_WINDOW_R: u32 = 0x0000_1700;
pub(crate) const PRAM_BASE: u32 = 0x0070_0000;
const PRAM_WINDOW_SHIFT: u32 = 16;
const PRAM_WINDOW_MASK: u64 = (1 << PRAM_WINDOW_SHIFT) - 1;

impl Gpu {
    fn pramin_access(&self, mem: &Mem, byte_offset: u64) -> u32 {
        let addr = mem.vid_base + byte_offset;
        self.bus.write32(BUS_BAR0_WINDOW_R, (addr >> PRAM_WINDOW_SHIFT) as u32);
        PRAM_BASE + (addr & PRAM_WINDOW_MASK) as u32
    }

    /// Reads word `w` of `mem`.
    pub fn mem_rd32(&self, mem: &Mem, w: u64) -> u32 {
        match mem.aperture {
            Aperture::Sysmem | Aperture::SysmemCoh => {
                match mem.cpu_va.get(w as usize) {
                    Some(v) => *v,
                    None => {
                        log::error!("sysmem read past backing (word {})", w);
                        debug_assert!(false, "sysmem read past backing");
                        0
                    }
                }
            }
            Aperture::Vidmem => {
                let pram = self.pramin_access(mem, w * 4);
                self.bus.read32(pram)
            }
            Aperture::Invalid => {
                log::error!("accessing unallocated mem");
                debug_assert!(false, "accessing unallocated mem");
                0
            }
        }
    }

    /// Reads words `lo` and `hi` and combines them into one 64-bit value.
    pub fn mem_rd32_pair(&self, mem: &Mem, lo: u64, hi: u64) -> u64 {
        let lo_data = self.mem_rd32(mem, lo) as u64;
        let hi_data = self.mem_rd32(mem, hi) as u64;
        lo_data | (hi_data << 32)
    }

    /// Bulk read at a byte offset; offset and length must be word aligned.
    pub fn mem_rd_n(&self, mem: &Mem, offset: u64, dest: &mut [u32]) {
        if offset & 3 != 0 {
            log::warn!("unaligned mem read at {:#x}", offset);
        }
        for (i, d) in dest.iter_mut().enumerate() {
            *d = self.mem_rd32(mem, offset / 4 + i as u64);
        }
    }

    /// Writes word `w` of `mem`.
    pub fn mem_wr32(&self, mem: &mut Mem, w: u64, data: u32) {
        match mem.aperture {
            Aperture::Sysmem | Aperture::SysmemCoh => {
                match mem.cpu_va.get_mut(w as usize) {
                    Some(v) => *v = data,
                    None => {
                        log::error!("sysmem write past backing (word {})", w);
                        debug_assert!(false, "sysmem write past backing");
                    }
                }
            }
            Aperture::Vidmem => {
                let pram = self.pramin_access(mem, w * 4);
                self.bus.write32(pram, data);
                if !mem.skip_wmb {
                    fence(Ordering::SeqCst);
                }
            }
            Aperture::Invalid => {
                log::error!("accessing unallocated mem");
                debug_assert!(false, "accessing unallocated mem");
            }
        }
    }

    /// Bulk write at a byte offset; offset and source length must be word
    /// aligned.
    pub fn mem_wr_n(&self, mem: &mut Mem, offset: u64, src: &[u32]) {
        if offset & 3 != 0 {
            log::warn!("unaligned mem write at {:#x}", offset);
        }
        for (i, s) in src.iter().enumerate() {
            self.mem_wr32(mem, offset / 4 + i as u64, *s);
        }
    }

    /// Fills `size` bytes at `offset` with byte value `c`.
    pub fn mem_memset(&self, mem: &mut Mem, offset: u64, c: u8, size: u64) {
        if offset & 3 != 0 || size & 3 != 0 {
            log::warn!("unaligned memset at {:#x}+{:#x}", offset, size);
        }
        let word = u32::from_ne_bytes([c, c, c, c]);
        for w in 0..size / 4 {
            self.mem_wr32(mem, offset / 4 + w, word);
        }
    }

    /// Maps a logical aperture to the chip target bits for this descriptor.
    pub fn aperture_mask(
        &self,
        mem: &Mem,
        sysmem_mask: u32,
        sysmem_coh_mask: u32,
        vidmem_mask: u32,
    ) -> u32 {
        aperture_mask_raw(
            self.config.honors_aperture,
            mem.aperture,
            sysmem_mask,
            sysmem_coh_mask,
            vidmem_mask,
        )
    }

    /// Adds the IOMMU-enable bit to a physical address when the platform
    /// routes DMA through the IOMMU. Device-local allocations are never
    /// IOMMU-routed; asking for one is a (non-fatal) driver bug.
    pub fn mem_iommu_translate(&self, phys: u64) -> u64 {
        if phys >= self.config.vidmem_base && self.config.vidmem_base != 0 {
            log::warn!("iommu translate on a vidmem address {:#x}", phys);
        }
        if self.config.iommu_enabled {
            phys | (1u64 << self.config.iommu_bit)
        } else {
            phys
        }
    }

    /// Allocates zeroed, page-aligned system memory through the DMA path.
    pub fn dma_alloc_sys(&self, size: u64) -> Mem {
        let phys = self.alloc_phys(size.next_multiple_of(PAGE_SIZE));
        Mem::new_sys(size, phys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::test_support::{test_gpu, RegFile};
    use crate::mm::PAGE_SIZE;

    #[test]
    fn sysmem_word_round_trip() {
        let g = test_gpu();
        let mut mem = g.dma_alloc_sys(256);
        g.mem_wr32(&mut mem, 3, 0xcafe_f00d);
        assert_eq!(g.mem_rd32(&mem, 3), 0xcafe_f00d);
        assert_eq!(g.mem_rd32(&mem, 4), 0);
    }

    #[test]
    fn rd32_pair_combines_halves() {
        let g = test_gpu();
        let mut mem = g.dma_alloc_sys(64);
        g.mem_wr32(&mut mem, 0, 0x9abc_def0);
        g.mem_wr32(&mut mem, 1, 0x1234_5678);
        assert_eq!(g.mem_rd32_pair(&mem, 0, 1), 0x1234_5678_9abc_def0);
    }

    #[test]
    fn vidmem_goes_through_pramin_window() {
        let regs = RegFile::new();
        let g = test_gpu_with(regs.clone());
        let mut mem = Mem::new_vidmem(0x4_0000, 256);
        g.mem_wr32(&mut mem, 5, 0x5555_aaaa);
        // The window register points at the 64 KiB-aligned base.
        assert_eq!(regs.read(BUS_BAR0_WINDOW_R), 0x4);
        assert_eq!(g.mem_rd32(&mem, 5), 0x5555_aaaa);
    }

    fn test_gpu_with(regs: RegFile) -> crate::device::Gpu {
        crate::device::test_support::test_gpu_on(regs)
    }

    #[test]
    fn create_from_phys_builds_single_segment() {
        let mut dest = Mem::default();
        create_from_phys(&mut dest, 0x1000, 4).unwrap();

        assert_eq!(dest.size, 4 * PAGE_SIZE);
        assert_eq!(dest.aperture, Aperture::Sysmem);
        assert!(dest.mem_flags.contains(MemFlags::NO_DMA));

        let sgt = dest.sgt().unwrap();
        let segs: Vec<_> = sgt.iter().collect();
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].phys, 0x1000);
        assert_eq!(segs[0].length, 4 * PAGE_SIZE);
    }

    #[test]
    fn aperture_mask_honors_coherency() {
        assert_eq!(aperture_mask_raw(true, Aperture::Sysmem, 1, 2, 4), 1);
        assert_eq!(aperture_mask_raw(true, Aperture::SysmemCoh, 1, 2, 4), 2);
        assert_eq!(aperture_mask_raw(true, Aperture::Vidmem, 1, 2, 4), 4);
        // Non-honoring chips fold everything onto the vidmem target.
        assert_eq!(aperture_mask_raw(false, Aperture::Sysmem, 1, 2, 4), 4);
    }
}
