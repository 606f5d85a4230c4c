// Copyright 2026 Gart Contributors
// SPDX-License-Identifier: Apache-2.0

//! Multi-level GMMU page-table construction and teardown.
//!
//! The walker is generic over the chip's level table: each level describes
//! the VA bit-field that indexes it and how to program one entry. The
//! update of individual PDEs/PTEs is chip code (see `hal`); the chunking,
//! directory allocation and reclamation logic below is shared by every
//! chip.

use parking_lot::Mutex;

use crate::device::Gpu;
use crate::mm::mem::{Aperture, MemError};
use crate::mm::pd_cache::{Pd, PdCache};
use crate::mm::sgt::Sgt;
use crate::util::PollTimeoutError;

/// Small (4 KiB) page index into the per-VM page size table.
pub const PAGE_SIZE_SMALL: usize = 0;
/// Big (chip-configured, typically 64 KiB) page index.
pub const PAGE_SIZE_BIG: usize = 1;
/// Kernel mappings: aliased onto the small-page path.
pub const PAGE_SIZE_KERNEL: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    #[error("out of memory")]
    NoMemory,
    #[error("invalid map arguments")]
    InvalidArgs,
    #[error("no translation at this address")]
    NotMapped,
    #[error("hardware timeout")]
    Timeout,
}

impl From<MemError> for MapError {
    fn from(_: MemError) -> MapError {
        MapError::NoMemory
    }
}

impl From<PollTimeoutError> for MapError {
    fn from(_: PollTimeoutError) -> MapError {
        MapError::Timeout
    }
}

/// Requested access for a mapping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RwFlag {
    #[default]
    ReadWrite,
    ReadOnly,
    /// Not supported on Pascal and later; programmed as read-write.
    WriteOnly,
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        const CACHEABLE = 1 << 0;
        /// Write the PTE with its address but without the valid bit; a
        /// replayable fault on it can then be fixed in place.
        const UNMAPPED_PTE = 1 << 1;
        const SPARSE = 1 << 2;
    }
}

/// Attributes threaded through every level of one map/unmap call.
#[derive(Debug, Clone)]
pub struct GmmuAttrs {
    pub pgsz: usize,
    /// Compression tag offset in bytes; zero when uncompressed.
    pub ctag: u64,
    pub cacheable: bool,
    pub rw_flag: RwFlag,
    pub sparse: bool,
    pub priv_: bool,
    pub valid: bool,
    pub aperture: Aperture,
}

impl GmmuAttrs {
    /// Attributes for rewriting a range with the invalid pattern. Only the
    /// page size matters; it has to match the original mapping so the walk
    /// reaches the same PTEs.
    pub fn unmap(pgsz: usize) -> GmmuAttrs {
        GmmuAttrs {
            pgsz,
            ctag: 0,
            cacheable: false,
            rw_flag: RwFlag::ReadWrite,
            sparse: false,
            priv_: false,
            valid: false,
            aperture: Aperture::Invalid,
        }
    }
}

/// Programs one entry of a directory at this level.
pub type UpdateEntryFn =
    fn(&Gpu, &mut PdCache, &mut Pd, u32, u64, u64, &GmmuAttrs);

/// One GMMU level. The chip's table is terminated by an entry whose
/// `update_entry` is `None`; the level before it is the PTE level.
pub struct MmuLevel {
    /// Highest VA bit indexing this level, per page-size index.
    pub hi_bit: [u32; 2],
    /// Lowest VA bit indexing this level, per page-size index.
    pub lo_bit: [u32; 2],
    /// Entry size in bytes.
    pub entry_size: u32,
    pub update_entry: Option<UpdateEntryFn>,
}

/// Deferred cache-maintenance state for batched unmaps. Callers that batch
/// must issue the TLB invalidate themselves once the batch completes.
#[derive(Debug, Default)]
pub struct MappingBatch {
    pub need_tlb_invalidate: bool,
    pub gpu_l2_flushed: bool,
}

/// Mapping request. `vaddr == 0` asks the VM to allocate the range.
#[derive(Debug, Clone)]
pub struct MapParams {
    pub vaddr: u64,
    pub buffer_offset: u64,
    pub size: u64,
    pub pgsz: usize,
    pub flags: MapFlags,
    pub rw_flag: RwFlag,
    pub priv_: bool,
    pub ctag_offset: u64,
    pub aperture: Aperture,
}

fn pd_entries(l: &MmuLevel, pgsz: usize) -> usize {
    1usize << (l.hi_bit[pgsz] - l.lo_bit[pgsz] + 1)
}

fn pd_size(l: &MmuLevel, pgsz: usize) -> u32 {
    pd_entries(l, pgsz) as u32 * l.entry_size
}

fn pd_index(l: &MmuLevel, virt: u64, pgsz: usize) -> usize {
    let pd_mask = (1u64 << (l.hi_bit[pgsz] as u64 + 1)) - 1;
    ((virt & pd_mask) >> l.lo_bit[pgsz]) as usize
}

/// Word offset of entry `idx` within its directory.
pub fn pd_offset_from_index(l: &MmuLevel, idx: usize) -> u32 {
    idx as u32 * l.entry_size / 4
}

fn clear_entry(g: &Gpu, cache: &mut PdCache, pd: &Pd, l: &MmuLevel, idx: usize) {
    let base = pd_offset_from_index(l, idx);
    for w in 0..l.entry_size / 4 {
        cache.pd_write(g, pd, base + w, 0);
    }
}

/// Programs the level `lvl` directory for `[virt_addr, virt_addr+length)`,
/// descending into children chunk by chunk. `phys_addr == 0` means unmap.
fn set_pd_level(
    g: &Gpu,
    cache: &mut PdCache,
    levels: &[MmuLevel],
    pd: &mut Pd,
    lvl: usize,
    mut phys_addr: u64,
    mut virt_addr: u64,
    mut length: u64,
    attrs: &GmmuAttrs,
) -> Result<(), MapError> {
    let l = &levels[lvl];
    let next_l = &levels[lvl + 1];
    let update = l.update_entry.expect("walked past the PTE level");
    let pde_range = 1u64 << l.lo_bit[attrs.pgsz];

    // Iterate the range in chunks of this level's PDE span. For each chunk
    // program our entry and, when a next level exists, recurse into it.
    while length != 0 {
        let pd_idx = pd_index(l, virt_addr, attrs.pgsz);
        // The span truncates when virt does not start on a PDE boundary.
        let span = pde_range - (virt_addr & (pde_range - 1));
        let chunk = length.min(span);

        let mut target = phys_addr;
        if next_l.update_entry.is_some() {
            let n = pd_entries(l, attrs.pgsz);
            if pd.entries.len() < n {
                pd.entries.resize_with(n, Pd::default);
            }
            if !pd.entries[pd_idx].is_allocated() {
                cache.alloc(g, &mut pd.entries[pd_idx], pd_size(next_l, attrs.pgsz))?;
                pd.num_live += 1;
            }
            target = cache.gpu_addr(&pd.entries[pd_idx]);
        }

        update(g, cache, pd, pd_idx as u32, virt_addr, target, attrs);

        if next_l.update_entry.is_some() {
            let child = &mut pd.entries[pd_idx];
            set_pd_level(g, cache, levels, child, lvl + 1, phys_addr, virt_addr, chunk, attrs)?;

            // Unmapping may have emptied the child; reclaim it and drop
            // the stale PDE.
            if !attrs.valid && child.num_live == 0 && child.is_allocated() {
                cache.free(child);
                clear_entry(g, cache, pd, l, pd_idx);
                pd.num_live -= 1;
            }
        }

        virt_addr += chunk;
        // Zero phys means unmap; keep it zero so the PTE level writes the
        // invalid pattern throughout.
        if phys_addr != 0 {
            phys_addr += chunk;
        }
        length -= chunk;
    }

    Ok(())
}

/// Walks one SGL entry, splitting it at IPA translation boundaries.
#[allow(clippy::too_many_arguments)]
fn update_page_table_sgl(
    g: &Gpu,
    cache: &mut PdCache,
    levels: &[MmuLevel],
    pdb: &mut Pd,
    sgt: &Sgt,
    space_to_skip: &mut u64,
    virt_addr: &mut u64,
    length: &mut u64,
    mut ipa_addr: u64,
    mut sgl_length: u64,
    attrs: &GmmuAttrs,
) -> Result<(), MapError> {
    while sgl_length > 0 && *length > 0 {
        let mut phys_length = sgl_length;
        let phys_addr = sgt.ipa_to_pa(ipa_addr, &mut phys_length);

        // When the skip exceeds this physical run, consume the run whole.
        if *space_to_skip >= phys_length {
            *space_to_skip -= phys_length;
            ipa_addr += phys_length;
            sgl_length -= phys_length;
            continue;
        }

        let contiguous = phys_length.min(sgl_length);
        let mapped = (*length).min(contiguous - *space_to_skip);

        set_pd_level(
            g,
            cache,
            levels,
            pdb,
            0,
            phys_addr + *space_to_skip,
            *virt_addr,
            mapped,
            attrs,
        )?;

        *virt_addr += mapped;
        *length -= mapped;
        sgl_length -= mapped + *space_to_skip;
        ipa_addr += mapped + *space_to_skip;
        *space_to_skip = 0;
    }
    Ok(())
}

fn update_page_table_no_iommu(
    g: &Gpu,
    cache: &mut PdCache,
    levels: &[MmuLevel],
    pdb: &mut Pd,
    sgt: &Sgt,
    mut space_to_skip: u64,
    mut virt_addr: u64,
    mut length: u64,
    attrs: &GmmuAttrs,
) -> Result<(), MapError> {
    for seg in sgt.iter() {
        if space_to_skip != 0 && space_to_skip >= seg.length {
            space_to_skip -= seg.length;
            continue;
        }

        update_page_table_sgl(
            g,
            cache,
            levels,
            pdb,
            sgt,
            &mut space_to_skip,
            &mut virt_addr,
            &mut length,
            seg.ipa,
            seg.length,
            attrs,
        )?;

        if length == 0 {
            break;
        }
    }
    Ok(())
}

fn update_page_table(
    g: &Gpu,
    cache: &mut PdCache,
    levels: &[MmuLevel],
    pdb: &mut Pd,
    sgt: Option<&Sgt>,
    space_to_skip: u64,
    virt_addr: u64,
    length: u64,
    attrs: &GmmuAttrs,
) -> Result<(), MapError> {
    let Some(sgt) = sgt else {
        // Unmap: program the whole range with zero physical addresses.
        debug_assert!(virt_addr != 0);
        return set_pd_level(g, cache, levels, pdb, 0, 0, virt_addr, length, attrs);
    };

    // An IOMMU collapses the scatter list into a single IO-virtual chunk;
    // otherwise each physically-contiguous run is mapped on its own.
    let first = sgt.iter().next().ok_or(MapError::InvalidArgs)?;
    if attrs.aperture.is_sysmem() && g.config.iommu_enabled && sgt.iommuable() {
        let io_addr = sgt.gpu_addr(g, first, attrs) + space_to_skip;
        return set_pd_level(g, cache, levels, pdb, 0, io_addr, virt_addr, length, attrs);
    }

    let res = update_page_table_no_iommu(
        g, cache, levels, pdb, sgt, space_to_skip, virt_addr, length, attrs,
    );

    if let Err(err) = res {
        // Back the partial mapping out so the GPU cannot wander into a
        // half-programmed range. This unmap can only fail where the map
        // did, correctly undoing what landed.
        log::error!("map failed ({err}), backing off");
        let unmap_attrs = GmmuAttrs::unmap(attrs.pgsz);
        if let Err(err2) =
            set_pd_level(g, cache, levels, pdb, 0, 0, virt_addr, length, &unmap_attrs)
        {
            log::error!("backoff unmap failed: {err2}");
        }
        return Err(err);
    }
    Ok(())
}

struct VmInner {
    pdb: Pd,
    va_next: u64,
    va_limit: u64,
}

/// One GPU virtual address space. Page-table updates against a single VM
/// serialize on the internal lock; distinct VMs are independent.
pub struct Vm {
    pub name: String,
    levels: &'static [MmuLevel],
    page_sizes: [u64; 3],
    inner: Mutex<VmInner>,
}

impl Vm {
    /// Creates a VM and allocates its top-level page directory. The PDB
    /// comes from the direct path so its address is full-page aligned for
    /// the TLB-invalidate interface.
    pub fn new(
        g: &Gpu,
        name: &str,
        levels: &'static [MmuLevel],
        big_page_size: u64,
        va_start: u64,
        va_limit: u64,
    ) -> Result<Vm, MapError> {
        let mut pdb = Pd::default();
        let pdb_size = pd_size(&levels[0], PAGE_SIZE_SMALL);
        g.mm.pd_cache.lock().alloc_direct(g, &mut pdb, pdb_size)?;

        Ok(Vm {
            name: name.to_owned(),
            levels,
            page_sizes: [crate::mm::PAGE_SIZE, big_page_size, crate::mm::PAGE_SIZE],
            inner: Mutex::new(VmInner { pdb, va_next: va_start, va_limit }),
        })
    }

    pub fn page_size(&self, pgsz: usize) -> u64 {
        self.page_sizes[pgsz]
    }

    /// Bus address of the top-level directory, as handed to the TLB
    /// invalidate hardware.
    pub fn pdb_phys(&self, g: &Gpu) -> u64 {
        let inner = self.inner.lock();
        g.mm.pd_cache.lock().gpu_addr(&inner.pdb)
    }

    fn alloc_va(inner: &mut VmInner, size: u64, page_size: u64) -> Option<u64> {
        let base = inner.va_next.next_multiple_of(page_size);
        let end = base.checked_add(size)?;
        if end > inner.va_limit {
            return None;
        }
        inner.va_next = end;
        Some(base)
    }

    fn normalize_pgsz(&self, pgsz: usize) -> Result<usize, MapError> {
        // The low-level walker only knows small and big pages.
        let pgsz = if pgsz == PAGE_SIZE_KERNEL { PAGE_SIZE_SMALL } else { pgsz };
        if pgsz > PAGE_SIZE_BIG || self.page_sizes[pgsz] == 0 {
            return Err(MapError::InvalidArgs);
        }
        Ok(pgsz)
    }

    /// Maps `sgt` and returns the GPU virtual address. With a batch, TLB
    /// maintenance is deferred to the caller; without one it happens here.
    pub fn map(
        &self,
        g: &Gpu,
        sgt: &Sgt,
        params: &MapParams,
        mut batch: Option<&mut MappingBatch>,
    ) -> Result<u64, MapError> {
        let pgsz = self.normalize_pgsz(params.pgsz)?;
        let page_size = self.page_sizes[pgsz];
        if params.buffer_offset & (page_size - 1) != 0 {
            return Err(MapError::InvalidArgs);
        }
        let length = params.size.next_multiple_of(page_size);

        let attrs = GmmuAttrs {
            pgsz,
            ctag: params.ctag_offset,
            cacheable: params.flags.contains(MapFlags::CACHEABLE),
            rw_flag: params.rw_flag,
            sparse: params.flags.contains(MapFlags::SPARSE),
            priv_: params.priv_,
            valid: !params.flags.contains(MapFlags::UNMAPPED_PTE),
            aperture: params.aperture,
        };

        let mut inner = self.inner.lock();
        let va_allocated = params.vaddr == 0;
        let vaddr = if va_allocated {
            Self::alloc_va(&mut inner, length, page_size).ok_or(MapError::NoMemory)?
        } else {
            params.vaddr
        };

        let pdb_phys;
        let res = {
            let mut cache = g.mm.pd_cache.lock();
            let r = update_page_table(
                g,
                &mut cache,
                self.levels,
                &mut inner.pdb,
                Some(sgt),
                params.buffer_offset,
                vaddr,
                length,
                &attrs,
            );
            pdb_phys = cache.gpu_addr(&inner.pdb);
            r
        };
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);

        match res {
            Ok(()) => {
                g.cache_maint_map(pdb_phys, batch.as_deref_mut())?;
                Ok(vaddr)
            }
            Err(err) => {
                // The PTEs were partially filled and unmapped again; treat
                // the maintenance like an unmap to fence off stale reads.
                if let Err(m) = g.cache_maint_unmap(pdb_phys, batch.as_deref_mut()) {
                    log::error!("cache maintenance on failed map: {m}");
                }
                Err(err)
            }
        }
    }

    /// Rewrites `[vaddr, vaddr+size)` with the invalid pattern and reclaims
    /// page directories that became empty.
    pub fn unmap(
        &self,
        g: &Gpu,
        vaddr: u64,
        size: u64,
        pgsz: usize,
        mut batch: Option<&mut MappingBatch>,
    ) -> Result<(), MapError> {
        let pgsz = self.normalize_pgsz(pgsz)?;
        let length = size.next_multiple_of(self.page_sizes[pgsz]);
        let attrs = GmmuAttrs::unmap(pgsz);

        let mut inner = self.inner.lock();
        let pdb_phys;
        let res = {
            let mut cache = g.mm.pd_cache.lock();
            let r = update_page_table(
                g,
                &mut cache,
                self.levels,
                &mut inner.pdb,
                None,
                0,
                vaddr,
                length,
                &attrs,
            );
            pdb_phys = cache.gpu_addr(&inner.pdb);
            r
        };
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);

        if let Err(err) = res {
            log::error!("failed to update ptes on unmap: {err}");
        }
        g.cache_maint_unmap(pdb_phys, batch.as_deref_mut())
    }

    fn locate_pte(&self, inner: &VmInner, vaddr: u64) -> Result<(Vec<usize>, u32), MapError> {
        // Descend with the small-page view; the path records each level's
        // index so callers can re-walk mutably.
        let mut path = Vec::new();
        let mut pd: &Pd = &inner.pdb;
        let mut lvl = 0;
        loop {
            let l = &self.levels[lvl];
            let next_l = &self.levels[lvl + 1];
            let idx = pd_index(l, vaddr, PAGE_SIZE_SMALL);
            if next_l.update_entry.is_some() {
                let child = pd.entries.get(idx).ok_or(MapError::NotMapped)?;
                if !child.is_allocated() {
                    return Err(MapError::NotMapped);
                }
                path.push(idx);
                pd = child;
                lvl += 1;
            } else {
                path.push(idx);
                return Ok((path, pd_offset_from_index(l, idx)));
            }
        }
    }

    /// Reads the two PTE words translating `vaddr`.
    pub fn get_pte(&self, g: &Gpu, vaddr: u64) -> Result<[u32; 2], MapError> {
        let inner = self.inner.lock();
        let (path, word) = self.locate_pte(&inner, vaddr)?;
        let cache = g.mm.pd_cache.lock();

        let mut pd: &Pd = &inner.pdb;
        for idx in &path[..path.len() - 1] {
            pd = &pd.entries[*idx];
        }
        Ok([cache.pd_read(g, pd, word), cache.pd_read(g, pd, word + 1)])
    }

    /// Rewrites the PTE translating `vaddr`. The caller is responsible for
    /// the TLB invalidate that makes the new entry visible.
    pub fn set_pte(&self, g: &Gpu, vaddr: u64, pte: &[u32; 2]) -> Result<(), MapError> {
        let inner = self.inner.lock();
        let (path, word) = self.locate_pte(&inner, vaddr)?;
        let mut cache = g.mm.pd_cache.lock();

        let mut pd: &Pd = &inner.pdb;
        for idx in &path[..path.len() - 1] {
            pd = &pd.entries[*idx];
        }
        cache.pd_write(g, pd, word, pte[0]);
        cache.pd_write(g, pd, word + 1, pte[1]);
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    /// Releases every directory still held by this VM, the PDB included.
    pub fn teardown(&self, g: &Gpu) {
        let mut inner = self.inner.lock();
        let mut cache = g.mm.pd_cache.lock();
        fn free_tree(cache: &mut PdCache, pd: &mut Pd) {
            for child in &mut pd.entries {
                free_tree(cache, child);
            }
            pd.entries.clear();
            if pd.is_allocated() {
                cache.free(pd);
            }
        }
        free_tree(&mut cache, &mut inner.pdb);
    }
}

impl Gpu {
    /// TLB maintenance after a successful map.
    pub(crate) fn cache_maint_map(
        &self,
        pdb_phys: u64,
        batch: Option<&mut MappingBatch>,
    ) -> Result<(), MapError> {
        match batch {
            None => self.fb.tlb_invalidate(self, pdb_phys).map_err(Into::into),
            Some(b) => {
                b.need_tlb_invalidate = true;
                Ok(())
            }
        }
    }

    /// L2 flush plus TLB maintenance after an unmap (or a failed map).
    pub(crate) fn cache_maint_unmap(
        &self,
        pdb_phys: u64,
        batch: Option<&mut MappingBatch>,
    ) -> Result<(), MapError> {
        match batch {
            None => {
                if let Err(err) = self.fb.l2_flush(self, true) {
                    log::error!("l2 flush failed: {err}");
                }
                self.fb.tlb_invalidate(self, pdb_phys).map_err(Into::into)
            }
            Some(b) => {
                if !b.gpu_l2_flushed {
                    if let Err(err) = self.fb.l2_flush(self, true) {
                        log::error!("l2 flush failed: {err}");
                    }
                    b.gpu_l2_flushed = true;
                }
                b.need_tlb_invalidate = true;
                Ok(())
            }
        }
    }
}

/// Words per PTE for the given level table.
pub fn pte_words(levels: &[MmuLevel]) -> u32 {
    let mut i = 0;
    while levels[i + 1].update_entry.is_some() {
        i += 1;
    }
    levels[i].entry_size / 4
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::test_support::test_gpu;
    use crate::hal::gp10b::{PTE_READ_ONLY, PTE_VALID};
    use crate::mm::mem::Aperture;
    use crate::mm::sgt::Sgt;
    use proptest::prelude::*;

    fn params(vaddr: u64, size: u64) -> MapParams {
        MapParams {
            vaddr,
            buffer_offset: 0,
            size,
            pgsz: PAGE_SIZE_SMALL,
            flags: MapFlags::CACHEABLE,
            rw_flag: RwFlag::ReadWrite,
            priv_: false,
            ctag_offset: 0,
            aperture: Aperture::Sysmem,
        }
    }

    #[test]
    fn map_then_get_pte_sees_translation() {
        let g = test_gpu();
        let vm = g.create_vm("t").unwrap();
        let sgt = Sgt::from_phys(0x20_0000, 0x4000);

        let va = vm.map(&g, &sgt, &params(0x10_0000, 0x4000), None).unwrap();
        assert_eq!(va, 0x10_0000);

        let pte = vm.get_pte(&g, va).unwrap();
        assert_ne!(pte[0] & PTE_VALID, 0);
        let pte_last = vm.get_pte(&g, va + 0x3000).unwrap();
        assert_ne!(pte_last[0] & PTE_VALID, 0);
        assert_ne!(pte, pte_last);
    }

    #[test]
    fn map_unmap_map_is_idempotent() {
        let g = test_gpu();
        let vm = g.create_vm("t").unwrap();
        let sgt = Sgt::from_phys(0x40_0000, 0x3000);
        let p = params(0x20_0000, 0x3000);

        vm.map(&g, &sgt, &p, None).unwrap();
        let first: Vec<[u32; 2]> = (0..3)
            .map(|i| vm.get_pte(&g, 0x20_0000 + i * 0x1000).unwrap())
            .collect();

        vm.unmap(&g, 0x20_0000, 0x3000, PAGE_SIZE_SMALL, None).unwrap();
        // Unmap reclaims the page directories, so the translation is gone
        // entirely rather than reading as a zeroed PTE.
        assert_eq!(vm.get_pte(&g, 0x20_0000), Err(MapError::NotMapped));

        vm.map(&g, &sgt, &p, None).unwrap();
        let second: Vec<[u32; 2]> = (0..3)
            .map(|i| vm.get_pte(&g, 0x20_0000 + i * 0x1000).unwrap())
            .collect();
        assert_eq!(first, second);
    }

    #[test]
    fn unmapped_pte_flag_writes_entry_without_valid() {
        let g = test_gpu();
        let vm = g.create_vm("t").unwrap();
        let sgt = Sgt::from_phys(0x80_0000, 0x1000);
        let mut p = params(0x30_0000, 0x1000);
        p.flags |= MapFlags::UNMAPPED_PTE;

        vm.map(&g, &sgt, &p, None).unwrap();
        let pte = vm.get_pte(&g, 0x30_0000).unwrap();
        assert_eq!(pte[0] & PTE_VALID, 0);
        assert_ne!(pte[0] | pte[1], 0);
    }

    #[test]
    fn read_only_mapping_carries_ro_bit() {
        let g = test_gpu();
        let vm = g.create_vm("t").unwrap();
        let sgt = Sgt::from_phys(0x90_0000, 0x1000);
        let mut p = params(0x40_0000, 0x1000);
        p.rw_flag = RwFlag::ReadOnly;

        vm.map(&g, &sgt, &p, None).unwrap();
        let pte = vm.get_pte(&g, 0x40_0000).unwrap();
        assert_ne!(pte[0] & PTE_READ_ONLY, 0);
    }

    #[test]
    fn batch_defers_tlb_maintenance() {
        let g = test_gpu();
        let vm = g.create_vm("t").unwrap();
        let sgt = Sgt::from_phys(0xa0_0000, 0x2000);
        let mut batch = MappingBatch::default();

        vm.map(&g, &sgt, &params(0x50_0000, 0x2000), Some(&mut batch)).unwrap();
        assert!(batch.need_tlb_invalidate);
        assert!(!batch.gpu_l2_flushed);

        vm.unmap(&g, 0x50_0000, 0x2000, PAGE_SIZE_SMALL, Some(&mut batch)).unwrap();
        assert!(batch.need_tlb_invalidate);
        assert!(batch.gpu_l2_flushed);
    }

    #[test]
    fn discontiguous_sgt_maps_each_run() {
        let g = test_gpu();
        let vm = g.create_vm("t").unwrap();
        let segs = vec![
            crate::mm::sgt::SgtSegment::contiguous(0x100_0000, 0x1000),
            crate::mm::sgt::SgtSegment::contiguous(0x300_0000, 0x1000),
        ];
        let sgt = Sgt::from_segments(segs, false).unwrap();

        vm.map(&g, &sgt, &params(0x60_0000, 0x2000), None).unwrap();
        let pte0 = vm.get_pte(&g, 0x60_0000).unwrap();
        let pte1 = vm.get_pte(&g, 0x60_1000).unwrap();
        assert_ne!(pte0[0] & PTE_VALID, 0);
        assert_ne!(pte1[0] & PTE_VALID, 0);
        assert_ne!(pte0[0], pte1[0]);
    }

    #[test]
    fn set_pte_rewrites_in_place() {
        let g = test_gpu();
        let vm = g.create_vm("t").unwrap();
        let sgt = Sgt::from_phys(0xb0_0000, 0x1000);
        let mut p = params(0x70_0000, 0x1000);
        p.flags |= MapFlags::UNMAPPED_PTE;
        vm.map(&g, &sgt, &p, None).unwrap();

        let mut pte = vm.get_pte(&g, 0x70_0000).unwrap();
        pte[0] |= PTE_VALID;
        vm.set_pte(&g, 0x70_0000, &pte).unwrap();
        assert_eq!(vm.get_pte(&g, 0x70_0000).unwrap(), pte);
    }

    proptest! {
        // Directory-block conservation: after unmapping everything that
        // was mapped, the PD cache is back to the PDB-only baseline.
        #[test]
        fn pd_cache_conserved_across_map_unmap(
            ranges in proptest::collection::vec((0u64..64, 1u64..8), 1..12)
        ) {
            let g = test_gpu();
            let vm = g.create_vm("t").unwrap();
            let baseline = g.mm.pd_cache.lock().allocated_chunks();

            let mut mapped = Vec::new();
            for (slot, pages) in ranges {
                // Slots are spread wide so ranges land in distinct
                // directories often but not always.
                let va = 0x100_0000 + slot * 0x40_0000;
                let size = pages * 0x1000;
                let sgt = Sgt::from_phys(0x1000_0000 + slot * 0x10_0000, size);
                if vm.map(&g, &sgt, &params(va, size), None).is_ok() {
                    mapped.push((va, size));
                }
            }
            prop_assert!(!mapped.is_empty());

            for (va, size) in mapped {
                vm.unmap(&g, va, size, PAGE_SIZE_SMALL, None).unwrap();
            }
            prop_assert_eq!(g.mm.pd_cache.lock().allocated_chunks(), baseline);
        }
    }

    #[test]
    fn teardown_releases_everything() {
        let g = test_gpu();
        let vm = g.create_vm("t").unwrap();
        let sgt = Sgt::from_phys(0xc0_0000, 0x4000);
        vm.map(&g, &sgt, &params(0x80_0000, 0x4000), None).unwrap();
        assert!(g.mm.pd_cache.lock().allocated_chunks() > 1);

        vm.teardown(&g);
        assert_eq!(g.mm.pd_cache.lock().allocated_chunks(), 0);
    }
}
