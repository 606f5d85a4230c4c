// Copyright 2026 Gart Contributors
// SPDX-License-Identifier: Apache-2.0

//! gp10b+ "new format" GMMU tables: the five-level page table and the
//! 2-word PDE/PTE encoding shared by every Pascal-and-later chip in this
//! tree.

use crate::device::Gpu;
use crate::mm::gmmu::{GmmuAttrs, MmuLevel, RwFlag};
use crate::mm::mem::{aperture_mask_raw, Aperture};
use crate::mm::pd_cache::{Pd, PdCache};

pub const PTE_VALID: u32 = 1 << 0;
pub const PTE_APERTURE_VIDEO: u32 = 0 << 1;
pub const PTE_APERTURE_SYS_COH: u32 = 2 << 1;
pub const PTE_APERTURE_SYS_NCOH: u32 = 3 << 1;
pub const PTE_VOL: u32 = 1 << 3;
pub const PTE_PRIVILEGE: u32 = 1 << 5;
pub const PTE_READ_ONLY: u32 = 1 << 6;
/// Addresses are stored right-shifted by this alignment shift.
pub const PTE_ADDR_SHIFT: u32 = 12;
const ADDR_FIELD_SHIFT: u32 = 8;
const ADDR_FIELD_MASK: u32 = 0x00ff_ffff;
/// Compression tag line field in the second word.
const COMPTAG_SHIFT: u32 = 12;
const COMPTAG_GRANULARITY: u64 = 1 << 16;

static_assertions::const_assert_eq!(ENTRY_SIZE, 8);
const ENTRY_SIZE: u32 = 8;

fn split_addr(addr: u64) -> (u32, u32) {
    let val = addr >> PTE_ADDR_SHIFT;
    (((val as u32) & ADDR_FIELD_MASK) << ADDR_FIELD_SHIFT, (val >> 24) as u32)
}

/// Encodes the two PTE words for `phys_addr` under `attrs`. `phys_addr`
/// of zero with a non-sparse request yields the all-invalid pattern.
pub fn pte_encode(g: &Gpu, phys_addr: u64, attrs: &GmmuAttrs) -> [u32; 2] {
    if phys_addr == 0 {
        // Sparse placeholders keep an explicit entry; plain unmaps clear it.
        return if attrs.sparse { [PTE_VOL, 0] } else { [0, 0] };
    }

    let (addr_lo, addr_hi) = split_addr(phys_addr);
    let mut w0 = aperture_mask_raw(
        g.config.honors_aperture,
        attrs.aperture,
        PTE_APERTURE_SYS_NCOH,
        PTE_APERTURE_SYS_COH,
        PTE_APERTURE_VIDEO,
    ) | addr_lo;
    let mut w1 = addr_hi;

    if attrs.valid {
        w0 |= PTE_VALID;
    }
    // Write-only has no encoding on this generation; it maps as RW.
    if matches!(attrs.rw_flag, RwFlag::ReadOnly) {
        w0 |= PTE_READ_ONLY;
    }
    if attrs.priv_ {
        w0 |= PTE_PRIVILEGE;
    }
    if !attrs.cacheable {
        w0 |= PTE_VOL;
    }
    if attrs.ctag != 0 {
        w1 |= ((attrs.ctag / COMPTAG_GRANULARITY) as u32) << COMPTAG_SHIFT;
    }

    [w0, w1]
}

fn update_pde(
    g: &Gpu,
    cache: &mut PdCache,
    pd: &mut Pd,
    idx: u32,
    _virt: u64,
    target: u64,
    _attrs: &GmmuAttrs,
) {
    let word = idx * (ENTRY_SIZE / 4);
    if target == 0 {
        cache.pd_write(g, pd, word, 0);
        cache.pd_write(g, pd, word + 1, 0);
        return;
    }

    // Directories always live in sysmem in this tree.
    let (addr_lo, addr_hi) = split_addr(target);
    let w0 = aperture_mask_raw(
        g.config.honors_aperture,
        Aperture::Sysmem,
        PTE_APERTURE_SYS_NCOH,
        PTE_APERTURE_SYS_COH,
        PTE_APERTURE_VIDEO,
    ) | addr_lo
        | PTE_VOL;

    cache.pd_write(g, pd, word, w0);
    cache.pd_write(g, pd, word + 1, addr_hi);
}

fn update_pte(
    g: &Gpu,
    cache: &mut PdCache,
    pd: &mut Pd,
    idx: u32,
    _virt: u64,
    phys: u64,
    attrs: &GmmuAttrs,
) {
    let word = idx * (ENTRY_SIZE / 4);
    let old_live =
        cache.pd_read(g, pd, word) != 0 || cache.pd_read(g, pd, word + 1) != 0;

    let pte = pte_encode(g, phys, attrs);
    cache.pd_write(g, pd, word, pte[0]);
    cache.pd_write(g, pd, word + 1, pte[1]);

    let new_live = pte[0] != 0 || pte[1] != 0;
    if new_live && !old_live {
        pd.num_live += 1;
    } else if !new_live && old_live {
        pd.num_live = pd.num_live.saturating_sub(1);
    }
}

/// Five PDE/PTE levels covering the 49-bit VA space; the terminator marks
/// the level below the PTEs. Leaf `lo_bit` differs for big pages.
pub static MMU_LEVELS: [MmuLevel; 6] = [
    MmuLevel { hi_bit: [48, 48], lo_bit: [47, 47], entry_size: ENTRY_SIZE, update_entry: Some(update_pde) },
    MmuLevel { hi_bit: [46, 46], lo_bit: [38, 38], entry_size: ENTRY_SIZE, update_entry: Some(update_pde) },
    MmuLevel { hi_bit: [37, 37], lo_bit: [29, 29], entry_size: ENTRY_SIZE, update_entry: Some(update_pde) },
    MmuLevel { hi_bit: [28, 28], lo_bit: [21, 21], entry_size: ENTRY_SIZE, update_entry: Some(update_pde) },
    MmuLevel { hi_bit: [20, 20], lo_bit: [12, 16], entry_size: ENTRY_SIZE, update_entry: Some(update_pte) },
    MmuLevel { hi_bit: [0, 0], lo_bit: [0, 0], entry_size: 0, update_entry: None },
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::test_support::test_gpu;
    use crate::mm::gmmu::PAGE_SIZE_SMALL;

    fn attrs() -> GmmuAttrs {
        GmmuAttrs {
            pgsz: PAGE_SIZE_SMALL,
            ctag: 0,
            cacheable: true,
            rw_flag: RwFlag::ReadWrite,
            sparse: false,
            priv_: false,
            valid: true,
            aperture: Aperture::Sysmem,
        }
    }

    #[test]
    fn pte_carries_address_and_valid() {
        let g = test_gpu();
        let pte = pte_encode(&g, 0x12345_000, &attrs());
        assert_ne!(pte[0] & PTE_VALID, 0);
        assert_eq!((pte[0] >> ADDR_FIELD_SHIFT) & ADDR_FIELD_MASK, 0x12345);
        assert_eq!(pte[0] & PTE_VOL, 0);
    }

    #[test]
    fn read_only_and_priv_bits() {
        let g = test_gpu();
        let mut a = attrs();
        a.rw_flag = RwFlag::ReadOnly;
        a.priv_ = true;
        a.cacheable = false;
        let pte = pte_encode(&g, 0x1000, &a);
        assert_ne!(pte[0] & PTE_READ_ONLY, 0);
        assert_ne!(pte[0] & PTE_PRIVILEGE, 0);
        assert_ne!(pte[0] & PTE_VOL, 0);
    }

    #[test]
    fn write_only_degrades_to_read_write() {
        let g = test_gpu();
        let mut a = attrs();
        a.rw_flag = RwFlag::WriteOnly;
        let pte = pte_encode(&g, 0x1000, &a);
        assert_eq!(pte[0] & PTE_READ_ONLY, 0);
    }

    #[test]
    fn unmapped_pte_keeps_address_without_valid() {
        let g = test_gpu();
        let mut a = attrs();
        a.valid = false;
        let pte = pte_encode(&g, 0x4000, &a);
        assert_eq!(pte[0] & PTE_VALID, 0);
        assert_ne!((pte[0] >> ADDR_FIELD_SHIFT) & ADDR_FIELD_MASK, 0);
    }

    #[test]
    fn sparse_placeholder_is_volatile_only() {
        let g = test_gpu();
        let mut a = attrs();
        a.valid = false;
        a.sparse = true;
        assert_eq!(pte_encode(&g, 0, &a), [PTE_VOL, 0]);
    }

    #[test]
    fn high_address_bits_land_in_word_one() {
        let g = test_gpu();
        let pte = pte_encode(&g, 0x1_2345_6789_f000, &attrs());
        assert_eq!(pte[1], (0x1_2345_6789_f000u64 >> 12 >> 24) as u32);
    }
}
