// Copyright 2026 Gart Contributors
// SPDX-License-Identifier: Apache-2.0

//! gv11b-class FB/HUBMMU register model: fault buffers, the fault
//! snapshot registers and TLB maintenance.
//!
//! Register numbers here are part of the software contract of this tree,
//! not a transcription of any hardware manual; the bit-field semantics
//! follow the fault protocol exactly.

use crate::device::Gpu;
use crate::fault::buffer::FaultStatus;
use crate::hal::FbOps;
use crate::util::{poll_with_backoff, PollTimeoutError};

pub(crate) const FAULT_BUFFER_STRIDE: u32 = 0x20;
pub(crate) const FAULT_BUFFER_BASE: u32 = 0x0010_0e00;
pub(crate) const FAULT_BUFFER_LO: u32 = 0x00;
pub(crate) const FAULT_BUFFER_HI: u32 = 0x04;
pub(crate) const FAULT_BUFFER_GET: u32 = 0x08;
pub(crate) const FAULT_BUFFER_PUT: u32 = 0x0c;
pub(crate) const FAULT_BUFFER_SIZE: u32 = 0x10;

pub(crate) const FAULT_ADDR_LO: u32 = 0x0010_0e60;
pub(crate) const FAULT_ADDR_HI: u32 = 0x0010_0e64;
pub(crate) const FAULT_INST_LO: u32 = 0x0010_0e68;
pub(crate) const FAULT_INST_HI: u32 = 0x0010_0e6c;
pub(crate) const FAULT_INFO: u32 = 0x0010_0e70;
pub(crate) const FAULT_STATUS: u32 = 0x0010_0e74;

pub(crate) const NISO_INTR: u32 = 0x0010_0a20;

pub(crate) const MMU_INVALIDATE_PDB: u32 = 0x0010_0cb8;
pub(crate) const MMU_INVALIDATE: u32 = 0x0010_0cbc;
pub(crate) const MMU_CTRL: u32 = 0x0010_0cc4;
pub(crate) const L2_FLUSH_DIRTY: u32 = 0x0007_0010;

/// `get` register fields: pointer plus the two write-one-to-clear
/// condition bits.
pub const FAULT_BUFFER_GET_PTR_MASK: u32 = 0x000f_ffff;
pub const FAULT_BUFFER_GET_OVERFLOW: u32 = 1 << 30;
pub const FAULT_BUFFER_GET_GETPTR_CORRUPTED: u32 = 1 << 31;

/// `size` register fields.
pub const FAULT_BUFFER_SIZE_VAL_MASK: u32 = 0x000f_ffff;
pub const FAULT_BUFFER_SIZE_OVERFLOW_INTR_ENABLE: u32 = 1 << 29;
pub const FAULT_BUFFER_SIZE_ENABLE: u32 = 1 << 31;

/// Invalidate register bits.
pub const MMU_INVALIDATE_ALL_VA: u32 = 1 << 0;
pub const MMU_INVALIDATE_ALL_PDB: u32 = 1 << 1;
pub const MMU_INVALIDATE_REPLAY_START_ACK_ALL: u32 = 1 << 5;
pub const MMU_INVALIDATE_REPLAY_CANCEL_GLOBAL: u32 = 1 << 6;
pub const MMU_INVALIDATE_TRIGGER: u32 = 1 << 31;

/// Control register: the invalidate FIFO has drained.
pub const MMU_CTRL_PRI_FIFO_EMPTY: u32 = 1 << 15;

/// FB non-ISO interrupt bits routing MMU fault causes.
pub const NISO_INTR_MMU_OTHER_FAULT_NOTIFY: u32 = 1 << 0;
pub const NISO_INTR_MMU_NONREPLAY_FAULT_NOTIFY: u32 = 1 << 1;
pub const NISO_INTR_MMU_NONREPLAY_FAULT_OVERFLOW: u32 = 1 << 2;
pub const NISO_INTR_MMU_REPLAY_FAULT_NOTIFY: u32 = 1 << 3;
pub const NISO_INTR_MMU_REPLAY_FAULT_OVERFLOW: u32 = 1 << 4;
pub const NISO_INTR_MMU_ANY: u32 = NISO_INTR_MMU_OTHER_FAULT_NOTIFY
    | NISO_INTR_MMU_NONREPLAY_FAULT_NOTIFY
    | NISO_INTR_MMU_NONREPLAY_FAULT_OVERFLOW
    | NISO_INTR_MMU_REPLAY_FAULT_NOTIFY
    | NISO_INTR_MMU_REPLAY_FAULT_OVERFLOW;

// Fault-buffer ring entry: eight 32-bit words.
//
//  w0 inst_lo    [31:12] inst ptr >> 12, [9:8] aperture
//  w1 inst_hi
//  w2 addr_lo    [31:12] fault addr >> 12, [1:0] phys aperture
//  w3 addr_hi
//  w4 timestamp_lo
//  w5 timestamp_hi
//  w6 engine_id  [8:0]
//  w7 info       [4:0] fault type, [7] replayable, [14:8] client,
//                [19:16] access type, [20] client type, [28:24] gpc id,
//                [29] protected, [30] replayable-fault enable, [31] valid
pub const FAULT_BUF_ENTRY_SIZE: u32 = 32;
pub const FAULT_BUF_ENTRY_WORDS: u32 = FAULT_BUF_ENTRY_SIZE / 4;
static_assertions::const_assert_eq!(FAULT_BUF_ENTRY_WORDS, 8);

pub const FAULT_BUF_W_INST_LO: u64 = 0;
pub const FAULT_BUF_W_INST_HI: u64 = 1;
pub const FAULT_BUF_W_ADDR_LO: u64 = 2;
pub const FAULT_BUF_W_ADDR_HI: u64 = 3;
pub const FAULT_BUF_W_TIMESTAMP_LO: u64 = 4;
pub const FAULT_BUF_W_TIMESTAMP_HI: u64 = 5;
pub const FAULT_BUF_W_ENGINE_ID: u64 = 6;
pub const FAULT_BUF_W_INFO: u64 = 7;
/// Word carrying the entry valid bit (the packed info word).
pub const FAULT_BUF_W_VALID: u64 = FAULT_BUF_W_INFO;

pub const FAULT_ENTRY_INST_ADDR_SHIFT: u32 = 12;
pub const FAULT_ENTRY_INST_APERTURE_SHIFT: u32 = 8;
pub const FAULT_ENTRY_INST_APERTURE_MASK: u32 = 0x3;
pub const FAULT_ENTRY_ADDR_SHIFT: u32 = 12;
pub const FAULT_ENTRY_ADDR_APERTURE_MASK: u32 = 0x3;
pub const FAULT_ENTRY_ENGINE_ID_MASK: u32 = 0x1ff;

pub const FAULT_INFO_TYPE_MASK: u32 = 0x1f;
pub const FAULT_INFO_REPLAYABLE: u32 = 1 << 7;
pub const FAULT_INFO_CLIENT_SHIFT: u32 = 8;
pub const FAULT_INFO_CLIENT_MASK: u32 = 0x7f;
pub const FAULT_INFO_ACCESS_TYPE_SHIFT: u32 = 16;
pub const FAULT_INFO_ACCESS_TYPE_MASK: u32 = 0xf;
pub const FAULT_INFO_CLIENT_TYPE_SHIFT: u32 = 20;
pub const FAULT_INFO_GPC_ID_SHIFT: u32 = 24;
pub const FAULT_INFO_GPC_ID_MASK: u32 = 0x1f;
pub const FAULT_INFO_PROTECTED: u32 = 1 << 29;
pub const FAULT_INFO_REPLAYABLE_EN: u32 = 1 << 30;
pub const FAULT_INFO_VALID: u32 = 1 << 31;

/// MMU engine ids with dedicated handling.
pub const MMU_ENG_ID_PHYSICAL: u32 = 4;
pub const MMU_ENG_ID_BAR2: u32 = 5;
/// First copy-engine id; LCEs are numbered consecutively from here.
pub const MMU_ENG_ID_CE0: u32 = 15;

/// Fault types as recorded in the info word.
pub const FAULT_TYPE_INVALID_PDE: u32 = 0;
pub const FAULT_TYPE_PTE: u32 = 2;
pub const FAULT_TYPE_UNBOUND_INST_BLOCK: u32 = 4;

/// Client types.
pub const FAULT_CLIENT_TYPE_GPC: u32 = 0;
pub const FAULT_CLIENT_TYPE_HUB: u32 = 1;

pub(crate) fn buffer_reg(index: usize, offset: u32) -> u32 {
    FAULT_BUFFER_BASE + index as u32 * FAULT_BUFFER_STRIDE + offset
}

/// gv11b-class FB ops; tu104 reuses this block unchanged.
pub struct Gv11bFb;

impl FbOps for Gv11bFb {
    fn read_mmu_fault_buffer_get(&self, g: &Gpu, index: usize) -> u32 {
        g.bus.read32(buffer_reg(index, FAULT_BUFFER_GET))
    }

    fn write_mmu_fault_buffer_get(&self, g: &Gpu, index: usize, v: u32) {
        g.bus.write32(buffer_reg(index, FAULT_BUFFER_GET), v);
    }

    fn read_mmu_fault_buffer_put(&self, g: &Gpu, index: usize) -> u32 {
        g.bus.read32(buffer_reg(index, FAULT_BUFFER_PUT))
    }

    fn read_mmu_fault_buffer_size(&self, g: &Gpu, index: usize) -> u32 {
        g.bus.read32(buffer_reg(index, FAULT_BUFFER_SIZE))
    }

    fn write_mmu_fault_buffer_size(&self, g: &Gpu, index: usize, v: u32) {
        g.bus.write32(buffer_reg(index, FAULT_BUFFER_SIZE), v);
    }

    fn write_mmu_fault_buffer_lo_hi(&self, g: &Gpu, index: usize, lo: u32, hi: u32) {
        g.bus.write32(buffer_reg(index, FAULT_BUFFER_LO), lo);
        g.bus.write32(buffer_reg(index, FAULT_BUFFER_HI), hi);
    }

    fn read_mmu_fault_addr_lo_hi(&self, g: &Gpu) -> (u32, u32) {
        (g.bus.read32(FAULT_ADDR_LO), g.bus.read32(FAULT_ADDR_HI))
    }

    fn read_mmu_fault_inst_lo_hi(&self, g: &Gpu) -> (u32, u32) {
        (g.bus.read32(FAULT_INST_LO), g.bus.read32(FAULT_INST_HI))
    }

    fn read_mmu_fault_info(&self, g: &Gpu) -> u32 {
        g.bus.read32(FAULT_INFO)
    }

    fn read_mmu_fault_status(&self, g: &Gpu) -> FaultStatus {
        FaultStatus::from_bits_retain(g.bus.read32(FAULT_STATUS))
    }

    fn write_mmu_fault_status(&self, g: &Gpu, v: FaultStatus) {
        g.bus.write32(FAULT_STATUS, v.bits());
    }

    fn read_niso_intr(&self, g: &Gpu) -> u32 {
        g.bus.read32(NISO_INTR)
    }

    fn tlb_invalidate(&self, g: &Gpu, pdb_phys: u64) -> Result<(), PollTimeoutError> {
        let _tlb = g.mm.tlb_lock.lock();

        g.bus.write32(MMU_INVALIDATE_PDB, (pdb_phys >> 12) as u32);
        g.bus.write32(
            MMU_INVALIDATE,
            MMU_INVALIDATE_ALL_VA | MMU_INVALIDATE_ALL_PDB | MMU_INVALIDATE_TRIGGER,
        );

        let res = poll_with_backoff(g.config.poll_timeout, 5, 20, || {
            g.bus.read32(MMU_CTRL) & MMU_CTRL_PRI_FIFO_EMPTY != 0
        });
        if res.is_err() {
            log::error!("tlb invalidate timed out");
        }
        res
    }

    fn l2_flush(&self, g: &Gpu, invalidate: bool) -> Result<(), PollTimeoutError> {
        g.bus.write32(L2_FLUSH_DIRTY, 1 | u32::from(invalidate) << 1);
        Ok(())
    }

    fn mmu_invalidate_replay(&self, g: &Gpu, replay_val: u32) -> Result<(), PollTimeoutError> {
        let _tlb = g.mm.tlb_lock.lock();

        let mut reg = g.bus.read32(MMU_INVALIDATE);
        reg |= MMU_INVALIDATE_ALL_VA
            | MMU_INVALIDATE_ALL_PDB
            | replay_val
            | MMU_INVALIDATE_TRIGGER;
        g.bus.write32(MMU_INVALIDATE, reg);

        let res = poll_with_backoff(g.config.poll_timeout, 5, 20, || {
            g.bus.read32(MMU_CTRL) & MMU_CTRL_PRI_FIFO_EMPTY != 0
        });
        if res.is_err() {
            log::error!("invalidate replay {:#x} timed out", replay_val);
        }
        res
    }
}
