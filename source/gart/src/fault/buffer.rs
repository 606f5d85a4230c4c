// Copyright 2026 Gart Contributors
// SPDX-License-Identifier: Apache-2.0

//! Hardware fault-buffer management and the fault-handling protocol.
//!
//! Two ring buffers (non-replayable, replayable) share one drain
//! implementation. Replayable invalid-PTE faults get a fix-and-retry
//! attempt; everything else escalates to channel/TSG/runlist recovery
//! through the channel collaborator. The replay-or-cancel request is
//! accumulated across one drain pass and issued once at the end.

use std::sync::atomic::{fence, Ordering};

use crate::device::Gpu;
use crate::fault::info::{EngineIdType, FaultInfo, INVALID_ENG_ID};
use crate::hal::gv11b::{
    FAULT_BUF_ENTRY_SIZE, FAULT_BUF_ENTRY_WORDS, FAULT_BUF_W_ADDR_HI, FAULT_BUF_W_ADDR_LO,
    FAULT_BUF_W_ENGINE_ID, FAULT_BUF_W_INFO, FAULT_BUF_W_INST_HI, FAULT_BUF_W_INST_LO,
    FAULT_BUF_W_TIMESTAMP_HI, FAULT_BUF_W_TIMESTAMP_LO, FAULT_BUF_W_VALID,
    FAULT_BUFFER_GET_GETPTR_CORRUPTED, FAULT_BUFFER_GET_OVERFLOW, FAULT_BUFFER_GET_PTR_MASK,
    FAULT_BUFFER_SIZE_ENABLE, FAULT_BUFFER_SIZE_OVERFLOW_INTR_ENABLE, FAULT_BUFFER_SIZE_VAL_MASK,
    FAULT_CLIENT_TYPE_GPC, FAULT_ENTRY_ADDR_APERTURE_MASK, FAULT_ENTRY_ENGINE_ID_MASK,
    FAULT_ENTRY_INST_APERTURE_MASK, FAULT_ENTRY_INST_APERTURE_SHIFT, FAULT_INFO_ACCESS_TYPE_MASK,
    FAULT_INFO_ACCESS_TYPE_SHIFT, FAULT_INFO_CLIENT_MASK, FAULT_INFO_CLIENT_SHIFT,
    FAULT_INFO_CLIENT_TYPE_SHIFT, FAULT_INFO_GPC_ID_MASK, FAULT_INFO_GPC_ID_SHIFT,
    FAULT_INFO_PROTECTED, FAULT_INFO_REPLAYABLE, FAULT_INFO_REPLAYABLE_EN, FAULT_INFO_TYPE_MASK,
    FAULT_INFO_VALID, FAULT_TYPE_PTE, FAULT_TYPE_UNBOUND_INST_BLOCK, MMU_ENG_ID_CE0,
    MMU_INVALIDATE_REPLAY_CANCEL_GLOBAL, MMU_INVALIDATE_REPLAY_START_ACK_ALL,
    NISO_INTR_MMU_NONREPLAY_FAULT_NOTIFY, NISO_INTR_MMU_NONREPLAY_FAULT_OVERFLOW,
    NISO_INTR_MMU_OTHER_FAULT_NOTIFY, NISO_INTR_MMU_REPLAY_FAULT_NOTIFY,
    NISO_INTR_MMU_REPLAY_FAULT_OVERFLOW,
};
use crate::mm::gmmu::MapError;
use crate::mm::mem::Mem;
use crate::util::{hi32_lo32_to_u64, poll_with_backoff, u64_hi32, u64_lo32};

bitflags::bitflags! {
    /// MMU fault status word. The dropped/overflow/corrupted bits are
    /// write-one-to-clear.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct FaultStatus: u32 {
        const DROPPED_BAR1_PHYS = 1 << 0;
        const DROPPED_BAR1_VIRT = 1 << 1;
        const DROPPED_BAR2_PHYS = 1 << 2;
        const DROPPED_BAR2_VIRT = 1 << 3;
        const DROPPED_IFB_PHYS = 1 << 4;
        const DROPPED_IFB_VIRT = 1 << 5;
        const DROPPED_OTHER_PHYS = 1 << 6;
        const DROPPED_OTHER_VIRT = 1 << 7;
        const REPLAYABLE = 1 << 8;
        const NON_REPLAYABLE = 1 << 9;
        const REPLAYABLE_ERROR = 1 << 10;
        const NON_REPLAYABLE_ERROR = 1 << 11;
        const REPLAYABLE_OVERFLOW = 1 << 12;
        const NON_REPLAYABLE_OVERFLOW = 1 << 13;
        const REPLAYABLE_GETPTR_CORRUPTED = 1 << 14;
        const NON_REPLAYABLE_GETPTR_CORRUPTED = 1 << 15;
        const BUSY = 1 << 30;
        const VALID = 1 << 31;
    }
}

impl FaultStatus {
    pub const DROPPED_MASK: FaultStatus = FaultStatus::DROPPED_BAR1_PHYS
        .union(FaultStatus::DROPPED_BAR1_VIRT)
        .union(FaultStatus::DROPPED_BAR2_PHYS)
        .union(FaultStatus::DROPPED_BAR2_VIRT)
        .union(FaultStatus::DROPPED_IFB_PHYS)
        .union(FaultStatus::DROPPED_IFB_VIRT)
        .union(FaultStatus::DROPPED_OTHER_PHYS)
        .union(FaultStatus::DROPPED_OTHER_VIRT);
}

/// Hardware fault-buffer index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultBufIndex {
    NonReplay = 0,
    Replay = 1,
}

impl FaultBufIndex {
    pub const COUNT: usize = 2;

    pub fn index(self) -> usize {
        self as usize
    }

    fn overflow_bit(self) -> FaultStatus {
        match self {
            FaultBufIndex::NonReplay => FaultStatus::NON_REPLAYABLE_OVERFLOW,
            FaultBufIndex::Replay => FaultStatus::REPLAYABLE_OVERFLOW,
        }
    }

    fn getptr_corrupted_bit(self) -> FaultStatus {
        match self {
            FaultBufIndex::NonReplay => FaultStatus::NON_REPLAYABLE_GETPTR_CORRUPTED,
            FaultBufIndex::Replay => FaultStatus::REPLAYABLE_GETPTR_CORRUPTED,
        }
    }
}

/// Desired hardware state for a fault buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultBufState {
    Enabled,
    Disabled,
}

/// Fault-delivery state: the GPU-written rings and the two reusable
/// decode slots. Guarded by the MM state's fault mutex, which also
/// serializes fault delivery against buffer reconfiguration.
#[derive(Default)]
pub struct FaultState {
    pub hw_fault_buf: [Mem; FaultBufIndex::COUNT],
    pub fault_info: [FaultInfo; FaultBufIndex::COUNT],
}

/// Recovery scope identifier type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdType {
    Channel,
    Tsg,
    Unknown,
}

/// Recovery class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RcType {
    NoRc,
    MmuFault,
}

impl Gpu {
    fn fault_buffer_get_index(&self, index: FaultBufIndex) -> u32 {
        self.fb.read_mmu_fault_buffer_get(self, index.index()) & FAULT_BUFFER_GET_PTR_MASK
    }

    fn fault_buffer_put_index(&self, index: FaultBufIndex) -> u32 {
        self.fb.read_mmu_fault_buffer_put(self, index.index()) & FAULT_BUFFER_GET_PTR_MASK
    }

    pub fn fault_buffer_size_val(&self, index: FaultBufIndex) -> u32 {
        self.fb.read_mmu_fault_buffer_size(self, index.index()) & FAULT_BUFFER_SIZE_VAL_MASK
    }

    pub fn is_fault_buf_enabled(&self, index: FaultBufIndex) -> bool {
        self.fb.read_mmu_fault_buffer_size(self, index.index()) & FAULT_BUFFER_SIZE_ENABLE != 0
    }

    fn is_fault_buffer_empty(&self, index: FaultBufIndex, get: &mut u32) -> bool {
        *get = self.fault_buffer_get_index(index);
        *get == self.fault_buffer_put_index(index)
    }

    /// Ring-full predicate: one entry is sacrificed to distinguish full
    /// from empty.
    pub fn is_fault_buffer_full(&self, index: FaultBufIndex) -> bool {
        let get = self.fault_buffer_get_index(index);
        let put = self.fault_buffer_put_index(index);
        let entries = self.fault_buffer_size_val(index);
        entries != 0 && get == (put + 1) % entries
    }

    /// Publishes a new get pointer, clearing the overflow condition when
    /// it latched mid-handling. The fence keeps the pointer update ahead
    /// of the next entry's valid-bit read.
    fn fault_buffer_get_ptr_update(&self, index: FaultBufIndex, next: u32) {
        log::debug!("updating get index to {}", next);

        let mut reg = self.fb.read_mmu_fault_buffer_get(self, index.index());
        reg = (reg & !FAULT_BUFFER_GET_PTR_MASK) | (next & FAULT_BUFFER_GET_PTR_MASK);
        if reg & FAULT_BUFFER_GET_OVERFLOW != 0 {
            reg |= FAULT_BUFFER_GET_OVERFLOW;
        }
        self.fb.write_mmu_fault_buffer_get(self, index.index(), reg);

        fence(Ordering::SeqCst);
    }

    /// Enables or disables a fault buffer. Disabling waits for an
    /// in-flight hardware fault snapshot to finish, with doubling backoff.
    pub fn fault_buf_set_state_hw(&self, index: FaultBufIndex, state: FaultBufState) {
        let reg = self.fb.read_mmu_fault_buffer_size(self, index.index());

        match state {
            FaultBufState::Enabled => {
                if reg & FAULT_BUFFER_SIZE_ENABLE != 0 {
                    log::info!("fault buffer is already enabled");
                } else {
                    self.fb.write_mmu_fault_buffer_size(
                        self,
                        index.index(),
                        reg | FAULT_BUFFER_SIZE_ENABLE,
                    );
                }
            }
            FaultBufState::Disabled => {
                self.fb.write_mmu_fault_buffer_size(
                    self,
                    index.index(),
                    reg & !FAULT_BUFFER_SIZE_ENABLE,
                );

                let res = poll_with_backoff(self.config.poll_timeout, 10, 100, || {
                    !self.fb.read_mmu_fault_status(self).contains(FaultStatus::BUSY)
                });
                if res.is_err() {
                    log::error!("fault status busy set, disable timed out");
                }
            }
        }
    }

    fn fault_buf_configure_hw_locked(&self, st: &FaultState, index: FaultBufIndex) {
        self.fault_buf_set_state_hw(index, FaultBufState::Disabled);

        let gpu_va = st.hw_fault_buf[index.index()].gpu_va;
        self.fb.write_mmu_fault_buffer_lo_hi(
            self,
            index.index(),
            u64_lo32(gpu_va) & !0xfff,
            u64_hi32(gpu_va),
        );
        self.fb.write_mmu_fault_buffer_size(
            self,
            index.index(),
            (self.config.num_channels & FAULT_BUFFER_SIZE_VAL_MASK)
                | FAULT_BUFFER_SIZE_OVERFLOW_INTR_ENABLE,
        );

        self.fault_buf_set_state_hw(index, FaultBufState::Enabled);
    }

    /// Full (re)configuration of one fault buffer: disable, program base
    /// and size, re-enable.
    pub fn fault_buf_configure_hw(&self, index: FaultBufIndex) {
        let st = self.mm.fault.lock();
        self.fault_buf_configure_hw_locked(&st, index);
    }

    /// Allocates the GPU-written fault rings. One extra entry backs the
    /// full-vs-empty detection.
    pub fn mmu_fault_setup_sw(&self) {
        let mut st = self.mm.fault.lock();
        let fb_size = (self.config.num_channels as u64 + 1) * FAULT_BUF_ENTRY_SIZE as u64;

        let mut indexes = vec![FaultBufIndex::NonReplay];
        if self.config.replayable_faults {
            indexes.push(FaultBufIndex::Replay);
        }
        for index in indexes {
            if !st.hw_fault_buf[index.index()].is_valid() {
                let mut mem = self.dma_alloc_sys(fb_size);
                mem.gpu_va = mem.phys;
                st.hw_fault_buf[index.index()] = mem;
            }
        }
    }

    /// Points the hardware at the rings allocated by `mmu_fault_setup_sw`.
    pub fn mmu_fault_setup_hw(&self) {
        let st = self.mm.fault.lock();
        for index in [FaultBufIndex::NonReplay, FaultBufIndex::Replay] {
            if st.hw_fault_buf[index.index()].is_valid() {
                self.fault_buf_configure_hw_locked(&st, index);
            }
        }
    }

    /// Disables both fault buffers ahead of teardown or reset.
    pub fn mmu_fault_disable_hw(&self) {
        let _st = self.mm.fault.lock();
        for index in [FaultBufIndex::NonReplay, FaultBufIndex::Replay] {
            if self.is_fault_buf_enabled(index) {
                self.fault_buf_set_state_hw(index, FaultBufState::Disabled);
            }
        }
    }

    /// Releases the fault rings.
    pub fn mmu_fault_info_mem_destroy(&self) {
        let mut st = self.mm.fault.lock();
        for buf in &mut st.hw_fault_buf {
            if buf.is_valid() {
                buf.free();
            }
        }
    }

    fn copy_from_hw_fault_buf(&self, mem: &mut Mem, offset: u64, info: &mut FaultInfo) {
        info.reset();

        let inst_lo = self.mem_rd32(mem, offset + FAULT_BUF_W_INST_LO);
        let inst_hi = self.mem_rd32(mem, offset + FAULT_BUF_W_INST_HI);
        let inst_ptr = hi32_lo32_to_u64(inst_hi, inst_lo & !0xfff);

        // The reference is put back by whichever path consumes the fault.
        info.set_channel(self.channels.channel_from_inst_ptr(inst_ptr));
        info.inst_ptr = inst_ptr;
        info.inst_aperture =
            (inst_lo >> FAULT_ENTRY_INST_APERTURE_SHIFT) & FAULT_ENTRY_INST_APERTURE_MASK;

        let addr_lo = self.mem_rd32(mem, offset + FAULT_BUF_W_ADDR_LO);
        let addr_hi = self.mem_rd32(mem, offset + FAULT_BUF_W_ADDR_HI);
        info.fault_addr_aperture = addr_lo & FAULT_ENTRY_ADDR_APERTURE_MASK;
        info.fault_addr = hi32_lo32_to_u64(addr_hi, addr_lo & !0xfff);

        info.timestamp_lo = self.mem_rd32(mem, offset + FAULT_BUF_W_TIMESTAMP_LO);
        info.timestamp_hi = self.mem_rd32(mem, offset + FAULT_BUF_W_TIMESTAMP_HI);

        info.mmu_engine_id =
            self.mem_rd32(mem, offset + FAULT_BUF_W_ENGINE_ID) & FAULT_ENTRY_ENGINE_ID_MASK;
        let (eng, subid, pbdma) = self.config.engine_from_fault_id(info.mmu_engine_id);
        info.faulted_engine = eng;
        info.faulted_subid = subid;
        info.faulted_pbdma = pbdma;

        let word = self.mem_rd32(mem, offset + FAULT_BUF_W_INFO);
        info.fault_type = word & FAULT_INFO_TYPE_MASK;
        info.replayable_fault = word & FAULT_INFO_REPLAYABLE != 0;
        info.client_id = (word >> FAULT_INFO_CLIENT_SHIFT) & FAULT_INFO_CLIENT_MASK;
        info.access_type = (word >> FAULT_INFO_ACCESS_TYPE_SHIFT) & FAULT_INFO_ACCESS_TYPE_MASK;
        info.client_type = (word >> FAULT_INFO_CLIENT_TYPE_SHIFT) & 1;
        info.gpc_id = (word >> FAULT_INFO_GPC_ID_SHIFT) & FAULT_INFO_GPC_ID_MASK;
        info.protected_mode = word & FAULT_INFO_PROTECTED != 0;
        info.replay_fault_en = word & FAULT_INFO_REPLAYABLE_EN != 0;
        info.valid = word & FAULT_INFO_VALID != 0;

        // Retire the entry in memory so a stale valid bit cannot be
        // re-observed after the get pointer wraps.
        self.mem_wr32(mem, offset + FAULT_BUF_W_VALID, word & !FAULT_INFO_VALID);

        info.parse();
    }

    /// Decodes the snapshot registers holding the single most recent
    /// fault (BAR2/physical faults are never written to the rings).
    fn copy_from_fault_snap_reg(&self, fault_status: FaultStatus, info: &mut FaultInfo) {
        info.reset();

        if !fault_status.contains(FaultStatus::VALID) {
            log::debug!("mmu fault status valid not set");
            return;
        }

        let (inst_lo, inst_hi) = self.fb.read_mmu_fault_inst_lo_hi(self);
        let inst_ptr = hi32_lo32_to_u64(inst_hi, inst_lo & !0xfff);

        info.set_channel(self.channels.channel_from_inst_ptr(inst_ptr));
        info.inst_ptr = inst_ptr;
        info.inst_aperture =
            (inst_lo >> FAULT_ENTRY_INST_APERTURE_SHIFT) & FAULT_ENTRY_INST_APERTURE_MASK;
        info.mmu_engine_id = inst_lo & 0xff;

        let (eng, subid, pbdma) = self.config.engine_from_fault_id(info.mmu_engine_id);
        info.faulted_engine = eng;
        info.faulted_subid = subid;
        info.faulted_pbdma = pbdma;

        let (addr_lo, addr_hi) = self.fb.read_mmu_fault_addr_lo_hi(self);
        info.fault_addr_aperture = addr_lo & FAULT_ENTRY_ADDR_APERTURE_MASK;
        info.fault_addr = hi32_lo32_to_u64(addr_hi, addr_lo & !0xfff);

        let word = self.fb.read_mmu_fault_info(self);
        info.fault_type = word & FAULT_INFO_TYPE_MASK;
        info.replayable_fault = word & FAULT_INFO_REPLAYABLE != 0;
        info.client_id = (word >> FAULT_INFO_CLIENT_SHIFT) & FAULT_INFO_CLIENT_MASK;
        info.access_type = (word >> FAULT_INFO_ACCESS_TYPE_SHIFT) & FAULT_INFO_ACCESS_TYPE_MASK;
        info.client_type = (word >> FAULT_INFO_CLIENT_TYPE_SHIFT) & 1;
        info.gpc_id = (word >> FAULT_INFO_GPC_ID_SHIFT) & FAULT_INFO_GPC_ID_MASK;
        info.protected_mode = word & FAULT_INFO_PROTECTED != 0;
        info.replay_fault_en = word & FAULT_INFO_REPLAYABLE_EN != 0;
        info.valid = word & FAULT_INFO_VALID != 0;

        self.fb.write_mmu_fault_status(self, fault_status & !FaultStatus::VALID);

        info.parse();
    }

    /// Replayable-fault fix attempt. Refuses to touch an all-zero PTE
    /// (genuinely unmapped) or an already-valid one (the hardware likely
    /// retried successfully already); otherwise sets the valid bit, drops
    /// read-only, writes the PTE back and invalidates the TLB.
    pub(crate) fn fix_page_fault(&self, info: &FaultInfo) -> Result<(), MapError> {
        let Some(ch) = info.channel() else {
            log::debug!("no channel resolved for fault, cannot fix");
            return Err(MapError::InvalidArgs);
        };

        let mut pte = ch.vm.get_pte(self, info.fault_addr)?;
        log::debug!("pte: {:#010x} {:#010x}", pte[1], pte[0]);

        if pte == [0, 0] {
            log::debug!("pte all zeros, do not set valid");
            return Err(MapError::NotMapped);
        }
        if pte[0] & crate::hal::gp10b::PTE_VALID != 0 {
            log::debug!("pte valid already set");
            return Err(MapError::InvalidArgs);
        }

        pte[0] |= crate::hal::gp10b::PTE_VALID;
        pte[0] &= !crate::hal::gp10b::PTE_READ_ONLY;
        log::debug!("new pte: {:#010x} {:#010x}", pte[1], pte[0]);

        ch.vm.set_pte(self, info.fault_addr, &pte)?;

        // The GMMU must not keep using the old cached translation.
        self.fb
            .tlb_invalidate(self, ch.vm.pdb_phys(self))
            .map_err(|_| MapError::Timeout)
    }

    /// Issues the accumulated replay decision for one drain pass. Cancel
    /// wins over start-ack when both were requested.
    fn replay_or_cancel_faults(&self, invalidate_replay_val: u32) -> Result<(), MapError> {
        if invalidate_replay_val & MMU_INVALIDATE_REPLAY_CANCEL_GLOBAL != 0 {
            // Cancel so the access faults again as replayable and channel
            // recovery can run.
            self.fb
                .mmu_invalidate_replay(self, MMU_INVALIDATE_REPLAY_CANCEL_GLOBAL)
                .map_err(|_| MapError::Timeout)
        } else if invalidate_replay_val & MMU_INVALIDATE_REPLAY_START_ACK_ALL != 0 {
            // PTE valid is fixed; replay the faulting requests.
            self.fb
                .mmu_invalidate_replay(self, MMU_INVALIDATE_REPLAY_START_ACK_ALL)
                .map_err(|_| MapError::Timeout)
        } else {
            Ok(())
        }
    }

    /// Copy-engine faults are not reported as replayable but still get a
    /// fix attempt; success consumes the fault without recovery.
    fn handle_mmu_fault_ce(&self, info: &mut FaultInfo, invalidate_replay_val: &mut u32) -> bool {
        log::debug!("CE faulted");

        let fixed = self.fix_page_fault(info).is_ok();

        if let Some(ch) = info.channel() {
            self.channels.tsg_reset_faulted(self, ch, true, true);
        }

        if fixed {
            *invalidate_replay_val = 0;
            log::debug!("CE page fault fixed");
            let _ = info.take_channel();
            return true;
        }

        log::debug!("CE page fault not fixed");
        false
    }

    /// Returns true when the fault was already recovered through the MMU
    /// nack path and no further action is needed.
    fn handle_non_replayable(&self, info: &mut FaultInfo) -> bool {
        let mut id = crate::fault::info::INVALID_CHANNEL_ID;
        let mut id_type = IdType::Unknown;
        let mut rc_type = RcType::NoRc;
        let mut act_eng_bitmask = 0u32;

        if info.fault_type == FAULT_TYPE_UNBOUND_INST_BLOCK {
            // An unbound instance block cannot be isolated to a single
            // context; the whole runlist is recovered.
            rc_type = RcType::MmuFault;
        } else if let Some(ch) = info.channel().cloned() {
            if info.client_type == FAULT_CLIENT_TYPE_GPC {
                if ch.mmu_nack_handled.swap(false, Ordering::SeqCst) {
                    // Recovery already ran for this context via the nack
                    // interrupt; consume the fault and skip a second pass.
                    let _ = info.take_channel();
                    return true;
                }
                ch.mmu_nack_handled.store(true, Ordering::SeqCst);
            }

            match ch.tsgid {
                Some(tsgid) => {
                    id = tsgid;
                    id_type = IdType::Tsg;
                    rc_type = RcType::MmuFault;
                }
                None => {
                    log::error!("chid {} is referenceable but not bound to a tsg", ch.chid);
                    id = ch.chid;
                    id_type = IdType::Channel;
                    rc_type = RcType::NoRc;
                }
            }
        }

        if info.faulted_engine != INVALID_ENG_ID {
            act_eng_bitmask = 1 << info.faulted_engine;
            rc_type = RcType::MmuFault;
        }

        let _ = info.take_channel();

        if rc_type != RcType::NoRc {
            self.channels.recover(self, act_eng_bitmask, id, id_type, rc_type, info);
        }
        false
    }

    fn handle_replayable(&self, info: &mut FaultInfo, invalidate_replay_val: &mut u32) {
        if info.fault_type == FAULT_TYPE_PTE {
            log::debug!("invalid pte, try to fix");
            if self.fix_page_fault(info).is_ok() {
                *invalidate_replay_val |= MMU_INVALIDATE_REPLAY_START_ACK_ALL;
            } else {
                *invalidate_replay_val |= MMU_INVALIDATE_REPLAY_CANCEL_GLOBAL;
            }
        } else {
            // Faults other than invalid PTE are cancelled.
            *invalidate_replay_val |= MMU_INVALIDATE_REPLAY_CANCEL_GLOBAL;
        }

        let _ = info.take_channel();
    }

    fn handle_fault_common(&self, info: &mut FaultInfo, invalidate_replay_val: &mut u32) {
        if !info.valid {
            return;
        }

        info.dump();

        let num_lce = self.config.num_lce;
        if info.mmu_engine_id >= MMU_ENG_ID_CE0 && info.mmu_engine_id < MMU_ENG_ID_CE0 + num_lce {
            if self.handle_mmu_fault_ce(info, invalidate_replay_val) {
                return;
            }
        }

        if !info.replayable_fault {
            self.handle_non_replayable(info);
        } else {
            self.handle_replayable(info, invalidate_replay_val);
        }
    }

    fn handle_nonreplay_replay_fault_locked(
        &self,
        st: &mut FaultState,
        fault_status: FaultStatus,
        index: FaultBufIndex,
    ) {
        let mut get = 0;
        if self.is_fault_buffer_empty(index, &mut get) {
            log::debug!("spurious mmu fault: reg index {}", index.index());
            return;
        }
        log::debug!(
            "{} MMU FAULT, get ptr = {}",
            if index == FaultBufIndex::Replay { "REPLAY" } else { "NON-REPLAY" },
            get
        );

        let entries = self.fault_buffer_size_val(index);
        if entries == 0 {
            log::error!("fault buffer size reads zero entries");
            return;
        }

        let i = index.index();
        let mem = &mut st.hw_fault_buf[i];
        let info = &mut st.fault_info[i];

        let mut invalidate_replay_val = 0u32;
        let mut prev_fault_addr = 0u64;
        let mut next_fault_addr = 0u64;

        let mut offset = get as u64 * FAULT_BUF_ENTRY_WORDS as u64;
        let mut rd = self.mem_rd32(mem, offset + FAULT_BUF_W_VALID);

        while rd & FAULT_INFO_VALID != 0 {
            log::debug!("entry valid = {:#x}", rd);

            self.copy_from_hw_fault_buf(mem, offset, info);

            log::error!(
                "page fault notify: index {}, fault_status {:#x}",
                i,
                fault_status.bits()
            );

            get = (get + 1) % entries;
            self.fault_buffer_get_ptr_update(index, get);

            offset = get as u64 * FAULT_BUF_ENTRY_WORDS as u64;
            rd = self.mem_rd32(mem, offset + FAULT_BUF_W_VALID);

            if index == FaultBufIndex::Replay && info.fault_addr != 0 {
                // Replay can resubmit the identical address back-to-back;
                // re-processing it would loop without making progress.
                // Address zero is never fixed, so it is exempt from the
                // check.
                prev_fault_addr = next_fault_addr;
                next_fault_addr = info.fault_addr;
                if prev_fault_addr == next_fault_addr {
                    log::debug!("pte already scanned");
                    let _ = info.take_channel();
                    continue;
                }
            }

            self.handle_fault_common(info, &mut invalidate_replay_val);
        }

        if index == FaultBufIndex::Replay && invalidate_replay_val != 0 {
            if let Err(err) = self.replay_or_cancel_faults(invalidate_replay_val) {
                log::error!("replay or cancel faults failed: {err}");
            }
        }
    }

    fn handle_bar2_fault_locked(&self, st: &mut FaultState, fault_status: FaultStatus) {
        if fault_status.contains(FaultStatus::NON_REPLAYABLE_ERROR)
            && self.is_fault_buf_enabled(FaultBufIndex::NonReplay)
        {
            self.fault_buf_configure_hw_locked(st, FaultBufIndex::NonReplay);
        }
        if fault_status.contains(FaultStatus::REPLAYABLE_ERROR)
            && self.is_fault_buf_enabled(FaultBufIndex::Replay)
        {
            self.fault_buf_configure_hw_locked(st, FaultBufIndex::Replay);
        }

        self.channels.ce_mthd_buffer_fault_in_bar2(self);
        if self.channels.bar2_bind(self).is_err() {
            // Unrecoverable here; later operations surface it.
            log::error!("bar2 bind failed");
        }

        let _ = st.fault_info[FaultBufIndex::NonReplay.index()].take_channel();
    }

    fn handle_fault_overflow_locked(
        &self,
        st: &mut FaultState,
        fault_status: FaultStatus,
        index: FaultBufIndex,
    ) {
        let mut reg = self.fb.read_mmu_fault_buffer_get(self, index.index());

        if fault_status.contains(index.getptr_corrupted_bit()) {
            log::error!("fault buffer {} getptr corrupted", index.index());
            self.fault_buf_configure_hw_locked(st, index);
            reg |= FAULT_BUFFER_GET_GETPTR_CORRUPTED;
        }

        if fault_status.contains(index.overflow_bit()) {
            let full = self.is_fault_buffer_full(index);
            log::error!("fault buffer {} overflow: buffer full: {}", index.index(), full);
            reg |= FAULT_BUFFER_GET_OVERFLOW;
        }

        self.fb.write_mmu_fault_buffer_get(self, index.index(), reg);
    }

    /// Logs and clears exactly the dropped-fault status bits.
    fn handle_dropped_faults(&self, fault_status: FaultStatus) {
        let dropped = fault_status & FaultStatus::DROPPED_MASK;
        if !dropped.is_empty() {
            log::error!("dropped mmu fault ({:#010x})", dropped.bits());
            self.fb.write_mmu_fault_status(self, FaultStatus::DROPPED_MASK);
        }
    }

    fn handle_other_fault_notify_locked(&self, st: &mut FaultState, fault_status: FaultStatus) {
        {
            let info = &mut st.fault_info[FaultBufIndex::NonReplay.index()];
            self.copy_from_fault_snap_reg(fault_status, info);
        }

        match st.fault_info[FaultBufIndex::NonReplay.index()].engine_id_type {
            EngineIdType::Bar2 => {
                log::error!("BAR2 MMU FAULT");
                self.handle_bar2_fault_locked(st, fault_status);
            }
            EngineIdType::Physical => {
                // Usually VPR or out-of-bounds physical accesses.
                log::error!("PHYSICAL MMU FAULT");
            }
            EngineIdType::Other => {
                let mut invalidate_replay_val = 0u32;
                let info = &mut st.fault_info[FaultBufIndex::NonReplay.index()];
                self.handle_fault_common(info, &mut invalidate_replay_val);
                if invalidate_replay_val != 0 {
                    if let Err(err) = self.replay_or_cancel_faults(invalidate_replay_val) {
                        log::error!("replay or cancel faults failed: {err}");
                    }
                }
            }
        }
    }

    /// Top-level MMU fault handler, entered from the master-control ISR
    /// with the FB non-ISO interrupt word.
    pub fn handle_mmu_fault(&self, niso_intr: u32) {
        let fault_status = self.fb.read_mmu_fault_status(self);
        log::debug!("mmu_fault_status = {:#010x}", fault_status.bits());

        let mut st = self.mm.fault.lock();

        if niso_intr & NISO_INTR_MMU_OTHER_FAULT_NOTIFY != 0 {
            log::error!("other fault notify, fault_status {:#x}", fault_status.bits());
            self.handle_dropped_faults(fault_status);
            self.handle_other_fault_notify_locked(&mut st, fault_status);
        }

        if self.is_fault_buf_enabled(FaultBufIndex::NonReplay) {
            if niso_intr & NISO_INTR_MMU_NONREPLAY_FAULT_NOTIFY != 0 {
                // Once every fault is processed GET catches up with PUT
                // and the hardware drops the status bit on its own.
                self.handle_nonreplay_replay_fault_locked(
                    &mut st,
                    fault_status,
                    FaultBufIndex::NonReplay,
                );
            }
            if niso_intr & NISO_INTR_MMU_NONREPLAY_FAULT_OVERFLOW != 0 {
                log::error!("non-replayable fault overflow, fault_status {:#x}", fault_status.bits());
                self.handle_fault_overflow_locked(&mut st, fault_status, FaultBufIndex::NonReplay);
            }
        }

        if self.is_fault_buf_enabled(FaultBufIndex::Replay) {
            if niso_intr & NISO_INTR_MMU_REPLAY_FAULT_NOTIFY != 0 {
                self.handle_nonreplay_replay_fault_locked(
                    &mut st,
                    fault_status,
                    FaultBufIndex::Replay,
                );
            }
            if niso_intr & NISO_INTR_MMU_REPLAY_FAULT_OVERFLOW != 0 {
                log::error!("replayable fault overflow, fault_status {:#x}", fault_status.bits());
                self.handle_fault_overflow_locked(&mut st, fault_status, FaultBufIndex::Replay);
            }
        }

        log::debug!("clear mmu fault status");
        self.fb.write_mmu_fault_status(self, FaultStatus::VALID);
    }
}
