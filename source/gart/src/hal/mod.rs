// Copyright 2026 Gart Contributors
// SPDX-License-Identifier: Apache-2.0

//! Chip hardware-abstraction layer.
//!
//! One implementation per chip generation, selected once at startup by the
//! chip-ID switch in [`crate::device`]. Register offsets and bit encodings
//! stay inside these modules; the generic subsystems only see the ops
//! traits and the level tables.

pub mod gp10b;
pub mod gv11b;
pub mod tu104;

use crate::device::Gpu;
use crate::fault::buffer::FaultStatus;
use crate::util::PollTimeoutError;

/// Fault-buffer, fault-snapshot and TLB-maintenance register ops (the
/// `fb` HAL unit).
pub trait FbOps: Send + Sync {
    fn read_mmu_fault_buffer_get(&self, g: &Gpu, index: usize) -> u32;
    fn write_mmu_fault_buffer_get(&self, g: &Gpu, index: usize, v: u32);
    fn read_mmu_fault_buffer_put(&self, g: &Gpu, index: usize) -> u32;
    fn read_mmu_fault_buffer_size(&self, g: &Gpu, index: usize) -> u32;
    fn write_mmu_fault_buffer_size(&self, g: &Gpu, index: usize, v: u32);
    fn write_mmu_fault_buffer_lo_hi(&self, g: &Gpu, index: usize, lo: u32, hi: u32);
    fn read_mmu_fault_addr_lo_hi(&self, g: &Gpu) -> (u32, u32);
    fn read_mmu_fault_inst_lo_hi(&self, g: &Gpu) -> (u32, u32);
    fn read_mmu_fault_info(&self, g: &Gpu) -> u32;
    fn read_mmu_fault_status(&self, g: &Gpu) -> FaultStatus;
    fn write_mmu_fault_status(&self, g: &Gpu, v: FaultStatus);
    /// Raw FB non-ISO interrupt word routing MMU fault causes.
    fn read_niso_intr(&self, g: &Gpu) -> u32;
    /// Flushes cached translations for the address space rooted at
    /// `pdb_phys`. Bounded poll; a timeout leaves the written PTEs in
    /// place and is reported, never corrected.
    fn tlb_invalidate(&self, g: &Gpu, pdb_phys: u64) -> Result<(), PollTimeoutError>;
    fn l2_flush(&self, g: &Gpu, invalidate: bool) -> Result<(), PollTimeoutError>;
    /// Replay-start or cancel request for replayable faults, folded into a
    /// full TLB invalidate.
    fn mmu_invalidate_replay(&self, g: &Gpu, replay_val: u32) -> Result<(), PollTimeoutError>;
}
