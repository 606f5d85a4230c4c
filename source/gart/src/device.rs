// Copyright 2026 Gart Contributors
// SPDX-License-Identifier: Apache-2.0

//! The per-GPU context object.
//!
//! One [`Gpu`] is constructed per device instance and passed by reference
//! into every subsystem call; there is no process-wide state, so multiple
//! GPUs coexist as independent contexts. Chip-specific ops are composed
//! exactly once, by the [`ChipId`] switch in [`GpuBuilder::build`].

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;

use gart_hal::Bus;

use crate::clk::ClkArb;
use crate::fault::buffer::{FaultState, IdType, RcType};
use crate::fault::info::{FaultInfo, INVALID_ENG_ID};
use crate::hal::gv11b::Gv11bFb;
use crate::hal::FbOps;
use crate::intr::McCaps;
use crate::mm::gmmu::{MapError, MmuLevel, Vm};
use crate::mm::pd_cache::PdCache;
use crate::mm::PAGE_SIZE;

/// Supported chip generations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipId {
    Gv11b,
    Tu104,
}

impl ChipId {
    fn mc_caps(self) -> McCaps {
        match self {
            ChipId::Gv11b => McCaps { has_nvlink: false, has_fbpa: false, two_level_tree: false },
            ChipId::Tu104 => McCaps { has_nvlink: true, has_fbpa: true, two_level_tree: true },
        }
    }

    fn fb_ops(self) -> Box<dyn FbOps> {
        match self {
            // tu104 carries the gv11b fault-buffer block unchanged.
            ChipId::Gv11b | ChipId::Tu104 => Box::new(Gv11bFb),
        }
    }

    fn mmu_levels(self) -> &'static [MmuLevel] {
        match self {
            ChipId::Gv11b | ChipId::Tu104 => &crate::hal::gp10b::MMU_LEVELS,
        }
    }
}

/// One engine as seen by interrupt dispatch and fault-id decode.
#[derive(Debug, Clone)]
pub struct EngineInfo {
    pub engine_id: u32,
    /// Bit index in the master-control interrupt word.
    pub intr_id: u32,
    /// First MMU fault id owned by this engine.
    pub fault_id: u32,
    /// Consecutive fault ids (sub-contexts) mapping onto this engine.
    pub num_subctx: u32,
    pub pbdma_id: u32,
    pub is_ce: bool,
}

/// Static per-device configuration resolved at probe time.
#[derive(Debug, Clone)]
pub struct GpuConfig {
    pub num_channels: u32,
    pub poll_timeout: Duration,
    pub iommu_enabled: bool,
    pub iommu_bit: u32,
    /// False on iGPUs that treat SoC DRAM as vidmem.
    pub honors_aperture: bool,
    /// First physical address of device-local memory; zero when absent.
    pub vidmem_base: u64,
    pub replayable_faults: bool,
    pub num_lce: u32,
    pub num_ltc: u32,
    pub num_fbpa: u32,
    pub engines: Vec<EngineInfo>,
}

impl Default for GpuConfig {
    fn default() -> GpuConfig {
        GpuConfig {
            num_channels: 512,
            poll_timeout: Duration::from_millis(100),
            iommu_enabled: false,
            iommu_bit: 34,
            honors_aperture: true,
            vidmem_base: 0,
            replayable_faults: true,
            num_lce: 2,
            num_ltc: 2,
            num_fbpa: 1,
            engines: Vec::new(),
        }
    }
}

impl GpuConfig {
    /// Decodes a packed MMU fault id into (engine, sub-context, pbdma);
    /// unknown ids yield the invalid sentinels.
    pub fn engine_from_fault_id(&self, fault_id: u32) -> (u32, u32, u32) {
        for e in &self.engines {
            let span = e.num_subctx.max(1);
            if fault_id >= e.fault_id && fault_id < e.fault_id + span {
                return (e.engine_id, fault_id - e.fault_id, e.pbdma_id);
            }
        }
        (INVALID_ENG_ID, INVALID_ENG_ID, INVALID_ENG_ID)
    }
}

/// One channel, as far as fault handling is concerned. Real channel
/// lifetime management lives with the embedder; faults hold an `Arc` and
/// consume it exactly once.
pub struct Channel {
    pub chid: u32,
    pub tsgid: Option<u32>,
    pub vm: Arc<Vm>,
    /// Dedup handshake between the MMU-nack and fault delivery paths.
    /// Only mutated under the fault mutex's serialization of delivery.
    pub(crate) mmu_nack_handled: AtomicBool,
}

impl Channel {
    pub fn new(chid: u32, tsgid: Option<u32>, vm: Arc<Vm>) -> Channel {
        Channel { chid, tsgid, vm, mmu_nack_handled: AtomicBool::new(false) }
    }

    /// Marks nack-path recovery done so a following fault-path delivery
    /// for the same context is skipped.
    pub fn set_mmu_nack_handled(&self) {
        self.mmu_nack_handled.store(true, Ordering::SeqCst);
    }
}

/// Channel resolution and recovery collaborator. Recovery itself
/// (isolating the errant context, resetting engines) is outside this
/// core; it is invoked with an explicit scope.
pub trait ChannelOps: Send + Sync {
    /// Resolves an instance-block pointer to a live channel reference.
    fn channel_from_inst_ptr(&self, inst_ptr: u64) -> Option<Arc<Channel>>;

    /// Runs recovery for the given scope.
    fn recover(
        &self,
        g: &Gpu,
        act_eng_bitmask: u32,
        id: u32,
        id_type: IdType,
        rc_type: RcType,
        info: &FaultInfo,
    );

    /// Clears the faulted-engine/PBDMA state of the channel's TSG.
    fn tsg_reset_faulted(&self, _g: &Gpu, _ch: &Channel, _eng: bool, _pbdma: bool) {}

    /// CE method-buffer recovery hook for BAR2 faults.
    fn ce_mthd_buffer_fault_in_bar2(&self, _g: &Gpu) {}

    /// Re-binds BAR2 after a BAR2 fault.
    fn bar2_bind(&self, _g: &Gpu) -> Result<(), MapError> {
        Ok(())
    }
}

/// Per-unit interrupt handlers outside this core (bus, priv ring, FIFO,
/// PMU, LTC, engine stall handling). Defaults are no-ops.
pub trait IntrHandlers: Send + Sync {
    fn bus_isr(&self, _g: &Gpu) {}
    fn priv_ring_isr(&self, _g: &Gpu) {}
    fn fifo_isr(&self, _g: &Gpu) {}
    fn pmu_isr(&self, _g: &Gpu) {}
    fn ltc_isr(&self, _g: &Gpu, _ltc: u32) {}
    fn engine_isr(&self, _g: &Gpu, _engine_id: u32) {}
    fn nvlink_isr(&self, _g: &Gpu) {}
    fn fbpa_isr(&self, _g: &Gpu, _fbpa: u32) {}
}

struct NullChannels;

impl ChannelOps for NullChannels {
    fn channel_from_inst_ptr(&self, _inst_ptr: u64) -> Option<Arc<Channel>> {
        None
    }

    fn recover(
        &self,
        _g: &Gpu,
        act_eng_bitmask: u32,
        id: u32,
        id_type: IdType,
        _rc_type: RcType,
        _info: &FaultInfo,
    ) {
        log::error!(
            "no recovery handler installed (engines {:#x}, id {} {:?})",
            act_eng_bitmask,
            id,
            id_type
        );
    }
}

struct NullIntrHandlers;

impl IntrHandlers for NullIntrHandlers {}

/// MM-side mutable state of one GPU.
pub(crate) struct MmState {
    pub(crate) fault: Mutex<FaultState>,
    /// Serializes TLB invalidates (one invalidate FIFO per chip).
    pub(crate) tlb_lock: Mutex<()>,
    pub(crate) pd_cache: Mutex<PdCache>,
}

/// One GPU instance.
pub struct Gpu {
    pub chip: ChipId,
    pub(crate) bus: Arc<dyn Bus>,
    pub(crate) fb: Box<dyn FbOps>,
    pub(crate) channels: Arc<dyn ChannelOps>,
    pub(crate) intr_hooks: Arc<dyn IntrHandlers>,
    pub(crate) config: GpuConfig,
    pub(crate) mm: MmState,
    pub(crate) mc_caps: McCaps,
    pub(crate) mc_restore: [AtomicU32; 2],
    clk_arb: OnceLock<Arc<ClkArb>>,
    phys_next: AtomicU64,
}

impl Gpu {
    pub fn config(&self) -> &GpuConfig {
        &self.config
    }

    pub fn mmu_levels(&self) -> &'static [MmuLevel] {
        self.chip.mmu_levels()
    }

    /// Creates an address space over this chip's level table with a 64 KiB
    /// big-page size.
    pub fn create_vm(&self, name: &str) -> Result<Arc<Vm>, MapError> {
        let vm = Vm::new(self, name, self.mmu_levels(), 64 * 1024, PAGE_SIZE, 1 << 40)?;
        Ok(Arc::new(vm))
    }

    /// Attaches the clock arbiter built for this device. One-shot.
    pub fn set_clk_arb(&self, arb: Arc<ClkArb>) {
        if self.clk_arb.set(arb).is_err() {
            log::warn!("clk arb already attached");
        }
    }

    pub fn clk_arb(&self) -> Option<&Arc<ClkArb>> {
        self.clk_arb.get()
    }

    /// Bump allocation of bus addresses for sysmem backings.
    pub(crate) fn alloc_phys(&self, size: u64) -> u64 {
        self.phys_next.fetch_add(size.next_multiple_of(PAGE_SIZE), Ordering::Relaxed)
    }
}

/// Assembles a [`Gpu`] from the chip selection and the platform pieces.
pub struct GpuBuilder {
    chip: ChipId,
    bus: Arc<dyn Bus>,
    config: GpuConfig,
    channels: Arc<dyn ChannelOps>,
    intr_hooks: Arc<dyn IntrHandlers>,
}

impl GpuBuilder {
    pub fn new(chip: ChipId, bus: Arc<dyn Bus>) -> GpuBuilder {
        GpuBuilder {
            chip,
            bus,
            config: GpuConfig::default(),
            channels: Arc::new(NullChannels),
            intr_hooks: Arc::new(NullIntrHandlers),
        }
    }

    pub fn config(mut self, config: GpuConfig) -> GpuBuilder {
        self.config = config;
        self
    }

    pub fn channels(mut self, channels: Arc<dyn ChannelOps>) -> GpuBuilder {
        self.channels = channels;
        self
    }

    pub fn intr_hooks(mut self, hooks: Arc<dyn IntrHandlers>) -> GpuBuilder {
        self.intr_hooks = hooks;
        self
    }

    pub fn build(self) -> Gpu {
        Gpu {
            chip: self.chip,
            bus: self.bus,
            fb: self.chip.fb_ops(),
            channels: self.channels,
            intr_hooks: self.intr_hooks,
            config: self.config,
            mm: MmState {
                fault: Mutex::new(FaultState::default()),
                tlb_lock: Mutex::new(()),
                pd_cache: Mutex::new(PdCache::new()),
            },
            mc_caps: self.chip.mc_caps(),
            mc_restore: [AtomicU32::new(0), AtomicU32::new(0)],
            clk_arb: OnceLock::new(),
            phys_next: AtomicU64::new(0x1000_0000),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::HashMap;
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::hal::gv11b::{MMU_CTRL, MMU_CTRL_PRI_FIFO_EMPTY};

    /// In-memory register file standing in for the device.
    #[derive(Clone, Default)]
    pub struct RegFile {
        regs: Arc<Mutex<HashMap<u32, u32>>>,
    }

    impl RegFile {
        pub fn new() -> RegFile {
            RegFile::default()
        }

        pub fn read(&self, addr: u32) -> u32 {
            *self.regs.lock().get(&addr).unwrap_or(&0)
        }

        pub fn write(&self, addr: u32, value: u32) {
            self.regs.lock().insert(addr, value);
        }
    }

    impl Bus for RegFile {
        fn read32(&self, addr: u32) -> u32 {
            self.read(addr)
        }

        fn write32(&self, addr: u32, value: u32) {
            self.write(addr, value);
        }
    }

    pub fn test_gpu_on(regs: RegFile) -> Gpu {
        // Make TLB invalidates succeed against the bare register file.
        regs.write(MMU_CTRL, MMU_CTRL_PRI_FIFO_EMPTY);
        GpuBuilder::new(ChipId::Gv11b, Arc::new(regs)).build()
    }

    pub fn test_gpu() -> Gpu {
        test_gpu_on(RegFile::new())
    }

    pub fn test_channel(chid: u32) -> Arc<Channel> {
        let g = test_gpu();
        let vm = g.create_vm("test").unwrap();
        Arc::new(Channel::new(chid, Some(chid), vm))
    }
}
