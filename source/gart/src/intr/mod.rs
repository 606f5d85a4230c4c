// Copyright 2026 Gart Contributors
// SPDX-License-Identifier: Apache-2.0

//! Master-control interrupt decode and dispatch.
//!
//! The stall ISR runs a fixed priority order: primary units (bus, priv
//! ring), then the active engines, then secondary-0 (HUB/MMU, FIFO, PMU)
//! and secondary-1 (LTC, and NVLINK/FB-partitions on dGPU-class chips).
//! Engine-context faults are resolved before HUB-level MMU fault handling
//! because the HUB path may depend on engine state having quiesced.

pub mod tree;

use std::sync::atomic::Ordering;

use crate::device::Gpu;
use crate::hal::gv11b::NISO_INTR_MMU_ANY;

/// Stalling interrupt register index.
pub const INTR_STALLING: usize = 0;
/// Non-stalling interrupt register index.
pub const INTR_NONSTALLING: usize = 1;

const MC_INTR_R: [u32; 2] = [0x100, 0x104];
const MC_INTR_EN_SET_R: [u32; 2] = [0x160, 0x164];
const MC_INTR_EN_CLEAR_R: [u32; 2] = [0x180, 0x184];

// Unit pending bits in the stall interrupt word.
const INTR_PFIFO: u32 = 1 << 8;
const INTR_HUB: u32 = 1 << 9;
const INTR_FBPA: u32 = 1 << 18;
const INTR_NVLINK: u32 = 1 << 21;
const INTR_PMU: u32 = 1 << 24;
const INTR_LTC: u32 = 1 << 25;
const INTR_PBUS: u32 = 1 << 28;
const INTR_PRIV_RING: u32 = 1 << 30;

pub const NONSTALL_OPS_WAKEUP_SEMAPHORE: u32 = 1 << 0;
pub const NONSTALL_OPS_POST_EVENTS: u32 = 1 << 1;

/// Logical interrupt units routed by master control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntrUnit {
    Bus,
    PrivRing,
    Fifo,
    Hub,
    Ltc,
    Gr,
    Pmu,
    Ce,
    Nvlink,
    Fbpa,
}

impl Gpu {
    /// Chip bit-field constant for a logical unit; unknown units log an
    /// error and match nothing.
    pub fn intr_pending_mask(&self, unit: IntrUnit) -> u32 {
        match unit {
            IntrUnit::Bus => INTR_PBUS,
            IntrUnit::PrivRing => INTR_PRIV_RING,
            IntrUnit::Fifo => INTR_PFIFO,
            IntrUnit::Hub => INTR_HUB,
            IntrUnit::Ltc => INTR_LTC,
            IntrUnit::Pmu => INTR_PMU,
            IntrUnit::Nvlink => {
                if self.mc_caps.has_nvlink {
                    INTR_NVLINK
                } else {
                    log::error!("nvlink interrupt unit on a chip without nvlink");
                    0
                }
            }
            IntrUnit::Fbpa => {
                if self.mc_caps.has_fbpa {
                    INTR_FBPA
                } else {
                    log::error!("fbpa interrupt unit on a chip without fb partitions");
                    0
                }
            }
            IntrUnit::Gr => self
                .config
                .engines
                .iter()
                .filter(|e| !e.is_ce)
                .fold(0, |m, e| m | 1 << e.intr_id),
            IntrUnit::Ce => self
                .config
                .engines
                .iter()
                .filter(|e| e.is_ce)
                .fold(0, |m, e| m | 1 << e.intr_id),
        }
    }

    /// Tests a raw interrupt word against a unit's pending mask.
    pub fn is_intr_pending(&self, unit: IntrUnit, raw: u32) -> bool {
        raw & self.intr_pending_mask(unit) != 0
    }

    /// Enables or disables one unit's stalling interrupt, keeping the
    /// shadow restore mask in sync so pause/resume round-trips exactly.
    pub fn intr_stall_unit_config(&self, unit: IntrUnit, enable: bool) {
        let mask = self.intr_pending_mask(unit);
        if enable {
            self.mc_restore[INTR_STALLING].fetch_or(mask, Ordering::SeqCst);
            self.bus.write32(MC_INTR_EN_SET_R[INTR_STALLING], mask);
        } else {
            self.mc_restore[INTR_STALLING].fetch_and(!mask, Ordering::SeqCst);
            self.bus.write32(MC_INTR_EN_CLEAR_R[INTR_STALLING], mask);
        }
    }

    /// Non-stalling analogue of `intr_stall_unit_config`.
    pub fn intr_nonstall_unit_config(&self, unit: IntrUnit, enable: bool) {
        let mask = self.intr_pending_mask(unit);
        if enable {
            self.mc_restore[INTR_NONSTALLING].fetch_or(mask, Ordering::SeqCst);
            self.bus.write32(MC_INTR_EN_SET_R[INTR_NONSTALLING], mask);
        } else {
            self.mc_restore[INTR_NONSTALLING].fetch_and(!mask, Ordering::SeqCst);
            self.bus.write32(MC_INTR_EN_CLEAR_R[INTR_NONSTALLING], mask);
        }
    }

    /// Masks all stalling interrupts without touching the restore mask.
    pub fn intr_stall_pause(&self) {
        self.bus.write32(MC_INTR_EN_CLEAR_R[INTR_STALLING], u32::MAX);
    }

    /// Re-enables exactly the set that was enabled before the pause.
    pub fn intr_stall_resume(&self) {
        let mask = self.mc_restore[INTR_STALLING].load(Ordering::SeqCst);
        self.bus.write32(MC_INTR_EN_SET_R[INTR_STALLING], mask);
    }

    pub fn intr_nonstall_pause(&self) {
        if self.mc_caps.two_level_tree {
            crate::hal::tu104::nonstall_pause(self);
        } else {
            self.bus.write32(MC_INTR_EN_CLEAR_R[INTR_NONSTALLING], u32::MAX);
        }
    }

    pub fn intr_nonstall_resume(&self) {
        if self.mc_caps.two_level_tree {
            crate::hal::tu104::nonstall_resume(self);
        } else {
            let mask = self.mc_restore[INTR_NONSTALLING].load(Ordering::SeqCst);
            self.bus.write32(MC_INTR_EN_SET_R[INTR_NONSTALLING], mask);
        }
    }

    /// Masks everything and clears both shadow masks (reset path).
    pub fn intr_mask_all(&self) {
        self.bus.write32(MC_INTR_EN_CLEAR_R[INTR_STALLING], u32::MAX);
        self.mc_restore[INTR_STALLING].store(0, Ordering::SeqCst);
        self.bus.write32(MC_INTR_EN_CLEAR_R[INTR_NONSTALLING], u32::MAX);
        self.mc_restore[INTR_NONSTALLING].store(0, Ordering::SeqCst);
    }

    /// Raw stalling interrupt word.
    pub fn intr_stall(&self) -> u32 {
        self.bus.read32(MC_INTR_R[INTR_STALLING])
    }

    /// HUB dispatch predicate: any MMU fault cause pending in the FB
    /// non-ISO word (the mc HUB summary bit alone can be stale across a
    /// buffer reconfigure).
    pub fn is_intr_hub_pending(&self, _mc_intr_0: u32) -> bool {
        self.fb.read_niso_intr(self) & NISO_INTR_MMU_ANY != 0
    }

    fn isr_stall_primary(&self, mc_intr_0: u32) {
        if mc_intr_0 & INTR_PBUS != 0 {
            self.intr_hooks.bus_isr(self);
        }
        if mc_intr_0 & INTR_PRIV_RING != 0 {
            self.intr_hooks.priv_ring_isr(self);
        }
    }

    fn isr_stall_secondary_0(&self, mc_intr_0: u32) {
        if self.is_intr_hub_pending(mc_intr_0) {
            let niso = self.fb.read_niso_intr(self);
            self.handle_mmu_fault(niso);
        }
        if mc_intr_0 & INTR_PFIFO != 0 {
            self.intr_hooks.fifo_isr(self);
        }
        if mc_intr_0 & INTR_PMU != 0 {
            self.intr_hooks.pmu_isr(self);
        }
    }

    fn isr_stall_secondary_1(&self, mc_intr_0: u32) {
        if mc_intr_0 & INTR_LTC != 0 {
            for ltc in 0..self.config.num_ltc {
                self.intr_hooks.ltc_isr(self, ltc);
            }
        }
        if self.mc_caps.has_nvlink && mc_intr_0 & INTR_NVLINK != 0 {
            self.intr_hooks.nvlink_isr(self);
        }
        if self.mc_caps.has_fbpa && mc_intr_0 & INTR_FBPA != 0 {
            for fbpa in 0..self.config.num_fbpa {
                self.intr_hooks.fbpa_isr(self, fbpa);
            }
        }
    }

    /// Stalling-interrupt service routine. The status word is read once
    /// and dispatched in the fixed priority order.
    pub fn isr_stall(&self) {
        let mc_intr_0 = self.intr_stall();
        log::debug!("stall intr {:#010x}", mc_intr_0);

        self.isr_stall_primary(mc_intr_0);

        for dev in &self.config.engines {
            if mc_intr_0 & (1 << dev.intr_id) == 0 {
                continue;
            }
            self.intr_hooks.engine_isr(self, dev.engine_id);
        }

        self.isr_stall_secondary_0(mc_intr_0);
        self.isr_stall_secondary_1(mc_intr_0);
        log::debug!("stall intr done {:#010x}", mc_intr_0);
    }

    /// Non-stall service routine; returns the deferred-ops bitmask.
    pub fn isr_nonstall(&self) -> u32 {
        if self.mc_caps.two_level_tree {
            crate::hal::tu104::isr_nonstall(self)
        } else {
            let raw = self.bus.read32(MC_INTR_R[INTR_NONSTALLING]);
            let mut ops = 0;
            for dev in &self.config.engines {
                if raw & (1 << dev.intr_id) != 0 {
                    ops |= NONSTALL_OPS_WAKEUP_SEMAPHORE | NONSTALL_OPS_POST_EVENTS;
                }
            }
            ops
        }
    }
}

/// Per-chip master-control capabilities.
#[derive(Debug, Clone, Copy, Default)]
pub struct McCaps {
    pub has_nvlink: bool,
    pub has_fbpa: bool,
    /// tu104-class TOP/LEAF vector tree for non-stall routing.
    pub two_level_tree: bool,
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::device::test_support::RegFile;
    use crate::device::{ChipId, EngineInfo, GpuBuilder, GpuConfig, IntrHandlers};

    #[derive(Default)]
    struct OrderRecorder {
        calls: Mutex<Vec<String>>,
    }

    impl OrderRecorder {
        fn push(&self, what: &str) {
            self.calls.lock().push(what.to_owned());
        }
    }

    impl IntrHandlers for OrderRecorder {
        fn bus_isr(&self, _g: &Gpu) {
            self.push("bus");
        }
        fn priv_ring_isr(&self, _g: &Gpu) {
            self.push("priv_ring");
        }
        fn fifo_isr(&self, _g: &Gpu) {
            self.push("fifo");
        }
        fn pmu_isr(&self, _g: &Gpu) {
            self.push("pmu");
        }
        fn ltc_isr(&self, _g: &Gpu, ltc: u32) {
            self.push(&format!("ltc{}", ltc));
        }
        fn engine_isr(&self, _g: &Gpu, engine_id: u32) {
            self.push(&format!("engine{}", engine_id));
        }
    }

    fn intr_config() -> GpuConfig {
        GpuConfig {
            num_ltc: 2,
            engines: vec![
                EngineInfo {
                    engine_id: 0,
                    intr_id: 12,
                    fault_id: 32,
                    num_subctx: 64,
                    pbdma_id: 0,
                    is_ce: false,
                },
                EngineInfo {
                    engine_id: 1,
                    intr_id: 13,
                    fault_id: 15,
                    num_subctx: 1,
                    pbdma_id: 1,
                    is_ce: true,
                },
            ],
            ..Default::default()
        }
    }

    fn intr_gpu(rec: Arc<OrderRecorder>) -> (Gpu, RegFile) {
        let regs = RegFile::new();
        let g = GpuBuilder::new(ChipId::Gv11b, Arc::new(regs.clone()))
            .config(intr_config())
            .intr_hooks(rec)
            .build();
        (g, regs)
    }

    #[test]
    fn stall_isr_dispatches_in_priority_order() {
        let rec = Arc::new(OrderRecorder::default());
        let (g, regs) = intr_gpu(Arc::clone(&rec));

        regs.write(
            MC_INTR_R[INTR_STALLING],
            INTR_PBUS | INTR_PRIV_RING | (1 << 12) | (1 << 13) | INTR_PFIFO | INTR_PMU | INTR_LTC,
        );

        g.isr_stall();

        let calls = rec.calls.lock();
        assert_eq!(
            *calls,
            vec!["bus", "priv_ring", "engine0", "engine1", "fifo", "pmu", "ltc0", "ltc1"]
        );
    }

    #[test]
    fn unrelated_bits_dispatch_nothing() {
        let rec = Arc::new(OrderRecorder::default());
        let (g, regs) = intr_gpu(Arc::clone(&rec));

        regs.write(MC_INTR_R[INTR_STALLING], 1 << 3);
        g.isr_stall();
        assert!(rec.calls.lock().is_empty());
    }

    #[test]
    fn pause_resume_restores_exactly_the_enabled_set() {
        let rec = Arc::new(OrderRecorder::default());
        let (g, regs) = intr_gpu(rec);

        g.intr_stall_unit_config(IntrUnit::Fifo, true);
        g.intr_stall_unit_config(IntrUnit::Pmu, true);
        g.intr_stall_unit_config(IntrUnit::Pmu, false);

        g.intr_stall_pause();
        assert_eq!(regs.read(MC_INTR_EN_CLEAR_R[INTR_STALLING]), u32::MAX);

        g.intr_stall_resume();
        // Only FIFO was still enabled at pause time.
        assert_eq!(regs.read(MC_INTR_EN_SET_R[INTR_STALLING]), INTR_PFIFO);
    }

    #[test]
    fn unit_masks_are_table_driven() {
        let rec = Arc::new(OrderRecorder::default());
        let (g, _regs) = intr_gpu(rec);

        assert_eq!(g.intr_pending_mask(IntrUnit::Bus), INTR_PBUS);
        assert_eq!(g.intr_pending_mask(IntrUnit::Gr), 1 << 12);
        assert_eq!(g.intr_pending_mask(IntrUnit::Ce), 1 << 13);
        // gv11b has no fb partition unit; the safe default matches nothing.
        assert_eq!(g.intr_pending_mask(IntrUnit::Fbpa), 0);
        assert!(g.is_intr_pending(IntrUnit::Bus, INTR_PBUS | 1));
        assert!(!g.is_intr_pending(IntrUnit::Ltc, INTR_PBUS));
    }

    #[test]
    fn mask_all_clears_shadow_masks() {
        let rec = Arc::new(OrderRecorder::default());
        let (g, regs) = intr_gpu(rec);

        g.intr_stall_unit_config(IntrUnit::Fifo, true);
        g.intr_mask_all();
        g.intr_stall_resume();
        assert_eq!(regs.read(MC_INTR_EN_SET_R[INTR_STALLING]), 0);
    }
}
