// Copyright 2026 Gart Contributors
// SPDX-License-Identifier: Apache-2.0

//! Decoded MMU fault records.
//!
//! A [`FaultInfo`] is transient: filled in from the snapshot registers or
//! one ring entry, consumed within the same ISR pass, and reused. The two
//! per-buffer-index slots in the device's MM state are the only instances
//! that outlive a single decode.

use std::sync::Arc;

use crate::device::Channel;
use crate::hal::gv11b::{
    FAULT_CLIENT_TYPE_GPC, FAULT_CLIENT_TYPE_HUB, MMU_ENG_ID_BAR2, MMU_ENG_ID_PHYSICAL,
};
use crate::util::hi32_lo32_to_u64;

pub const INVALID_CHANNEL_ID: u32 = u32::MAX;
pub const INVALID_ENG_ID: u32 = u32::MAX;

/// Classification of the faulting MMU engine id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EngineIdType {
    Bar2,
    Physical,
    #[default]
    Other,
}

const INVALID_DESC: &str = "invalid";

static FAULT_TYPE_DESCS: [&str; 16] = [
    "invalid pde",
    "invalid pde size",
    "invalid pte",
    "limit violation",
    "unbound inst block",
    "priv violation",
    "write",
    "read",
    "pitch mask violation",
    "work creation",
    "unsupported aperture",
    "compression failure",
    "unsupported kind",
    "region violation",
    "poison",
    "atomic",
];

static ACCESS_TYPE_DESCS: [&str; 12] = [
    "virt read",
    "virt write",
    "virt atomic strong",
    "virt prefetch",
    "virt atomic weak",
    "xxx",
    "xxx",
    "xxx",
    "phys read",
    "phys write",
    "phys atomic",
    "phys prefetch",
];

static CLIENT_TYPE_DESCS: [&str; 2] = ["gpc", "hub"];

static HUB_CLIENT_DESCS: [&str; 56] = [
    "vip", "ce0", "ce1", "dniso", "fe", "fecs", "host", "host cpu",
    "host cpu nb", "iso", "mmu", "nvdec", "nvenc1", "nvenc2",
    "niso", "p2p", "pd", "perf", "pmu", "raster twod", "scc",
    "scc nb", "sec", "ssync", "gr copy", "xv", "mmu nb",
    "nvenc", "d falcon", "sked", "a falcon", "hsce0", "hsce1",
    "hsce2", "hsce3", "hsce4", "hsce5", "hsce6", "hsce7", "hsce8",
    "hsce9", "hshub", "ptp x0", "ptp x1", "ptp x2", "ptp x3",
    "ptp x4", "ptp x5", "ptp x6", "ptp x7", "vpr scrubber0",
    "vpr scrubber1", "dwbif", "fbfalcon", "ce shim", "gsp",
];

static GPC_CLIENT_DESCS: [&str; 97] = [
    "t1 0", "t1 1", "t1 2", "t1 3",
    "t1 4", "t1 5", "t1 6", "t1 7",
    "pe 0", "pe 1", "pe 2", "pe 3",
    "pe 4", "pe 5", "pe 6", "pe 7",
    "rast", "gcc", "gpccs",
    "prop 0", "prop 1", "prop 2", "prop 3",
    "gpm",
    "ltp utlb 0", "ltp utlb 1", "ltp utlb 2", "ltp utlb 3",
    "ltp utlb 4", "ltp utlb 5", "ltp utlb 6", "ltp utlb 7",
    "utlb",
    "t1 8", "t1 9", "t1 10", "t1 11",
    "t1 12", "t1 13", "t1 14", "t1 15",
    "tpccs 0", "tpccs 1", "tpccs 2", "tpccs 3",
    "tpccs 4", "tpccs 5", "tpccs 6", "tpccs 7",
    "pe 8", "pe 9", "tpccs 8", "tpccs 9",
    "t1 16", "t1 17", "t1 18", "t1 19",
    "pe 10", "pe 11", "tpccs 10", "tpccs 11",
    "t1 20", "t1 21", "t1 22", "t1 23",
    "pe 12", "pe 13", "tpccs 12", "tpccs 13",
    "t1 24", "t1 25", "t1 26", "t1 27",
    "pe 14", "pe 15", "tpccs 14", "tpccs 15",
    "t1 28", "t1 29", "t1 30", "t1 31",
    "pe 16", "pe 17", "tpccs 16", "tpccs 17",
    "t1 32", "t1 33", "t1 34", "t1 35",
    "pe 18", "pe 19", "tpccs 18", "tpccs 19",
    "t1 36", "t1 37", "t1 38", "t1 39",
];

/// One decoded fault.
#[derive(Default)]
pub struct FaultInfo {
    pub valid: bool,
    pub chid: u32,
    channel: Option<Arc<Channel>>,
    pub inst_ptr: u64,
    pub inst_aperture: u32,
    pub fault_addr: u64,
    pub fault_addr_aperture: u32,
    pub timestamp_lo: u32,
    pub timestamp_hi: u32,
    pub mmu_engine_id: u32,
    pub engine_id_type: EngineIdType,
    pub faulted_engine: u32,
    pub faulted_subid: u32,
    pub faulted_pbdma: u32,
    pub fault_type: u32,
    pub fault_type_desc: &'static str,
    pub client_type: u32,
    pub client_type_desc: &'static str,
    pub client_id: u32,
    pub client_id_desc: &'static str,
    pub gpc_id: u32,
    pub access_type: u32,
    pub protected_mode: bool,
    pub replayable_fault: bool,
    pub replay_fault_en: bool,
}

impl FaultInfo {
    /// Clears the record for reuse, dropping any channel reference a
    /// previous pass failed to consume.
    pub fn reset(&mut self) {
        *self = FaultInfo {
            chid: INVALID_CHANNEL_ID,
            faulted_engine: INVALID_ENG_ID,
            faulted_subid: INVALID_ENG_ID,
            faulted_pbdma: INVALID_ENG_ID,
            ..Default::default()
        };
    }

    /// Installs the resolved channel back-reference.
    pub(crate) fn set_channel(&mut self, ch: Option<Arc<Channel>>) {
        self.chid = ch.as_ref().map_or(INVALID_CHANNEL_ID, |c| c.chid);
        self.channel = ch;
    }

    /// Borrows the faulting channel, if one was resolved.
    pub fn channel(&self) -> Option<&Arc<Channel>> {
        self.channel.as_ref()
    }

    /// Consumes the channel reference. Succeeds at most once per decoded
    /// fault; whichever path handles the fault must take it exactly once.
    pub fn take_channel(&mut self) -> Option<Arc<Channel>> {
        self.channel.take()
    }

    pub fn timestamp(&self) -> u64 {
        hi32_lo32_to_u64(self.timestamp_hi, self.timestamp_lo)
    }

    pub fn access_type_desc(&self) -> &'static str {
        desc_lookup(&ACCESS_TYPE_DESCS, self.access_type)
    }

    /// Classifies the engine id and fills the human-readable descriptor
    /// strings. Out-of-range indices are driver defects: logged, asserted
    /// in debug builds and substituted with a placeholder so diagnostics
    /// stay non-fatal.
    pub fn parse(&mut self) {
        self.engine_id_type = if self.mmu_engine_id == MMU_ENG_ID_BAR2 {
            EngineIdType::Bar2
        } else if self.mmu_engine_id == MMU_ENG_ID_PHYSICAL {
            EngineIdType::Physical
        } else {
            EngineIdType::Other
        };

        self.fault_type_desc = desc_lookup(&FAULT_TYPE_DESCS, self.fault_type);
        self.client_type_desc = desc_lookup(&CLIENT_TYPE_DESCS, self.client_type);

        self.client_id_desc = INVALID_DESC;
        if self.client_type == FAULT_CLIENT_TYPE_HUB {
            self.client_id_desc = desc_lookup(&HUB_CLIENT_DESCS, self.client_id);
        } else if self.client_type == FAULT_CLIENT_TYPE_GPC {
            self.client_id_desc = desc_lookup(&GPC_CLIENT_DESCS, self.client_id);
        }
    }

    pub(crate) fn dump(&self) {
        if !self.valid {
            return;
        }
        log::error!(
            "[MMU FAULT] mmu engine id: {}, ch id: {}, fault addr: {:#x}, \
             fault addr aperture: {}, fault type: {}, access type: {}",
            self.mmu_engine_id,
            self.chid,
            self.fault_addr,
            self.fault_addr_aperture,
            self.fault_type_desc,
            self.access_type_desc(),
        );
        log::error!(
            "[MMU FAULT] protected mode: {}, client type: {}, client id: {}, gpc id: {}",
            self.protected_mode,
            self.client_type_desc,
            self.client_id_desc,
            self.gpc_id,
        );
        log::debug!(
            "[MMU FAULT] inst ptr: {:#x}, replayable: {}, replay en: {}, \
             timestamp hi:lo {:#010x}:{:#010x}",
            self.inst_ptr,
            self.replayable_fault,
            self.replay_fault_en,
            self.timestamp_hi,
            self.timestamp_lo,
        );
    }
}

fn desc_lookup(table: &'static [&'static str], index: u32) -> &'static str {
    match table.get(index as usize) {
        Some(desc) => desc,
        None => {
            log::error!("fault descriptor index {} out of range", index);
            debug_assert!(false, "fault descriptor index out of range");
            INVALID_DESC
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_fills_descriptors() {
        let mut info = FaultInfo {
            fault_type: 2,
            client_type: FAULT_CLIENT_TYPE_HUB,
            client_id: 10,
            ..Default::default()
        };
        info.parse();
        assert_eq!(info.fault_type_desc, "invalid pte");
        assert_eq!(info.client_type_desc, "hub");
        assert_eq!(info.client_id_desc, "mmu");
        assert_eq!(info.engine_id_type, EngineIdType::Other);
    }

    #[test]
    fn bar2_engine_id_classified() {
        let mut info = FaultInfo { mmu_engine_id: MMU_ENG_ID_BAR2, ..Default::default() };
        info.parse();
        assert_eq!(info.engine_id_type, EngineIdType::Bar2);
    }

    #[test]
    #[cfg_attr(debug_assertions, ignore = "defect path asserts in debug builds")]
    fn out_of_range_client_substitutes_placeholder() {
        let mut info = FaultInfo {
            client_type: FAULT_CLIENT_TYPE_GPC,
            client_id: 200,
            ..Default::default()
        };
        info.parse();
        assert_eq!(info.client_id_desc, "invalid");
    }

    #[test]
    fn timestamp_combines_halves() {
        let info = FaultInfo {
            timestamp_lo: 0x9abc_def0,
            timestamp_hi: 0x1234_5678,
            ..Default::default()
        };
        assert_eq!(info.timestamp(), 0x1234_5678_9abc_def0);
    }

    #[test]
    fn channel_token_consumes_once() {
        let mut info = FaultInfo::default();
        info.set_channel(Some(crate::device::test_support::test_channel(7)));
        assert_eq!(info.chid, 7);
        assert!(info.take_channel().is_some());
        assert!(info.take_channel().is_none());
    }
}
