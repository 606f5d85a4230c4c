// Copyright 2026 Gart Contributors
// SPDX-License-Identifier: Apache-2.0

//! Clock arbitration: merges competing per-session frequency requests
//! into a single hardware program-clocks call.

pub mod arb;
mod worker;

pub use arb::{
    ClkArb, ClkArbError, ClkArbOps, ClkDev, ClkDomain, ClkDomains, ClkSession, SlaveFreqs,
    ALARM_CLOCK_ARBITER_FAILED, ALARM_GPU_LOST, ALARM_LOCAL_TARGET_VF_NOT_POSSIBLE,
    ALARM_THERMAL_ABOVE_THRESHOLD, ALARM_VF_TABLE_UPDATE_FAILED, EVENT_VF_UPDATE,
};
