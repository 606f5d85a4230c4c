// Copyright 2026 Gart Contributors
// SPDX-License-Identifier: Apache-2.0

//! tu104-class two-level interrupt tree: TOP registers select 32-bit
//! subtree LEAF registers, LEAF registers select individual vectors.
//!
//! The subtree/leaf/bit arithmetic lives in [`crate::intr::tree`]; vector
//! numbering is fixed by the chip, so those relationships are load-bearing.

use crate::device::Gpu;
use crate::intr::tree::{
    subtree_to_leaf_reg0, subtree_to_top_bit, subtree_to_top_idx, vector_to_leaf_bit,
    vector_to_leaf_reg, vector_to_subtree,
};

const FUNC_CPU_INTR_TOP: u32 = 0x0062_1000;
const FUNC_CPU_INTR_TOP_EN_SET: u32 = 0x0062_1100;
const FUNC_CPU_INTR_TOP_EN_CLEAR: u32 = 0x0062_1200;
const FUNC_CPU_INTR_LEAF: u32 = 0x0062_2000;
const FUNC_CPU_INTR_LEAF_EN_SET: u32 = 0x0062_2100;
const FUNC_CPU_INTR_LEAF_EN_CLEAR: u32 = 0x0062_2200;

/// Subtree carrying the legacy engine non-stall vectors.
pub const INTR_TOP_NONSTALL_SUBTREE: u32 = 1;

pub fn top_r(i: u32) -> u32 {
    FUNC_CPU_INTR_TOP + 4 * i
}

pub fn top_en_set_r(i: u32) -> u32 {
    FUNC_CPU_INTR_TOP_EN_SET + 4 * i
}

pub fn top_en_clear_r(i: u32) -> u32 {
    FUNC_CPU_INTR_TOP_EN_CLEAR + 4 * i
}

pub fn leaf_r(i: u32) -> u32 {
    FUNC_CPU_INTR_LEAF + 4 * i
}

pub fn leaf_en_set_r(i: u32) -> u32 {
    FUNC_CPU_INTR_LEAF_EN_SET + 4 * i
}

pub fn leaf_en_clear_r(i: u32) -> u32 {
    FUNC_CPU_INTR_LEAF_EN_CLEAR + 4 * i
}

/// Sets `leaf_bit` in the LEAF_EN_SET(`leaf_reg`) register.
pub fn leaf_en_set(g: &Gpu, leaf_reg: u32, leaf_bit: u32) {
    let r = leaf_en_set_r(leaf_reg);
    let val = g.bus.read32(r) | (1 << leaf_bit);
    g.bus.write32(r, val);
}

/// Sets `leaf_bit` in the LEAF_EN_CLEAR(`leaf_reg`) register.
pub fn leaf_en_clear(g: &Gpu, leaf_reg: u32, leaf_bit: u32) {
    let r = leaf_en_clear_r(leaf_reg);
    let val = g.bus.read32(r) | (1 << leaf_bit);
    g.bus.write32(r, val);
}

fn leaf_clear(g: &Gpu, leaf_reg: u32, leaf_bit: u32) {
    g.bus.write32(leaf_r(leaf_reg), 1 << leaf_bit);
}

/// Sets `top_bit` in the TOP_EN_SET(`top_idx`) register.
pub fn top_en_set(g: &Gpu, top_idx: u32, top_bit: u32) {
    let r = top_en_set_r(top_idx);
    let val = g.bus.read32(r) | (1 << top_bit);
    g.bus.write32(r, val);
}

/// Enables `vector` in both its LEAF and TOP registers.
pub fn vector_en_set(g: &Gpu, vector: u32) {
    leaf_en_set(g, vector_to_leaf_reg(vector), vector_to_leaf_bit(vector));

    let subtree = vector_to_subtree(vector);
    top_en_set(g, subtree_to_top_idx(subtree), subtree_to_top_bit(subtree));
}

/// Disables `vector` in its LEAF register.
pub fn vector_en_clear(g: &Gpu, vector: u32) {
    leaf_en_clear(g, vector_to_leaf_reg(vector), vector_to_leaf_bit(vector));
}

/// Acknowledges `vector` in its LEAF register.
pub fn clear_leaf_vector(g: &Gpu, vector: u32) {
    leaf_clear(g, vector_to_leaf_reg(vector), vector_to_leaf_bit(vector));
}

/// True when `vector`'s LEAF bit is pending.
pub fn vector_intr_pending(g: &Gpu, vector: u32) -> bool {
    let leaf = g.bus.read32(leaf_r(vector_to_leaf_reg(vector)));
    leaf & (1 << vector_to_leaf_bit(vector)) != 0
}

/// Pauses the non-stall subtree.
pub fn nonstall_pause(g: &Gpu) {
    let s = INTR_TOP_NONSTALL_SUBTREE;
    g.bus.write32(top_en_clear_r(subtree_to_top_idx(s)), 1 << subtree_to_top_bit(s));
}

/// Resumes the non-stall subtree.
pub fn nonstall_resume(g: &Gpu) {
    let s = INTR_TOP_NONSTALL_SUBTREE;
    g.bus.write32(top_en_set_r(subtree_to_top_idx(s)), 1 << subtree_to_top_bit(s));
}

/// Non-zero when the non-stall subtree has something pending.
pub fn nonstall_pending(g: &Gpu) -> u32 {
    let s = INTR_TOP_NONSTALL_SUBTREE;
    g.bus.read32(top_r(subtree_to_top_idx(s))) & (1 << subtree_to_top_bit(s))
}

/// Handles and clears engine non-stall vectors; returns the ops bitmask
/// the caller should run (semaphore wakeup, event post).
pub fn isr_nonstall(g: &Gpu) -> u32 {
    let s = INTR_TOP_NONSTALL_SUBTREE;
    let leaf0 = g.bus.read32(leaf_r(subtree_to_leaf_reg0(s)));
    let mut ops = 0;

    for dev in &g.config.engines {
        let bit = dev.intr_id;
        if leaf0 & (1 << bit) != 0 {
            log::debug!("nonstall intr from engine {}", dev.engine_id);
            g.bus.write32(leaf_r(subtree_to_leaf_reg0(s)), 1 << bit);
            ops |= crate::intr::NONSTALL_OPS_WAKEUP_SEMAPHORE
                | crate::intr::NONSTALL_OPS_POST_EVENTS;
        }
    }
    ops
}
