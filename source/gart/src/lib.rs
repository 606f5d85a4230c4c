// Copyright 2026 Gart Contributors
// SPDX-License-Identifier: Apache-2.0

//! GPU driver core: GMMU page-table management, MMU fault handling and
//! clock arbitration.
//!
//! The crate models one GPU instance as an explicit [`device::Gpu`] context
//! object. Chip-specific register layouts and bit encodings live behind the
//! per-subsystem ops in [`hal`]; everything reaches the device through the
//! [`gart_hal::Bus`] register seam, so the whole core runs against an
//! in-memory register file in tests.
//!
//! Subsystems:
//! - [`mm`]: memory descriptors, scatter-gather tables, the page-directory
//!   cache and the multi-level GMMU map/unmap engine.
//! - [`fault`]: hardware fault-buffer ring parsing, fault classification
//!   and the replay-or-cancel recovery protocol.
//! - [`intr`]: master-control interrupt decode and dispatch.
//! - [`clk`]: the work-queue-driven clock arbiter.

pub mod clk;
pub mod device;
pub mod fault;
pub mod hal;
pub mod intr;
pub mod mm;
pub mod util;

pub use device::{ChannelOps, ChipId, Gpu, GpuBuilder, IntrHandlers};
pub use gart_hal::Bus;
