// Copyright 2026 Gart Contributors
// SPDX-License-Identifier: Apache-2.0

//! MMU fault subsystem: fault-record decode, hardware ring-buffer
//! management and the replay-or-cancel recovery protocol.

pub mod buffer;
pub mod info;

pub use buffer::{FaultBufIndex, FaultStatus};
pub use info::FaultInfo;
