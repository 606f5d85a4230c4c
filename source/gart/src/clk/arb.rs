// Copyright 2026 Gart Contributors
// SPDX-License-Identifier: Apache-2.0

//! The clock arbiter.
//!
//! Sessions post per-domain MHz targets; a background worker merges them
//! (most recent wins within a session, maximum across sessions), clamps
//! against the configured range and cap, resolves slave frequencies and
//! programs the hardware once per pass. Results publish through a
//! double-buffered "actual" state: new fields are written into the
//! non-current buffer, the current index swaps with release ordering, and
//! only then does the generation counter bump — that ordering is the only
//! synchronization readers get, so it must not be weakened.

use std::collections::VecDeque;
use std::sync::atomic::{fence, AtomicU16, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::clk::worker::{WorkItem, Worker};

pub const EVENT_VF_UPDATE: u32 = 1 << 0;
pub const ALARM_TARGET_VF_NOT_POSSIBLE: u32 = 1 << 1;
pub const ALARM_LOCAL_TARGET_VF_NOT_POSSIBLE: u32 = 1 << 2;
pub const ALARM_CLOCK_ARBITER_FAILED: u32 = 1 << 3;
pub const ALARM_VF_TABLE_UPDATE_FAILED: u32 = 1 << 4;
pub const ALARM_THERMAL_ABOVE_THRESHOLD: u32 = 1 << 5;
pub const ALARM_POWER_ABOVE_THRESHOLD: u32 = 1 << 6;
pub const ALARM_GPU_LOST: u32 = 1 << 7;

/// Alarms local to one device handle; never cleared through the global
/// exit-phase path.
const LOCAL_ALARM_MASK: u32 = ALARM_LOCAL_TARGET_VF_NOT_POSSIBLE | EVENT_VF_UPDATE;

pub const POLLIN: u32 = 1 << 0;
pub const POLLPRI: u32 = 1 << 1;
pub const POLLRDNORM: u32 = 1 << 2;
pub const POLLHUP: u32 = 1 << 3;

const DEFAULT_EVENT_NUMBER: usize = 32;
const INIT_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ClkArbError {
    #[error("clock arbitration not supported")]
    NotSupported,
    #[error("invalid clock domain")]
    InvalidDomain,
    #[error("unable to resolve slave frequencies")]
    SlaveFreq,
    #[error("unable to program clocks")]
    ProgramFailed,
    #[error("arbiter initialization timed out")]
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClkDomain {
    Gpc2Clk,
    MClk,
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ClkDomains: u32 {
        const GPC2CLK = 1 << 0;
        const MCLK = 1 << 1;
    }
}

/// One converged frequency request: the gpc target plus the coupled
/// clocks the chip derives from it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlaveFreqs {
    pub gpc_mhz: u16,
    pub sys_mhz: u16,
    pub xbar_mhz: u16,
    pub nvd_mhz: u16,
    pub host_mhz: u16,
    pub mclk_mhz: u16,
}

/// Chip-specific arbitration ops (gv100-class layout).
pub trait ClkArbOps: Send + Sync {
    fn check_support(&self) -> bool {
        true
    }
    fn domains(&self) -> ClkDomains;
    /// (min, max) MHz for one domain.
    fn clk_range(&self, domain: ClkDomain) -> Result<(u16, u16), ClkArbError>;
    fn clk_default(&self, domain: ClkDomain) -> Result<u16, ClkArbError>;
    /// Selectable frequency points for one domain.
    fn f_points(&self, domain: ClkDomain) -> Result<Vec<u16>, ClkArbError>;
    /// Resolves the coupled slave clocks for `vf.gpc_mhz`.
    fn find_slave_freqs(&self, vf: &mut SlaveFreqs) -> Result<(), ClkArbError>;
    /// Runs the hardware clock-change sequence.
    fn program_clocks(&self, vf: &SlaveFreqs) -> Result<(), ClkArbError>;
    /// Platform QoS clamp; identity when the platform has none.
    fn qos_clamp(&self, gpc2clk_mhz: u16) -> u16 {
        gpc2clk_mhz
    }
}

#[derive(Default)]
struct TargetCell {
    mclk: AtomicU16,
    gpc2clk: AtomicU16,
}

/// One user-space clock-control session.
pub struct ClkSession {
    zombie: std::sync::atomic::AtomicBool,
    target_pool: [TargetCell; 2],
    target_idx: AtomicUsize,
    /// Pending uncommitted requests, newest first.
    targets: Mutex<VecDeque<Arc<ClkDev>>>,
}

impl ClkSession {
    fn new() -> ClkSession {
        ClkSession {
            zombie: std::sync::atomic::AtomicBool::new(false),
            target_pool: Default::default(),
            target_idx: AtomicUsize::new(0),
            targets: Mutex::new(VecDeque::new()),
        }
    }

    fn committed(&self) -> &TargetCell {
        &self.target_pool[self.target_idx.load(Ordering::Acquire)]
    }

    /// Last committed target for one domain.
    pub fn target_mhz(&self, domain: ClkDomain) -> u16 {
        match domain {
            ClkDomain::Gpc2Clk => self.committed().gpc2clk.load(Ordering::Relaxed),
            ClkDomain::MClk => self.committed().mclk.load(Ordering::Relaxed),
        }
    }
}

struct NotificationSlot {
    timestamp: AtomicU64,
    mask: AtomicU32,
}

/// Fixed-size event ring with monotonic head/tail counters; entry `n`
/// lives in slot `n % size`.
struct NotificationQueue {
    slots: Vec<NotificationSlot>,
    head: AtomicU32,
    tail: AtomicU32,
}

impl NotificationQueue {
    fn new(size: usize) -> NotificationQueue {
        NotificationQueue {
            slots: (0..size)
                .map(|_| NotificationSlot {
                    timestamp: AtomicU64::new(0),
                    mask: AtomicU32::new(0),
                })
                .collect(),
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
        }
    }

    fn post(&self, alarm_mask: u32, timestamp: u64) {
        let n = self.tail.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
        let slot = &self.slots[n as usize % self.slots.len()];
        slot.timestamp.store(timestamp, Ordering::Relaxed);
        slot.mask.store(alarm_mask, Ordering::Relaxed);
    }
}

struct EventSignal {
    generation: Mutex<u64>,
    cond: Condvar,
}

/// One request or event file-descriptor analogue.
pub struct ClkDev {
    session: Weak<ClkSession>,
    gpc2clk_target_mhz: u16,
    mclk_target_mhz: u16,
    enabled_mask: u32,
    poll_mask: AtomicU32,
    alarms_reported: AtomicU32,
    arb_queue_head: AtomicU32,
    queue: NotificationQueue,
    event: EventSignal,
}

impl ClkDev {
    fn new(session: Weak<ClkSession>, enabled_mask: u32) -> ClkDev {
        ClkDev {
            session,
            gpc2clk_target_mhz: 0,
            mclk_target_mhz: 0,
            enabled_mask,
            poll_mask: AtomicU32::new(0),
            alarms_reported: AtomicU32::new(0),
            arb_queue_head: AtomicU32::new(0),
            queue: NotificationQueue::new(DEFAULT_EVENT_NUMBER),
            event: EventSignal { generation: Mutex::new(0), cond: Condvar::new() },
        }
    }

    fn post_event(&self) {
        let mut generation = self.event.generation.lock();
        *generation += 1;
        self.event.cond.notify_all();
    }

    /// Current poll readiness bits.
    pub fn poll_mask(&self) -> u32 {
        self.poll_mask.load(Ordering::Acquire)
    }

    /// Blocks until the next posted event or `timeout`; returns the poll
    /// mask observed afterwards.
    pub fn wait_event(&self, timeout: Duration) -> u32 {
        let mut generation = self.event.generation.lock();
        let seen = *generation;
        let _ = self
            .event
            .cond
            .wait_while_for(&mut generation, |generation| *generation == seen, timeout);
        self.poll_mask()
    }
}

#[derive(Default)]
struct ActualCell {
    gpc2clk: AtomicU16,
    mclk: AtomicU16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VfPoint {
    pub gpc_mhz: u16,
    pub sys_mhz: u16,
    pub xbar_mhz: u16,
    pub nvd_mhz: u16,
    pub host_mhz: u16,
}

#[derive(Default)]
struct VfTable {
    points: Vec<VfPoint>,
}

/// Per-GPU arbiter singleton.
pub struct ClkArb {
    ops: Arc<dyn ClkArbOps>,

    sessions: Mutex<Vec<Arc<ClkSession>>>,
    users: Mutex<Vec<Arc<ClkDev>>>,
    requests: Mutex<Vec<Arc<ClkDev>>>,
    /// Serializes slow-path pstate queries against the change sequence.
    pstate_lock: Mutex<()>,

    actual_pool: [ActualCell; 2],
    actual_idx: AtomicUsize,
    /// Pass-completion generation counter; the publication point readers
    /// pair with `actual_idx`.
    req_nr: AtomicU32,
    /// Upper 32 bits: update refcount; lower 32 bits: alarm mask.
    alarm_mask: AtomicU64,
    notification_queue: NotificationQueue,

    request_lock: Mutex<()>,
    request_cond: Condvar,

    status: std::sync::atomic::AtomicI32,

    gpc2clk_default_mhz: u16,
    mclk_default_mhz: u16,
    gpc2clk_min: AtomicU16,
    gpc2clk_max: AtomicU16,
    mclk_min: AtomicU16,
    mclk_max: AtomicU16,
    /// dGPU max-clock limit; zero when unconfigured.
    gpc_cap_clkmhz: u16,

    vf_tables: Mutex<[VfTable; 2]>,
    vf_table_idx: AtomicUsize,

    worker: Worker,
}

impl ClkArb {
    /// Brings the arbiter up: allocates state, starts the worker, runs
    /// the VF-table update plus one synchronous arbitration pass, and
    /// waits for it so a valid clock program is in effect on return.
    /// `Ok(None)` means the chip has no arbitration support.
    pub fn init(
        ops: Arc<dyn ClkArbOps>,
        gpc_cap_clkmhz: u16,
    ) -> Result<Option<Arc<ClkArb>>, ClkArbError> {
        if !ops.check_support() {
            return Ok(None);
        }

        let gpc2clk_default_mhz = ops.clk_default(ClkDomain::Gpc2Clk)?;
        let mclk_default_mhz = if ops.domains().contains(ClkDomains::MCLK) {
            ops.clk_default(ClkDomain::MClk)?
        } else {
            0
        };

        let arb = Arc::new_cyclic(|weak: &Weak<ClkArb>| ClkArb {
            ops,
            sessions: Mutex::new(Vec::new()),
            users: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            pstate_lock: Mutex::new(()),
            actual_pool: Default::default(),
            actual_idx: AtomicUsize::new(0),
            req_nr: AtomicU32::new(0),
            alarm_mask: AtomicU64::new(0),
            notification_queue: NotificationQueue::new(DEFAULT_EVENT_NUMBER),
            request_lock: Mutex::new(()),
            request_cond: Condvar::new(),
            status: std::sync::atomic::AtomicI32::new(0),
            gpc2clk_default_mhz,
            mclk_default_mhz,
            gpc2clk_min: AtomicU16::new(0),
            gpc2clk_max: AtomicU16::new(u16::MAX),
            mclk_min: AtomicU16::new(0),
            mclk_max: AtomicU16::new(u16::MAX),
            gpc_cap_clkmhz,
            vf_tables: Mutex::new(Default::default()),
            vf_table_idx: AtomicUsize::new(0),
            worker: Worker::spawn("gart_clk_arb", weak.clone()),
        });

        if let Err(err) = arb.run_vf_table_update() {
            arb.worker.deinit();
            return Err(err);
        }

        // First pass completed is detected via the generation counter
        // leaving zero.
        if !arb.wait_generation_change(0, INIT_WAIT) {
            arb.worker.deinit();
            return Err(ClkArbError::Timeout);
        }
        if arb.status.load(Ordering::Acquire) != 0 {
            arb.worker.deinit();
            return Err(ClkArbError::ProgramFailed);
        }

        Ok(Some(arb))
    }

    /// Stops the worker thread; further requests are inert.
    pub fn deinit(&self) {
        self.worker.deinit();
    }

    /// Opens a session. Its committed target starts at zero, which the
    /// merge phase resolves to the configured defaults.
    pub fn init_session(self: &Arc<ClkArb>) -> Arc<ClkSession> {
        let session = Arc::new(ClkSession::new());
        self.sessions.lock().push(Arc::clone(&session));
        session
    }

    /// Marks the session dead and schedules the convergence pass that
    /// retires it.
    pub fn release_session(&self, session: &Arc<ClkSession>) {
        session.zombie.store(true, Ordering::Release);
        session.targets.lock().clear();
        self.sessions.lock().retain(|s| !Arc::ptr_eq(s, session));
        self.worker.enqueue(WorkItem::UpdateArb);
    }

    /// Posts a target request for one domain and schedules convergence.
    /// The returned handle completes (poll bits + event) when the pass
    /// that honored it finishes.
    pub fn set_session_target_mhz(
        &self,
        session: &Arc<ClkSession>,
        domain: ClkDomain,
        target_mhz: u16,
    ) -> Result<Arc<ClkDev>, ClkArbError> {
        if !self.is_valid_domain(domain) {
            return Err(ClkArbError::InvalidDomain);
        }

        let mut dev = ClkDev::new(Arc::downgrade(session), 0);
        match domain {
            ClkDomain::Gpc2Clk => dev.gpc2clk_target_mhz = target_mhz,
            ClkDomain::MClk => dev.mclk_target_mhz = target_mhz,
        }
        let dev = Arc::new(dev);

        session.targets.lock().push_front(Arc::clone(&dev));
        self.worker.enqueue(WorkItem::UpdateArb);
        Ok(dev)
    }

    /// Registers a polling handle notified about `enabled_mask` alarms.
    pub fn install_event_dev(
        &self,
        session: &Arc<ClkSession>,
        enabled_mask: u32,
    ) -> Arc<ClkDev> {
        let dev = Arc::new(ClkDev::new(Arc::downgrade(session), enabled_mask));
        self.users.lock().push(Arc::clone(&dev));
        dev
    }

    pub fn remove_event_dev(&self, dev: &Arc<ClkDev>) {
        self.users.lock().retain(|d| !Arc::ptr_eq(d, dev));
    }

    pub fn is_valid_domain(&self, domain: ClkDomain) -> bool {
        let domains = self.ops.domains();
        match domain {
            ClkDomain::Gpc2Clk => domains.contains(ClkDomains::GPC2CLK),
            ClkDomain::MClk => domains.contains(ClkDomains::MCLK),
        }
    }

    pub fn arbiter_clk_range(&self, domain: ClkDomain) -> Result<(u16, u16), ClkArbError> {
        if !self.is_valid_domain(domain) {
            return Err(ClkArbError::InvalidDomain);
        }
        self.ops.clk_range(domain)
    }

    /// Reader side of the double-buffer publish: acquire the generation,
    /// then the current index, then the fields.
    pub fn actual_mhz(&self, domain: ClkDomain) -> u16 {
        let _generation = self.req_nr.load(Ordering::Acquire);
        let idx = self.actual_idx.load(Ordering::Acquire);
        match domain {
            ClkDomain::Gpc2Clk => self.actual_pool[idx].gpc2clk.load(Ordering::Relaxed),
            ClkDomain::MClk => self.actual_pool[idx].mclk.load(Ordering::Relaxed),
        }
    }

    /// Pass-completion generation counter.
    pub fn generation(&self) -> u32 {
        self.req_nr.load(Ordering::Acquire)
    }

    /// Schedules a convergence pass.
    pub fn kick(&self) {
        self.worker.enqueue(WorkItem::UpdateArb);
    }

    /// Schedules a VF-table refresh (which itself schedules convergence).
    pub fn schedule_vf_table_update(&self) {
        self.worker.enqueue(WorkItem::UpdateVfTable);
    }

    /// Waits for the generation counter to move past `prev`.
    pub fn wait_generation_change(&self, prev: u32, timeout: Duration) -> bool {
        let mut guard = self.request_lock.lock();
        if self.req_nr.load(Ordering::Acquire) != prev {
            return true;
        }
        let res = self.request_cond.wait_while_for(&mut guard, |_| {
            self.req_nr.load(Ordering::Acquire) == prev
        }, timeout);
        !res.timed_out()
    }

    /// Latches alarm bits and queues a notification. The upper refcount
    /// half makes concurrent updates well-ordered without a lock.
    pub fn set_global_alarm(&self, alarm: u32) {
        self.alarm_mask
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                let refcnt = ((current >> 32) as u32).wrapping_add(1);
                let mask = current as u32 | alarm;
                Some(((refcnt as u64) << 32) | mask as u64)
            })
            .ok();

        self.notification_queue.post(alarm, 0);
    }

    fn clear_global_alarm(&self, alarm: u32) {
        self.alarm_mask
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                let refcnt = ((current >> 32) as u32).wrapping_add(1);
                let mask = current as u32 & !alarm;
                Some(((refcnt as u64) << 32) | mask as u64)
            })
            .ok();
    }

    /// Latched alarm bits.
    pub fn global_alarms(&self) -> u32 {
        self.alarm_mask.load(Ordering::SeqCst) as u32
    }

    /// Sets an alarm and schedules convergence (thermal trip etc.).
    pub fn schedule_alarm(&self, alarm: u32) {
        self.set_global_alarm(alarm);
        self.worker.enqueue(WorkItem::UpdateArb);
    }

    /// Refreshes the VF table into the alternate buffer and publishes it,
    /// then schedules the arbitration pass that consumes it.
    pub(crate) fn run_vf_table_update(&self) -> Result<(), ClkArbError> {
        let res = self.do_vf_table_update();
        if res.is_err() {
            self.set_global_alarm(ALARM_VF_TABLE_UPDATE_FAILED);
        }
        self.worker.enqueue(WorkItem::UpdateArb);
        res
    }

    fn do_vf_table_update(&self) -> Result<(), ClkArbError> {
        let (gpc_min, gpc_max) = self.ops.clk_range(ClkDomain::Gpc2Clk)?;
        self.gpc2clk_min.store(gpc_min, Ordering::Relaxed);
        self.gpc2clk_max.store(gpc_max, Ordering::Relaxed);

        if self.is_valid_domain(ClkDomain::MClk) {
            let (mclk_min, mclk_max) = self.ops.clk_range(ClkDomain::MClk)?;
            self.mclk_min.store(mclk_min, Ordering::Relaxed);
            self.mclk_max.store(mclk_max, Ordering::Relaxed);
        }

        let f_points = self.ops.f_points(ClkDomain::Gpc2Clk)?;
        let mut points = Vec::new();
        let mut clk_cur = 0u16;
        for p in f_points {
            if p < gpc_min || p > gpc_max || p == clk_cur {
                continue;
            }
            let mut vf = SlaveFreqs { gpc_mhz: p, ..Default::default() };
            self.ops.find_slave_freqs(&mut vf)?;
            points.push(VfPoint {
                gpc_mhz: p,
                sys_mhz: vf.sys_mhz,
                xbar_mhz: vf.xbar_mhz,
                nvd_mhz: vf.nvd_mhz,
                host_mhz: vf.host_mhz,
            });
            clk_cur = p;
        }

        // Fill the alternate table, then flip: the table becomes visible
        // only after all its data resolved.
        let next = 1 - self.vf_table_idx.load(Ordering::Acquire);
        self.vf_tables.lock()[next] = VfTable { points };
        self.vf_table_idx.store(next, Ordering::Release);
        Ok(())
    }

    /// Published VF points (testing and diagnostics).
    pub fn vf_points(&self) -> Vec<VfPoint> {
        let idx = self.vf_table_idx.load(Ordering::Acquire);
        self.vf_tables.lock()[idx].points.clone()
    }

    /// The convergence pass: the single place where parallel session
    /// requests become one program-clocks call.
    pub(crate) fn run_arbiter(&self) {
        let mut status = Ok(());

        // Bail out if the GPU is gone; the exit phase still drains
        // requests so waiters do not hang.
        let gpu_lost = self.global_alarms() & ALARM_GPU_LOST != 0;

        if !gpu_lost {
            let (gpc2clk_target, mclk_target) = self.merge_session_targets();
            let gpc2clk_target = self.clamp_gpc2clk(gpc2clk_target);
            let mclk_target = self.clamp_mclk(mclk_target);

            let mut vf = SlaveFreqs {
                gpc_mhz: gpc2clk_target,
                mclk_mhz: mclk_target,
                ..Default::default()
            };

            status = self.ops.find_slave_freqs(&mut vf).map_err(|err| {
                log::error!("unable to get slave frequency");
                err
            });
            if status.is_ok() {
                let _pstate = self.pstate_lock.lock();
                status = self.ops.program_clocks(&vf).map_err(|err| {
                    log::error!("unable to program frequency");
                    err
                });
            }

            if status.is_ok() {
                // Publish: write every field of the non-current buffer,
                // make them visible, swap the index, then bump the
                // generation. Readers pair acquire loads with this.
                let next = 1 - self.actual_idx.load(Ordering::Relaxed);
                self.actual_pool[next].gpc2clk.store(gpc2clk_target, Ordering::Relaxed);
                self.actual_pool[next].mclk.store(mclk_target, Ordering::Relaxed);
                self.status.store(0, Ordering::Release);

                self.actual_idx.store(next, Ordering::Release);
                fence(Ordering::SeqCst);
                self.req_nr.fetch_add(1, Ordering::Release);

                self.set_global_alarm(EVENT_VF_UPDATE);

                let _guard = self.request_lock.lock();
                self.request_cond.notify_all();
            }
        }

        // Exit phase, success or failure.
        if status.is_err() {
            log::error!("error in arbiter update");
            self.set_global_alarm(ALARM_CLOCK_ARBITER_FAILED);
            self.status.store(-1, Ordering::Release);
        }
        let current_alarm = self.global_alarms();

        // Complete every in-flight request; dropping the reference frees
        // the handle once the caller is done with it.
        for dev in self.requests.lock().drain(..) {
            dev.poll_mask.fetch_or(POLLIN | POLLRDNORM, Ordering::AcqRel);
            dev.post_event();
        }

        // Fresh state supersedes notifications that arrived mid-pass.
        self.notification_queue
            .head
            .store(self.notification_queue.tail.load(Ordering::SeqCst), Ordering::SeqCst);

        let mut alarms_notified = 0;
        for dev in self.users.lock().iter() {
            alarms_notified |= self.notify(dev, current_alarm);
        }

        // Everything reported can drop, except GPU_LOST which only an
        // explicit recovery action clears.
        self.clear_global_alarm(alarms_notified & !ALARM_GPU_LOST);
    }

    /// Merges pending targets: within one session the newest non-zero
    /// value per domain wins; across sessions the maximum wins.
    fn merge_session_targets(&self) -> (u16, u16) {
        let mut gpc2clk_target = 0u16;
        let mut mclk_target = 0u16;

        let sessions = self.sessions.lock();
        for session in sessions.iter() {
            if session.zombie.load(Ordering::Acquire) {
                continue;
            }

            {
                let mut list = session.targets.lock();
                if !list.is_empty() {
                    let cur = session.target_idx.load(Ordering::Acquire);
                    let alt = 1 - cur;
                    let target = &session.target_pool[alt];

                    // Start from the committed state, then take the first
                    // non-zero value per domain; entries are newest-first
                    // so this realizes most-recent-wins.
                    target.mclk.store(
                        session.target_pool[cur].mclk.load(Ordering::Relaxed),
                        Ordering::Relaxed,
                    );
                    target.gpc2clk.store(
                        session.target_pool[cur].gpc2clk.load(Ordering::Relaxed),
                        Ordering::Relaxed,
                    );

                    let mut mclk_set = false;
                    let mut gpc2clk_set = false;
                    for dev in list.iter() {
                        if !mclk_set && dev.mclk_target_mhz != 0 {
                            target.mclk.store(dev.mclk_target_mhz, Ordering::Relaxed);
                            mclk_set = true;
                        }
                        if !gpc2clk_set && dev.gpc2clk_target_mhz != 0 {
                            target.gpc2clk.store(dev.gpc2clk_target_mhz, Ordering::Relaxed);
                            gpc2clk_set = true;
                        }
                    }

                    // Transfer every visited request onto the in-flight
                    // list in one splice, then commit by flipping the
                    // target pointer.
                    self.requests.lock().extend(list.drain(..));
                    session.target_idx.store(alt, Ordering::Release);
                }
            }

            mclk_target = mclk_target.max(session.target_mhz(ClkDomain::MClk));
            gpc2clk_target = gpc2clk_target.max(session.target_mhz(ClkDomain::Gpc2Clk));
        }

        (gpc2clk_target, mclk_target)
    }

    fn clamp_gpc2clk(&self, target: u16) -> u16 {
        let mut t = if target > 0 { target } else { self.gpc2clk_default_mhz };
        t = t.clamp(
            self.gpc2clk_min.load(Ordering::Relaxed),
            self.gpc2clk_max.load(Ordering::Relaxed),
        );
        if self.gpc_cap_clkmhz != 0 && t > self.gpc_cap_clkmhz {
            t = self.gpc_cap_clkmhz;
        }
        self.ops.qos_clamp(t)
    }

    fn clamp_mclk(&self, target: u16) -> u16 {
        let t = if target > 0 { target } else { self.mclk_default_mhz };
        t.clamp(self.mclk_min.load(Ordering::Relaxed), self.mclk_max.load(Ordering::Relaxed))
    }

    /// Propagates this pass's alarms and VF update into one polling
    /// handle; returns the alarms it reported.
    fn notify(&self, dev: &Arc<ClkDev>, alarm: u32) -> u32 {
        let enabled_mask = dev.enabled_mask;
        let size = self.notification_queue.slots.len() as u32;

        let tail = self.notification_queue.tail.load(Ordering::SeqCst);
        let mut queue_index = dev.queue.tail.load(Ordering::SeqCst);
        let mut head = dev.arb_queue_head.load(Ordering::SeqCst);
        if tail.wrapping_sub(head) >= size {
            head = tail.wrapping_sub(size);
        }

        let mut queue_alarm_mask = 0u32;
        let mut index = head;
        while index != tail {
            index = index.wrapping_add(1);
            let slot = &self.notification_queue.slots[index as usize % size as usize];
            let alarm_detected = slot.mask.load(Ordering::Relaxed);

            if enabled_mask & alarm_detected == 0 {
                continue;
            }

            queue_index = queue_index.wrapping_add(1);
            let dev_slot =
                &dev.queue.slots[queue_index as usize % dev.queue.slots.len()];
            dev_slot.timestamp.store(slot.timestamp.load(Ordering::Relaxed), Ordering::Relaxed);
            dev_slot.mask.store(alarm_detected, Ordering::Relaxed);

            queue_alarm_mask |= alarm_detected;
        }
        dev.queue.tail.store(queue_index, Ordering::SeqCst);
        dev.arb_queue_head.store(tail, Ordering::SeqCst);

        let mut poll_mask = 0u32;

        // Local check: is this handle's session short of its target?
        if enabled_mask & ALARM_LOCAL_TARGET_VF_NOT_POSSIBLE != 0 {
            if let Some(session) = dev.session.upgrade() {
                let actual_gpc2 = self.actual_mhz(ClkDomain::Gpc2Clk);
                let actual_mclk = self.actual_mhz(ClkDomain::MClk);
                if actual_gpc2 < session.target_mhz(ClkDomain::Gpc2Clk)
                    || actual_mclk < session.target_mhz(ClkDomain::MClk)
                {
                    poll_mask |= POLLIN | POLLPRI;
                    dev.queue.post(ALARM_LOCAL_TARGET_VF_NOT_POSSIBLE, 0);
                }
            }
        }

        if queue_alarm_mask & EVENT_VF_UPDATE != 0 {
            poll_mask |= POLLIN | POLLRDNORM;
        }

        // Report sticky alarms that were not reported on a previous run.
        let new_alarms_reported =
            queue_alarm_mask | (alarm & !dev.alarms_reported.load(Ordering::SeqCst) & queue_alarm_mask);

        if new_alarms_reported & !LOCAL_ALARM_MASK != 0 {
            if new_alarms_reported & ALARM_GPU_LOST != 0 {
                poll_mask |= POLLHUP;
            }
            poll_mask |= POLLIN | POLLPRI;
            // Do not re-report already-reported global alarms next run,
            // but GPU_LOST reports every time.
            dev.alarms_reported.store(
                new_alarms_reported & !LOCAL_ALARM_MASK & !ALARM_GPU_LOST,
                Ordering::SeqCst,
            );
        }

        if poll_mask != 0 {
            dev.poll_mask.store(poll_mask, Ordering::Release);
            dev.post_event();
        }

        new_alarms_reported
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::time::Instant;

    use super::*;

    struct StubClk {
        programmed: Mutex<Vec<SlaveFreqs>>,
        fail_program: AtomicBool,
    }

    impl StubClk {
        fn new() -> Arc<StubClk> {
            Arc::new(StubClk {
                programmed: Mutex::new(Vec::new()),
                fail_program: AtomicBool::new(false),
            })
        }

        fn program_count(&self) -> usize {
            self.programmed.lock().len()
        }

        fn last_programmed(&self) -> SlaveFreqs {
            *self.programmed.lock().last().expect("nothing programmed")
        }
    }

    impl ClkArbOps for StubClk {
        fn domains(&self) -> ClkDomains {
            ClkDomains::GPC2CLK | ClkDomains::MCLK
        }

        fn clk_range(&self, domain: ClkDomain) -> Result<(u16, u16), ClkArbError> {
            Ok(match domain {
                ClkDomain::Gpc2Clk => (300, 1000),
                ClkDomain::MClk => (405, 850),
            })
        }

        fn clk_default(&self, domain: ClkDomain) -> Result<u16, ClkArbError> {
            Ok(match domain {
                ClkDomain::Gpc2Clk => 500,
                ClkDomain::MClk => 405,
            })
        }

        fn f_points(&self, _domain: ClkDomain) -> Result<Vec<u16>, ClkArbError> {
            Ok(vec![300, 500, 700, 900, 1000])
        }

        fn find_slave_freqs(&self, vf: &mut SlaveFreqs) -> Result<(), ClkArbError> {
            vf.sys_mhz = vf.gpc_mhz / 2;
            vf.xbar_mhz = vf.gpc_mhz / 2;
            vf.nvd_mhz = vf.gpc_mhz / 4;
            vf.host_mhz = vf.gpc_mhz / 4;
            Ok(())
        }

        fn program_clocks(&self, vf: &SlaveFreqs) -> Result<(), ClkArbError> {
            if self.fail_program.load(Ordering::SeqCst) {
                return Err(ClkArbError::ProgramFailed);
            }
            self.programmed.lock().push(*vf);
            Ok(())
        }
    }

    fn arb_with_stub() -> (Arc<ClkArb>, Arc<StubClk>) {
        let stub = StubClk::new();
        let arb = ClkArb::init(Arc::<StubClk>::clone(&stub), 0).unwrap().unwrap();
        (arb, stub)
    }

    fn wait_actual(arb: &ClkArb, domain: ClkDomain, expect: u16) {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if arb.actual_mhz(domain) == expect {
                return;
            }
            assert!(Instant::now() < deadline, "actual never reached {} MHz", expect);
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn settle(arb: &ClkArb) {
        // Schedule one more pass and wait for it, so earlier passes have
        // certainly finished.
        let gen = arb.generation();
        arb.kick();
        assert!(arb.wait_generation_change(gen, Duration::from_secs(2)));
    }

    #[test]
    fn init_programs_defaults() {
        let (arb, stub) = arb_with_stub();
        assert_eq!(stub.program_count(), 1);
        assert_eq!(arb.actual_mhz(ClkDomain::Gpc2Clk), 500);
        assert_eq!(arb.actual_mhz(ClkDomain::MClk), 405);
        arb.deinit();
    }

    #[test]
    fn vf_table_filters_to_configured_range() {
        let (arb, _stub) = arb_with_stub();
        let points = arb.vf_points();
        let freqs: Vec<u16> = points.iter().map(|p| p.gpc_mhz).collect();
        assert_eq!(freqs, vec![300, 500, 700, 900, 1000]);
        assert_eq!(points[2].sys_mhz, 350);
        arb.deinit();
    }

    #[test]
    fn two_sessions_converge_to_clamped_max() {
        let (arb, stub) = arb_with_stub();

        let a = arb.init_session();
        let b = arb.init_session();
        arb.set_session_target_mhz(&a, ClkDomain::Gpc2Clk, 800).unwrap();
        arb.set_session_target_mhz(&b, ClkDomain::Gpc2Clk, 1200).unwrap();

        // Max over sessions is 1200, clamped to the configured 1000.
        wait_actual(&arb, ClkDomain::Gpc2Clk, 1000);
        assert_eq!(stub.last_programmed().gpc_mhz, 1000);
        arb.deinit();
    }

    #[test]
    fn convergence_is_independent_of_session_order() {
        let targets = [600u16, 900, 700];
        let mut results = Vec::new();

        for reversed in [false, true] {
            let (arb, _stub) = arb_with_stub();
            let mut order: Vec<u16> = targets.to_vec();
            if reversed {
                order.reverse();
            }
            for t in order {
                let s = arb.init_session();
                arb.set_session_target_mhz(&s, ClkDomain::Gpc2Clk, t).unwrap();
            }
            wait_actual(&arb, ClkDomain::Gpc2Clk, 900);
            results.push(arb.actual_mhz(ClkDomain::Gpc2Clk));
            arb.deinit();
        }
        assert_eq!(results[0], results[1]);
    }

    #[test]
    fn newest_request_wins_within_a_session() {
        let (arb, _stub) = arb_with_stub();
        let s = arb.init_session();

        // Posted without letting the worker run in between; the newest
        // non-zero value per domain must win.
        arb.set_session_target_mhz(&s, ClkDomain::Gpc2Clk, 900).unwrap();
        arb.set_session_target_mhz(&s, ClkDomain::Gpc2Clk, 600).unwrap();
        settle(&arb);
        wait_actual(&arb, ClkDomain::Gpc2Clk, 600);
        assert_eq!(s.target_mhz(ClkDomain::Gpc2Clk), 600);
        arb.deinit();
    }

    #[test]
    fn request_handle_completes_with_poll_bits() {
        let (arb, _stub) = arb_with_stub();
        let s = arb.init_session();
        let dev = arb.set_session_target_mhz(&s, ClkDomain::Gpc2Clk, 700).unwrap();

        let poll = dev.wait_event(Duration::from_secs(2));
        assert_ne!(poll & (POLLIN | POLLRDNORM), 0);
        arb.deinit();
    }

    #[test]
    fn zombie_session_no_longer_contributes() {
        let (arb, _stub) = arb_with_stub();
        let hi = arb.init_session();
        arb.set_session_target_mhz(&hi, ClkDomain::Gpc2Clk, 1000).unwrap();
        wait_actual(&arb, ClkDomain::Gpc2Clk, 1000);

        arb.release_session(&hi);
        // With no live sessions the defaults are re-applied.
        wait_actual(&arb, ClkDomain::Gpc2Clk, 500);
        arb.deinit();
    }

    #[test]
    fn gpu_lost_alarm_sticks_and_skips_programming() {
        let (arb, stub) = arb_with_stub();
        let baseline = stub.program_count();

        arb.set_global_alarm(ALARM_GPU_LOST);
        for _ in 0..3 {
            arb.kick();
            // The pass bails out up front: no merge, no program-clocks
            // call and no generation bump.
            std::thread::sleep(Duration::from_millis(30));
        }

        assert_eq!(stub.program_count(), baseline);
        assert_eq!(arb.generation(), 1);
        assert_ne!(arb.global_alarms() & ALARM_GPU_LOST, 0);
        arb.deinit();
    }

    #[test]
    fn thermal_alarm_is_cleared_after_notification() {
        let (arb, _stub) = arb_with_stub();
        let s = arb.init_session();
        let dev = arb.install_event_dev(&s, ALARM_THERMAL_ABOVE_THRESHOLD);

        arb.schedule_alarm(ALARM_THERMAL_ABOVE_THRESHOLD);
        let poll = dev.wait_event(Duration::from_secs(2));
        assert_ne!(poll & POLLPRI, 0);

        settle(&arb);
        assert_eq!(arb.global_alarms() & ALARM_THERMAL_ABOVE_THRESHOLD, 0);
        arb.deinit();
    }

    #[test]
    fn failed_program_raises_arbiter_failed_alarm() {
        let (arb, stub) = arb_with_stub();
        let s = arb.init_session();
        let dev = arb.install_event_dev(&s, ALARM_CLOCK_ARBITER_FAILED);

        stub.fail_program.store(true, Ordering::SeqCst);
        arb.set_session_target_mhz(&s, ClkDomain::Gpc2Clk, 700).unwrap();

        let poll = dev.wait_event(Duration::from_secs(2));
        assert_ne!(poll & POLLPRI, 0);
        assert_ne!(dev.poll_mask() & POLLIN, 0);
        arb.deinit();
    }

    // A reader that observes a bumped generation must observe fully
    // written actual data, never the zeroed initial buffer.
    #[test]
    fn publish_is_never_observed_half_written() {
        let (arb, _stub) = arb_with_stub();

        let stop = Arc::new(AtomicBool::new(false));
        let mut readers = Vec::new();
        for _ in 0..4 {
            let arb = Arc::clone(&arb);
            let stop = Arc::clone(&stop);
            readers.push(std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    let generation = arb.generation();
                    let gpc2 = arb.actual_mhz(ClkDomain::Gpc2Clk);
                    if generation > 0 {
                        assert!(gpc2 >= 300, "half-written actual observed: {}", gpc2);
                    }
                }
            }));
        }

        let s = arb.init_session();
        for i in 0..50u16 {
            let mhz = 300 + (i % 7) * 100;
            let gen = arb.generation();
            arb.set_session_target_mhz(&s, ClkDomain::Gpc2Clk, mhz).unwrap();
            arb.wait_generation_change(gen, Duration::from_secs(2));
        }

        stop.store(true, Ordering::Relaxed);
        for r in readers {
            r.join().unwrap();
        }
        arb.deinit();
    }
}
