// Copyright 2026 Gart Contributors
// SPDX-License-Identifier: Apache-2.0

//! Background worker driving the arbiter. Work items are scheduled by
//! request, never polled on a period; an item already queued is not queued
//! twice (it has been scheduled but not yet processed).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use crate::clk::arb::ClkArb;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkItem {
    UpdateArb,
    UpdateVfTable,
}

struct Shared {
    queue: Mutex<VecDeque<WorkItem>>,
    cond: Condvar,
    shutdown: AtomicBool,
}

pub(crate) struct Worker {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    pub(crate) fn spawn(name: &str, arb: Weak<ClkArb>) -> Worker {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });

        let thread_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || loop {
                let item = {
                    let mut queue = thread_shared.queue.lock();
                    loop {
                        if thread_shared.shutdown.load(Ordering::Acquire) {
                            return;
                        }
                        if let Some(item) = queue.pop_front() {
                            break item;
                        }
                        thread_shared.cond.wait(&mut queue);
                    }
                };

                let Some(arb) = arb.upgrade() else { return };
                match item {
                    WorkItem::UpdateArb => arb.run_arbiter(),
                    WorkItem::UpdateVfTable => {
                        let _ = arb.run_vf_table_update();
                    }
                }
            })
            .expect("spawning clk arb worker");

        Worker { shared, thread: Mutex::new(Some(thread)) }
    }

    pub(crate) fn enqueue(&self, item: WorkItem) {
        let mut queue = self.shared.queue.lock();
        if !queue.contains(&item) {
            queue.push_back(item);
        }
        self.shared.cond.notify_one();
    }

    /// Stops the thread and joins it. Safe to call more than once. When
    /// the last arbiter reference dies on the worker thread itself the
    /// join is skipped and the thread simply runs to completion.
    pub(crate) fn deinit(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.cond.notify_one();
        if let Some(handle) = self.thread.lock().take() {
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.deinit();
    }
}
