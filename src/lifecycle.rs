//! Shared start/stop plumbing for the capture thread and worker pools.

use crossbeam_channel::Receiver;
use serde::{Deserialize, Serialize};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// `Idle -> Running -> Stopped`. A stopped component is not restarted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
    Stopped,
}

/// How a thread ended when we stopped waiting for it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum JoinOutcome {
    Finished,
    Panicked,
    /// Still running after the grace period; the handle was dropped.
    Detached,
}

const JOIN_POLL: Duration = Duration::from_millis(10);

/// Wait up to `grace` for `handle` to finish, then join or detach it.
pub(crate) fn join_with_grace<T>(handle: JoinHandle<T>, grace: Duration, label: &str) -> JoinOutcome {
    let deadline = Instant::now() + grace;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            log::warn!(
                "{}: thread did not exit within {:?}, detaching it",
                label,
                grace
            );
            return JoinOutcome::Detached;
        }
        std::thread::sleep(JOIN_POLL);
    }
    match handle.join() {
        Ok(_) => JoinOutcome::Finished,
        Err(_) => {
            log::error!("{}: thread panicked", label);
            JoinOutcome::Panicked
        }
    }
}

/// Discard everything currently queued on `rx`; returns the number dropped.
pub(crate) fn drain<T>(rx: &Receiver<T>) -> usize {
    let mut drained = 0;
    while rx.try_recv().is_ok() {
        drained += 1;
    }
    drained
}
