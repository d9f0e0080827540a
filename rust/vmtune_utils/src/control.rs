// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Control-loop driver shared by both daemons.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crate::host::HostError;

/// Run one sense/decide/act cycle per `interval` until `shutdown` is raised
/// or a tick fails.
///
/// The sleep comes first: the very first tick observes counter deltas over a
/// full cycle. A tick error ends the loop immediately and is handed back to
/// the caller, which unwinds through teardown.
pub fn run_control_loop<F>(
    interval: Duration,
    shutdown: &AtomicBool,
    mut tick: F,
) -> Result<(), HostError>
where
    F: FnMut() -> Result<(), HostError>,
{
    while !shutdown.load(Ordering::Relaxed) {
        thread::sleep(interval);

        // A signal may have arrived during the sleep; don't act on stale
        // telemetry after the operator asked us to stop.
        if shutdown.load(Ordering::Relaxed) {
            break;
        }

        tick()?;
    }

    Ok(())
}
