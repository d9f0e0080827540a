// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};

use vmtune_cpu::sampler::CpuThresholds;
use vmtune_cpu::scheduler::Scheduler;
use vmtune_utils::host::{HostError, Hypervisor};

/// vmtune_cpu: pCPU load balancer for guest vCPUs
///
/// Once per cycle the scheduler samples per-pCPU idle time and per-guest
/// vCPU run time from the hypervisor, classifies pCPUs as hot (above
/// --high-thresh with more than one vCPU pinned) or cold (below
/// --low-thresh), and migrates the best-fitting vCPU from hot pCPUs onto
/// cold ones so the destination lands as close as possible to --target
/// without itself becoming hot. When every projected move would overshoot,
/// the host is considered balanced and nothing is repinned.
///
/// Guests are captured at startup and assumed to carry a single vCPU each;
/// guest i starts pinned on pCPU i modulo the pCPU count.
#[derive(Debug, Parser)]
struct Opts {
    /// Time, in seconds, between cycles.
    #[clap(value_parser = clap::value_parser!(u64).range(1..))]
    interval: u64,

    /// pCPU utilization (percent) above which a pCPU sheds vCPUs.
    #[clap(long, default_value = "90")]
    high_thresh: u32,

    /// pCPU utilization (percent) below which a pCPU receives vCPUs.
    #[clap(long, default_value = "70")]
    low_thresh: u32,

    /// Target pCPU utilization (percent) for best-fit placement.
    #[clap(long, default_value = "80")]
    target: u32,

    /// Print per-tick pCPU and vCPU statistics to standard output.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    dump_stats: bool,

    /// Enable verbose output. Specify multiple times to increase verbosity.
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

const VIRT_URI: &str = "qemu:///system";

fn init_logger(verbose: u8) -> Result<()> {
    let level = match verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let mut cfg = simplelog::ConfigBuilder::new();
    cfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        level,
        cfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;
    Ok(())
}

fn fatal(err: HostError) -> ! {
    error!("{}", err);
    eprintln!("exit error code = {}", err.code());
    process::exit(err.code());
}

#[cfg(feature = "libvirt")]
fn open_host() -> Result<vmtune_utils::libvirt::LibvirtHost, HostError> {
    vmtune_utils::libvirt::LibvirtHost::open(VIRT_URI)
}

#[cfg(not(feature = "libvirt"))]
fn open_host() -> Result<vmtune_utils::scenario::ScenarioHost, HostError> {
    Err(HostError::Conn(
        "built without libvirt support (rebuild with --features libvirt)".to_string(),
    ))
}

fn run<H: Hypervisor>(conn: H, opts: &Opts, shutdown: &AtomicBool) -> Result<()> {
    let th = CpuThresholds {
        high: opts.high_thresh,
        low: opts.low_thresh,
        target: opts.target,
    };

    let mut sched = match Scheduler::init(conn, opts.interval, th, opts.dump_stats) {
        Ok(sched) => sched,
        Err(e) => fatal(e),
    };

    let result = sched.run(shutdown);
    sched.teardown();
    match result {
        Ok(()) => {
            info!("shutdown complete");
            Ok(())
        }
        Err(e) => fatal(e),
    }
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    init_logger(opts.verbose)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::Relaxed);
    })
    .context("Error setting Ctrl-C handler")?;

    let conn = match open_host() {
        Ok(conn) => conn,
        Err(e) => fatal(e),
    };
    info!("connected to {}, cycle time {}s", VIRT_URI, opts.interval);

    run(conn, &opts, &shutdown)
}
