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

use vmtune_mem::coordinator::Coordinator;
use vmtune_mem::stats::MemThresholds;
use vmtune_utils::host::{HostError, Hypervisor};

/// vmtune_mem: balloon coordinator for guest memory
///
/// Once per cycle the coordinator samples every guest's balloon statistics
/// and the host's free memory. Guests holding more than --guest-high
/// percent unused memory are shrunk back to --guest-tgt; guests under
/// --guest-low percent are grown to --guest-tgt, but only while the host
/// would stay above --host-low percent free. When the host itself drops
/// under --host-tgt percent free, every guest surrenders memory in
/// proportion to its share of host memory instead.
///
/// Guests are captured at startup; their balloon drivers are asked to
/// publish statistics once a second.
#[derive(Debug, Parser)]
struct Opts {
    /// Time, in seconds, between cycles.
    #[clap(value_parser = clap::value_parser!(u64).range(1..))]
    interval: u64,

    /// Host free memory (percent of total) below which grants stop.
    #[clap(long, default_value = "10")]
    host_low: u64,

    /// Host free memory (percent of total) the fair reclaim steers back to.
    #[clap(long, default_value = "15")]
    host_tgt: u64,

    /// Guest available memory (percent) below which a guest is hungry.
    #[clap(long, default_value = "25")]
    guest_low: u64,

    /// Guest available memory (percent) adjustments steer guests to.
    #[clap(long, default_value = "30")]
    guest_tgt: u64,

    /// Guest available memory (percent) above which a guest holds excess.
    #[clap(long, default_value = "33")]
    guest_high: u64,

    /// Print per-tick host and guest memory statistics to standard output.
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
    let th = MemThresholds {
        host_low: opts.host_low,
        host_tgt: opts.host_tgt,
        guest_low: opts.guest_low,
        guest_tgt: opts.guest_tgt,
        guest_high: opts.guest_high,
    };

    let mut coord = match Coordinator::init(conn, opts.interval, th, opts.dump_stats) {
        Ok(coord) => coord,
        Err(e) => fatal(e),
    };

    let result = coord.run(shutdown);
    coord.teardown();
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
