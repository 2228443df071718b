use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use fluxswitch::control::{Listener, DEFAULT_SOCKET_PATH};
use fluxswitch::port::{self, TapPort};
use fluxswitch::{Poller, SwitchBuilder};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Userspace learning Ethernet switch.
#[derive(Parser, Debug)]
#[command(name = "fluxswitch", version)]
struct Args {
    /// Control socket clients connect to.
    #[arg(long, default_value = DEFAULT_SOCKET_PATH)]
    socket: PathBuf,

    /// Remove a stale control socket before binding.
    #[arg(short, long)]
    force: bool,

    /// Microseconds to keep polling an idle switch before sleeping.
    #[arg(long, default_value_t = 50)]
    poll_us: u64,

    /// Packets taken from one port per round.
    #[arg(long, default_value_t = 16)]
    batch_size: usize,

    #[arg(long, value_enum, default_value_t = Poller::Adaptive)]
    poller: Poller,

    /// Tap device node or interface name to attach at startup. Repeatable.
    #[arg(long = "tap")]
    taps: Vec<String>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    if let Err(e) = run(args) {
        error!(error = %e, "fluxswitch failed");
        process::exit(1);
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let switch = SwitchBuilder::new()
        .batch_size(args.batch_size)
        .poll_us(args.poll_us)
        .poller(args.poller)
        .build()?;

    let interrupted = AtomicBool::new(false);
    {
        let switch = switch.clone();
        ctrlc::set_handler(move || {
            if interrupted.swap(true, Ordering::SeqCst) {
                process::exit(130);
            }
            switch.shutdown();
        })?;
    }

    let mut taps = Vec::with_capacity(args.taps.len());
    for path in &args.taps {
        let tap = TapPort::open(path, switch.notifier())?;
        taps.push(port::enable(&switch, Arc::new(tap))?);
    }

    let listener = Listener::bind(switch.clone(), &args.socket, args.force)?;
    switch.run()?;

    info!("shutting down");
    listener.shutdown();
    for tap in taps {
        tap.disable();
    }
    if switch.ports().is_empty() {
        info!("all ports detached");
    } else {
        warn!(ports = switch.ports().len(), "ports still attached at exit");
    }
    Ok(())
}
