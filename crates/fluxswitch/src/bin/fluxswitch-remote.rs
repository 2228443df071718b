use std::path::PathBuf;
use std::process;
use std::time::Instant;

use clap::{Parser, Subcommand};
use fluxswitch::control::client::{shared_memory, Client};
use fluxswitch::control::DEFAULT_SOCKET_PATH;

/// Talk to a running fluxswitch over its control socket.
#[derive(Parser, Debug)]
#[command(name = "fluxswitch-remote", version)]
struct Args {
    #[arg(long, default_value = DEFAULT_SOCKET_PATH)]
    socket: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Measure control round trips.
    Ping {
        #[arg(default_value_t = 1024)]
        rounds: u32,
    },
    /// Ask the switch to attach a tap device.
    Tap { device: String },
    /// Share a fresh memory region of `size` bytes with the switch.
    Memmap {
        #[arg(default_value_t = 4096)]
        size: u64,
    },
}

fn main() {
    let args = Args::parse();
    match run(args) {
        Ok(true) => println!("Success"),
        Ok(false) => {
            println!("Failure");
            process::exit(1);
        }
        Err(e) => {
            eprintln!("fluxswitch-remote: {e}");
            process::exit(2);
        }
    }
}

fn run(args: Args) -> Result<bool, Box<dyn std::error::Error>> {
    let client = Client::connect(&args.socket)?;
    match args.command {
        Command::Ping { rounds } => {
            let rounds = rounds.max(1);
            let start = Instant::now();
            for _ in 0..rounds {
                if !client.ping()? {
                    return Ok(false);
                }
            }
            println!("{:?} per round trip", start.elapsed() / rounds);
            Ok(true)
        }
        Command::Tap { device } => Ok(client.create_port_tap(&device)?),
        Command::Memmap { size } => {
            let memory = shared_memory(size)?;
            Ok(client.memory_map(&memory, 0, size, 0)?)
        }
    }
}
