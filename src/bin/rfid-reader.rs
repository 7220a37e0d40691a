//! Bench tool for the RFID reader.
//!
//! Opens the serial device, optionally resets the reader, then polls and logs
//! every change in the set of tags in range.

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{error, info};
use robocooler_rfid::{CommandId, EngineConfig, InventoryEngine, LogObserver};

/// RFID reader bench tool
#[derive(Parser, Debug)]
#[command(name = "rfid-reader")]
#[command(about = "Poll a UHF RFID reader and log tag changes")]
#[command(version)]
struct Args {
    /// Serial device
    #[arg(short, long, default_value = "/dev/ttyUSB0")]
    device: String,

    /// Baud rate
    #[arg(long, default_value_t = 115_200)]
    baud: u32,

    /// Reset the reader before polling
    #[arg(short, long)]
    reset: bool,

    /// Run this many poll cycles and report the contents instead of polling
    /// until stopped
    #[arg(short = 'c', long)]
    cycles: Option<usize>,

    /// With --cycles, report per-tag occurrence counts
    #[arg(long, requires = "cycles")]
    labels: bool,

    /// Stop continuous polling after this many milliseconds (default: when
    /// stdin closes)
    #[arg(short = 't', long)]
    duration_ms: Option<u64>,

    /// Pause between poll cycles (milliseconds)
    #[arg(long, default_value_t = 1)]
    poll_interval_ms: u64,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let args = Args::parse();

    let level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let config = EngineConfig::builder()
        .baud_rate(args.baud)
        .poll_interval_ms(args.poll_interval_ms)
        .build();
    let engine = InventoryEngine::open(&args.device, Arc::new(LogObserver), config);
    if !engine.is_initialized() {
        error!("Can't init RFID on {}", args.device);
        std::process::exit(1);
    }

    if args.reset {
        if let Err(e) = engine.execute(CommandId::Reset as u8, &[]) {
            error!("reset failed: {}", e);
        }
    }

    if let Some(cycles) = args.cycles {
        if let Err(e) = engine.run_bounded(cycles, args.labels) {
            error!("inventory failed: {}", e);
            std::process::exit(1);
        }
        while engine.is_inventory_running() {
            std::thread::sleep(Duration::from_millis(50));
        }
        return;
    }

    if let Err(e) = engine.start_continuous(true) {
        error!("inventory failed: {}", e);
        std::process::exit(1);
    }
    match args.duration_ms {
        Some(ms) => {
            info!("Timer test: {} ms", ms);
            std::thread::sleep(Duration::from_millis(ms));
            info!("Stop by timer");
        }
        None => {
            info!("Polling until stdin closes");
            wait_for_eof(std::io::stdin());
        }
    }
    engine.stop_inventory();
}

/// Drain `input` until it closes; false when reading failed first
fn wait_for_eof(mut input: impl Read) -> bool {
    let mut sink = Vec::new();
    match input.read_to_end(&mut sink) {
        Ok(_) => true,
        Err(e) => {
            error!("stdin read failed: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BrokenInput;

    impl Read for BrokenInput {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Err(std::io::Error::other("terminal gone"))
        }
    }

    #[test]
    fn test_wait_for_eof() {
        assert!(wait_for_eof(&b"q\n"[..]));
        assert!(!wait_for_eof(BrokenInput));
    }
}
