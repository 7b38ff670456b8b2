//! serial-sim - drive a simulated serial stream port
//!
//! Commands:
//! - `serial-sim run [INPUT]` - Feed a G-code file (or stdin) through the port
//! - `serial-sim info` - Show the port configuration and baud arithmetic
//!
//! Realtime bytes in the input (`?`, `!`, `~`, 0x18) are intercepted before
//! they reach the receive ring, exactly as on the controller.

mod config;
mod session;

use std::fs;
use std::io::{self, Read, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use serial_stream::{DEFAULT_RX_CAPACITY, DEFAULT_TX_CAPACITY};

use crate::config::SimConfig;
use crate::session::{baud_info, run_session, SessionReport};

#[derive(Parser)]
#[command(name = "serial-sim")]
#[command(version)]
#[command(about = "Interrupt-driven serial port simulator", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured baud rate
    #[arg(short, long, global = true)]
    baud: Option<u32>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Feed input through the simulated port
    Run {
        /// Input file (stdin when omitted)
        input: Option<PathBuf>,

        /// Send input as fast as possible instead of at line rate
        #[arg(long)]
        no_pace: bool,

        /// Only print statistics, not the transmitted bytes
        #[arg(short, long)]
        quiet: bool,
    },

    /// Show port configuration
    Info,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    let mut config = SimConfig::load(cli.config.as_deref())?;
    if let Some(baud) = cli.baud {
        config.port.baud_rate = baud;
    }

    match cli.command {
        Commands::Run {
            input,
            no_pace,
            quiet,
        } => {
            if no_pace {
                config.pace = false;
            }
            let input = read_input(input)?;
            let report = run_session(&config, &input)?;

            if !quiet {
                io::stdout().write_all(&report.wire)?;
            }
            print_report(&report);
        }

        Commands::Info => {
            show_info(&config)?;
        }
    }

    Ok(())
}

fn read_input(path: Option<PathBuf>) -> Result<Vec<u8>> {
    match path {
        Some(path) => {
            fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))
        }
        None => {
            let mut input = Vec::new();
            io::stdin()
                .read_to_end(&mut input)
                .context("Failed to read stdin")?;
            Ok(input)
        }
    }
}

fn print_report(report: &SessionReport) {
    let stats = &report.stats;

    println!();
    println!("{}", "Session".bold());
    println!("  Lines acknowledged: {}", report.lines.to_string().green());
    println!("  Resets:             {}", report.resets);
    println!("  Realtime commands:  {:?}", report.realtime);
    println!("  Bytes received:     {}", stats.received);
    println!("    queued:           {}", stats.queued);
    println!("    intercepted:      {}", stats.intercepted);
    println!("    discarded:        {}", stats.discarded);
    println!("  Bytes transmitted:  {}", stats.transmitted);
    println!("  Interrupt services: {}", stats.services);

    if stats.overflowed > 0 || report.rx_overflow {
        println!(
            "  {} {} bytes lost to RX overflow",
            "warning:".yellow().bold(),
            stats.overflowed
        );
    }
    if stats.error_clears > 0 {
        println!("  Line errors cleared: {}", stats.error_clears);
    }
    if report.timed_out {
        println!("  {} session timed out", "warning:".yellow().bold());
    }
}

fn show_info(config: &SimConfig) -> Result<()> {
    let baud = baud_info(config).with_context(|| {
        format!(
            "{} baud cannot be generated from a {} Hz clock",
            config.port.baud_rate, config.clock_hz
        )
    })?;

    println!("{}", "Serial port".bold());
    println!("  Stream type:     {:?}", config.port.stream_type);
    println!("  Clock:           {} Hz", config.clock_hz);
    println!("  Baud rate:       {}", config.port.baud_rate);
    println!("  Divisor:         {}", baud.divisor);
    println!(
        "  Actual baud:     {:.1} ({:+.3}%)",
        baud.actual_baud, baud.error_percent
    );
    println!("  Cancel sentinel: {:#04x}", config.port.cancel_sentinel);
    println!("  IRQ priority:    {}", config.port.irq_priority);
    println!(
        "  Buffers:         rx {} / tx {} bytes",
        DEFAULT_RX_CAPACITY - 1,
        DEFAULT_TX_CAPACITY - 1
    );
    Ok(())
}
