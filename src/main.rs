// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use clap::{Parser, Subcommand};
use serialport::{DataBits, Parity, StopBits};
use beeblink::diag::DiagnosticDispatcher;
use beeblink::protocol::{REQUEST_ECHO_DATA, RESPONSE_DATA};
use beeblink::{serve_ports, CancelFlag, Client, LinkConfig, LinkError, RealSerialPort, RequestError, Transport};

#[derive(Parser)]
#[command(name = "beeblink")]
#[command(about = "BeebLink serial link endpoint", long_about = None)]
#[command(disable_help_subcommand = true)]
struct Cli {
    /// Serial port to use (e.g., /dev/ttyUSB0 or COM1). Repeat to serve
    /// several links.
    #[arg(short, long, required = true)]
    port: Vec<String>,

    /// Baud rate
    #[arg(short, long, default_value = "115200")]
    baud: u32,

    /// Data bits (5, 6, 7, or 8)
    #[arg(long, default_value = "8", value_name="BITS")]
    data_bits: u8,

    /// Parity (none, odd, or even)
    #[arg(long, default_value = "none")]
    parity: String,

    /// Stop bits (1 or 2)
    #[arg(long, default_value = "1", value_name="BITS")]
    stop_bits: u8,

    /// How long one byte of a frame may take
    #[arg(long, default_value = "1000", value_name = "MS")]
    byte_timeout_ms: u64,

    /// How long to wait for a response to start (0 waits forever)
    #[arg(long, default_value = "30000", value_name = "MS")]
    response_timeout_ms: u64,

    /// Upper bound on one resync attempt
    #[arg(long, default_value = "5000", value_name = "MS")]
    sync_timeout_ms: u64,

    /// Resync attempts before the link is reported down
    #[arg(long, default_value = "3", value_name = "N")]
    sync_retries: u32,

    /// Enable debug output
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve requests with the diagnostic service
    Serve,
    /// Send a presence probe, then check the server's link is ready
    Probe,
    /// Round-trip echo requests and check the data comes back intact
    Echo {
        /// Payload size in bytes
        #[arg(short, long, default_value = "256")]
        size: usize,
        /// Number of requests
        #[arg(short, long, default_value = "1")]
        count: u32,
    },
    /// Force a resync of the link
    Sync,
}

fn parse_data_bits(bits: u8) -> Result<DataBits, String> {
    match bits {
        5 => Ok(DataBits::Five),
        6 => Ok(DataBits::Six),
        7 => Ok(DataBits::Seven),
        8 => Ok(DataBits::Eight),
        _ => Err(format!("Invalid data bits: {}. Must be 5, 6, 7, or 8", bits)),
    }
}

fn parse_parity(parity: &str) -> Result<Parity, String> {
    match parity.to_lowercase().as_str() {
        "none" => Ok(Parity::None),
        "odd" => Ok(Parity::Odd),
        "even" => Ok(Parity::Even),
        _ => Err(format!("Invalid parity: {}. Must be 'none', 'odd', or 'even'", parity)),
    }
}

fn parse_stop_bits(bits: u8) -> Result<StopBits, String> {
    match bits {
        1 => Ok(StopBits::One),
        2 => Ok(StopBits::Two),
        _ => Err(format!("Invalid stop bits: {}. Must be 1 or 2", bits)),
    }
}

fn link_config(cli: &Cli) -> Result<LinkConfig, String> {
    let config = LinkConfig {
        byte_timeout: Duration::from_millis(cli.byte_timeout_ms),
        response_timeout: match cli.response_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        },
        sync_timeout: Duration::from_millis(cli.sync_timeout_ms),
        max_sync_attempts: cli.sync_retries,
        ..LinkConfig::default()
    };
    config.validate()?;
    Ok(config)
}

struct PortSettings {
    baud: u32,
    data_bits: DataBits,
    parity: Parity,
    stop_bits: StopBits,
    write_timeout: Duration,
}

impl PortSettings {
    fn open(&self, name: &str) -> RealSerialPort {
        match RealSerialPort::open(name, self.baud, self.data_bits, self.parity, self.stop_bits, self.write_timeout) {
            Ok(port) => port,
            Err(e) => {
                eprintln!("Failed to open serial port {}: {}", name, e);
                std::process::exit(1);
            }
        }
    }
}

fn exit_on_error<T>(result: Result<T, String>) -> T {
    match result {
        Ok(value) => value,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.debug { tracing::Level::DEBUG } else { tracing::Level::INFO };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let settings = PortSettings {
        baud: cli.baud,
        data_bits: exit_on_error(parse_data_bits(cli.data_bits)),
        parity: exit_on_error(parse_parity(&cli.parity)),
        stop_bits: exit_on_error(parse_stop_bits(cli.stop_bits)),
        write_timeout: Duration::from_millis(cli.byte_timeout_ms),
    };
    let config = exit_on_error(link_config(&cli));

    println!(
        "Settings: {} baud, {:?}, {:?}, {:?}",
        settings.baud, settings.data_bits, settings.parity, settings.stop_bits
    );

    if let Commands::Serve = cli.command {
        if let Err(e) = serve(&cli.port, &settings, &config) {
            eprintln!("Serve failed: {}", e);
            std::process::exit(1);
        }
        return;
    }

    if cli.port.len() > 1 {
        tracing::warn!("only serving commands use more than one port; using {}", cli.port[0]);
    }
    println!("Opening serial port: {}", cli.port[0]);
    let port = settings.open(&cli.port[0]);
    let mut client = Client::new(Box::new(port), config);

    match cli.command {
        Commands::Serve => {}
        Commands::Probe => {
            if let Err(e) = probe(&mut client) {
                eprintln!("Probe failed: {}", e);
                std::process::exit(1);
            }
        }
        Commands::Echo { size, count } => match echo(&mut client, size, count) {
            Ok(0) => println!("\nAll echoes matched"),
            Ok(mismatches) => {
                eprintln!("{} of {} echoes came back different", mismatches, count);
                std::process::exit(1);
            }
            Err(e) => {
                eprintln!("Echo failed: {}", e);
                std::process::exit(1);
            }
        },
        Commands::Sync => match client.resync() {
            Ok(attempts) => println!("Link synchronized after {} attempt(s)", attempts),
            Err(e) => {
                eprintln!("Sync failed: {}", e);
                std::process::exit(1);
            }
        },
    }
}

/// Serve every port on its own thread. Each link stays up on its own; the
/// command only ends once every port has failed.
fn serve(ports: &[String], settings: &PortSettings, config: &LinkConfig) -> Result<(), LinkError> {
    let dispatcher = Arc::new(Mutex::new(DiagnosticDispatcher::default()));
    let links: Vec<(String, Box<dyn Transport>)> = ports
        .iter()
        .map(|name| {
            println!("Serving on: {}", name);
            let port: Box<dyn Transport> = Box::new(settings.open(name));
            (name.clone(), port)
        })
        .collect();

    let mut first_error = None;
    for (name, result) in serve_ports(links, config, dispatcher, &CancelFlag::new()) {
        match result {
            Ok(stats) => tracing::info!(port = %name, ?stats, "link closed"),
            Err(e) => {
                tracing::warn!(port = %name, "link failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
    }

    first_error.map_or(Ok(()), Err)
}

fn probe(client: &mut Client) -> Result<(), RequestError> {
    client.probe_presence()?;
    let version = client.check_ready()?;
    println!("Link ready, protocol version {}", version);
    Ok(())
}

/// Returns the number of responses that did not match.
fn echo(client: &mut Client, size: usize, count: u32) -> Result<u32, RequestError> {
    let mut mismatches = 0;
    let start = Instant::now();

    for i in 0..count {
        let payload: Vec<u8> = (0..size).map(|n| (n as u32).wrapping_add(i) as u8).collect();
        let response = client.request(REQUEST_ECHO_DATA, payload.clone())?;
        if response.message_type() != RESPONSE_DATA || response.payload() != payload.as_slice() {
            tracing::warn!(request = i, "echo mismatch: got {} bytes", response.payload().len());
            mismatches += 1;
        }
    }

    let elapsed = start.elapsed();
    let bytes = 2 * size as u64 * count as u64;
    println!(
        "{} echoes of {} bytes in {:.2?} ({:.0} bytes/s)",
        count,
        size,
        elapsed,
        bytes as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    Ok(mismatches)
}
