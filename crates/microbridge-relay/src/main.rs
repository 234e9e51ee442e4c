use std::io::{self, BufRead, Write};
use std::net::{IpAddr, SocketAddr};

use clap::Parser;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use microbridge::{AdbListener, BridgeConfig, DispatchMode, MicroBridge};

/// Relay between a port-forwarded peripheral and this terminal
#[derive(Parser, Debug)]
#[command(name = "microbridge-relay", version = microbridge::VERSION)]
#[command(about = "Relay raw bytes between a port-forwarded peripheral and stdin/stdout", long_about = None)]
struct Args {
    /// TCP port the peripheral connects to
    #[arg(short, long, default_value_t = microbridge::DEFAULT_PORT)]
    port: u16,

    /// Address to bind
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Drop received chunks shorter than this many bytes
    #[arg(long, default_value_t = microbridge::MIN_PAYLOAD_LEN)]
    min_payload: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: Level,

    /// Log every connection lifecycle event
    #[arg(long)]
    debug: bool,

    /// Print payloads as hex instead of text
    #[arg(long)]
    hex: bool,

    /// Send stdin lines without a trailing newline
    #[arg(long)]
    no_newline: bool,
}

struct StdoutListener {
    hex: bool,
}

impl AdbListener for StdoutListener {
    fn adb_connected(&mut self) {
        info!("Peripheral connected");
    }

    fn adb_disconnected(&mut self) {
        info!("Peripheral disconnected");
    }

    fn adb_event(&mut self, data: &[u8]) {
        let mut out = io::stdout().lock();
        let _ = writeln!(out, "{}", format_payload(data, self.hex));
        let _ = out.flush();
    }

    fn server_started(&mut self, local_addr: SocketAddr) {
        info!("Waiting for peripheral on {}", local_addr);
    }
}

fn format_payload(data: &[u8], hex: bool) -> String {
    if hex {
        hex::encode(data)
    } else {
        String::from_utf8_lossy(data).trim_end_matches(['\r', '\n']).to_string()
    }
}

fn outgoing_line(line: &str, newline: bool) -> bytes::Bytes {
    let mut out = bytes::BytesMut::with_capacity(line.len() + 1);
    out.extend_from_slice(line.as_bytes());
    if newline {
        out.extend_from_slice(b"\n");
    }
    out.freeze()
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(io::stderr)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let config = BridgeConfig {
        bind_ip: args.bind,
        port: args.port,
        min_payload_len: args.min_payload,
        dispatch: DispatchMode::Thread,
        debug: args.debug,
        ..BridgeConfig::default()
    };

    let bridge = MicroBridge::with_config(StdoutListener { hex: args.hex }, config)?;
    info!("MicroBridge {}", MicroBridge::version());

    // Unlike the library's best-effort `connect`, a relay that cannot bind has nothing to do.
    let local_addr = bridge.try_connect_on(args.port)?;
    info!("Relay listening on {}", local_addr);

    for line in io::stdin().lock().lines() {
        let line = line?;
        bridge.write(outgoing_line(&line, !args.no_newline));
    }

    info!("stdin closed; shutting down");
    bridge.stop();
    Ok(())
}
