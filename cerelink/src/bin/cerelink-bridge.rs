//! Standalone bridge daemon.
//!
//! Owns the instrument link of one instance, logs every bridge event to
//! stderr and exits when the link is lost.
//!
//! # Usage
//!
//! ```sh
//! cerelink-bridge --instance 0 --startup any-ip
//! ```

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use cerelink::bridge::{Bridge, BridgeConfig, BridgeError};
use cerelink::event::{Listener, Listeners, NetEvent};
use cerelink::net::{StartupOption, TransportConfig};
use cerelink::session::SessionNames;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("{0}")]
    Usage(String),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error("cannot remove stale shared memory: {0}")]
    Clean(#[from] cerelink::ipc::ShmError),
}

struct Options {
    config: BridgeConfig,
    clean: bool,
}

/// Prints events and remembers when the bridge closed.
struct StderrListener {
    closed: AtomicBool,
}

impl Listener for StderrListener {
    fn on_event(&self, event: &NetEvent) {
        eprintln!("cerelink-bridge: {event}");
        if *event == NetEvent::Close {
            self.closed.store(true, Ordering::Relaxed);
        }
    }
}

fn main() {
    cerelink::init_tracing();
    if let Err(e) = run() {
        eprintln!("cerelink-bridge: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), CliError> {
    let args: Vec<String> = std::env::args().collect();
    let Some(options) = parse_args(&args)? else {
        print_usage();
        return Ok(());
    };

    if options.clean {
        SessionNames::for_instance(options.config.instance)?.unlink_all()?;
    }

    let listener = Arc::new(StderrListener {
        closed: AtomicBool::new(false),
    });
    let mut listeners = Listeners::new();
    listeners.add(listener.clone());

    let bridge = Bridge::spawn(options.config, listeners)?;
    eprintln!("cerelink-bridge: running as {:?}", bridge.role());

    while !listener.closed.load(Ordering::Relaxed) && !bridge.is_finished() {
        std::thread::sleep(Duration::from_millis(100));
    }

    bridge.shutdown();
    eprintln!("cerelink-bridge: stopped");
    Ok(())
}

/// Parses command line arguments. `None` means help was requested.
fn parse_args(args: &[String]) -> Result<Option<Options>, CliError> {
    let mut instance = 0;
    let mut in_addr: Option<Ipv4Addr> = None;
    let mut in_port = None;
    let mut out_addr: Option<Ipv4Addr> = None;
    let mut out_port = None;
    let mut startup = StartupOption::None;
    let mut recv_buffer = None;
    let mut high_latency = false;
    let mut clean = false;

    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        let mut value = || {
            i += 1;
            args.get(i)
                .map(String::as_str)
                .ok_or_else(|| CliError::Usage(format!("missing value for {flag}")))
        };
        match flag {
            "--instance" | "-n" => instance = parse(flag, value()?)?,
            "--in-addr" => in_addr = Some(parse(flag, value()?)?),
            "--in-port" => in_port = Some(parse(flag, value()?)?),
            "--out-addr" => out_addr = Some(parse(flag, value()?)?),
            "--out-port" => out_port = Some(parse(flag, value()?)?),
            "--startup" => startup = parse_startup(value()?)?,
            "--recv-buffer" => recv_buffer = Some(parse(flag, value()?)?),
            "--high-latency" => high_latency = true,
            "--clean" => clean = true,
            "--help" | "-h" => return Ok(None),
            arg => return Err(CliError::Usage(format!("unknown argument: {arg}"))),
        }
        i += 1;
    }

    let mut config = BridgeConfig::for_instance(instance);
    let transport: &mut TransportConfig = &mut config.transport;
    transport.startup = startup;
    if let Some(addr) = in_addr {
        transport.in_addr = addr;
    }
    if let Some(port) = in_port {
        transport.in_port = port;
    }
    if let Some(addr) = out_addr {
        transport.out_addr = addr;
    }
    if let Some(port) = out_port {
        transport.out_port = port;
    }
    if let Some(bytes) = recv_buffer {
        transport.recv_buffer_size = bytes;
    }
    config.dispatcher.high_latency = high_latency;

    Ok(Some(Options { config, clean }))
}

fn parse<T>(flag: &str, value: &str) -> Result<T, CliError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| CliError::Usage(format!("invalid value `{value}` for {flag}: {e}")))
}

fn parse_startup(value: &str) -> Result<StartupOption, CliError> {
    match value {
        "none" => Ok(StartupOption::None),
        "any-ip" => Ok(StartupOption::AnyIp),
        "loopback" => Ok(StartupOption::Loopback),
        "local" => Ok(StartupOption::Local),
        "reuse" => Ok(StartupOption::Reuse),
        other => Err(CliError::Usage(format!("unknown startup option: {other}"))),
    }
}

fn print_usage() {
    eprintln!(
        r#"cerelink-bridge - instrument network bridge

USAGE:
    cerelink-bridge [OPTIONS]

OPTIONS:
    -n, --instance <N>       Instrument connection index (default: 0)
        --in-addr <IP>       Local address the instrument sends to
        --in-port <PORT>     Local port (default: 51002)
        --out-addr <IP>      Instrument address (default: 192.168.137.128)
        --out-port <PORT>    Instrument port (default: 51001)
        --startup <OPT>      none | any-ip | loopback | local | reuse
        --recv-buffer <N>    Kernel receive buffer in bytes, 0 to skip the check
        --high-latency       Use the high-latency command timing
        --clean              Remove shared memory left by a crashed bridge
    -h, --help               Print this help message

EXAMPLE:
    cerelink-bridge --instance 1 --startup loopback
"#
    );
}
