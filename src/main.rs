//! cmdlink relay
//!
//! Runs a command server on TCP and, when given a serial port, bridges it
//! to the microcontroller: every device command is broadcast to the TCP
//! clients and every client command is forwarded to the device.

use cmdlink::server::{ConnectionServer, ServerConfig, ServerEvent};
use cmdlink::transport::{BaudRate, SerialTransport};
use cmdlink::{Connection, ConnectionConfig, ConnectionEvent};
use serialport::SerialPortType;
use std::net::SocketAddr;
use tokio::signal;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Relay configuration
struct Config {
    /// Host to bind to
    host: String,
    /// Port to listen on
    port: u16,
    /// Shared secret for both the device and the TCP clients
    password: String,
    /// Serial port of the device, if any
    serial: Option<String>,
    /// Serial baud rate
    baud: BaudRate,
    /// Print the available serial ports and exit
    list_ports: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: cmdlink::DEFAULT_HOST.to_string(),
            port: cmdlink::DEFAULT_PORT,
            password: cmdlink::connection::DEFAULT_PASSWORD.to_string(),
            serial: None,
            baud: BaudRate::default(),
            list_ports: false,
        }
    }
}

impl Config {
    /// Parse configuration from command-line arguments
    fn from_args() -> Self {
        let mut config = Config::default();
        let args: Vec<String> = std::env::args().collect();

        let mut i = 1;
        while i < args.len() {
            let flag = args[i].as_str();
            match flag {
                "--host" | "-h" => {
                    config.host = value_of(&args, i).to_string();
                    i += 1;
                }
                "--port" | "-p" => {
                    config.port = value_of(&args, i).parse().unwrap_or_else(|_| {
                        eprintln!("Error: invalid port number");
                        std::process::exit(1);
                    });
                    i += 1;
                }
                "--password" => {
                    config.password = value_of(&args, i).to_string();
                    i += 1;
                }
                "--serial" | "-s" => {
                    config.serial = Some(value_of(&args, i).to_string());
                    i += 1;
                }
                "--baud" | "-b" => {
                    config.baud = value_of(&args, i).parse().unwrap_or_else(|e| {
                        eprintln!("Error: {}", e);
                        std::process::exit(1);
                    });
                    i += 1;
                }
                "--list-ports" | "-l" => config.list_ports = true,
                "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "--version" | "-v" => {
                    println!("cmdlink version {}", cmdlink::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {}", flag);
                    print_help();
                    std::process::exit(1);
                }
            }
            i += 1;
        }

        config
    }

    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.host.clone(),
            port: self.port,
            password: self.password.clone(),
            ..ServerConfig::default()
        }
    }
}

/// Returns the value following the flag at `i`, or exits.
fn value_of(args: &[String], i: usize) -> &str {
    match args.get(i + 1) {
        Some(value) => value,
        None => {
            eprintln!("Error: {} requires a value", args[i]);
            std::process::exit(1);
        }
    }
}

fn print_help() {
    let rates: Vec<String> = BaudRate::ALL.iter().map(|r| r.to_string()).collect();
    println!(
        r#"
cmdlink - Framed command relay for microcontrollers

USAGE:
    cmdlink [OPTIONS]

OPTIONS:
    -h, --host <HOST>          Host to bind to (default: {host})
    -p, --port <PORT>          Port to listen on (default: {port})
        --password <SECRET>    Shared secret for the handshake
    -s, --serial <PATH>        Serial port of the device to relay
    -b, --baud <RATE>          Serial baud rate (default: 115200)
                               one of: {rates}
    -l, --list-ports           List available serial ports and exit
    -v, --version              Print version information
        --help                 Print this help message

EXAMPLES:
    cmdlink                                  # Server only, on 0.0.0.0:8888
    cmdlink --serial /dev/ttyACM0            # Relay an Arduino to TCP clients
    cmdlink -s COM3 -b 57600 --port 9000
    cmdlink --list-ports                     # Find the device's port

LOGGING:
    Set RUST_LOG to change verbosity, e.g. RUST_LOG=cmdlink=trace
"#,
        host = cmdlink::DEFAULT_HOST,
        port = cmdlink::DEFAULT_PORT,
        rates = rates.join(", "),
    );
}

fn print_banner(config: &Config, addr: SocketAddr) {
    println!(
        r#"
cmdlink v{} - Framed command relay
──────────────────────────────────────────
Listening on {}
Device:      {}

Use Ctrl+C to shutdown gracefully.
"#,
        cmdlink::VERSION,
        addr,
        match &config.serial {
            Some(path) => format!("{} @ {} baud", path, config.baud),
            None => "none (server only)".to_string(),
        }
    );
}

/// Prints the serial ports the system reports.
fn print_ports() -> anyhow::Result<()> {
    let ports = SerialTransport::available_ports()?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        match port.port_type {
            SerialPortType::UsbPort(usb) => println!(
                "{}  USB {:04x}:{:04x} {}",
                port.port_name,
                usb.vid,
                usb.pid,
                usb.product.unwrap_or_default()
            ),
            SerialPortType::BluetoothPort => println!("{}  Bluetooth", port.port_name),
            SerialPortType::PciPort => println!("{}  PCI", port.port_name),
            SerialPortType::Unknown => println!("{}", port.port_name),
        }
    }
    Ok(())
}

/// Waits for the next device event; pends forever when no device is attached.
async fn next_device_event(
    events: &mut Option<UnboundedReceiver<ConnectionEvent>>,
) -> Option<ConnectionEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command-line arguments
    let config = Config::from_args();

    if config.list_ports {
        return print_ports();
    }

    // Set up logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    let mut server = ConnectionServer::new(config.server_config());
    let mut server_events = server.subscribe();
    let addr = server.start().await?;

    print_banner(&config, addr);

    let mut device = Connection::new(ConnectionConfig {
        password: config.password.clone(),
        ..ConnectionConfig::default()
    });
    let mut device_events = match &config.serial {
        Some(path) => {
            let events = device.subscribe();
            device.connect_serial(path, config.baud)?;
            info!(port = %path, baud = %config.baud, "Connecting to device");
            Some(events)
        }
        None => None,
    };

    let shutdown = signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                result?;
                info!("Shutdown signal received, stopping relay...");
                break;
            }
            event = server_events.recv() => match event {
                Some(ServerEvent::Command { client_id, command }) => {
                    if device_events.is_none() {
                        debug!(client_id, command = %command, "No device attached, dropped");
                    } else if let Err(e) = device.send(&command).await {
                        warn!(client_id, error = %e, "Failed to forward command to device");
                    }
                }
                Some(ServerEvent::ClientConnected(id)) => info!(client_id = id, "Client joined"),
                Some(ServerEvent::ClientDisconnected(id)) => info!(client_id = id, "Client left"),
                Some(ServerEvent::Error { client_id, message }) => {
                    warn!(client_id, error = %message, "Client error")
                }
                Some(ServerEvent::Stopped) | None => break,
            },
            event = next_device_event(&mut device_events) => match event {
                Some(ConnectionEvent::Command(command)) => {
                    let reached = server.broadcast(&command);
                    debug!(command = %command, clients = reached, "Relayed device command");
                }
                Some(ConnectionEvent::Connected) => info!("Device authenticated"),
                Some(ConnectionEvent::Error(message)) => warn!(error = %message, "Device error"),
                Some(ConnectionEvent::Disconnected) | None => {
                    warn!("Device disconnected");
                    device_events = None;
                }
            },
        }
    }

    device.close().await;
    if server.is_running() {
        server.stop().await?;
    }

    info!("Relay shutdown complete");
    Ok(())
}
