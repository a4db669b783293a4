//! usb-xfer
//!
//! Command line front end for the host transfer engine. Runs one transfer or
//! device operation against a USB device and prints the outcome as JSON.

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use common::{Completion, CompletionReceiver, completion_channel, setup_logging};
use host::config::HostConfig;
use host::usb::{SimResponse, SimulatedController};
use host::{CallbackRegistry, DeviceToken, HostController, LibusbController, UsbHost};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use usbproto::{EndpointAddress, IsoBuffer, SetupPacket, TransferKind, TransferResult};

/// Extra time granted to an async completion beyond the transfer timeout
const COMPLETION_GRACE: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(name = "usb-xfer")]
#[command(author, version, about = "Run USB transfers against a device")]
#[command(long_about = "
Run control, bulk, interrupt and isochronous transfers against a USB device,
synchronously or through the asynchronous completion path.

EXAMPLES:
    # Read the device descriptor
    usb-xfer --device 1234:5678 control 0x80 0x06 0x0100 0 18

    # Bulk write, completed asynchronously
    usb-xfer --device 1234:5678 bulk 0x02 --data 01020304 --async

    # Isochronous read of 8 packets against the simulated controller
    usb-xfer --simulate iso 0x81 --packets 8

CONFIGURATION:
    Configuration files are looked up in the following order:
    1. Path specified with --config
    2. ~/.config/usb-xfer/host.toml
    3. /etc/usb-xfer/host.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Target device as VID:PID in hex
    #[arg(short, long, value_name = "VID:PID", value_parser = parse_device_id)]
    device: Option<(u16, u16)>,

    /// Use the simulated host controller instead of libusb
    #[arg(long)]
    simulate: bool,

    /// Transfer timeout in milliseconds (defaults to the configured value)
    #[arg(short, long, value_name = "MS")]
    timeout: Option<u32>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Control transfer
    Control {
        #[arg(value_parser = parse_u8)]
        request_type: u8,
        #[arg(value_parser = parse_u8)]
        request: u8,
        #[arg(value_parser = parse_u16)]
        value: u16,
        #[arg(value_parser = parse_u16)]
        index: u16,
        /// wLength; defaults to the data length, or the configured control buffer size for IN
        #[arg(value_parser = parse_u16)]
        length: Option<u16>,
        /// Data stage for host-to-device requests, in hex
        #[arg(long, value_parser = parse_hex)]
        data: Option<Vec<u8>>,
        /// Complete through the asynchronous path
        #[arg(long = "async")]
        asynchronous: bool,
    },
    /// Bulk transfer
    Bulk {
        #[arg(value_parser = parse_endpoint)]
        endpoint: EndpointAddress,
        /// Bytes to read from an IN endpoint
        #[arg(long, default_value_t = 64)]
        length: usize,
        /// Payload for an OUT endpoint, in hex
        #[arg(long, value_parser = parse_hex)]
        data: Option<Vec<u8>>,
        #[arg(long = "async")]
        asynchronous: bool,
    },
    /// Interrupt transfer
    Interrupt {
        #[arg(value_parser = parse_endpoint)]
        endpoint: EndpointAddress,
        #[arg(long, default_value_t = 8)]
        length: usize,
        #[arg(long, value_parser = parse_hex)]
        data: Option<Vec<u8>>,
        #[arg(long = "async")]
        asynchronous: bool,
    },
    /// Isochronous transfer (always asynchronous)
    Iso {
        #[arg(value_parser = parse_endpoint)]
        endpoint: EndpointAddress,
        /// Number of packets (defaults to the configured value)
        #[arg(long)]
        packets: Option<usize>,
        /// Packet size when the endpoint reports none
        #[arg(long)]
        packet_size: Option<usize>,
    },
    /// Reset the device
    Reset,
    /// Clear a halt/stall condition on an endpoint
    ClearStall {
        #[arg(value_parser = parse_endpoint)]
        endpoint: EndpointAddress,
    },
}

/// Outcome of one command, printed as JSON
#[derive(Debug, Serialize)]
struct Report {
    operation: String,
    device: String,
    asynchronous: bool,
    /// Bytes transferred, or a negative error code
    status: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<String>,
}

impl Report {
    fn new(operation: impl Into<String>, token: DeviceToken, asynchronous: bool) -> Self {
        Self {
            operation: operation.into(),
            device: token.to_string(),
            asynchronous,
            status: 0,
            error: None,
            data: None,
        }
    }

    fn with_result(mut self, result: TransferResult) -> Self {
        match result {
            Ok(n) => self.status = n as i64,
            Err(e) => {
                self.status = i64::from(e.code());
                self.error = Some(e.to_string());
            }
        }
        self
    }

    fn with_error(mut self, error: &common::Error) -> Self {
        self.status = i64::from(error.code());
        self.error = Some(error.to_string());
        self
    }

    fn with_data(mut self, data: Option<&[u8]>) -> Self {
        self.data = data.map(to_hex);
        self
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle --save-config flag early (before loading config)
    if args.save_config {
        let config = HostConfig::default();
        let path = HostConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        HostConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        HostConfig::load_or_default(None)
    };

    // Use CLI log level if specified, otherwise use config value
    let log_level = args.log_level.as_deref().unwrap_or(&config.logging.level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("usb-xfer v{}", env!("CARGO_PKG_VERSION"));

    let Some(command) = args.command.clone() else {
        bail!("No command given, see --help");
    };

    if args.simulate {
        let controller = SimulatedController::new();
        let device = controller.device(1);
        script_simulation(&controller, &device, &command, &config);

        let host = Arc::new(UsbHost::new(controller).with_poll_interval(config.events.poll_interval()));
        let token = host.adopt(device);
        return run(host, token, command, &args, &config).await;
    }

    let (vendor_id, product_id) = args
        .device
        .ok_or_else(|| anyhow!("--device VID:PID is required unless --simulate is given"))?;

    let controller = LibusbController::new().context("Failed to initialize libusb")?;
    let host = Arc::new(UsbHost::new(controller).with_poll_interval(config.events.poll_interval()));
    let token = host
        .open(vendor_id, product_id)
        .with_context(|| format!("Failed to open device {:04x}:{:04x}", vendor_id, product_id))?;

    run(host, token, command, &args, &config).await
}

async fn run<C: HostController>(
    host: Arc<UsbHost<C>>,
    token: DeviceToken,
    command: Command,
    args: &Args,
    config: &HostConfig,
) -> Result<()> {
    host.initialize(&CallbackRegistry::standard())
        .context("Failed to initialize completion callbacks")?;

    if config.events.auto_start_pump || is_async(&command) {
        host.start_event_pump().context("Failed to start event pump")?;
    }

    let timeout_ms = args.timeout.unwrap_or(config.transfers.default_timeout_ms);
    let report = execute(&host, token, command, timeout_ms, config).await?;

    println!("{}", serde_json::to_string_pretty(&report)?);

    host.stop_event_pump();
    if let Err(e) = host.close(token) {
        debug!("Close of {} failed: {}", token, e);
    }
    Ok(())
}

fn is_async(command: &Command) -> bool {
    match command {
        Command::Control { asynchronous, .. }
        | Command::Bulk { asynchronous, .. }
        | Command::Interrupt { asynchronous, .. } => *asynchronous,
        Command::Iso { .. } => true,
        Command::Reset | Command::ClearStall { .. } => false,
    }
}

async fn execute<C: HostController>(
    host: &Arc<UsbHost<C>>,
    token: DeviceToken,
    command: Command,
    timeout_ms: u32,
    config: &HostConfig,
) -> Result<Report> {
    let report = match command {
        Command::Control {
            request_type,
            request,
            value,
            index,
            length,
            data,
            asynchronous,
        } => {
            let setup = control_setup(request_type, request, value, index, length, data.as_deref(), config)?;
            let mut buffer = data.unwrap_or_else(|| vec![0u8; setup.length as usize]);
            buffer.resize(setup.length as usize, 0);
            let report = Report::new("control", token, asynchronous);

            if asynchronous {
                let (sender, receiver) = completion_channel();
                match host.submit_control_async(token, Arc::new(sender), setup, &buffer, 0, timeout_ms) {
                    Ok(()) => completed(report, &receiver, timeout_ms).await?,
                    Err(e) => report.with_error(&e),
                }
            } else {
                match host.control_transfer(token, setup, &mut buffer, 0, timeout_ms) {
                    Ok(n) => {
                        let received = setup.direction() == usbproto::Direction::In;
                        report
                            .with_result(Ok(n))
                            .with_data(received.then(|| &buffer[..n]))
                    }
                    Err(e) => report.with_error(&e),
                }
            }
        }
        Command::Bulk {
            endpoint,
            length,
            data,
            asynchronous,
        } => stream(host, token, TransferKind::Bulk, endpoint, length, data, asynchronous, timeout_ms).await?,
        Command::Interrupt {
            endpoint,
            length,
            data,
            asynchronous,
        } => {
            stream(host, token, TransferKind::Interrupt, endpoint, length, data, asynchronous, timeout_ms)
                .await?
        }
        Command::Iso {
            endpoint,
            packets,
            packet_size,
        } => {
            let packets = packets.unwrap_or(config.isochronous.default_packets);
            let packet_size = packet_size.or(config.isochronous.packet_size);
            let iso = host
                .allocate_isochronous(token, endpoint, packets, packet_size)
                .context("Failed to allocate isochronous transfer")?;
            let buffer = IsoBuffer::new(iso.required_capacity());
            let (sender, receiver) = completion_channel();
            let report = Report::new("isochronous", token, true);

            match host.submit_isochronous_async(&iso, Arc::new(sender), buffer, timeout_ms) {
                Ok(()) => completed(report, &receiver, timeout_ms).await?,
                Err(e) => report.with_error(&e),
            }
        }
        Command::Reset => {
            let report = Report::new("reset", token, false);
            match host.reset_device(token) {
                Ok(()) => report,
                Err(e) => report.with_error(&e),
            }
        }
        Command::ClearStall { endpoint } => {
            let report = Report::new(format!("clear-stall {}", endpoint), token, false);
            match host.clear_stall(token, endpoint) {
                Ok(()) => report,
                Err(e) => report.with_error(&e),
            }
        }
    };

    Ok(report)
}

/// Bulk or interrupt transfer in either direction
#[allow(clippy::too_many_arguments)]
async fn stream<C: HostController>(
    host: &Arc<UsbHost<C>>,
    token: DeviceToken,
    kind: TransferKind,
    endpoint: EndpointAddress,
    length: usize,
    data: Option<Vec<u8>>,
    asynchronous: bool,
    timeout_ms: u32,
) -> Result<Report> {
    let mut buffer = match (endpoint.is_in(), data) {
        (true, _) => vec![0u8; length],
        (false, Some(data)) => data,
        (false, None) => bail!("--data is required for OUT endpoint {}", endpoint),
    };
    let length = buffer.len();
    let report = Report::new(format!("{} {}", kind, endpoint), token, asynchronous);

    if asynchronous {
        let (sender, receiver) = completion_channel();
        let submitted = match kind {
            TransferKind::Interrupt => {
                host.submit_interrupt_async(token, Arc::new(sender), endpoint, &buffer, 0, length, timeout_ms)
            }
            _ => host.submit_bulk_async(token, Arc::new(sender), endpoint, &buffer, 0, length, timeout_ms),
        };
        return match submitted {
            Ok(()) => completed(report, &receiver, timeout_ms).await,
            Err(e) => Ok(report.with_error(&e)),
        };
    }

    let result = match kind {
        TransferKind::Interrupt => host.interrupt_transfer(token, endpoint, &mut buffer, 0, length, timeout_ms),
        _ => host.bulk_transfer(token, endpoint, &mut buffer, 0, length, timeout_ms),
    };

    Ok(match result {
        Ok(n) => report
            .with_result(Ok(n))
            .with_data(endpoint.is_in().then(|| &buffer[..n])),
        Err(e) => report.with_error(&e),
    })
}

/// Wait for the completion of an accepted submission
async fn completed(report: Report, receiver: &CompletionReceiver, timeout_ms: u32) -> Result<Report> {
    let wait = Duration::from_millis(u64::from(timeout_ms)) + COMPLETION_GRACE;
    let completion: Completion = tokio::time::timeout(wait, receiver.recv())
        .await
        .map_err(|_| anyhow!("No completion delivered within {:?}", wait))?
        .context("Completion channel closed")?;

    debug!("Received {} completion", completion.kind());
    let data = completion.data();
    Ok(report.with_result(completion.result()).with_data(data.as_deref()))
}

fn control_setup(
    request_type: u8,
    request: u8,
    value: u16,
    index: u16,
    length: Option<u16>,
    data: Option<&[u8]>,
    config: &HostConfig,
) -> Result<SetupPacket> {
    let length = match (length, data) {
        (Some(length), _) => length,
        (None, Some(data)) => u16::try_from(data.len()).context("Control data stage too long")?,
        (None, None) if request_type & usbproto::DIRECTION_MASK != 0 => {
            u16::try_from(config.transfers.control_buffer_size).context("Control buffer too large")?
        }
        (None, None) => 0,
    };
    Ok(SetupPacket::new(request_type, request, value, index, length))
}

/// Give the simulated device something to answer with
fn script_simulation(
    controller: &SimulatedController,
    device: &host::usb::SimDevice,
    command: &Command,
    config: &HostConfig,
) {
    let pattern = |len: usize| (0..len).map(|i| i as u8).collect::<Vec<u8>>();

    match command {
        Command::Control {
            request_type,
            length,
            ..
        } if request_type & usbproto::DIRECTION_MASK != 0 => {
            let len = length.map_or(config.transfers.control_buffer_size, usize::from);
            let payload = common::test_utils::create_mock_device_descriptor();
            let payload = if len >= payload.len() { payload } else { pattern(len) };
            controller.script(device, EndpointAddress(0x80), SimResponse::Data(payload));
        }
        Command::Bulk { endpoint, length, .. } | Command::Interrupt { endpoint, length, .. }
            if endpoint.is_in() =>
        {
            controller.script(device, *endpoint, SimResponse::Data(pattern(*length)));
        }
        Command::Iso {
            endpoint,
            packets,
            packet_size,
        } => {
            let size = packet_size.or(config.isochronous.packet_size).unwrap_or(64);
            let packets = packets.unwrap_or(config.isochronous.default_packets);
            controller.set_max_iso_packet_size(device, *endpoint, size);
            controller.script(device, *endpoint, SimResponse::Iso(vec![size as u32; packets]));
        }
        _ => {}
    }
}

fn parse_number(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid number '{}': {}", s, e))
}

fn parse_u8(s: &str) -> Result<u8, String> {
    u8::try_from(parse_number(s)?).map_err(|_| format!("'{}' does not fit in 8 bits", s))
}

fn parse_u16(s: &str) -> Result<u16, String> {
    u16::try_from(parse_number(s)?).map_err(|_| format!("'{}' does not fit in 16 bits", s))
}

fn parse_endpoint(s: &str) -> Result<EndpointAddress, String> {
    parse_u8(s).map(EndpointAddress)
}

fn parse_device_id(s: &str) -> Result<(u16, u16), String> {
    let (vid, pid) = s
        .split_once(':')
        .ok_or_else(|| format!("invalid device '{}', expected VID:PID", s))?;
    let hex = |part: &str| {
        let part = part.trim_start_matches("0x").trim_start_matches("0X");
        u16::from_str_radix(part, 16).map_err(|e| format!("invalid id '{}': {}", part, e))
    };
    Ok((hex(vid)?, hex(pid)?))
}

fn parse_hex(s: &str) -> Result<Vec<u8>, String> {
    let digits: String = s.chars().filter(|c| !c.is_whitespace() && *c != ':').collect();
    if let Some(bad) = digits.chars().find(|c| !c.is_ascii_hexdigit()) {
        return Err(format!("invalid hex digit '{}' in '{}'", bad, s));
    }
    if digits.len() % 2 != 0 {
        return Err(format!("odd number of hex digits in '{}'", s));
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16).map_err(|e| format!("invalid hex '{}': {}", s, e))
        })
        .collect()
}

fn to_hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_numbers() {
        assert_eq!(parse_u8("0x80"), Ok(0x80));
        assert_eq!(parse_u8("6"), Ok(6));
        assert!(parse_u8("0x100").is_err());
        assert_eq!(parse_u16("0x0100"), Ok(0x100));
    }

    #[test]
    fn test_parse_device_id() {
        assert_eq!(parse_device_id("1234:abcd"), Ok((0x1234, 0xabcd)));
        assert_eq!(parse_device_id("0x1234:0x5678"), Ok((0x1234, 0x5678)));
        assert!(parse_device_id("1234").is_err());
    }

    #[test]
    fn test_hex_roundtrip() {
        assert_eq!(parse_hex("01020304"), Ok(vec![1, 2, 3, 4]));
        assert_eq!(parse_hex("de:ad"), Ok(vec![0xde, 0xad]));
        assert!(parse_hex("abc").is_err());
        assert!(parse_hex("aéb").is_err());
        assert!(parse_hex("zz").is_err());
        assert_eq!(to_hex(&[0xde, 0xad, 0x01]), "dead01");
    }

    #[test]
    fn test_control_setup_length() {
        let config = HostConfig::default();
        let setup = control_setup(0x80, 0x06, 0x0100, 0, None, None, &config).unwrap();
        assert_eq!(setup.length, 256);

        let setup = control_setup(0x21, 0x09, 0, 0, None, Some(&[1, 2, 3]), &config).unwrap();
        assert_eq!(setup.length, 3);

        let setup = control_setup(0x80, 0x06, 0x0100, 0, Some(18), None, &config).unwrap();
        assert_eq!(setup.length, 18);
    }

    fn simulated(command: &Command, config: &HostConfig) -> (Arc<UsbHost<SimulatedController>>, DeviceToken) {
        let controller = SimulatedController::new();
        let device = controller.device(1);
        script_simulation(&controller, &device, command, config);

        let host = Arc::new(UsbHost::new(controller).with_poll_interval(Duration::from_millis(10)));
        host.initialize(&CallbackRegistry::standard()).unwrap();
        let token = host.adopt(device);
        (host, token)
    }

    #[tokio::test]
    async fn test_simulated_control_in_returns_descriptor() {
        let config = HostConfig::default();
        let descriptor = to_hex(&common::test_utils::create_mock_device_descriptor());

        for asynchronous in [false, true] {
            let command = Command::Control {
                request_type: 0x80,
                request: 0x06,
                value: 0x0100,
                index: 0,
                length: Some(18),
                data: None,
                asynchronous,
            };
            let (host, token) = simulated(&command, &config);
            if asynchronous {
                host.start_event_pump().unwrap();
            }

            let report = execute(&host, token, command, 1000, &config).await.unwrap();
            host.stop_event_pump();

            assert_eq!(report.status, 18, "asynchronous={}", asynchronous);
            assert_eq!(report.error, None);
            assert_eq!(report.data.as_deref(), Some(descriptor.as_str()));
        }
    }

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from(["usb-xfer", "--simulate", "bulk", "0x81", "--length", "16", "--async"])
            .unwrap();
        assert!(args.simulate);
        assert!(matches!(
            args.command,
            Some(Command::Bulk { endpoint: EndpointAddress(0x81), length: 16, asynchronous: true, .. })
        ));
    }
}
