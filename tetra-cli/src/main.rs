// tetra-cli -- control a TETRA radio terminal through its PEI.
//
// Usage:
//   tetra-cli list-devices
//   tetra-cli --device /dev/ttyACM0 bat
//   tetra-cli get-talkgroup
//   tetra-cli set-talkgroup DMO 2620001
//   tetra-cli send --ack-receive 1234567 Hello there
//   tetra-cli status 1234567 8002
//   tetra-cli trace-signal --scan-interval 10s -n 6
//   tetra-cli listen
//
// The device defaults to auto detection. Log output goes to stderr and is
// controlled with RUST_LOG (default: tetra_cli=info).

mod listen;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tetra_core::{Identity, MessageReference, ReportRequest, cancel_after};
use tetra_pei::commands::{
    self, FixTime, OperatingMode, ROUTE_GROUP_MANAGEMENT, ROUTE_STATUS, SET_CHARSET_LATIN1,
    SWITCH_TO_SDS_TL, SWITCH_TO_STATUS, TalkgroupFolder,
};
use tetra_pei::sds::{self, TextEncoding};
use tetra_pei::{
    InitCommands, Initializer, NoInit, Pei, Radio, RadioBuilder, send_parts,
    send_with_acknowledgment,
};
use tetra_transport::list_serial_devices;

use crate::listen::ListenInit;

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// Control a TETRA radio terminal through its PEI.
#[derive(Parser)]
#[command(name = "tetra-cli", version, about)]
struct Cli {
    /// Serial communication device (`auto` or empty for auto detection).
    #[arg(long, global = true, default_value = "auto")]
    device: String,

    /// Baud rate of the serial device.
    #[arg(long, global = true, default_value_t = 38400)]
    baud: u32,

    /// Timeout for commands (e.g. 500ms, 5s, 1m).
    #[arg(
        long,
        alias = "commandTimeout",
        global = true,
        default_value = "5s",
        value_parser = parse_duration
    )]
    command_timeout: Duration,

    /// File to append the raw PEI communication to.
    #[arg(long = "trace-pei", global = true, hide = true)]
    trace_pei: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Read the current battery charge level.
    Bat,

    /// Read the radio device information.
    Info,

    /// Read the current message and notification routing settings.
    Routing,

    /// Set the operating mode and the talkgroup.
    SetTalkgroup {
        /// Operating mode: TMO or DMO.
        mode: String,
        /// Talkgroup to select (GTSI).
        gtsi: Option<String>,
    },

    /// Get the current operating mode and talkgroup.
    GetTalkgroup,

    /// Get all talkgroups for TMO and DMO as CSV list.
    Talkgroups,

    /// Trace the signal strength and the GPS position.
    TraceSignal {
        /// Time between two scans.
        #[arg(long, default_value = "30s", value_parser = parse_duration)]
        scan_interval: Duration,

        /// Number of scans, 0 = until Ctrl-C.
        #[arg(short = 'n', default_value_t = 0)]
        count: u32,
    },

    /// Send an SDS text message.
    Send(SendArgs),

    /// Send a status message.
    Status {
        /// Destination ISSI.
        destination: String,
        /// Status value in hex (e.g. 8002).
        status: String,
    },

    /// Listen for incoming text and status messages until Ctrl-C.
    Listen,

    /// List all active serial devices.
    #[command(alias = "list_devices")]
    ListDevices,
}

#[derive(Args)]
struct SendArgs {
    /// Destination ISSI.
    destination: String,

    /// Message text; several words are joined with spaces.
    #[arg(required = true, trailing_var_arg = true)]
    text: Vec<String>,

    /// Message reference used for delivery reports (1-255, 0 = random).
    #[arg(long, default_value_t = 0)]
    message_reference: u32,

    /// Immediately show the message at the receiver.
    #[arg(long)]
    immediate: bool,

    /// Request acknowledgment for receiving the message.
    #[arg(long)]
    ack_receive: bool,

    /// Request acknowledgment for consuming the message.
    #[arg(long)]
    ack_consume: bool,

    /// Use the simple text messaging protocol (no delivery reports possible).
    #[arg(long)]
    simple: bool,

    /// Text encoding: ISO8859-1 or UTF16.
    #[arg(long, default_value = "ISO8859-1")]
    encoding: String,

    /// Override the maximum PDU length reported by the radio, in bits.
    #[arg(long)]
    max_pdu_bits: Option<usize>,
}

/// Parse `500ms`, `5s`, `2m`, `1h` or a plain number of seconds.
fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (value, unit) = s.split_at(split);
    let value: f64 = value
        .parse()
        .map_err(|_| format!("invalid duration: {s:?}"))?;
    let seconds = match unit {
        "ms" => value / 1000.0,
        "" | "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        _ => return Err(format!("invalid duration unit in {s:?}")),
    };
    Duration::try_from_secs_f64(seconds).map_err(|e| format!("invalid duration {s:?}: {e}"))
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

impl Cli {
    fn builder(&self) -> RadioBuilder {
        let builder = RadioBuilder::new()
            .device(&self.device)
            .baud_rate(self.baud)
            .command_timeout(self.command_timeout);
        match &self.trace_pei {
            Some(path) => builder.trace_file(path),
            None => builder,
        }
    }

    /// A token for one command: cancelled by Ctrl-C or after the command
    /// timeout.
    fn command_scope(&self, root: &CancellationToken) -> CancellationToken {
        cancel_after(root, self.command_timeout)
    }
}

async fn connect(
    cli: &Cli,
    cancel: &CancellationToken,
    initializer: &dyn Initializer,
) -> Result<Radio> {
    cli.builder()
        .build(cancel, initializer)
        .await
        .context("cannot connect to radio")
}

/// Close the radio and hand back the command result.
async fn finish(radio: Radio, cli: &Cli, result: Result<()>) -> Result<()> {
    if let Err(e) = radio.close(cli.command_timeout).await {
        warn!(error = %e, "radio did not shut down cleanly");
    }
    result
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_bat(cli: &Cli, root: &CancellationToken) -> Result<()> {
    let cancel = cli.command_scope(root);
    let radio = connect(cli, &cancel, &NoInit).await?;

    let result = async {
        let charge = commands::request_battery_charge(&cancel, radio.pei()).await?;
        println!("{charge}");
        Ok::<_, anyhow::Error>(())
    }
    .await;
    finish(radio, cli, result).await
}

/// Print the raw response of a query (`ATI`, `AT+CTSP?`).
async fn cmd_query(cli: &Cli, root: &CancellationToken, command: &str, what: &str) -> Result<()> {
    let cancel = cli.command_scope(root);
    let radio = connect(cli, &cancel, &NoInit).await?;

    let result = async {
        let lines = radio
            .pei()
            .at(&cancel, command)
            .await
            .with_context(|| format!("cannot read {what}"))?;
        println!("{}", lines.join("\n"));
        Ok::<_, anyhow::Error>(())
    }
    .await;
    finish(radio, cli, result).await
}

async fn cmd_set_talkgroup(
    cli: &Cli,
    root: &CancellationToken,
    mode: &str,
    gtsi: Option<&str>,
) -> Result<()> {
    let mode = OperatingMode::from_name(mode)?;
    let gtsi: Option<Identity> = gtsi
        .map(str::trim)
        .filter(|gtsi| !gtsi.is_empty())
        .map(str::parse::<Identity>)
        .transpose()?;

    let cancel = cli.command_scope(root);
    let init = InitCommands::new([
        ROUTE_GROUP_MANAGEMENT.to_string(),
        commands::cmd_set_operating_mode(mode),
    ]);
    let radio = connect(cli, &cancel, &init).await?;

    let result = async {
        if let Some(gtsi) = gtsi {
            radio
                .pei()
                .at(&cancel, &commands::cmd_set_talkgroup(gtsi.as_str()))
                .await
                .with_context(|| format!("cannot select talkgroup {gtsi}"))?;
        }
        Ok::<_, anyhow::Error>(())
    }
    .await;
    finish(radio, cli, result).await
}

async fn cmd_get_talkgroup(cli: &Cli, root: &CancellationToken) -> Result<()> {
    let cancel = cli.command_scope(root);
    let radio = connect(cli, &cancel, &InitCommands::new([ROUTE_GROUP_MANAGEMENT])).await?;

    let result = async {
        let pei = radio.pei();
        let mode = commands::request_operating_mode(&cancel, pei)
            .await
            .context("cannot find out the current operating mode")?;
        println!("MODE: {mode}");
        let gtsi = commands::request_talkgroup(&cancel, pei)
            .await
            .context("cannot find out the current talkgroup")?;
        println!("GTSI: {gtsi}");
        Ok::<_, anyhow::Error>(())
    }
    .await;
    finish(radio, cli, result).await
}

async fn cmd_talkgroups(cli: &Cli, root: &CancellationToken) -> Result<()> {
    let cancel = cli.command_scope(root);
    let radio = connect(cli, &cancel, &NoInit).await?;
    let result = list_talkgroups(&cancel, radio.pei()).await;
    finish(radio, cli, result).await
}

/// Dynamic groups are only available in TMO and static groups only in DMO,
/// so the radio is switched through both modes and back.
async fn list_talkgroups(cancel: &CancellationToken, pei: &Pei) -> Result<()> {
    let last_mode = commands::request_operating_mode(cancel, pei)
        .await
        .context("cannot read last mode")?;

    if last_mode != OperatingMode::Tmo {
        pei.at(cancel, &commands::cmd_set_operating_mode(OperatingMode::Tmo))
            .await
            .context("cannot switch to TMO")?;
    }
    let tmo = commands::request_talkgroups(cancel, pei, TalkgroupFolder::Dynamic)
        .await
        .context("cannot read TMO talkgroups")?;
    for group in &tmo {
        println!("TMO;{};{}", group.gtsi, group.name);
    }

    pei.at(cancel, &commands::cmd_set_operating_mode(OperatingMode::Dmo))
        .await
        .context("cannot switch to DMO")?;
    let dmo = commands::request_talkgroups(cancel, pei, TalkgroupFolder::Static)
        .await
        .context("cannot read DMO talkgroups")?;
    for group in &dmo {
        println!("DMO;{};{}", group.gtsi, group.name);
    }

    if last_mode != OperatingMode::Dmo {
        pei.at(cancel, &commands::cmd_set_operating_mode(last_mode))
            .await
            .context("cannot switch to last mode")?;
    }
    Ok(())
}

async fn cmd_trace_signal(
    cli: &Cli,
    root: &CancellationToken,
    scan_interval: Duration,
    count: u32,
) -> Result<()> {
    if scan_interval.is_zero() {
        bail!("the scan interval must be longer than zero");
    }
    let init = InitCommands::new([SET_CHARSET_LATIN1]);
    let radio = connect(cli, &cli.command_scope(root), &init).await?;

    scan_signal_and_position(&cli.command_scope(root), radio.pei()).await;
    if count == 1 {
        return finish(radio, cli, Ok(())).await;
    }

    let root = root.clone();
    let command_timeout = cli.command_timeout;
    let started = radio.run_loop(move |cancel, pei| async move {
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + scan_interval, scan_interval);
        let mut scans = 1;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = root.cancelled() => break,
                _ = ticker.tick() => {
                    scan_signal_and_position(&cancel_after(&cancel, command_timeout), &pei).await;
                    scans += 1;
                    if count > 0 && scans >= count {
                        break;
                    }
                }
            }
        }
        debug!(scans, "signal trace finished");
    });

    let result = if started {
        radio.wait_for_loops().await;
        if radio.is_connected() {
            Ok(())
        } else {
            Err(anyhow!("connection to the radio lost"))
        }
    } else {
        Err(anyhow!("connection to the radio lost"))
    };
    finish(radio, cli, result).await
}

async fn scan_signal_and_position(cancel: &CancellationToken, pei: &Pei) {
    let (latitude, longitude, satellites, timestamp) =
        match commands::request_gps_position(cancel, pei).await {
            Ok(position) => (
                position.latitude,
                position.longitude,
                position.satellites,
                fix_timestamp(position.time),
            ),
            Err(e) => {
                debug!(error = %e, "no GPS position");
                (0.0, 0.0, 0, OffsetDateTime::now_utc())
            }
        };
    let dbm = commands::request_signal_strength(cancel, pei)
        .await
        .unwrap_or_else(|e| {
            debug!(error = %e, "no signal strength");
            0
        });

    println!(
        "[{}] lat: {latitude:.6} lon: {longitude:.6} satellites: {satellites} signal: {dbm} dBm",
        format_timestamp(timestamp)
    );
}

/// The GPS fix only carries the time of day; today's UTC date is assumed.
fn fix_timestamp(fix: FixTime) -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    time::Time::from_hms(fix.hour, fix.minute, fix.second)
        .map(|time| now.replace_time(time))
        .unwrap_or(now)
}

fn format_timestamp(timestamp: OffsetDateTime) -> String {
    let timestamp = timestamp.replace_nanosecond(0).unwrap_or(timestamp);
    timestamp
        .format(&Rfc3339)
        .unwrap_or_else(|_| timestamp.to_string())
}

async fn cmd_send(cli: &Cli, root: &CancellationToken, args: &SendArgs) -> Result<()> {
    let destination: Identity = args.destination.parse()?;
    let reference = match args.message_reference {
        0 => MessageReference::random(),
        value => MessageReference::new(value)?,
    };
    let encoding = TextEncoding::from_name(&args.encoding)?;
    let requested = ReportRequest {
        received: args.ack_receive,
        consumed: args.ack_consume,
    };
    if args.simple && requested.any() {
        bail!("delivery reports cannot be requested with the simple text messaging protocol");
    }
    let text = args.text.join(" ");

    let cancel = cli.command_scope(root);
    let init = InitCommands::new([SET_CHARSET_LATIN1, SWITCH_TO_SDS_TL]);
    let radio = connect(cli, &cancel, &init).await?;

    let message = OutgoingText {
        destination,
        reference,
        encoding,
        requested,
        text,
    };
    let result = send_text(&cancel, radio.pei(), args, &message).await;
    finish(radio, cli, result).await
}

struct OutgoingText {
    destination: Identity,
    reference: MessageReference,
    encoding: TextEncoding,
    requested: ReportRequest,
    text: String,
}

async fn send_text(
    cancel: &CancellationToken,
    pei: &Pei,
    args: &SendArgs,
    message: &OutgoingText,
) -> Result<()> {
    let max_pdu_bits = max_pdu_bits(cancel, pei, args.max_pdu_bits).await?;

    let pdu = if args.simple {
        sds::simple_text_message(args.immediate, message.encoding, &message.text)
    } else {
        sds::text_message_transfer(
            message.reference,
            args.immediate,
            message.requested,
            message.encoding,
            &message.text,
        )
    };

    if pdu.bits <= max_pdu_bits {
        send_with_acknowledgment(
            cancel,
            pei,
            &message.destination,
            &pdu,
            message.reference,
            message.requested,
        )
        .await
        .context("cannot send SDS text message")?;
        if message.requested.any() {
            info!(reference = %message.reference, "message delivered");
        }
        return Ok(());
    }

    if message.requested.any() {
        warn!("delivery reports are not requested for concatenated messages");
    }
    let parts = sds::concatenated_message_transfer(
        message.reference,
        ReportRequest::NONE,
        message.encoding,
        max_pdu_bits,
        &message.text,
    )?;
    info!(
        parts = parts.len(),
        reference = %message.reference,
        "sending concatenated message"
    );
    send_parts(cancel, pei, &message.destination, &parts).await?;
    Ok(())
}

/// The negotiated maximum PDU length, unless overridden on the command line.
async fn max_pdu_bits(
    cancel: &CancellationToken,
    pei: &Pei,
    requested: Option<usize>,
) -> Result<usize> {
    match (commands::request_max_pdu_bits(cancel, pei).await, requested) {
        (Ok(negotiated), None) => Ok(negotiated),
        (Ok(negotiated), Some(bits)) => {
            if negotiated != bits {
                info!(negotiated, used = bits, "overriding the maximum PDU length");
            }
            Ok(bits)
        }
        (Err(e), Some(bits)) => {
            warn!(error = %e, used = bits, "cannot read the maximum PDU length");
            Ok(bits)
        }
        (Err(e), None) => {
            Err(e).context("cannot find out how long an SDS text message may be")
        }
    }
}

async fn cmd_status(
    cli: &Cli,
    root: &CancellationToken,
    destination: &str,
    status: &str,
) -> Result<()> {
    let destination: Identity = destination.parse()?;
    let value = sds::parse_status(status).context("not a valid status")?;

    let cancel = cli.command_scope(root);
    let init = InitCommands::new([ROUTE_STATUS, SWITCH_TO_STATUS]);
    let radio = connect(cli, &cancel, &init).await?;

    let result = async {
        let request = sds::send_message(&destination, &sds::status_message(value));
        radio
            .pei()
            .request(&cancel, &request)
            .await
            .context("cannot send status message")?;
        Ok::<_, anyhow::Error>(())
    }
    .await;
    finish(radio, cli, result).await
}

async fn cmd_listen(cli: &Cli, root: &CancellationToken) -> Result<()> {
    let init = ListenInit {
        cancel: root.clone(),
        command_timeout: cli.command_timeout,
    };
    let radio = connect(cli, &cli.command_scope(root), &init).await?;
    info!("listening, press Ctrl-C to stop");

    let result = match radio.pei().wait_until_closed(root).await {
        Ok(()) => Err(anyhow!("connection to the radio lost")),
        Err(_) => Ok(()),
    };
    finish(radio, cli, result).await
}

fn cmd_list_devices() -> Result<()> {
    let devices = list_serial_devices()?;
    if devices.is_empty() {
        println!("no active serial devices found");
        return Ok(());
    }
    for device in devices {
        println!("{}: {}", device.description, device.path);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tetra_cli=info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    // Listing devices does not require a radio connection.
    if matches!(cli.command, Command::ListDevices) {
        return cmd_list_devices();
    }

    let root = CancellationToken::new();
    tokio::spawn({
        let root = root.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                debug!("interrupted");
                root.cancel();
            }
        }
    });

    match &cli.command {
        Command::Bat => cmd_bat(&cli, &root).await,
        Command::Info => cmd_query(&cli, &root, &commands::cmd_read_info(), "device information").await,
        Command::Routing => {
            cmd_query(&cli, &root, &commands::cmd_read_routing(), "routing settings").await
        }
        Command::SetTalkgroup { mode, gtsi } => {
            cmd_set_talkgroup(&cli, &root, mode, gtsi.as_deref()).await
        }
        Command::GetTalkgroup => cmd_get_talkgroup(&cli, &root).await,
        Command::Talkgroups => cmd_talkgroups(&cli, &root).await,
        Command::TraceSignal {
            scan_interval,
            count,
        } => cmd_trace_signal(&cli, &root, *scan_interval, *count).await,
        Command::Send(args) => cmd_send(&cli, &root, args).await,
        Command::Status {
            destination,
            status,
        } => cmd_status(&cli, &root, destination, status).await,
        Command::Listen => cmd_listen(&cli, &root).await,
        Command::ListDevices => unreachable!("list-devices handled above"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("7").unwrap(), Duration::from_secs(7));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert!(parse_duration("5 parsecs").is_err());
        assert!(parse_duration("s").is_err());
    }

    #[test]
    fn global_defaults() {
        let cli = Cli::try_parse_from(["tetra-cli", "bat"]).unwrap();
        assert_eq!(cli.device, "auto");
        assert_eq!(cli.baud, 38400);
        assert_eq!(cli.command_timeout, Duration::from_secs(5));
        assert!(cli.trace_pei.is_none());
    }

    #[test]
    fn send_joins_words() {
        let cli = Cli::try_parse_from([
            "tetra-cli",
            "send",
            "--ack-receive",
            "--message-reference",
            "42",
            "1234567",
            "hello",
            "there",
        ])
        .unwrap();
        let Command::Send(args) = cli.command else {
            panic!("expected send");
        };
        assert_eq!(args.destination, "1234567");
        assert_eq!(args.text.join(" "), "hello there");
        assert_eq!(args.message_reference, 42);
        assert!(args.ack_receive);
        assert!(!args.ack_consume);
        assert_eq!(args.encoding, "ISO8859-1");
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "tetra-cli",
            "get-talkgroup",
            "--device",
            "/dev/ttyACM0",
            "--command-timeout",
            "2s",
        ])
        .unwrap();
        assert_eq!(cli.device, "/dev/ttyACM0");
        assert_eq!(cli.command_timeout, Duration::from_secs(2));
    }

    #[test]
    fn trace_signal_flags() {
        let cli =
            Cli::try_parse_from(["tetra-cli", "trace-signal", "-n", "3", "--scan-interval", "10s"])
                .unwrap();
        let Command::TraceSignal {
            scan_interval,
            count,
        } = cli.command
        else {
            panic!("expected trace-signal");
        };
        assert_eq!(scan_interval, Duration::from_secs(10));
        assert_eq!(count, 3);
    }

    #[test]
    fn timestamps_are_rfc3339_seconds() {
        let timestamp = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        assert_eq!(format_timestamp(timestamp), "2023-11-14T22:13:20Z");
    }
}
