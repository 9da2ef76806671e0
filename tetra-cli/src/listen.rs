// Handlers for the `listen` command.
//
// Incoming SDS, call activity and mode changes arrive as indications and are
// printed as blocks terminated by `--`. Delivery report requests are answered
// from a spawned task, because handlers run on the IO task and must not wait
// for a command exchange.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tetra_core::{Identity, MessageReference, ReportKind, cancel_after};
use tetra_pei::commands::{self, LISTEN_ROUTING, OperatingMode, SET_CHARSET_LATIN1};
use tetra_pei::sds::{self, IncomingMessage, Payload, Reassembler, TextMessage};
use tetra_pei::{Initializer, Pei};

/// Sets up routing and registers the `listen` indications.
pub struct ListenInit {
    /// Parent of the tasks answering report requests.
    pub cancel: CancellationToken,
    pub command_timeout: std::time::Duration,
}

#[async_trait]
impl Initializer for ListenInit {
    async fn initialize(&self, cancel: &CancellationToken, pei: &Pei) -> tetra_core::Result<()> {
        pei.at(cancel, SET_CHARSET_LATIN1).await?;
        pei.ats(cancel, LISTEN_ROUTING.as_slice()).await?;

        let messages = Arc::new(MessageHandler {
            pei: pei.clone(),
            cancel: self.cancel.clone(),
            command_timeout: self.command_timeout,
            reassembler: Mutex::new(Reassembler::new()),
        });
        for prefix in ["+CTSDSR: 12,", "+CTSDSR: 13,"] {
            let messages = messages.clone();
            pei.add_indication(prefix, 1, move |lines: &[String]| {
                messages.on_message(lines)
            })?;
        }

        pei.add_indication("+CTXG:", 0, |lines: &[String]| print_voice(&lines[0]))?;
        pei.add_indication("+CDTXC:", 0, |_: &[String]| {
            println!("TALKGROUP IDLE\n--")
        })?;
        pei.add_indication("+CTCR:", 0, |_: &[String]| {
            println!("TALKGROUP INACTIVE\n--")
        })?;
        pei.add_indication("+CTOM: ", 0, |lines: &[String]| print_mode(&lines[0]))?;
        Ok(())
    }
}

struct MessageHandler {
    pei: Pei,
    cancel: CancellationToken,
    command_timeout: std::time::Duration,
    reassembler: Mutex<Reassembler>,
}

impl MessageHandler {
    fn on_message(&self, lines: &[String]) {
        let [header, pdu] = lines else {
            return;
        };
        let message = match sds::parse_incoming(header, pdu) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "cannot decode message part");
                return;
            }
        };

        match &message.payload {
            Payload::Text(text) => self.on_text(&message, text),
            Payload::Status(value) => print_status(&message.source, *value),
            Payload::Report(_) | Payload::ShortReport(_) => {
                debug!(source = %message.source, report = ?message.report(), "delivery report");
            }
        }
    }

    fn on_text(&self, message: &IncomingMessage, text: &TextMessage) {
        if let (true, Some(reference)) = (text.wants_report(), text.reference) {
            self.answer_report_request(&message.source, text, reference);
        }

        let complete = self
            .reassembler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .put(&message.source, text);
        match complete {
            Some(text) => print_message(&message.source, &text),
            None => debug!(source = %message.source, "waiting for more parts"),
        }
    }

    fn answer_report_request(
        &self,
        destination: &Identity,
        text: &TextMessage,
        reference: MessageReference,
    ) {
        let mut reports = Vec::new();
        for kind in [ReportKind::Received, ReportKind::Consumed] {
            if text.report_request.contains(kind) {
                let pdu = sds::report_message(text.protocol, reference, kind);
                reports.push(sds::send_message(destination, &pdu));
            }
        }

        let pei = self.pei.clone();
        let cancel = cancel_after(&self.cancel, self.command_timeout);
        tokio::spawn(async move {
            if let Err(e) = pei.at(&cancel, commands::SWITCH_TO_SDS_TL).await {
                warn!(error = %e, "cannot select SDS-TL for the report");
                return;
            }
            for report in reports {
                if let Err(e) = pei.request(&cancel, &report).await {
                    warn!(error = %e, "cannot send delivery report");
                    return;
                }
            }
            debug!(%reference, "delivery report sent");
        });
    }
}

fn print_message(source: &Identity, text: &str) {
    println!("{}", format_message(source, text));
}

fn print_status(source: &Identity, value: u16) {
    println!("{}", format_status(source, value));
}

fn print_voice(line: &str) {
    match format_voice(line) {
        Some(block) => println!("{block}"),
        None => debug!(%line, "unexpected transmission grant"),
    }
}

fn print_mode(line: &str) {
    match format_mode(line) {
        Some(block) => println!("{block}"),
        None => debug!(%line, "unexpected operating mode"),
    }
}

/// A text block. An OPTA at the start and an ITSI at the end of the text get
/// lines of their own.
fn format_message(source: &Identity, text: &str) -> String {
    let (opta, text) = sds::split_leading_opta(text);
    let (text, itsi) = sds::split_trailing_itsi(text);

    let mut block = format!("MESSAGE\nISSI:{source}\n");
    if let Some(itsi) = itsi {
        block.push_str(&format!("ITSI:{itsi}\n"));
    }
    if let Some(opta) = opta {
        block.push_str(&format!("OPTA:{opta}\n"));
    }
    block.push_str(&format!("TEXT:{text}\n--"));
    block
}

fn format_status(source: &Identity, value: u16) -> String {
    format!("STATUS\nISSI:{source}\nSTATUS:{value:4x}\n--")
}

/// `+CTXG` has four fields for our own transmission and six, ending with
/// the talking party, for a received one.
fn format_voice(line: &str) -> Option<String> {
    let fields: Vec<&str> = line
        .strip_prefix("+CTXG:")
        .unwrap_or(line)
        .split(',')
        .map(str::trim)
        .collect();
    match fields.as_slice() {
        [_, _, _, _] => Some("VOICE TX\n--".into()),
        [_, _, _, _, _, itsi] => Some(format!("VOICE RX\nITSI: {itsi}\n--")),
        _ => None,
    }
}

fn format_mode(line: &str) -> Option<String> {
    let code = line.strip_prefix("+CTOM: ").unwrap_or(line).trim();
    let code: u8 = code.parse().ok()?;
    Some(format!("AI MODE: {}\n--", OperatingMode::from_code(code)))
}
