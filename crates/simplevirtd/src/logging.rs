//! Logging setup: stderr by default, syslog on request.
//!
//! The log-level names follow syslog severities. tracing has no critical
//! level, so CRITICAL behaves like ERROR.

use std::io::{self, Write};
use std::os::unix::net::UnixDatagram;

use anyhow::Context;
use tracing::level_filters::LevelFilter;
use tracing::{Level, Metadata};
use tracing_subscriber::fmt::MakeWriter;

pub fn init(level: &str, use_syslog: bool) -> anyhow::Result<()> {
    if use_syslog {
        let writer = SyslogMakeWriter::connect("simplevirtd")?;
        tracing_subscriber::fmt()
            .with_max_level(LevelFilter::INFO)
            .with_writer(writer)
            .with_ansi(false)
            .with_level(false)
            .without_time()
            .init();
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_max_level(parse_level(level)?)
        .with_writer(io::stderr)
        .init();
    Ok(())
}

fn parse_level(level: &str) -> anyhow::Result<LevelFilter> {
    match level.to_lowercase().as_str() {
        "critical" | "error" => Ok(LevelFilter::ERROR),
        "warning" => Ok(LevelFilter::WARN),
        "notice" => Ok(LevelFilter::INFO),
        _ => anyhow::bail!("invalid log level: {level}"),
    }
}

/// Facility `daemon`.
const LOG_DAEMON: u8 = 3 << 3;

fn severity(level: &Level) -> u8 {
    if *level == Level::ERROR {
        3 // err
    } else if *level == Level::WARN {
        4 // warning
    } else if *level == Level::INFO {
        5 // notice
    } else {
        7 // debug
    }
}

/// Sends one RFC 3164 datagram per log line to `/dev/log`, with the
/// severity taken from the event's level.
struct SyslogMakeWriter {
    socket: UnixDatagram,
    tag: &'static str,
}

impl SyslogMakeWriter {
    fn connect(tag: &'static str) -> anyhow::Result<Self> {
        let socket = UnixDatagram::unbound().context("failed to create syslog socket")?;
        socket
            .connect("/dev/log")
            .context("failed to connect to /dev/log")?;
        Ok(SyslogMakeWriter { socket, tag })
    }
}

impl<'a> MakeWriter<'a> for SyslogMakeWriter {
    type Writer = SyslogWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        SyslogWriter {
            socket: &self.socket,
            tag: self.tag,
            severity: 5,
        }
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> Self::Writer {
        SyslogWriter {
            socket: &self.socket,
            tag: self.tag,
            severity: severity(meta.level()),
        }
    }
}

struct SyslogWriter<'a> {
    socket: &'a UnixDatagram,
    tag: &'static str,
    severity: u8,
}

impl Write for SyslogWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let message = String::from_utf8_lossy(buf);
        let message = message.trim_end();
        if !message.is_empty() {
            let datagram = format!(
                "<{}>{}[{}]: {}",
                LOG_DAEMON | self.severity,
                self.tag,
                std::process::id(),
                message
            );
            self.socket.send(datagram.as_bytes())?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
