//! Transfer tool output parsing.
//!
//! Every line the transfer tool writes is classified into a
//! [`TransferLine`]. Parsing is a pure function of the line; the only state
//! kept between calls is the byte buffer in [`LineBuffer`].
//!
//! Two output styles are understood:
//! - JSON log objects (`--use-json-log`), one per line:
//!   `{"level":"info","msg":"Copied (new)","object":"a.txt",...}` and stats
//!   lines carrying a `stats` object.
//! - Plain text logs:
//!   - `2026/01/01 02:00:01 INFO  : a.txt: Copied (new)`
//!   - `Transferred:   5 MiB / 10 MiB, 50%, 1 MiB/s, ETA 5s`
//!   - `There was nothing to transfer`

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

// Pre-compiled regexes for plain-text output
static RE_STATS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"Transferred:\s*([\d.]+\s*(?:[KMGTPE]i?B|B|Bytes))\s*/\s*([\d.]+\s*(?:[KMGTPE]i?B|B|Bytes)),\s*(\d+)%(?:,\s*([\d.]+\s*(?:[KMGTPE]i?B|B|Bytes))/s)?(?:,\s*ETA\s*(\S+))?",
    )
    .unwrap()
});
static RE_LOG_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:\d{4}/\d{2}/\d{2} \d{2}:\d{2}:\d{2}(?:\.\d+)?\s+)?(DEBUG|INFO|NOTICE|ERROR|CRITICAL|EMERGENCY|ALERT|WARNING)\s*:\s*(.*)$")
        .unwrap()
});
static RE_SIZE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([\d.]+)\s*([KMGTPE]i?B|B|Bytes)$").unwrap());
static RE_DURATION_PART: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([\d.]+)(ms|d|h|m|s)").unwrap());

const USING_PATH_PREFIX: &str = "Using path:";
const NOTHING_TO_TRANSFER: &str = "There was nothing to transfer";

/// Snapshot of a running transfer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSample {
    /// Percentage complete (0-100).
    pub percentage: u8,
    /// Transfer speed in bytes/second.
    pub speed: u64,
    /// Estimated seconds remaining, if the tool could estimate it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta: Option<u64>,
    pub bytes_transferred: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_total: Option<u64>,
    pub errors: u64,
    pub checks: u64,
    /// File currently being transferred.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_file: Option<String>,
}

/// Classification of one line of transfer tool output.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferLine {
    Progress(ProgressSample),
    FileTransferred(String),
    FileSkipped(String),
    Error(String),
    Log(String),
    NothingToTransfer,
    /// The tool settled on a concrete destination path.
    UsingPath(String),
}

#[derive(Debug, Deserialize)]
struct JsonLogLine {
    #[serde(default)]
    level: String,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    object: Option<String>,
    #[serde(default)]
    stats: Option<JsonStats>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct JsonStats {
    bytes: u64,
    total_bytes: u64,
    speed: f64,
    eta: Option<f64>,
    errors: u64,
    checks: u64,
    transferring: Option<Vec<JsonTransferring>>,
}

#[derive(Debug, Deserialize)]
struct JsonTransferring {
    name: String,
}

/// Parses one line of output. Returns `None` for blank lines.
///
/// Never fails: anything not recognized comes back as [`TransferLine::Log`].
pub fn parse_line(line: &str) -> Option<TransferLine> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    if line.starts_with('{') {
        if let Ok(parsed) = serde_json::from_str::<JsonLogLine>(line) {
            return Some(classify_json(parsed));
        }
    }

    Some(classify_text(line))
}

fn classify_json(line: JsonLogLine) -> TransferLine {
    if let Some(stats) = line.stats {
        return TransferLine::Progress(sample_from_stats(stats));
    }

    let msg = line.msg.trim();
    if let Some(kind) = classify_message(msg) {
        return kind;
    }

    if let Some(object) = line.object.as_deref() {
        if let Some(file_event) = classify_file_event(object, msg) {
            return file_event;
        }
    }

    let text = match line.object.as_deref() {
        Some(object) if !object.is_empty() => format!("{}: {}", object, msg),
        _ => msg.to_string(),
    };

    match line.level.to_ascii_lowercase().as_str() {
        "error" | "critical" | "fatal" | "alert" | "emergency" => TransferLine::Error(text),
        _ => TransferLine::Log(text),
    }
}

fn classify_text(line: &str) -> TransferLine {
    if let Some(sample) = parse_text_stats(line) {
        return TransferLine::Progress(sample);
    }

    let (level, body) = match RE_LOG_PREFIX.captures(line) {
        Some(caps) => (
            caps.get(1).map(|m| m.as_str()).unwrap_or(""),
            caps.get(2).map(|m| m.as_str()).unwrap_or("").trim(),
        ),
        None => ("", line),
    };

    if let Some(kind) = classify_message(body) {
        return kind;
    }

    if let Some((object, msg)) = body.rsplit_once(": ") {
        if let Some(file_event) = classify_file_event(object.trim(), msg.trim()) {
            return file_event;
        }
    }

    let is_error = matches!(level, "ERROR" | "CRITICAL" | "EMERGENCY" | "ALERT")
        || body.starts_with("Failed to")
        || body.starts_with("Fatal error");
    if is_error {
        TransferLine::Error(body.to_string())
    } else {
        TransferLine::Log(line.to_string())
    }
}

/// Sentinels that do not depend on an object name.
fn classify_message(msg: &str) -> Option<TransferLine> {
    if msg.contains(NOTHING_TO_TRANSFER) {
        return Some(TransferLine::NothingToTransfer);
    }
    if let Some(path) = msg.strip_prefix(USING_PATH_PREFIX) {
        let path = path.trim();
        if !path.is_empty() {
            return Some(TransferLine::UsingPath(path.to_string()));
        }
    }
    None
}

fn classify_file_event(object: &str, msg: &str) -> Option<TransferLine> {
    if object.is_empty() {
        return None;
    }
    if msg.starts_with("Copied")
        || msg.starts_with("Multi-thread Copied")
        || msg.starts_with("Updated")
    {
        return Some(TransferLine::FileTransferred(object.to_string()));
    }
    if msg.contains("Unchanged skipping") || msg.starts_with("Skipped copy") {
        return Some(TransferLine::FileSkipped(object.to_string()));
    }
    None
}

fn sample_from_stats(stats: JsonStats) -> ProgressSample {
    let percentage = if stats.total_bytes > 0 {
        ((stats.bytes.saturating_mul(100)) / stats.total_bytes).min(100) as u8
    } else {
        0
    };

    ProgressSample {
        percentage,
        speed: stats.speed.max(0.0) as u64,
        eta: stats.eta.filter(|e| *e >= 0.0).map(|e| e as u64),
        bytes_transferred: stats.bytes,
        bytes_total: (stats.total_bytes > 0).then_some(stats.total_bytes),
        errors: stats.errors,
        checks: stats.checks,
        current_file: stats
            .transferring
            .and_then(|files| files.into_iter().next())
            .map(|f| f.name),
    }
}

fn parse_text_stats(line: &str) -> Option<ProgressSample> {
    let caps = RE_STATS.captures(line)?;
    let percentage: u8 = caps.get(3)?.as_str().parse::<u32>().ok()?.min(100) as u8;

    Some(ProgressSample {
        percentage,
        speed: caps
            .get(4)
            .and_then(|m| parse_size(m.as_str()))
            .unwrap_or(0),
        eta: caps.get(5).and_then(|m| parse_eta(m.as_str())),
        bytes_transferred: caps
            .get(1)
            .and_then(|m| parse_size(m.as_str()))
            .unwrap_or(0),
        bytes_total: caps.get(2).and_then(|m| parse_size(m.as_str())),
        ..Default::default()
    })
}

/// Parses a human size such as `1.5 MiB` or `256 B` into bytes.
pub fn parse_size(text: &str) -> Option<u64> {
    let caps = RE_SIZE.captures(text.trim())?;
    let num: f64 = caps.get(1)?.as_str().parse().ok()?;
    let multiplier = match caps.get(2)?.as_str().to_lowercase().as_str() {
        "b" | "bytes" => 1.0,
        "kib" | "kb" => 1024.0,
        "mib" | "mb" => 1024.0 * 1024.0,
        "gib" | "gb" => 1024.0 * 1024.0 * 1024.0,
        "tib" | "tb" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        "pib" | "pb" => 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0,
        "eib" | "eb" => 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    Some((num * multiplier) as u64)
}

/// Parses an ETA such as `1h2m3s` into seconds. `-` means unknown.
pub fn parse_eta(text: &str) -> Option<u64> {
    let text = text.trim().trim_end_matches(',');
    if text.is_empty() || text == "-" {
        return None;
    }

    let mut total = 0.0;
    let mut consumed = 0;
    for caps in RE_DURATION_PART.captures_iter(text) {
        let whole = caps.get(0)?;
        if whole.start() != consumed {
            return None;
        }
        consumed = whole.end();

        let value: f64 = caps.get(1)?.as_str().parse().ok()?;
        total += match caps.get(2)?.as_str() {
            "d" => value * 86_400.0,
            "h" => value * 3_600.0,
            "m" => value * 60.0,
            "s" => value,
            "ms" => value / 1_000.0,
            _ => return None,
        };
    }

    (consumed == text.len()).then_some(total as u64)
}

/// Longest line kept in memory. Longer runs of bytes without a terminator
/// are cut into lines of this size.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Splits a byte stream into lines.
///
/// Chunks may end mid-line; the partial line is kept until its terminator
/// arrives. `\n`, `\r\n` and bare `\r` all end a line, since progress
/// output often rewrites the current line with `\r`.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
    last_was_cr: bool,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk and returns every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            match byte {
                b'\n' if self.last_was_cr => {
                    // Second half of a `\r\n` pair.
                    self.last_was_cr = false;
                }
                b'\n' | b'\r' => {
                    lines.push(self.take_line());
                    self.last_was_cr = byte == b'\r';
                }
                _ => {
                    self.last_was_cr = false;
                    self.pending.push(byte);
                    if self.pending.len() >= MAX_LINE_BYTES {
                        log::debug!("Output line exceeds {} bytes, splitting it", MAX_LINE_BYTES);
                        lines.push(self.take_line());
                    }
                }
            }
        }
        lines
    }

    /// Returns the trailing partial line, if any. Call at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        self.last_was_cr = false;
        if self.pending.is_empty() {
            None
        } else {
            Some(self.take_line())
        }
    }

    fn take_line(&mut self) -> String {
        let line = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        line
    }
}
