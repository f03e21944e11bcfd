//! Tolerant parser for the status lines workers print to their log.
//!
//! A typical line:
//!
//! ```text
//! [STATS] Connecting: 3 | Connected: 15 | Up: 1.2 GB | Down: 4.5 GB | Uptime: 2h 15m 3s
//! ```
//!
//! Fields may be missing, reordered or wrapped in other text. Missing
//! fields default to zero; a line is a status line if at least one field
//! is recognized.

use regex::Regex;

/// Fields recovered from one status line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParsedStatus {
    pub connecting: u64,
    pub connected: u64,
    /// Cumulative since worker start.
    pub upload_bytes: u64,
    /// Cumulative since worker start.
    pub download_bytes: u64,
    pub uptime_secs: u64,
}

pub struct StatusParser {
    connecting: Regex,
    connected: Regex,
    upload: Regex,
    download: Regex,
    uptime: Regex,
}

impl StatusParser {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            connecting: Regex::new(r"(?i)\bconnecting:\s*(\d+)")?,
            connected: Regex::new(r"(?i)\bconnected:\s*(\d+)")?,
            upload: Regex::new(r"(?i)\bup(?:load)?:\s*([\d.]+\s*[KMGTP]?i?B?)")?,
            download: Regex::new(r"(?i)\bdown(?:load)?:\s*([\d.]+\s*[KMGTP]?i?B?)")?,
            uptime: Regex::new(r"(?i)\buptime:\s*((?:\d+\s*[dhms]\s*)+)")?,
        })
    }

    /// Parse one line; `None` if no field is present.
    pub fn parse_line(&self, line: &str) -> Option<ParsedStatus> {
        let connecting = capture(&self.connecting, line).and_then(|s| s.parse().ok());
        let connected = capture(&self.connected, line).and_then(|s| s.parse().ok());
        let upload = capture(&self.upload, line).and_then(parse_size);
        let download = capture(&self.download, line).and_then(parse_size);
        let uptime = capture(&self.uptime, line).and_then(parse_uptime);

        if connecting.is_none()
            && connected.is_none()
            && upload.is_none()
            && download.is_none()
            && uptime.is_none()
        {
            return None;
        }
        Some(ParsedStatus {
            connecting: connecting.unwrap_or(0),
            connected: connected.unwrap_or(0),
            upload_bytes: upload.unwrap_or(0),
            download_bytes: download.unwrap_or(0),
            uptime_secs: uptime.unwrap_or(0),
        })
    }

    /// The most recent status line in a log tail.
    pub fn latest(&self, log: &str) -> Option<ParsedStatus> {
        log.lines().rev().find_map(|line| self.parse_line(line))
    }
}

fn capture<'a>(re: &Regex, line: &'a str) -> Option<&'a str> {
    re.captures(line)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim())
}

/// Parse a human size like `1.2 GB`, `512KB`, `3 MiB` or `42` (bytes).
///
/// Units are powers of 1024.
pub fn parse_size(s: &str) -> Option<u64> {
    let s = s.trim();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let value: f64 = number.parse().ok()?;
    let unit = unit.trim().to_ascii_uppercase();
    let exp = match unit.trim_end_matches('B').trim_end_matches('I') {
        "" => 0,
        "K" => 1,
        "M" => 2,
        "G" => 3,
        "T" => 4,
        "P" => 5,
        _ => return None,
    };
    let bytes = value * 1024f64.powi(exp);
    if !bytes.is_finite() || bytes < 0.0 {
        return None;
    }
    Some(bytes.round() as u64)
}

/// Parse an uptime like `1d 2h 15m 3s` into seconds.
pub fn parse_uptime(s: &str) -> Option<u64> {
    let mut total = 0u64;
    let mut digits = String::new();
    let mut seen = false;
    for c in s.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        if c.is_whitespace() {
            continue;
        }
        let mult = match c.to_ascii_lowercase() {
            'd' => 86_400,
            'h' => 3_600,
            'm' => 60,
            's' => 1,
            _ => return None,
        };
        let n: u64 = digits.parse().ok()?;
        total = total.saturating_add(n.saturating_mul(mult));
        digits.clear();
        seen = true;
    }
    if !digits.is_empty() || !seen {
        return None;
    }
    Some(total)
}
