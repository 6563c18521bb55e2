//! Parsers for the external tool's text output.
//!
//! The tool speaks a human-oriented protocol with no grammar guarantee, so
//! every matcher in this module follows one policy: a line that does not fit
//! is dropped, never an error. Orchestration code upstream stays free of any
//! knowledge about the wire text.

/// One would-be-transferred entry reported by a counting dry run
/// (`<byte-size>\t<relative-name>`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryRecord {
    pub size: u64,
    pub name: String,
}

/// Parse a counting dry-run output line.
///
/// Returns `None` for anything that is not an exact two-field tab split, and
/// for directory entries (`.`, `./`, or a name with a trailing separator);
/// directories never count toward file/byte totals.
pub fn parse_entry_line(line: &str) -> Option<EntryRecord> {
    let mut fields = line.split('\t');
    let size_field = fields.next()?;
    let name_field = fields.next()?;
    if fields.next().is_some() {
        return None;
    }

    let size: u64 = size_field.trim().parse().ok()?;
    let name = name_field.trim_end_matches(['\r', '\n']);
    if name.is_empty() || name == "." || name == "./" || name.ends_with('/') {
        return None;
    }

    Some(EntryRecord {
        size,
        name: name.to_string(),
    })
}

/// A structured live-progress reading from the real transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub transferred_bytes: u64,
    pub percent: f64,
    pub percent_text: String,
    pub fraction: f64,
    pub speed_bytes_per_sec: f64,
    pub eta_seconds: Option<u64>,
}

impl ProgressUpdate {
    /// Approximate total derivable from the tool's own percentage, for runs
    /// that have no authoritative plan baseline.
    pub fn approximate_total_bytes(&self) -> Option<u64> {
        if self.percent > 0.0 {
            Some((self.transferred_bytes as f64 / (self.percent / 100.0)).round() as u64)
        } else {
            None
        }
    }
}

/// Parse a structured progress line:
/// `<transferred-bytes>  <NN%>  <speed><unit>  <H:MM:SS>` with arbitrary
/// whitespace and optional digit grouping.
pub fn parse_progress_line(line: &str) -> Option<ProgressUpdate> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() < 4 {
        return None;
    }

    let transferred_bytes = parse_grouped_u64(tokens[0])?;
    let percent = parse_percent_token(tokens[1])?;
    let speed_bytes_per_sec = parse_speed_token(tokens[2])?;
    let eta_seconds = parse_eta_clock(tokens[3])?;

    Some(ProgressUpdate {
        transferred_bytes,
        percent,
        percent_text: format!("{}%", percent.round() as u64),
        fraction: (percent / 100.0).clamp(0.0, 1.0),
        speed_bytes_per_sec,
        eta_seconds: Some(eta_seconds),
    })
}

/// Find a bare `NN%` token on the line, the legacy-progress fallback for
/// tool versions without the structured protocol.
pub fn parse_percent_only(line: &str) -> Option<f64> {
    line.split_whitespace().find_map(parse_percent_token)
}

fn parse_percent_token(token: &str) -> Option<f64> {
    let digits = token.strip_suffix('%')?;
    let value: f64 = digits.parse().ok()?;
    if (0.0..=100.0).contains(&value) {
        Some(value)
    } else {
        None
    }
}

fn parse_grouped_u64(token: &str) -> Option<u64> {
    let cleaned: String = token.chars().filter(|c| *c != ',').collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse().ok()
}

/// Convert a throughput value plus unit suffix into bytes per second.
///
/// Case-insensitive; a trailing `/s` is ignored; an unrecognized or absent
/// unit means the value already is bytes per second.
pub fn speed_to_bytes_per_sec(value: f64, unit: &str) -> f64 {
    let unit = unit.trim().to_ascii_lowercase();
    let unit = unit.strip_suffix("/s").unwrap_or(&unit);
    let multiplier: f64 = match unit {
        "b" | "byte" | "bytes" => 1.0,
        "kb" | "kib" => 1024.0,
        "mb" | "mib" => 1024.0 * 1024.0,
        "gb" | "gib" => 1024.0 * 1024.0 * 1024.0,
        "tb" | "tib" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => 1.0,
    };
    value * multiplier
}

fn parse_speed_token(token: &str) -> Option<f64> {
    let split = token
        .find(|c: char| !c.is_ascii_digit() && c != '.' && c != ',')
        .unwrap_or(token.len());
    let (number, unit) = token.split_at(split);
    let cleaned: String = number.chars().filter(|c| *c != ',').collect();
    let value: f64 = cleaned.parse().ok()?;
    Some(speed_to_bytes_per_sec(value, unit))
}

/// Parse an `H:MM:SS`-shaped ETA into total seconds. An `MM:SS` pair is
/// accepted the same way.
pub fn parse_eta_clock(token: &str) -> Option<u64> {
    let parts: Vec<&str> = token.split(':').collect();
    if parts.len() != 2 && parts.len() != 3 {
        return None;
    }
    let mut seconds = 0u64;
    for part in &parts {
        let value: u64 = part.parse().ok()?;
        seconds = seconds * 60 + value;
    }
    Some(seconds)
}

/// Heuristic used for diagnostics: progress lines carry both a percent sign
/// and a clock-style colon, real messages rarely do.
pub fn is_progress_line(line: &str) -> bool {
    line.contains('%') && line.contains(':')
}

/// Summary figures scraped from a completed run's output. Secondary source
/// only; live progress is the primary channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FinalStats {
    pub files_transferred: Option<u64>,
    pub bytes_transferred: Option<u64>,
}

/// Scan completed output for the labeled summary lines the tool prints after
/// a stats run, tolerating minor wording variants.
pub fn scan_final_stats(output: &str) -> FinalStats {
    let mut stats = FinalStats::default();
    for line in output.lines() {
        let lowered = line.to_ascii_lowercase();
        if lowered.contains("files transferred") {
            stats.files_transferred = last_number_on_line(line).or(stats.files_transferred);
        } else if lowered.contains("total transferred file size")
            || lowered.contains("total bytes transferred")
        {
            stats.bytes_transferred = last_number_on_line(line).or(stats.bytes_transferred);
        }
    }
    stats
}

fn last_number_on_line(line: &str) -> Option<u64> {
    line.split_whitespace()
        .rev()
        .find_map(|token| parse_grouped_u64(token.trim_end_matches(|c: char| !c.is_ascii_digit())))
}

/// Reassembles complete lines from a chunk stream whose boundaries fall
/// anywhere. Carriage returns count as terminators; the tool redraws its
/// progress line with `\r`.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: String,
}

impl LineBuffer {
    /// Feed one chunk; returns every line completed by it.
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        let mut lines = Vec::new();
        for c in chunk.chars() {
            if c == '\n' || c == '\r' {
                if !self.pending.is_empty() {
                    lines.push(std::mem::take(&mut self.pending));
                }
            } else {
                self.pending.push(c);
            }
        }
        lines
    }

    /// Hand back whatever partial line remains once the stream is closed.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }
}
