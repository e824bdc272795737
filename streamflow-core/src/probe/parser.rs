//! Media inspector diagnostic parsing.
//!
//! The inspector writes a free-form diagnostic log to its error stream; this
//! module extracts resolution, framerate, codecs and the effective bitrate
//! from it. Bitrate detection tries three methods in strict priority order:
//!
//! 1. `Statistics: N bytes read` line: bitrate = N * 8 / 1000 / duration
//! 2. last `bitrate=X kbits/s` progress line
//! 3. a trailing `N bytes read` pattern without the Statistics prefix,
//!    same formula as method 1
//!
//! If none match, bitrate is reported as absent.

use std::sync::OnceLock;

use regex::Regex;

/// Compiled patterns for the inspector's diagnostic output
struct DiagnosticPatterns {
    video_line: Regex,
    resolution: Regex,
    fps: Regex,
    audio_line: Regex,
    statistics_bytes: Regex,
    progress_bitrate: Regex,
    bytes_read: Regex,
}

impl DiagnosticPatterns {
    // Patterns are literals; compilation cannot fail at runtime.
    #[allow(clippy::unwrap_used)]
    fn get() -> &'static Self {
        static PATTERNS: OnceLock<DiagnosticPatterns> = OnceLock::new();
        PATTERNS.get_or_init(|| Self {
            // Stream #0:0(und): Video: wrapped_avframe (avc1 / 0x31637661), yuv420p, 1920x1080, 25 fps
            video_line: Regex::new(r"Video:\s*([A-Za-z0-9_]+)(?:\s*\(([^)]+)\))?").unwrap(),
            resolution: Regex::new(r"\b(\d{2,5})x(\d{2,5})\b").unwrap(),
            fps: Regex::new(r"([\d.]+)\s*fps").unwrap(),
            audio_line: Regex::new(r"Audio:\s*([A-Za-z0-9_]+)").unwrap(),
            statistics_bytes: Regex::new(r"Statistics:\s*(\d+)\s*bytes read").unwrap(),
            progress_bitrate: Regex::new(r"bitrate=\s*([\d.]+)\s*kbits/s").unwrap(),
            bytes_read: Regex::new(r"(\d+)\s*bytes read").unwrap(),
        })
    }
}

/// Fields extracted from one diagnostic log
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedDiagnostics {
    /// (width, height), absent when no resolution line was found
    pub resolution: Option<(u32, u32)>,
    pub fps: Option<f64>,
    pub video_codec: String,
    pub audio_codec: String,
    pub bitrate_kbps: Option<f64>,
}

/// Codec tokens that are placeholders, not real codec names
const CODEC_BLOCKLIST: [&str; 4] = ["wrapped_avframe", "none", "unknown", "null"];

/// Sanitize a raw codec token: blocklisted or empty names become "N/A"
#[must_use]
pub fn sanitize_codec(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return "N/A".to_string();
    }
    let lowered = trimmed.to_lowercase();
    if CODEC_BLOCKLIST.contains(&lowered.as_str()) {
        "N/A".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Normalize a codec tag extracted from a parenthetical, e.g. the `avc1` in
/// `wrapped_avframe (avc1 / 0x31637661)`
fn normalize_codec_tag(tag: &str) -> String {
    match tag.to_lowercase().as_str() {
        "avc1" | "avc" => "h264".to_string(),
        "hevc" | "hev1" | "hvc1" => "h265".to_string(),
        other => other.to_string(),
    }
}

/// Resolve the video codec from the raw token and the optional parenthetical.
///
/// A blocklisted token with a real codec tag in parentheses yields the
/// normalized tag; a blocklisted token alone yields "N/A".
fn resolve_video_codec(raw: &str, parenthetical: Option<&str>) -> String {
    let sanitized = sanitize_codec(raw);
    if sanitized != "N/A" {
        return sanitized;
    }
    if let Some(inner) = parenthetical {
        if let Some(tag) = inner.split([' ', '/', ',']).find(|part| !part.is_empty()) {
            let candidate = sanitize_codec(tag);
            if candidate != "N/A" {
                return normalize_codec_tag(&candidate);
            }
        }
    }
    "N/A".to_string()
}

fn parse_bitrate(text: &str, duration_secs: u64, patterns: &DiagnosticPatterns) -> Option<f64> {
    let duration = duration_secs.max(1) as f64;

    // Method 1: Statistics line
    if let Some(caps) = patterns.statistics_bytes.captures(text) {
        if let Ok(bytes) = caps[1].parse::<f64>() {
            return Some(bytes * 8.0 / 1000.0 / duration);
        }
    }

    // Method 2: last progress line
    if let Some(caps) = patterns.progress_bitrate.captures_iter(text).last() {
        if let Ok(kbps) = caps[1].parse::<f64>() {
            return Some(kbps);
        }
    }

    // Method 3: bytes read without the Statistics prefix
    if let Some(caps) = patterns.bytes_read.captures(text) {
        if let Ok(bytes) = caps[1].parse::<f64>() {
            return Some(bytes * 8.0 / 1000.0 / duration);
        }
    }

    None
}

/// Parse an inspector diagnostic log
#[must_use]
pub fn parse_diagnostics(text: &str, duration_secs: u64) -> ParsedDiagnostics {
    let patterns = DiagnosticPatterns::get();

    let (video_codec, video_line_span) = match patterns.video_line.captures(text) {
        Some(caps) => {
            let raw = caps.get(1).map_or("", |m| m.as_str());
            let parenthetical = caps.get(2).map(|m| m.as_str());
            let span_start = caps.get(0).map_or(0, |m| m.start());
            (resolve_video_codec(raw, parenthetical), Some(span_start))
        }
        None => ("N/A".to_string(), None),
    };

    // Resolution and fps live on the video line; constrain the search there
    // so progress counters elsewhere in the log cannot match.
    let video_region = video_line_span.map(|start| {
        let end = text[start..].find('\n').map_or(text.len(), |pos| start + pos);
        &text[start..end]
    });

    let resolution = video_region
        .and_then(|line| patterns.resolution.captures(line))
        .and_then(|caps| {
            let width = caps[1].parse::<u32>().ok()?;
            let height = caps[2].parse::<u32>().ok()?;
            Some((width, height))
        });

    let fps = video_region
        .and_then(|line| patterns.fps.captures(line))
        .and_then(|caps| caps[1].parse::<f64>().ok());

    let audio_codec = patterns
        .audio_line
        .captures(text)
        .map_or_else(|| "N/A".to_string(), |caps| sanitize_codec(&caps[1]));

    ParsedDiagnostics {
        resolution,
        fps,
        video_codec,
        audio_codec,
        bitrate_kbps: parse_bitrate(text, duration_secs, patterns),
    }
}
