//! Parser for the textual output of `ping`
//!
//! Only two kinds of lines carry data. Reply lines:
//!
//! ```text
//! 64 bytes from 93.184.216.34: icmp_seq=0 ttl=53 time=91.755 ms
//! ```
//!
//! and the statistics line, which differs between BSD/macOS and the
//! iputils/busybox variants found on Linux and small devices:
//!
//! ```text
//! 1 packets transmitted, 1 packets received, 0.0% packet loss
//! 1 packets transmitted, 1 received, 0% packet loss, time 0ms
//! ```
//!
//! Every other line (banner, round-trip footer) is ignored. A line that
//! looks like data but does not match its pattern is an error: it means
//! the probe speaks a format we do not understand.

use super::{Observation, ParseError, Run, Summary};
use log::debug;
use regex::{Captures, Regex};
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::LazyLock;

static OBSERVATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        ^(?P<nbytes>\d+)\s+
        bytes\s+from\s+
        (?P<ip_addr>(?:\d{1,3}\.){3}\d{1,3}):\s+
        icmp_seq=(?P<icmp_seq>\d+)\s+
        ttl=(?P<ttl>\d+)\s+
        time=(?P<time_ms>\d+(?:\.\d+)?)\s+ms$",
    )
    .expect("observation pattern compiles")
});

static SUMMARY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        ^(?P<n_transmitted>\d+)(?:\s+packets)?\s+transmitted,\s+
        (?P<n_received>\d+)(?:\s+packets)?\s+received,\s+
        .*$",
    )
    .expect("summary pattern compiles")
});

// The word "packets" is optional on the summary line, so the trigger is
// either the desktop phrase or "<N> transmitted,".
static SUMMARY_TRIGGER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+\s+transmitted,").expect("summary trigger compiles"));

const OBSERVATION_TRIGGER: &str = "bytes from";
const SUMMARY_TRIGGER: &str = "packets transmitted";

enum LineKind {
    Observation,
    Summary,
    Other,
}

fn classify(line: &str) -> LineKind {
    if line.contains(OBSERVATION_TRIGGER) {
        LineKind::Observation
    } else if line.contains(SUMMARY_TRIGGER) || SUMMARY_TRIGGER_RE.is_match(line) {
        LineKind::Summary
    } else {
        LineKind::Other
    }
}

/// Parses the stdout of a probe that exited successfully.
///
/// Replies are returned in output order. If several summary lines appear
/// the last one wins; if none appears the output is rejected.
pub fn parse(raw: &str) -> Result<Run, ParseError> {
    let mut observations = Vec::new();
    let mut summary = None;

    for line in raw.lines().map(str::trim_end) {
        if line.is_empty() {
            continue;
        }

        match classify(line) {
            LineKind::Observation => {
                debug!("found data transmission line");
                let observation = parse_observation(line)?;
                debug!("ping result: {:?}", observation);
                observations.push(observation);
            }
            LineKind::Summary => {
                debug!("found summary line");
                let parsed = parse_summary(line)?;
                debug!("summary result: {:?}", parsed);
                summary = Some(parsed);
            }
            LineKind::Other => {}
        }
    }

    let summary = summary.ok_or(ParseError::MissingSummary)?;
    Ok(Run::success(observations, summary))
}

/// Parses a single "bytes from" reply line
pub fn parse_observation(line: &str) -> Result<Observation, ParseError> {
    let caps = OBSERVATION_RE
        .captures(line)
        .ok_or_else(|| ParseError::Observation(line.to_string()))?;

    let source_address = caps["ip_addr"]
        .parse::<Ipv4Addr>()
        .map_err(|_| ParseError::Address(line.to_string()))?;

    Ok(Observation {
        byte_count: field(&caps, "nbytes", line)?,
        source_address,
        sequence_number: field(&caps, "icmp_seq", line)?,
        time_to_live: field(&caps, "ttl", line)?,
        round_trip_time_ms: field(&caps, "time_ms", line)?,
    })
}

/// Parses a "transmitted, received" statistics line
pub fn parse_summary(line: &str) -> Result<Summary, ParseError> {
    let caps = SUMMARY_RE
        .captures(line)
        .ok_or_else(|| ParseError::Summary(line.to_string()))?;

    Summary::new(
        field(&caps, "n_transmitted", line)?,
        field(&caps, "n_received", line)?,
    )
}

fn field<T: FromStr>(caps: &Captures<'_>, name: &str, line: &str) -> Result<T, ParseError> {
    caps[name]
        .parse()
        .map_err(|_| ParseError::Number(line.to_string()))
}
