//! Probe results and the machinery that produces them
//!
//! A [`Run`] is the outcome of one `ping -c <count> <host>` invocation:
//! the per-reply [`Observation`]s and the closing [`Summary`] line.
//! [`runner`] spawns the probe, [`parser`] turns its stdout into a `Run`.

pub mod parser;
pub mod runner;

use serde::Serialize;
use std::net::Ipv4Addr;
use thiserror::Error;

pub use parser::parse;
pub use runner::{ProbeConfig, ProbeError, ProbeRunner};

/// Errors raised while turning probe output into a [`Run`]
#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("non-matching line for data transmission line: {0}")]
    Observation(String),
    #[error("non-matching line for summary line: {0}")]
    Summary(String),
    #[error("numeric field out of range: {0}")]
    Number(String),
    #[error("invalid IPv4 address: {0}")]
    Address(String),
    #[error("probe output has no summary line")]
    MissingSummary,
    #[error("summary reports zero packets transmitted")]
    DivisionByZero,
}

/// One "bytes from ..." echo reply
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Observation {
    pub byte_count: u32,
    pub source_address: Ipv4Addr,
    pub sequence_number: u32,
    pub time_to_live: u8,
    pub round_trip_time_ms: f64,
}

/// The "N packets transmitted, M received" line closing a run
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Summary {
    transmitted_count: u32,
    received_count: u32,
    packet_loss_fraction: f64,
}

impl Summary {
    /// Builds a summary, deriving the loss fraction.
    ///
    /// `received > transmitted` is accepted and yields a negative loss.
    pub fn new(transmitted_count: u32, received_count: u32) -> Result<Self, ParseError> {
        if transmitted_count == 0 {
            return Err(ParseError::DivisionByZero);
        }
        let lost = f64::from(transmitted_count) - f64::from(received_count);
        Ok(Self {
            transmitted_count,
            received_count,
            packet_loss_fraction: lost / f64::from(transmitted_count),
        })
    }

    pub fn transmitted_count(&self) -> u32 {
        self.transmitted_count
    }

    pub fn received_count(&self) -> u32 {
        self.received_count
    }

    pub fn packet_loss_fraction(&self) -> f64 {
        self.packet_loss_fraction
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Failure,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Success => write!(f, "success"),
            RunStatus::Failure => write!(f, "failure"),
        }
    }
}

/// The complete result of one probe invocation.
///
/// A successful run always carries a summary; a failed run carries nothing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Run {
    status: RunStatus,
    observations: Vec<Observation>,
    summary: Option<Summary>,
}

impl Run {
    pub fn success(observations: Vec<Observation>, summary: Summary) -> Self {
        Self {
            status: RunStatus::Success,
            observations,
            summary: Some(summary),
        }
    }

    pub fn failure() -> Self {
        Self {
            status: RunStatus::Failure,
            observations: Vec::new(),
            summary: None,
        }
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }

    /// Replies in the order the probe printed them
    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    pub fn summary(&self) -> Option<&Summary> {
        self.summary.as_ref()
    }
}
