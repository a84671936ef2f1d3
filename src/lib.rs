//! netcheck - track network reachability and latency with `ping`
//!
//! netcheck runs the system `ping` against a host, parses what it prints,
//! and keeps every run as a timestamped session in SQLite. The stored
//! sessions feed two statistics: the mean response time of each session
//! with its standard error, and the time between consecutive sessions.
//!
//! # Quick Start
//!
//! ```no_run
//! use netcheck::{ProbeRunner, Store, StoreOptions};
//!
//! let mut store = Store::open("netcheck.db", StoreOptions::default())?;
//! let runner = ProbeRunner::default();
//!
//! match netcheck::check(&mut store, &runner, "93.184.216.34", 3)? {
//!     Some(session) => println!("stored session {}", session),
//!     None => println!("host unreachable, nothing stored"),
//! }
//!
//! for row in store.response_times(Some(10))? {
//!     match row.mean_ms {
//!         Some(mean) => println!("{} {:.3} ± {:.3} ms", row.timestamp, mean, row.standard_error_ms),
//!         None => println!("{} no replies", row.timestamp),
//!     }
//! }
//! # Ok::<(), netcheck::Error>(())
//! ```
//!
//! # Modules
//!
//! - [`probe`]: result types, the `ping` runner and its output parser
//! - [`db`]: the session store and statistics queries
//! - [`functions`]: the `sqrt` and `std` SQL functions the queries rely on
//! - [`serve`]: read-only JSON API over the statistics

pub mod db;
pub mod functions;
pub mod probe;
pub mod schema;
pub mod serve;

pub use db::{DbError, Gap, ResponseTime, SessionRecord, Store, StoreOptions};
pub use probe::{
    Observation, ParseError, ProbeConfig, ProbeError, ProbeRunner, Run, RunStatus, Summary,
};

use log::{info, warn};
use thiserror::Error;

/// Any failure of a probe-and-store cycle
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Probe `host` and store the run.
///
/// Returns the new session id, or `None` when the probe failed; a failed
/// run writes nothing. Parse and upload errors abort the whole cycle.
pub fn check(store: &mut Store, runner: &ProbeRunner, host: &str, count: u32) -> Result<Option<String>, Error> {
    let run = runner.perform(host, count)?;
    if !run.is_success() {
        warn!("ping to {} failed, nothing stored", host);
        return Ok(None);
    }

    if let Some(summary) = run.summary() {
        info!(
            "{} replies, {:.1}% packet loss",
            run.observations().len(),
            summary.packet_loss_fraction() * 100.0
        );
    }
    let session = store.upload(run)?;
    info!("stored session {}", session);
    Ok(Some(session))
}
