//! SQL functions registered on every store connection
//!
//! `sqrt(x)` and the aggregate `std(x)` (population standard deviation)
//! let the statistics queries compute the standard error of the mean
//! inside SQLite, one group at a time.

use diesel::expression::functions::define_sql_function;
use diesel::prelude::*;
use diesel::sql_types::{Double, Nullable};
use diesel::sqlite::{SqliteAggregateFunction, SqliteConnection};
use log::debug;

define_sql_function! {
    #[sql_name = "sqrt"]
    fn sql_sqrt(x: Double) -> Double;
}

define_sql_function! {
    #[aggregate]
    #[sql_name = "std"]
    fn population_std(x: Nullable<Double>) -> Double;
}

/// Registers `sqrt` and `std` on `conn`. This is the default extension
/// set passed to [`Store::open_with`](crate::db::Store::open_with).
pub fn register(conn: &mut SqliteConnection) -> QueryResult<()> {
    debug!("registering sql functions sqrt, std");
    sql_sqrt_utils::register_impl(conn, |x: f64| x.sqrt())?;
    population_std_utils::register_impl::<StdDev, _>(conn)?;
    Ok(())
}

/// Accumulator behind `std(x)`.
///
/// Keeps every value of the group and does the two passes at the end.
/// Groups are one session's replies, so they stay small.
#[derive(Debug, Default, Clone)]
pub struct StdDev {
    values: Vec<f64>,
}

impl StdDev {
    pub fn push(&mut self, value: f64) {
        self.values.push(value);
    }

    pub fn value(&self) -> f64 {
        population_std_dev(&self.values)
    }
}

// NULL inputs come from sessions without replies (outer join) and are skipped
impl SqliteAggregateFunction<Option<f64>> for StdDev {
    type Output = f64;

    fn step(&mut self, value: Option<f64>) {
        if let Some(value) = value {
            self.push(value);
        }
    }

    // SQLite passes no accumulator when the group had no rows
    fn finalize(aggregator: Option<Self>) -> f64 {
        aggregator.map(|agg| agg.value()).unwrap_or(0.0)
    }
}

/// Population standard deviation; 0.0 for an empty slice
pub fn population_std_dev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
    variance.sqrt()
}
