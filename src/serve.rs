//! HTTP server exposing the session statistics as JSON
//!
//! `netcheck serve -d netcheck.db` → `GET /api/responsetimes`, `GET /api/gaps`
//!
//! Rows are sent as arrays, `[timestamp, mean_ms, standard_error_ms]` and
//! `[timestamp, delta_seconds]`, wrapped in `{"results": [...]}`. `mean_ms`
//! is `null` for a session without replies. The database is never created
//! or modified here.

use crate::db::{Store, StoreOptions};
use crate::Error;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tiny_http::{Header, Method, Request, Response, Server};

#[derive(Serialize)]
struct ApiResponse<T> {
    results: T,
}

#[derive(Serialize)]
struct ApiError {
    error: String,
}

#[derive(Deserialize, Debug, Default, PartialEq)]
pub struct StatsParams {
    pub limit: Option<u32>,
}

/// Bind `host:port` and serve until the process is stopped
pub fn start(host: &str, port: u16, db_path: PathBuf) -> Result<(), Error> {
    let addr = format!("{}:{}", host, port);
    let server = Server::http(&addr).map_err(|e| io::Error::other(e.to_string()))?;
    info!("serving {} on http://{}", db_path.display(), addr);

    for request in server.incoming_requests() {
        if let Err(e) = handle_request(request, &db_path) {
            warn!("request failed: {}", e);
        }
    }

    Ok(())
}

fn handle_request(request: Request, db_path: &Path) -> io::Result<()> {
    let url = request.url().to_string();
    let method = request.method().clone();
    info!("{} {}", method, url);

    match route(&method, &url, db_path) {
        Some(body) => respond_json(request, body),
        None => request.respond(Response::from_string("Not found").with_status_code(404)),
    }
}

/// JSON body for an API request, `None` when nothing is served at `url`
fn route(method: &Method, url: &str, db_path: &Path) -> Option<Result<String, String>> {
    let mut parts = url.splitn(2, '?');
    let path = parts.next().unwrap_or("/");
    let params = parse_params(parts.next());

    match (method, path) {
        (Method::Get, "/api/responsetimes") => Some(query(db_path, |store| {
            let rows = store.response_times(params.limit)?;
            Ok(rows
                .iter()
                .map(|r| (r.timestamp, r.mean_ms, r.standard_error_ms))
                .collect::<Vec<_>>())
        })),

        (Method::Get, "/api/gaps") => Some(query(db_path, |store| {
            let rows = store.gaps(params.limit)?;
            Ok(rows
                .iter()
                .map(|g| (g.timestamp, g.delta_seconds))
                .collect::<Vec<_>>())
        })),

        _ => None,
    }
}

/// Unknown or malformed parameters fall back to no limit
pub fn parse_params(query: Option<&str>) -> StatsParams {
    query
        .and_then(|q| serde_urlencoded::from_str::<StatsParams>(q).ok())
        .unwrap_or_default()
}

// Each request gets its own handle; nothing is shared between requests.
// SQLite creates missing files on connect, so the read path checks first.
fn query<T, F>(db_path: &Path, f: F) -> Result<String, String>
where
    T: Serialize,
    F: FnOnce(&mut Store) -> crate::db::Result<T>,
{
    if !db_path.is_file() {
        return Err(format!("no database at {}", db_path.display()));
    }
    let options = StoreOptions {
        clear: false,
        create: false,
    };
    let mut store = Store::open(db_path, options).map_err(|e| e.to_string())?;
    let results = f(&mut store).map_err(|e| e.to_string())?;
    serde_json::to_string(&ApiResponse { results }).map_err(|e| e.to_string())
}

fn respond_json(request: Request, body: Result<String, String>) -> io::Result<()> {
    let (status, json) = match body {
        Ok(json) => (200, json),
        Err(error) => (500, serde_json::to_string(&ApiError { error })?),
    };
    let header = Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..])
        .map_err(|_| io::Error::other("invalid content-type header"))?;
    request.respond(Response::from_string(json).with_status_code(status).with_header(header))
}
