//! Wire types shared with the process manager's REST API.
use serde::{Deserialize, Serialize};

/// Body of `POST /processes`.
#[derive(Debug, Serialize)]
pub struct CreateProcess<'a> {
    pub cmd: &'a str,
}

/// A process record as returned by the service.
///
/// Only `uuid` is required; the creation call is accepted from services
/// that return nothing else.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ProcessInfo {
    pub uuid: String,
    #[serde(default)]
    pub cmd: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub log: String,
}
