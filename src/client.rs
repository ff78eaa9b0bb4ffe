//! HTTP client for the process manager's REST API.
use crate::api::{CreateProcess, ProcessInfo};
use crate::config::ServerConfig;
use crate::lines::LineDecodeError;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::{Response, StatusCode, Url};

/// Errors from talking to the process manager.
#[derive(Debug)]
pub enum ClientError {
    /// The configured base URL is not a usable http(s) URL.
    InvalidUrl { url: String, reason: String },
    /// Building the HTTP client failed.
    Build(reqwest::Error),
    /// Connecting, sending, or reading the body failed.
    Request { url: String, source: reqwest::Error },
    /// The service answered with a non-success status.
    Status { url: String, status: StatusCode },
    /// A response body was not the expected JSON.
    Parse {
        url: String,
        status: StatusCode,
        source: serde_json::Error,
    },
    /// The creation call returned an empty identifier.
    EmptyProcessId,
    /// A streamed log line was not valid UTF-8.
    Decode(LineDecodeError),
    /// Writing a line to the output failed.
    Output(std::io::Error),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::InvalidUrl { url, reason } => {
                write!(f, "invalid service URL {url}: {reason}")
            }
            ClientError::Build(e) => write!(f, "failed to build HTTP client: {e}"),
            ClientError::Request { url, source } => {
                write!(f, "request to {url} failed: {source}")
            }
            ClientError::Status { url, status } => {
                write!(f, "{url} returned HTTP {status}")
            }
            ClientError::Parse {
                url,
                status,
                source,
            } => write!(
                f,
                "failed to parse response from {url} (HTTP {status}): {source}"
            ),
            ClientError::EmptyProcessId => {
                write!(f, "service returned an empty process identifier")
            }
            ClientError::Decode(e) => write!(f, "{e}"),
            ClientError::Output(e) => write!(f, "failed to write log output: {e}"),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClientError::Build(e) => Some(e),
            ClientError::Request { source, .. } => Some(source),
            ClientError::Parse { source, .. } => Some(source),
            ClientError::Decode(e) => Some(e),
            ClientError::Output(e) => Some(e),
            ClientError::InvalidUrl { .. }
            | ClientError::Status { .. }
            | ClientError::EmptyProcessId => None,
        }
    }
}

impl From<LineDecodeError> for ClientError {
    fn from(e: LineDecodeError) -> Self {
        ClientError::Decode(e)
    }
}

/// Client bound to one process manager's `/processes` collection.
///
/// No request timeout is configured: the live log stream may legitimately
/// stay open for as long as the remote command runs.
#[derive(Debug, Clone)]
pub struct ProcessClient {
    http: reqwest::Client,
    base: Url,
}

impl ProcessClient {
    pub fn new(server: &ServerConfig) -> Result<Self, ClientError> {
        Self::with_base_url(&server.processes_url())
    }

    /// Build a client for an explicit collection URL such as
    /// `http://127.0.0.1:8080/api/v1/processes`.
    pub fn with_base_url(base: &str) -> Result<Self, ClientError> {
        let invalid = |reason: &str| ClientError::InvalidUrl {
            url: base.to_string(),
            reason: reason.to_string(),
        };
        let base = Url::parse(base).map_err(|e| invalid(&e.to_string()))?;
        if base.cannot_be_a_base() || !matches!(base.scheme(), "http" | "https") {
            return Err(invalid("expected an http(s) URL"));
        }

        // Every call, including the GETs, carries the JSON content type.
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(ClientError::Build)?;

        Ok(Self { http, base })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// URL of a single process, `<base>/<id>`, with the id percent-encoded as one segment.
    pub fn process_url(&self, id: &str) -> Url {
        self.url_with(&[id])
    }

    /// URL of a process's live log, `<base>/<id>/live_log`.
    pub fn live_log_url(&self, id: &str) -> Url {
        self.url_with(&[id, "live_log"])
    }

    fn url_with(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        // Checked in the constructor: base is an http(s) URL.
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    /// Start `cmd` on the service and return its identifier.
    ///
    /// The body is parsed whatever the status: an error page that is not
    /// JSON surfaces as [`ClientError::Parse`] carrying that status.
    pub async fn create(&self, cmd: &str) -> Result<String, ClientError> {
        let url = self.base.clone();
        tracing::debug!(%url, cmd, "creating remote process");

        let response = self
            .http
            .post(url.clone())
            .json(&CreateProcess { cmd })
            .send()
            .await
            .map_err(|e| request_error(&url, e))?;

        let info: ProcessInfo = read_json(&url, response).await?;
        if info.uuid.is_empty() {
            return Err(ClientError::EmptyProcessId);
        }
        tracing::info!(uuid = %info.uuid, cmd, "remote process created");
        Ok(info.uuid)
    }

    /// Open the live log stream of process `id`.
    ///
    /// Fails before any body byte is read if the status is not a success.
    pub async fn live_log(&self, id: &str) -> Result<Response, ClientError> {
        let url = self.live_log_url(id);
        tracing::debug!(%url, "opening live log");

        let response = self
            .http
            .get(url.clone())
            .send()
            .await
            .map_err(|e| request_error(&url, e))?;
        check_status(&url, &response)?;
        Ok(response)
    }

    /// List all processes known to the service.
    pub async fn list(&self) -> Result<Vec<ProcessInfo>, ClientError> {
        let url = self.base.clone();
        let response = self
            .http
            .get(url.clone())
            .send()
            .await
            .map_err(|e| request_error(&url, e))?;
        check_status(&url, &response)?;
        read_json(&url, response).await
    }

    /// Fetch one process, including its buffered log.
    pub async fn get(&self, id: &str) -> Result<ProcessInfo, ClientError> {
        let url = self.process_url(id);
        let response = self
            .http
            .get(url.clone())
            .send()
            .await
            .map_err(|e| request_error(&url, e))?;
        check_status(&url, &response)?;
        read_json(&url, response).await
    }

    /// Kill process `id` and remove it from the service.
    pub async fn kill(&self, id: &str) -> Result<(), ClientError> {
        let url = self.process_url(id);
        let response = self
            .http
            .delete(url.clone())
            .send()
            .await
            .map_err(|e| request_error(&url, e))?;
        check_status(&url, &response)?;
        tracing::info!(uuid = id, "remote process killed");
        Ok(())
    }
}

fn request_error(url: &Url, source: reqwest::Error) -> ClientError {
    ClientError::Request {
        url: url.to_string(),
        source,
    }
}

fn check_status(url: &Url, response: &Response) -> Result<(), ClientError> {
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(ClientError::Status {
            url: url.to_string(),
            status,
        })
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(
    url: &Url,
    response: Response,
) -> Result<T, ClientError> {
    let status = response.status();
    let body = response
        .bytes()
        .await
        .map_err(|e| request_error(url, e))?;
    serde_json::from_slice(&body).map_err(|e| ClientError::Parse {
        url: url.to_string(),
        status,
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> ProcessClient {
        ProcessClient::new(&ServerConfig::default()).unwrap()
    }

    #[test]
    fn test_base_url_from_config() {
        assert_eq!(
            client().base_url().as_str(),
            "http://localhost:8080/api/v1/processes"
        );
    }

    #[test]
    fn test_live_log_url() {
        assert_eq!(
            client().live_log_url("abc-123").as_str(),
            "http://localhost:8080/api/v1/processes/abc-123/live_log"
        );
    }

    #[test]
    fn test_process_url_tolerates_trailing_slash() {
        let client =
            ProcessClient::with_base_url("http://localhost:8080/api/v1/processes/").unwrap();
        assert_eq!(
            client.process_url("p1").as_str(),
            "http://localhost:8080/api/v1/processes/p1"
        );
    }

    #[test]
    fn test_id_is_a_single_path_segment() {
        let url = client().live_log_url("a/b c");
        assert_eq!(url.path(), "/api/v1/processes/a%2Fb%20c/live_log");
    }

    #[test]
    fn test_rejects_non_http_base() {
        let err = ProcessClient::with_base_url("mailto:ops@example.com").unwrap_err();
        assert!(matches!(err, ClientError::InvalidUrl { .. }));
        let err = ProcessClient::with_base_url("not a url").unwrap_err();
        assert!(matches!(err, ClientError::InvalidUrl { .. }));
    }

    #[test]
    fn test_status_error_display() {
        let err = ClientError::Status {
            url: "http://localhost:8080/api/v1/processes/x/live_log".to_string(),
            status: StatusCode::NOT_FOUND,
        };
        assert_eq!(
            err.to_string(),
            "http://localhost:8080/api/v1/processes/x/live_log returned HTTP 404 Not Found"
        );
    }
}
