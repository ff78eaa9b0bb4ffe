//! Launch-and-follow flow: create the remote process, then copy its live
//! log to an output line by line until the service closes the stream.
use crate::client::{ClientError, ProcessClient};
use crate::lines::LineDecoder;
use reqwest::Response;
use std::io::Write;

/// Outcome of a completed tail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailSummary {
    /// Identifier of the process that was followed.
    pub uuid: String,
    /// Non-empty lines written to the output.
    pub lines: u64,
    /// Raw body bytes received.
    pub bytes: u64,
}

/// Start `cmd` on the service and follow its live log into `out`.
///
/// Creation finishes (body parsed, id extracted) before the stream is
/// requested. Any failure ends the run; nothing is retried.
pub async fn launch_and_tail<W: Write>(
    client: &ProcessClient,
    cmd: &str,
    out: &mut W,
) -> Result<TailSummary, ClientError> {
    let uuid = client.create(cmd).await?;
    tail_process(client, &uuid, out).await
}

/// Follow the live log of an existing process into `out`.
pub async fn tail_process<W: Write>(
    client: &ProcessClient,
    uuid: &str,
    out: &mut W,
) -> Result<TailSummary, ClientError> {
    let response = client.live_log(uuid).await?;
    let (lines, bytes) = follow(response, out).await?;
    tracing::info!(uuid, lines, bytes, "live log closed by server");
    Ok(TailSummary {
        uuid: uuid.to_string(),
        lines,
        bytes,
    })
}

/// Drain a streamed body, writing each non-empty line followed by `\n`
/// and flushing after every line. The response is owned here so the
/// connection is released on return, error or not.
///
/// Waits indefinitely for the next chunk; there is no read timeout.
async fn follow<W: Write>(
    mut response: Response,
    out: &mut W,
) -> Result<(u64, u64), ClientError> {
    let url = response.url().to_string();
    let mut decoder = LineDecoder::new();
    let mut lines = 0u64;
    let mut bytes = 0u64;

    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| ClientError::Request {
            url: url.clone(),
            source: e,
        })?
    {
        bytes += chunk.len() as u64;
        tracing::trace!(len = chunk.len(), "live log chunk");
        decoder.push(&chunk);
        while let Some(line) = decoder.next_line() {
            emit(out, &line?)?;
            lines += 1;
        }
    }

    if let Some(line) = decoder.finish()? {
        emit(out, &line)?;
        lines += 1;
    }

    Ok((lines, bytes))
}

fn emit<W: Write>(out: &mut W, line: &str) -> Result<(), ClientError> {
    writeln!(out, "{line}").map_err(ClientError::Output)?;
    out.flush().map_err(ClientError::Output)
}
