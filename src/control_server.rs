//! HTTP control endpoint for operators driving a cutover.
//!
//! One request per connection, JSON responses. Routes:
//!
//! - `GET /health`
//! - `GET /lag` - latest lag snapshot for every observed partition
//! - `GET /lag/<partition>` - one snapshot, e.g. `/lag/cdc.public.users[3]`
//! - `GET /state` - gate state, gate history and per-partition worker status
//! - `POST /cutover` - 200 when accepted, 409 with the rejection reason otherwise
//! - `POST /writes-paused` and `POST /writes-resumed` - source write signal
//! - `POST /force-ready` - body `{"operator": "...", "reason": "..."}`
//! - `POST /resume/<partition>` - release a partition blocked on a schema change

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use cdc_core::PartitionId;
use pipeline::{ControlError, ControlHandle, CutoverDecision, OperatorOverride};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

const MAX_BODY_BYTES: usize = 64 * 1024;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A status code and JSON body.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub body: Value,
}

impl Response {
    fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    fn error(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({ "error": message.into() }),
        }
    }

    fn serialized<T: Serialize>(status: u16, value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(body) => Self { status, body },
            Err(e) => Self::error(500, format!("failed to serialize response: {e}")),
        }
    }

    fn reason_phrase(&self) -> &'static str {
        match self.status {
            200 => "OK",
            400 => "Bad Request",
            404 => "Not Found",
            405 => "Method Not Allowed",
            409 => "Conflict",
            413 => "Payload Too Large",
            _ => "Internal Server Error",
        }
    }

    fn to_http(&self) -> String {
        let body = self.body.to_string();
        format!(
            "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            self.status,
            self.reason_phrase(),
            body.len(),
            body
        )
    }
}

/// Route one request against the running pipeline.
pub async fn handle_request(
    control: &ControlHandle,
    method: &str,
    path: &str,
    body: &[u8],
) -> Response {
    let path = path.split('?').next().unwrap_or(path);
    match (method, path) {
        ("GET", "/health") => Response::ok(json!({ "status": "healthy" })),
        ("GET", "/lag") => Response::serialized(200, &control.lag_snapshots().await),
        ("GET", "/state") => Response::serialized(200, &control.status().await),
        ("POST", "/cutover") => match control.request_cutover() {
            decision @ CutoverDecision::Accepted => Response::serialized(200, &decision),
            decision @ CutoverDecision::Rejected(_) => Response::serialized(409, &decision),
        },
        ("POST", "/writes-paused") => {
            control.signal_writes_paused();
            gate_response(control)
        }
        ("POST", "/writes-resumed") => {
            control.signal_writes_resumed();
            gate_response(control)
        }
        ("POST", "/force-ready") => match serde_json::from_slice::<OperatorOverride>(body) {
            Ok(operator) => match control.force_ready(operator) {
                Ok(()) => gate_response(control),
                Err(e) => control_error(e),
            },
            Err(e) => Response::error(400, format!("invalid json: {e}")),
        },
        ("GET", p) if p.starts_with("/lag/") => match parse_partition(&p["/lag/".len()..]) {
            Ok(partition) => match control.get_lag_snapshot(&partition).await {
                Some(snapshot) => Response::serialized(200, &snapshot),
                None => Response::error(404, format!("no lag observation for {partition}")),
            },
            Err(response) => response,
        },
        ("POST", p) if p.starts_with("/resume/") => {
            match parse_partition(&p["/resume/".len()..]) {
                Ok(partition) => match control.resume_partition(&partition) {
                    Ok(()) => Response::ok(json!({ "resumed": partition.to_string() })),
                    Err(e) => control_error(e),
                },
                Err(response) => response,
            }
        }
        (_, "/health" | "/lag" | "/state" | "/cutover" | "/writes-paused" | "/writes-resumed" | "/force-ready") => {
            Response::error(405, format!("{method} not allowed on {path}"))
        }
        _ => Response::error(404, "not found"),
    }
}

fn gate_response(control: &ControlHandle) -> Response {
    Response::ok(json!({ "gate": control.gate_state().to_string() }))
}

fn control_error(error: ControlError) -> Response {
    let status = match error {
        ControlError::UnknownPartition(_) => 404,
        ControlError::NotBlocked { .. } | ControlError::InvalidOverride(_) => 409,
    };
    Response::error(status, error.to_string())
}

fn parse_partition(raw: &str) -> std::result::Result<PartitionId, Response> {
    let decoded = percent_decode(raw);
    decoded
        .parse()
        .map_err(|e| Response::error(400, format!("invalid partition '{decoded}': {e}")))
}

/// Decode `%XX` escapes; anything malformed is kept as written.
fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(byte) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Accepts connections until the task is dropped or aborted.
pub struct ControlServer {
    listener: TcpListener,
}

impl ControlServer {
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind control endpoint to {addr}"))?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to read control endpoint address")
    }

    pub async fn serve(self, control: ControlHandle) {
        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    let control = control.clone();
                    tokio::spawn(async move {
                        match tokio::time::timeout(
                            REQUEST_TIMEOUT,
                            handle_connection(stream, &control),
                        )
                        .await
                        {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => warn!("Error handling control request from {addr}: {e:#}"),
                            Err(_) => warn!("Control request from {addr} timed out"),
                        }
                    });
                }
                Err(e) => {
                    warn!("Error accepting control connection: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

async fn handle_connection(mut stream: TcpStream, control: &ControlHandle) -> Result<()> {
    let (read_half, mut write_half) = stream.split();
    let mut reader = BufReader::new(read_half);

    let mut request_line = String::new();
    if reader.read_line(&mut request_line).await? == 0 {
        anyhow::bail!("Empty request");
    }
    let mut parts = request_line.split_whitespace();
    let (method, path) = match (parts.next(), parts.next()) {
        (Some(method), Some(path)) => (method.to_string(), path.to_string()),
        _ => anyhow::bail!("Malformed request line: {}", request_line.trim_end()),
    };

    let mut content_length: usize = 0;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().unwrap_or(0);
            }
        }
    }

    let response = if content_length > MAX_BODY_BYTES {
        Response::error(413, format!("body larger than {MAX_BODY_BYTES} bytes"))
    } else {
        let mut body = vec![0u8; content_length];
        reader.read_exact(&mut body).await?;
        debug!("Control request: {} {}", method, path);
        handle_request(control, &method, &path, &body).await
    };
    if method == "POST" && response.status == 200 {
        info!("Control: {} {} -> {}", method, path, response.body);
    }

    write_half
        .write_all(response.to_http().as_bytes())
        .await?;
    write_half.flush().await?;
    Ok(())
}
