//! HTTP resource API
//!
//! JSON over plain HTTP/1.1 in front of the reservation registry, so lab
//! tooling on other hosts can claim taps without shelling out to
//! `labvm reserve`. One request per connection.
//!
//! | Method | Path | |
//! | --- | --- | --- |
//! | `GET` | `/health` | liveness and registry location |
//! | `GET` | `/resources` | every current reservation |
//! | `POST` | `/resources/taps` | claim a tap: `{tapnum, mode, tag?, trunks?, owner?}` |

use std::net::SocketAddr;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::ident::TapIndex;
use crate::registry::{Registry, ResourceKey};
use crate::switch::{PortDecl, PortKind, VlanMode};
use crate::Error;

pub const DEFAULT_PORT: u16 = 30001;

/// Owner recorded for taps claimed without an explicit `owner`.
pub const DEFAULT_OWNER: &str = "labvm-serve";

const MAX_REQUEST: usize = 64 * 1024;

#[derive(Clone)]
struct AppState {
    registry: Arc<Registry>,
    pid: u32,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CreateTapRequest {
    tapnum: u16,
    mode: VlanMode,
    #[serde(default)]
    tag: Option<u16>,
    #[serde(default)]
    trunks: Option<Vec<u16>>,
    #[serde(default)]
    owner: Option<String>,
}

/// Bind `addr` and serve until the listener fails.
pub async fn serve(addr: SocketAddr, registry: Registry) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(addr).await?;
    info!("listening on http://{}", listener.local_addr()?);
    serve_listener(listener, registry).await?;
    Ok(())
}

/// Serve on an already bound listener. Claims are recorded with this
/// process's pid, so they go stale when the server exits.
pub async fn serve_listener(listener: TcpListener, registry: Registry) -> std::io::Result<()> {
    let state = AppState {
        registry: Arc::new(registry),
        pid: std::process::id(),
    };

    loop {
        let (stream, peer) = listener.accept().await?;
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_stream(stream, state).await {
                warn!("connection from {peer} failed: {e}");
            }
        });
    }
}

async fn handle_stream(mut stream: TcpStream, state: AppState) -> std::io::Result<()> {
    let raw = read_request(&mut stream).await?;
    if raw.is_empty() {
        return Ok(());
    }

    let req = String::from_utf8_lossy(&raw).to_string();
    let request_line = req.lines().next().unwrap_or("");
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("");
    let path = parts.next().unwrap_or("");
    let body = req.find("\r\n\r\n").map(|idx| &req[idx + 4..]).unwrap_or("");

    debug!("{method} {path}");
    let (status, payload) = route_request(method, path, body, state).await;
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\
         Connection: close\r\n\r\n{}",
        status,
        payload.len(),
        payload
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

/// Read headers and as much body as `Content-Length` announces.
async fn read_request(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(buf);
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() >= MAX_REQUEST || request_complete(&buf) {
            return Ok(buf);
        }
    }
}

fn request_complete(buf: &[u8]) -> bool {
    let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
        return false;
    };
    let headers = String::from_utf8_lossy(&buf[..end]);
    let length = headers
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    buf.len() >= end + 4 + length
}

async fn route_request(method: &str, path: &str, body: &str, state: AppState) -> (String, String) {
    // `/resources/taps/` and `/resources/taps` are the same route
    let path = match path.trim_end_matches('/') {
        "" => "/",
        trimmed => trimmed,
    };
    match (method, path) {
        ("GET", "/health") => (
            "200 OK".to_string(),
            json!({
                "status": "ok",
                "registry": state.registry.path().display().to_string(),
            })
            .to_string(),
        ),
        ("GET", "/resources") => list_resources(state).await,
        ("POST", "/resources/taps") => create_tap(body, state).await,
        _ => (
            "404 Not Found".to_string(),
            json_error("route not found".to_string()),
        ),
    }
}

async fn list_resources(state: AppState) -> (String, String) {
    let registry = state.registry.clone();
    match tokio::task::spawn_blocking(move || registry.list()).await {
        Ok(Ok(reservations)) => (
            "200 OK".to_string(),
            serde_json::to_string(&reservations).unwrap_or_else(|_| "[]".into()),
        ),
        Ok(Err(e)) => internal_error("Failed to list resources", e.to_string()),
        Err(e) => internal_error("Failed to list resources", e.to_string()),
    }
}

async fn create_tap(body: &str, state: AppState) -> (String, String) {
    let req: CreateTapRequest = match serde_json::from_str(body) {
        Ok(r) => r,
        Err(e) => {
            return (
                "400 Bad Request".to_string(),
                json_error(format!("invalid JSON: {e}")),
            )
        }
    };

    let tap = TapIndex::new(req.tapnum);
    let port = PortDecl {
        name: tap.interface_name(),
        kind: PortKind::OvsPort,
        vlan_mode: req.mode,
        tag: req.tag,
        trunks: req.trunks,
    };
    if let Err(e) = port.validate() {
        return ("400 Bad Request".to_string(), json_error(e.to_string()));
    }

    let owner = req
        .owner
        .filter(|o| !o.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_OWNER.to_string());
    let registry = state.registry.clone();
    let (claimer, pid) = (owner.clone(), state.pid);
    let claimed = tokio::task::spawn_blocking(move || {
        registry.claim_new(&claimer, &[ResourceKey::Tap(tap)], pid)
    })
    .await;

    match claimed {
        Ok(Ok(_)) => {
            info!("{} claimed {} ({})", owner, port.name, port.vlan_mode);
            (
                "200 OK".to_string(),
                json!({
                    "status": "success",
                    "tap": port.name,
                    "mode": port.vlan_mode,
                    "owner": owner,
                })
                .to_string(),
            )
        }
        Ok(Err(Error::ResourceInUse { resource, holder })) => (
            "409 Conflict".to_string(),
            json!({
                "status": "Tap already in use",
                "resource": resource,
                "holder": holder,
            })
            .to_string(),
        ),
        Ok(Err(e)) => internal_error("Failed to create tap", e.to_string()),
        Err(e) => internal_error("Failed to create tap", e.to_string()),
    }
}

fn internal_error(status: &str, message: String) -> (String, String) {
    warn!("{status}: {message}");
    (
        "500 Internal Server Error".to_string(),
        json!({"status": status, "error": message}).to_string(),
    )
}

fn json_error(message: String) -> String {
    json!({ "error": message }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_complete_waits_for_body() {
        let head = b"POST /resources/taps HTTP/1.1\r\nContent-Length: 5\r\n\r\n";
        assert!(!request_complete(b"GET /health HTTP/1.1\r\n"));
        assert!(!request_complete(head));

        let mut full = head.to_vec();
        full.extend_from_slice(b"{\"a\":");
        assert!(request_complete(&full));
        assert!(request_complete(b"GET /health HTTP/1.1\r\nHost: x\r\n\r\n"));
    }

    #[test]
    fn test_create_tap_request_shape() {
        let req: CreateTapRequest =
            serde_json::from_str(r#"{"mode": "trunk", "tapnum": 4, "trunks": [20, 30]}"#)
                .unwrap();
        assert_eq!(req.mode, VlanMode::Trunk);
        assert_eq!(req.trunks, Some(vec![20, 30]));
        assert!(req.owner.is_none());

        assert!(serde_json::from_str::<CreateTapRequest>(r#"{"mode": "access"}"#).is_err());
        assert!(serde_json::from_str::<CreateTapRequest>(
            r#"{"mode": "access", "tapnum": 1, "tag": 10, "vlan": 3}"#
        )
        .is_err());
    }
}
