//! Preview HTTP server.
//!
//! Plain HTTP/1.1, one GET per connection, answered from a `PreviewSlot`:
//!
//! - `/health`: liveness probe.
//! - `/frame.jpg`: newest encoded frame, 404 until the first one arrives.
//! - `/stats`: `PreviewStats` as JSON.

use anyhow::{anyhow, bail, Context, Result};
use std::borrow::Cow;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::stream::PreviewSlot;

/// Upper bound on request line plus headers.
const MAX_HEAD_BYTES: u64 = 8192;
const ACCEPT_POLL: Duration = Duration::from_millis(20);
const READ_TIMEOUT: Duration = Duration::from_secs(2);

pub struct PreviewServer {
    addr: String,
}

/// Running server. Dropping it stops the listener thread.
#[derive(Debug)]
pub struct PreviewHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl PreviewHandle {
    pub fn stop(mut self) -> Result<()> {
        self.halt()
    }

    fn halt(&mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        match self.join.take() {
            Some(join) => join
                .join()
                .map_err(|_| anyhow!("preview server on {} panicked", self.addr)),
            None => Ok(()),
        }
    }
}

impl Drop for PreviewHandle {
    fn drop(&mut self) {
        if let Err(err) = self.halt() {
            log::warn!("PreviewServer: {:#}", err);
        }
    }
}

impl PreviewServer {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    /// Bind and start answering requests on a background thread.
    ///
    /// A loopback address must stay loopback after binding.
    pub fn spawn(self, slot: PreviewSlot) -> Result<PreviewHandle> {
        let requested: SocketAddr = self
            .addr
            .parse()
            .with_context(|| format!("invalid preview address '{}'", self.addr))?;
        let listener = TcpListener::bind(requested)
            .with_context(|| format!("bind preview server to {}", requested))?;
        let addr = listener.local_addr()?;
        if requested.ip().is_loopback() != addr.ip().is_loopback() {
            bail!("preview server asked for {} but bound {}", requested, addr);
        }
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let stop_flag = shutdown.clone();
        let join = std::thread::Builder::new()
            .name("preview".to_string())
            .spawn(move || accept_loop(listener, slot, stop_flag))?;
        log::info!("PreviewServer: listening on http://{}", addr);

        Ok(PreviewHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn accept_loop(listener: TcpListener, slot: PreviewSlot, shutdown: Arc<AtomicBool>) {
    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((conn, peer)) => {
                if let Err(err) = answer(conn, &slot) {
                    log::warn!("PreviewServer: request from {} failed: {:#}", peer, err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
            }
            Err(err) => {
                log::error!("PreviewServer: accept failed, shutting down: {}", err);
                return;
            }
        }
    }
}

struct Response {
    status: u16,
    content_type: &'static str,
    body: Cow<'static, [u8]>,
}

impl Response {
    fn json(status: u16, body: &'static str) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: Cow::Borrowed(body.as_bytes()),
        }
    }

    fn reason(&self) -> &'static str {
        match self.status {
            200 => "OK",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            _ => "Internal Server Error",
        }
    }

    fn send(&self, conn: &mut TcpStream) -> Result<()> {
        write!(
            conn,
            "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
            self.status,
            self.reason(),
            self.content_type,
            self.body.len()
        )?;
        conn.write_all(&self.body)?;
        conn.flush()?;
        Ok(())
    }
}

fn answer(mut conn: TcpStream, slot: &PreviewSlot) -> Result<()> {
    // Accepted sockets can inherit the listener's non-blocking flag.
    conn.set_nonblocking(false)?;
    conn.set_read_timeout(Some(READ_TIMEOUT))?;

    let local_only = conn.local_addr()?.ip().is_loopback();
    let response = if local_only && !conn.peer_addr()?.ip().is_loopback() {
        Response::json(403, r#"{"error":"forbidden"}"#)
    } else {
        let (method, path) = read_head(&conn)?;
        route(&method, &path, slot)?
    };
    response.send(&mut conn)
}

fn route(method: &str, path: &str, slot: &PreviewSlot) -> Result<Response> {
    if method != "GET" {
        return Ok(Response::json(405, r#"{"error":"method_not_allowed"}"#));
    }
    let response = match path {
        "/health" => Response::json(200, r#"{"status":"ok"}"#),
        "/frame.jpg" => match slot.latest()? {
            Some(jpeg) => Response {
                status: 200,
                content_type: "image/jpeg",
                body: Cow::Owned(jpeg.as_ref().clone()),
            },
            None => Response::json(404, r#"{"error":"no_frame"}"#),
        },
        "/stats" => Response {
            status: 200,
            content_type: "application/json",
            body: Cow::Owned(serde_json::to_vec(&slot.stats()?)?),
        },
        _ => Response::json(404, r#"{"error":"not_found"}"#),
    };
    Ok(response)
}

/// Method and query-less path of the request; headers are read and dropped.
fn read_head(conn: &TcpStream) -> Result<(String, String)> {
    let mut reader = BufReader::new(conn.take(MAX_HEAD_BYTES));
    let mut line = String::new();
    reader.read_line(&mut line).context("read request line")?;
    let mut words = line.split_whitespace();
    let (Some(method), Some(target)) = (words.next(), words.next()) else {
        bail!("malformed request line {:?}", line.trim_end());
    };
    let path = target.split_once('?').map_or(target, |(path, _)| path);
    let head = (method.to_string(), path.to_string());

    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 || line.trim_end().is_empty() {
            break;
        }
    }
    Ok(head)
}
