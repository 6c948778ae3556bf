//! One-shot HTTP server for exercising the `ureq` clients in unit tests.

use anyhow::{anyhow, bail, Result};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::thread::JoinHandle;
use std::time::Duration;

pub(crate) struct CapturedRequest {
    pub request_line: String,
    /// Header names are lowercased.
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

pub(crate) struct StubServer {
    pub base_url: String,
    handle: JoinHandle<Result<CapturedRequest>>,
}

impl StubServer {
    /// The request the server received.
    pub fn request(self) -> Result<CapturedRequest> {
        self.handle
            .join()
            .map_err(|_| anyhow!("stub server thread panicked"))?
    }
}

/// Accept one connection, record its request and answer with `status` and `body`.
pub(crate) fn serve_once(status: u16, body: &str) -> Result<StubServer> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let base_url = format!("http://{}", listener.local_addr()?);
    let body = body.to_string();
    let handle = std::thread::spawn(move || -> Result<CapturedRequest> {
        let (mut stream, _) = listener.accept()?;
        stream.set_read_timeout(Some(Duration::from_secs(5)))?;

        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        let header_end = loop {
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
            let n = stream.read(&mut chunk)?;
            if n == 0 {
                bail!("connection closed before end of headers");
            }
            buf.extend_from_slice(&chunk[..n]);
        };

        let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
        let mut lines = head.split("\r\n");
        let request_line = lines.next().unwrap_or_default().to_string();
        let headers: BTreeMap<String, String> = lines
            .filter_map(|line| line.split_once(':'))
            .map(|(name, value)| (name.trim().to_ascii_lowercase(), value.trim().to_string()))
            .collect();
        let length = headers
            .get("content-length")
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(0);
        let mut request_body = buf[header_end..].to_vec();
        while request_body.len() < length {
            let n = stream.read(&mut chunk)?;
            if n == 0 {
                break;
            }
            request_body.extend_from_slice(&chunk[..n]);
        }

        let reason = if (200..300).contains(&status) { "OK" } else { "Error" };
        write!(
            stream,
            "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            reason,
            body.len(),
            body
        )?;
        stream.flush()?;

        Ok(CapturedRequest {
            request_line,
            headers,
            body: request_body,
        })
    });
    Ok(StubServer { base_url, handle })
}
