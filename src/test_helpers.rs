//! Shared test utilities: a loopback HTTP server with scripted replies.
//!
//! `reqwest` against a real socket exercises the whole fetch pipeline,
//! including responses a well-behaved server library would refuse to produce:
//! a body shorter than its `Content-Length`, or no length at all.
//!
//! # Usage
//!
//! ```rust
//! use crate::test_helpers::{Reply, TestServer};
//!
//! let server = TestServer::start(vec![
//!     ("/0", Reply::image("image/jpeg", vec![0; 1024])),
//!     ("/1", Reply::truncated("image/jpeg", 1024, vec![0; 900])),
//! ]).await;
//!
//! fetcher.fetch(&store, &server.url("/0"), None, &dest, &mut |_, _, _| {}).await?;
//! assert_eq!(server.requests()[0].path, "/0");
//! ```
//!
//! Unknown paths answer `404 Not Found`. Every response closes its connection,
//! except [`Reply::stalled`] ones, which hang mid-body.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

// =========================================================================
// Scripted replies
// =========================================================================

#[derive(Debug, Clone)]
pub struct Reply {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    /// Value of `Content-Length`, if one is sent. May differ from `body.len()`.
    declared_length: Option<usize>,
    /// Hold the connection open after the body instead of closing it.
    stall: bool,
}

impl Reply {
    /// `200 OK` with a correct `Content-Length`.
    pub fn image(content_type: &str, body: Vec<u8>) -> Self {
        Self {
            status: 200,
            headers: vec![("Content-Type".into(), content_type.into())],
            declared_length: Some(body.len()),
            body,
            stall: false,
        }
    }

    /// `200 OK` declaring `declared` bytes but sending only `body`.
    pub fn truncated(content_type: &str, declared: usize, body: Vec<u8>) -> Self {
        Self {
            declared_length: Some(declared),
            ..Self::image(content_type, body)
        }
    }

    /// Like [`Reply::truncated`], but the connection stays open, so the
    /// client waits for bytes that never come.
    pub fn stalled(content_type: &str, declared: usize, body: Vec<u8>) -> Self {
        Self {
            stall: true,
            ..Self::truncated(content_type, declared, body)
        }
    }

    /// Empty response with the given status.
    pub fn status(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
            declared_length: Some(0),
            stall: false,
        }
    }

    /// Omit `Content-Length`; the body is delimited by closing the connection.
    pub fn without_length(mut self) -> Self {
        self.declared_length = None;
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    fn encode_head(&self) -> Vec<u8> {
        let mut head = format!("HTTP/1.1 {} {}\r\n", self.status, reason(self.status));
        for (name, value) in &self.headers {
            head.push_str(&format!("{name}: {value}\r\n"));
        }
        if let Some(length) = self.declared_length {
            head.push_str(&format!("Content-Length: {length}\r\n"));
        }
        head.push_str("Connection: close\r\n\r\n");
        head.into_bytes()
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        403 => "Forbidden",
        404 => "Not Found",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

// =========================================================================
// Server
// =========================================================================

/// What the server saw for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub path: String,
    pub referer: Option<String>,
}

pub struct TestServer {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    task: JoinHandle<()>,
}

impl TestServer {
    pub async fn start(routes: Vec<(&str, Reply)>) -> Self {
        let routes: Arc<HashMap<String, Reply>> = Arc::new(
            routes
                .into_iter()
                .map(|(path, reply)| (path.to_string(), reply))
                .collect(),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));

        let recorded = Arc::clone(&requests);
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let routes = Arc::clone(&routes);
                let recorded = Arc::clone(&recorded);
                tokio::spawn(async move {
                    let _ = serve(stream, &routes, &recorded).await;
                });
            }
        });

        Self {
            addr,
            requests,
            task,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(
    mut stream: TcpStream,
    routes: &HashMap<String, Reply>,
    recorded: &Mutex<Vec<RecordedRequest>>,
) -> std::io::Result<()> {
    let head = read_head(&mut stream).await?;
    let mut lines = head.lines();
    let path = lines
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/")
        .to_string();
    let referer = lines.find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.trim()
            .eq_ignore_ascii_case("referer")
            .then(|| value.trim().to_string())
    });
    recorded.lock().push(RecordedRequest {
        path: path.clone(),
        referer,
    });

    let not_found = Reply::status(404);
    let reply = routes.get(&path).unwrap_or(&not_found);
    stream.write_all(&reply.encode_head()).await?;
    stream.write_all(&reply.body).await?;
    stream.flush().await?;
    if reply.stall {
        tokio::time::sleep(Duration::from_secs(60)).await;
    }
    stream.shutdown().await
}

/// Read up to the blank line ending the request head. GET requests carry no body.
async fn read_head(stream: &mut TcpStream) -> std::io::Result<String> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn serves_routes_and_records_referer() {
        let server = TestServer::start(vec![("/a", Reply::image("image/png", b"png".to_vec()))]).await;
        let client = reqwest::Client::new();

        let response = client
            .get(server.url("/a"))
            .header("Referer", "http://ref/")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);
        assert_eq!(response.content_length(), Some(3));
        assert_eq!(response.bytes().await.unwrap().as_ref(), b"png");

        let missing = client.get(server.url("/b")).send().await.unwrap();
        assert_eq!(missing.status().as_u16(), 404);

        let requests = server.requests();
        assert_eq!(requests[0].path, "/a");
        assert_eq!(requests[0].referer.as_deref(), Some("http://ref/"));
        assert_eq!(requests[1].referer, None);
    }
}
