//! Shared helpers for integration tests: a canned-response HTTP server and
//! a recording [`RemoteStorage`] mock.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use corsair::client::RemoteStorage;
use corsair::error::SendError;
use corsair::sample::{LabelSet, Sample};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// A request as seen by the mock server.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    /// Header names are lowercased.
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

/// A response the mock server replays.
#[derive(Debug, Clone)]
pub struct CannedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl CannedResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

/// Minimal HTTP/1.1 server answering each connection with the next scripted
/// response, or with `fallback` once the script runs out.
pub struct MockServer {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl MockServer {
    pub async fn start(script: Vec<CannedResponse>, fallback: CannedResponse) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let script = Arc::new(Mutex::new(VecDeque::from(script)));

        let recorded = Arc::clone(&requests);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let recorded = Arc::clone(&recorded);
                let script = Arc::clone(&script);
                let fallback = fallback.clone();
                tokio::spawn(async move {
                    handle(stream, recorded, script, fallback).await;
                });
            }
        });

        Self { addr, requests }
    }

    /// Serves `response` to every request.
    pub async fn always(response: CannedResponse) -> Self {
        Self::start(Vec::new(), response).await
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

async fn handle(
    mut stream: TcpStream,
    recorded: Arc<Mutex<Vec<RecordedRequest>>>,
    script: Arc<Mutex<VecDeque<CannedResponse>>>,
    fallback: CannedResponse,
) {
    let Some(request) = read_request(&mut stream).await else {
        return;
    };
    recorded.lock().unwrap().push(request);

    let response = script.lock().unwrap().pop_front().unwrap_or(fallback);
    let mut head = format!(
        "HTTP/1.1 {} Canned\r\nContent-Length: {}\r\nConnection: close\r\n",
        response.status,
        response.body.len()
    );
    for (name, value) in &response.headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str("\r\n");

    let _ = stream.write_all(head.as_bytes()).await;
    let _ = stream.write_all(&response.body).await;
    let _ = stream.shutdown().await;
}

async fn read_request(stream: &mut TcpStream) -> Option<RecordedRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let head_end = loop {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next()?.split_whitespace();
    let method = request_line.next()?.to_string();
    let path = request_line.next()?.to_string();

    let headers: HashMap<String, String> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_ascii_lowercase(), value.trim().to_string()))
        .collect();

    let content_length: usize = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let mut body = buf[head_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }

    Some(RecordedRequest {
        method,
        path,
        headers,
        body,
    })
}

/// Records every batch it is handed and always succeeds.
#[derive(Default)]
pub struct RecordingStorage {
    batches: Mutex<Vec<(tokio::time::Instant, Vec<Sample>)>>,
}

impl RecordingStorage {
    pub fn batches(&self) -> Vec<(tokio::time::Instant, Vec<Sample>)> {
        self.batches.lock().unwrap().clone()
    }

    pub fn samples(&self) -> Vec<Sample> {
        self.batches()
            .into_iter()
            .flat_map(|(_, batch)| batch)
            .collect()
    }
}

impl RemoteStorage for RecordingStorage {
    async fn store(&self, batch: &[Sample]) -> Result<(), SendError> {
        self.batches
            .lock()
            .unwrap()
            .push((tokio::time::Instant::now(), batch.to_vec()));
        Ok(())
    }

    fn name(&self) -> &str {
        "recording"
    }
}

/// Never completes a send.
#[derive(Default)]
pub struct StuckStorage;

impl RemoteStorage for StuckStorage {
    async fn store(&self, _batch: &[Sample]) -> Result<(), SendError> {
        std::future::pending().await
    }

    fn name(&self) -> &str {
        "stuck"
    }
}

/// A sample of series `up{series="<series>"}` at timestamp `ts`.
pub fn sample(series: usize, ts: i64) -> Sample {
    let labels: LabelSet = [("__name__", "up".to_string()), ("series", series.to_string())]
        .into_iter()
        .collect();
    Sample::new(labels, ts, 1.0).unwrap()
}
