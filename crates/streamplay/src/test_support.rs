//! Minimal HTTP server for transport tests.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;

use crossbeam_channel::Receiver;

#[derive(Debug, Clone)]
pub(crate) struct CapturedRequest {
    /// Request line plus headers.
    pub(crate) head: String,
    pub(crate) body: Vec<u8>,
}

impl CapturedRequest {
    pub(crate) fn request_line(&self) -> &str {
        self.head.lines().next().unwrap_or_default()
    }

    pub(crate) fn header(&self, name: &str) -> Option<&str> {
        self.head.lines().skip(1).find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim().eq_ignore_ascii_case(name).then(|| value.trim())
        })
    }
}

/// Build a complete `Connection: close` response.
pub(crate) fn http_response(status: &str, content_type: &str, body: &[u8]) -> Vec<u8> {
    let mut out = format!(
        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    )
    .into_bytes();
    out.extend_from_slice(body);
    out
}

/// Answer one connection per response, in order. Returns the base URL and the
/// captured requests.
pub(crate) fn serve(responses: Vec<Vec<u8>>) -> (String, Receiver<CapturedRequest>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = crossbeam_channel::unbounded();
    thread::spawn(move || {
        for response in responses {
            let Ok((mut conn, _)) = listener.accept() else {
                return;
            };
            let request = read_request(&mut conn);
            let _ = conn.write_all(&response);
            let _ = tx.send(request);
        }
    });
    (format!("http://{addr}"), rx)
}

/// Serve a single raw response; returns a URL pointing at it.
pub(crate) fn serve_once(response: Vec<u8>) -> String {
    let (base, _) = serve(vec![response]);
    format!("{base}/stream")
}

fn read_request(conn: &mut TcpStream) -> CapturedRequest {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if conn.read(&mut byte).unwrap_or(0) == 0 {
            break;
        }
        head.push(byte[0]);
    }
    let head = String::from_utf8_lossy(&head).to_string();
    let mut request = CapturedRequest { head, body: Vec::new() };
    let length = request
        .header("Content-Length")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = vec![0u8; length];
    if conn.read_exact(&mut body).is_ok() {
        request.body = body;
    }
    request
}
