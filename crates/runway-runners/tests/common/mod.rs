//! Minimal HTTP stub for tests that talk to a collaborator or a CI
//! master: binds an ephemeral port, answers one request per connection
//! with whatever the responder closure returns, then closes.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// `(method, path) -> (status, extra headers, JSON body)`.
pub type Responder =
    dyn Fn(&str, &str) -> (u16, Vec<(String, String)>, String) + Send + Sync + 'static;

pub async fn spawn_stub(respond: Arc<Responder>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind stub");
    let base = format!("http://{}", listener.local_addr().expect("stub addr"));
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let respond = respond.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 64 * 1024];
                let mut read = 0;
                // The request line and headers are all we route on, but
                // the body still gets drained so the client is not cut
                // off mid-send.
                let mut body_end = None;
                loop {
                    if let Some(end) = body_end {
                        if read >= end {
                            break;
                        }
                    }
                    match socket.read(&mut buf[read..]).await {
                        Ok(0) => break,
                        Ok(n) => {
                            read += n;
                            if body_end.is_none() {
                                if let Some(pos) =
                                    buf[..read].windows(4).position(|w| w == b"\r\n\r\n")
                                {
                                    let head = String::from_utf8_lossy(&buf[..pos]).to_string();
                                    let length = head
                                        .lines()
                                        .find_map(|line| {
                                            line.to_ascii_lowercase()
                                                .strip_prefix("content-length:")
                                                .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                                        })
                                        .unwrap_or(0);
                                    body_end = Some(pos + 4 + length);
                                }
                            }
                            if read == buf.len() {
                                break;
                            }
                        }
                        Err(_) => return,
                    }
                }
                let request = String::from_utf8_lossy(&buf[..read]).to_string();
                let mut parts = request.split_whitespace();
                let method = parts.next().unwrap_or("").to_string();
                let path = parts.next().unwrap_or("").to_string();
                let (status, headers, body) = respond(&method, &path);
                let mut response = format!(
                    "HTTP/1.1 {status} OK\r\nContent-Type: application/json\r\n\
                     Content-Length: {}\r\nConnection: close\r\n",
                    body.len()
                );
                for (name, value) in headers {
                    response.push_str(&format!("{name}: {value}\r\n"));
                }
                response.push_str("\r\n");
                response.push_str(&body);
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    base
}
