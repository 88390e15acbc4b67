//! Minimal blocking `/metrics` endpoint (spec §2 item 9). Runs on its own OS thread so
//! the proposer's event loop stays single-threaded (spec §5); this thread never touches
//! proposer state, only the global Prometheus registry, which is internally thread-safe.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};

use prometheus::{Encoder, TextEncoder};
use tracing::warn;

/// Spawn the metrics listener in the background. Returns immediately; failures to bind
/// are logged and non-fatal, since metrics are an observability aid, not correctness.
pub fn spawn(addr: String) {
    std::thread::spawn(move || {
        let listener = match TcpListener::bind(&addr) {
            Ok(l) => l,
            Err(e) => {
                warn!(%addr, error = %e, "failed to bind metrics listener");
                return;
            }
        };
        tracing::info!(%addr, "metrics endpoint listening");
        for stream in listener.incoming() {
            match stream {
                Ok(s) => serve_one(s),
                Err(e) => warn!(error = %e, "metrics listener accept failed"),
            }
        }
    });
}

fn serve_one(mut stream: TcpStream) {
    let mut buf = [0u8; 1024];
    // We only need to know the request arrived; the Prometheus scraper always does a
    // single `GET /metrics HTTP/1.1` with no body, so one read is enough.
    let _ = stream.read(&mut buf);

    let metric_families = prometheus::gather();
    let mut body = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&metric_families, &mut body) {
        warn!(error = %e, "failed to encode metrics");
        return;
    }

    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        encoder.format_type(),
        body.len()
    );
    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(&body);
}
