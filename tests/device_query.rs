//! Geometry discovery against a tiny local HTTP responder

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tracing::Span;

use ledcast::discovery::{DeviceScanner, HostProbe, HttpProbe};
use ledcast::streamer::udp::{UdpStreamer, UdpTarget};
use ledcast::streamer::DeviceStreamer;
use ledcast::{DeviceGeometry, StreamError, TransformSettings};

const MATRIX_INFO: &str =
    r#"{"leds":{"count":288,"matrix":{"w":24,"h":12}},"ip":"127.0.0.1","name":"desk","ver":"0.14.0"}"#;
const STRIP_INFO: &str = r#"{"leds":{"count":60},"ip":"127.0.0.1","name":"strip"}"#;

/// Serves `/json` and `/json/info` from one info document and records request paths
async fn serve_wled(info: &'static str) -> (u16, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let paths = Arc::new(Mutex::new(Vec::new()));
    let seen = paths.clone();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let seen = seen.clone();
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let head = String::from_utf8_lossy(&request);
                let path = head
                    .split_whitespace()
                    .nth(1)
                    .unwrap_or_default()
                    .to_string();
                seen.lock().unwrap().push(path.clone());

                let body = match path.as_str() {
                    "/json" => format!(r#"{{"state":{{"on":true}},"info":{}}}"#, info),
                    "/json/info" => info.to_string(),
                    _ => String::new(),
                };
                let status = if body.is_empty() { "404 Not Found" } else { "200 OK" };
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    (port, paths)
}

#[tokio::test]
async fn http_probe_reads_matrix_from_json() {
    let (port, paths) = serve_wled(MATRIX_INFO).await;
    let probe = HttpProbe::new(std::time::Duration::from_secs(2), port);

    let device = probe.probe(Ipv4Addr::LOCALHOST).await.unwrap();
    assert_eq!(device.ip, "127.0.0.1");
    assert_eq!((device.width, device.height), (24, 12));
    assert_eq!(*paths.lock().unwrap(), vec!["/json".to_string()]);
}

#[tokio::test]
async fn http_probe_ignores_non_matrix_devices() {
    let (port, _) = serve_wled(STRIP_INFO).await;
    let probe = HttpProbe::new(std::time::Duration::from_secs(2), port);
    assert!(probe.probe(Ipv4Addr::LOCALHOST).await.is_none());
}

#[tokio::test]
async fn scanner_finds_the_local_responder() {
    let (port, _) = serve_wled(MATRIX_INFO).await;
    let scanner = DeviceScanner::new(
        HttpProbe::new(std::time::Duration::from_secs(2), port),
        4,
        Span::none(),
    );
    let found = scanner.scan_first(vec![Ipv4Addr::LOCALHOST]).await;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].width, 24);
}

#[tokio::test]
async fn udp_streamer_queries_unknown_geometry() {
    let (http_port, paths) = serve_wled(MATRIX_INFO).await;
    let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let target = UdpTarget {
        host: "127.0.0.1".into(),
        port: device.local_addr().unwrap().port(),
        http_port,
    };

    let mut streamer = UdpStreamer::connect(&target, &TransformSettings::default(), Span::none())
        .await
        .unwrap();
    assert_eq!(streamer.transformer().geometry(), DeviceGeometry::new(24, 12));
    assert_eq!(*paths.lock().unwrap(), vec!["/json/info".to_string()]);

    assert_eq!(
        streamer.query_geometry().await.unwrap(),
        DeviceGeometry::new(24, 12)
    );
    streamer.close().await.unwrap();
}

#[tokio::test]
async fn udp_streamer_without_matrix_info_fails() {
    let (http_port, _) = serve_wled(STRIP_INFO).await;
    let target = UdpTarget {
        http_port,
        ..UdpTarget::new("127.0.0.1")
    };

    let result =
        UdpStreamer::connect(&target, &TransformSettings::default(), Span::none()).await;
    assert!(matches!(
        result,
        Err(StreamError::GeometryUnavailable { .. })
    ));
}
