use std::io::{Read, Write};
use std::net::TcpStream;

use anyhow::Result;
use image::{Rgb, RgbImage};

use detect_stream::display::{PreviewServer, PreviewSlot, StreamConfig, StreamSink};
use detect_stream::{Frame, OutputSink, OverlayPlan, PerfEstimate};

fn request(addr: std::net::SocketAddr, method: &str, path: &str) -> Result<(String, Vec<u8>)> {
    let mut stream = TcpStream::connect(addr)?;
    write!(stream, "{} {} HTTP/1.1\r\nHost: localhost\r\n\r\n", method, path)?;
    let mut response = Vec::new();
    stream.read_to_end(&mut response)?;
    let split = response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("header terminator");
    let head = String::from_utf8_lossy(&response[..split]).to_string();
    Ok((head, response[split + 4..].to_vec()))
}

#[test]
fn serves_health_frames_and_stats() -> Result<()> {
    let slot = PreviewSlot::new();
    let handle = PreviewServer::new("127.0.0.1:0").spawn(slot.clone())?;

    let (head, body) = request(handle.addr, "GET", "/health")?;
    assert!(head.starts_with("HTTP/1.1 200"));
    assert_eq!(body, br#"{"status":"ok"}"#);

    let (head, body) = request(handle.addr, "GET", "/frame.jpg")?;
    assert!(head.starts_with("HTTP/1.1 404"));
    assert_eq!(body, br#"{"error":"no_frame"}"#);

    slot.publish(vec![0xFF, 0xD8, 0xFF, 0xD9], 7, None)?;
    let (head, body) = request(handle.addr, "GET", "/frame.jpg")?;
    assert!(head.starts_with("HTTP/1.1 200"));
    assert!(head.contains("Content-Type: image/jpeg"));
    assert_eq!(body, vec![0xFF, 0xD8, 0xFF, 0xD9]);

    let (_, body) = request(handle.addr, "GET", "/stats")?;
    let stats: serde_json::Value = serde_json::from_slice(&body)?;
    assert_eq!(stats["frames"], 1);
    assert_eq!(stats["frame_index"], 7);

    let (head, _) = request(handle.addr, "POST", "/frame.jpg")?;
    assert!(head.starts_with("HTTP/1.1 405"));
    let (head, _) = request(handle.addr, "GET", "/nope")?;
    assert!(head.starts_with("HTTP/1.1 404"));

    handle.stop()?;
    Ok(())
}

#[test]
fn stream_sink_publishes_latest_frame_only() -> Result<()> {
    let mut sink = StreamSink::new(StreamConfig {
        preview_addr: Some("127.0.0.1:0".to_string()),
        ..StreamConfig::default()
    })?;
    let addr = sink.preview_addr().expect("preview server");
    let estimate = PerfEstimate {
        mean_ms: 10.0,
        fps: 100.0,
    };

    for (index, value) in [(1, 0u8), (2, 255u8)] {
        let frame = Frame::new(RgbImage::from_pixel(32, 16, Rgb([value, value, value])), index);
        sink.emit(&frame, &OverlayPlan::default(), Some(&estimate))?;
    }

    let (head, body) = request(addr, "GET", "/frame.jpg")?;
    assert!(head.starts_with("HTTP/1.1 200"));
    let decoded = image::load_from_memory(&body)?.into_rgb8();
    assert_eq!(decoded.dimensions(), (32, 16));
    assert!(decoded.get_pixel(16, 8).0[0] > 200, "older frame served");

    let (_, body) = request(addr, "GET", "/stats")?;
    let stats: serde_json::Value = serde_json::from_slice(&body)?;
    assert_eq!(stats["frames"], 2);
    assert_eq!(stats["fps"], 100.0);

    sink.close();
    assert!(request(addr, "GET", "/health").is_err(), "server still running");
    Ok(())
}
