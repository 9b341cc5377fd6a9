#![cfg(feature = "http")]

use std::{
    io::{BufRead as _, BufReader, Read as _, Write as _},
    net::TcpListener,
    sync::mpsc,
    thread,
    time::Duration,
};

use metrics_exporter_line::{
    transport::HttpTransport, AggregationKind, LineExporterBuilder, MetricSample, Transport,
    TransportError,
};

#[derive(Debug)]
struct Request {
    request_line: String,
    content_type: Option<String>,
    body: String,
}

/// Serves `responses.len()` requests, answering each with the given status, and reports what it received.
fn serve(responses: Vec<u16>) -> (String, mpsc::Receiver<Request>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::channel();

    thread::spawn(move || {
        for status in responses {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());

            let mut request_line = String::new();
            reader.read_line(&mut request_line).unwrap();

            let mut content_length = 0;
            let mut content_type = None;
            loop {
                let mut header = String::new();
                reader.read_line(&mut header).unwrap();
                let header = header.trim_end();
                if header.is_empty() {
                    break;
                }
                if let Some((name, value)) = header.split_once(':') {
                    match name.to_ascii_lowercase().as_str() {
                        "content-length" => content_length = value.trim().parse().unwrap(),
                        "content-type" => content_type = Some(value.trim().to_string()),
                        _ => {}
                    }
                }
            }

            let mut body = vec![0; content_length];
            reader.read_exact(&mut body).unwrap();

            let mut stream = stream;
            write!(stream, "HTTP/1.1 {status} Whatever\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .unwrap();

            tx.send(Request {
                request_line: request_line.trim_end().to_string(),
                content_type,
                body: String::from_utf8(body).unwrap(),
            })
            .unwrap();
        }
    });

    (format!("http://{addr}/ingest"), rx)
}

#[test]
fn posts_payloads() {
    let (endpoint, requests) = serve(vec![200, 200]);
    let transport = HttpTransport::new(&endpoint, Duration::from_secs(5)).unwrap();

    transport.send("cpu 1 10\nmem 2 10").unwrap();
    let request = requests.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(request.request_line, "POST /ingest HTTP/1.1");
    assert_eq!(request.content_type.as_deref(), Some("text/plain; charset=utf-8"));
    assert_eq!(request.body, "cpu 1 10\nmem 2 10");

    transport.send_to("latency 3 10 p90,10", "p90/10").unwrap();
    let request = requests.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(request.request_line, "POST /ingest/p90/10 HTTP/1.1");
    assert_eq!(request.body, "latency 3 10 p90,10");
}

#[test]
fn reports_unsuccessful_status() {
    let (endpoint, _requests) = serve(vec![503]);
    let transport = HttpTransport::new(&endpoint, Duration::from_secs(5)).unwrap();

    let result = transport.send("cpu 1 10");
    assert!(matches!(result, Err(TransportError::Http { status: 503 })));

    transport.shutdown();
    assert!(matches!(transport.send("cpu 1 10"), Err(TransportError::Shutdown)));
}

#[test]
fn engine_flushes_to_endpoint() {
    let (endpoint, requests) = serve(vec![200, 200]);
    let engine = LineExporterBuilder::default()
        .with_http_endpoint(&endpoint)
        .unwrap()
        .with_flush_interval(Duration::ZERO)
        .with_telemetry(false)
        .build()
        .unwrap();

    engine.put(&MetricSample::new("requests", 1).with_timestamp(10));
    engine.put(
        &MetricSample::new("latency", 5).with_timestamp(10).with_aggregation(AggregationKind::Max),
    );
    engine.force_sync_flush();

    let mut received = vec![
        requests.recv_timeout(Duration::from_secs(5)).unwrap(),
        requests.recv_timeout(Duration::from_secs(5)).unwrap(),
    ];
    received.sort_by(|a, b| a.request_line.cmp(&b.request_line));

    assert_eq!(received[0].request_line, "POST /ingest HTTP/1.1");
    assert_eq!(received[0].body, "requests 1 10");
    assert_eq!(received[1].request_line, "POST /ingest/max/60 HTTP/1.1");
    assert_eq!(received[1].body, "latency 5 10 max,60");
}

#[test]
fn flushes_from_within_async_runtime() {
    let (endpoint, requests) = serve(vec![200, 200]);
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();

    runtime.block_on(async {
        let engine = LineExporterBuilder::default()
            .with_http_endpoint(&endpoint)
            .unwrap()
            .with_flush_interval(Duration::ZERO)
            .with_telemetry(false)
            .build()
            .unwrap();

        engine.put(&MetricSample::new("requests", 1).with_timestamp(10));
        engine.force_sync_flush();
        engine.put(&MetricSample::new("requests", 2).with_timestamp(11));
        engine.shutdown();

        // Dropping an engine inside the runtime must not tear down a runtime either.
        let dropped = LineExporterBuilder::default()
            .with_http_endpoint(&endpoint)
            .unwrap()
            .with_telemetry(false)
            .build()
            .unwrap();
        drop(dropped);
    });

    let first = requests.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(first.request_line, "POST /ingest HTTP/1.1");
    assert_eq!(first.body, "requests 1 10");

    let second = requests.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(second.body, "requests 2 11");
}
