use std::{
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use http_body_util::{BodyExt as _, Full};
use hyper::{
    body::Bytes,
    header::CONTENT_TYPE,
    http::uri::{InvalidUri, PathAndQuery},
    Method, Request, Uri,
};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use parking_lot::Mutex;
use tokio::runtime::Runtime;
use tracing::{debug, trace};

use super::{Transport, TransportError};

type HttpClient = Client<HttpConnector, Full<Bytes>>;

struct PostRequest {
    uri: Uri,
    body: Bytes,
    reply: Sender<Result<(), TransportError>>,
}

/// Sends payloads to an HTTP endpoint as `POST` requests with a `text/plain` body.
///
/// Per-destination sends are posted to the destination appended as a path below the endpoint, so a batch for the
/// `p90/10` destination of `http://collector:8080/ingest` goes to `http://collector:8080/ingest/p90/10`.
///
/// Requests are performed on a dedicated background thread that owns a single-threaded Tokio runtime. Callers only
/// wait for the reply, so the transport can be used from plain threads as well as from within an async runtime.
pub struct HttpTransport {
    endpoint: Uri,
    requests: Mutex<Option<Sender<PostRequest>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl HttpTransport {
    /// Creates a new `HttpTransport` posting to `endpoint`.
    ///
    /// # Errors
    ///
    /// If the endpoint is not a valid URI, or the runtime or its thread cannot be created, an error is returned.
    pub fn new(endpoint: &str, request_timeout: Duration) -> Result<Self, TransportError> {
        let endpoint = parse_uri(endpoint)?;
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(30))
            .build_http();

        let (requests_tx, requests_rx) = unbounded();
        let thread = thread::Builder::new()
            .name("metrics-exporter-line-http".to_string())
            .spawn(move || run_requests(&runtime, &client, request_timeout, &requests_rx))?;

        Ok(HttpTransport {
            endpoint,
            requests: Mutex::new(Some(requests_tx)),
            thread: Mutex::new(Some(thread)),
        })
    }

    fn post(&self, uri: Uri, payload: &str) -> Result<(), TransportError> {
        let requests = self.requests.lock().clone().ok_or(TransportError::Shutdown)?;

        let (reply_tx, reply_rx) = bounded(1);
        let request =
            PostRequest { uri, body: Bytes::copy_from_slice(payload.as_bytes()), reply: reply_tx };
        requests.send(request).map_err(|_| TransportError::Shutdown)?;

        reply_rx.recv().unwrap_or_else(|_| {
            Err(TransportError::Request { reason: "HTTP request thread stopped".to_string() })
        })
    }
}

impl Transport for HttpTransport {
    fn send(&self, payload: &str) -> Result<(), TransportError> {
        self.post(self.endpoint.clone(), payload)
    }

    fn send_to(&self, payload: &str, destination: &str) -> Result<(), TransportError> {
        let uri = destination_uri(&self.endpoint, destination)?;
        self.post(uri, payload)
    }

    fn shutdown(&self) {
        // Closing the channel stops the request thread once in-flight requests are done.
        drop(self.requests.lock().take());

        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                debug!("HTTP request thread panicked.");
            }
        }
    }

    fn transport_id(&self) -> &'static str {
        "http"
    }
}

fn run_requests(
    runtime: &Runtime,
    client: &HttpClient,
    request_timeout: Duration,
    requests: &Receiver<PostRequest>,
) {
    for PostRequest { uri, body, reply } in requests {
        let result = runtime.block_on(perform(client, uri, body, request_timeout));
        let _ = reply.send(result);
    }

    trace!("HTTP request thread stopped.");
}

async fn perform(
    client: &HttpClient,
    uri: Uri,
    body: Bytes,
    request_timeout: Duration,
) -> Result<(), TransportError> {
    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Full::new(body))
        .map_err(|e| TransportError::Request { reason: e.to_string() })?;

    let response = tokio::time::timeout(request_timeout, client.request(request))
        .await
        .map_err(|_| TransportError::Request { reason: "request timed out".to_string() })?
        .map_err(|e| TransportError::Request { reason: e.to_string() })?;

    let status = response.status();

    // Read the body to completion so the connection can go back to the pool.
    let _ = response.into_body().collect().await;

    if status.is_success() {
        trace!(status = status.as_u16(), "Posted payload.");
        Ok(())
    } else {
        Err(TransportError::Http { status: status.as_u16() })
    }
}

fn parse_uri(uri: &str) -> Result<Uri, TransportError> {
    uri.parse::<Uri>().map_err(|e| invalid_uri(&e))
}

fn invalid_uri(e: &InvalidUri) -> TransportError {
    TransportError::Request { reason: e.to_string() }
}

fn destination_uri(endpoint: &Uri, destination: &str) -> Result<Uri, TransportError> {
    let base = endpoint.path().trim_end_matches('/');
    let destination = destination.trim_start_matches('/');
    let path_and_query = match endpoint.query() {
        Some(query) => format!("{base}/{destination}?{query}"),
        None => format!("{base}/{destination}"),
    };

    let mut parts = endpoint.clone().into_parts();
    parts.path_and_query = Some(path_and_query.parse::<PathAndQuery>().map_err(|e| invalid_uri(&e))?);
    Uri::from_parts(parts).map_err(|e| TransportError::Request { reason: e.to_string() })
}

#[cfg(test)]
mod tests {
    use hyper::Uri;

    use super::destination_uri;

    #[test]
    fn destinations() {
        let endpoint = "http://collector:8080/ingest".parse::<Uri>().unwrap();
        assert_eq!(
            destination_uri(&endpoint, "p90/10").unwrap(),
            "http://collector:8080/ingest/p90/10"
        );

        let endpoint = "http://collector:8080/".parse::<Uri>().unwrap();
        assert_eq!(destination_uri(&endpoint, "/avg/60").unwrap(), "http://collector:8080/avg/60");

        let endpoint = "http://collector:8080".parse::<Uri>().unwrap();
        assert_eq!(destination_uri(&endpoint, "sum/30").unwrap(), "http://collector:8080/sum/30");
    }

    #[test]
    fn destinations_keep_the_query() {
        let endpoint = "http://collector/ingest?token=abc&region=eu".parse::<Uri>().unwrap();
        assert_eq!(
            destination_uri(&endpoint, "p90/10").unwrap(),
            "http://collector/ingest/p90/10?token=abc&region=eu"
        );
    }
}
