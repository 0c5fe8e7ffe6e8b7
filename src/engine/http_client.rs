use anyhow::Result;
use http::{Request, Response};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tokio::time::{Duration, Instant};

/// Size and latency of one exchange, as reported to the request metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RequestTimings {
    /// Time from sending the request to the last byte of the body.
    pub duration: Duration,
    pub waiting: Duration,
    pub receiving: Duration,
    pub request_size: usize,
    pub response_size: usize,
}

/// Pooled HTTP/1.1 client shared by every VU of a run.
#[derive(Clone)]
pub struct HttpClient {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
}

impl HttpClient {
    pub fn new() -> Self {
        Self::with_pool_size(2000)
    }

    /// `pool_size` is the maximum number of idle connections kept per host.
    pub fn with_pool_size(pool_size: usize) -> Self {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .build();

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(pool_size)
            .build(https);

        Self { client }
    }

    /// Send a request and read the whole body. The body is always drained,
    /// which keeps the connection reusable.
    pub async fn request(&self, req: Request<Bytes>) -> Result<(Response<Bytes>, RequestTimings)> {
        let request_start = Instant::now();
        let request_size = approx_request_size(&req);

        let (parts, body) = req.into_parts();
        let response = self
            .client
            .request(Request::from_parts(parts, Full::new(body)))
            .await?;
        let headers_received = Instant::now();

        let (parts, body_stream) = response.into_parts();
        let body = body_stream.collect().await?.to_bytes();
        let receive_end = Instant::now();

        // Status line plus headers plus the blank line.
        let mut response_size = body.len() + 15 + 2;
        for (k, v) in parts.headers.iter() {
            response_size += k.as_str().len() + 2 + v.len() + 2;
        }

        let timings = RequestTimings {
            duration: receive_end.duration_since(request_start),
            waiting: headers_received.duration_since(request_start),
            receiving: receive_end.duration_since(headers_received),
            request_size,
            response_size,
        };
        Ok((Response::from_parts(parts, body), timings))
    }
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

fn approx_request_size<B: AsRef<[u8]>>(req: &Request<B>) -> usize {
    let mut size = req.body().as_ref().len();
    size += req.method().as_str().len() + 1 + req.uri().to_string().len() + 11;
    for (k, v) in req.headers() {
        size += k.as_str().len() + 2 + v.len() + 2;
    }
    size + 2
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve every connection with the same canned response. Returns the
    /// base URL.
    pub(crate) async fn canned_server(status: u16, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 8192];
                    loop {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(_) => {}
                        }
                        let response = format!(
                            "HTTP/1.1 {} X\r\ncontent-length: {}\r\ncontent-type: text/plain\r\n\r\n{}",
                            status,
                            body.len(),
                            body
                        );
                        if socket.write_all(response.as_bytes()).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
        format!("http://{}", addr)
    }

    #[test]
    fn test_approx_request_size() {
        let req = Request::builder()
            .uri("http://localhost/a")
            .header("x-a", "b")
            .body(Bytes::from_static(b"hello"))
            .unwrap();
        // body + "GET " + uri + " HTTP/1.1\r\n" + header line + final CRLF
        assert_eq!(approx_request_size(&req), 5 + 4 + 18 + 11 + 8 + 2);
    }

    #[tokio::test]
    async fn test_request_reads_body() {
        let base = canned_server(200, "hello").await;
        let client = HttpClient::with_pool_size(4);
        let req = Request::builder()
            .uri(format!("{}/ping", base))
            .body(Bytes::new())
            .unwrap();

        let (response, timings) = client.request(req).await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.body().as_ref(), b"hello");
        assert!(timings.response_size > 5);
        assert!(timings.duration >= timings.waiting);
    }

    #[tokio::test]
    async fn test_connection_refused_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = HttpClient::with_pool_size(1);
        let req = Request::builder()
            .uri(format!("http://{}/", addr))
            .body(Bytes::new())
            .unwrap();
        assert!(client.request(req).await.is_err());
    }
}
