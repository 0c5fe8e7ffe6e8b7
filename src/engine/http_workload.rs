use anyhow::anyhow;
use async_trait::async_trait;
use http::header::{HeaderName, HeaderValue, COOKIE};
use http::{HeaderMap, Method, Request, Uri};
use hyper::body::Bytes;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::time::{Duration, Instant};

use super::executor::{RequestSample, VuContext, Workload};
use super::http_client::{HttpClient, RequestTimings};
use crate::error::ConfigError;
use crate::utils::parse_optional_duration;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// A fixed sequence of HTTP requests executed once per iteration.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, JsonSchema)]
pub struct HttpWorkloadConfig {
    /// Prepended to request URLs that start with `/`
    #[serde(default, alias = "baseUrl")]
    pub base_url: Option<String>,
    /// Headers sent with every request
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Cookies sent with every request
    #[serde(default)]
    pub cookies: BTreeMap<String, String>,
    pub requests: Vec<RequestConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, JsonSchema)]
pub struct RequestConfig {
    /// Value of the `name` tag; defaults to the URL
    pub name: Option<String>,
    /// HTTP method (default: GET)
    pub method: Option<String>,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub cookies: BTreeMap<String, String>,
    pub body: Option<String>,
    /// Request timeout (default: 60s)
    pub timeout: Option<String>,
    #[serde(default)]
    pub checks: Vec<CheckConfig>,
}

/// A named assertion on a response. Every condition that is set must hold.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, JsonSchema)]
pub struct CheckConfig {
    pub name: String,
    /// Exact status code
    pub status: Option<u16>,
    /// Status code strictly below this value
    #[serde(alias = "statusBelow")]
    pub status_below: Option<u16>,
    /// Request duration strictly below this (e.g. "1000ms")
    #[serde(alias = "maxDuration")]
    pub max_duration: Option<String>,
    /// Body contains this text
    #[serde(alias = "bodyContains")]
    pub body_contains: Option<String>,
    /// Body length at least this many bytes
    #[serde(alias = "bodyMinLen")]
    pub body_min_len: Option<usize>,
    /// Body length at most this many bytes
    #[serde(alias = "bodyMaxLen")]
    pub body_max_len: Option<usize>,
}

#[derive(Debug)]
struct Check {
    name: String,
    status: Option<u16>,
    status_below: Option<u16>,
    max_duration: Option<Duration>,
    body_contains: Option<String>,
    body_min_len: Option<usize>,
    body_max_len: Option<usize>,
}

impl Check {
    fn prepare(config: &CheckConfig, request: &str) -> Result<Self, ConfigError> {
        let field = format!("requests.{}.checks.{}.max_duration", request, config.name);
        let check = Self {
            name: config.name.clone(),
            status: config.status,
            status_below: config.status_below,
            max_duration: parse_optional_duration(&field, config.max_duration.as_deref())?,
            body_contains: config.body_contains.clone(),
            body_min_len: config.body_min_len,
            body_max_len: config.body_max_len,
        };
        if check.is_empty() {
            return Err(ConfigError::Workload(format!(
                "check '{}' on request '{}' has no condition",
                config.name, request
            )));
        }
        Ok(check)
    }

    fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.status_below.is_none()
            && self.max_duration.is_none()
            && self.body_contains.is_none()
            && self.body_min_len.is_none()
            && self.body_max_len.is_none()
    }

    /// `status` is 0 when no response arrived.
    fn evaluate(&self, status: u16, duration: Duration, body: &[u8]) -> bool {
        if self.status.is_some_and(|s| s != status) {
            return false;
        }
        if self.status_below.is_some_and(|limit| status >= limit) {
            return false;
        }
        if self.max_duration.is_some_and(|limit| duration >= limit) {
            return false;
        }
        if self.body_min_len.is_some_and(|min| body.len() < min) {
            return false;
        }
        if self.body_max_len.is_some_and(|max| body.len() > max) {
            return false;
        }
        match &self.body_contains {
            Some(needle) => String::from_utf8_lossy(body).contains(needle.as_str()),
            None => true,
        }
    }
}

#[derive(Debug)]
struct PreparedRequest {
    name: String,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
    timeout: Duration,
    checks: Vec<Check>,
}

impl PreparedRequest {
    fn build(&self) -> anyhow::Result<Request<Bytes>> {
        let mut req = Request::builder()
            .method(self.method.clone())
            .uri(self.uri.clone())
            .body(self.body.clone())?;
        *req.headers_mut() = self.headers.clone();
        Ok(req)
    }

    fn sample(&self, status: Option<u16>, timings: &RequestTimings) -> RequestSample {
        RequestSample {
            name: self.name.clone(),
            method: self.method.to_string(),
            status,
            duration: timings.duration,
            waiting: timings.waiting,
            receiving: timings.receiving,
            sent: timings.request_size as u64,
            received: timings.response_size as u64,
            failed: !status.is_some_and(|s| (200..400).contains(&s)),
        }
    }
}

/// Runs the configured requests in order, reporting each one as a request
/// sample and its checks through the VU context.
pub struct HttpWorkload {
    client: HttpClient,
    requests: Vec<PreparedRequest>,
}

impl HttpWorkload {
    pub fn new(config: &HttpWorkloadConfig) -> Result<Self, ConfigError> {
        Self::with_client(config, HttpClient::new())
    }

    pub fn with_client(config: &HttpWorkloadConfig, client: HttpClient) -> Result<Self, ConfigError> {
        if config.requests.is_empty() {
            return Err(ConfigError::Workload("no requests configured".to_string()));
        }
        let requests = config
            .requests
            .iter()
            .map(|r| prepare(config, r))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { client, requests })
    }

    pub fn request_names(&self) -> impl Iterator<Item = &str> {
        self.requests.iter().map(|r| r.name.as_str())
    }
}

fn prepare(config: &HttpWorkloadConfig, request: &RequestConfig) -> Result<PreparedRequest, ConfigError> {
    let url = match (&config.base_url, request.url.starts_with('/')) {
        (Some(base), true) => format!("{}{}", base.trim_end_matches('/'), request.url),
        _ => request.url.clone(),
    };
    let name = request.name.clone().unwrap_or_else(|| url.clone());
    let invalid = |what: String| ConfigError::Workload(format!("request '{}': {}", name, what));

    let uri: Uri = url
        .parse()
        .map_err(|e| invalid(format!("invalid url '{}': {}", url, e)))?;
    match uri.scheme_str() {
        Some("http") | Some("https") => {}
        _ => return Err(invalid(format!("url '{}' must be absolute http(s)", url))),
    }

    let method_str = request.method.as_deref().unwrap_or("GET").to_uppercase();
    let method = Method::from_bytes(method_str.as_bytes())
        .map_err(|_| invalid(format!("invalid method '{}'", method_str)))?;

    let mut headers = HeaderMap::new();
    for (k, v) in config.headers.iter().chain(request.headers.iter()) {
        let key = HeaderName::from_bytes(k.as_bytes())
            .map_err(|_| invalid(format!("invalid header name '{}'", k)))?;
        let value = HeaderValue::from_str(v)
            .map_err(|_| invalid(format!("invalid value for header '{}'", k)))?;
        headers.insert(key, value);
    }

    let mut cookies = config.cookies.clone();
    cookies.extend(request.cookies.clone());
    if !cookies.is_empty() {
        let line = cookies
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("; ");
        let value = HeaderValue::from_str(&line)
            .map_err(|_| invalid("invalid cookie value".to_string()))?;
        headers.insert(COOKIE, value);
    }

    let timeout = parse_optional_duration(&format!("requests.{}.timeout", name), request.timeout.as_deref())?
        .unwrap_or(DEFAULT_REQUEST_TIMEOUT);
    let checks = request
        .checks
        .iter()
        .map(|c| Check::prepare(c, &name))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(PreparedRequest {
        name,
        method,
        uri,
        headers,
        body: Bytes::from(request.body.clone().unwrap_or_default()),
        timeout,
        checks,
    })
}

#[async_trait]
impl Workload for HttpWorkload {
    async fn iteration(&self, ctx: &mut VuContext) -> anyhow::Result<()> {
        for request in &self.requests {
            let req = request.build()?;
            let start = Instant::now();
            let error = match tokio::time::timeout(request.timeout, self.client.request(req)).await {
                Ok(Ok((response, timings))) => {
                    let status = response.status().as_u16();
                    ctx.record_request(request.sample(Some(status), &timings));
                    for check in &request.checks {
                        ctx.check(
                            check.name.clone(),
                            check.evaluate(status, timings.duration, response.body()),
                        );
                    }
                    continue;
                }
                Ok(Err(err)) => anyhow!("request '{}' failed: {:#}", request.name, err),
                Err(_) => anyhow!(
                    "request '{}' timed out after {:?}",
                    request.name,
                    request.timeout
                ),
            };

            let elapsed = start.elapsed();
            let timings = RequestTimings {
                duration: elapsed,
                ..Default::default()
            };
            ctx.record_request(request.sample(None, &timings));
            for check in &request.checks {
                ctx.check(check.name.clone(), check.evaluate(0, elapsed, &[]));
            }
            return Err(error);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::executor::IterationOutcome;
    use crate::engine::http_client::tests::canned_server;
    use crate::stats::{names, MetricsRegistry};
    use std::sync::Arc;

    fn config(base: &str) -> HttpWorkloadConfig {
        let yaml = format!(
            r#"
base_url: {}
cookies:
  token: abc
requests:
  - name: home
    url: /
    checks:
      - name: status is 200
        status: 200
      - name: greets admin
        bodyContains: "Hello! Jhonny"
      - name: fast
        max_duration: 1000ms
  - name: products
    url: /api/product
    checks:
      - name: sane size
        body_min_len: 101
        body_max_len: 9999
"#,
            base
        );
        serde_yaml::from_str(&yaml).unwrap()
    }

    async fn run_once(workload: &HttpWorkload) -> (anyhow::Result<()>, Arc<MetricsRegistry>) {
        let metrics = Arc::new(MetricsRegistry::new(1));
        metrics.mark_started();
        let mut ctx = VuContext::new(0, metrics.clone());
        let result = workload.iteration(&mut ctx).await;
        ctx.flush(&IterationOutcome {
            duration: Duration::from_millis(1),
            error: None,
        });
        (result, metrics)
    }

    #[test]
    fn test_prepare_joins_base_url_and_cookies() {
        let workload = HttpWorkload::new(&config("http://127.0.0.1:5000/")).unwrap();
        let home = &workload.requests[0];
        assert_eq!(home.uri.to_string(), "http://127.0.0.1:5000/");
        assert_eq!(home.method, Method::GET);
        assert_eq!(home.headers[COOKIE], "token=abc");
        assert_eq!(home.timeout, DEFAULT_REQUEST_TIMEOUT);
        assert_eq!(home.checks[2].max_duration, Some(Duration::from_secs(1)));
        assert_eq!(
            workload.request_names().collect::<Vec<_>>(),
            vec!["home", "products"]
        );
    }

    #[test]
    fn test_invalid_configs() {
        let empty = HttpWorkloadConfig::default();
        assert!(matches!(
            HttpWorkload::new(&empty),
            Err(ConfigError::Workload(_))
        ));

        let relative = HttpWorkloadConfig {
            requests: vec![RequestConfig {
                url: "/no-base".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        };
        assert!(matches!(
            HttpWorkload::new(&relative),
            Err(ConfigError::Workload(_))
        ));

        let mut no_condition = config("http://localhost");
        no_condition.requests[0].checks.push(CheckConfig {
            name: "empty".to_string(),
            ..Default::default()
        });
        assert!(matches!(
            HttpWorkload::new(&no_condition),
            Err(ConfigError::Workload(_))
        ));

        let mut bad_timeout = config("http://localhost");
        bad_timeout.requests[0].timeout = Some("soon".to_string());
        assert!(matches!(
            HttpWorkload::new(&bad_timeout),
            Err(ConfigError::InvalidDuration { .. })
        ));
    }

    #[test]
    fn test_check_conditions() {
        let check = Check {
            name: "c".to_string(),
            status: None,
            status_below: Some(300),
            max_duration: Some(Duration::from_millis(1000)),
            body_contains: Some("Admin".to_string()),
            body_min_len: None,
            body_max_len: Some(32),
        };
        let fast = Duration::from_millis(10);
        assert!(check.evaluate(200, fast, b"Hello! Jhonny As Admin"));
        assert!(!check.evaluate(302, fast, b"Hello! Jhonny As Admin"));
        assert!(!check.evaluate(200, Duration::from_secs(1), b"Admin"));
        assert!(!check.evaluate(200, fast, b"Hello guest"));
        assert!(!check.evaluate(200, fast, &[b'A'; 64]));
        assert!(!check.evaluate(0, fast, b""));
    }

    #[tokio::test]
    async fn test_iteration_records_requests_and_checks() {
        let base = canned_server(200, "Hello! Jhonny As Admin").await;
        let workload = HttpWorkload::new(&config(&base)).unwrap();
        let (result, metrics) = run_once(&workload).await;
        assert!(result.is_ok());

        let snap = metrics.snapshot();
        assert_eq!(snap.get(names::HTTP_REQS).unwrap().count(), 2.0);
        assert_eq!(snap.get(names::HTTP_REQ_FAILED).unwrap().rate(), 0.0);
        assert_eq!(snap.checks["status is 200"].passes, 1);
        assert_eq!(snap.checks["greets admin"].passes, 1);
        // canned body is too short for the products check
        assert_eq!(snap.checks["sane size"].fails, 1);
        assert!(snap.get(names::DATA_RECEIVED).unwrap().count() > 0.0);
        assert_eq!(snap.get(names::HTTP_REQ_WAITING).unwrap().samples(), 2);
        assert_eq!(snap.get(names::HTTP_REQ_RECEIVING).unwrap().samples(), 2);
    }

    #[tokio::test]
    async fn test_error_status_marks_request_failed() {
        let base = canned_server(503, "unavailable").await;
        let workload = HttpWorkload::new(&config(&base)).unwrap();
        let (result, metrics) = run_once(&workload).await;
        // an error status is not a transport failure
        assert!(result.is_ok());

        let snap = metrics.snapshot();
        assert_eq!(snap.get(names::HTTP_REQ_FAILED).unwrap().rate(), 1.0);
        assert_eq!(snap.checks["status is 200"].fails, 1);
    }

    #[tokio::test]
    async fn test_transport_error_fails_iteration() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let workload = HttpWorkload::new(&config(&base)).unwrap();
        let (result, metrics) = run_once(&workload).await;
        assert!(result.is_err());

        let snap = metrics.snapshot();
        // the first request fails, the second is never sent
        assert_eq!(snap.get(names::HTTP_REQS).unwrap().count(), 1.0);
        assert_eq!(snap.checks["status is 200"].fails, 1);
        // no response, so nothing to time
        assert_eq!(snap.get(names::HTTP_REQ_WAITING).unwrap().samples(), 0);
        assert!(!snap.checks.contains_key("sane size"));
        assert_eq!(snap.get(names::HTTP_REQ_FAILED).unwrap().rate(), 1.0);
    }
}
