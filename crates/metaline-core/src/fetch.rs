//! HTTP request helper with fixed-interval retries.
//!
//! Uses the shared async reqwest client behind a synchronous interface so
//! callers on plain threads never touch the runtime directly.

use std::io::Write;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

/// Connect timeout for the shared client.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Upstream request failure after all retries.
#[derive(Debug)]
pub struct FetchError {
    pub status: Option<u16>,
    pub message: String,
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(s) => write!(f, "upstream request failed (HTTP {s}): {}", self.message),
            None => write!(f, "upstream request failed: {}", self.message),
        }
    }
}

impl std::error::Error for FetchError {}

impl FetchError {
    fn from_reqwest(e: &reqwest::Error) -> Self {
        Self {
            status: e.status().map(|s| s.as_u16()),
            message: e.to_string(),
        }
    }
}

/// Shared async HTTP client with connection pooling.
static SHARED_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .pool_max_idle_per_host(4)
        .build()
        .expect("failed to build HTTP client")
});

/// Get the shared HTTP client.
pub fn http_client() -> &'static reqwest::Client {
    &SHARED_CLIENT
}

/// Shared tokio runtime for HTTP operations and signal handling.
pub static SHARED_RUNTIME: LazyLock<tokio::runtime::Runtime> = LazyLock::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("failed to build tokio runtime")
});

/// Synchronous GET with retry and an optional request/response trace log.
#[derive(Debug, Clone)]
pub struct Fetcher {
    max_tries: u32,
    retry_wait: Duration,
    user_agent: String,
    trace_log: Option<PathBuf>,
}

impl Fetcher {
    pub fn new(max_tries: u32, retry_wait: Duration, user_agent: impl Into<String>) -> Self {
        Self {
            max_tries: max_tries.max(1),
            retry_wait,
            user_agent: user_agent.into(),
            trace_log: None,
        }
    }

    /// Append timestamped request lines and response bodies to `path`.
    pub fn with_trace_log(mut self, path: Option<PathBuf>) -> Self {
        self.trace_log = path;
        self
    }

    /// GET `url`, retrying on transport failure or any status ≥ 300.
    ///
    /// Retries sleep a fixed `retry_wait` between attempts; the last failure
    /// is returned as [`FetchError`].
    pub fn get(&self, url: &str, headers: &[(String, String)]) -> Result<(u16, Vec<u8>), FetchError> {
        for attempt in 1..=self.max_tries {
            self.trace(&format!(">> GET {url}"));
            let result = SHARED_RUNTIME.handle().block_on(async {
                let mut request = http_client()
                    .get(url)
                    .header(reqwest::header::USER_AGENT, self.user_agent.as_str());
                for (name, value) in headers {
                    request = request.header(name.as_str(), value.as_str());
                }
                let response = request.send().await?;
                let status = response.status().as_u16();
                let body = response.bytes().await?;
                Ok::<_, reqwest::Error>((status, body.to_vec()))
            });

            match result {
                Ok((status, body)) if status < 300 => {
                    self.trace(&format!("<< {status}\n{}", String::from_utf8_lossy(&body)));
                    return Ok((status, body));
                }
                Ok((status, body)) => {
                    self.trace(&format!("<< {status}\n{}", String::from_utf8_lossy(&body)));
                    if attempt == self.max_tries {
                        return Err(FetchError {
                            status: Some(status),
                            message: format!("GET {url} returned HTTP {status}"),
                        });
                    }
                    log::warn!(
                        "GET {url}: HTTP {status}, retry {attempt}/{} in {:?}",
                        self.max_tries - 1,
                        self.retry_wait
                    );
                }
                Err(e) => {
                    if attempt == self.max_tries {
                        return Err(FetchError::from_reqwest(&e));
                    }
                    log::warn!(
                        "GET {url}: {e}, retry {attempt}/{} in {:?}",
                        self.max_tries - 1,
                        self.retry_wait
                    );
                }
            }
            std::thread::sleep(self.retry_wait);
        }
        unreachable!("retry loop returns on the last attempt")
    }

    fn trace(&self, text: &str) {
        let Some(path) = &self.trace_log else {
            return;
        };
        let stamp = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
        let entry = format!("[{stamp}] {text}\n");
        let appended = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut f| f.write_all(entry.as_bytes()));
        if let Err(e) = appended {
            log::warn!("trace log {}: {e}", path.display());
        }
    }
}
