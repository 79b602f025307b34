//! HTTP transport
//!
//! Thin abstraction over the single outbound operation the transmitter
//! needs — posting a framed payload to the collector endpoint and getting
//! back a classification. Production code talks to a real HTTP client;
//! tests substitute [`MockHttpTransport`].

use async_trait::async_trait;
use std::collections::HashMap;

/// One dispatch attempt's payload and destination.
#[derive(Debug, Clone)]
pub struct Request {
    pub endpoint: String,
    pub body: Vec<u8>,
    pub headers: HashMap<String, String>,
}

/// A completed (non-network-failed) HTTP response.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub headers: HashMap<String, String>,
}

impl Response {
    pub fn server_date(&self) -> Option<&str> {
        self.headers.get("date").map(|s| s.as_str())
    }
}

/// How one dispatch attempt resolved, already classified from the raw
/// response status (or its absence) into the action the store and backoff
/// state should take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmitOutcome {
    /// 2xx: drop the reserved rows.
    Accepted,
    /// 4xx other than 408/429: drop the reserved rows, they can never
    /// succeed as-is.
    RejectedPermanent,
    /// 408/429/5xx: release the reservation and apply backoff.
    RejectedRetryable,
    /// The request never reached the server (DNS, connect, timeout).
    NetworkFailure,
    /// Attempt was cancelled locally (teardown deadline, `UploadNow` abort).
    Aborted,
    /// Local precondition failed (serialization at dispatch time, etc.),
    /// distinct from a network-level failure.
    LocalFailure,
}

/// Classifies an HTTP status code into a [`TransmitOutcome`].
pub fn classify_status(status: u16) -> TransmitOutcome {
    match status {
        200..=299 => TransmitOutcome::Accepted,
        408 | 429 => TransmitOutcome::RejectedRetryable,
        400..=499 => TransmitOutcome::RejectedPermanent,
        500..=599 => TransmitOutcome::RejectedRetryable,
        _ => TransmitOutcome::RejectedPermanent,
    }
}

/// Minimal async HTTP client boundary. One in-flight request at a time per
/// call; the transmitter owns concurrency via a semaphore.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: Request) -> Result<Response, TransmitOutcome>;
}

/// Deterministic, in-memory transport for tests: returns a scripted status
/// (or simulates a network failure) for each call, recording the requests
/// it saw. Available to unit tests unconditionally and to the integration
/// suite via the `test-utils` feature.
#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::*;
    use std::sync::Mutex;

    pub enum ScriptedResult {
        Status(u16),
        NetworkFailure,
    }

    #[derive(Default)]
    pub struct MockHttpTransport {
        script: Mutex<Vec<ScriptedResult>>,
        seen: Mutex<Vec<Request>>,
    }

    impl MockHttpTransport {
        pub fn new(script: Vec<ScriptedResult>) -> Self {
            Self {
                script: Mutex::new(script),
                seen: Mutex::new(Vec::new()),
            }
        }

        pub fn requests_seen(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl HttpTransport for MockHttpTransport {
        async fn send(&self, request: Request) -> Result<Response, TransmitOutcome> {
            self.seen.lock().unwrap().push(request);
            let next = self.script.lock().unwrap().pop();
            match next {
                Some(ScriptedResult::Status(status)) => Ok(Response {
                    status,
                    headers: HashMap::new(),
                }),
                Some(ScriptedResult::NetworkFailure) | None => Err(TransmitOutcome::NetworkFailure),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_2xx_as_accepted() {
        assert_eq!(classify_status(200), TransmitOutcome::Accepted);
        assert_eq!(classify_status(204), TransmitOutcome::Accepted);
    }

    #[test]
    fn classifies_408_and_429_as_retryable() {
        assert_eq!(classify_status(408), TransmitOutcome::RejectedRetryable);
        assert_eq!(classify_status(429), TransmitOutcome::RejectedRetryable);
    }

    #[test]
    fn classifies_other_4xx_as_permanent() {
        assert_eq!(classify_status(400), TransmitOutcome::RejectedPermanent);
        assert_eq!(classify_status(403), TransmitOutcome::RejectedPermanent);
    }

    #[test]
    fn classifies_5xx_as_retryable() {
        assert_eq!(classify_status(500), TransmitOutcome::RejectedRetryable);
        assert_eq!(classify_status(503), TransmitOutcome::RejectedRetryable);
    }
}
