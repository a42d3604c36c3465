//! Fetcher role: one round trip to obtain a remote frame.
//!
//! A fetch is strictly single-shot. Failures are terminal: the caller is
//! expected to exit the process with the error's exit code, and retrying
//! means invoking the command again.

use std::time::Duration;

use bytes::Bytes;
use iroh::endpoint::Connection;
use iroh::PublicKey;
use thiserror::Error;

use crate::frame::Frame;
use crate::net;
use crate::proto::{self, FrameRequest};

/// Default bound on path resolution + session establishment.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// Why a fetch failed. Each variant maps to a distinct process exit code.
#[derive(Debug, Error)]
pub enum FetchError {
    /// No path or session to the remote within the timeout, or the
    /// session closed before the response arrived.
    #[error("{0}")]
    Unreachable(String),
    /// The request failed or the server answered "no data".
    #[error("{0}")]
    RequestFailed(String),
    /// The server sent bytes that do not decode as an image.
    #[error("Response did not decode as an image: {0}")]
    BadImage(String),
}

impl FetchError {
    /// Process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            FetchError::Unreachable(_) => 1,
            FetchError::RequestFailed(_) | FetchError::BadImage(_) => 2,
        }
    }
}

/// Lifecycle of a single fetch. Terminal states are reached exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    /// Resolving a path and establishing the session.
    Connecting,
    /// Session up, request sent, waiting for the response.
    Requesting,
    /// Response received and decoded.
    Completed,
    /// Terminal failure.
    Failed,
}

impl FetchState {
    pub fn is_terminal(self) -> bool {
        matches!(self, FetchState::Completed | FetchState::Failed)
    }

    fn can_transition_to(self, next: FetchState) -> bool {
        match self {
            FetchState::Connecting => {
                matches!(next, FetchState::Requesting | FetchState::Failed)
            }
            FetchState::Requesting => {
                matches!(next, FetchState::Completed | FetchState::Failed)
            }
            FetchState::Completed | FetchState::Failed => false,
        }
    }
}

/// What one successful fetch yields: the encoded bytes as received, plus
/// the decoded image.
#[derive(Debug)]
pub struct FetchResult {
    /// Raw JPEG bytes exactly as the listener sent them.
    pub raw: Bytes,
    /// Decoded pixel buffer.
    pub frame: Frame,
}

/// Performs exactly one request against a remote listener.
pub struct Fetcher {
    remote: PublicKey,
    request: FrameRequest,
    identity: Option<iroh::SecretKey>,
    timeout: Duration,
    state: FetchState,
}

impl Fetcher {
    pub fn new(remote: PublicKey, request: FrameRequest) -> Self {
        Self {
            remote,
            request,
            identity: None,
            timeout: DEFAULT_TIMEOUT,
            state: FetchState::Connecting,
        }
    }

    /// Fetch under a persistent identity, so listeners can allow-list it.
    /// Without this, an ephemeral key is generated per fetch.
    pub fn with_identity(mut self, identity: iroh::SecretKey) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Current lifecycle state.
    pub fn state(&self) -> FetchState {
        self.state
    }

    fn advance(&mut self, next: FetchState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid fetch transition {:?} -> {:?}",
            self.state,
            next
        );
        self.state = next;
    }

    /// Resolve, connect and perform the single round trip.
    pub async fn fetch(&mut self) -> Result<FetchResult, FetchError> {
        let endpoint = match net::bind_fetcher(self.identity.clone()).await {
            Ok(e) => e,
            Err(e) => {
                self.advance(FetchState::Failed);
                return Err(FetchError::Unreachable(format!(
                    "Could not bind endpoint: {}",
                    e
                )));
            }
        };

        let conn = match net::connect(&endpoint, self.remote, self.timeout).await {
            Ok(c) => c,
            Err(e) => {
                self.advance(FetchState::Failed);
                endpoint.close().await;
                return Err(FetchError::Unreachable(e.to_string()));
            }
        };

        let result = self.fetch_over(&conn).await;
        endpoint.close().await;
        result
    }

    /// Perform the round trip over an already established session.
    ///
    /// Useful when the caller holds a direct-addressed connection, e.g.
    /// integration tests that bypass discovery.
    pub async fn fetch_over(&mut self, conn: &Connection) -> Result<FetchResult, FetchError> {
        self.advance(FetchState::Requesting);
        match self.round_trip(conn).await {
            Ok(result) => {
                self.advance(FetchState::Completed);
                Ok(result)
            }
            Err(e) => {
                self.advance(FetchState::Failed);
                Err(e)
            }
        }
    }

    async fn round_trip(&self, conn: &Connection) -> Result<FetchResult, FetchError> {
        let (mut send, mut recv) = conn
            .open_bi()
            .await
            .map_err(|e| classify(conn, "Could not open stream", &e))?;

        self.request
            .write_to(&mut send)
            .await
            .map_err(|e| classify(conn, "Could not send request", &e))?;
        send.finish()
            .map_err(|e| FetchError::RequestFailed(e.to_string()))?;

        tracing::debug!("Request sent, waiting for response");

        let payload = proto::read_response(&mut recv)
            .await
            .map_err(|e| classify(conn, "Request failed", &e))?;

        let Some(raw) = payload else {
            return Err(FetchError::RequestFailed(
                "Server returned no data".to_string(),
            ));
        };

        tracing::debug!("Got {} byte response", raw.len());

        let frame =
            Frame::from_jpeg(&raw).map_err(|e| FetchError::BadImage(e.to_string()))?;

        Ok(FetchResult { raw, frame })
    }
}

/// Losing the whole session mid-request counts as losing the remote, the
/// same as never reaching it; a failure on a live session is a failed
/// request.
fn classify(conn: &Connection, context: &str, e: &dyn std::fmt::Display) -> FetchError {
    match conn.close_reason() {
        Some(reason) => FetchError::Unreachable(format!("Session lost: {}", reason)),
        None => FetchError::RequestFailed(format!("{}: {}", context, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct_per_taxonomy() {
        assert_eq!(FetchError::Unreachable("x".into()).exit_code(), 1);
        assert_eq!(FetchError::RequestFailed("x".into()).exit_code(), 2);
        assert_eq!(FetchError::BadImage("x".into()).exit_code(), 2);
    }

    #[test]
    fn test_state_machine_transitions() {
        use FetchState::*;

        assert!(Connecting.can_transition_to(Requesting));
        assert!(Connecting.can_transition_to(Failed));
        assert!(!Connecting.can_transition_to(Completed));

        assert!(Requesting.can_transition_to(Completed));
        assert!(Requesting.can_transition_to(Failed));
        assert!(!Requesting.can_transition_to(Connecting));

        // Terminal states are terminal.
        for terminal in [Completed, Failed] {
            assert!(terminal.is_terminal());
            for next in [Connecting, Requesting, Completed, Failed] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_fetcher_starts_connecting() {
        let key = iroh::SecretKey::generate(&mut rand::rng());
        let fetcher = Fetcher::new(key.public(), FrameRequest::default());
        assert_eq!(fetcher.state(), FetchState::Connecting);
        assert!(!fetcher.state().is_terminal());
    }
}
