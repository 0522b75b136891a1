//! Async timeout helpers.

use std::future::Future;
use std::time::Duration;

use tokio::time::timeout;

use crate::error::{ProtocolError, Result};

/// Default timeout for outbound connection attempts.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Time a peer has to complete the handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Time the server waits for connections to drain on shutdown.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Run `fut` with a deadline, mapping expiry to `ProtocolError::Timeout`.
pub async fn with_timeout_error<F, T>(fut: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Timeout),
    }
}
