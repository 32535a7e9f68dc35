//! Shared async helpers.

use std::future::Future;
use std::time::Duration;

use tokio::time::timeout;

use crate::{Error, Result};

/// Run `fut` on its own tokio task so a panic surfaces as
/// [`Error::TaskJoin`] instead of unwinding through the caller.
pub async fn spawn_guarded<F, T>(fut: F) -> Result<T>
where
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(fut)
        .await
        .map_err(|e| Error::TaskJoin(e.to_string()))?
}

/// Await `fut`, failing with [`Error::Timeout`] after `limit` if one is set.
pub async fn with_timeout<F, T>(limit: Option<Duration>, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match limit {
        Some(duration) => match timeout(duration, fut).await {
            Ok(inner) => inner,
            Err(_) => Err(Error::Timeout(duration)),
        },
        None => fut.await,
    }
}
