//! Completion-callback style for callers that do not await.

use std::future::Future;

use tokio::task::JoinHandle;

use crate::error::{AdapterError, Result};

/// Drive `operation` on the current runtime and report its outcome to
/// `callback` as `(error, value)`, exactly one of which is set.
pub fn spawn_with_callback<T, F, C>(operation: F, callback: C) -> JoinHandle<()>
where
    T: Send + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
    C: FnOnce(Option<AdapterError>, Option<T>) + Send + 'static,
{
    tokio::spawn(async move {
        match operation.await {
            Ok(value) => callback(None, Some(value)),
            Err(err) => callback(Some(err), None),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_success_reaches_callback() {
        let (tx, rx) = oneshot::channel();
        spawn_with_callback(async { Ok(41 + 1) }, move |err, value| {
            let _ = tx.send((err.is_none(), value));
        })
        .await
        .unwrap();
        assert_eq!(rx.await.unwrap(), (true, Some(42)));
    }

    #[tokio::test]
    async fn test_error_reaches_callback() {
        let (tx, rx) = oneshot::channel();
        spawn_with_callback(
            async { Err::<u64, _>(AdapterError::UnknownConnection("gone".into())) },
            move |err, value| {
                let _ = tx.send((err.map(|e| e.code()), value));
            },
        )
        .await
        .unwrap();
        assert_eq!(rx.await.unwrap(), (Some("E_UNKNOWN_CONNECTION"), None));
    }
}
