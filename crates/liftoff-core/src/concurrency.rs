use crate::CoreError;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::error;

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// First Ctrl-C cancels `token` so running units finish their bookkeeping
/// and release their locks; a second one exits immediately.
pub fn install_signal_handler(token: CancellationToken) {
    let _ = ctrlc::set_handler(move || {
        if SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
            std::process::exit(130);
        }
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
        token.cancel();
        eprintln!("\ncancellation requested, releasing locks...");
    });
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

/// Race `fut` against `cancel`.
pub async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T, CoreError>>,
) -> Result<T, CoreError> {
    tokio::select! {
        () = cancel.cancelled() => Err(CoreError::Cancelled),
        result = fut => result,
    }
}

/// Run `task` for every item with at most `limit` in flight. Results come
/// back in input order. A panicking task is logged and yields `on_panic`.
pub async fn fan_out<I, T, F, Fut>(
    limit: usize,
    items: Vec<I>,
    task: F,
    on_panic: impl Fn(&I) -> T,
) -> Vec<T>
where
    I: Clone + Send + 'static,
    T: Send + 'static,
    F: Fn(I) -> Fut,
    Fut: Future<Output = T> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(limit.max(1)));
    let mut set = JoinSet::new();
    for (index, item) in items.iter().cloned().enumerate() {
        let semaphore = Arc::clone(&semaphore);
        let fut = task(item);
        set.spawn(async move {
            // The semaphore is never closed.
            let _permit = semaphore.acquire_owned().await.ok();
            (index, fut.await)
        });
    }

    let mut results: Vec<Option<T>> = items.iter().map(|_| None).collect();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((index, value)) => results[index] = Some(value),
            Err(e) => error!(error = %e, "unit task panicked"),
        }
    }
    results
        .into_iter()
        .zip(&items)
        .map(|(result, item)| result.unwrap_or_else(|| on_panic(item)))
        .collect()
}
