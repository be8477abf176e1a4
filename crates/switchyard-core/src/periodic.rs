use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Run `tick` once after `initial_delay`, then every `interval`, until `cancel` fires.
///
/// Each tick is awaited to completion before the next is scheduled, so a
/// slow pass delays rather than overlaps its successor. Panics inside `tick`
/// are not caught; bodies should log and swallow per-item failures.
pub async fn run_periodic<F, Fut>(
    cancel: CancellationToken,
    initial_delay: Duration,
    interval: Duration,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    tokio::select! {
        _ = cancel.cancelled() => return,
        _ = tokio::time::sleep(initial_delay) => {}
    }
    let mut timer = tokio::time::interval(interval);
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = timer.tick() => tick().await,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_ticks_until_cancelled() {
        let cancel = CancellationToken::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let handle = tokio::spawn(run_periodic(
            cancel.clone(),
            Duration::ZERO,
            Duration::from_millis(5),
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            },
        ));
        tokio::time::sleep(Duration::from_millis(40)).await;
        cancel.cancel();
        handle.await.unwrap();
        assert!(ticks.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_cancel_during_initial_delay() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        tokio::time::timeout(
            Duration::from_secs(1),
            run_periodic(cancel, Duration::from_secs(3600), Duration::from_secs(1), || async {}),
        )
        .await
        .unwrap();
    }
}
