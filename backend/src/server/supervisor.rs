use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub const RESTART_BACKOFF: Duration = Duration::from_secs(1);

/// Runs a background worker and restarts it after a panic. A worker that
/// returns normally is not restarted.
pub fn spawn_supervised<F, Fut>(name: &'static str, factory: F) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut restarts: u32 = 0;
        loop {
            info!(worker = name, restarts, "Worker starting.");
            match tokio::spawn(factory()).await {
                Ok(()) => {
                    info!(worker = name, "Worker finished.");
                    break;
                }
                Err(e) if e.is_panic() => {
                    restarts += 1;
                    error!(worker = name, restarts, "Worker panicked; restarting.");
                    tokio::time::sleep(RESTART_BACKOFF).await;
                }
                Err(e) => {
                    warn!(worker = name, error = %e, "Worker cancelled.");
                    break;
                }
            }
        }
    })
}
