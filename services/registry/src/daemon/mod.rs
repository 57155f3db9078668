//! Background consumers of the work queue.

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::app::App;
use crate::workq::TopicRegistry;

pub mod gc;
pub mod reconcile;
pub mod webhook;

/// Register every consumer, start them, and start the periodic GC when
/// `daemon.gc.interval` is set.
pub(crate) fn start(app: &App, shutdown: CancellationToken) -> JoinSet<()> {
    let mut registry = TopicRegistry::new();
    gc::register(&mut registry, app);
    webhook::register(&mut registry, app);
    reconcile::register(&mut registry, app);

    let mut tasks = app.queue().start(registry, shutdown.clone());
    if let Some(interval) = app.config().daemon.gc.interval {
        tracing::info!(?interval, "periodic gc enabled");
        tasks.spawn(
            gc::schedule(app.clone(), interval, shutdown)
                .instrument(tracing::info_span!("gc_schedule")),
        );
    }
    tasks
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::app::testing;
    use crate::dal::gc::{self as runs, Resource};
    use crate::workq::testing::eventually;

    #[tokio::test]
    async fn queued_gc_runs_are_consumed() {
        let (app, _dir) = testing::app().await;
        let shutdown = CancellationToken::new();
        let mut tasks = app.start_daemons(shutdown.clone());

        let runner_id = gc::trigger(&app, Resource::Repository, None, false, "manual")
            .await
            .unwrap();
        let mut status = String::new();
        for _ in 0..100 {
            let mut conn = app.dal().acquire().await.unwrap();
            status = runs::get_runner(&mut conn, runner_id).await.unwrap().status;
            if status == "success" {
                break;
            }
            drop(conn);
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(status, "success");

        shutdown.cancel();
        assert!(
            eventually(|| {
                while let Some(done) = tasks.try_join_next() {
                    done.unwrap();
                }
                tasks.is_empty()
            })
            .await
        );
    }
}
