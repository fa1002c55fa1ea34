//! Integration tests for task prioritization, the multi-CDN retry engine and the CDN
//! downgrade list, driven through the public API only.

mod common;

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use segment_scheduler::{
    BackoffConfig, CdnConfig, CdnMetadata, CdnPrioritizer, CdnPriorityChange, DownloadError,
    PrioritySteps, TaskObserver, TaskPrioritizer, schedule_request_with_cdns,
};

fn cdn(id: &str) -> CdnMetadata {
    CdnMetadata::new(format!("https://{id}.example.com/")).with_id(id)
}

mod prioritizer_tests {
    use super::*;
    use futures::future::BoxFuture;
    use segment_scheduler::{TaskError, TaskId};

    type Log = Arc<Mutex<Vec<String>>>;

    struct LogObserver {
        name: usize,
        log: Log,
    }

    impl TaskObserver for LogObserver {
        fn before_interrupted(&self) {
            self.log.lock().push(format!("interrupted {}", self.name));
        }

        fn before_ended(&self) {
            self.log.lock().push(format!("ended {}", self.name));
        }
    }

    type Task = BoxFuture<'static, Result<(), TaskError<()>>>;

    /// Creates a task logging `data <name>` after sleeping 100ms, counting invocations.
    fn submit(
        prioritizer: &TaskPrioritizer,
        name: usize,
        priority: u32,
        log: &Log,
    ) -> (TaskId, Task, Arc<AtomicUsize>) {
        let invocations = Arc::new(AtomicUsize::new(0));
        let task_log = Arc::clone(log);
        let task_invocations = Arc::clone(&invocations);
        let (id, future) = prioritizer.create(
            move |_run_token| {
                task_invocations.fetch_add(1, Ordering::SeqCst);
                let log = Arc::clone(&task_log);
                async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    log.lock().push(format!("data {name}"));
                    Ok::<_, ()>(())
                }
            },
            priority,
            Arc::new(LogObserver {
                name,
                log: Arc::clone(log),
            }),
            CancellationToken::new(),
        );
        (id, future, invocations)
    }

    #[tokio::test(start_paused = true)]
    async fn normal_priority_tasks_run_one_at_a_time_in_order() {
        common::init_tracing();
        let prioritizer = TaskPrioritizer::new(PrioritySteps::new(5, 20).unwrap()).unwrap();
        let log = Log::default();

        let tasks: Vec<_> = [1, 2, 3, 4]
            .into_iter()
            .map(|priority| {
                let (_, future, _) = submit(&prioritizer, priority as usize, priority, &log);
                tokio::spawn(future)
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(
            *log.lock(),
            [
                "data 1", "ended 1", "data 2", "ended 2", "data 3", "ended 3", "data 4", "ended 4"
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn high_priority_task_interrupts_low_ones() {
        common::init_tracing();
        let prioritizer = TaskPrioritizer::new(PrioritySteps::new(5, 19).unwrap()).unwrap();
        let log = Log::default();

        let mut handles = Vec::new();
        let mut counters = Vec::new();
        for (name, priority) in [(1, 20), (2, 19), (3, 5), (4, 0)] {
            if name == 3 {
                // Let the low priority tasks begin their work first.
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            let (_, future, invocations) = submit(&prioritizer, name, priority, &log);
            handles.push(tokio::spawn(future));
            counters.push(invocations);
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let log = log.lock().clone();
        assert_eq!(log[..2], ["interrupted 1", "interrupted 2"]);

        let position = |event: &str| log.iter().position(|e| e == event).unwrap();
        for urgent in ["ended 3", "ended 4"] {
            assert!(position(urgent) < position("data 1"));
            assert!(position(urgent) < position("data 2"));
        }
        assert_eq!(log.iter().filter(|e| e.starts_with("data")).count(), 4);

        let invocations: Vec<_> = counters.iter().map(|c| c.load(Ordering::SeqCst)).collect();
        assert_eq!(invocations, [2, 2, 1, 1]);
    }
}

mod retry_tests {
    use super::*;
    use reqwest::StatusCode;

    #[tokio::test(start_paused = true)]
    async fn failing_cdn_falls_back_to_the_next_one() {
        common::init_tracing();
        let cdns = [cdn("a"), cdn("b")];
        let prioritizer = CdnPrioritizer::new(CdnConfig::default(), CancellationToken::new());
        let retries = AtomicUsize::new(0);

        let data = schedule_request_with_cdns(
            Some(&cdns),
            Some(&prioritizer),
            |cdn, _token| async move {
                match cdn.as_ref().map(CdnMetadata::label) {
                    Some("a") => Err(DownloadError::http_status(
                        StatusCode::SERVICE_UNAVAILABLE,
                        "https://a.example.com/seg",
                    )),
                    _ => Ok(Bytes::from_static(b"from b")),
                }
            },
            &BackoffConfig::regular(),
            |_| {
                retries.fetch_add(1, Ordering::SeqCst);
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(data, Bytes::from_static(b"from b"));
        assert_eq!(retries.load(Ordering::SeqCst), 1);
        assert!(prioritizer.is_downgraded(&cdns[0]));
    }
}

mod cdn_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn downgrade_expires_and_restores_order() {
        let prioritizer = CdnPrioritizer::new(
            CdnConfig {
                downgrade_time: Duration::from_secs(60),
            },
            CancellationToken::new(),
        );
        let mut changes = prioritizer.subscribe();
        let cdns = [cdn("a"), cdn("b")];

        prioritizer.downgrade_cdn(&cdns[0]);
        assert_eq!(
            prioritizer.get_cdn_preference_for_resource(&cdns).as_ref(),
            [cdns[1].clone(), cdns[0].clone()]
        );
        assert_eq!(
            changes.recv().await.unwrap(),
            CdnPriorityChange::Downgraded(cdns[0].clone())
        );

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(
            changes.recv().await.unwrap(),
            CdnPriorityChange::Restored(cdns[0].clone())
        );
        assert_eq!(
            prioritizer.get_cdn_preference_for_resource(&cdns).as_ref(),
            cdns
        );
    }
}
