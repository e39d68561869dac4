use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tenant_operator::funnel::{Funnel, FunnelQueue, limiter};
use tokio::sync::Semaphore;
use tokio::time::{Instant, sleep};

/// Tracks how many tasks are inside their body at once.
#[derive(Default)]
struct Occupancy {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Occupancy {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[tokio::test]
async fn capacity_is_never_exceeded_by_blocked_tasks() {
    let funnel = Arc::new(Funnel::new(3));
    let occupancy = Arc::new(Occupancy::default());
    let release = Arc::new(Semaphore::new(0));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let funnel = Arc::clone(&funnel);
        let occupancy = Arc::clone(&occupancy);
        let release = Arc::clone(&release);
        handles.push(tokio::spawn(async move {
            funnel
                .run(1, async move {
                    occupancy.enter();
                    let permit = release.acquire().await.unwrap();
                    permit.forget();
                    occupancy.leave();
                })
                .await
        }));
    }

    for _ in 0..100 {
        if funnel.running() == 3 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(funnel.running(), 3);
    assert_eq!(funnel.free_capacity(), 0);
    assert_eq!(occupancy.peak(), 3);

    release.add_permits(8);
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(occupancy.peak(), 3);
    assert_eq!(funnel.free_capacity(), 3);
    assert_eq!(funnel.running(), 0);
}

#[tokio::test(start_paused = true)]
async fn two_slots_run_three_tasks_in_two_rounds() {
    let funnel = Arc::new(Funnel::new(2));
    let occupancy = Arc::new(Occupancy::default());
    let started = Instant::now();

    let mut handles = Vec::new();
    for index in 0..3 {
        let funnel = Arc::clone(&funnel);
        let occupancy = Arc::clone(&occupancy);
        handles.push(tokio::spawn(async move {
            funnel
                .run(1, async move {
                    occupancy.enter();
                    sleep(Duration::from_millis(50)).await;
                    occupancy.leave();
                    index
                })
                .await
        }));
    }
    for (index, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.await.unwrap(), index);
    }

    assert!(occupancy.peak() <= 2);
    assert!(started.elapsed() >= Duration::from_millis(100));
}

#[tokio::test(start_paused = true)]
async fn drained_results_keep_submission_order() {
    let queue = FunnelQueue::new(5);
    let count = 5u64;
    for index in 0..count {
        queue.enqueue(1, async move {
            sleep(Duration::from_millis((count - index) * 10)).await;
            Ok::<_, anyhow::Error>(index)
        });
    }
    assert_eq!(queue.pending_len(), 5);
    assert_eq!(queue.dequeue_all().await.unwrap(), vec![0, 1, 2, 3, 4]);
    assert_eq!(queue.pending_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn first_failure_is_raised_after_all_tasks_ran() {
    let queue = FunnelQueue::new(2);
    let finished = Arc::new(AtomicUsize::new(0));
    for (index, fails) in [false, true, false].into_iter().enumerate() {
        let finished = Arc::clone(&finished);
        queue.enqueue(1, async move {
            sleep(Duration::from_millis(10)).await;
            finished.fetch_add(1, Ordering::SeqCst);
            if fails {
                anyhow::bail!("task {index} failed");
            }
            Ok(index)
        });
    }

    let err = queue.dequeue_all().await.unwrap_err();
    assert_eq!(err.to_string(), "task 1 failed");
    assert_eq!(finished.load(Ordering::SeqCst), 3);
    assert!(queue.dequeue_all().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn milestone_starts_after_failed_predecessors() {
    let queue = FunnelQueue::new(3);
    let finished = Arc::new(AtomicUsize::new(0));
    for delay in [40u64, 20] {
        let finished = Arc::clone(&finished);
        queue.enqueue(1, async move {
            sleep(Duration::from_millis(delay)).await;
            finished.fetch_add(1, Ordering::SeqCst);
            Err::<usize, _>(anyhow::anyhow!("predecessor failed"))
        });
    }
    let seen = Arc::new(AtomicUsize::new(usize::MAX));
    {
        let finished = Arc::clone(&finished);
        let seen = Arc::clone(&seen);
        queue.enqueue_milestone(1, async move {
            seen.store(finished.load(Ordering::SeqCst), Ordering::SeqCst);
            Ok(0)
        });
    }

    assert!(queue.dequeue_all().await.is_err());
    assert_eq!(seen.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn limiter_returns_results_in_item_order() {
    let results = limiter(2, vec![1u64, 2, 3, 4, 5], |n| async move {
        sleep(Duration::from_millis((7 - n) * 13 % 50)).await;
        Ok::<_, anyhow::Error>(n * 2)
    })
    .await
    .unwrap();
    assert_eq!(results, vec![2, 4, 6, 8, 10]);
}

#[tokio::test]
async fn limiter_fails_when_any_worker_fails() {
    let err = limiter(3, ["a", "b", "c"], |item| async move {
        if item == "b" {
            anyhow::bail!("worker for {item} failed");
        }
        Ok(item.len())
    })
    .await
    .unwrap_err();
    assert_eq!(err.to_string(), "worker for b failed");
}

#[tokio::test(start_paused = true)]
async fn limiter_keeps_workers_within_the_limit() {
    let occupancy = Arc::new(Occupancy::default());
    let results = limiter(3, 0..10u64, |n| {
        let occupancy = Arc::clone(&occupancy);
        async move {
            occupancy.enter();
            sleep(Duration::from_millis(10 + n % 3 * 7)).await;
            occupancy.leave();
            Ok::<_, anyhow::Error>(n)
        }
    })
    .await
    .unwrap();
    assert_eq!(results, (0..10u64).collect::<Vec<_>>());
    assert_eq!(occupancy.peak(), 3);
}
