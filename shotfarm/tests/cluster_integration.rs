//! Integration tests for the local worker pool
//!
//! These exercise admission control, failure propagation and pool
//! lifecycle through the orchestrator, the way sessions drive it.

use serde::{Deserialize, Serialize};
use shotfarm::cluster::ClusterOrchestrator;
use shotfarm::{partition, ClusterConfig, FwiError, Result, ShotCatalog};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Context {
    fail_shot: Option<u32>,
}

fn cluster(n_workers: usize) -> ClusterOrchestrator {
    ClusterOrchestrator::start(&ClusterConfig {
        n_workers,
        ..Default::default()
    })
    .unwrap()
}

#[tokio::test]
async fn test_one_task_per_slot_at_a_time() {
    let cluster = cluster(2);
    let handle = cluster.scatter(&Context { fail_shot: None }, true).await.unwrap();

    let futures = cluster
        .map(
            |i: usize, _: &Context| -> Result<usize> {
                std::thread::sleep(Duration::from_millis(20));
                Ok(i)
            },
            (0..8).collect(),
            &handle,
        )
        .await
        .unwrap();
    let results = cluster.gather(futures).await.unwrap();
    assert_eq!(results, (0..8).collect::<Vec<_>>());

    let peaks = cluster.pool().peak_concurrency().await;
    assert_eq!(peaks.len(), 2);
    assert!(peaks.iter().all(|&p| p == 1), "peaks: {:?}", peaks);
    cluster.close().await.unwrap();
}

#[tokio::test]
async fn test_failed_shot_fails_the_whole_gather() {
    let cluster = cluster(3);
    let shots = ShotCatalog::forward(9, 2, 100.0, 10.0, 10.0).unwrap().tasks();
    let partitions = partition(shots, cluster.slots()).unwrap();
    let handle = cluster
        .scatter(&Context { fail_shot: Some(4) }, true)
        .await
        .unwrap();

    let futures = cluster
        .map(
            |p: shotfarm::Partition, ctx: &Context| -> Result<f64> {
                let mut objective = 0.0;
                for shot in &p.shots {
                    if Some(shot.id) == ctx.fail_shot {
                        return Err(FwiError::simulation(
                            shot.id,
                            FwiError::Solver("diverged".to_string()),
                        ));
                    }
                    objective += 1.0;
                }
                Ok(objective)
            },
            partitions,
            &handle,
        )
        .await
        .unwrap();

    // no partial sum comes back
    let err = cluster.gather(futures).await.unwrap_err();
    assert_eq!(err.failed_shots(), vec![4]);

    let stats = cluster.pool().stats();
    assert_eq!(stats.total_tasks(), 3);
    assert_eq!(stats.tasks_failed.load(std::sync::atomic::Ordering::Relaxed), 1);
    cluster.close().await.unwrap();
}

#[tokio::test]
async fn test_scale_replicates_broadcasts() {
    let cluster = cluster(1);
    let handle = cluster.scatter(&Context { fail_shot: None }, true).await.unwrap();

    cluster.scale(4).await.unwrap();
    assert_eq!(cluster.slots(), 4);

    let futures = cluster
        .map(
            |i: u32, ctx: &Context| -> Result<bool> { Ok(ctx.fail_shot.is_none() && i < 4) },
            vec![0, 1, 2, 3],
            &handle,
        )
        .await
        .unwrap();
    let workers: Vec<usize> = futures.iter().map(|f| f.worker_id).collect();
    assert_eq!(workers, vec![0, 1, 2, 3]);
    assert!(cluster.gather(futures).await.unwrap().into_iter().all(|ok| ok));

    cluster.scale(2).await.unwrap();
    assert_eq!(cluster.slots(), 2);
    assert!(cluster.scale(0).await.is_err());
    cluster.close().await.unwrap();
}

#[tokio::test]
async fn test_close_twice_then_reject_work() {
    let cluster = cluster(2);
    let handle = cluster.scatter(&Context { fail_shot: None }, true).await.unwrap();

    cluster.close().await.unwrap();
    cluster.close().await.unwrap();
    assert!(cluster.is_closed());

    let result = cluster
        .map(|i: u32, _: &Context| -> Result<u32> { Ok(i) }, vec![1], &handle)
        .await;
    assert!(matches!(result, Err(FwiError::Cluster(_))));
}
