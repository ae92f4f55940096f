//! Rebalance pass integration tests
//!
//! Run with: cargo test -p chunkvault-rebalancer --test rebalance

mod common;

use chunkvault_core::verify_checksum;
use chunkvault_metadata::{Chunk, MetadataRepository, Node, NodeStatus};
use chunkvault_rebalancer::{
    refresh_node_metrics, BalancerConfig, ChunkTransfer, LoadRebalancer, NodeSnapshot,
    RebalancerConfig, RunEvent, RunReport, TransferConfig,
};
use chunkvault_storage::NodeFaults;
use common::{payload, RepoFaults, TestCluster, NS};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Three light nodes and one heavy node; the heavy node shares each of its
/// chunks with one light node, plus one chunk only it holds
struct Skewed {
    cluster: TestCluster,
    light: Vec<Node>,
    heavy: Node,
    shared: Vec<Chunk>,
    single: Chunk,
}

fn skewed() -> Skewed {
    let mut cluster = TestCluster::new();
    let light: Vec<Node> = (1..=3).map(|n| cluster.node(n, 10)).collect();
    let heavy = cluster.node(4, 100);

    let shared: Vec<Chunk> = (0..6u8)
        .map(|i| {
            let partner = &light[i as usize % light.len()];
            cluster.chunk(&payload(i, 100 + i as usize * 10), &[&heavy, partner])
        })
        .collect();
    let single = cluster.chunk(&payload(42, 64), &[&heavy]);

    Skewed {
        cluster,
        light,
        heavy,
        shared,
        single,
    }
}

fn rebalance_config(cluster: &TestCluster) -> RebalancerConfig {
    RebalancerConfig {
        // Keep repair out of the way
        min_replicas: 1,
        balance_load: true,
        ..cluster.config()
    }
}

#[tokio::test]
async fn test_dead_band_reports_balanced() {
    let mut cluster = TestCluster::new();
    let nodes: Vec<Node> = [30, 30, 30, 35]
        .iter()
        .enumerate()
        .map(|(i, load)| cluster.node(i as u128 + 1, *load))
        .collect();
    cluster.chunk(&payload(1, 32), &[&nodes[3], &nodes[0]]);
    let mutations = cluster.repo.mutation_count();

    let config = rebalance_config(&cluster);
    let report = cluster.coordinator(config).run().await.unwrap();

    assert!(report.summary.balanced);
    assert_eq!(report.summary.moves_performed, 0);
    assert!(report
        .events
        .iter()
        .any(|e| matches!(e, RunEvent::Balanced { avg_load } if *avg_load == 31.25)));
    assert_eq!(cluster.repo.mutation_count(), mutations);
}

#[tokio::test]
async fn test_drains_overloaded_node() {
    let Skewed {
        cluster,
        light,
        heavy,
        shared,
        single,
    } = skewed();

    let config = rebalance_config(&cluster);
    let report = cluster.coordinator(config).run().await.unwrap();

    assert!(!report.summary.balanced);
    assert_eq!(report.summary.moves_performed, shared.len());
    assert_eq!(cluster.load_of(&heavy), 100 - shared.len() as i64);
    let light_total: i64 = light.iter().map(|n| cluster.load_of(n)).sum();
    assert_eq!(light_total, 30 + shared.len() as i64);

    for chunk in &shared {
        let holders = cluster.holders(chunk);
        assert_eq!(holders.len(), 2);
        assert!(!holders.contains(&heavy.id));
        assert!(cluster.blob_on(&heavy, chunk).is_none());
        for node in light.iter().filter(|n| holders.contains(&n.id)) {
            let blob = cluster.blob_on(node, chunk).unwrap();
            assert!(verify_checksum(&blob, &chunk.checksum));
        }
    }

    // A chunk with a single replica never moves
    assert_eq!(cluster.holders(&single), vec![heavy.id]);
    assert!(cluster.blob_on(&heavy, &single).is_some());
    assert_eq!(cluster.endpoint(&heavy).delete_count(), shared.len() as u64);
}

#[tokio::test]
async fn test_smallest_chunks_move_first() {
    let mut cluster = TestCluster::new();
    let a = cluster.node(1, 0);
    let b = cluster.node(2, 0);
    let heavy = cluster.node(3, 4);
    let big = cluster.chunk(&payload(1, 4000), &[&heavy, &a]);
    let small = cluster.chunk(&payload(2, 40), &[&heavy, &a]);

    // avg 4/3; one move brings the heavy node to 3, the next to 2
    let config = rebalance_config(&cluster);
    let report = cluster.coordinator(config).run().await.unwrap();

    let moved: Vec<Uuid> = report
        .events
        .iter()
        .filter_map(|e| match e {
            RunEvent::MovePerformed { chunk, .. } => Some(chunk.id),
            _ => None,
        })
        .collect();
    assert_eq!(moved, vec![small.id, big.id]);
    assert!(cluster.holders(&small).contains(&b.id));
    assert!(cluster.holders(&big).contains(&b.id));
    assert_eq!(cluster.load_of(&heavy), 2);
}

#[tokio::test]
async fn test_dry_run_moves_nothing() {
    let Skewed {
        cluster,
        heavy,
        shared,
        ..
    } = skewed();
    let mutations = cluster.repo.mutation_count();

    let config = RebalancerConfig {
        dry_run: true,
        ..rebalance_config(&cluster)
    };
    let report = cluster.coordinator(config).run().await.unwrap();

    assert_eq!(report.summary.moves_planned, shared.len());
    assert_eq!(report.summary.moves_performed, 0);
    assert_eq!(
        report
            .events_where(|e| matches!(e, RunEvent::MovePlanned { .. }))
            .len(),
        shared.len()
    );
    assert_eq!(cluster.repo.mutation_count(), mutations);
    assert_eq!(cluster.nodes.total_puts(), 0);
    assert_eq!(cluster.nodes.total_deletes(), 0);
    for chunk in &shared {
        assert!(cluster.holders(chunk).contains(&heavy.id));
    }
}

#[tokio::test]
async fn test_unreadable_source_is_never_released() {
    let Skewed {
        cluster,
        heavy,
        shared,
        ..
    } = skewed();
    cluster.endpoint(&heavy).set_faults(NodeFaults {
        corrupt_reads: true,
        ..Default::default()
    });
    let mutations = cluster.repo.mutation_count();

    let config = rebalance_config(&cluster);
    let report = cluster.coordinator(config).run().await.unwrap();

    assert_eq!(report.summary.moves_performed, 0);
    assert_eq!(report.summary.moves_skipped, shared.len());
    for chunk in &shared {
        assert!(cluster.holders(chunk).contains(&heavy.id));
        assert!(cluster.blob_on(&heavy, chunk).is_some());
    }
    assert_eq!(cluster.repo.mutation_count(), mutations);
}

#[tokio::test]
async fn test_failed_upload_keeps_source() {
    let Skewed {
        cluster,
        light,
        heavy,
        shared,
        ..
    } = skewed();
    for node in &light {
        cluster.endpoint(node).set_faults(NodeFaults {
            fail_put: true,
            ..Default::default()
        });
    }

    let config = rebalance_config(&cluster);
    let report = cluster.coordinator(config).run().await.unwrap();

    assert_eq!(report.summary.moves_performed, 0);
    assert!(report
        .events
        .iter()
        .all(|e| !matches!(e, RunEvent::MovePerformed { .. })));
    for chunk in &shared {
        assert_eq!(cluster.holders(chunk).len(), 2);
        assert!(cluster.holders(chunk).contains(&heavy.id));
    }
    assert_eq!(cluster.load_of(&heavy), 100);
}

#[tokio::test]
async fn test_moves_never_drop_below_floor() {
    let Skewed {
        cluster, shared, ..
    } = skewed();

    let config = RebalancerConfig {
        min_replicas: 2,
        ..rebalance_config(&cluster)
    };
    let report = cluster.coordinator(config).run().await.unwrap();

    // Repair first brings the single-replica chunk to two copies
    assert_eq!(report.summary.chunks_repaired, 1);
    for chunk in cluster.repo.chunk_ids() {
        assert!(cluster.repo.online_replica_count(chunk) >= 2);
    }
    assert!(report.summary.moves_performed >= shared.len());
}

fn moves(report: &RunReport) -> Vec<(Uuid, bool)> {
    report
        .events
        .iter()
        .filter_map(|e| match e {
            RunEvent::MovePerformed {
                chunk,
                source_released,
                ..
            } => Some((chunk.id, *source_released)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_shared_content_addressed_blob_survives_move() {
    let mut cluster = TestCluster::new();
    let a = cluster.node(1, 0);
    let b = cluster.node(2, 0);
    let heavy = cluster.node(3, 3);
    let data = payload(5, 300);
    let first = cluster.content_addressed_chunk(&data, &[&heavy, &a]);
    let second = cluster.content_addressed_chunk(&data, &[&heavy, &a]);
    assert_eq!(first.object_key(), second.object_key());

    // avg 1: one move fills b, the other chunk has nowhere to go
    let config = rebalance_config(&cluster);
    let report = cluster.coordinator(config).run().await.unwrap();

    let moved = moves(&report);
    assert_eq!(moved.len(), 1);
    let (moved_id, released) = moved[0];
    assert!(released);
    let (moved, stayed) = if moved_id == first.id {
        (&first, &second)
    } else {
        (&second, &first)
    };

    assert_eq!(cluster.holders(moved), vec![a.id, b.id]);
    assert!(cluster.holders(stayed).contains(&heavy.id));
    // The twin still links heavy under the same key
    assert!(cluster.blob_on(&heavy, stayed).is_some());
    assert_eq!(cluster.endpoint(&heavy).delete_count(), 0);
    assert_eq!(cluster.load_of(&heavy), 2);
    assert_eq!(cluster.load_of(&b), 1);
}

#[tokio::test]
async fn test_source_kept_when_other_holder_went_offline() {
    let mut cluster = TestCluster::new();
    let a = cluster.node(1, 0);
    let b = cluster.node(2, 0);
    let heavy = cluster.node(3, 4);
    let chunk = cluster.chunk(&payload(6, 200), &[&heavy, &a]);

    let repo: Arc<dyn MetadataRepository> = cluster.repo.clone();
    let mut snapshot = NodeSnapshot::load(&*repo).await.unwrap();
    // a fails after the snapshot counted it as a second online replica
    cluster
        .repo
        .set_node_status(a.id, NodeStatus::Offline)
        .unwrap();

    let transfer = Arc::new(ChunkTransfer::new(
        repo.clone(),
        cluster.nodes.clone(),
        TransferConfig {
            namespace: NS.to_string(),
            timeout: Duration::from_secs(2),
            use_dedup_sources: false,
        },
    ));
    let balancer = LoadRebalancer::new(repo, transfer, BalancerConfig::default());
    let mut report = RunReport::new(false);
    balancer.run(&mut snapshot, &mut report).await.unwrap();

    assert_eq!(moves(&report), vec![(chunk.id, false)]);
    assert_eq!(cluster.holders(&chunk), vec![a.id, b.id, heavy.id]);
    assert!(cluster.blob_on(&heavy, &chunk).is_some());
    assert!(cluster.blob_on(&b, &chunk).is_some());
    assert_eq!(cluster.endpoint(&heavy).delete_count(), 0);
    assert_eq!(cluster.load_of(&heavy), 4);
    assert_eq!(cluster.load_of(&b), 1);
}

#[tokio::test]
async fn test_move_completes_when_source_counters_fail() {
    let mut cluster = TestCluster::new();
    let a = cluster.node(1, 0);
    let b = cluster.node(2, 0);
    let heavy = cluster.node(3, 4);
    let big = cluster.chunk(&payload(1, 4000), &[&heavy, &a]);
    let small = cluster.chunk(&payload(2, 40), &[&heavy, &a]);

    let faults = RepoFaults {
        fail_decrements: true,
        ..Default::default()
    };
    let report = cluster
        .faulty_coordinator(faults, rebalance_config(&cluster))
        .run()
        .await
        .unwrap();

    // Same moves as with a healthy repository
    assert_eq!(moves(&report), vec![(small.id, true), (big.id, true)]);
    assert_eq!(report.summary.moves_skipped, 0);
    let drifted = report
        .events_where(|e| matches!(e, RunEvent::CounterDrift { node, .. } if *node == heavy.url))
        .len();
    assert_eq!(drifted, 2);

    for chunk in [&small, &big] {
        assert_eq!(cluster.holders(chunk), vec![a.id, b.id]);
        assert!(cluster.blob_on(&heavy, chunk).is_none());
    }
    assert_eq!(cluster.load_of(&b), 2);

    // heavy's stored load is stale until a refresh
    assert_eq!(cluster.load_of(&heavy), 4);
    refresh_node_metrics(&*cluster.repo).await.unwrap();
    assert_eq!(cluster.load_of(&heavy), 0);
}
