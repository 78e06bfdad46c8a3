//! Demo of schema routing and the read cache against two clusters.
//!
//! Expects a config file mapping at least one schema per cluster:
//!   PGM_CONFIG=./multiverse.config.json cargo run -p pg_multiverse --example demo

use multiverse_core::QueryOptions;
use pg_multiverse::{Coordinator, CoordinatorOptions, Event};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path =
        std::env::var("PGM_CONFIG").unwrap_or_else(|_| "./multiverse.config.json".to_string());

    let coordinator = Coordinator::new(CoordinatorOptions {
        config_path: Some(config_path.into()),
        ..Default::default()
    });
    coordinator.initialize(None).await?;

    // Print every event the coordinator surfaces while we work.
    let mut events = coordinator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            println!("  event: {}", event.kind());
            if let Event::ClusterDown { cluster_id, reason } = event {
                println!("  !! {cluster_id} down: {reason}");
            }
        }
    });

    for descriptor in coordinator.manager().get_clusters().await {
        println!(
            "cluster {} [{}] serves {:?} with {} replica(s)",
            descriptor.id,
            descriptor.status.as_str(),
            descriptor.schemas,
            descriptor.replicas
        );
    }

    let schema = coordinator
        .manager()
        .schemas()
        .await
        .into_iter()
        .next()
        .expect("config maps at least one schema");

    let opts = QueryOptions {
        schema: Some(schema.clone()),
        cache: true,
        cache_ttl: Some(Duration::from_secs(30)),
        ..Default::default()
    };

    // First run misses the cache, second one hits it.
    for attempt in 1..=2 {
        let out = coordinator
            .query("SELECT NOW() AS server_time", &[], &opts)
            .await?;
        println!("attempt {attempt}: {}", out.rows[0]["server_time"]);
    }

    let metrics = coordinator.get_metrics().await;
    println!(
        "{} total queries, {:.1}% errors, cache entries: {}",
        metrics.total_queries,
        metrics.error_rate,
        metrics.cache.map(|c| c.entries).unwrap_or(0)
    );

    coordinator.close().await;
    Ok(())
}
