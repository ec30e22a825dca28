#[cfg(test)]
mod tests {
    use crate::fixtures::*;
    use model::destination::DestinationKind;
    use model::upload::UploadStatus;
    use scheduler::allocator::Allocator;
    use scheduler::creator::Creator;
    use scheduler::registry::Registry;
    use scheduler::router::Router;

    const KIND: DestinationKind = DestinationKind::Postgres;

    async fn router_with(
        harness: &Harness,
        snapshot: &model::config::ControlPlaneSnapshot,
    ) -> Router {
        let router = Router::new(KIND, harness.router_deps()).await.unwrap();
        Registry::new(router.state().clone())
            .apply_snapshot(snapshot)
            .await;
        router
    }

    fn one_connection() -> model::config::ControlPlaneSnapshot {
        snapshot(
            "ws-1",
            vec![source("src-1", "app", vec![destination("dst-1", KIND)])],
        )
    }

    // Consecutive creating passes must be at least a sync interval apart,
    // unless a manual trigger bypasses the gate. The trigger is consumed by
    // the pass that honors it.
    #[tokio::test]
    async fn frequency_gate_and_manual_trigger() {
        let harness = Harness::new();
        let router = router_with(&harness, &one_connection()).await;
        let creator = Creator::new(router.state().clone());
        let connection = harness.connection("dst-1", "src-1").await;

        harness
            .store
            .add_staging_files((1..=5).map(|id| staging_file(id, "src-1", "dst-1", true)));
        assert_eq!(creator.process_connection(&connection).await.unwrap(), 1);

        // More staging inside the sync interval: gated.
        harness
            .store
            .add_staging_files((6..=10).map(|id| staging_file(id, "src-1", "dst-1", true)));
        assert_eq!(creator.process_connection(&connection).await.unwrap(), 0);

        // A manual trigger punches through and is consumed.
        harness.context.trigger_upload(&connection).await;
        assert_eq!(creator.process_connection(&connection).await.unwrap(), 1);
        assert!(!harness.context.is_triggered(&connection.identifier).await);
        assert_eq!(creator.process_connection(&connection).await.unwrap(), 0);

        // Triggered uploads jump the priority queue.
        let uploads = harness.store.uploads();
        let triggered = uploads.last().unwrap();
        assert_eq!(triggered.priority, 50);
    }

    // Boot resets every stale in-progress flag and snapshots interrupted
    // destinations; the creator lazily runs crash recovery before cutting
    // new jobs, and skips the connection when recovery fails.
    #[tokio::test]
    async fn restart_safety_and_lazy_crash_recovery() {
        let harness = Harness::new();
        harness.store.seed_upload({
            let mut row = upload_row(
                "src-1",
                "dst-1",
                "app",
                KIND,
                (1, 10),
                UploadStatus::ExportingData,
                None,
            );
            row.in_progress = true;
            row
        });

        let router = router_with(&harness, &one_connection()).await;

        // Restart safety: nothing is in progress after setup.
        assert!(harness.store.uploads().iter().all(|u| !u.in_progress));
        assert!(harness.context.is_interrupted("dst-1").await);

        let creator = Creator::new(router.state().clone());
        let connection = harness.connection("dst-1", "src-1").await;
        harness
            .store
            .add_staging_files((11..=20).map(|id| staging_file(id, "src-1", "dst-1", true)));

        // First attempt: recovery fails, the connection is skipped.
        harness.runner.fail_next_recovery();
        assert!(creator.process_connection(&connection).await.is_err());
        assert!(harness.context.is_interrupted("dst-1").await);
        assert_eq!(harness.store.uploads().len(), 1);

        // Next pass: recovery succeeds and jobs flow again.
        assert_eq!(creator.process_connection(&connection).await.unwrap(), 1);
        assert!(!harness.context.is_interrupted("dst-1").await);
        assert_eq!(
            harness.runner.recoveries(),
            vec!["dst-1".to_string(), "dst-1".to_string()]
        );
    }

    // Across distinct partitions, lower priority numbers are claimed first,
    // ids breaking ties.
    #[tokio::test]
    async fn priority_orders_claims_across_partitions() {
        let harness = Harness::new();
        let snapshot = snapshot(
            "ws-1",
            vec![
                source("src-1", "app", vec![destination("dst-1", KIND)]),
                source("src-2", "web", vec![destination("dst-2", KIND)]),
            ],
        );
        let router = router_with(&harness, &snapshot).await;

        let backlog = harness.store.seed_upload(upload_row(
            "src-1",
            "dst-1",
            "app",
            KIND,
            (1, 10),
            UploadStatus::Waiting,
            None,
        ));
        let urgent = harness.store.seed_upload(upload_row(
            "src-2",
            "dst-2",
            "web",
            KIND,
            (1, 10),
            UploadStatus::Waiting,
            Some(50),
        ));

        let allocator = Allocator::new(router.state().clone());

        let picked = allocator.tick(4).await.unwrap();
        let order: Vec<i64> = picked.iter().map(|job| job.upload.id).collect();
        assert_eq!(order, vec![urgent, backlog]);
    }

    // With a single free worker, only the most urgent partition wins the
    // tick; the other is untouched rather than half-claimed.
    #[tokio::test]
    async fn limited_workers_take_strictly_by_priority() {
        let harness = Harness::new();
        let snapshot = snapshot(
            "ws-1",
            vec![
                source("src-1", "app", vec![destination("dst-1", KIND)]),
                source("src-2", "web", vec![destination("dst-2", KIND)]),
            ],
        );
        let router = router_with(&harness, &snapshot).await;

        harness.store.seed_upload(upload_row(
            "src-1",
            "dst-1",
            "app",
            KIND,
            (1, 10),
            UploadStatus::Waiting,
            None,
        ));
        let urgent = harness.store.seed_upload(upload_row(
            "src-2",
            "dst-2",
            "web",
            KIND,
            (1, 10),
            UploadStatus::Waiting,
            Some(50),
        ));

        let allocator = Allocator::new(router.state().clone());
        let picked = allocator.tick(1).await.unwrap();
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].upload.id, urgent);
    }

    // Upload ranges of one (source, destination) never overlap, including
    // across delete-and-recreate cycles.
    #[tokio::test]
    async fn staging_ranges_stay_disjoint() {
        let mut settings = test_settings();
        settings.staging_files_batch_size = 30;
        let harness = Harness::with_settings(settings);
        let router = router_with(&harness, &one_connection()).await;
        let creator = Creator::new(router.state().clone());
        let connection = harness.connection("dst-1", "src-1").await;

        harness
            .store
            .add_staging_files((1..=100).map(|id| staging_file(id, "src-1", "dst-1", true)));
        assert_eq!(creator.process_connection(&connection).await.unwrap(), 4);

        harness
            .store
            .add_staging_files((101..=150).map(|id| staging_file(id, "src-1", "dst-1", true)));
        harness.context.trigger_upload(&connection).await;
        creator.process_connection(&connection).await.unwrap();

        let mut ranges: Vec<(i64, i64)> = harness
            .store
            .uploads()
            .iter()
            .map(|u| (u.start_staging_file_id, u.end_staging_file_id))
            .collect();
        ranges.sort();
        for pair in ranges.windows(2) {
            assert!(
                pair[0].1 < pair[1].0,
                "ranges overlap: {:?} and {:?}",
                pair[0],
                pair[1]
            );
        }
    }

    // Enable/Disable are idempotent and freely repeatable.
    #[tokio::test]
    async fn enable_disable_idempotence() {
        let harness = Harness::new();
        let router = router_with(&harness, &one_connection()).await;

        assert!(router.is_enabled());
        router.disable();
        router.disable();
        assert!(!router.is_enabled());
        router.enable();
        router.enable();
        assert!(router.is_enabled());
    }

    // Rows written before workspace ids existed are backfilled from the
    // registry at claim time.
    #[tokio::test]
    async fn claimed_rows_get_workspace_backfilled() {
        let harness = Harness::new();
        let router = router_with(&harness, &one_connection()).await;

        harness.store.seed_upload({
            let mut row = upload_row(
                "src-1",
                "dst-1",
                "app",
                KIND,
                (1, 10),
                UploadStatus::Waiting,
                None,
            );
            row.workspace_id = String::new();
            row
        });

        let allocator = Allocator::new(router.state().clone());
        let picked = allocator.tick(4).await.unwrap();
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].upload.workspace_id, "ws-1");
    }

    // Namespace resolution order: explicit config namespace, per-kind
    // dataset prefix, catalog record, sanitized source name; Clickhouse
    // takes the database name directly.
    #[tokio::test]
    async fn namespace_derivation_order() {
        let harness = Harness::new();

        let mut explicit = destination("dst-explicit", KIND);
        explicit.config.insert(
            "namespace".into(),
            serde_json::Value::String("My Space".into()),
        );
        let plain = destination("dst-plain", KIND);
        let stored = destination("dst-stored", KIND);
        harness
            .store
            .add_stored_namespace("src-1", "dst-stored", "legacy_ns");

        let snapshot = snapshot(
            "ws-1",
            vec![source("src-1", "Shop Events!", vec![explicit, plain, stored])],
        );
        let _router = router_with(&harness, &snapshot).await;

        assert_eq!(
            harness.connection("dst-explicit", "src-1").await.namespace,
            "my_space"
        );
        assert_eq!(
            harness.connection("dst-stored", "src-1").await.namespace,
            "legacy_ns"
        );
        assert_eq!(
            harness.connection("dst-plain", "src-1").await.namespace,
            "shop_events"
        );
    }

    #[tokio::test]
    async fn custom_dataset_prefix_wins_over_catalog() {
        let mut settings = test_settings();
        let mut router_settings = settings.default_router.clone();
        router_settings.custom_dataset_prefix = Some("rudder".into());
        settings.routers.insert("postgres".into(), router_settings);

        let harness = Harness::with_settings(settings);
        harness
            .store
            .add_stored_namespace("src-1", "dst-1", "legacy_ns");
        let _router = router_with(&harness, &one_connection()).await;

        assert_eq!(
            harness.connection("dst-1", "src-1").await.namespace,
            "rudder_app"
        );
    }

    #[tokio::test]
    async fn clickhouse_uses_database_as_namespace() {
        let harness = Harness::new();
        let mut ch = destination("dst-ch", DestinationKind::Clickhouse);
        ch.config.insert(
            "database".into(),
            serde_json::Value::String("analytics".into()),
        );
        let snapshot = snapshot("ws-1", vec![source("src-1", "app", vec![ch])]);

        let router = Router::new(DestinationKind::Clickhouse, harness.router_deps())
            .await
            .unwrap();
        Registry::new(router.state().clone())
            .apply_snapshot(&snapshot)
            .await;

        assert_eq!(
            harness.connection("dst-ch", "src-1").await.namespace,
            "analytics"
        );
    }

    // The supervisor starts routers for kinds present in the snapshot,
    // disables kinds that vanish, and re-enables them on return without
    // rebuilding.
    #[tokio::test]
    async fn supervisor_reconciles_routers_with_config() {
        let harness = Harness::new();
        let mut supervisor = scheduler::Supervisor::new(harness.router_deps());

        supervisor.apply(&one_connection()).await.unwrap();
        assert!(supervisor.router(KIND).unwrap().is_enabled());

        supervisor
            .apply(&snapshot("ws-1", vec![source("src-1", "app", vec![])]))
            .await
            .unwrap();
        let router = supervisor.router(KIND).unwrap();
        assert!(!router.is_enabled(), "router is disabled, not dropped");

        supervisor.apply(&one_connection()).await.unwrap();
        assert!(supervisor.router(KIND).unwrap().is_enabled());

        harness.cancel.cancel();
    }

    // Claimed jobs are hydrated with exactly the staging files of their
    // range.
    #[tokio::test]
    async fn claimed_jobs_carry_their_staging_files() {
        let harness = Harness::new();
        let router = router_with(&harness, &one_connection()).await;
        let creator = Creator::new(router.state().clone());
        let connection = harness.connection("dst-1", "src-1").await;

        harness
            .store
            .add_staging_files((1..=25).map(|id| staging_file(id, "src-1", "dst-1", true)));
        creator.process_connection(&connection).await.unwrap();

        let allocator = Allocator::new(router.state().clone());
        let picked = allocator.tick(4).await.unwrap();
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].staging_file_ids(), (1..=25).collect::<Vec<i64>>());
        assert_eq!(picked[0].connection.identifier, connection.identifier);
    }
}
