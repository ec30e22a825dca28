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

    fn one_connection() -> model::config::ControlPlaneSnapshot {
        snapshot(
            "ws-1",
            vec![source("src-1", "app", vec![destination("dst-1", KIND)])],
        )
    }

    // 2000 monotonic staging files, batch size 960: three waiting jobs with
    // contiguous ranges and the default priority.
    #[tokio::test]
    async fn single_connection_happy_path() {
        let harness = Harness::new();
        let router = Router::new(KIND, harness.router_deps()).await.unwrap();
        Registry::new(router.state().clone())
            .apply_snapshot(&one_connection())
            .await;

        harness
            .store
            .add_staging_files((1..=2000).map(|id| staging_file(id, "src-1", "dst-1", true)));

        let connection = harness.connection("dst-1", "src-1").await;
        let created = Creator::new(router.state().clone())
            .process_connection(&connection)
            .await
            .unwrap();
        assert_eq!(created, 3);

        let uploads = harness.store.uploads();
        let ranges: Vec<(i64, i64)> = uploads
            .iter()
            .map(|u| (u.start_staging_file_id, u.end_staging_file_id))
            .collect();
        assert_eq!(ranges, vec![(1, 960), (961, 1920), (1921, 2000)]);
        for upload in &uploads {
            assert_eq!(upload.status, UploadStatus::Waiting);
            assert_eq!(upload.priority, 100);
            assert!(!upload.in_progress);
            assert_eq!(upload.namespace, "app");
        }
    }

    // A flip of the storage flavor splits batches even when the batch size
    // would have fit everything in one.
    #[tokio::test]
    async fn storage_change_splits_batches() {
        let harness = Harness::new();
        let router = Router::new(KIND, harness.router_deps()).await.unwrap();
        Registry::new(router.state().clone())
            .apply_snapshot(&one_connection())
            .await;

        harness
            .store
            .add_staging_files((1..=300).map(|id| staging_file(id, "src-1", "dst-1", true)));
        harness
            .store
            .add_staging_files((301..=500).map(|id| staging_file(id, "src-1", "dst-1", false)));

        let connection = harness.connection("dst-1", "src-1").await;
        let created = Creator::new(router.state().clone())
            .process_connection(&connection)
            .await
            .unwrap();
        assert_eq!(created, 2);

        let uploads = harness.store.uploads();
        assert_eq!(
            (uploads[0].start_staging_file_id, uploads[0].end_staging_file_id),
            (1, 300)
        );
        assert_eq!(
            (uploads[1].start_staging_file_id, uploads[1].end_staging_file_id),
            (301, 500)
        );
        assert!(uploads[0].metadata.use_rudder_storage);
        assert!(!uploads[1].metadata.use_rudder_storage);
    }

    // A superseded waiting job is deleted and its priority carried into the
    // replacement.
    #[tokio::test]
    async fn priority_carry_forward_on_recreate() {
        let harness = Harness::new();
        let router = Router::new(KIND, harness.router_deps()).await.unwrap();
        Registry::new(router.state().clone())
            .apply_snapshot(&one_connection())
            .await;

        harness
            .store
            .add_staging_files((1..=100).map(|id| staging_file(id, "src-1", "dst-1", true)));
        let old_id = harness.store.seed_upload(upload_row(
            "src-1",
            "dst-1",
            "app",
            KIND,
            (1, 60),
            UploadStatus::Waiting,
            Some(50),
        ));

        let connection = harness.connection("dst-1", "src-1").await;
        let created = Creator::new(router.state().clone())
            .process_connection(&connection)
            .await
            .unwrap();
        assert_eq!(created, 1);

        let uploads = harness.store.uploads();
        assert_eq!(uploads.len(), 1, "old waiting job should be gone");
        assert_ne!(uploads[0].id, old_id);
        assert_eq!(uploads[0].priority, 50);
        assert_eq!(
            (uploads[0].start_staging_file_id, uploads[0].end_staging_file_id),
            (1, 100)
        );
    }

    // Two jobs in the same (destination, namespace) partition: while the
    // first is in flight, the second stays unclaimed no matter how many
    // workers are free.
    #[tokio::test]
    async fn partition_exclusion_holds_back_second_job() {
        let mut settings = test_settings();
        settings.staging_files_batch_size = 1;
        let harness = Harness::with_settings(settings);
        let router = Router::new(KIND, harness.router_deps()).await.unwrap();
        Registry::new(router.state().clone())
            .apply_snapshot(&one_connection())
            .await;

        harness
            .store
            .add_staging_files((1..=2).map(|id| staging_file(id, "src-1", "dst-1", true)));

        let connection = harness.connection("dst-1", "src-1").await;
        let created = Creator::new(router.state().clone())
            .process_connection(&connection)
            .await
            .unwrap();
        assert_eq!(created, 2);

        let allocator = Allocator::new(router.state().clone());
        let first = allocator.tick(4).await.unwrap();
        assert_eq!(first.len(), 1, "only the partition's first job is claimable");
        let claimed_id = first[0].upload.id;

        let second = allocator.tick(4).await.unwrap();
        assert!(second.is_empty(), "partition is saturated while job 1 runs");

        let uploads = harness.store.uploads();
        let other = uploads.iter().find(|u| u.id != claimed_id).unwrap();
        assert!(!other.in_progress);
        assert_eq!(other.status, UploadStatus::Waiting);
    }

    // Jobs of degraded workspaces are invisible to the allocator.
    #[tokio::test]
    async fn degraded_workspace_is_skipped() {
        let harness = Harness::new();
        let router = Router::new(KIND, harness.router_deps()).await.unwrap();
        Registry::new(router.state().clone())
            .apply_snapshot(&one_connection())
            .await;

        harness
            .store
            .add_staging_files((1..=10).map(|id| staging_file(id, "src-1", "dst-1", true)));
        let connection = harness.connection("dst-1", "src-1").await;
        Creator::new(router.state().clone())
            .process_connection(&connection)
            .await
            .unwrap();

        harness.oracle.set(vec!["ws-1".to_string()]).await;
        harness.tenant.refresh().await;

        let allocator = Allocator::new(router.state().clone());
        assert!(allocator.tick(4).await.unwrap().is_empty());
        assert!(harness.store.uploads().iter().all(|u| !u.in_progress));

        // Once the workspace recovers, the job is claimed as usual.
        harness.oracle.set(Vec::new()).await;
        harness.tenant.refresh().await;
        assert_eq!(allocator.tick(4).await.unwrap().len(), 1);
    }

    // A row whose (source, destination) pair vanished from the config is
    // aborted at dispatch and never selected again.
    #[tokio::test]
    async fn unknown_connection_is_aborted() {
        let harness = Harness::new();
        let router = Router::new(KIND, harness.router_deps()).await.unwrap();
        Registry::new(router.state().clone())
            .apply_snapshot(&one_connection())
            .await;

        let orphan_id = harness.store.seed_upload(upload_row(
            "src-x",
            "dst-y",
            "orphaned",
            KIND,
            (1, 10),
            UploadStatus::Waiting,
            None,
        ));

        let allocator = Allocator::new(router.state().clone());
        assert!(allocator.tick(4).await.unwrap().is_empty());

        let orphan = harness.store.upload(orphan_id).unwrap();
        assert_eq!(orphan.status, UploadStatus::Aborted);
        assert!(!orphan.in_progress);
        assert!(orphan.error.to_string().contains("unable to find source"));

        // Terminal now; a second pass leaves it alone.
        assert!(allocator.tick(4).await.unwrap().is_empty());
        assert_eq!(
            harness.store.upload(orphan_id).unwrap().status,
            UploadStatus::Aborted
        );
    }

    // Full loop smoke test: config push, creator and allocator loops running,
    // worker hands the job to the loader, loader completes it.
    #[tokio::test]
    async fn router_runs_jobs_end_to_end() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let harness = Harness::new();
        harness.runner.complete_into(harness.store.clone());

        // Staging lands before the config so the creator's first pass over
        // the connection finds it; a pass that sees nothing pending arms the
        // sync-frequency gate.
        harness
            .store
            .add_staging_files((1..=10).map(|id| staging_file(id, "src-1", "dst-1", true)));

        let router = Router::setup(KIND, harness.router_deps()).await.unwrap();
        harness.push_config(one_connection());

        let runner = harness.runner.clone();
        wait_for("the loader to receive the job", || !runner.runs().is_empty()).await;

        let store = harness.store.clone();
        wait_for("the upload to be exported", || {
            store
                .uploads()
                .iter()
                .any(|u| u.status == UploadStatus::ExportedData && !u.in_progress)
        })
        .await;

        router.shutdown().await.unwrap();
    }
}
