//! Compute Module Tests
//!
//! ## Test Scopes
//! - **Aggregation**: default folding of per-node results.
//! - **Worker**: local start/stop/clear semantics, heartbeats, panics.
//! - **Coordination**: end-to-end runs on an in-process 3-node grid, single-node
//!   and run-once tasks, silent/broken/crashed nodes, timeouts, takeover,
//!   mid-task crashes, stop requests, locks and atomic runs.
//! - **Task store**: per-node progress bookkeeping.
//! - **Protocol & registry**: start requests as JSON and task resolution.
//! - **Pipelines**: stage ordering, failure handling, `always` stages, resume, stop.

#[cfg(test)]
mod tests {
    use crate::compute::pipeline::{GridPipeline, PipelineStage, PIPELINE_ACTIVE_STAGE_STORE};
    use crate::compute::protocol::{WorkerReply, WorkerRequest};
    use crate::compute::registry::TaskRegistry;
    use crate::compute::task::{aggregate_results, FnTask, GridTask};
    use crate::compute::task_store::TaskStore;
    use crate::compute::types::{RunOptions, TaskExecutionResult, TaskProgress, TaskRef, TaskState};
    use crate::compute::worker::Worker;
    use crate::config::GridConfig;
    use crate::error::GridError;
    use crate::grid::{GridConnector, GridNode, GridTransport, LocalCluster, NodeEndpoint, NodeResponse};
    use crate::membership::types::NodeAddress;
    use crate::storage::GridStorage;
    use crate::util::now_ms;
    use crate::util::wait::{wait_until, Backoff, Check};

    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::task::JoinHandle;

    // ============================================================
    // HELPERS
    // ============================================================

    fn fast_config() -> GridConfig {
        GridConfig::new("test-grid")
            .with_heartbeat_interval(Duration::from_millis(20))
            .with_node_timeout(Duration::from_millis(500))
            .with_rpc_timeout(Duration::from_millis(250))
            .with_task_timeout(Some(Duration::from_secs(5)))
    }

    async fn start_grid(config: GridConfig, size: usize) -> (Arc<LocalCluster>, Vec<GridNode>) {
        let cluster = LocalCluster::new(config);
        let mut nodes = Vec::new();
        for i in 1..=size {
            nodes.push(cluster.connect(&format!("node-{}", i)).await.unwrap());
        }
        (cluster, nodes)
    }

    /// Calls `execute_task_with` on every node at once, like every crawler
    /// instance of a grid would.
    async fn run_on_all(
        nodes: &[GridNode],
        task: Arc<dyn GridTask>,
        options: RunOptions,
    ) -> Vec<TaskExecutionResult> {
        let handles: Vec<_> = nodes
            .iter()
            .map(|node| {
                let compute = node.compute().clone();
                let task = task.clone();
                tokio::spawn(async move { compute.execute_task_with(task, options).await })
            })
            .collect();

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap().unwrap());
        }
        results
    }

    fn counting_task(id: &str, runs: Arc<AtomicUsize>) -> FnTask {
        FnTask::new(id, move |ctx| {
            let runs = runs.clone();
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(Some(json!(ctx.node_address().to_string())))
            }
        })
    }

    async fn wait_for_state(worker: &Arc<Worker>, task_id: &str, state: TaskState) -> bool {
        wait_until(
            move || async move {
                if worker.get_node_task_progress(task_id).state() == Some(state) {
                    Check::Ready(())
                } else {
                    Check::NotYet
                }
            },
            Backoff::fixed(Duration::from_millis(10)),
            Some(Duration::from_secs(3)),
        )
        .await
        .is_done()
    }

    /// Endpoint still reporting `Running` with a heartbeat a minute old.
    struct SilentEndpoint;

    #[async_trait]
    impl NodeEndpoint for SilentEndpoint {
        async fn handle(&self, _from: &NodeAddress, request: WorkerRequest) -> anyhow::Result<WorkerReply> {
            Ok(match request {
                WorkerRequest::StartTask { .. } => WorkerReply::Started(true),
                WorkerRequest::GetProgress { .. } => WorkerReply::Progress(TaskProgress::new(
                    Some(TaskExecutionResult::running()),
                    now_ms().saturating_sub(60_000),
                )),
                _ => WorkerReply::Ack,
            })
        }
    }

    /// Endpoint failing every request.
    struct BrokenEndpoint;

    #[async_trait]
    impl NodeEndpoint for BrokenEndpoint {
        async fn handle(&self, _from: &NodeAddress, _request: WorkerRequest) -> anyhow::Result<WorkerReply> {
            Err(anyhow::anyhow!("disk on fire"))
        }
    }

    /// Adds a member served by `endpoint` and keeps it alive in the view.
    fn add_fake_member(cluster: &Arc<LocalCluster>, name: &str, endpoint: Arc<dyn NodeEndpoint>) -> JoinHandle<()> {
        let address = NodeAddress::new(name);
        cluster.membership().join(&address);
        cluster.transport().bind(&address, endpoint);

        let membership = cluster.membership().clone();
        tokio::spawn(async move {
            loop {
                membership.touch(&address);
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
    }

    fn recording_task(id: &str, log: Arc<Mutex<Vec<String>>>, value: i64) -> Arc<dyn GridTask> {
        let entry = id.to_string();
        FnTask::new(id, move |_ctx| {
            let log = log.clone();
            let entry = entry.clone();
            async move {
                log.lock().unwrap().push(entry);
                Ok(Some(json!(value)))
            }
        })
        .single_node()
        .into_task()
    }

    // ============================================================
    // AGGREGATION TESTS
    // ============================================================

    #[test]
    fn test_aggregate_ignores_non_terminal_results() {
        assert_eq!(aggregate_results(vec![]), None);
        assert_eq!(
            aggregate_results(vec![TaskExecutionResult::pending(), TaskExecutionResult::running()]),
            None
        );

        let result = aggregate_results(vec![
            TaskExecutionResult::running(),
            TaskExecutionResult::completed(Some(json!(7))),
        ])
        .unwrap();
        assert_eq!(result, TaskExecutionResult::completed(Some(json!(7))));
    }

    #[test]
    fn test_aggregate_any_failure_fails() {
        let result = aggregate_results(vec![
            TaskExecutionResult::completed(Some(json!(1))),
            TaskExecutionResult::failed("node-2 broke"),
            TaskExecutionResult::failed("node-3 broke"),
        ])
        .unwrap();

        assert_eq!(result.state, TaskState::Failed);
        assert_eq!(result.error.as_deref(), Some("node-2 broke; node-3 broke"));
    }

    #[test]
    fn test_aggregate_collects_values() {
        let several = aggregate_results(vec![
            TaskExecutionResult::completed(Some(json!(1))),
            TaskExecutionResult::completed(None),
            TaskExecutionResult::completed(Some(json!(2))),
        ])
        .unwrap();
        assert_eq!(several.result, Some(json!([1, 2])));

        let none = aggregate_results(vec![TaskExecutionResult::completed(None)]).unwrap();
        assert_eq!(none, TaskExecutionResult::completed(None));
    }

    // ============================================================
    // WORKER TESTS
    // ============================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_worker_does_not_start_a_task_twice() {
        // ARRANGE
        let (_cluster, nodes) = start_grid(fast_config(), 1).await;
        let worker = nodes[0].compute().worker().clone();
        let task = FnTask::new("waiter", |ctx| async move {
            ctx.stopped().await;
            Ok(None)
        })
        .into_task();

        // ACT & ASSERT: running
        assert!(worker.start_node_task(task.clone(), RunOptions::default()));
        assert!(!worker.start_node_task(task.clone(), RunOptions::default()));
        assert_eq!(worker.get_node_task_progress("waiter").state(), Some(TaskState::Running));

        // ACT & ASSERT: terminal
        worker.stop_node_task("waiter");
        assert!(wait_for_state(&worker, "waiter", TaskState::Completed).await);
        assert!(!worker.start_node_task(task.clone(), RunOptions::default()));

        // ACT & ASSERT: cleared
        worker.clear_task_status("waiter");
        assert!(!worker.is_node_task_stop_requested("waiter"));
        assert!(worker.start_node_task(task, RunOptions::default()));
        worker.stop_node_task("waiter");
        assert!(wait_for_state(&worker, "waiter", TaskState::Completed).await);
    }

    #[tokio::test]
    async fn test_worker_unknown_task_has_no_status() {
        let (_cluster, nodes) = start_grid(fast_config(), 1).await;
        let before = now_ms();

        let progress = nodes[0].compute().worker().get_node_task_progress("never-sent");

        assert!(progress.status.is_none());
        assert!(progress.last_heartbeat >= before);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_worker_reports_failures_and_panics() {
        let (_cluster, nodes) = start_grid(fast_config(), 1).await;
        let worker = nodes[0].compute().worker().clone();

        let failing = FnTask::new("failing", |_ctx| async { anyhow::bail!("no route to host") }).into_task();
        let panicking = FnTask::new("panicking", |_ctx| async { panic!("parser exploded") }).into_task();

        worker.start_node_task(failing, RunOptions::default());
        worker.start_node_task(panicking, RunOptions::default());

        assert!(wait_for_state(&worker, "failing", TaskState::Failed).await);
        assert!(wait_for_state(&worker, "panicking", TaskState::Failed).await);

        let failing = worker.get_node_task_progress("failing").status.unwrap();
        assert_eq!(failing.error.as_deref(), Some("no route to host"));
        let panicking = worker.get_node_task_progress("panicking").status.unwrap();
        assert!(panicking.error.unwrap().contains("parser exploded"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_worker_persists_heartbeats() {
        // ARRANGE
        let (cluster, nodes) = start_grid(fast_config(), 1).await;
        let worker = nodes[0].compute().worker().clone();
        let store = TaskStore::open(cluster.storage()).unwrap();
        let task = FnTask::new("long", |ctx| async move {
            ctx.stopped().await;
            Ok(None)
        })
        .into_task();

        // ACT
        worker.start_node_task(task, RunOptions::default());
        let first = store.node_progresses("long").unwrap()[0].1.last_heartbeat;
        tokio::time::sleep(Duration::from_millis(120)).await;

        // ASSERT: heartbeat moved while running
        let progresses = store.node_progresses("long").unwrap();
        assert_eq!(progresses.len(), 1);
        assert_eq!(progresses[0].0, NodeAddress::new("node-1"));
        assert_eq!(progresses[0].1.state(), Some(TaskState::Running));
        assert!(progresses[0].1.last_heartbeat > first);

        // ACT: clearing removes the persisted entry
        worker.stop_node_task("long");
        assert!(wait_for_state(&worker, "long", TaskState::Completed).await);
        worker.clear_task_status("long");
        assert!(store.node_progresses("long").unwrap().is_empty());
    }

    // ============================================================
    // COORDINATION TESTS
    // ============================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_three_node_grid_end_to_end() {
        // ARRANGE
        let (cluster, nodes) = start_grid(fast_config(), 3).await;
        let runs = Arc::new(AtomicUsize::new(0));
        let task = counting_task("crawl-start", runs.clone()).into_task();

        // ACT
        let results = run_on_all(&nodes, task, RunOptions::default()).await;

        // ASSERT: every node got the same aggregated result
        let expected = TaskExecutionResult::completed(Some(json!(["node-1", "node-2", "node-3"])));
        for result in &results {
            assert_eq!(result, &expected);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        // ASSERT: bookkeeping
        let coordinator = nodes[0].compute();
        assert_eq!(coordinator.task_state("crawl-start").unwrap(), Some(TaskState::Completed));
        assert_eq!(coordinator.terminated_result("crawl-start").unwrap(), Some(expected));
        let store = TaskStore::open(cluster.storage()).unwrap();
        assert!(store.request("crawl-start").unwrap().is_none());
        assert!(store.node_progresses("crawl-start").unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_node_task_runs_on_coordinator_only() {
        let (cluster, nodes) = start_grid(fast_config(), 3).await;
        let hits = cluster.storage().map::<u32>("hits").unwrap();

        let task = {
            let hits = hits.clone();
            FnTask::new("prepare", move |ctx| {
                let hits = hits.clone();
                async move {
                    hits.update(ctx.node_address().as_str(), |n| n.unwrap_or(0) + 1)?;
                    Ok(None)
                }
            })
            .single_node()
            .into_task()
        };

        run_on_all(&nodes, task.clone(), RunOptions::default()).await;
        let results = run_on_all(&nodes, task, RunOptions::default()).await;

        assert!(results.iter().all(|r| r.state == TaskState::Completed));
        assert_eq!(hits.keys().unwrap(), vec!["node-1".to_string()]);
        assert_eq!(hits.get("node-1").unwrap(), Some(2));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_run_once_task_fails_second_time() {
        let (_cluster, nodes) = start_grid(fast_config(), 3).await;
        let runs = Arc::new(AtomicUsize::new(0));
        let task = counting_task("init-queue", runs.clone()).run_once().into_task();

        let first = run_on_all(&nodes, task.clone(), RunOptions::default()).await;
        let second = run_on_all(&nodes, task, RunOptions::default()).await;

        assert!(first.iter().all(|r| r.state == TaskState::Completed));
        for result in &second {
            assert_eq!(result.state, TaskState::Failed);
            assert!(result.error.as_deref().unwrap().contains("already ran in this grid session"));
        }
        assert_eq!(runs.load(Ordering::SeqCst), 3, "second run must not dispatch");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_custom_aggregation_across_runs() {
        let (cluster, nodes) = start_grid(fast_config(), 3).await;
        let totals = cluster.storage().map::<i64>("totals").unwrap();

        let task = {
            let totals = totals.clone();
            FnTask::new("sum", move |_ctx| {
                let totals = totals.clone();
                async move {
                    totals.update("docs", |n| n.unwrap_or(0) + 5)?;
                    Ok(Some(json!(5)))
                }
            })
            .with_aggregator(|results| {
                let sum: i64 = results.iter().filter_map(|r| r.result.as_ref()?.as_i64()).sum();
                Some(TaskExecutionResult::completed(Some(json!(sum))))
            })
            .into_task()
        };

        let first = run_on_all(&nodes, task.clone(), RunOptions::default()).await;
        assert_eq!(first[0].result, Some(json!(15)));
        assert_eq!(totals.get("docs").unwrap(), Some(15));

        let second = run_on_all(&nodes, task, RunOptions::default()).await;
        assert_eq!(second[1].result, Some(json!(15)));
        assert_eq!(totals.get("docs").unwrap(), Some(30));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_silent_node_is_excluded() {
        // ARRANGE: a member that stopped heartbeating long ago
        let (cluster, nodes) = start_grid(fast_config(), 3).await;
        let keepalive = add_fake_member(&cluster, "node-4", Arc::new(SilentEndpoint));
        let runs = Arc::new(AtomicUsize::new(0));
        let task = counting_task("silent", runs.clone()).into_task();

        // ACT
        let results = run_on_all(&nodes, task, RunOptions::default()).await;
        keepalive.abort();

        // ASSERT: the silent node is dropped, its Running status ignored
        assert_eq!(
            results[0],
            TaskExecutionResult::completed(Some(json!(["node-1", "node-2", "node-3"])))
        );
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_rpc_failure_is_synthesized_as_failed() {
        let (cluster, nodes) = start_grid(fast_config(), 2).await;
        let keepalive = add_fake_member(&cluster, "node-3", Arc::new(BrokenEndpoint));
        let task = counting_task("broken", Arc::new(AtomicUsize::new(0))).into_task();

        let results = run_on_all(&nodes, task, RunOptions::default()).await;
        keepalive.abort();

        for result in &results {
            assert_eq!(result.state, TaskState::Failed);
            assert!(result.error.as_deref().unwrap().contains("disk on fire"));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_crashed_node_fails_the_task() {
        let (cluster, nodes) = start_grid(fast_config(), 3).await;
        assert!(cluster.crash(&NodeAddress::new("node-3")));

        let unreachable = nodes[0]
            .compute()
            .dispatcher()
            .get_task_progress_from_nodes("any", vec![NodeAddress::new("node-3")])
            .await;
        assert_eq!(unreachable[&NodeAddress::new("node-3")], NodeResponse::Unreachable);

        let task = counting_task("crash", Arc::new(AtomicUsize::new(0))).into_task();
        let results = run_on_all(&nodes[..2], task, RunOptions::default()).await;

        assert_eq!(results[0].state, TaskState::Failed);
        assert!(results[0].error.as_deref().unwrap().contains("Node unreachable"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_node_crashing_mid_task_fails_the_task() {
        // ARRANGE: the task outlives the node timeout several times over
        let config = fast_config().with_node_timeout(Duration::from_millis(300));
        let (cluster, nodes) = start_grid(config, 3).await;
        cluster.registry().register("slow", |task_id| {
            FnTask::new(task_id, |_ctx| async {
                tokio::time::sleep(Duration::from_millis(1200)).await;
                Ok(Some(json!("done")))
            })
            .into_task()
        });
        let crasher = {
            let cluster = cluster.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(600)).await;
                cluster.crash(&NodeAddress::new("node-3"))
            })
        };

        // ACT
        let result = nodes[0]
            .compute()
            .run_task("slow", "slow-1", RunOptions::default())
            .await
            .unwrap();

        // ASSERT
        assert!(crasher.await.unwrap());
        assert_eq!(result.state, TaskState::Failed);
        assert!(result.error.as_deref().unwrap().contains("Node unreachable"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_task_timeout() {
        let config = fast_config().with_task_timeout(Some(Duration::from_millis(200)));
        let (_cluster, nodes) = start_grid(config, 1).await;
        let task = FnTask::new("slow", |_ctx| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(None)
        })
        .into_task();

        let result = nodes[0].compute().execute_task(task).await.unwrap();

        assert_eq!(result.state, TaskState::Failed);
        assert!(result.error.as_deref().unwrap().contains("timed out after 200ms"));
        assert_eq!(nodes[0].compute().task_state("slow").unwrap(), Some(TaskState::Failed));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_waiter_expires_without_coordinator_heartbeat() {
        let config = fast_config().with_node_timeout(Duration::from_millis(150));
        let (_cluster, nodes) = start_grid(config, 2).await;
        let task = counting_task("orphan", Arc::new(AtomicUsize::new(0))).into_task();

        // Only the non-coordinator asks, so nobody ever publishes.
        let err = nodes[1].compute().execute_task(task).await.unwrap_err();

        assert!(matches!(err, GridError::Expired(_)));
        assert_eq!(err.to_string(), "Task expired. No heartbeat received from coordinator.");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_new_coordinator_takes_over_running_task() {
        // ARRANGE: a run left behind by a previous coordinator
        let (cluster, nodes) = start_grid(fast_config(), 2).await;
        TaskStore::open(cluster.storage())
            .unwrap()
            .set_state("resumable", TaskState::Running)
            .unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let task = counting_task("resumable", runs.clone()).into_task();

        // ACT
        let results = run_on_all(&nodes, task, RunOptions::default()).await;

        // ASSERT: nodes without a status got the task re-sent
        assert_eq!(results[0].state, TaskState::Completed);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stop_request_ends_task_everywhere() {
        let (_cluster, nodes) = start_grid(fast_config(), 3).await;
        let task = FnTask::new("stoppable", |ctx| async move {
            ctx.stopped().await;
            Ok(Some(json!("stopped")))
        })
        .into_task();

        let running = {
            let nodes = nodes.clone();
            tokio::spawn(async move { run_on_all(&nodes, task, RunOptions::default()).await })
        };
        tokio::time::sleep(Duration::from_millis(150)).await;
        nodes[2].compute().stop_task("stoppable").await;
        let results = running.await.unwrap();

        assert!(results.iter().all(|r| r.state == TaskState::Completed));
        assert_eq!(results[0].result, Some(json!(["stopped", "stopped", "stopped"])));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_locked_runs_do_not_overlap() {
        // ARRANGE
        let (cluster, nodes) = start_grid(fast_config(), 1).await;
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let task = {
            let (active, peak) = (active.clone(), peak.clone());
            FnTask::new("exclusive", move |_ctx| {
                let (active, peak) = (active.clone(), peak.clone());
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(None)
                }
            })
            .into_task()
        };

        // ACT: two locked runs of the same task at once
        let compute = nodes[0].compute().clone();
        let (first, second) = tokio::join!(
            compute.execute_task_with(task.clone(), RunOptions::default().locked()),
            compute.execute_task_with(task, RunOptions::default().locked()),
        );

        // ASSERT
        assert_eq!(first.unwrap().state, TaskState::Completed);
        assert_eq!(second.unwrap().state, TaskState::Completed);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert!(!TaskStore::open(cluster.storage()).unwrap().is_locked("exclusive").unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_atomic_run_rolls_back_on_failure() {
        let (cluster, nodes) = start_grid(fast_config(), 1).await;
        let task = FnTask::new("import", |ctx| async move {
            let docs = ctx.storage().map::<String>("docs")?;
            docs.put("doc-1", &"partial".to_string())?;
            anyhow::bail!("commit rejected")
        })
        .into_task();

        let result = nodes[0]
            .compute()
            .execute_task_with(task, RunOptions::default().atomic())
            .await
            .unwrap();

        assert_eq!(result.state, TaskState::Failed);
        assert!(result.error.as_deref().unwrap().contains("commit rejected"));
        assert_eq!(cluster.storage().map::<String>("docs").unwrap().get("doc-1").unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_atomic_run_allows_nested_and_concurrent_transactions() {
        // ARRANGE
        let (cluster, nodes) = start_grid(fast_config(), 1).await;
        let outside = cluster.storage().clone();
        let task = FnTask::new("nested-import", move |ctx| {
            let outside = outside.clone();
            async move {
                // Joins the task's own transaction.
                ctx.storage()
                    .run_in_transaction_async(|tx| async move {
                        tx.map::<String>("docs")?.put("doc-1", &"nested".to_string())?;
                        Ok(())
                    })
                    .await?;

                // Spawned work writes through a clone of the task's storage.
                let storage = ctx.storage().clone();
                tokio::spawn(async move { storage.map::<String>("docs")?.put("doc-2", &"spawned".to_string()) })
                    .await??;

                // An unrelated transaction on another thread commits on its own.
                tokio::task::spawn_blocking(move || {
                    outside.run_in_transaction(|tx| {
                        tx.map::<u64>("audit")?.update("imports", |n| n.unwrap_or(0) + 1)?;
                        Ok(())
                    })
                })
                .await??;
                Ok(Some(json!("imported")))
            }
        })
        .into_task();

        // ACT
        let result = tokio::time::timeout(
            Duration::from_secs(3),
            nodes[0].compute().execute_task_with(task, RunOptions::default().atomic()),
        )
        .await
        .expect("atomic task must not block")
        .unwrap();

        // ASSERT
        assert_eq!(result.state, TaskState::Completed);
        let storage = cluster.storage();
        let docs = storage.map::<String>("docs").unwrap();
        assert_eq!(docs.get("doc-1").unwrap(), Some("nested".to_string()));
        assert_eq!(docs.get("doc-2").unwrap(), Some("spawned".to_string()));
        assert_eq!(storage.map::<u64>("audit").unwrap().get("imports").unwrap(), Some(1));

        let size = storage
            .run_in_transaction(|tx| Ok(tx.map::<String>("docs")?.size()?))
            .unwrap();
        assert_eq!(size, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_run_registered_task_kind() {
        let (cluster, nodes) = start_grid(fast_config(), 2).await;
        let runs = Arc::new(AtomicUsize::new(0));
        {
            let runs = runs.clone();
            cluster
                .registry()
                .register("count", move |task_id| counting_task(task_id, runs.clone()).into_task());
        }

        let handles: Vec<_> = nodes
            .iter()
            .map(|node| {
                let compute = node.compute().clone();
                tokio::spawn(async move { compute.run_task("count", "count-1", RunOptions::default()).await })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().state, TaskState::Completed);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        let unknown = nodes[0].compute().run_task("nope", "x", RunOptions::default()).await;
        assert!(matches!(unknown, Err(GridError::UnknownTask(kind)) if kind == "nope"));
    }

    #[tokio::test]
    async fn test_coordinator_moves_on_disconnect() {
        let (_cluster, nodes) = start_grid(fast_config(), 3).await;
        assert!(nodes[0].is_coordinator());
        assert!(!nodes[1].is_coordinator());

        nodes[0].disconnect();

        assert!(nodes[1].is_coordinator());
        assert_eq!(nodes[2].grid().grid_members().len(), 2);
    }

    // ============================================================
    // TASK STORE TESTS
    // ============================================================

    #[test]
    fn test_progress_of_task_ids_with_colons_stays_apart() {
        // ARRANGE: "crawl" + "sub:node-1" and "crawl:sub" + "node-1"
        let storage = GridStorage::in_memory();
        let store = TaskStore::open(&storage).unwrap();
        let plain_node = NodeAddress::new("node-1");
        let colon_node = NodeAddress::new("sub:node-1");

        // ACT
        store
            .save_node_progress("crawl", &colon_node, &TaskProgress::new(Some(TaskExecutionResult::running()), 1))
            .unwrap();
        store
            .save_node_progress(
                "crawl:sub",
                &plain_node,
                &TaskProgress::new(Some(TaskExecutionResult::completed(None)), 2),
            )
            .unwrap();

        // ASSERT
        let crawl = store.node_progresses("crawl").unwrap();
        assert_eq!(crawl.len(), 1);
        assert_eq!(crawl[0].0, colon_node);
        assert_eq!(crawl[0].1.state(), Some(TaskState::Running));

        let sub = store.node_progresses("crawl:sub").unwrap();
        assert_eq!(sub.len(), 1);
        assert_eq!(sub[0].0, plain_node);
        assert_eq!(sub[0].1.state(), Some(TaskState::Completed));

        assert!(store.remove_node_progress("crawl", &colon_node).unwrap());
        assert!(store.node_progresses("crawl").unwrap().is_empty());
        assert_eq!(store.node_progresses("crawl:sub").unwrap().len(), 1);
    }

    // ============================================================
    // PROTOCOL & REGISTRY TESTS
    // ============================================================

    #[test]
    fn test_start_request_travels_as_json() {
        let registry = TaskRegistry::new();
        registry.register("count", |task_id| counting_task(task_id, Arc::new(AtomicUsize::new(0))).into_task());
        let task = registry.create("count", "count-7").unwrap();
        let request = WorkerRequest::StartTask {
            task: TaskRef::of(task.as_ref()),
            options: RunOptions::default().atomic(),
        };

        let encoded = serde_json::to_string(&request).unwrap();
        let decoded: WorkerRequest = serde_json::from_str(&encoded).unwrap();

        match decoded {
            WorkerRequest::StartTask { task, options } => {
                assert_eq!(
                    task,
                    TaskRef {
                        task_id: "count-7".to_string(),
                        kind: Some("count".to_string()),
                    }
                );
                assert_eq!(options, RunOptions::default().atomic());
                assert_eq!(registry.resolve(&task).unwrap().id(), "count-7");
            }
            other => panic!("expected a start request, got {:?}", other),
        }
    }

    #[test]
    fn test_registry_resolves_only_published_ad_hoc_tasks() {
        // ARRANGE
        let registry = TaskRegistry::new();
        registry.register("count", |task_id| counting_task(task_id, Arc::new(AtomicUsize::new(0))).into_task());
        let ad_hoc = counting_task("ad-hoc", Arc::new(AtomicUsize::new(0))).into_task();
        let reference = TaskRef::of(ad_hoc.as_ref());
        assert_eq!(reference.kind, None);

        // ACT & ASSERT: unknown until published
        assert!(matches!(registry.resolve(&reference), Err(GridError::UnknownTask(_))));
        registry.publish(&ad_hoc);
        let resolved = registry.resolve(&reference).unwrap();
        assert_eq!(resolved.id(), "ad-hoc");
        assert_eq!(resolved.kind(), None);

        // ACT & ASSERT: kinds are rebuilt, never published
        let built = registry.create("count", "count-1").unwrap();
        registry.publish(&built);
        assert!(matches!(
            registry.resolve(&TaskRef {
                task_id: "count-1".to_string(),
                kind: None,
            }),
            Err(GridError::UnknownTask(_))
        ));
        assert_eq!(registry.list_kinds(), vec!["count".to_string()]);
    }

    // ============================================================
    // PIPELINE TESTS
    // ============================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pipeline_runs_stages_in_order() {
        // ARRANGE
        let (_cluster, nodes) = start_grid(fast_config(), 3).await;
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = GridPipeline::new("crawl")
            .stage(PipelineStage::new(recording_task("prepare", log.clone(), 1)))
            .stage(PipelineStage::new(recording_task("crawl", log.clone(), 2)))
            .stage(PipelineStage::new(recording_task("commit", log.clone(), 3)));

        // ACT
        let handles: Vec<_> = nodes
            .iter()
            .map(|node| {
                let compute = node.compute().clone();
                let pipeline = pipeline.clone();
                tokio::spawn(async move { compute.execute_pipeline(&pipeline).await })
            })
            .collect();
        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap().unwrap());
        }

        // ASSERT
        assert_eq!(*log.lock().unwrap(), vec!["prepare", "crawl", "commit"]);
        let expected = Some(TaskExecutionResult::completed(Some(json!(3))));
        assert!(results.iter().all(|r| *r == expected));
        assert_eq!(nodes[1].compute().active_stage_index("crawl").unwrap(), -1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pipeline_failure_skips_all_but_always_stages() {
        let (_cluster, nodes) = start_grid(fast_config(), 1).await;
        let log = Arc::new(Mutex::new(Vec::new()));
        let failing = FnTask::new("crawl", |_ctx| async { anyhow::bail!("seed unreachable") })
            .single_node()
            .into_task();
        let pipeline = GridPipeline::new("failing")
            .stage(PipelineStage::new(recording_task("prepare", log.clone(), 1)))
            .stage(PipelineStage::new(failing))
            .stage(PipelineStage::new(recording_task("commit", log.clone(), 3)))
            .stage(PipelineStage::new(recording_task("cleanup", log.clone(), 4)).always());

        let result = nodes[0].compute().execute_pipeline(&pipeline).await.unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["prepare", "cleanup"]);
        assert_eq!(result, Some(TaskExecutionResult::completed(Some(json!(4)))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pipeline_stage_uses_previous_result() {
        let (_cluster, nodes) = start_grid(fast_config(), 1).await;
        let log = Arc::new(Mutex::new(Vec::new()));
        let doubling = {
            let log = log.clone();
            PipelineStage::from_fn(move |previous| {
                let value = previous?.result.as_ref()?.as_i64()?;
                Some(recording_task("double", log.clone(), value * 2))
            })
        };
        let skipped = PipelineStage::from_fn(|_| None);
        let pipeline = GridPipeline::new("chained")
            .stage(PipelineStage::new(recording_task("seed", log.clone(), 21)))
            .stage(doubling)
            .stage(skipped);

        let result = nodes[0].compute().execute_pipeline(&pipeline).await.unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["seed", "double"]);
        assert_eq!(result, Some(TaskExecutionResult::completed(Some(json!(42)))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pipeline_resumes_from_active_stage() {
        // ARRANGE: a previous coordinator got to stage index 2
        let (cluster, nodes) = start_grid(fast_config(), 1).await;
        cluster
            .storage()
            .map::<i64>(PIPELINE_ACTIVE_STAGE_STORE)
            .unwrap()
            .put("resumed", &2)
            .unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = GridPipeline::new("resumed")
            .stage(PipelineStage::new(recording_task("a", log.clone(), 1)))
            .stage(PipelineStage::new(recording_task("b", log.clone(), 2)).always())
            .stage(PipelineStage::new(recording_task("c", log.clone(), 3)))
            .stage(PipelineStage::new(recording_task("d", log.clone(), 4)));

        // ACT
        nodes[0].compute().execute_pipeline(&pipeline).await.unwrap();

        // ASSERT: "a" already ran, "b" is always run
        assert_eq!(*log.lock().unwrap(), vec!["b", "c", "d"]);
        assert_eq!(nodes[0].compute().active_stage_index("resumed").unwrap(), -1);

        // ACT: a completed pipeline starts over
        log.lock().unwrap().clear();
        nodes[0].compute().execute_pipeline(&pipeline).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c", "d"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pipeline_stop_runs_only_always_stages() {
        let (_cluster, nodes) = start_grid(fast_config(), 2).await;
        let log = Arc::new(Mutex::new(Vec::new()));
        let waiting = FnTask::new("crawl", |ctx| async move {
            ctx.stopped().await;
            Ok(None)
        })
        .single_node()
        .into_task();
        let pipeline = GridPipeline::new("stoppable")
            .stage(PipelineStage::new(waiting))
            .stage(PipelineStage::new(recording_task("commit", log.clone(), 2)))
            .stage(PipelineStage::new(recording_task("cleanup", log.clone(), 3)).always());

        let running = {
            let compute = nodes[0].compute().clone();
            tokio::spawn(async move { compute.execute_pipeline(&pipeline).await })
        };
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(nodes[1].compute().active_stage_index("stoppable").unwrap(), 0);
        nodes[1].compute().stop_pipeline("stoppable").await.unwrap();
        let result = running.await.unwrap().unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["cleanup"]);
        assert_eq!(result, Some(TaskExecutionResult::completed(Some(json!(3)))));
    }

    #[tokio::test]
    async fn test_empty_pipeline_is_rejected() {
        let (_cluster, nodes) = start_grid(fast_config(), 1).await;

        let result = nodes[0].compute().execute_pipeline(&GridPipeline::new("empty")).await;

        assert!(matches!(result, Err(GridError::InvalidPipeline(_))));
    }

    #[tokio::test]
    async fn test_unreachable_coordinator_rejects_pipeline_stop() {
        let (cluster, nodes) = start_grid(fast_config(), 2).await;
        cluster.crash(&NodeAddress::new("node-1"));

        let result = nodes[1].compute().stop_pipeline("any").await;

        assert!(matches!(result, Err(GridError::Transport(_))));
    }
}
