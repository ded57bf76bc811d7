//! End-to-end pool tests against the stub evaluator binary.

use std::sync::Arc;
use std::time::{Duration, Instant};

use evalpool::pool::spawn_pool;
use evalpool::supervisor::WorkerSupervisor;
use evalpool::worker::WorkerConfig;
use evalpool::{Error, EvalOutcome, EvalStatus, ExitCause, MemLimit, PoolClient};

fn stub_config(init: Vec<String>) -> WorkerConfig {
    WorkerConfig {
        program: env!("CARGO_BIN_EXE_stub_eval").into(),
        args: Vec::new(),
        init,
    }
}

fn start_pool(workers: usize, default_max_mem_kib: Option<u64>) -> (PoolClient, Arc<WorkerSupervisor>) {
    let supervisor = Arc::new(WorkerSupervisor::start(stub_config(Vec::new()), workers));
    let client = spawn_pool(supervisor.clone(), default_max_mem_kib);
    (client, supervisor)
}

fn assert_ok_value(outcome: &EvalOutcome, expected: serde_json::Value) {
    match outcome {
        EvalOutcome::Ok { return_value, .. } => assert_eq!(*return_value, expected),
        other => panic!("expected ok outcome, got {other:?}"),
    }
}

#[tokio::test]
async fn eval_returns_output_value_and_status() {
    let (client, _supervisor) = start_pool(2, None);

    let outcome = client.eval("echo 'hi'; return 42;").await.unwrap();
    match outcome {
        EvalOutcome::Ok {
            output,
            return_value,
            last_error,
            status,
        } => {
            assert_eq!(output, b"hi\n".to_vec());
            assert_eq!(return_value, serde_json::json!(42));
            assert_eq!(last_error, "");
            assert_eq!(status, EvalStatus::Continue);
        }
        other => panic!("expected ok outcome, got {other:?}"),
    }
}

#[tokio::test]
async fn bad_syntax_is_a_parse_error() {
    let (client, _supervisor) = start_pool(1, None);

    let outcome = client.eval("syntax ][").await.unwrap();
    match outcome {
        EvalOutcome::ParseError { message, status } => {
            assert!(!message.is_empty());
            assert_eq!(status, EvalStatus::Break);
        }
        other => panic!("expected parse error, got {other:?}"),
    }
}

#[tokio::test]
async fn last_error_text_is_reported() {
    let (client, _supervisor) = start_pool(1, None);

    let outcome = client.eval("error 'boom'; return 1;").await.unwrap();
    match outcome {
        EvalOutcome::Ok { last_error, .. } => assert_eq!(last_error, "boom"),
        other => panic!("expected ok outcome, got {other:?}"),
    }
}

#[tokio::test]
async fn call_quotes_arguments_for_the_evaluator() {
    let (client, _supervisor) = start_pool(1, None);

    // The stub has no functions; exercise the same quoting through echo.
    let outcome = client.eval(r"echo 'it\'s'; return 'a\\b';").await.unwrap();
    match outcome {
        EvalOutcome::Ok {
            output,
            return_value,
            ..
        } => {
            assert_eq!(output, b"it's\n".to_vec());
            assert_eq!(return_value, serde_json::json!(r"a\b"));
        }
        other => panic!("expected ok outcome, got {other:?}"),
    }
}

/// S1: with every worker reserved, a third `reserve` queues and is served by
/// the worker freed by `release` - observably the same subprocess.
#[tokio::test]
async fn reserve_blocks_until_release_and_reuses_the_freed_worker() {
    let (client, _supervisor) = start_pool(2, None);

    let t1 = client.reserve().await.unwrap();
    let t2 = client.reserve().await.unwrap();

    client
        .eval_with("set marker one", Some(t1), None)
        .await
        .unwrap();

    let waiter = {
        let client = client.clone();
        tokio::spawn(async move { client.reserve().await.unwrap() })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!waiter.is_finished(), "third reserve should be queued");

    client.release(t1).await.unwrap();
    let t3 = waiter.await.unwrap();

    // The freed worker still carries t1's state, so t3 sees the marker.
    let outcome = client.eval_with("get marker", Some(t3), None).await.unwrap();
    assert_ok_value(&outcome, serde_json::json!("one"));

    client.release(t2).await.unwrap();
    client.release(t3).await.unwrap();
}

#[tokio::test]
async fn reservations_pin_distinct_workers() {
    let (client, _supervisor) = start_pool(2, None);

    let t1 = client.reserve().await.unwrap();
    let t2 = client.reserve().await.unwrap();

    client
        .eval_with("set who first", Some(t1), None)
        .await
        .unwrap();
    let outcome = client.eval_with("get who", Some(t2), None).await.unwrap();
    assert_ok_value(&outcome, serde_json::Value::Null);
}

/// Property 3: a released token is dead for every operation.
#[tokio::test]
async fn released_token_is_invalid() {
    let (client, _supervisor) = start_pool(1, None);

    let token = client.reserve().await.unwrap();
    client.release(token).await.unwrap();

    assert!(matches!(
        client.eval_with("return 1;", Some(token), None).await,
        Err(Error::InvalidReservation)
    ));
    assert!(matches!(
        client.get_memory(token).await,
        Err(Error::InvalidReservation)
    ));
    assert!(matches!(
        client.release(token).await,
        Err(Error::InvalidReservation)
    ));
}

/// Property 2: waiters are served in enqueue order.
#[tokio::test]
async fn waiting_is_strict_fifo() {
    let (client, _supervisor) = start_pool(1, None);

    let held = client.reserve().await.unwrap();

    let first = {
        let client = client.clone();
        tokio::spawn(async move { client.reserve().await.unwrap() })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    let second = {
        let client = client.clone();
        tokio::spawn(async move { client.reserve().await.unwrap() })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    client.release(held).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(first.is_finished(), "head waiter should be served first");
    assert!(!second.is_finished(), "second waiter should still queue");

    let t_first = first.await.unwrap();
    client.release(t_first).await.unwrap();
    let t_second = second.await.unwrap();
    client.release(t_second).await.unwrap();
}

/// S4: a reservation with a tiny ceiling breaks on an allocating snippet and
/// the recycled worker comes back with fresh state and modest memory.
#[tokio::test]
async fn memory_overrun_recycles_the_worker() {
    let (client, _supervisor) = start_pool(1, None);

    let token = client.reserve_with(MemLimit::KiB(1)).await.unwrap();

    let outcome = client
        .eval_with("set big yes; alloc 8192", Some(token), None)
        .await
        .unwrap();
    assert_eq!(outcome.status(), Some(EvalStatus::Break));

    // State did not survive the recycling.
    let outcome = client.eval_with("get big", Some(token), None).await.unwrap();
    assert_ok_value(&outcome, serde_json::Value::Null);

    // Post-restart resident set is sane again (the 8 MiB ballast is gone).
    let rss = client.get_memory(token).await.unwrap();
    assert!(rss > 0);

    client.release(token).await.unwrap();
}

#[tokio::test]
async fn get_memory_reports_resident_kib() {
    let (client, _supervisor) = start_pool(1, None);

    let token = client.reserve().await.unwrap();
    let rss = client.get_memory(token).await.unwrap();
    assert!(rss > 0, "stub evaluator should have nonzero rss");
    client.release(token).await.unwrap();
}

/// Timeout: the subprocess is killed, the result is exit/timeout, and the
/// respawned worker has fresh state.
#[tokio::test]
async fn timeout_kills_and_respawns() {
    let (client, _supervisor) = start_pool(1, None);

    let token = client.reserve().await.unwrap();
    let outcome = client
        .eval_with(
            "set t x; sleep 5000",
            Some(token),
            Some(Duration::from_millis(300)),
        )
        .await
        .unwrap();
    assert_eq!(
        outcome,
        EvalOutcome::Exit {
            cause: ExitCause::Timeout
        }
    );

    let outcome = client.eval_with("get t", Some(token), None).await.unwrap();
    assert_ok_value(&outcome, serde_json::Value::Null);

    client.release(token).await.unwrap();
}

#[tokio::test]
async fn voluntary_exit_is_reported_and_worker_respawns() {
    let (client, _supervisor) = start_pool(1, None);

    let token = client.reserve().await.unwrap();
    let outcome = client.eval_with("exit 3", Some(token), None).await.unwrap();
    assert_eq!(
        outcome,
        EvalOutcome::Exit {
            cause: ExitCause::Code(3)
        }
    );

    let outcome = client
        .eval_with("return 7;", Some(token), None)
        .await
        .unwrap();
    assert_ok_value(&outcome, serde_json::json!(7));

    client.release(token).await.unwrap();
}

#[tokio::test]
async fn zero_timeout_is_rejected() {
    let (client, _supervisor) = start_pool(1, None);

    assert!(matches!(
        client
            .eval_with("return 1;", None, Some(Duration::ZERO))
            .await,
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        client.reserve_with(MemLimit::KiB(0)).await,
        Err(Error::InvalidArgument(_))
    ));
}

/// Property 6: N workers admit at most N concurrent evaluations; the N+1th
/// is strictly queued behind them.
#[tokio::test]
async fn transient_evals_queue_at_capacity() {
    let (client, _supervisor) = start_pool(2, None);

    // Warm the pool so spawn cost stays out of the measurement.
    client.eval("return 0;").await.unwrap();

    let started = Instant::now();
    let evals: Vec<_> = (0..3)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move { client.eval("sleep 500").await.unwrap() })
        })
        .collect();
    for handle in evals {
        let outcome = handle.await.unwrap();
        assert_eq!(outcome.status(), Some(EvalStatus::Continue));
    }
    let elapsed = started.elapsed();

    // Two run concurrently, the third waits for a release: >= 2 rounds.
    assert!(
        elapsed >= Duration::from_millis(900),
        "third eval was not queued: {elapsed:?}"
    );
}

/// S5: overlapping restart_all callers both complete, and only after the
/// reserved worker has been released and recycled.
#[tokio::test]
async fn restart_all_waits_for_reserved_workers() {
    let (client, _supervisor) = start_pool(2, None);

    let token = client.reserve().await.unwrap();
    client
        .eval_with("set k v", Some(token), None)
        .await
        .unwrap();

    let restart_a = {
        let client = client.clone();
        tokio::spawn(async move { client.restart_all().await.unwrap() })
    };
    let restart_b = {
        let client = client.clone();
        tokio::spawn(async move { client.restart_all().await.unwrap() })
    };

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!restart_a.is_finished(), "restart must wait for the reservation");
    assert!(!restart_b.is_finished(), "joined restart must wait too");

    client.release(token).await.unwrap();
    restart_a.await.unwrap();
    restart_b.await.unwrap();

    // Every worker was recycled, so the state is gone everywhere.
    let outcome = client.eval("get k").await.unwrap();
    assert_ok_value(&outcome, serde_json::Value::Null);
}

/// S6 + property 5: require takes effect after a rolling restart and stops
/// applying after unrequire's restart settles.
#[tokio::test]
async fn require_code_applies_after_restart_and_unrequire_removes_it() {
    let (client, _supervisor) = start_pool(1, None);

    let require = client.require_code("set flag on").await.unwrap();

    // Not yet effective: the running worker predates the require.
    let outcome = client.eval("get flag").await.unwrap();
    assert_ok_value(&outcome, serde_json::Value::Null);

    client.restart_all().await.unwrap();
    let outcome = client.eval("get flag").await.unwrap();
    assert_ok_value(&outcome, serde_json::json!("on"));

    // Unrequire acknowledges immediately; its rolling restart completes in
    // the background, so poll for the effect to disappear.
    client.unrequire_code(require).await.unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let outcome = client.eval("get flag").await.unwrap();
        if matches!(
            &outcome,
            EvalOutcome::Ok { return_value, .. } if return_value.is_null()
        ) {
            break;
        }
        assert!(Instant::now() < deadline, "unrequire restart never settled");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// restart_all before any reservation still recycles the already-running
/// workers (discovery happens at first use, whichever call that is).
#[tokio::test]
async fn restart_all_works_before_first_reserve() {
    let (client, _supervisor) = start_pool(2, None);

    let require = client.require_code("set boot yes").await.unwrap();
    client.restart_all().await.unwrap();

    let outcome = client.eval("get boot").await.unwrap();
    assert_ok_value(&outcome, serde_json::json!("yes"));

    client.unrequire_code(require).await.unwrap();
}

/// Property 1: reserve/release cycles conserve pool capacity.
#[tokio::test]
async fn pool_capacity_is_conserved() {
    let (client, _supervisor) = start_pool(2, None);

    for _ in 0..10 {
        let a = client.reserve().await.unwrap();
        let b = client.reserve().await.unwrap();
        client.release(a).await.unwrap();
        client.release(b).await.unwrap();
    }

    // Still exactly two workers: a third reserve queues.
    let a = client.reserve().await.unwrap();
    let b = client.reserve().await.unwrap();
    let waiter = {
        let client = client.clone();
        tokio::spawn(async move { client.reserve().await.unwrap() })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!waiter.is_finished());

    client.release(a).await.unwrap();
    let c = waiter.await.unwrap();
    client.release(b).await.unwrap();
    client.release(c).await.unwrap();
}

#[tokio::test]
async fn supervisor_enumerates_tagged_workers() {
    use evalpool::supervisor::{ChildKind, Supervisor, WORKER_TAG};

    let supervisor = WorkerSupervisor::start(stub_config(Vec::new()), 3);
    let children = supervisor.enumerate_children();
    assert_eq!(children.len(), 3);
    for child in &children {
        assert_eq!(child.kind, ChildKind::Worker);
        assert!(child.tags.iter().any(|tag| tag == WORKER_TAG));
        assert!(child.worker.is_some());
    }
    supervisor.shutdown().await;
}

#[tokio::test]
async fn shutdown_fails_outstanding_calls() {
    let (client, _supervisor) = start_pool(1, None);

    let token = client.reserve().await.unwrap();
    let waiter = {
        let client = client.clone();
        tokio::spawn(async move { client.reserve().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    client.shutdown();
    assert!(matches!(waiter.await.unwrap(), Err(Error::Shutdown)));
    assert!(matches!(client.release(token).await, Err(Error::Shutdown)));
}
