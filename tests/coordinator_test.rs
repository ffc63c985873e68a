//! End-to-end workload scenarios driven through a scripted substrate.
//!
//! Each test encodes one handler behavior as a script keyed off the
//! invocation event (pid, seqno, last call result) and checks the workload's
//! observable outcome: the main process result, the invocation trace, or the
//! fatal error.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::json;

use belay::test_support::{call, request, ScriptedResponse, ScriptedSubstrate};
use belay::{HandlerSet, ObjectStore, Pid, Qid, Seqno, Workload};

fn scripted_workload(substrate: Arc<ScriptedSubstrate>) -> (Arc<Workload>, tempfile::TempDir) {
    let store_dir = tempfile::tempdir().expect("tempdir");
    let workload = Workload::new(
        HandlerSet::single(substrate),
        ObjectStore::new(store_dir.path()),
        Duration::from_millis(200),
    );
    (workload, store_dir)
}

// =============================================================================
// Straight-line execution
// =============================================================================

#[tokio::test]
async fn test_factorial_checkpoints_then_exit() -> Result<()> {
    // The handler checkpoints five times, then exits with the result.
    let substrate = Arc::new(ScriptedSubstrate::new("factorial", |event, _n| {
        let seqno = event.seqno;
        if seqno.0 < 5 {
            ScriptedResponse::Reply(request(
                event.pid,
                seqno,
                &format!("chk-{seqno}"),
                vec![call(seqno, "checkpoint", json!({}))],
            ))
        } else {
            ScriptedResponse::Reply(request(
                event.pid,
                seqno,
                "chk-final",
                vec![call(seqno, "exit", json!({"result": "120"}))],
            ))
        }
    }));
    let (workload, _store) = scripted_workload(Arc::clone(&substrate));

    let ret = workload.run(json!({"n": 5})).await?;
    assert_eq!(ret, "120");

    // One invocation per checkpoint plus the exiting one, each resuming from
    // the checkpoint the previous one established.
    let invocations = substrate.invocations();
    assert_eq!(invocations.len(), 6);
    assert_eq!(invocations[0].pid, Pid(0));
    assert_eq!(invocations[0].chk_id, "");
    assert_eq!(invocations[0].app_event, json!({"n": 5}));
    assert_eq!(invocations[3].chk_id, "chk-2");
    assert_eq!(invocations[3].seqno, Seqno(3));
    Ok(())
}

// =============================================================================
// Crash and timeout handling
// =============================================================================

#[tokio::test]
async fn test_crash_then_recover() -> Result<()> {
    let substrate = Arc::new(ScriptedSubstrate::new("crashy", |event, n| {
        if n == 0 {
            ScriptedResponse::Crash("transient handler failure".into())
        } else {
            ScriptedResponse::Reply(request(
                event.pid,
                event.seqno,
                "",
                vec![call(event.seqno, "exit", json!({"result": "fine"}))],
            ))
        }
    }));
    let (workload, _store) = scripted_workload(Arc::clone(&substrate));

    let ret = workload.run(json!(null)).await?;
    assert_eq!(ret, "fine");
    assert_eq!(substrate.invocations().len(), 2);
    // The retry restarted from unchanged run-state.
    assert_eq!(substrate.invocations()[1].seqno, Seqno(0));
    Ok(())
}

#[tokio::test]
async fn test_crash_exhaustion_is_fatal() -> Result<()> {
    let substrate = Arc::new(ScriptedSubstrate::new("doomed", |_event, _n| {
        ScriptedResponse::Crash("kaput".into())
    }));
    let (workload, _store) = scripted_workload(Arc::clone(&substrate));

    let err = workload.run(json!(null)).await.expect_err("must fail");
    let message = err.to_string();
    assert!(message.contains("FATAL"), "got: {message}");
    assert!(message.contains("kaput"), "got: {message}");
    assert!(message.contains("main-0"), "got: {message}");

    // Initial attempt plus three retries.
    assert_eq!(substrate.invocations().len(), 4);
    Ok(())
}

#[tokio::test]
async fn test_timeout_restarts_and_resets_crash_counter() -> Result<()> {
    // crash, timeout, crash, crash, crash, exit: the timeout clears the
    // counter, so the workload survives.
    let substrate = Arc::new(ScriptedSubstrate::new("flaky", |event, n| match n {
        0 | 2 | 3 | 4 => ScriptedResponse::Crash(format!("crash #{n}")),
        1 => ScriptedResponse::Timeout,
        _ => ScriptedResponse::Reply(request(
            event.pid,
            event.seqno,
            "",
            vec![call(event.seqno, "exit", json!({"result": "survived"}))],
        )),
    }));
    let (workload, _store) = scripted_workload(Arc::clone(&substrate));

    let ret = workload.run(json!(null)).await?;
    assert_eq!(ret, "survived");
    assert_eq!(substrate.invocations().len(), 6);
    Ok(())
}

#[tokio::test]
async fn test_successful_request_resets_crash_counter() -> Result<()> {
    // Two crashes, a checkpoint, then three more crashes: without the reset
    // the fifth crash would be fatal.
    let substrate = Arc::new(ScriptedSubstrate::new("wobbly", |event, n| match n {
        0 | 1 | 3 | 4 | 5 => ScriptedResponse::Crash(format!("crash #{n}")),
        2 => ScriptedResponse::Reply(request(
            event.pid,
            event.seqno,
            "chk-ok",
            vec![call(event.seqno, "checkpoint", json!({}))],
        )),
        _ => ScriptedResponse::Reply(request(
            event.pid,
            event.seqno,
            "",
            vec![call(event.seqno, "exit", json!({"result": "survived"}))],
        )),
    }));
    let (workload, _store) = scripted_workload(Arc::clone(&substrate));

    let ret = workload.run(json!(null)).await?;
    assert_eq!(ret, "survived");
    assert_eq!(substrate.invocations().len(), 7);
    Ok(())
}

#[tokio::test]
async fn test_unclassified_failure_is_fatal_immediately() -> Result<()> {
    let substrate = Arc::new(ScriptedSubstrate::new("broken", |_event, _n| {
        ScriptedResponse::Fail("substrate infrastructure failure".into())
    }));
    let (workload, _store) = scripted_workload(Arc::clone(&substrate));

    let err = workload.run(json!(null)).await.expect_err("must fail");
    assert!(err.to_string().contains("substrate infrastructure failure"));
    assert_eq!(substrate.invocations().len(), 1);
    Ok(())
}

// =============================================================================
// Spawn and wait
// =============================================================================

#[tokio::test]
async fn test_blocking_spawn_gathers_child_results() -> Result<()> {
    let substrate = Arc::new(ScriptedSubstrate::new("spawner", |event, _n| {
        match (event.pid.0, event.seqno.0) {
            (0, 0) => ScriptedResponse::Reply(request(
                event.pid,
                event.seqno,
                "chk-spawn",
                vec![call(
                    event.seqno,
                    "spawn",
                    json!({
                        "name": "child", "child_chk_id": "chk-child",
                        "future_pids": [], "await_pids": [],
                        "blocking": true, "copies": 2, "on_coordinator": true
                    }),
                )],
            )),
            (0, 1) => {
                assert_eq!(event.coord_call_result, json!({"rets": ["a", "b"]}));
                ScriptedResponse::Reply(request(
                    event.pid,
                    event.seqno,
                    "",
                    vec![call(event.seqno, "exit", json!({"result": "main-done"}))],
                ))
            }
            (1, 0) | (2, 0) => {
                // Children resume from the spawn checkpoint with no pending
                // results.
                assert_eq!(event.chk_id, "chk-child");
                assert_eq!(event.coord_call_result, json!({}));
                let result = if event.pid.0 == 1 { "a" } else { "b" };
                ScriptedResponse::Reply(request(
                    event.pid,
                    event.seqno,
                    "",
                    vec![call(event.seqno, "exit", json!({"result": result}))],
                ))
            }
            other => panic!("unexpected invocation: {other:?}"),
        }
    }));
    let (workload, _store) = scripted_workload(Arc::clone(&substrate));

    let ret = workload.run(json!(null)).await?;
    assert_eq!(ret, "main-done");
    Ok(())
}

#[tokio::test]
async fn test_spawn_future_pids_deliver_predecessor_results() -> Result<()> {
    // Main spawns A, then spawns B blocking with future_pids=[A]; B must
    // start only after A finished, with A's result in hand.
    let substrate = Arc::new(ScriptedSubstrate::new("deps", |event, _n| {
        match (event.pid.0, event.seqno.0) {
            (0, 0) => ScriptedResponse::Reply(request(
                event.pid,
                event.seqno,
                "",
                vec![call(
                    event.seqno,
                    "spawn",
                    json!({
                        "name": "a", "child_chk_id": "chk-a",
                        "future_pids": [], "await_pids": [],
                        "blocking": false, "copies": 1, "on_coordinator": true
                    }),
                )],
            )),
            (0, 1) => {
                assert_eq!(event.coord_call_result, json!({"child_pids": [1]}));
                ScriptedResponse::Reply(request(
                    event.pid,
                    event.seqno,
                    "",
                    vec![call(
                        event.seqno,
                        "spawn",
                        json!({
                            "name": "b", "child_chk_id": "chk-b",
                            "future_pids": [1], "await_pids": [],
                            "blocking": true, "copies": 1, "on_coordinator": true
                        }),
                    )],
                ))
            }
            (0, 2) => {
                assert_eq!(event.coord_call_result, json!({"rets": ["ret-b"]}));
                ScriptedResponse::Reply(request(
                    event.pid,
                    event.seqno,
                    "",
                    vec![call(event.seqno, "exit", json!({"result": "done"}))],
                ))
            }
            (1, 0) => ScriptedResponse::Reply(request(
                event.pid,
                event.seqno,
                "",
                vec![call(event.seqno, "exit", json!({"result": "ret-a"}))],
            )),
            (2, 0) => {
                assert_eq!(event.coord_call_result, json!({"1": "ret-a"}));
                ScriptedResponse::Reply(request(
                    event.pid,
                    event.seqno,
                    "",
                    vec![call(event.seqno, "exit", json!({"result": "ret-b"}))],
                ))
            }
            other => panic!("unexpected invocation: {other:?}"),
        }
    }));
    let (workload, _store) = scripted_workload(Arc::clone(&substrate));

    let ret = workload.run(json!(null)).await?;
    assert_eq!(ret, "done");
    Ok(())
}

#[tokio::test]
async fn test_map_spawn_fans_out_elements() -> Result<()> {
    let substrate = Arc::new(ScriptedSubstrate::new("mapper", |event, _n| {
        match (event.pid.0, event.seqno.0) {
            (0, 0) => ScriptedResponse::Reply(request(
                event.pid,
                event.seqno,
                "",
                vec![call(
                    event.seqno,
                    "map_spawn",
                    json!({
                        "name": "worker", "child_chk_id": "chk-map",
                        "future_pids": [], "elems": ["x", "y"], "await_pids": [],
                        "on_coordinator": true
                    }),
                )],
            )),
            (0, 1) => {
                // map_spawn returns the children immediately.
                assert_eq!(event.coord_call_result, json!([1, 2]));
                ScriptedResponse::Reply(request(
                    event.pid,
                    event.seqno,
                    "",
                    vec![call(event.seqno, "wait", json!({"pid": 2}))],
                ))
            }
            (0, 2) => {
                assert_eq!(event.coord_call_result, json!("got-y"));
                ScriptedResponse::Reply(request(
                    event.pid,
                    event.seqno,
                    "",
                    vec![call(event.seqno, "exit", json!({"result": "done"}))],
                ))
            }
            (1 | 2, 0) => {
                // Each child gets [predecessor results, its element].
                let elem = event.coord_call_result[1]
                    .as_str()
                    .expect("element")
                    .to_string();
                assert_eq!(event.coord_call_result[0], json!({}));
                ScriptedResponse::Reply(request(
                    event.pid,
                    event.seqno,
                    "",
                    vec![call(event.seqno, "exit", json!({"result": format!("got-{elem}")}))],
                ))
            }
            other => panic!("unexpected invocation: {other:?}"),
        }
    }));
    let (workload, _store) = scripted_workload(Arc::clone(&substrate));

    let ret = workload.run(json!(null)).await?;
    assert_eq!(ret, "done");
    Ok(())
}

// =============================================================================
// Queue hand-off
// =============================================================================

#[tokio::test]
async fn test_queue_hand_off_between_processes() -> Result<()> {
    // Producer enqueues "x", "y", then an end marker; the consumer counts
    // strings until the marker and exits with the count. The capacity-1
    // queue forces the producer to block between items.
    let spawn_params = |name: &str| {
        json!({
            "name": name, "child_chk_id": "",
            "future_pids": [], "await_pids": [],
            "blocking": false, "copies": 1, "on_coordinator": true
        })
    };
    let substrate = Arc::new(ScriptedSubstrate::new("pipeline", move |event, _n| {
        match (event.pid.0, event.seqno.0) {
            (0, 0) => ScriptedResponse::Reply(request(
                event.pid,
                event.seqno,
                "",
                vec![call(
                    event.seqno,
                    "create_queue",
                    json!({"max_size": 1, "copies": -1}),
                )],
            )),
            (0, 1) => {
                assert_eq!(event.coord_call_result, json!(0));
                ScriptedResponse::Reply(request(
                    event.pid,
                    event.seqno,
                    "",
                    vec![call(event.seqno, "spawn", spawn_params("producer"))],
                ))
            }
            (0, 2) => ScriptedResponse::Reply(request(
                event.pid,
                event.seqno,
                "",
                vec![call(event.seqno, "spawn", spawn_params("consumer"))],
            )),
            (0, 3) => ScriptedResponse::Reply(request(
                event.pid,
                event.seqno,
                "",
                vec![call(event.seqno, "wait", json!({"pid": 2}))],
            )),
            (0, 4) => {
                let count = event.coord_call_result.as_str().expect("count").to_string();
                ScriptedResponse::Reply(request(
                    event.pid,
                    event.seqno,
                    "",
                    vec![call(event.seqno, "exit", json!({"result": count}))],
                ))
            }
            // Producer.
            (1, 0) => ScriptedResponse::Reply(request(
                event.pid,
                event.seqno,
                "",
                vec![call(
                    event.seqno,
                    "enqueue",
                    json!({"qid": 0, "objs": ["x", "y", "END"]}),
                )],
            )),
            (1, 1) => ScriptedResponse::Reply(request(
                event.pid,
                event.seqno,
                "",
                vec![call(event.seqno, "exit", json!({"result": "produced"}))],
            )),
            // Consumer: dequeue until the end marker, then exit with the
            // count of strings seen before it.
            (2, 0) => ScriptedResponse::Reply(request(
                event.pid,
                event.seqno,
                "",
                vec![call(event.seqno, "dequeue", json!({"qid": 0}))],
            )),
            (2, s) => {
                if event.coord_call_result == json!("END") {
                    ScriptedResponse::Reply(request(
                        event.pid,
                        event.seqno,
                        "",
                        vec![call(
                            event.seqno,
                            "exit",
                            json!({"result": (s - 1).to_string()}),
                        )],
                    ))
                } else {
                    ScriptedResponse::Reply(request(
                        event.pid,
                        event.seqno,
                        "",
                        vec![call(event.seqno, "dequeue", json!({"qid": 0}))],
                    ))
                }
            }
            other => panic!("unexpected invocation: {other:?}"),
        }
    }));
    let (workload, _store) = scripted_workload(Arc::clone(&substrate));

    let ret = workload.run(json!(null)).await?;
    assert_eq!(ret, "2");
    Ok(())
}

// =============================================================================
// Store remapping
// =============================================================================

#[tokio::test]
async fn test_remap_store_moves_object() -> Result<()> {
    let substrate = Arc::new(ScriptedSubstrate::new("storer", |event, _n| {
        match event.seqno.0 {
            0 => ScriptedResponse::Reply(request(
                event.pid,
                event.seqno,
                "",
                vec![call(
                    event.seqno,
                    "remap_store",
                    json!({
                        "tmp_bucket": "tmp", "tmp_key": "obj",
                        "bucket": "final", "key": "obj"
                    }),
                )],
            )),
            _ => ScriptedResponse::Reply(request(
                event.pid,
                event.seqno,
                "",
                vec![call(event.seqno, "exit", json!({"result": "ok"}))],
            )),
        }
    }));
    let (workload, store_dir) = scripted_workload(Arc::clone(&substrate));

    std::fs::create_dir_all(store_dir.path().join("tmp"))?;
    std::fs::write(store_dir.path().join("tmp").join("obj"), b"blob")?;

    let ret = workload.run(json!(null)).await?;
    assert_eq!(ret, "ok");
    assert_eq!(
        std::fs::read(store_dir.path().join("final").join("obj"))?,
        b"blob"
    );
    assert!(!store_dir.path().join("tmp").join("obj").exists());
    Ok(())
}

// =============================================================================
// Protocol violations are fatal
// =============================================================================

#[tokio::test]
async fn test_unknown_op_is_fatal() -> Result<()> {
    let substrate = Arc::new(ScriptedSubstrate::new("bogus", |event, _n| {
        ScriptedResponse::Reply(request(
            event.pid,
            event.seqno,
            "",
            vec![call(event.seqno, "frobnicate", json!({}))],
        ))
    }));
    let (workload, _store) = scripted_workload(substrate);

    let err = workload.run(json!(null)).await.expect_err("must fail");
    assert!(err.to_string().contains("unrecognized coordinator call"));
    Ok(())
}

#[tokio::test]
async fn test_wait_on_unknown_pid_is_fatal() -> Result<()> {
    let substrate = Arc::new(ScriptedSubstrate::new("lost", |event, _n| {
        ScriptedResponse::Reply(request(
            event.pid,
            event.seqno,
            "",
            vec![call(event.seqno, "wait", json!({"pid": 99}))],
        ))
    }));
    let (workload, _store) = scripted_workload(substrate);

    let err = workload.run(json!(null)).await.expect_err("must fail");
    assert!(err.to_string().contains("no process exists with pid 99"));
    Ok(())
}

#[tokio::test]
async fn test_dequeue_unknown_qid_is_fatal() -> Result<()> {
    let substrate = Arc::new(ScriptedSubstrate::new("stray", |event, _n| {
        ScriptedResponse::Reply(request(
            event.pid,
            event.seqno,
            "",
            vec![call(event.seqno, "dequeue", json!({"qid": 5}))],
        ))
    }));
    let (workload, _store) = scripted_workload(substrate);

    let err = workload.run(json!(null)).await.expect_err("must fail");
    assert!(err.to_string().contains("no queue exists with qid 5"));
    Ok(())
}

#[tokio::test]
async fn test_queue_ids_stay_monotone_across_creates() -> Result<()> {
    let substrate = Arc::new(ScriptedSubstrate::new("qids", |event, _n| {
        match event.seqno.0 {
            0 => ScriptedResponse::Reply(request(
                event.pid,
                event.seqno,
                "",
                vec![call(
                    event.seqno,
                    "create_queue",
                    json!({"max_size": 4, "copies": 2}),
                )],
            )),
            1 => {
                assert_eq!(event.coord_call_result, json!([0, 1]));
                ScriptedResponse::Reply(request(
                    event.pid,
                    event.seqno,
                    "",
                    vec![call(
                        event.seqno,
                        "create_queue",
                        json!({"max_size": 4, "copies": -1}),
                    )],
                ))
            }
            _ => {
                assert_eq!(event.coord_call_result, json!(2));
                ScriptedResponse::Reply(request(
                    event.pid,
                    event.seqno,
                    "",
                    vec![call(event.seqno, "exit", json!({"result": "ok"}))],
                ))
            }
        }
    }));
    let (workload, _store) = scripted_workload(substrate);

    let ret = workload.run(json!(null)).await?;
    assert_eq!(ret, "ok");
    assert!(workload.queue(Qid(2)).is_some());
    assert!(workload.queue(Qid(3)).is_none());
    Ok(())
}
