mod support;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use support::{FakeRunner, Script, fast_config, finding, wait_for_event, wait_for_job};
use warden_core::model::{
    Approvals, AuthorizationScope, DecisionReason, FailureReason, JobStatus,
    RiskLevel, Severity, ToolRunStatus,
};
use warden_core::orchestration::{
    InMemoryTaskQueue, RetryPolicy, TaskQueue, ToolTask,
};
use warden_core::persistence::{InMemoryScanRepository, ScanRepository};
use warden_core::{
    JobEventPayload, Orchestrator, OrchestratorConfig, OrchestratorError,
    SubmitRequest, ValidationError,
};

async fn started(config: OrchestratorConfig, runner: Arc<FakeRunner>) -> Orchestrator {
    let orchestrator = Orchestrator::builder(config)
        .with_runner(runner)
        .build()
        .expect("orchestrator should build");
    orchestrator.start().await.expect("start");
    orchestrator
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn deny_listed_target_fails_without_tool_runs() {
    let mut config = fast_config();
    config.policy.network.deny_list = vec!["10.0.0.0/8".into()];
    let runner = Arc::new(FakeRunner::new());
    let orchestrator = started(config, Arc::clone(&runner)).await;

    let job_id = orchestrator
        .submit_job("10.1.2.3", ["nmap"])
        .await
        .expect("submission is valid");

    let view = orchestrator.job_status(job_id).await.expect("status");
    assert_eq!(view.job.status, JobStatus::Failed);
    assert_eq!(
        view.job.failure.as_ref().map(FailureReason::code),
        Some("network_denied")
    );
    assert!(view.tool_runs.is_empty());
    assert_eq!(runner.calls("nmap"), 0);
    assert_eq!(orchestrator.concurrency_snapshot().global_jobs, 0);

    orchestrator.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn numeric_ipv4_spellings_cannot_slip_past_the_deny_list() {
    let mut config = fast_config();
    config.policy.network.deny_list = vec!["10.0.0.0/8".into()];
    let runner = Arc::new(FakeRunner::new());
    let orchestrator = started(config, Arc::clone(&runner)).await;

    for spelling in ["167772161", "012.1.2.3", "10.1", "0xa.1.2.3"] {
        let err = orchestrator
            .submit_job(spelling, ["nmap"])
            .await
            .expect_err("numeric spelling must not be accepted as a hostname");
        assert!(
            matches!(
                err,
                OrchestratorError::Validation(ValidationError::InvalidTarget(_))
            ),
            "{spelling}: {err}"
        );
    }

    // The dotted form with a trailing dot is still an address and is denied.
    let job_id = orchestrator
        .submit_job("10.1.2.3.", ["nmap"])
        .await
        .expect("submission is valid");
    let view = orchestrator.job_status(job_id).await.expect("status");
    assert_eq!(
        view.job.failure.as_ref().map(FailureReason::code),
        Some("network_denied")
    );
    assert_eq!(runner.calls("nmap"), 0);

    orchestrator.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn critical_tool_needs_explicit_approval() {
    let mut config = fast_config();
    config.policy.tools.risk_table =
        BTreeMap::from([("exploit-kit".to_string(), RiskLevel::Critical)]);
    let runner = Arc::new(FakeRunner::new());
    let orchestrator = started(config, Arc::clone(&runner)).await;
    let mut events = orchestrator.subscribe();

    let denied = orchestrator
        .submit_job("example.com", ["exploit-kit"])
        .await
        .expect("submit");
    assert_eq!(wait_for_job(&mut events, denied).await, Some(JobStatus::Failed));

    let view = orchestrator.job_status(denied).await.expect("status");
    assert_eq!(view.tool_runs.len(), 1);
    assert_eq!(view.tool_runs[0].status, ToolRunStatus::Failed);
    assert!(matches!(
        view.tool_runs[0].failure,
        Some(FailureReason::PolicyDenied {
            decision: DecisionReason::ToolDenied,
            ..
        })
    ));
    assert_eq!(
        view.job.failure.as_ref().map(FailureReason::code),
        Some("tool_denied")
    );
    assert_eq!(runner.calls("exploit-kit"), 0);

    let approved = orchestrator
        .submit(
            SubmitRequest::new("example.com", ["exploit-kit"])
                .with_approvals(Approvals::none().approve_tool("exploit-kit")),
        )
        .await
        .expect("submit");
    assert_eq!(
        wait_for_job(&mut events, approved).await,
        Some(JobStatus::Completed)
    );
    assert_eq!(runner.calls("exploit-kit"), 1);

    orchestrator.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn per_job_ceiling_is_never_exceeded() {
    let mut config = fast_config();
    config.policy.concurrency.max_tools_per_job = 2;
    let runner = Arc::new(
        FakeRunner::new()
            .script("a", Script::Slow(Duration::from_millis(100)))
            .script("b", Script::Slow(Duration::from_millis(100)))
            .script("c", Script::Slow(Duration::from_millis(100))),
    );
    let orchestrator = started(config, Arc::clone(&runner)).await;
    let mut events = orchestrator.subscribe();

    let job_id = orchestrator
        .submit_job("example.com", ["a", "b", "c"])
        .await
        .expect("submit");

    // Start and finish events for this job, in arrival order.
    let mut order = Vec::new();
    let finished = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = events.recv().await.expect("event");
            if event.job_id != job_id {
                continue;
            }
            match event.payload {
                JobEventPayload::ToolRunStarted { .. } => order.push("started"),
                JobEventPayload::ToolRunFinished { .. } => order.push("finished"),
                JobEventPayload::JobFinished { status, .. } => break status,
                _ => {}
            }
        }
    })
    .await
    .expect("job finishes");
    assert_eq!(finished, JobStatus::Completed);

    assert_eq!(runner.max_in_flight(job_id), 2, "two tools run side by side");
    let third_start = order
        .iter()
        .enumerate()
        .filter(|(_, kind)| **kind == "started")
        .map(|(index, _)| index)
        .nth(2)
        .expect("three starts");
    let first_finish = order
        .iter()
        .position(|kind| *kind == "finished")
        .expect("a finish");
    assert!(
        first_finish < third_start,
        "the third tool waits for a slot: {order:?}"
    );
    for tool in ["a", "b", "c"] {
        assert_eq!(runner.calls(tool), 1, "{tool} runs exactly once");
    }
    let view = orchestrator.job_status(job_id).await.expect("status");
    assert_eq!(view.job.counts.succeeded, 3);
    assert!(view.tool_runs.iter().all(|run| run.attempts == 1));

    orchestrator.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_failed_tool_does_not_fail_the_job() {
    let runner = Arc::new(
        FakeRunner::new()
            .script("a", Script::Succeed(vec![finding(Severity::Low, "banner")]))
            .script("b", Script::Succeed(Vec::new()))
            .script("c", Script::Exit(2)),
    );
    let orchestrator = started(fast_config(), Arc::clone(&runner)).await;
    let mut events = orchestrator.subscribe();

    let job_id = orchestrator
        .submit_job("example.com", ["a", "b", "c"])
        .await
        .expect("submit");
    assert_eq!(
        wait_for_job(&mut events, job_id).await,
        Some(JobStatus::Completed)
    );

    let view = orchestrator.job_status(job_id).await.expect("status");
    assert_eq!(view.job.counts.total, 3);
    assert_eq!(view.job.counts.succeeded, 2);
    assert_eq!(view.job.counts.failed, 1);
    assert!(view.job.failure.is_none());

    let failed = view
        .tool_runs
        .iter()
        .find(|run| run.tool == "c")
        .expect("run for c");
    assert_eq!(failed.status, ToolRunStatus::Failed);
    assert_eq!(failed.exit_code, Some(2));

    orchestrator.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failing_tool_is_retried_until_it_succeeds() {
    let runner = Arc::new(FakeRunner::new().script("flaky", Script::FailTimes(2)));
    let orchestrator = started(fast_config(), Arc::clone(&runner)).await;
    let mut events = orchestrator.subscribe();

    let job_id = orchestrator
        .submit_job("example.com", ["flaky"])
        .await
        .expect("submit");
    assert_eq!(
        wait_for_job(&mut events, job_id).await,
        Some(JobStatus::Completed)
    );

    let view = orchestrator.job_status(job_id).await.expect("status");
    assert_eq!(view.tool_runs[0].status, ToolRunStatus::Completed);
    assert_eq!(view.tool_runs[0].attempts, 3);
    assert!(view.tool_runs[0].failure.is_none());
    assert_eq!(runner.calls("flaky"), 3);

    orchestrator.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exhausted_retries_fail_the_run() {
    let runner = Arc::new(FakeRunner::new().script("broken", Script::Exit(1)));
    let orchestrator = started(fast_config(), Arc::clone(&runner)).await;
    let mut events = orchestrator.subscribe();

    let job_id = orchestrator
        .submit_job("example.com", ["broken"])
        .await
        .expect("submit");
    assert_eq!(wait_for_job(&mut events, job_id).await, Some(JobStatus::Failed));

    let view = orchestrator.job_status(job_id).await.expect("status");
    let run = &view.tool_runs[0];
    assert_eq!(run.status, ToolRunStatus::Failed);
    assert_eq!(run.attempts, 3);
    assert!(matches!(
        run.failure,
        Some(FailureReason::RetriesExhausted { attempts: 3, .. })
    ));
    assert_eq!(
        view.job.failure.as_ref().map(FailureReason::code),
        Some("retries_exhausted")
    );
    assert_eq!(runner.calls("broken"), 3);

    orchestrator.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_tool_fails_without_retry() {
    let runner = Arc::new(FakeRunner::new().script("ghost", Script::Unknown));
    let orchestrator = started(fast_config(), Arc::clone(&runner)).await;
    let mut events = orchestrator.subscribe();

    let job_id = orchestrator
        .submit_job("example.com", ["ghost"])
        .await
        .expect("submit");
    assert_eq!(wait_for_job(&mut events, job_id).await, Some(JobStatus::Failed));

    let view = orchestrator.job_status(job_id).await.expect("status");
    assert!(matches!(
        view.tool_runs[0].failure,
        Some(FailureReason::ExecutionError { .. })
    ));
    assert_eq!(runner.calls("ghost"), 1);

    orchestrator.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn hard_timeout_marks_the_run_timed_out() {
    let mut config = fast_config();
    config.task.soft_timeout_ms = 50;
    config.task.hard_timeout_ms = 100;
    let runner = Arc::new(
        FakeRunner::new()
            .script("stuck", Script::Stall)
            .script("quick", Script::Succeed(Vec::new())),
    );
    let orchestrator = started(config, Arc::clone(&runner)).await;
    let mut events = orchestrator.subscribe();

    let stuck = orchestrator
        .submit_job("example.com", ["stuck"])
        .await
        .expect("submit");
    assert_eq!(wait_for_job(&mut events, stuck).await, Some(JobStatus::Failed));

    let view = orchestrator.job_status(stuck).await.expect("status");
    assert_eq!(view.tool_runs[0].status, ToolRunStatus::Timeout);
    assert_eq!(
        view.job.failure.as_ref().map(FailureReason::code),
        Some("timeout")
    );
    assert_eq!(runner.calls("stuck"), 1, "timeouts are not retried");
    assert_eq!(orchestrator.concurrency_snapshot().global_tools, 0);

    orchestrator.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn soft_timeout_stop_is_a_timeout_not_a_retry() {
    let runner = Arc::new(FakeRunner::new().script("slowpoke", Script::SoftTimeout));
    let orchestrator = started(fast_config(), Arc::clone(&runner)).await;
    let mut events = orchestrator.subscribe();

    let job_id = orchestrator
        .submit_job("example.com", ["slowpoke"])
        .await
        .expect("submit");
    assert_eq!(wait_for_job(&mut events, job_id).await, Some(JobStatus::Failed));

    let view = orchestrator.job_status(job_id).await.expect("status");
    assert_eq!(view.tool_runs[0].status, ToolRunStatus::Timeout);
    assert_eq!(view.tool_runs[0].failure, Some(FailureReason::Timeout));
    assert_eq!(
        view.job.failure.as_ref().map(FailureReason::code),
        Some("timeout")
    );
    assert_eq!(runner.calls("slowpoke"), 1);

    orchestrator.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelling_a_running_job() {
    let runner = Arc::new(
        FakeRunner::new()
            .script("long", Script::Hang)
            .script("later", Script::Hang),
    );
    let mut config = fast_config();
    config.policy.concurrency.max_tools_per_job = 1;
    let orchestrator = started(config, Arc::clone(&runner)).await;
    let mut events = orchestrator.subscribe();

    let job_id = orchestrator
        .submit_job("example.com", ["long", "later"])
        .await
        .expect("submit");
    let first_start = wait_for_event(&mut events, job_id, |payload| {
        matches!(payload, JobEventPayload::ToolRunStarted { .. })
    })
    .await;
    assert!(first_start.is_some(), "a tool should start");

    assert!(orchestrator.cancel_job(job_id).await.expect("cancel"));
    assert!(
        !orchestrator.cancel_job(job_id).await.expect("cancel again"),
        "cancelling twice is a no-op"
    );

    let view = orchestrator.job_status(job_id).await.expect("status");
    assert_eq!(view.job.status, JobStatus::Cancelled);
    assert!(
        view.tool_runs
            .iter()
            .all(|run| run.status == ToolRunStatus::Cancelled)
    );
    assert_eq!(view.job.counts.cancelled, 2);

    // The running tool observes cancellation and gives its slots back.
    tokio::time::timeout(Duration::from_secs(5), async {
        while orchestrator.concurrency_snapshot().global_tools > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("tool slots released");
    assert_eq!(orchestrator.concurrency_snapshot().global_jobs, 0);

    orchestrator.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_cancels_running_tools_and_frees_their_slots() {
    let runner = Arc::new(FakeRunner::new().script("long", Script::Hang));
    let orchestrator = started(fast_config(), Arc::clone(&runner)).await;
    let mut events = orchestrator.subscribe();

    let job_id = orchestrator
        .submit_job("example.com", ["long"])
        .await
        .expect("submit");
    let start = wait_for_event(&mut events, job_id, |payload| {
        matches!(payload, JobEventPayload::ToolRunStarted { .. })
    })
    .await;
    assert!(start.is_some(), "the tool should start");

    tokio::time::timeout(Duration::from_secs(10), orchestrator.shutdown())
        .await
        .expect("shutdown does not wait for the hanging tool")
        .expect("shutdown");

    let view = orchestrator.job_status(job_id).await.expect("status");
    assert_eq!(view.job.status, JobStatus::Cancelled);
    assert_eq!(view.tool_runs[0].status, ToolRunStatus::Cancelled);
    let snapshot = orchestrator.concurrency_snapshot();
    assert_eq!(snapshot.global_tools, 0);
    assert_eq!(snapshot.global_jobs, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn redelivered_task_does_not_rerun_or_duplicate_findings() {
    let config = fast_config();
    let queue = Arc::new(InMemoryTaskQueue::new(
        RetryPolicy::new(config.retry, config.task.max_attempts()),
        config.lease_ttl(),
    ));
    let runner = Arc::new(FakeRunner::new().script(
        "scanner",
        Script::Succeed(vec![
            finding(Severity::High, "open admin panel"),
            finding(Severity::Info, "server header"),
        ]),
    ));
    let orchestrator = Orchestrator::builder(config)
        .with_runner(runner.clone())
        .with_queue(queue.clone())
        .build()
        .expect("build");
    orchestrator.start().await.expect("start");
    let mut events = orchestrator.subscribe();

    let job_id = orchestrator
        .submit_job("example.com", ["scanner"])
        .await
        .expect("submit");
    assert_eq!(
        wait_for_job(&mut events, job_id).await,
        Some(JobStatus::Completed)
    );
    let first = orchestrator.findings(job_id).await.expect("findings");
    assert_eq!(first.len(), 2);
    assert_eq!(first[0].severity, Severity::High);

    let view = orchestrator.job_status(job_id).await.expect("status");
    let run_id = view.tool_runs[0].id;
    queue
        .enqueue(ToolTask {
            key: run_id,
            job_id,
            tool: "scanner".into(),
            target: "example.com".into(),
        })
        .await
        .expect("redeliver");

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let depth = queue.depth().await.expect("depth");
            if depth.ready + depth.leased + depth.delayed == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("redelivered task drained");

    assert_eq!(runner.calls("scanner"), 1);
    let second = orchestrator.findings(job_id).await.expect("findings");
    let ids = |findings: &[warden_core::model::Finding]| {
        findings.iter().map(|finding| finding.id).collect::<Vec<_>>()
    };
    assert_eq!(ids(&first), ids(&second));
    let view = orchestrator.job_status(job_id).await.expect("status");
    assert_eq!(view.job.counts.succeeded, 1);

    orchestrator.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unavailable_queue_fails_runs_after_retries() {
    let config = fast_config();
    let queue = Arc::new(InMemoryTaskQueue::new(
        RetryPolicy::new(config.retry, config.task.max_attempts()),
        config.lease_ttl(),
    ));
    queue.close().await;
    let runner = Arc::new(FakeRunner::new());
    let orchestrator = Orchestrator::builder(config)
        .with_runner(runner.clone())
        .with_queue(queue)
        .build()
        .expect("build");

    let job_id = orchestrator
        .submit_job("example.com", ["nmap", "nikto"])
        .await
        .expect("submit");

    let view = orchestrator.job_status(job_id).await.expect("status");
    assert_eq!(view.job.status, JobStatus::Failed);
    assert_eq!(
        view.job.failure.as_ref().map(FailureReason::code),
        Some("queue_unavailable")
    );
    assert!(view.tool_runs.iter().all(|run| matches!(
        run.failure,
        Some(FailureReason::QueueUnavailable { .. })
    )));
    assert_eq!(orchestrator.concurrency_snapshot().global_jobs, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rate_limited_runs_are_deferred_not_failed() {
    let mut config = fast_config();
    config.policy.rate_limit.burst = 1;
    config.policy.rate_limit.tokens_per_second = 20.0;
    let runner = Arc::new(FakeRunner::new());
    let orchestrator = started(config, Arc::clone(&runner)).await;
    let mut events = orchestrator.subscribe();

    let job_id = orchestrator
        .submit_job("example.com", ["a", "b", "c"])
        .await
        .expect("submit");

    let mut deferred = 0;
    let finished = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = events.recv().await.expect("event");
            if event.job_id != job_id {
                continue;
            }
            match event.payload {
                JobEventPayload::ToolRunDeferred {
                    reason: DecisionReason::RateLimited,
                    ..
                } => deferred += 1,
                JobEventPayload::JobFinished { status, .. } => break status,
                _ => {}
            }
        }
    })
    .await
    .expect("job finishes");

    assert_eq!(finished, JobStatus::Completed);
    assert!(deferred > 0, "a burst of one must defer some runs");
    let view = orchestrator.job_status(job_id).await.expect("status");
    assert!(view.tool_runs.iter().all(|run| run.attempts == 1));

    orchestrator.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn out_of_scope_target_is_denied_until_rescoped() {
    let runner = Arc::new(FakeRunner::new());
    let orchestrator = started(fast_config(), Arc::clone(&runner)).await;
    let mut events = orchestrator.subscribe();

    orchestrator
        .set_target_scope("Example.COM.", AuthorizationScope::OutOfScope)
        .await
        .expect("scope");
    let denied = orchestrator
        .submit_job("example.com", ["nmap"])
        .await
        .expect("submit");
    let view = orchestrator.job_status(denied).await.expect("status");
    assert_eq!(
        view.job.failure.as_ref().map(FailureReason::code),
        Some("target_out_of_scope")
    );

    orchestrator
        .set_target_scope("example.com", AuthorizationScope::RequiresApproval)
        .await
        .expect("scope");
    let unapproved = orchestrator
        .submit_job("example.com", ["nmap"])
        .await
        .expect("submit");
    let view = orchestrator.job_status(unapproved).await.expect("status");
    assert_eq!(
        view.job.failure.as_ref().map(FailureReason::code),
        Some("approval_required")
    );

    let approved = orchestrator
        .submit(
            SubmitRequest::new("example.com", ["nmap"])
                .with_approvals(Approvals::none().approve_target()),
        )
        .await
        .expect("submit");
    assert_eq!(
        wait_for_job(&mut events, approved).await,
        Some(JobStatus::Completed)
    );

    orchestrator.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn invalid_submissions_create_nothing() {
    let repository = Arc::new(InMemoryScanRepository::new());
    let orchestrator = Orchestrator::builder(fast_config())
        .with_repository(repository.clone())
        .with_runner(Arc::new(FakeRunner::new()))
        .build()
        .expect("build");

    let empty: [&str; 0] = [];
    let err = orchestrator
        .submit_job("example.com", empty)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::Validation(ValidationError::EmptyToolList)
    ));

    let err = orchestrator
        .submit_job("example.com", ["nmap", "  "])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::Validation(ValidationError::BlankToolName { index: 1 })
    ));

    let err = orchestrator
        .submit_job("not a host!", ["nmap"])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::Validation(ValidationError::InvalidTarget(_))
    ));

    assert!(
        repository
            .find_target("example.com")
            .await
            .expect("lookup")
            .is_none()
    );
}

#[tokio::test]
async fn submissions_after_shutdown_are_rejected() {
    let orchestrator = started(fast_config(), Arc::new(FakeRunner::new())).await;
    orchestrator.shutdown().await.expect("shutdown");
    assert!(matches!(
        orchestrator.submit_job("example.com", ["nmap"]).await,
        Err(OrchestratorError::ShuttingDown)
    ));
}
