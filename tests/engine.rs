//! End-to-end engine behavior against the local and mock adapters

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_test::assert_ok;
use uxec::{
    CachePolicy, Command, ContextConfig, Error, ExecutionEngine, SshOptions, Target,
};

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

#[tokio::test]
async fn local_echo_round_trip() {
    init_tracing();
    let engine = ExecutionEngine::new();

    let result = assert_ok!(
        engine
            .run(
                Command::new("printf")
                    .args(["%s", "hi"])
                    .target(Target::Local),
            )
            .await
    );

    assert!(result.ok());
    assert_eq!(result.stdout, b"hi");
    assert_eq!(result.stderr, b"");
    assert_eq!(result.exit_code, 0);
    engine.dispose().await;
}

#[tokio::test]
async fn timeout_kills_the_child() {
    init_tracing();
    let engine = ExecutionEngine::new();

    let started = Instant::now();
    let outcome = engine
        .run(
            Command::shell("sleep 10")
                .timeout(Duration::from_millis(100))
                .timeout_signal("TERM"),
        )
        .await;
    let elapsed = started.elapsed();

    match outcome {
        Err(Error::Timeout { timeout, .. }) => assert_eq!(timeout, Duration::from_millis(100)),
        other => panic!("expected TimeoutError, got {:?}", other.map(|r| r.exit_code)),
    }
    // The child is gone well before its natural 10s.
    assert!(elapsed < Duration::from_secs(8), "took {:?}", elapsed);
    engine.dispose().await;
}

#[tokio::test]
async fn bytes_round_trip_law() -> anyhow::Result<()> {
    let engine = ExecutionEngine::new();

    let payload = "payload with spaces and \\x24 symbols";
    let result = engine
        .run(Command::new("printf").args(["%s", payload]))
        .await?;
    assert_eq!(result.bytes().as_ref(), payload.as_bytes());
    engine.dispose().await;
    Ok(())
}

#[tokio::test]
async fn lines_round_trip_law() {
    let engine = ExecutionEngine::new();

    let mut promise = engine.sh("printf 'a\\nb\\n\\nc\\n'");
    let lines = promise.lines().await.unwrap();
    assert_eq!(lines, vec!["a", "b", "", "c"]);
    engine.dispose().await;
}

#[tokio::test]
async fn json_round_trip_law() {
    let engine = ExecutionEngine::new();

    let value = serde_json::json!({"n": 4, "list": [1, 2]});
    let mut promise = engine.command(
        Command::new("cat").stdin_bytes(serde_json::to_vec(&value).unwrap()),
    );
    let parsed: serde_json::Value = promise.json().await.unwrap();
    assert_eq!(parsed, value);
    engine.dispose().await;
}

#[tokio::test]
async fn empty_env_does_not_inherit_ambient() {
    std::env::set_var("UXEC_E2E_MARKER", "leak");
    let engine = ExecutionEngine::new();

    let result = engine.run(Command::new("env").env_clear()).await.unwrap();
    assert!(!result.stdout_text().contains("UXEC_E2E_MARKER"));
    engine.dispose().await;
}

#[tokio::test]
async fn pipeline_is_ordered_copy() {
    let engine = ExecutionEngine::new();

    // A | B | C: C's stdin is A's stdout filtered by B.
    let a = engine.sh("printf '3\\n1\\n2\\n'");
    let b = engine.command(Command::new("sort"));
    let c = engine.command(Command::new("head").arg("-n").arg("2"));
    let mut pipeline = a.pipe(b).pipe(c);

    let result = pipeline.wait().await.unwrap();
    assert_eq!(result.stdout, b"1\n2\n");
    engine.dispose().await;
}

#[tokio::test]
async fn single_flight_cache_one_execution() {
    init_tracing();
    let engine = ExecutionEngine::new();
    let mock = Arc::new(uxec::adapters::MockAdapter::new());
    mock.set_delay(Duration::from_millis(50));
    for _ in 0..32 {
        mock.push_output("1719397", 0);
    }
    engine.install_mock(mock.clone());

    let misses = Arc::new(AtomicUsize::new(0));
    let misses2 = misses.clone();
    engine.events().subscribe("cache:miss", move |_| {
        misses2.fetch_add(1, Ordering::SeqCst);
    });

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move {
            engine
                .run(
                    Command::shell("date +%s")
                        .target(Target::Mock)
                        .cache(CachePolicy::ttl(Duration::from_secs(60))),
                )
                .await
                .unwrap()
        }));
    }

    let mut outputs = Vec::new();
    for task in tasks {
        outputs.push(task.await.unwrap().stdout);
    }

    assert_eq!(mock.invocation_count(), 1, "exactly one underlying execution");
    assert_eq!(misses.load(Ordering::SeqCst), 1);
    assert!(outputs.iter().all(|o| o == &outputs[0]));
    engine.dispose().await;
}

#[tokio::test]
async fn command_events_per_promise() {
    let engine = ExecutionEngine::new();
    let starts = Arc::new(AtomicUsize::new(0));
    let completions = Arc::new(AtomicUsize::new(0));
    let errors = Arc::new(AtomicUsize::new(0));

    let starts2 = starts.clone();
    engine.events().subscribe("command:start", move |_| {
        starts2.fetch_add(1, Ordering::SeqCst);
    });
    let completions2 = completions.clone();
    engine.events().subscribe("command:complete", move |_| {
        completions2.fetch_add(1, Ordering::SeqCst);
    });
    let errors2 = errors.clone();
    engine.events().subscribe("command:error", move |_| {
        errors2.fetch_add(1, Ordering::SeqCst);
    });

    engine.run(Command::shell("true")).await.unwrap();
    let _ = engine.run(Command::shell("false")).await;
    let _ = engine
        .run(Command::shell("sleep 5").timeout(Duration::from_millis(50)))
        .await;

    // Each spawned command: one start, then exactly one of
    // complete / error.
    assert_eq!(starts.load(Ordering::SeqCst), 3);
    assert_eq!(completions.load(Ordering::SeqCst), 1);
    assert_eq!(errors.load(Ordering::SeqCst), 2);
    engine.dispose().await;
}

#[tokio::test]
async fn cancellation_settles_within_grace() {
    use tokio_util::sync::CancellationToken;

    let engine = ExecutionEngine::new();
    let token = CancellationToken::new();

    let mut cmd = Command::shell("sleep 10").cancel(token.clone());
    cmd.kill_grace = Duration::from_millis(500);
    let mut promise = engine.command(cmd).spawn();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let cancelled_at = Instant::now();
    token.cancel();

    let outcome = promise.wait().await;
    assert!(matches!(outcome, Err(Error::Cancelled { .. })));
    assert!(cancelled_at.elapsed() < Duration::from_secs(2));
    engine.dispose().await;
}

#[tokio::test]
async fn ssh_pool_refuses_after_dispose() {
    let engine = ExecutionEngine::new();
    engine.dispose().await;

    let outcome = engine
        .run(
            Command::shell("date")
                .target(Target::Ssh(SshOptions::new("nowhere", "nobody"))),
        )
        .await;
    assert!(matches!(outcome, Err(Error::Disposed(_))));
}

#[tokio::test]
async fn context_frames_nest_additively() {
    let engine = ExecutionEngine::new();

    let outer = engine.within(ContextConfig::default().env("OUTER", "1").env("BOTH", "outer"));
    let inner = outer.within(ContextConfig::default().env("INNER", "2").env("BOTH", "inner"));

    let result = inner
        .run(Command::shell(
            "printf '%s %s %s' \"$OUTER\" \"$INNER\" \"$BOTH\"",
        ))
        .await
        .unwrap();
    assert_eq!(result.stdout, b"1 2 inner");
    engine.dispose().await;
}

#[tokio::test]
async fn mock_target_records_addressing() {
    let engine = ExecutionEngine::new();
    let mock = Arc::new(uxec::adapters::MockAdapter::new());
    engine.install_mock(mock.clone());

    engine
        .run(Command::shell("date").target(Target::Mock))
        .await
        .unwrap();

    let invocations = mock.invocations();
    assert_eq!(invocations.len(), 1);
    assert_eq!(invocations[0].command, "date");
    assert_eq!(invocations[0].target, "mock");
    engine.dispose().await;
}
