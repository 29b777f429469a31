#![cfg(unix)]

use std::path::Path;
use std::time::Duration;

use futures::StreamExt;
use harvest_core::engine::{EngineHandle, SupervisorError};
use harvest_core::{EngineState, Supervisor};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn start(supervisor: &Supervisor, script: &str, dir: &Path) -> EngineHandle {
    supervisor
        .start(
            Path::new("/bin/sh"),
            &["-c".to_string(), script.to_string()],
            dir,
        )
        .unwrap()
}

fn supervisor() -> Supervisor {
    Supervisor::new().with_grace_period(Duration::from_secs(2))
}

#[tokio::test]
async fn test_exit_one_is_exhausted() {
    let temp = TempDir::new().unwrap();
    let handle = start(
        &supervisor(),
        r#"echo 'Starting...'; echo '{"status":5,"progress":[100,100],"recovered_hashes":[0,3]}'; exit 1"#,
        temp.path(),
    );

    let outcome = handle.wait(Duration::from_secs(10)).await;
    assert_eq!(outcome.state, EngineState::Exhausted);
    assert_eq!(outcome.code, Some(1));
    assert_eq!(outcome.final_snapshot.unwrap().progress_numerator, 100);
}

#[tokio::test]
async fn test_exit_zero_without_recovery_is_exhausted() {
    let temp = TempDir::new().unwrap();
    let handle = start(
        &supervisor(),
        r#"echo '{"progress":[100,100],"recovered":[0,1]}'; exit 0"#,
        temp.path(),
    );

    let outcome = handle.wait(Duration::from_secs(10)).await;
    assert_eq!(outcome.state, EngineState::Exhausted);
    assert_eq!(outcome.max_recovered, 0);
}

#[tokio::test]
async fn test_exit_zero_with_recovery_is_recovered() {
    let temp = TempDir::new().unwrap();
    let handle = start(
        &supervisor(),
        r#"echo '{"progress":[40,100],"recovered":[1,2]}'; echo '{"progress":[100,100],"recovered":[2,2]}'; exit 0"#,
        temp.path(),
    );

    let outcome = handle.wait(Duration::from_secs(10)).await;
    assert_eq!(outcome.state, EngineState::Recovered);
    assert_eq!(outcome.max_recovered, 2);
}

#[tokio::test]
async fn test_other_exit_code_is_crash_with_stderr() {
    let temp = TempDir::new().unwrap();
    let handle = start(
        &supervisor(),
        "echo 'No devices found' >&2; exit 255",
        temp.path(),
    );

    let outcome = handle.wait(Duration::from_secs(10)).await;
    assert_eq!(outcome.state, EngineState::Crashed);
    assert_eq!(outcome.code, Some(255));
    assert_eq!(outcome.stderr, "No devices found");

    match outcome.into_result() {
        Err(SupervisorError::EngineCrashed { code, stderr }) => {
            assert_eq!(code, Some(255));
            assert!(stderr.contains("No devices"));
        }
        other => panic!("expected crash, got {other:?}"),
    }
}

#[tokio::test]
async fn test_runs_in_working_directory() {
    let temp = TempDir::new().unwrap();
    let handle = start(&supervisor(), "pwd > where.txt; exit 1", temp.path());
    handle.wait(Duration::from_secs(10)).await;

    let recorded = std::fs::read_to_string(temp.path().join("where.txt")).unwrap();
    let expected = temp.path().canonicalize().unwrap();
    assert_eq!(Path::new(recorded.trim()).canonicalize().unwrap(), expected);
}

#[tokio::test]
async fn test_timeout_terminates_engine() {
    let temp = TempDir::new().unwrap();
    let handle = start(&supervisor(), "exec sleep 30", temp.path());

    let outcome = handle.wait(Duration::from_millis(200)).await;
    assert_eq!(outcome.state, EngineState::TimedOut);
    assert!(outcome.elapsed < Duration::from_secs(10));
    assert!(matches!(
        outcome.into_result(),
        Err(SupervisorError::EngineTimedOut { .. })
    ));
}

#[tokio::test]
async fn test_cancel_from_another_task() {
    let temp = TempDir::new().unwrap();
    let handle = start(&supervisor(), "exec sleep 30", temp.path());

    let token = handle.cancel_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
        token.cancel();
    });

    let outcome = handle.wait(Duration::from_secs(10)).await;
    assert_eq!(outcome.state, EngineState::Cancelled);
    assert!(outcome.elapsed < Duration::from_secs(10));
}

#[tokio::test]
async fn test_ignored_termination_is_killed() {
    let temp = TempDir::new().unwrap();
    let supervisor = Supervisor::new().with_grace_period(Duration::from_millis(200));
    let handle = start(&supervisor, "trap '' TERM; exec sleep 30", temp.path());

    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.cancel();

    let outcome = handle.wait(Duration::from_secs(10)).await;
    assert_eq!(outcome.state, EngineState::Cancelled);
    assert!(outcome.elapsed < Duration::from_secs(5));
}

#[tokio::test]
async fn test_cancel_after_exit_is_noop() {
    let temp = TempDir::new().unwrap();
    let handle = start(&supervisor(), "exit 1", temp.path());

    while handle.is_running() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    handle.cancel();

    let outcome = handle.wait(Duration::from_secs(10)).await;
    assert_eq!(outcome.state, EngineState::Exhausted);
}

#[tokio::test]
async fn test_parent_token_cancels_engine() {
    let temp = TempDir::new().unwrap();
    let parent = CancellationToken::new();
    let supervisor = supervisor().with_cancellation(parent.clone());
    let handle = start(&supervisor, "exec sleep 30", temp.path());

    parent.cancel();
    let outcome = handle.wait(Duration::from_secs(10)).await;
    assert_eq!(outcome.state, EngineState::Cancelled);
}

#[tokio::test]
async fn test_stream_status_skips_noise() {
    let temp = TempDir::new().unwrap();
    let mut handle = start(
        &supervisor(),
        r#"echo '{"progress":[1,4],"recovered":[0,0]}'
echo 'Session..........: harvest'
echo 'noise {"progress":[2,4],"recovered":[0,0]}'
echo '{"progress":[4,4],"recovered":[1,1]}'
exit 0"#,
        temp.path(),
    );

    let status = handle.stream_status();
    let collector = tokio::spawn(status.collect::<Vec<_>>());
    let outcome = handle.wait(Duration::from_secs(10)).await;
    let snapshots = collector.await.unwrap();

    let progress: Vec<u64> = snapshots.iter().map(|s| s.progress_numerator).collect();
    assert_eq!(progress, vec![1, 2, 4]);
    assert_eq!(outcome.state, EngineState::Recovered);
}

#[tokio::test]
async fn test_missing_binary_fails_to_start() {
    let temp = TempDir::new().unwrap();
    let result = supervisor().start(
        &temp.path().join("no-such-engine"),
        &[],
        temp.path(),
    );
    assert!(matches!(result, Err(SupervisorError::Spawn { .. })));
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_engine_runs_in_own_process_group() {
    let temp = TempDir::new().unwrap();
    let handle = start(
        &supervisor(),
        r#"read -r _ _ _ _ pgid _ < /proc/$$/stat; echo "$pgid $$" > pgid.txt; exit 1"#,
        temp.path(),
    );
    handle.wait(Duration::from_secs(10)).await;

    let recorded = std::fs::read_to_string(temp.path().join("pgid.txt")).unwrap();
    let ids: Vec<i32> = recorded
        .split_whitespace()
        .map(|id| id.parse().unwrap())
        .collect();
    assert_eq!(ids[0], ids[1]);
    assert_ne!(ids[0], nix::unistd::getpgrp().as_raw());
}

#[tokio::test]
async fn test_oversized_status_line_is_skipped() {
    let temp = TempDir::new().unwrap();
    let mut handle = start(
        &supervisor(),
        r#"printf '%s{"progress":[9,9],"recovered":[0,0]}\n' "$(head -c 100000 /dev/zero | tr '\0' x)"
echo '{"progress":[1,4],"recovered":[0,0]}'
exit 1"#,
        temp.path(),
    );

    let status = handle.stream_status();
    let collector = tokio::spawn(status.collect::<Vec<_>>());
    let outcome = handle.wait(Duration::from_secs(10)).await;
    let snapshots = collector.await.unwrap();

    let progress: Vec<u64> = snapshots.iter().map(|s| s.progress_numerator).collect();
    assert_eq!(progress, vec![1]);
    assert_eq!(outcome.final_snapshot.unwrap().progress_numerator, 1);
}
