//! Supervisor integration tests: real processes, pipes, redirects and
//! timeout policies.

#![cfg(unix)]

use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::sync::watch;

use runkit::exec::{Supervisor, TimeoutKind, TimeoutPolicy};
use runkit::parser::{Parser, Pipeline};
use runkit::Error;

fn pipeline(text: &str) -> Pipeline {
    Parser::new(text).parse_one().expect("parse failed")
}

fn supervisor() -> Supervisor {
    Supervisor::new(TimeoutPolicy::none())
}

#[tokio::test]
async fn captures_stdout_through_a_pipe() {
    let cwd = tempfile::tempdir().expect("tempdir");
    let result = supervisor()
        .run(&pipeline("echo hello | cat"), cwd.path())
        .await
        .expect("run failed");
    assert!(result.success());
    assert_eq!(result.stdout, "hello\n");
    assert_eq!(result.stage_codes, vec![0, 0]);
}

#[tokio::test]
async fn stage_output_ordering_is_preserved() {
    let cwd = tempfile::tempdir().expect("tempdir");
    let result = supervisor()
        .run(&pipeline("sh -c 'echo one; echo two; echo three' | cat"), cwd.path())
        .await
        .expect("run failed");
    assert_eq!(result.stdout, "one\ntwo\nthree\n");
}

#[tokio::test]
async fn pipefail_reports_first_failing_stage() {
    let cwd = tempfile::tempdir().expect("tempdir");
    let text = "sh -c 'exit 2' | sh -c 'exit 0'";

    let strict = Parser::new(text).pipefail(true).parse_one().expect("parse");
    let result = supervisor().run(&strict, cwd.path()).await.expect("run");
    assert_eq!(result.stage_codes, vec![2, 0]);
    assert_eq!(result.exit_code, 2);
    assert!(!result.success());

    let lenient = Parser::new(text).pipefail(false).parse_one().expect("parse");
    let result = supervisor().run(&lenient, cwd.path()).await.expect("run");
    assert_eq!(result.stage_codes, vec![2, 0]);
    assert_eq!(result.exit_code, 0);
    assert!(result.success());
}

#[tokio::test]
async fn inline_env_is_scoped_to_the_stage() {
    let cwd = tempfile::tempdir().expect("tempdir");
    let result = supervisor()
        .run(&pipeline("GREETING=hi sh -c 'echo $GREETING'"), cwd.path())
        .await
        .expect("run failed");
    assert_eq!(result.stdout, "hi\n");
}

#[tokio::test]
async fn output_redirect_writes_relative_to_cwd() {
    let cwd = tempfile::tempdir().expect("tempdir");
    let result = supervisor()
        .run(&pipeline("sh -c 'echo content' > out.txt"), cwd.path())
        .await
        .expect("run failed");
    assert!(result.success());
    assert_eq!(result.stdout, "");
    let written = std::fs::read_to_string(cwd.path().join("out.txt")).expect("read out.txt");
    assert_eq!(written, "content\n");
}

#[tokio::test]
async fn append_redirect_accumulates() {
    let cwd = tempfile::tempdir().expect("tempdir");
    for _ in 0..2 {
        supervisor()
            .run(&pipeline("echo line >> log.txt"), cwd.path())
            .await
            .expect("run failed");
    }
    let written = std::fs::read_to_string(cwd.path().join("log.txt")).expect("read log.txt");
    assert_eq!(written, "line\nline\n");
}

#[tokio::test]
async fn input_redirect_feeds_first_stage() {
    let cwd = tempfile::tempdir().expect("tempdir");
    std::fs::write(cwd.path().join("in.txt"), "from a file\n").expect("write fixture");
    let result = supervisor()
        .run(&pipeline("cat < in.txt"), cwd.path())
        .await
        .expect("run failed");
    assert_eq!(result.stdout, "from a file\n");
}

#[tokio::test]
async fn dup_fd_merges_stderr_into_stdout() {
    let cwd = tempfile::tempdir().expect("tempdir");
    let result = supervisor()
        .run(&pipeline("sh -c 'echo oops 1>&2' 2>&1"), cwd.path())
        .await
        .expect("run failed");
    assert!(result.stdout.contains("oops"));
    assert_eq!(result.stderr, "");
}

#[tokio::test]
async fn dup_fd_feeds_stderr_through_a_pipe() {
    let cwd = tempfile::tempdir().expect("tempdir");
    let result = supervisor()
        .run(
            &pipeline("sh -c 'echo finding 1>&2' 2>&1 | grep finding"),
            cwd.path(),
        )
        .await
        .expect("run failed");
    assert!(result.success(), "grep should see the merged stream");
    assert_eq!(result.stdout, "finding\n");
}

#[tokio::test]
async fn unknown_executable_is_a_spawn_error() {
    let cwd = tempfile::tempdir().expect("tempdir");
    let outcome = supervisor()
        .run(&pipeline("definitely-not-a-real-command-kw3x"), cwd.path())
        .await;
    assert!(matches!(outcome, Err(Error::Spawn { .. })));
}

#[tokio::test]
async fn unreadable_redirect_target_is_an_io_error() {
    let cwd = tempfile::tempdir().expect("tempdir");
    let outcome = supervisor()
        .run(&pipeline("cat < missing-input.txt"), cwd.path())
        .await;
    assert!(matches!(outcome, Err(Error::Io { .. })));
}

#[tokio::test]
async fn exotic_fd_duplication_is_rejected() {
    let cwd = tempfile::tempdir().expect("tempdir");
    let outcome = supervisor()
        .run(&pipeline("sh -c true 3>&1"), cwd.path())
        .await;
    assert!(matches!(outcome, Err(Error::UnsupportedRedirect(_))));
}

#[tokio::test]
async fn idle_timeout_kills_a_silent_process() {
    let cwd = tempfile::tempdir().expect("tempdir");
    let supervisor = Supervisor::new(TimeoutPolicy {
        overall: Some(Duration::from_secs(60)),
        idle: Some(Duration::from_millis(300)),
    });
    let result = supervisor
        .run(&pipeline("sleep 30"), cwd.path())
        .await
        .expect("run failed");
    assert_eq!(result.timeout, TimeoutKind::Idle);
    assert!(result.killed);
    assert!(!result.success());
    assert!(
        result.duration < Duration::from_secs(10),
        "idle kill took {:?}",
        result.duration
    );
}

#[tokio::test]
async fn overall_timeout_dominates_a_chatty_process() {
    let cwd = tempfile::tempdir().expect("tempdir");
    let supervisor = Supervisor::new(TimeoutPolicy {
        overall: Some(Duration::from_millis(400)),
        idle: Some(Duration::from_secs(60)),
    });
    // Emits output continuously, so only the overall cap can fire.
    let result = supervisor
        .run(
            &pipeline("sh -c 'while true; do echo tick; sleep 0.05; done'"),
            cwd.path(),
        )
        .await
        .expect("run failed");
    assert_eq!(result.timeout, TimeoutKind::Overall);
    assert!(result.killed);
    assert!(
        result.duration < Duration::from_secs(10),
        "overall kill took {:?}",
        result.duration
    );
}

#[tokio::test]
async fn tighter_idle_window_fires_before_overall() {
    let cwd = tempfile::tempdir().expect("tempdir");
    let supervisor = Supervisor::new(TimeoutPolicy {
        overall: Some(Duration::from_secs(5)),
        idle: Some(Duration::from_millis(200)),
    });
    let result = supervisor
        .run(&pipeline("sleep 30"), cwd.path())
        .await
        .expect("run failed");
    assert_eq!(result.timeout, TimeoutKind::Idle);
}

#[tokio::test]
async fn timeout_reclaims_the_whole_process_group() {
    let cwd = tempfile::tempdir().expect("tempdir");
    let supervisor = Supervisor::new(TimeoutPolicy {
        overall: Some(Duration::from_millis(400)),
        idle: None,
    });
    // The grandchild writes a marker if it survives past the kill.
    let result = supervisor
        .run(
            &pipeline("sh -c '(sleep 2; echo alive > leaked.txt) & sleep 30'"),
            cwd.path(),
        )
        .await
        .expect("run failed");
    assert_eq!(result.timeout, TimeoutKind::Overall);
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(
        !cwd.path().join("leaked.txt").exists(),
        "grandchild escaped the process group kill"
    );
}

#[tokio::test]
async fn cancellation_aborts_an_in_flight_pipeline() {
    let cwd = tempfile::tempdir().expect("tempdir");
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let supervisor = Supervisor::new(TimeoutPolicy::none()).with_cancel(cancel_rx);

    let run = tokio::spawn({
        let cwd = cwd.path().to_path_buf();
        async move { supervisor.run(&pipeline("sleep 30"), &cwd).await }
    });
    tokio::time::sleep(Duration::from_millis(200)).await;
    cancel_tx.send(true).expect("send cancel");

    let outcome = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .expect("cancellation hung")
        .expect("join failed");
    assert!(matches!(outcome, Err(Error::Cancelled)));
}
