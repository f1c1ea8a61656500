//! Lifecycle tests for supervised processes using real child processes

#![cfg(unix)]

use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use installer_process::{HealthCheck, ListenAddr, ProcessError, State};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

fn sh(script: &str) -> State {
    let mut state = State::new();
    state.args = vec!["-c".to_string(), script.to_string()];
    state.init("sh").expect("sh should resolve");
    state
}

/// Serve plain HTTP answers, one status code per connection, repeating the last
async fn serve_statuses(statuses: Vec<u16>) -> (ListenAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let n = counter.fetch_add(1, Ordering::SeqCst);
            let status = statuses[n.min(statuses.len() - 1)];
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 {status} X\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
            );
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
    });
    (ListenAddr::new("127.0.0.1", port), hits)
}

async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    cond()
}

/// Whether `pid` names a live, non-zombie process
fn alive(pid: u32) -> bool {
    let raw = i32::try_from(pid).unwrap();
    if nix::sys::signal::kill(nix::unistd::Pid::from_raw(raw), None).is_err() {
        return false;
    }
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit_once(')')
            .map(|(_, rest)| !rest.trim_start().starts_with('Z'))
            .unwrap_or(true),
        Err(_) => true,
    }
}

#[tokio::test]
async fn start_is_idempotent_once_ready() {
    let mut state = sh("sleep 30");
    let cancel = CancellationToken::new();

    state
        .start(&cancel, Stdio::null(), Stdio::null())
        .await
        .unwrap();
    let pid = state.pid();
    assert!(state.is_ready());

    state
        .start(&cancel, Stdio::null(), Stdio::null())
        .await
        .unwrap();
    assert_eq!(state.pid(), pid);

    state.stop().await.unwrap();
    assert!(!state.is_ready());
}

#[tokio::test]
async fn health_check_retries_until_ok() {
    let (addr, hits) = serve_statuses(vec![503, 503, 200]).await;
    let mut state = sh("sleep 30");
    state.health_check = Some(HealthCheck::new(addr.url("http", "/healthz").unwrap()));
    state.start_timeout = Duration::from_secs(10);

    state
        .start(&CancellationToken::new(), Stdio::null(), Stdio::null())
        .await
        .unwrap();

    assert!(state.is_ready());
    assert_eq!(hits.load(Ordering::SeqCst), 3);
    state.stop().await.unwrap();
}

#[tokio::test]
async fn exit_before_ready_fails_start_and_stops_poller() {
    let unused = ListenAddr::suggest("127.0.0.1").unwrap();
    let mut state = sh("exit 3");
    state.health_check = Some(HealthCheck::new(unused.url("http", "/healthz").unwrap()));
    state.start_timeout = Duration::from_secs(10);

    let err = state
        .start(&CancellationToken::new(), Stdio::null(), Stdio::null())
        .await
        .unwrap_err();

    assert!(matches!(err, ProcessError::ExitedBeforeReady { .. }), "{err}");
    assert!(!state.is_ready());
    let (exited, error) = state.exited();
    assert!(exited);
    assert!(error.is_some_and(|e| e.contains('3')));
    assert!(wait_until(|| state.poller_stop_signals() == 1).await);
}

#[tokio::test]
async fn start_times_out_when_never_healthy() {
    let unused = ListenAddr::suggest("127.0.0.1").unwrap();
    let mut state = sh("sleep 30");
    state.health_check = Some(HealthCheck::new(unused.url("http", "/healthz").unwrap()));
    state.start_timeout = Duration::from_millis(300);

    let err = state
        .start(&CancellationToken::new(), Stdio::null(), Stdio::null())
        .await
        .unwrap_err();

    assert!(matches!(err, ProcessError::StartTimeout { .. }), "{err}");
    assert!(wait_until(|| state.exited().0).await);
}

#[tokio::test]
async fn graceful_stop_succeeds() {
    let mut state = sh("sleep 30");
    state.stop_timeout = Duration::from_secs(5);
    state
        .start(&CancellationToken::new(), Stdio::null(), Stdio::null())
        .await
        .unwrap();

    state.stop().await.unwrap();
    assert!(state.exited().0);
    assert_eq!(state.pid(), None);
}

#[tokio::test]
async fn stop_escalates_to_kill_when_term_is_ignored() {
    let mut state = sh("trap '' TERM; sleep 30");
    state.stop_timeout = Duration::from_millis(300);
    state
        .start(&CancellationToken::new(), Stdio::null(), Stdio::null())
        .await
        .unwrap();
    // let the shell install its trap before signalling
    tokio::time::sleep(Duration::from_millis(200)).await;

    let err = state.stop().await.unwrap_err();

    assert!(matches!(err, ProcessError::ForcedKill { .. }), "{err}");
    assert!(state.exited().0);
}

#[tokio::test]
async fn stopping_an_exited_process_is_ok() {
    let mut state = sh("exit 0");
    state
        .start(&CancellationToken::new(), Stdio::null(), Stdio::null())
        .await
        .unwrap();
    assert!(wait_until(|| state.exited().0).await);

    state.stop().await.unwrap();
}

#[tokio::test]
async fn cancellation_kills_the_process() {
    let mut state = sh("sleep 30");
    let cancel = CancellationToken::new();
    state
        .start(&cancel, Stdio::null(), Stdio::null())
        .await
        .unwrap();

    cancel.cancel();

    assert!(wait_until(|| state.exited().0).await);
}

#[tokio::test]
async fn cancellation_kills_the_process_group() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("helper.pid");
    let mut state = State::new();
    state.args = vec![
        "-c".to_string(),
        "sleep 30 & echo $! > helper.pid; wait".to_string(),
    ];
    state.dir = Some(dir.path().to_path_buf());
    state.init("sh").unwrap();
    let cancel = CancellationToken::new();
    state
        .start(&cancel, Stdio::null(), Stdio::null())
        .await
        .unwrap();

    assert!(
        wait_until(|| std::fs::read_to_string(&pid_file).is_ok_and(|s| s.ends_with('\n'))).await
    );
    let helper: u32 = std::fs::read_to_string(&pid_file)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert!(alive(helper));

    cancel.cancel();

    assert!(wait_until(|| state.exited().0).await);
    assert!(wait_until(|| !alive(helper)).await);
}

#[tokio::test]
async fn dropping_a_running_state_kills_the_process() {
    let mut state = sh("sleep 30");
    state
        .start(&CancellationToken::new(), Stdio::null(), Stdio::null())
        .await
        .unwrap();
    let pid = state.pid().unwrap();
    assert!(alive(pid));

    drop(state);

    assert!(wait_until(|| !alive(pid)).await);
}

#[tokio::test]
async fn environment_and_dir_reach_the_child() {
    let dir = tempfile::tempdir().unwrap();
    let mut state = State::new();
    state.args = vec!["-c".to_string(), "echo \"$GREETING\" > out.txt".to_string()];
    state.env = vec!["GREETING=hello=world".to_string()];
    state.dir = Some(dir.path().to_path_buf());
    state.init("sh").unwrap();
    state
        .start(&CancellationToken::new(), Stdio::null(), Stdio::null())
        .await
        .unwrap();
    assert!(wait_until(|| state.exited().0).await);

    let out = std::fs::read_to_string(dir.path().join("out.txt")).unwrap();
    assert_eq!(out.trim(), "hello=world");
}
