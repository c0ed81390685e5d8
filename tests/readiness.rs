//! Readiness wait timing and outcomes.
//!
//! Timing tests run on a paused tokio clock, so `interval` sleeps complete
//! instantly and `Instant::elapsed` reports virtual time.

use std::os::unix::net::UnixListener;
use std::path::Path;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use labvm::readiness::{self, ReadinessWaiter, WaitOutcome};
use labvm::Error;
use tokio::time::Instant;
use tracing_subscriber::fmt::MakeWriter;

fn counting_waiter(
    path: &Path,
    attempts: u32,
    ready_on: Option<u32>,
) -> (ReadinessWaiter, Arc<AtomicU32>) {
    let calls = Arc::new(AtomicU32::new(0));
    let seen = calls.clone();
    let waiter = ReadinessWaiter::new(path, attempts, Duration::from_secs(1)).with_probe(
        move |_| {
            let n = seen.fetch_add(1, Ordering::SeqCst) + 1;
            ready_on.is_some_and(|k| n >= k)
        },
    );
    (waiter, calls)
}

/// Log sink shared between a test and its subscriber.
#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    fn count(&self, needle: &str) -> usize {
        let raw = self.0.lock().unwrap();
        String::from_utf8_lossy(&raw)
            .lines()
            .filter(|line| line.contains(needle))
            .count()
    }
}

impl io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogBuffer {
    type Writer = LogBuffer;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

fn capture_logs() -> (LogBuffer, tracing::subscriber::DefaultGuard) {
    let logs = LogBuffer::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(logs.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::DEBUG)
        .finish();
    (logs, tracing::subscriber::set_default(subscriber))
}

#[tokio::test(start_paused = true)]
async fn ready_on_first_check_does_not_sleep() {
    let (waiter, calls) = counting_waiter(Path::new("/run/tpm/swtpm-sock"), 20, Some(1));
    let start = Instant::now();

    assert_eq!(waiter.poll().await, WaitOutcome::Ready { checks: 1 });
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(start.elapsed(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn ready_on_kth_check_sleeps_k_minus_one_times() {
    let (waiter, calls) = counting_waiter(Path::new("/run/tpm/swtpm-sock"), 20, Some(4));
    let start = Instant::now();

    assert_eq!(waiter.poll().await, WaitOutcome::Ready { checks: 4 });
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(start.elapsed(), Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn timeout_after_exactly_max_attempts() {
    let (waiter, calls) = counting_waiter(Path::new("/run/tpm/swtpm-sock"), 5, None);
    let start = Instant::now();

    assert_eq!(waiter.poll().await, WaitOutcome::TimedOut { checks: 5 });
    assert_eq!(calls.load(Ordering::SeqCst), 5);
    assert_eq!(start.elapsed(), Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn timeout_maps_to_error() {
    let (waiter, _) = counting_waiter(Path::new("/run/tpm/swtpm-sock"), 3, None);

    match waiter.await_ready().await {
        Err(Error::ReadinessTimeout {
            path,
            attempts,
            interval,
        }) => {
            assert_eq!(path, Path::new("/run/tpm/swtpm-sock"));
            assert_eq!(attempts, 3);
            assert_eq!(interval, Duration::from_secs(1));
        }
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn zero_budget_still_checks_once() {
    let (waiter, calls) = counting_waiter(Path::new("/nowhere"), 0, None);
    assert_eq!(waiter.max_attempts(), 1);
    assert_eq!(waiter.poll().await, WaitOutcome::TimedOut { checks: 1 });
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn existing_unix_socket_is_ready() {
    let dir = tempfile::tempdir().unwrap();
    let sock = readiness::tpm_socket_path(dir.path());
    let _listener = UnixListener::bind(&sock).unwrap();

    readiness::await_ready(&sock, 3, Duration::from_millis(10))
        .await
        .unwrap();
}

#[tokio::test]
async fn regular_file_is_not_a_socket() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("swtpm-sock");
    std::fs::write(&path, b"").unwrap();

    let result = readiness::await_ready(&path, 2, Duration::from_millis(5)).await;
    assert!(matches!(result, Err(Error::ReadinessTimeout { attempts: 2, .. })));
}

#[tokio::test]
async fn socket_created_while_waiting() {
    let dir = tempfile::tempdir().unwrap();
    let sock = readiness::tpm_socket_path(dir.path());

    let bind_path = sock.clone();
    let binder = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        UnixListener::bind(&bind_path).unwrap()
    });

    let waiter = ReadinessWaiter::new(&sock, 100, Duration::from_millis(10));
    assert!(matches!(waiter.poll().await, WaitOutcome::Ready { checks } if checks > 1));

    drop(binder.await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn one_notice_per_failed_check() {
    let (logs, _guard) = capture_logs();
    let (waiter, _) = counting_waiter(Path::new("/run/tpm/swtpm-sock"), 10, None);

    assert_eq!(waiter.poll().await, WaitOutcome::TimedOut { checks: 10 });
    assert_eq!(logs.count("waiting for /run/tpm/swtpm-sock"), 10);
    assert_eq!(logs.count("remaining=0"), 1);
}

#[tokio::test(start_paused = true)]
async fn no_notice_when_socket_already_exists() {
    let (logs, _guard) = capture_logs();
    let (waiter, _) = counting_waiter(Path::new("/run/tpm/swtpm-sock"), 10, Some(1));

    assert_eq!(waiter.poll().await, WaitOutcome::Ready { checks: 1 });
    assert_eq!(logs.count("waiting for"), 0);
    assert_eq!(logs.count("ready on check 1"), 1);
}
