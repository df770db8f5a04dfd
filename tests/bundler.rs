//! End-to-end behavior of the bundling engine, driven through the public API.

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::NamedTempFile;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;

use logship::sources::file::{FileTailer, FileTailerConfig};
use logship::{BundleHandler, Bundler, BundlerSettings, ByteSizeOf, Line};

#[derive(Clone, Debug, PartialEq, Eq)]
struct TestMsg {
    id: usize,
    size: usize,
}

impl ByteSizeOf for TestMsg {
    fn size_of(&self) -> usize {
        self.size
    }
}

fn msg(id: usize, size: usize) -> TestMsg {
    TestMsg { id, size }
}

type Calls<T> = Arc<Mutex<Vec<Vec<T>>>>;

fn recorder<T: Send + 'static>(calls: Calls<T>) -> impl BundleHandler<T> {
    move |bundle: Vec<T>| {
        let calls = Arc::clone(&calls);
        async move {
            calls.lock().unwrap().push(bundle);
        }
    }
}

fn quiet_timer() -> Duration {
    Duration::from_secs(3600)
}

#[tokio::test(start_paused = true)]
async fn time_threshold_flushes_an_idle_bundle() {
    let calls: Calls<TestMsg> = Arc::default();
    let bundler = Bundler::new(
        BundlerSettings {
            time_threshold: Duration::from_millis(50),
            ..Default::default()
        },
        recorder(Arc::clone(&calls)),
    );

    bundler.try_add(msg(0, 1)).unwrap();

    sleep(Duration::from_millis(40)).await;
    assert!(calls.lock().unwrap().is_empty(), "timer must not fire early");

    sleep(Duration::from_millis(20)).await;
    let calls = calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0], vec![msg(0, 1)]);
}

#[tokio::test(start_paused = true)]
async fn flush_disarms_the_timer() {
    let calls: Calls<TestMsg> = Arc::default();
    let bundler = Bundler::new(
        BundlerSettings {
            time_threshold: Duration::from_millis(50),
            ..Default::default()
        },
        recorder(Arc::clone(&calls)),
    );

    bundler.try_add(msg(0, 1)).unwrap();
    bundler.flush().await;
    assert_eq!(calls.lock().unwrap().len(), 1);

    // A cancelled timer must not produce a second, empty flush.
    sleep(Duration::from_millis(200)).await;
    assert_eq!(calls.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn add_blocks_until_buffer_credit_returns() {
    let handler = |_bundle: Vec<TestMsg>| async move {
        sleep(Duration::from_millis(200)).await;
    };
    let bundler = Bundler::new(
        BundlerSettings {
            time_threshold: quiet_timer(),
            count_threshold: 1,
            buffer_size_limit: 100,
            ..Default::default()
        },
        handler,
    );

    let cancel = CancellationToken::new();
    let start = Instant::now();
    bundler.add(msg(0, 100), &cancel).await.unwrap();
    // The second add cannot proceed until the first bundle's handler returns
    // its credit.
    bundler.add(msg(1, 1), &cancel).await.unwrap();
    assert!(start.elapsed() >= Duration::from_millis(200));

    bundler.flush().await;
}

#[tokio::test(start_paused = true)]
async fn handlers_start_in_order_with_bounded_concurrency() {
    let starts = Arc::new(Mutex::new(Vec::new()));
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicUsize::new(0));

    let handler = {
        let starts = Arc::clone(&starts);
        let running = Arc::clone(&running);
        let peak = Arc::clone(&peak);
        let finished = Arc::clone(&finished);
        move |bundle: Vec<TestMsg>| {
            let starts = Arc::clone(&starts);
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            let finished = Arc::clone(&finished);
            async move {
                starts.lock().unwrap().push(bundle[0].id);
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                sleep(Duration::from_millis(50)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                finished.fetch_add(1, Ordering::SeqCst);
            }
        }
    };

    let bundler = Bundler::new(
        BundlerSettings {
            time_threshold: quiet_timer(),
            count_threshold: 1,
            handler_limit: 2,
            ..Default::default()
        },
        handler,
    );

    for id in 0..5 {
        bundler.try_add(msg(id, 1)).unwrap();
    }
    bundler.flush().await;

    assert_eq!(*starts.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    assert_eq!(peak.load(Ordering::SeqCst), 2);
    assert_eq!(
        finished.load(Ordering::SeqCst),
        5,
        "flush returns only after every handler has finished",
    );
}

#[tokio::test]
async fn tailed_lines_ship_through_the_bundler() {
    let file = NamedTempFile::new().unwrap();
    {
        let mut writer = std::fs::OpenOptions::new()
            .append(true)
            .open(file.path())
            .unwrap();
        writer.write_all(b"one\ntwo\nthree\n").unwrap();
        writer.flush().unwrap();
    }

    let tailer = FileTailer::open(FileTailerConfig {
        read_from_start: true,
        poll_interval: Duration::from_millis(10),
        ..FileTailerConfig::new(file.path())
    })
    .await
    .unwrap();

    let calls: Calls<Line> = Arc::default();
    let bundler = Bundler::new(
        BundlerSettings {
            time_threshold: quiet_timer(),
            count_threshold: 3,
            ..Default::default()
        },
        recorder(Arc::clone(&calls)),
    );

    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel(16);
    let task = tokio::spawn(tailer.run(tx, cancel.clone()));

    for _ in 0..3 {
        let line = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for a line")
            .expect("tailer ended early");
        bundler.add(line, &cancel).await.unwrap();
    }
    bundler.flush().await;

    {
        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        let texts: Vec<&[u8]> = calls[0].iter().map(|line| line.text().as_ref()).collect();
        assert_eq!(texts, vec![&b"one"[..], &b"two"[..], &b"three"[..]]);
        let expected = file.path().display().to_string();
        assert!(calls[0].iter().all(|line| line.file() == expected));
    }

    cancel.cancel();
    task.await.unwrap().unwrap();
}
