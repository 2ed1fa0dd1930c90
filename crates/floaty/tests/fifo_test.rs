//! Integration tests for the FIFO dispatcher.

use floaty::config::NotifyConfig;
use floaty::fifo::{FifoEvent, FifoHandler, NotificationHandler};
use floaty::notification::VrrpState;
use floaty::providers::FakeProvider;
use floaty::NetAddress;
use std::collections::{HashMap, VecDeque};
use std::io::Read;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// In-memory stand-in for the non-blocking named pipe.
#[derive(Clone, Default)]
struct TestPipe {
    buf: Arc<Mutex<VecDeque<u8>>>,
}

impl TestPipe {
    fn push(&self, content: &str) {
        self.buf.lock().unwrap().extend(content.bytes());
    }
}

impl Read for TestPipe {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        let mut buf = self.buf.lock().unwrap();
        if buf.is_empty() {
            return Err(std::io::ErrorKind::WouldBlock.into());
        }

        let count = out.len().min(buf.len());
        for slot in out.iter_mut().take(count) {
            *slot = buf.pop_front().unwrap();
        }
        Ok(count)
    }
}

struct FifoTest {
    pipe: TestPipe,
    events: mpsc::UnboundedSender<FifoEvent>,
    scope: CancellationToken,
}

impl FifoTest {
    fn start(handler: NotificationHandler) -> Self {
        let pipe = TestPipe::default();
        let (tx, rx) = mpsc::unbounded_channel();
        let scope = CancellationToken::new();

        let mut fifo_handler = FifoHandler::new(pipe.clone(), rx, handler);
        let handler_scope = scope.clone();
        tokio::spawn(async move {
            fifo_handler
                .handle_fifo(&handler_scope)
                .await
                .expect("handler should not fail");
        });

        Self {
            pipe,
            events: tx,
            scope,
        }
    }

    fn write(&self, content: &str) {
        self.pipe.push(content);
        self.events.send(FifoEvent::Write).unwrap();
    }
}

impl Drop for FifoTest {
    fn drop(&mut self) {
        self.scope.cancel();
    }
}

/// Records which instances currently run in MASTER state, asserting that a
/// replaced run was cancelled first.
#[derive(Clone, Default)]
struct HandlerLog {
    running: Arc<Mutex<HashMap<String, (CancellationToken, bool)>>>,
}

impl HandlerLog {
    fn handler(&self) -> NotificationHandler {
        let running = self.running.clone();
        Box::new(move |scope, notification| {
            let mut map = running.lock().unwrap();
            if let Some((old_scope, _)) = map.get(&notification.instance) {
                assert!(old_scope.is_cancelled(), "old handler not stopped");
            }
            map.insert(
                notification.instance.clone(),
                (scope, notification.state == VrrpState::Master),
            );
        })
    }

    fn is_master(&self, instance: &str) -> bool {
        self.running
            .lock()
            .unwrap()
            .get(instance)
            .map(|(_, master)| *master)
            .unwrap_or(false)
    }

    async fn eventually_master(&self, instance: &str) {
        for _ in 0..100 {
            if self.is_master(instance) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("{instance} should be in master state");
    }

    async fn eventually_not_master(&self, instance: &str) {
        for _ in 0..100 {
            if !self.is_master(instance) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("{instance} should not be in master state");
    }
}

#[tokio::test]
async fn master_starts_refreshing_and_backup_stops() {
    let address: NetAddress = "10.10.1.1".parse().unwrap();
    let provider = FakeProvider::new();
    let cfg = NotifyConfig {
        managed_addresses: vec![address],
        refresh_interval: Duration::from_millis(100),
        refresh_timeout: Duration::from_secs(1),
        ..NotifyConfig::default()
    };

    let handler =
        floaty::fifo::notification_handler(Arc::new(provider.clone()), Arc::new(cfg));
    let fifo = FifoTest::start(handler);

    fifo.write("INSTANCE \"foo\" MASTER 100\n");

    let mut refreshed = false;
    for _ in 0..50 {
        if provider.refresh_count(&address) > 0 {
            refreshed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(refreshed, "not updating IP as master");

    fifo.write("INSTANCE \"foo\" BACKUP 100\n");

    // The refresh count must stop increasing once the run was replaced
    let mut last_count = provider.refresh_count(&address);
    let mut stopped = false;
    for _ in 0..10 {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let count = provider.refresh_count(&address);
        if count == last_count {
            stopped = true;
            break;
        }
        last_count = count;
    }
    assert!(stopped, "not stopping to update IP");
}

#[tokio::test]
async fn interleaved_instances_track_state_independently() {
    let log = HandlerLog::default();
    let fifo = FifoTest::start(log.handler());

    fifo.write("INSTANCE \"bar\" MASTER 100\n");
    fifo.write("INSTANCE \"foo\" MASTER 100\n");
    fifo.write("\n");
    fifo.write("INSTANCE \"bar\" BACKUP 100\n");
    log.eventually_master("foo").await;
    log.eventually_not_master("bar").await;

    fifo.write("INSTANCE \"foo\" FAULT 100\nINSTANCE \"bar\" FAULT 100\nINSTANCE \"bar\" MASTER 100\n");
    log.eventually_not_master("foo").await;
    log.eventually_master("bar").await;

    // Malformed lines must not disturb the state
    fifo.write("GROUP \"bar\" BACKUP 100\n");
    fifo.write("G s\"bar\" BACKUP 100\n");
    log.eventually_not_master("foo").await;
    log.eventually_master("bar").await;

    fifo.write("INSTANCE \"bar\" BACKUP 100\n");
    log.eventually_not_master("bar").await;
    fifo.write("INSTANCE \"foo\" MASTER 100\n");
    log.eventually_master("foo").await;
}

#[tokio::test]
async fn content_written_before_start_is_drained() {
    let log = HandlerLog::default();

    let pipe = TestPipe::default();
    let (tx, rx) = mpsc::unbounded_channel();
    let scope = CancellationToken::new();

    pipe.push("INSTANCE \"foo\" MASTER 100\n");
    pipe.push("INSTANCE \"foo\" FAULT 100\n");
    pipe.push("INSTANCE \"foo\" MASTER 100\n");
    pipe.push("INSTANCE \"bar\" FAULT 100\n");

    let mut handler = FifoHandler::new(pipe.clone(), rx, log.handler());
    let handler_scope = scope.clone();
    tokio::spawn(async move {
        handler
            .handle_fifo(&handler_scope)
            .await
            .expect("handler should not fail");
    });

    log.eventually_master("foo").await;
    log.eventually_not_master("bar").await;

    pipe.push("INSTANCE \"foo\" FAULT 100\n");
    tx.send(FifoEvent::Write).unwrap();
    log.eventually_not_master("foo").await;

    scope.cancel();
}

#[tokio::test]
async fn partial_lines_wait_for_their_newline() {
    let log = HandlerLog::default();
    let fifo = FifoTest::start(log.handler());

    fifo.write("INSTANCE \"foo\" MAS");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!log.is_master("foo"));

    fifo.write("TER 100\n");
    log.eventually_master("foo").await;
}

#[tokio::test]
async fn pipe_removal_fails_the_dispatcher() {
    let pipe = TestPipe::default();
    let (tx, rx) = mpsc::unbounded_channel();
    let scope = CancellationToken::new();

    let log = HandlerLog::default();
    let mut handler = FifoHandler::new(pipe, rx, log.handler());

    tx.send(FifoEvent::Removed).unwrap();

    let err = handler.handle_fifo(&scope).await.unwrap_err();
    assert!(err.to_string().contains("Named pipe was removed"));
}

#[tokio::test]
async fn cancellation_ends_the_dispatcher() {
    let pipe = TestPipe::default();
    let (_tx, rx) = mpsc::unbounded_channel();
    let scope = CancellationToken::new();
    scope.cancel();

    let log = HandlerLog::default();
    let mut handler = FifoHandler::new(pipe, rx, log.handler());

    handler.handle_fifo(&scope).await.unwrap();
}
