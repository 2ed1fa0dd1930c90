//! Long-lived dispatcher reading notifications from a named pipe.
//!
//! Keepalived writes one notification per line into the FIFO. The pipe is
//! opened non-blocking and drained whenever the file sees a write; an empty
//! pipe simply means "nothing more for now". Each notification replaces any
//! active run for its instance: the prior scope is cancelled before the new
//! one is created, so at most one engine exists per instance.

use crate::config::NotifyConfig;
use crate::notification::{Notification, VrrpState};
use crate::providers::Provider;
use crate::refresh::pin_elastic_ips;
use common::{Error, Result};
use notify::event::{EventKind, ModifyKind};
use notify::{RecursiveMode, Watcher};
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Events relevant to the dispatcher, distilled from filesystem events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FifoEvent {
    Write,
    Removed,
    WatchError(String),
}

/// Callback invoked for every accepted notification with its fresh scope.
pub type NotificationHandler = Box<dyn FnMut(CancellationToken, Notification) + Send>;

/// Open `path` read-only and non-blocking and watch it for writes.
///
/// The returned watcher must be kept alive for as long as events are
/// consumed.
pub fn open_fifo(
    path: &Path,
) -> Result<(
    File,
    mpsc::UnboundedReceiver<FifoEvent>,
    notify::RecommendedWatcher,
)> {
    let pipe = std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
        .map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => {
                Error::fifo(format!("Named pipe {} not found", path.display()))
            }
            std::io::ErrorKind::PermissionDenied => {
                Error::fifo(format!("Permission denied on named pipe {}", path.display()))
            }
            _ => Error::fifo(format!("Opening named pipe {}: {err}", path.display())),
        })?;

    let (tx, rx) = mpsc::unbounded_channel();

    let mut watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
        let event = match result {
            Ok(event) => event,
            Err(err) => {
                let _ = tx.send(FifoEvent::WatchError(err.to_string()));
                return;
            }
        };

        let mapped = match event.kind {
            EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_)) => FifoEvent::Removed,
            EventKind::Modify(_) => FifoEvent::Write,
            _ => return,
        };
        let _ = tx.send(mapped);
    })
    .map_err(|err| Error::fifo(format!("Creating pipe watcher: {err}")))?;

    watcher
        .watch(path, RecursiveMode::NonRecursive)
        .map_err(|err| Error::fifo(format!("Watching named pipe {}: {err}", path.display())))?;

    Ok((pipe, rx, watcher))
}

/// Reads notification lines from the pipe and drives per-instance runs.
pub struct FifoHandler<R> {
    pipe: R,
    events: mpsc::UnboundedReceiver<FifoEvent>,
    running: HashMap<String, CancellationToken>,
    handler: NotificationHandler,
    partial_line: Vec<u8>,
}

impl<R: Read> FifoHandler<R> {
    pub fn new(
        pipe: R,
        events: mpsc::UnboundedReceiver<FifoEvent>,
        handler: NotificationHandler,
    ) -> Self {
        Self {
            pipe,
            events,
            running: HashMap::new(),
            handler,
            partial_line: Vec::new(),
        }
    }

    /// Process notifications until the scope is cancelled.
    ///
    /// Returns an error when the pipe is removed or renamed, or when the
    /// watcher breaks; malformed notification lines are logged and skipped.
    pub async fn handle_fifo(&mut self, scope: &CancellationToken) -> Result<()> {
        // Drain content written before we started watching
        self.drain(scope);

        loop {
            tokio::select! {
                _ = scope.cancelled() => return Ok(()),

                event = self.events.recv() => {
                    debug!(event = ?event, "Got pipe event");
                    match event {
                        Some(FifoEvent::Write) => self.drain(scope),
                        Some(FifoEvent::Removed) => {
                            return Err(Error::fifo("Named pipe was removed. Quitting"));
                        }
                        Some(FifoEvent::WatchError(err)) => {
                            return Err(Error::fifo(format!("Watching named pipe: {err}")));
                        }
                        None => {
                            return Err(Error::fifo("Pipe event stream ended"));
                        }
                    }
                }
            }
        }
    }

    /// Read and dispatch every line currently available in the pipe.
    fn drain(&mut self, scope: &CancellationToken) {
        let mut chunk = [0u8; 4096];

        loop {
            match self.pipe.read(&mut chunk) {
                // EOF: no writer connected right now
                Ok(0) => break,
                Ok(n) => self.partial_line.extend_from_slice(&chunk[..n]),
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    error!("Failed to read from named pipe: {err}");
                    break;
                }
            }
        }

        while let Some(newline) = self.partial_line.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.partial_line.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1]).into_owned();
            debug!(line = %line, "Got line");

            match Notification::parse_line(&line) {
                Ok(notification) => self.dispatch(scope, notification),
                Err(err) => {
                    error!(
                        "Failed to parse fifo event from keepalived, keepalived might be \
                         incompatible with this floaty version: {err}"
                    );
                }
            }
        }
    }

    /// Cancel any active run for the instance, then start the new one.
    fn dispatch(&mut self, scope: &CancellationToken, notification: Notification) {
        if let Some(previous) = self.running.remove(&notification.instance) {
            previous.cancel();
        }

        let run_scope = scope.child_token();
        self.running
            .insert(notification.instance.clone(), run_scope.clone());

        (self.handler)(run_scope, notification);
    }
}

/// The production notification handler: resolve addresses and run the
/// refresh engine for MASTER transitions.
pub fn notification_handler(
    provider: Arc<dyn Provider>,
    cfg: Arc<NotifyConfig>,
) -> NotificationHandler {
    Box::new(move |scope, notification| {
        let provider = provider.clone();
        let cfg = cfg.clone();

        tokio::spawn(async move {
            info!(
                instance = %notification.instance,
                state = %notification.state,
                "Handle notification"
            );

            if let Err(err) =
                handle_notification(&scope, provider.as_ref(), &cfg, &notification).await
            {
                error!("Failed to handle notification: {err}");
            }
        });
    })
}

async fn handle_notification(
    scope: &CancellationToken,
    provider: &dyn Provider,
    cfg: &NotifyConfig,
    notification: &Notification,
) -> Result<()> {
    let addresses = cfg.resolve_addresses(&notification.instance)?;
    info!(instance = %notification.instance, count = addresses.len(), "IP addresses resolved");

    if notification.state == VrrpState::Master {
        return pin_elastic_ips(scope, provider, &addresses, cfg).await;
    }

    Ok(())
}
