//! Dialogs: one protocol round over a connection.
//!
//! A dialog lends the connection's writer to a background sender task that
//! drains a FIFO queue onto the stream. Sends enqueue and return at once;
//! receives block until a frame arrives, the time budget runs out, or the
//! sender reports a write failure.
//!
//! ```text
//!   caller ── send() ──> [queue] ──> sender task ──> stream
//!   caller <── recv() ─────────────────────────────── stream
//!                 ^
//!                 └── interrupted by sender failure (watch) or deadline
//! ```

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::connection::{BoxedWriter, Connection, ConnectionId};
use crate::error::{Result, SyncError};
use crate::wire::{write_frame, Frame, MessageCode, WireMessage};

type SenderOutcome = (BoxedWriter, Result<()>);

enum Wake {
    Frame(Result<Frame>),
    Deadline,
    SenderFailed,
}

/// Budgets too large for the clock end in thirty years instead.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// The instant `budget` from now.
pub(crate) fn deadline_after(budget: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(budget).unwrap_or_else(|| now + FAR_FUTURE)
}

/// An open protocol round.
pub struct Dialog<'c> {
    conn: &'c mut Connection,
    outgoing: Option<mpsc::UnboundedSender<Frame>>,
    sender: Option<JoinHandle<SenderOutcome>>,
    failure: watch::Receiver<Option<String>>,
    deadline: Instant,
    peer_version: u16,
}

impl<'c> Dialog<'c> {
    /// Open a dialog, spawning its sender task.
    pub fn open(conn: &'c mut Connection, budget: Duration, peer_version: u16) -> Result<Self> {
        let writer = conn.take_writer()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let (failure_tx, failure_rx) = watch::channel(None);
        let sender = tokio::spawn(run_sender(writer, rx, failure_tx));
        Ok(Self {
            conn,
            outgoing: Some(tx),
            sender: Some(sender),
            failure: failure_rx,
            deadline: deadline_after(budget),
            peer_version,
        })
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.conn.id()
    }

    pub fn peer_version(&self) -> u16 {
        self.peer_version
    }

    /// Time left before receives fail with a timeout.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Restart the budget from now.
    pub fn extend(&mut self, budget: Duration) {
        self.deadline = deadline_after(budget);
    }

    /// Whether the peer's protocol version understands `T`.
    pub fn supports<T: WireMessage>(&self) -> bool {
        self.peer_version >= T::REQUIRED_VERSION
    }

    /// Queue a message.
    pub fn send<T: WireMessage>(&self, message: &T) -> Result<()> {
        if !self.supports::<T>() {
            return Err(SyncError::UnsupportedByPeer {
                message: T::NAME,
                required: T::REQUIRED_VERSION,
                peer: self.peer_version,
            });
        }
        self.send_frame(message.to_frame()?)
    }

    /// Queue a raw frame.
    pub fn send_frame(&self, frame: Frame) -> Result<()> {
        let outgoing = self
            .outgoing
            .as_ref()
            .ok_or_else(|| SyncError::Internal("dialog already closed".into()))?;
        outgoing.send(frame).map_err(|_| self.sender_failure())
    }

    /// Receive the next frame, whatever its code.
    pub async fn recv_frame(&mut self) -> Result<Frame> {
        if self.failure.borrow().is_some() {
            return Err(self.sender_failure());
        }
        let mut failure = self.failure.clone();
        let deadline = self.deadline;
        let wake = tokio::select! {
            frame = self.conn.read_frame() => Wake::Frame(frame),
            _ = tokio::time::sleep_until(deadline) => Wake::Deadline,
            Ok(()) = failure.changed() => Wake::SenderFailed,
        };
        match wake {
            Wake::Frame(frame) => frame,
            Wake::Deadline => Err(SyncError::Timeout("dialog time budget exhausted".into())),
            Wake::SenderFailed => Err(self.sender_failure()),
        }
    }

    /// Receive the next frame and require it to be a `T`.
    pub async fn recv<T: WireMessage>(&mut self) -> Result<T> {
        let frame = self.recv_frame().await?;
        T::from_frame(&frame)
    }

    /// Discard frames until a `T` arrives.
    ///
    /// Used where a more capable peer may interleave messages this side does
    /// not expect. Skipped frames are never decoded.
    pub async fn skip_to<T: WireMessage>(&mut self) -> Result<T> {
        loop {
            let frame = self.recv_frame().await?;
            if frame.code == T::CODE.to_u16() {
                return T::from_frame(&frame);
            }
            tracing::debug!(
                conn = %self.conn.id(),
                code = frame.code,
                known = MessageCode::from_u16(frame.code).is_some(),
                len = frame.body.len(),
                "skipping message while waiting for {}",
                T::NAME
            );
        }
    }

    /// Drain the queue, join the sender and hand the writer back.
    pub async fn close(mut self) -> Result<()> {
        self.outgoing.take();
        let Some(sender) = self.sender.take() else {
            return Ok(());
        };
        match sender.await {
            Ok((writer, result)) => {
                self.conn.restore_writer(writer);
                result
            }
            Err(e) => Err(SyncError::Internal(format!("dialog sender task failed: {e}"))),
        }
    }

    fn sender_failure(&self) -> SyncError {
        let reason = self
            .failure
            .borrow()
            .clone()
            .unwrap_or_else(|| "sender stopped".to_string());
        SyncError::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, reason))
    }
}

impl Drop for Dialog<'_> {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.take() {
            sender.abort();
        }
    }
}

async fn run_sender(
    mut writer: BoxedWriter,
    mut queue: mpsc::UnboundedReceiver<Frame>,
    failure: watch::Sender<Option<String>>,
) -> SenderOutcome {
    while let Some(frame) = queue.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame).await {
            let _ = failure.send(Some(e.to_string()));
            return (writer, Err(e));
        }
    }
    (writer, Ok(()))
}

/// The work done inside one dialog.
#[async_trait]
pub trait DialogBody: Send {
    type Output: Send;

    async fn run(&mut self, dialog: &mut Dialog<'_>) -> Result<Self::Output>;
}

/// Open a dialog, run `body`, and close the dialog on every exit path.
///
/// A body error takes precedence over a close error.
pub async fn run_dialog<B: DialogBody>(
    conn: &mut Connection,
    budget: Duration,
    peer_version: u16,
    body: &mut B,
) -> Result<B::Output> {
    let mut dialog = Dialog::open(conn, budget, peer_version)?;
    let result = body.run(&mut dialog).await;
    let closed = dialog.close().await;
    let output = result?;
    closed?;
    Ok(output)
}
