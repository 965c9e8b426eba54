//! Symmetric selection: two peers agree on one value without a leader.
//!
//! Either side may propose. A side with nothing to propose waits; when a
//! proposal arrives it acknowledges it and both sides move on with that
//! value.
//!
//! When both sides propose at once, each sees the other's proposal instead
//! of an acknowledgement. Every proposal carries a fresh random resolver
//! bit; if the bits differ, the proposal with the bit set wins. If they are
//! equal, both sides propose again with fresh bits. The outcome does not
//! depend on which side dialed.

use std::fmt::Debug;
use std::time::Duration;

use crate::dialog::{deadline_after, Dialog};
use crate::error::{Result, SyncError};
use crate::subscription::CommandQueue;
use crate::wire::{Frame, SelectionAck, SelectionRequest, WireMessage};

/// A value two peers can select with [`select`].
pub trait SelectionValue: Copy + Eq + Debug + Send + Sync + 'static {
    fn code(self) -> u16;

    fn from_code(code: u16) -> Option<Self>;

    fn name(self) -> &'static str;

    /// Lowest protocol version that can run this value.
    fn required_version(self) -> u16 {
        1
    }
}

/// Outcome of two colliding proposals, seen from one side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Mine,
    Theirs,
    Retry,
}

/// Decide between two colliding proposals from their resolver bits.
///
/// Mirrored calls agree: `resolve(a, b)` is `Mine` exactly when
/// `resolve(b, a)` is `Theirs`.
pub fn resolve(mine: bool, theirs: bool) -> Resolution {
    match (mine, theirs) {
        (true, false) => Resolution::Mine,
        (false, true) => Resolution::Theirs,
        _ => Resolution::Retry,
    }
}

enum Wake {
    Queued,
    Incoming(Result<Frame>),
    Idle,
}

/// Agree with the peer on the next value.
///
/// With a non-empty `queue` this side proposes its head. Otherwise it waits
/// for a proposal from the peer, for something to be queued locally, or for
/// `idle` to pass, after which it proposes `on_idle`. The selected value is
/// removed from `queue` if queued.
pub async fn select<V: SelectionValue>(
    dialog: &mut Dialog<'_>,
    queue: &CommandQueue<V>,
    idle: Duration,
    on_idle: V,
) -> Result<V> {
    let idle_at = deadline_after(idle);
    let proposal = loop {
        if let Some(head) = queue.peek() {
            break head;
        }
        let wake = tokio::select! {
            _ = queue.notified() => Wake::Queued,
            frame = dialog.recv_frame() => Wake::Incoming(frame),
            _ = tokio::time::sleep_until(idle_at) => Wake::Idle,
        };
        match wake {
            Wake::Queued => continue,
            Wake::Idle => break on_idle,
            Wake::Incoming(frame) => {
                let request = SelectionRequest::from_frame(&frame?)?;
                let value = decode::<V>(dialog, request.value)?;
                dialog.send(&SelectionAck { value: request.value })?;
                queue.remove(value);
                tracing::trace!(conn = %dialog.connection_id(), ?value, "accepted peer proposal");
                return Ok(value);
            }
        }
    };
    propose(dialog, queue, proposal).await
}

async fn propose<V: SelectionValue>(
    dialog: &mut Dialog<'_>,
    queue: &CommandQueue<V>,
    mine: V,
) -> Result<V> {
    let mut collisions = 0u32;
    loop {
        let resolver = rand::random::<bool>();
        dialog.send(&SelectionRequest {
            value: mine.code(),
            resolver,
        })?;

        let frame = dialog.recv_frame().await?;
        if let Ok(ack) = SelectionAck::from_frame(&frame) {
            if ack.value != mine.code() {
                return Err(SyncError::InvalidMessage(format!(
                    "selection acknowledged {} instead of {}",
                    ack.value,
                    mine.code()
                )));
            }
            queue.remove(mine);
            return Ok(mine);
        }

        let theirs = SelectionRequest::from_frame(&frame)?;
        let their_value = decode::<V>(dialog, theirs.value)?;
        match resolve(resolver, theirs.resolver) {
            Resolution::Mine => {
                queue.remove(mine);
                return Ok(mine);
            }
            Resolution::Theirs => {
                queue.remove(their_value);
                return Ok(their_value);
            }
            Resolution::Retry => {
                collisions += 1;
                tracing::trace!(conn = %dialog.connection_id(), collisions, "selection collision");
            }
        }
    }
}

/// A value proposed by the peer, refused if the negotiated version cannot
/// run it.
fn decode<V: SelectionValue>(dialog: &Dialog<'_>, code: u16) -> Result<V> {
    let value = V::from_code(code)
        .ok_or_else(|| SyncError::InvalidMessage(format!("unknown selection value {code}")))?;
    let required = value.required_version();
    if required > dialog.peer_version() {
        return Err(SyncError::UnsupportedByPeer {
            message: value.name(),
            required,
            peer: dialog.peer_version(),
        });
    }
    Ok(value)
}
