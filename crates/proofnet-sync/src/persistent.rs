//! Persistent dialogs: dialogs that write to the local store.
//!
//! Order of events, on every exit path:
//!
//! 1. open the dialog and run the lock handshake
//! 2. begin a transaction tagged with the connection id
//! 3. run the body
//! 4. close the dialog (drain and join the sender)
//! 5. commit or abort
//! 6. release the lock
//!
//! The transaction commits when the body succeeded. A stream fault while
//! closing still commits, because the body already finished its protocol
//! work; the fault is reported afterwards.

use async_trait::async_trait;

use proofnet_store::Transaction;

use crate::connection::Connection;
use crate::context::SyncContext;
use crate::dialog::Dialog;
use crate::error::Result;
use crate::lock::acquire_distributed;
use crate::salutation::PeerInfo;

/// The work done inside one persistent dialog.
#[async_trait]
pub trait PersistentBody: Send {
    type Output: Send;

    async fn run(&mut self, dialog: &mut Dialog<'_>, txn: &mut Transaction) -> Result<Self::Output>;
}

/// Run `body` under the distributed lock and a fresh transaction.
pub async fn run_persistent<B: PersistentBody>(
    ctx: &SyncContext,
    conn: &mut Connection,
    peer: &PeerInfo,
    body: &mut B,
) -> Result<B::Output> {
    let budget = ctx.config().dialog_budget();
    let conn_id = conn.id();
    let mut dialog = Dialog::open(conn, budget, peer.version)?;

    let guard = match acquire_distributed(&mut dialog, peer.gender, ctx.lock(), &ctx.config().lock)
        .await
    {
        Ok(guard) => guard,
        Err(e) => {
            let _ = dialog.close().await;
            return Err(e);
        }
    };
    dialog.extend(budget);

    let mut txn = match ctx.store().begin(Some(conn_id.0)).await {
        Ok(txn) => txn,
        Err(e) => {
            let _ = dialog.close().await;
            return Err(e.into());
        }
    };

    let result = body.run(&mut dialog, &mut txn).await;
    let closed = dialog.close().await;

    let outcome = match (result, closed) {
        (Ok(output), Ok(())) => ctx.store().commit(txn).await.map(|_| output).map_err(Into::into),
        (Ok(_), Err(fault)) if fault.is_stream() => {
            tracing::debug!(conn = %conn_id, error = %fault, "stream fault after completed round, committing");
            match ctx.store().commit(txn).await {
                Ok(_) => Err(fault),
                Err(e) => Err(e.into()),
            }
        }
        (Ok(_), Err(e)) | (Err(e), _) => {
            tracing::debug!(conn = %conn_id, error = %e, "aborting round");
            ctx.store().abort(txn).await;
            Err(e)
        }
    };

    drop(guard);
    outcome
}
