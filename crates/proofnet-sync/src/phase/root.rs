//! Root phase: agree on the sub-root, then run it.

use std::sync::Arc;

use async_trait::async_trait;

use proofnet_core::{DeferredMessage, SignatureRequest};
use proofnet_store::{Change, Transaction};

use crate::connection::Connection;
use crate::context::SyncContext;
use crate::deferred::{receive_deferred, send_deferred, DeferredOutcome};
use crate::dialog::{run_dialog, Dialog, DialogBody};
use crate::error::{Result, SyncError};
use crate::persistent::{run_persistent, PersistentBody};
use crate::phase::statement::StatementPhase;
use crate::phase::{SessionIntent, SessionOutcome, SubRootType};
use crate::salutation::{Gender, PeerInfo};
use crate::subscription::ConnectionState;
use crate::wire::{SignatureRequestOffer, SignatureRequestResult, SubRootRequest, SubRootResponse};

/// The phase that owns a freshly saluted connection.
pub struct RootPhase<'a> {
    ctx: &'a SyncContext,
    conn: &'a mut Connection,
    peer: PeerInfo,
}

impl<'a> RootPhase<'a> {
    pub fn new(ctx: &'a SyncContext, conn: &'a mut Connection, peer: PeerInfo) -> Self {
        Self { ctx, conn, peer }
    }

    /// Select the sub-root and run it. The dialer passes its intent; the
    /// acceptor passes `None` and serves whatever the dialer asks for.
    pub async fn run(
        self,
        intent: Option<SessionIntent>,
        state: &Arc<ConnectionState>,
    ) -> Result<SessionOutcome> {
        let budget = self.ctx.config().dialog_budget();
        let mut selection = SubRootSelection {
            ctx: self.ctx,
            peer: self.peer,
            proposal: intent.as_ref().map(SessionIntent::kind),
        };
        let (kind, accepted) = run_dialog(self.conn, budget, self.peer.version, &mut selection).await?;
        tracing::info!(conn = %self.conn.id(), sub_root = kind.name(), accepted, "sub-root selected");
        if !accepted {
            return Ok(SessionOutcome::Refused(kind));
        }

        match (kind, intent) {
            (SubRootType::Statement, _) => {
                let report = StatementPhase::new(self.ctx, self.conn, self.peer, Arc::clone(state))
                    .run()
                    .await?;
                Ok(SessionOutcome::Statement(report))
            }
            (SubRootType::DeferredMessage, Some(SessionIntent::Deferred(message))) => {
                let mut body = DeferredSender { message };
                let outcome = run_persistent(self.ctx, self.conn, &self.peer, &mut body).await?;
                Ok(SessionOutcome::Deferred {
                    message: body.message,
                    outcome,
                })
            }
            (SubRootType::DeferredMessage, None) => {
                let mut body = DeferredReceiver { ctx: self.ctx };
                let (message, outcome) = run_persistent(self.ctx, self.conn, &self.peer, &mut body).await?;
                Ok(SessionOutcome::Deferred { message, outcome })
            }
            (SubRootType::SignatureRequest, Some(SessionIntent::SignatureRequest(request))) => {
                let mut body = SignatureRequestSender { request };
                let accepted = run_persistent(self.ctx, self.conn, &self.peer, &mut body).await?;
                Ok(SessionOutcome::SignatureRequest {
                    request: body.request,
                    accepted,
                })
            }
            (SubRootType::SignatureRequest, None) => {
                let mut body = SignatureRequestReceiver { ctx: self.ctx };
                let (request, accepted) = run_persistent(self.ctx, self.conn, &self.peer, &mut body).await?;
                Ok(SessionOutcome::SignatureRequest { request, accepted })
            }
            (kind, _) => Err(SyncError::Internal(format!(
                "sub-root {} selected without a matching intent",
                kind.name()
            ))),
        }
    }
}

/// Male proposes, female accepts or refuses.
struct SubRootSelection<'a> {
    ctx: &'a SyncContext,
    peer: PeerInfo,
    proposal: Option<SubRootType>,
}

#[async_trait]
impl DialogBody for SubRootSelection<'_> {
    type Output = (SubRootType, bool);

    async fn run(&mut self, dialog: &mut Dialog<'_>) -> Result<(SubRootType, bool)> {
        match (self.peer.gender, self.proposal) {
            (Gender::Male, Some(kind)) => {
                if kind.required_version() > self.peer.version {
                    return Err(SyncError::UnsupportedByPeer {
                        message: kind.name(),
                        required: kind.required_version(),
                        peer: self.peer.version,
                    });
                }
                dialog.send(&SubRootRequest { kind })?;
                let response = dialog.recv::<SubRootResponse>().await?;
                Ok((kind, response.accepted))
            }
            (Gender::Female, None) => {
                let kind = dialog.recv::<SubRootRequest>().await?.kind;
                let accepted =
                    self.ctx.config().accepts(kind) && kind.required_version() <= self.peer.version;
                dialog.send(&SubRootResponse { accepted })?;
                Ok((kind, accepted))
            }
            (gender, _) => Err(SyncError::Internal(format!(
                "{gender:?} end cannot {} a sub-root",
                if gender == Gender::Male { "serve" } else { "request" }
            ))),
        }
    }
}

struct DeferredSender {
    message: DeferredMessage,
}

#[async_trait]
impl PersistentBody for DeferredSender {
    type Output = DeferredOutcome;

    async fn run(&mut self, dialog: &mut Dialog<'_>, _txn: &mut Transaction) -> Result<DeferredOutcome> {
        send_deferred(dialog, &self.message).await
    }
}

struct DeferredReceiver<'a> {
    ctx: &'a SyncContext,
}

#[async_trait]
impl PersistentBody for DeferredReceiver<'_> {
    type Output = (DeferredMessage, DeferredOutcome);

    async fn run(
        &mut self,
        dialog: &mut Dialog<'_>,
        txn: &mut Transaction,
    ) -> Result<(DeferredMessage, DeferredOutcome)> {
        receive_deferred(self.ctx, dialog, txn).await
    }
}

struct SignatureRequestSender {
    request: SignatureRequest,
}

#[async_trait]
impl PersistentBody for SignatureRequestSender {
    type Output = bool;

    async fn run(&mut self, dialog: &mut Dialog<'_>, _txn: &mut Transaction) -> Result<bool> {
        dialog.send(&SignatureRequestOffer {
            request: self.request.clone(),
        })?;
        Ok(dialog.recv::<SignatureRequestResult>().await?.accepted)
    }
}

struct SignatureRequestReceiver<'a> {
    ctx: &'a SyncContext,
}

#[async_trait]
impl PersistentBody for SignatureRequestReceiver<'_> {
    type Output = (SignatureRequest, bool);

    async fn run(
        &mut self,
        dialog: &mut Dialog<'_>,
        txn: &mut Transaction,
    ) -> Result<(SignatureRequest, bool)> {
        let request = dialog.recv::<SignatureRequestOffer>().await?.request;
        let store = self.ctx.store();

        let mut accepted = store.signature_request(txn, &request.uuid).await?.is_none()
            && store.has_statement(txn, &request.context).await?;
        for statement in &request.statements {
            if !accepted {
                break;
            }
            accepted = store.has_statement(txn, statement).await?;
        }
        if accepted {
            txn.stage(Change::PutSignatureRequest(request.clone()));
        }
        tracing::debug!(
            conn = %dialog.connection_id(),
            request = %request.uuid,
            accepted,
            "signature request received"
        );
        dialog.send(&SignatureRequestResult { accepted })?;
        Ok((request, accepted))
    }
}
