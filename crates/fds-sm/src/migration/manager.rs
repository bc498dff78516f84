//! Drives SM token migrations from DLT changes and peer messages
//!
//! A node gaining a token runs a receiver against the token's old primary;
//! the old primary runs a sender when the receiver's sync start arrives.
//! Both state machines are pure; this module owns their contexts, turns
//! effects into object store calls and outgoing messages, and sends those
//! messages only after the context lock is released.

use super::messages::{SmMigrationMsg, SmMigrationTransport, SyncPhase};
use super::receiver::{self, ReceiverEffect, ReceiverEvent, ReceiverState};
use super::sender::{self, SenderEffect, SenderEvent, SenderState};
use crate::meta::ObjMetaData;
use crate::object_store::ObjectStore;
use fds_common::config::MigrationConfig;
use fds_common::{
    Error, MigrationSeqNumReceiver, NodeUuid, ObjectId, Result, SmTokenId, now_millis,
};
use fds_placement::{Dlt, DltManager};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

type Outgoing = (NodeUuid, SmMigrationMsg);

struct DeferredBatch {
    seq: u64,
    last: bool,
    entries: Vec<Vec<u8>>,
}

struct ReceiverCtx {
    token: SmTokenId,
    source: NodeUuid,
    dlt_version: u64,
    state: ReceiverState,
    end_time: u64,
    static_seq: MigrationSeqNumReceiver,
    delta_seq: MigrationSeqNumReceiver,
    /// Delta batches that overtook the end of the static copy
    deferred: Vec<DeferredBatch>,
    /// Merged objects still lacking bytes
    missing: BTreeSet<ObjectId>,
    abort_reason: String,
}

struct SenderCtx {
    token: SmTokenId,
    dest: NodeUuid,
    dlt_version: u64,
    state: SenderState,
    end_time: u64,
    pull: Vec<ObjectId>,
    abort_reason: String,
}

/// SM token migration manager
pub struct TokenMigrationMgr {
    node: NodeUuid,
    store: Arc<ObjectStore>,
    dlt: Arc<DltManager>,
    transport: Arc<dyn SmMigrationTransport>,
    config: MigrationConfig,
    receivers: Mutex<HashMap<SmTokenId, Arc<Mutex<ReceiverCtx>>>>,
    senders: Mutex<HashMap<SmTokenId, Arc<Mutex<SenderCtx>>>>,
}

impl TokenMigrationMgr {
    pub fn new(
        node: NodeUuid,
        store: Arc<ObjectStore>,
        dlt: Arc<DltManager>,
        transport: Arc<dyn SmMigrationTransport>,
        config: MigrationConfig,
    ) -> Self {
        Self {
            node,
            store,
            dlt,
            transport,
            config,
            receivers: Mutex::new(HashMap::new()),
            senders: Mutex::new(HashMap::new()),
        }
    }

    pub const fn node(&self) -> NodeUuid {
        self.node
    }

    /// Install a new DLT and start or abort migrations accordingly
    pub fn on_dlt_update(&self, dlt: Dlt) -> Result<()> {
        let (old, new) = self.dlt.update(dlt)?;
        let version = new.version();

        let mut restart = BTreeMap::new();
        let receivers: Vec<_> = self.receivers.lock().values().cloned().collect();
        for ctx in receivers {
            let (token, source, out) = {
                let mut ctx = ctx.lock();
                if ctx.state.is_terminal() || ctx.dlt_version >= version {
                    continue;
                }
                ctx.abort_reason = format!("DLT version {version} superseded {}", ctx.dlt_version);
                let out =
                    self.drive_receiver(&mut ctx, ReceiverEvent::Abort { notify_peer: true })?;
                (ctx.token, ctx.source, out)
            };
            self.send_all(out);
            if new.get_nodes(token).contains(&self.node) {
                restart.insert(token, source);
            }
        }
        let senders: Vec<_> = self.senders.lock().values().cloned().collect();
        for ctx in senders {
            let out = {
                let mut ctx = ctx.lock();
                if ctx.state.is_terminal() || ctx.dlt_version >= version {
                    continue;
                }
                ctx.abort_reason = format!("DLT version {version} superseded {}", ctx.dlt_version);
                self.drive_sender(&mut ctx, SenderEvent::Abort { notify_peer: true })?
            };
            self.send_all(out);
        }

        let Some(old) = old else {
            info!("Initial DLT version {}, no tokens to migrate", version);
            return Ok(());
        };
        let mut gained = new.tokens_gained(&old, self.node)?;
        for (token, source) in restart {
            gained.entry(token).or_insert(source);
        }
        for (token, dest) in new.tokens_lost(&old, self.node)? {
            info!("Token {} moves to {} in DLT {}", token, dest, version);
        }
        for (token, source) in gained {
            self.start_receiver(token, source, version);
        }
        Ok(())
    }

    fn start_receiver(&self, token: SmTokenId, source: NodeUuid, dlt_version: u64) {
        self.store.set_token_unavailable(token);
        let mut ctx = ReceiverCtx {
            token,
            source,
            dlt_version,
            state: ReceiverState::Init,
            end_time: now_millis(),
            static_seq: MigrationSeqNumReceiver::new(),
            delta_seq: MigrationSeqNumReceiver::new(),
            deferred: Vec::new(),
            missing: BTreeSet::new(),
            abort_reason: String::new(),
        };
        info!("Migrating token {} from {} (DLT {})", token, source, dlt_version);
        let out = match self.drive_receiver(&mut ctx, ReceiverEvent::Start) {
            Ok(out) => out,
            Err(e) => {
                error!("Token {} receiver failed to start: {}", token, e);
                return;
            }
        };
        self.receivers.lock().insert(token, Arc::new(Mutex::new(ctx)));
        self.send_all(out);
    }

    /// Handle a message from peer `from`
    pub fn handle_message(&self, from: NodeUuid, msg: SmMigrationMsg) -> Result<()> {
        let current = self.dlt.version();
        if msg.dlt_version() < current {
            warn!(
                "Ignoring stale {} for token {} from {} (DLT {} < {})",
                msg.kind(),
                msg.token(),
                from,
                msg.dlt_version(),
                current
            );
            return Ok(());
        }
        debug!("{} for token {} from {}", msg.kind(), msg.token(), from);
        match msg {
            SmMigrationMsg::SyncStart {
                token,
                dlt_version,
                end_time,
                ..
            } => self.on_sync_start(from, token, dlt_version, end_time),
            SmMigrationMsg::MetadataBatch {
                token,
                dlt_version,
                phase,
                seq,
                last,
                entries,
            } => self.with_receiver(from, token, dlt_version, |ctx| {
                self.on_metadata_batch(ctx, phase, DeferredBatch { seq, last, entries })
            }),
            SmMigrationMsg::PushObjects {
                token,
                dlt_version,
                objects,
                not_found,
            } => self.with_receiver(from, token, dlt_version, |ctx| {
                let mut count = 0;
                for (oid, data) in objects {
                    self.store.put_migrated_object(&oid, &data)?;
                    count += usize::from(ctx.missing.remove(&oid));
                }
                for oid in not_found {
                    warn!("Token {} source no longer holds {}", ctx.token, oid);
                    count += usize::from(ctx.missing.remove(&oid));
                }
                self.drive_receiver(ctx, ReceiverEvent::ObjectsPushed { count })
            }),
            SmMigrationMsg::PullRequest {
                token,
                dlt_version,
                oids,
                ..
            } => self.with_sender(from, token, dlt_version, |ctx| {
                ctx.pull = oids;
                self.drive_sender(ctx, SenderEvent::PullRequest)
            }),
            SmMigrationMsg::PullComplete { token, dlt_version } => {
                self.with_sender(from, token, dlt_version, |ctx| {
                    self.drive_sender(ctx, SenderEvent::PullComplete)
                })
            }
            SmMigrationMsg::SyncComplete { token, dlt_version } => {
                self.with_sender(from, token, dlt_version, |ctx| {
                    self.drive_sender(ctx, SenderEvent::SyncComplete)
                })
            }
            SmMigrationMsg::Abort { token, reason, .. } => {
                warn!("Peer {} aborted migration of token {}: {}", from, token, reason);
                self.abort_from_peer(from, token);
                Ok(())
            }
        }
    }

    fn on_sync_start(
        &self,
        from: NodeUuid,
        token: SmTokenId,
        dlt_version: u64,
        end_time: u64,
    ) -> Result<()> {
        if let Some(old) = self.senders.lock().get(&token).cloned() {
            let mut old = old.lock();
            if !old.state.is_terminal() {
                old.abort_reason = format!("superseded by a new sync from {from}");
                self.drive_sender(&mut old, SenderEvent::Abort { notify_peer: false })?;
            }
        }
        let ctx = Arc::new(Mutex::new(SenderCtx {
            token,
            dest: from,
            dlt_version,
            state: SenderState::Idle,
            end_time,
            pull: Vec::new(),
            abort_reason: String::new(),
        }));
        self.senders.lock().insert(token, Arc::clone(&ctx));
        info!("Sending token {} to {} (DLT {})", token, from, dlt_version);
        let out = {
            let mut ctx = ctx.lock();
            match self.drive_sender(&mut ctx, SenderEvent::SyncStart) {
                Ok(out) => out,
                Err(e) => {
                    ctx.abort_reason = e.to_string();
                    let out =
                        self.drive_sender(&mut ctx, SenderEvent::Abort { notify_peer: true })?;
                    drop(ctx);
                    self.send_all(out);
                    return Err(e);
                }
            }
        };
        self.send_all(out);
        Ok(())
    }

    fn on_metadata_batch(
        &self,
        ctx: &mut ReceiverCtx,
        phase: SyncPhase,
        batch: DeferredBatch,
    ) -> Result<Vec<Outgoing>> {
        match phase {
            SyncPhase::Static => {
                self.merge_entries(ctx, &batch.entries)?;
                let complete = ctx.static_seq.set_seq_num(batch.seq, batch.last);
                let mut out = self.drive_receiver(ctx, ReceiverEvent::StaticBatch { complete })?;
                if ctx.state == ReceiverState::DeltaSync {
                    for deferred in std::mem::take(&mut ctx.deferred) {
                        out.extend(self.apply_delta(ctx, deferred)?);
                    }
                }
                Ok(out)
            }
            SyncPhase::Delta if ctx.state == ReceiverState::DeltaSync => {
                self.apply_delta(ctx, batch)
            }
            SyncPhase::Delta => {
                debug!("Token {} defers delta batch {}", ctx.token, batch.seq);
                ctx.deferred.push(batch);
                Ok(Vec::new())
            }
        }
    }

    fn apply_delta(&self, ctx: &mut ReceiverCtx, batch: DeferredBatch) -> Result<Vec<Outgoing>> {
        if ctx.state != ReceiverState::DeltaSync {
            return Ok(Vec::new());
        }
        self.merge_entries(ctx, &batch.entries)?;
        let complete = ctx.delta_seq.set_seq_num(batch.seq, batch.last);
        let mut missing = 0;
        if complete {
            let store = &self.store;
            ctx.missing.retain(|oid| {
                store
                    .get_meta(oid)
                    .ok()
                    .flatten()
                    .is_some_and(|m| !m.is_deleted() && m.read_tier().is_none())
            });
            missing = ctx.missing.len();
        }
        self.drive_receiver(ctx, ReceiverEvent::DeltaBatch { complete, missing })
    }

    fn merge_entries(&self, ctx: &mut ReceiverCtx, entries: &[Vec<u8>]) -> Result<()> {
        for raw in entries {
            let meta = ObjMetaData::unmarshall(raw)?;
            let oid = *meta.oid();
            if self.store.token_of(&oid) != ctx.token {
                return Err(Error::invalid_argument(format!(
                    "{oid} does not belong to token {}",
                    ctx.token
                )));
            }
            if self.store.merge_migrated_meta(&meta)? {
                ctx.missing.insert(oid);
            }
        }
        Ok(())
    }

    /// Run a receiver event and carry out its effects
    fn drive_receiver(&self, ctx: &mut ReceiverCtx, event: ReceiverEvent) -> Result<Vec<Outgoing>> {
        let (next, effects) = receiver::transition(&ctx.state, event)?;
        if next != ctx.state {
            info!("Token {} receiver {} -> {}", ctx.token, ctx.state, next);
        }
        ctx.state = next;
        let (token, dlt_version, to) = (ctx.token, ctx.dlt_version, ctx.source);
        let mut out = Vec::new();
        for effect in effects {
            match effect {
                ReceiverEffect::SendSyncStart => out.push((
                    to,
                    SmMigrationMsg::SyncStart {
                        token,
                        dlt_version,
                        start_time: 0,
                        end_time: ctx.end_time,
                    },
                )),
                ReceiverEffect::SendPullRequests => {
                    let oids: Vec<_> = ctx.missing.iter().copied().collect();
                    let batch = self.config.sm_pull_batch_objects.max(1);
                    let chunks: Vec<_> = oids.chunks(batch).collect();
                    for (i, chunk) in chunks.iter().enumerate() {
                        out.push((
                            to,
                            SmMigrationMsg::PullRequest {
                                token,
                                dlt_version,
                                oids: chunk.to_vec(),
                                last: i + 1 == chunks.len(),
                            },
                        ));
                    }
                    info!("Token {} pulling {} objects from {}", token, oids.len(), to);
                }
                ReceiverEffect::NotifyPullComplete => {
                    out.push((to, SmMigrationMsg::PullComplete { token, dlt_version }));
                }
                ReceiverEffect::NotifySyncComplete => {
                    out.push((to, SmMigrationMsg::SyncComplete { token, dlt_version }));
                }
                ReceiverEffect::ActivateToken => {
                    self.store.set_token_available(token);
                    info!("Token {} is now served by {}", token, self.node);
                }
                ReceiverEffect::NotifyPeerAbort => out.push((
                    to,
                    SmMigrationMsg::Abort {
                        token,
                        dlt_version,
                        reason: ctx.abort_reason.clone(),
                    },
                )),
                ReceiverEffect::ReleaseToken => {
                    // Partially copied tokens we still own stay closed to reads
                    let still_ours = self
                        .dlt
                        .current()
                        .is_some_and(|d| d.get_nodes(token).contains(&self.node));
                    if !still_ours {
                        self.store.set_token_available(token);
                    }
                    warn!("Token {} receiver aborted: {}", token, ctx.abort_reason);
                }
            }
        }
        Ok(out)
    }

    /// Run a sender event, and the follow-up events its effects produce
    fn drive_sender(&self, ctx: &mut SenderCtx, event: SenderEvent) -> Result<Vec<Outgoing>> {
        let mut out = Vec::new();
        let mut events = VecDeque::from([event]);
        while let Some(event) = events.pop_front() {
            let (next, effects) = sender::transition(&ctx.state, event)?;
            if next != ctx.state {
                info!("Token {} sender {} -> {}", ctx.token, ctx.state, next);
            }
            ctx.state = next;
            for effect in effects {
                match effect {
                    SenderEffect::SendStaticBatches => {
                        let metas: Vec<_> = self
                            .store
                            .snapshot_token(ctx.token)?
                            .into_iter()
                            .filter(|m| m.mod_time() <= ctx.end_time)
                            .collect();
                        out.extend(self.metadata_batches(ctx, SyncPhase::Static, &metas));
                        events.push_back(SenderEvent::StaticSent);
                    }
                    SenderEffect::SendDeltaBatches => {
                        // Let in-flight mutations land before the delta scan
                        self.store.locks().barrier();
                        let metas = self
                            .store
                            .snapshot_token_since(ctx.token, ctx.end_time.saturating_add(1))?;
                        out.extend(self.metadata_batches(ctx, SyncPhase::Delta, &metas));
                        events.push_back(SenderEvent::DeltaSent);
                    }
                    SenderEffect::ServePull => {
                        let oids = std::mem::take(&mut ctx.pull);
                        out.extend(self.push_batches(ctx, oids)?);
                    }
                    SenderEffect::NotifyPeerAbort => out.push((
                        ctx.dest,
                        SmMigrationMsg::Abort {
                            token: ctx.token,
                            dlt_version: ctx.dlt_version,
                            reason: ctx.abort_reason.clone(),
                        },
                    )),
                    SenderEffect::Finish => {
                        if ctx.state == SenderState::Aborted {
                            warn!("Token {} sender aborted: {}", ctx.token, ctx.abort_reason);
                        } else {
                            info!("Token {} handed over to {}", ctx.token, ctx.dest);
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    fn metadata_batches(
        &self,
        ctx: &SenderCtx,
        phase: SyncPhase,
        metas: &[ObjMetaData],
    ) -> Vec<Outgoing> {
        let per_batch = self.config.sm_batch_entries.max(1);
        let mut batches: Vec<Vec<Vec<u8>>> = metas
            .chunks(per_batch)
            .map(|chunk| chunk.iter().map(ObjMetaData::marshall).collect())
            .collect();
        if batches.is_empty() {
            batches.push(Vec::new());
        }
        let count = batches.len();
        debug!(
            "Token {} {:?}: {} entries in {} batches",
            ctx.token,
            phase,
            metas.len(),
            count
        );
        batches
            .into_iter()
            .enumerate()
            .map(|(i, entries)| {
                (
                    ctx.dest,
                    SmMigrationMsg::MetadataBatch {
                        token: ctx.token,
                        dlt_version: ctx.dlt_version,
                        phase,
                        seq: i as u64,
                        last: i + 1 == count,
                        entries,
                    },
                )
            })
            .collect()
    }

    fn push_batches(&self, ctx: &SenderCtx, oids: Vec<ObjectId>) -> Result<Vec<Outgoing>> {
        let cap = self.config.sm_push_batch_bytes;
        let mut out = Vec::new();
        let mut objects = Vec::new();
        let mut not_found = Vec::new();
        let mut bytes = 0;
        let push = |objects: Vec<_>, not_found: Vec<_>| {
            (
                ctx.dest,
                SmMigrationMsg::PushObjects {
                    token: ctx.token,
                    dlt_version: ctx.dlt_version,
                    objects,
                    not_found,
                },
            )
        };
        for oid in oids {
            match self.store.read_object_internal(&oid) {
                Ok(Some((_, data))) => {
                    if !objects.is_empty() && bytes + data.len() > cap {
                        out.push(push(std::mem::take(&mut objects), Vec::new()));
                        bytes = 0;
                    }
                    bytes += data.len();
                    objects.push((oid, data));
                }
                Ok(None) => not_found.push(oid),
                Err(e) if e.is_disk_io() => {
                    warn!("Cannot read {} for token {} pull: {}", oid, ctx.token, e);
                    not_found.push(oid);
                }
                Err(e) => return Err(e),
            }
        }
        if !objects.is_empty() || !not_found.is_empty() {
            out.push(push(objects, not_found));
        }
        Ok(out)
    }

    fn with_receiver<F>(
        &self,
        from: NodeUuid,
        token: SmTokenId,
        dlt_version: u64,
        f: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut ReceiverCtx) -> Result<Vec<Outgoing>>,
    {
        let Some(ctx) = self.receivers.lock().get(&token).cloned() else {
            warn!("No receiver for token {}, dropping message from {}", token, from);
            return Ok(());
        };
        let out = {
            let mut ctx = ctx.lock();
            if ctx.source != from || ctx.dlt_version != dlt_version || ctx.state.is_terminal() {
                warn!(
                    "Token {} receiver ({} DLT {} {}) ignores message from {} DLT {}",
                    token, ctx.source, ctx.dlt_version, ctx.state, from, dlt_version
                );
                return Ok(());
            }
            match f(&mut ctx) {
                Ok(out) => out,
                Err(e) => {
                    error!("Token {} receiver failed: {}", token, e);
                    ctx.abort_reason = e.to_string();
                    let out =
                        self.drive_receiver(&mut ctx, ReceiverEvent::Abort { notify_peer: true })?;
                    drop(ctx);
                    self.send_all(out);
                    return Err(e);
                }
            }
        };
        self.send_all(out);
        Ok(())
    }

    fn with_sender<F>(&self, from: NodeUuid, token: SmTokenId, dlt_version: u64, f: F) -> Result<()>
    where
        F: FnOnce(&mut SenderCtx) -> Result<Vec<Outgoing>>,
    {
        let Some(ctx) = self.senders.lock().get(&token).cloned() else {
            warn!("No sender for token {}, dropping message from {}", token, from);
            return Ok(());
        };
        let out = {
            let mut ctx = ctx.lock();
            if ctx.dest != from || ctx.dlt_version != dlt_version || ctx.state.is_terminal() {
                warn!(
                    "Token {} sender ({} DLT {} {}) ignores message from {} DLT {}",
                    token, ctx.dest, ctx.dlt_version, ctx.state, from, dlt_version
                );
                return Ok(());
            }
            match f(&mut ctx) {
                Ok(out) => out,
                Err(e) => {
                    error!("Token {} sender failed: {}", token, e);
                    ctx.abort_reason = e.to_string();
                    let out =
                        self.drive_sender(&mut ctx, SenderEvent::Abort { notify_peer: true })?;
                    drop(ctx);
                    self.send_all(out);
                    return Err(e);
                }
            }
        };
        self.send_all(out);
        Ok(())
    }

    fn abort_from_peer(&self, from: NodeUuid, token: SmTokenId) {
        if let Some(ctx) = self.receivers.lock().get(&token).cloned() {
            let mut ctx = ctx.lock();
            if ctx.source == from {
                ctx.abort_reason = format!("aborted by {from}");
                if let Err(e) =
                    self.drive_receiver(&mut ctx, ReceiverEvent::Abort { notify_peer: false })
                {
                    error!("Token {} receiver abort failed: {}", token, e);
                }
            }
        }
        if let Some(ctx) = self.senders.lock().get(&token).cloned() {
            let mut ctx = ctx.lock();
            if ctx.dest == from {
                ctx.abort_reason = format!("aborted by {from}");
                if let Err(e) =
                    self.drive_sender(&mut ctx, SenderEvent::Abort { notify_peer: false })
                {
                    error!("Token {} sender abort failed: {}", token, e);
                }
            }
        }
    }

    /// Abort any migration of `token` on this node and tell the peer
    pub fn abort_token(&self, token: SmTokenId, reason: &str) {
        let mut out = Vec::new();
        if let Some(ctx) = self.receivers.lock().get(&token).cloned() {
            let mut ctx = ctx.lock();
            ctx.abort_reason = reason.to_string();
            match self.drive_receiver(&mut ctx, ReceiverEvent::Abort { notify_peer: true }) {
                Ok(msgs) => out.extend(msgs),
                Err(e) => error!("Token {} receiver abort failed: {}", token, e),
            }
        }
        if let Some(ctx) = self.senders.lock().get(&token).cloned() {
            let mut ctx = ctx.lock();
            ctx.abort_reason = reason.to_string();
            match self.drive_sender(&mut ctx, SenderEvent::Abort { notify_peer: true }) {
                Ok(msgs) => out.extend(msgs),
                Err(e) => error!("Token {} sender abort failed: {}", token, e),
            }
        }
        self.send_all(out);
    }

    /// Send after all context locks are released; a failed send aborts
    /// the migration it belongs to
    fn send_all(&self, out: Vec<Outgoing>) {
        for (to, msg) in out {
            let token = msg.token();
            let is_abort = matches!(msg, SmMigrationMsg::Abort { .. });
            if let Err(e) = self.transport.send(to, self.node, msg) {
                error!("Send to {} for token {} failed: {}", to, token, e);
                if !is_abort {
                    self.abort_local(token, to, &e.to_string());
                }
            }
        }
    }

    fn abort_local(&self, token: SmTokenId, peer: NodeUuid, reason: &str) {
        if let Some(ctx) = self.receivers.lock().get(&token).cloned() {
            let mut ctx = ctx.lock();
            if ctx.source == peer {
                ctx.abort_reason = reason.to_string();
                if let Err(e) =
                    self.drive_receiver(&mut ctx, ReceiverEvent::Abort { notify_peer: false })
                {
                    warn!("Token {} receiver abort failed: {}", token, e);
                }
            }
        }
        if let Some(ctx) = self.senders.lock().get(&token).cloned() {
            let mut ctx = ctx.lock();
            if ctx.dest == peer {
                ctx.abort_reason = reason.to_string();
                if let Err(e) =
                    self.drive_sender(&mut ctx, SenderEvent::Abort { notify_peer: false })
                {
                    warn!("Token {} sender abort failed: {}", token, e);
                }
            }
        }
    }

    pub fn receiver_state(&self, token: SmTokenId) -> Option<ReceiverState> {
        let ctx = self.receivers.lock().get(&token).cloned()?;
        let state = ctx.lock().state;
        Some(state)
    }

    pub fn sender_state(&self, token: SmTokenId) -> Option<SenderState> {
        let ctx = self.senders.lock().get(&token).cloned()?;
        let state = ctx.lock().state;
        Some(state)
    }

    /// Migrations not yet complete or aborted
    pub fn active_migrations(&self) -> usize {
        let receivers: Vec<_> = self.receivers.lock().values().cloned().collect();
        let senders: Vec<_> = self.senders.lock().values().cloned().collect();
        receivers.iter().filter(|c| !c.lock().state.is_terminal()).count()
            + senders.iter().filter(|c| !c.lock().state.is_terminal()).count()
    }
}
