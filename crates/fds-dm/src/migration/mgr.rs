//! Drives DM volume migrations from DMT changes and peer messages
//!
//! A DM that joins a volume's group runs an executor against the volume's
//! old primary; the old primary runs a source when the executor's filter
//! set arrives. Executors beyond `max_concurrent_dm_migrations` wait in
//! `Init` until a slot frees up. Outgoing messages are sent only after
//! every context lock has been released.

use super::executor::{self, DmMigrationExecutor, ExecutorEffect, ExecutorEvent, ExecutorState};
use super::messages::{DmMigrationMsg, DmMigrationTransport};
use super::src::{self, DmMigrationSrc, SrcEffect, SrcEvent, SrcState, build_deltas};
use crate::volume::{DmVolume, VolumeTable};
use fds_common::config::MigrationConfig;
use fds_common::{BlobVersion, Error, NodeUuid, Result, VolumeId};
use fds_placement::{Dmt, DmtManager};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

type Outgoing = (NodeUuid, DmMigrationMsg);

/// DM volume migration manager
pub struct DmMigrationMgr {
    node: NodeUuid,
    volumes: Arc<VolumeTable>,
    dmt: Arc<DmtManager>,
    transport: Arc<dyn DmMigrationTransport>,
    config: MigrationConfig,
    executors: Mutex<BTreeMap<VolumeId, Arc<Mutex<DmMigrationExecutor>>>>,
    srcs: Mutex<HashMap<VolumeId, Arc<Mutex<DmMigrationSrc>>>>,
}

fn ack(vol: VolumeId, dmt_version: u64, msg_id: u64, error: Option<String>) -> DmMigrationMsg {
    DmMigrationMsg::Ack {
        vol,
        dmt_version,
        msg_id,
        error,
    }
}

impl DmMigrationMgr {
    pub fn new(
        node: NodeUuid,
        volumes: Arc<VolumeTable>,
        dmt: Arc<DmtManager>,
        transport: Arc<dyn DmMigrationTransport>,
        config: MigrationConfig,
    ) -> Self {
        Self {
            node,
            volumes,
            dmt,
            transport,
            config,
            executors: Mutex::new(BTreeMap::new()),
            srcs: Mutex::new(HashMap::new()),
        }
    }

    pub const fn node(&self) -> NodeUuid {
        self.node
    }

    fn async_timeout(&self) -> Duration {
        Duration::from_secs(self.config.async_msg_timeout_secs)
    }

    fn volume(&self, vol: VolumeId) -> Result<Arc<DmVolume>> {
        self.volumes
            .get(&vol)
            .map(|v| Arc::clone(v.value()))
            .ok_or(Error::VolumeNotFound(vol))
    }

    /// Install a new DMT and start or abort migrations accordingly
    pub fn on_dmt_update(&self, dmt: Dmt) -> Result<()> {
        let (old, new) = self.dmt.update(dmt)?;
        let version = new.version();

        let mut restart = BTreeMap::new();
        let executors: Vec<_> = self.executors.lock().values().cloned().collect();
        for ctx in executors {
            let (vol, source, out) = {
                let mut ctx = ctx.lock();
                if ctx.state.is_terminal() || ctx.dmt_version >= version {
                    continue;
                }
                ctx.abort_reason = format!("DMT version {version} superseded {}", ctx.dmt_version);
                let out =
                    self.drive_executor(&mut ctx, ExecutorEvent::Abort { notify_peer: true })?;
                (ctx.vol, ctx.source, out)
            };
            self.send_all(out);
            if new.get_nodes(vol).contains(&self.node) {
                restart.insert(vol, source);
            }
        }
        let srcs: Vec<_> = self.srcs.lock().values().cloned().collect();
        for ctx in srcs {
            let out = {
                let mut ctx = ctx.lock();
                if ctx.state.is_terminal() || ctx.dmt_version >= version {
                    continue;
                }
                ctx.abort_reason = format!("DMT version {version} superseded {}", ctx.dmt_version);
                self.drive_src(&mut ctx, SrcEvent::Abort { notify_peer: true })?
            };
            self.send_all(out);
        }

        let Some(old) = old else {
            info!("Initial DMT version {}, no volumes to migrate", version);
            return Ok(());
        };
        let local: Vec<_> = self.volumes.iter().map(|v| *v.key()).collect();
        let mut gained = new.volumes_gained(&old, self.node, &local);
        for (vol, source) in restart {
            gained.entry(vol).or_insert(source);
        }
        for vol in new.volumes_lost(&old, self.node, &local) {
            info!("{} leaves this DM in DMT {}", vol, version);
        }
        for (vol, source) in gained {
            if source == self.node {
                continue;
            }
            info!("Queueing migration of {} from {} (DMT {})", vol, source, version);
            let ctx = DmMigrationExecutor::new(vol, source, version);
            self.executors.lock().insert(vol, Arc::new(Mutex::new(ctx)));
        }
        self.start_queued();
        Ok(())
    }

    /// Start queued executors while throttle slots are free
    fn start_queued(&self) {
        let limit = self.config.max_concurrent_dm_migrations.max(1);
        loop {
            let next = {
                let executors = self.executors.lock();
                let running = executors.values().filter(|c| c.lock().state.is_running()).count();
                if running >= limit {
                    return;
                }
                executors
                    .values()
                    .find(|c| c.lock().state == ExecutorState::Init)
                    .cloned()
            };
            let Some(ctx) = next else {
                return;
            };
            let out = {
                let mut ctx = ctx.lock();
                info!("Migrating {} from {} (DMT {})", ctx.vol, ctx.source, ctx.dmt_version);
                match self.drive_executor(&mut ctx, ExecutorEvent::Start) {
                    Ok(out) => out,
                    Err(e) => {
                        error!("{} migration failed to start: {}", ctx.vol, e);
                        ctx.abort_reason = e.to_string();
                        self.drive_executor(&mut ctx, ExecutorEvent::Abort { notify_peer: false })
                            .unwrap_or_default()
                    }
                }
            };
            self.send_all(out);
        }
    }

    /// Handle a message from peer `from`
    pub fn handle_message(&self, from: NodeUuid, msg: DmMigrationMsg) -> Result<()> {
        let current = self.dmt.version();
        if msg.dmt_version() < current {
            warn!(
                "Ignoring stale {} for {} from {} (DMT {} < {})",
                msg.kind(),
                msg.vol(),
                from,
                msg.dmt_version(),
                current
            );
            return Ok(());
        }
        debug!("{} for {} from {}", msg.kind(), msg.vol(), from);
        let result = match msg {
            DmMigrationMsg::InitialBlobFilterSet {
                vol,
                dmt_version,
                msg_id,
                filter,
            } => self.on_filter_set(from, vol, dmt_version, msg_id, filter),
            DmMigrationMsg::DeltaBlobs {
                vol,
                dmt_version,
                msg_id,
                seq,
                last,
                blobs,
            } => self.with_executor(from, vol, dmt_version, |ctx| {
                ctx.dest.stage_blobs(blobs);
                if ctx.blob_seq.set_seq_num(seq, last) {
                    let volume = self.volume(vol)?;
                    let applied = ctx.dest.apply_deferred(volume.commit_log())?;
                    debug!("{} applied {} deferred descriptors", vol, applied);
                }
                let mut out = vec![(from, ack(vol, dmt_version, msg_id, None))];
                out.extend(self.drive_executor(ctx, ExecutorEvent::DeltaApplied)?);
                Ok(out)
            }),
            DmMigrationMsg::DeltaBlobDescs {
                vol,
                dmt_version,
                msg_id,
                seq,
                last,
                descs,
            } => self.with_executor(from, vol, dmt_version, |ctx| {
                ctx.desc_seq.set_seq_num(seq, last);
                if ctx.blob_seq.is_complete() {
                    let volume = self.volume(vol)?;
                    ctx.dest.apply_descs(volume.commit_log(), descs)?;
                } else {
                    ctx.dest.defer_descs(descs);
                }
                let mut out = vec![(from, ack(vol, dmt_version, msg_id, None))];
                out.extend(self.drive_executor(ctx, ExecutorEvent::DeltaApplied)?);
                Ok(out)
            }),
            DmMigrationMsg::FinishStaticMigration {
                vol,
                dmt_version,
                msg_id,
            } => self.with_executor(from, vol, dmt_version, |ctx| {
                ctx.finish_msg_id = Some(msg_id);
                self.finish_static(ctx)
            }),
            DmMigrationMsg::Ack {
                vol,
                dmt_version,
                msg_id,
                error,
            } => self.on_ack(from, vol, dmt_version, msg_id, error),
            DmMigrationMsg::Abort { vol, reason, .. } => {
                warn!("Peer {} aborted migration of {}: {}", from, vol, reason);
                self.abort_from_peer(from, vol);
                Ok(())
            }
        };
        self.start_queued();
        result
    }

    fn on_filter_set(
        &self,
        from: NodeUuid,
        vol: VolumeId,
        dmt_version: u64,
        msg_id: u64,
        filter: BTreeMap<String, BlobVersion>,
    ) -> Result<()> {
        if let Some(old) = self.srcs.lock().get(&vol).cloned() {
            let mut old = old.lock();
            if !old.state.is_terminal() {
                old.abort_reason = format!("superseded by a new filter set from {from}");
                self.drive_src(&mut old, SrcEvent::Abort { notify_peer: false })?;
            }
        }
        info!(
            "Sending {} to {} (DMT {}, {} blobs filtered)",
            vol,
            from,
            dmt_version,
            filter.len()
        );
        let ctx = Arc::new(Mutex::new(DmMigrationSrc::new(vol, from, dmt_version, filter)));
        self.srcs.lock().insert(vol, Arc::clone(&ctx));

        let mut out = vec![(from, ack(vol, dmt_version, msg_id, None))];
        let mut ctx = ctx.lock();
        match self.drive_src(&mut ctx, SrcEvent::FilterSet) {
            Ok(msgs) => {
                out.extend(msgs);
                drop(ctx);
                self.send_all(out);
                Ok(())
            }
            Err(e) => {
                ctx.abort_reason = e.to_string();
                out.extend(self.drive_src(&mut ctx, SrcEvent::Abort { notify_peer: true })?);
                drop(ctx);
                self.send_all(out);
                Err(e)
            }
        }
    }

    fn on_ack(
        &self,
        from: NodeUuid,
        vol: VolumeId,
        dmt_version: u64,
        msg_id: u64,
        error: Option<String>,
    ) -> Result<()> {
        let executor = self.executors.lock().get(&vol).cloned();
        if let Some(ctx) = executor {
            let ours = {
                let ctx = ctx.lock();
                ctx.source == from
                    && ctx.dmt_version == dmt_version
                    && ctx.base.is_outstanding(msg_id)
            };
            if ours {
                return self.with_executor(from, vol, dmt_version, |ctx| {
                    if let Some(reason) = error {
                        ctx.base.async_msg_failed(msg_id, &reason);
                        return Err(Error::DmRsyncFailed(format!(
                            "{vol}: {from} rejected {msg_id}: {reason}"
                        )));
                    }
                    ctx.base.async_msg_passed(msg_id)?;
                    if ctx.finish_msg_id.is_some() && !ctx.state.is_terminal() {
                        return self.finish_static(ctx);
                    }
                    Ok(Vec::new())
                });
            }
        }
        self.with_src(from, vol, dmt_version, |ctx| {
            if let Some(reason) = error {
                ctx.base.async_msg_failed(msg_id, &reason);
                return Err(Error::DmRsyncFailed(format!(
                    "{vol}: {from} rejected {msg_id}: {reason}"
                )));
            }
            ctx.base.async_msg_passed(msg_id)?;
            if !ctx.base.is_drained() {
                return Ok(Vec::new());
            }
            match ctx.state {
                SrcState::Streaming => self.drive_src(ctx, SrcEvent::DeltasAcked),
                SrcState::AwaitFinishAck => self.drive_src(ctx, SrcEvent::FinishAcked),
                _ => Ok(Vec::new()),
            }
        })
    }

    /// Complete the executor once the source has finished and every
    /// message the executor sent has been answered
    fn finish_static(&self, ctx: &mut DmMigrationExecutor) -> Result<Vec<Outgoing>> {
        if ctx.base.failure().is_none() && !ctx.base.is_drained() {
            debug!("{} finish waits for answers to the executor's messages", ctx.vol);
            return Ok(Vec::new());
        }
        let drained = ctx.base.wait_for_async_msgs(Duration::ZERO);
        let complete = drained.is_ok() && ctx.deltas_complete();
        if let Err(e) = drained {
            ctx.abort_reason = e.to_string();
        } else if !complete {
            ctx.abort_reason = format!(
                "static migration finished after {} of its delta blobs",
                ctx.blob_seq.contiguous()
            );
        }
        self.drive_executor(ctx, ExecutorEvent::StaticFinished { complete })
    }

    /// Quiesce client I/O on `vol`; fails if requests are still in flight
    /// after the message timeout
    fn block_io(&self, vol: VolumeId) -> Result<()> {
        let volume = self.volume(vol)?;
        let tracker = volume.io_tracker();
        if !tracker.block_and_wait_for(self.async_timeout()) {
            tracker.unblock();
            return Err(Error::SyncInProgress(format!(
                "{vol} still has {} requests in flight",
                tracker.outstanding()
            )));
        }
        debug!("{} client I/O blocked", vol);
        Ok(())
    }

    fn unblock_io(&self, vol: VolumeId) {
        if let Some(volume) = self.volumes.get(&vol) {
            volume.io_tracker().unblock();
            debug!("{} client I/O resumed", vol);
        }
    }

    /// Run an executor event and carry out its effects
    fn drive_executor(
        &self,
        ctx: &mut DmMigrationExecutor,
        event: ExecutorEvent,
    ) -> Result<Vec<Outgoing>> {
        let (next, effects) = executor::transition(&ctx.state, event)?;
        if next != ctx.state {
            info!("{} executor {} -> {}", ctx.vol, ctx.state, next);
        }
        ctx.state = next;
        let (vol, dmt_version, to) = (ctx.vol, ctx.dmt_version, ctx.source);
        let mut out = Vec::new();
        for effect in effects {
            match effect {
                ExecutorEffect::BlockIo => self.block_io(vol)?,
                ExecutorEffect::SendFilterSet => {
                    let filter = self.volume(vol)?.catalog().blob_versions()?;
                    debug!("{} filter set holds {} blobs", vol, filter.len());
                    out.push((
                        to,
                        DmMigrationMsg::InitialBlobFilterSet {
                            vol,
                            dmt_version,
                            msg_id: ctx.base.async_msg_issued(),
                            filter,
                        },
                    ));
                }
                ExecutorEffect::AckFinish => {
                    if let Some(msg_id) = ctx.finish_msg_id {
                        out.push((to, ack(vol, dmt_version, msg_id, None)));
                    }
                    info!("{} migrated from {}: {} blobs applied", vol, to, ctx.dest.applied());
                }
                ExecutorEffect::UnblockIo => {
                    self.unblock_io(vol);
                    if ctx.state == ExecutorState::Aborted {
                        warn!("{} executor aborted: {}", vol, ctx.abort_reason);
                    }
                }
                ExecutorEffect::NotifyPeerAbort => out.push((
                    to,
                    DmMigrationMsg::Abort {
                        vol,
                        dmt_version,
                        reason: ctx.abort_reason.clone(),
                    },
                )),
            }
        }
        Ok(out)
    }

    /// Run a source event and carry out its effects
    fn drive_src(&self, ctx: &mut DmMigrationSrc, event: SrcEvent) -> Result<Vec<Outgoing>> {
        let (next, effects) = src::transition(&ctx.state, event)?;
        if next != ctx.state {
            info!("{} source {} -> {}", ctx.vol, ctx.state, next);
        }
        ctx.state = next;
        let (vol, dmt_version, to) = (ctx.vol, ctx.dmt_version, ctx.dest);
        let mut out = Vec::new();
        for effect in effects {
            match effect {
                SrcEffect::BlockIo => self.block_io(vol)?,
                SrcEffect::SendDeltas => {
                    let volume = self.volume(vol)?;
                    let deltas = build_deltas(
                        volume.catalog(),
                        &ctx.filter,
                        self.config.max_delta_blobs,
                        self.config.max_delta_blob_desc,
                    )?;
                    info!(
                        "{} sending {} blobs to {} in {}+{} messages",
                        vol,
                        deltas.blob_count(),
                        to,
                        deltas.blobs.len(),
                        deltas.descs.len()
                    );
                    let count = deltas.blobs.len();
                    for (i, blobs) in deltas.blobs.into_iter().enumerate() {
                        out.push((
                            to,
                            DmMigrationMsg::DeltaBlobs {
                                vol,
                                dmt_version,
                                msg_id: ctx.base.async_msg_issued(),
                                seq: i as u64,
                                last: i + 1 == count,
                                blobs,
                            },
                        ));
                    }
                    let count = deltas.descs.len();
                    for (i, descs) in deltas.descs.into_iter().enumerate() {
                        out.push((
                            to,
                            DmMigrationMsg::DeltaBlobDescs {
                                vol,
                                dmt_version,
                                msg_id: ctx.base.async_msg_issued(),
                                seq: i as u64,
                                last: i + 1 == count,
                                descs,
                            },
                        ));
                    }
                }
                SrcEffect::SendFinish => out.push((
                    to,
                    DmMigrationMsg::FinishStaticMigration {
                        vol,
                        dmt_version,
                        msg_id: ctx.base.async_msg_issued(),
                    },
                )),
                SrcEffect::UnblockIo => {
                    self.unblock_io(vol);
                    if ctx.state == SrcState::Aborted {
                        warn!("{} source aborted: {}", vol, ctx.abort_reason);
                    } else {
                        info!("{} handed over to {}", vol, to);
                    }
                }
                SrcEffect::NotifyPeerAbort => out.push((
                    to,
                    DmMigrationMsg::Abort {
                        vol,
                        dmt_version,
                        reason: ctx.abort_reason.clone(),
                    },
                )),
            }
        }
        Ok(out)
    }

    fn with_executor<F>(&self, from: NodeUuid, vol: VolumeId, dmt_version: u64, f: F) -> Result<()>
    where
        F: FnOnce(&mut DmMigrationExecutor) -> Result<Vec<Outgoing>>,
    {
        let Some(ctx) = self.executors.lock().get(&vol).cloned() else {
            warn!("No executor for {}, dropping message from {}", vol, from);
            return Ok(());
        };
        let out = {
            let mut ctx = ctx.lock();
            if ctx.source != from || ctx.dmt_version != dmt_version || ctx.state.is_terminal() {
                warn!(
                    "{} executor ({} DMT {} {}) ignores message from {} DMT {}",
                    vol, ctx.source, ctx.dmt_version, ctx.state, from, dmt_version
                );
                return Ok(());
            }
            match f(&mut ctx) {
                Ok(out) => out,
                Err(e) => {
                    error!("{} executor failed: {}", vol, e);
                    ctx.abort_reason = e.to_string();
                    let out =
                        self.drive_executor(&mut ctx, ExecutorEvent::Abort { notify_peer: true })?;
                    drop(ctx);
                    self.send_all(out);
                    return Err(e);
                }
            }
        };
        self.send_all(out);
        Ok(())
    }

    fn with_src<F>(&self, from: NodeUuid, vol: VolumeId, dmt_version: u64, f: F) -> Result<()>
    where
        F: FnOnce(&mut DmMigrationSrc) -> Result<Vec<Outgoing>>,
    {
        let Some(ctx) = self.srcs.lock().get(&vol).cloned() else {
            warn!("No source for {}, dropping message from {}", vol, from);
            return Ok(());
        };
        let out = {
            let mut ctx = ctx.lock();
            if ctx.dest != from || ctx.dmt_version != dmt_version || ctx.state.is_terminal() {
                warn!(
                    "{} source ({} DMT {} {}) ignores message from {} DMT {}",
                    vol, ctx.dest, ctx.dmt_version, ctx.state, from, dmt_version
                );
                return Ok(());
            }
            match f(&mut ctx) {
                Ok(out) => out,
                Err(e) => {
                    error!("{} source failed: {}", vol, e);
                    ctx.abort_reason = e.to_string();
                    let out = self.drive_src(&mut ctx, SrcEvent::Abort { notify_peer: true })?;
                    drop(ctx);
                    self.send_all(out);
                    return Err(e);
                }
            }
        };
        self.send_all(out);
        Ok(())
    }

    fn abort_from_peer(&self, from: NodeUuid, vol: VolumeId) {
        self.abort_local(vol, from, &format!("aborted by {from}"));
    }

    /// Abort any migration of `vol` on this node and tell the peer
    pub fn abort_volume(&self, vol: VolumeId, reason: &str) {
        let mut out = Vec::new();
        if let Some(ctx) = self.executors.lock().get(&vol).cloned() {
            let mut ctx = ctx.lock();
            ctx.abort_reason = reason.to_string();
            match self.drive_executor(&mut ctx, ExecutorEvent::Abort { notify_peer: true }) {
                Ok(msgs) => out.extend(msgs),
                Err(e) => error!("{} executor abort failed: {}", vol, e),
            }
        }
        if let Some(ctx) = self.srcs.lock().get(&vol).cloned() {
            let mut ctx = ctx.lock();
            ctx.abort_reason = reason.to_string();
            match self.drive_src(&mut ctx, SrcEvent::Abort { notify_peer: true }) {
                Ok(msgs) => out.extend(msgs),
                Err(e) => error!("{} source abort failed: {}", vol, e),
            }
        }
        self.send_all(out);
    }

    /// Abort every migration on this node
    pub fn abort_all(&self, reason: &str) {
        let mut vols: Vec<_> = self.executors.lock().keys().copied().collect();
        vols.extend(self.srcs.lock().keys().copied());
        vols.sort_unstable();
        vols.dedup();
        for vol in vols {
            self.abort_volume(vol, reason);
        }
    }

    /// Abort migrations with messages unanswered past the timeout
    pub fn check_timeouts(&self) {
        let timeout = self.async_timeout();
        let executors: Vec<_> = self.executors.lock().values().cloned().collect();
        let srcs: Vec<_> = self.srcs.lock().values().cloned().collect();
        let mut expired = Vec::new();
        for ctx in executors {
            let ctx = ctx.lock();
            if !ctx.state.is_terminal() && !ctx.base.expired(timeout).is_empty() {
                expired.push(ctx.vol);
            }
        }
        for ctx in srcs {
            let ctx = ctx.lock();
            if !ctx.state.is_terminal() && !ctx.base.expired(timeout).is_empty() {
                expired.push(ctx.vol);
            }
        }
        for vol in expired {
            warn!("{} migration timed out after {:?}", vol, timeout);
            self.abort_volume(vol, &format!("no answer within {timeout:?}"));
        }
        self.start_queued();
    }

    /// Send after all context locks are released; a failed send aborts
    /// the migration it belongs to
    fn send_all(&self, out: Vec<Outgoing>) {
        for (to, msg) in out {
            let vol = msg.vol();
            let is_abort = matches!(msg, DmMigrationMsg::Abort { .. });
            if let Err(e) = self.transport.send(to, self.node, msg) {
                error!("Send to {} for {} failed: {}", to, vol, e);
                if !is_abort {
                    self.abort_local(vol, to, &e.to_string());
                }
            }
        }
    }

    fn abort_local(&self, vol: VolumeId, peer: NodeUuid, reason: &str) {
        if let Some(ctx) = self.executors.lock().get(&vol).cloned() {
            let mut ctx = ctx.lock();
            if ctx.source == peer {
                ctx.abort_reason = reason.to_string();
                if let Err(e) =
                    self.drive_executor(&mut ctx, ExecutorEvent::Abort { notify_peer: false })
                {
                    error!("{} executor abort failed: {}", vol, e);
                }
            }
        }
        if let Some(ctx) = self.srcs.lock().get(&vol).cloned() {
            let mut ctx = ctx.lock();
            if ctx.dest == peer {
                ctx.abort_reason = reason.to_string();
                if let Err(e) = self.drive_src(&mut ctx, SrcEvent::Abort { notify_peer: false }) {
                    error!("{} source abort failed: {}", vol, e);
                }
            }
        }
    }

    pub fn executor_state(&self, vol: VolumeId) -> Option<ExecutorState> {
        let ctx = self.executors.lock().get(&vol).cloned()?;
        let state = ctx.lock().state;
        Some(state)
    }

    pub fn src_state(&self, vol: VolumeId) -> Option<SrcState> {
        let ctx = self.srcs.lock().get(&vol).cloned()?;
        let state = ctx.lock().state;
        Some(state)
    }

    /// Migrations queued or running on either side
    pub fn active_migrations(&self) -> usize {
        let executors: Vec<_> = self.executors.lock().values().cloned().collect();
        let srcs: Vec<_> = self.srcs.lock().values().cloned().collect();
        executors.iter().filter(|c| !c.lock().state.is_terminal()).count()
            + srcs.iter().filter(|c| !c.lock().state.is_terminal()).count()
    }

    /// Executors waiting for a throttle slot
    pub fn queued_migrations(&self) -> usize {
        let executors: Vec<_> = self.executors.lock().values().cloned().collect();
        executors
            .iter()
            .filter(|c| c.lock().state == ExecutorState::Init)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fds_common::config::DmConfig;
    use tempfile::{TempDir, tempdir};

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<(NodeUuid, DmMigrationMsg)>>,
        fail: bool,
    }

    impl DmMigrationTransport for Recorder {
        fn send(&self, to: NodeUuid, _from: NodeUuid, msg: DmMigrationMsg) -> Result<()> {
            if self.fail {
                return Err(Error::transport("link down"));
            }
            self.sent.lock().push((to, msg));
            Ok(())
        }
    }

    fn node(n: u64) -> NodeUuid {
        NodeUuid::new(n)
    }

    fn mgr(me: NodeUuid, vols: &[u64], transport: Arc<Recorder>) -> (TempDir, DmMigrationMgr) {
        let dir = tempdir().unwrap();
        let volumes = Arc::new(VolumeTable::new());
        for &v in vols {
            let vol = VolumeId::new(v);
            let volume = DmVolume::open(dir.path(), vol, &DmConfig::default()).unwrap();
            volumes.insert(vol, Arc::new(volume));
        }
        let config = MigrationConfig {
            max_concurrent_dm_migrations: 1,
            async_msg_timeout_secs: 1,
            ..MigrationConfig::default()
        };
        let dmt = Arc::new(DmtManager::for_dmt());
        let mgr = DmMigrationMgr::new(me, volumes, dmt, transport, config);
        (dir, mgr)
    }

    fn dmt(version: u64, groups: &[&[u64]]) -> Dmt {
        Dmt::new(
            version,
            groups
                .iter()
                .map(|g| g.iter().map(|n| node(*n)).collect())
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_gained_volumes_queue_behind_throttle() {
        let transport = Arc::new(Recorder::default());
        let (_dir, mgr) = mgr(node(2), &[0, 1], Arc::clone(&transport));
        mgr.on_dmt_update(dmt(1, &[&[1], &[1]])).unwrap();
        assert!(transport.sent.lock().is_empty());

        mgr.on_dmt_update(dmt(2, &[&[1, 2], &[1, 2]])).unwrap();
        assert_eq!(mgr.executor_state(VolumeId::new(0)), Some(ExecutorState::FilterSetSent));
        assert_eq!(mgr.executor_state(VolumeId::new(1)), Some(ExecutorState::Init));
        assert_eq!(mgr.queued_migrations(), 1);
        assert_eq!(mgr.active_migrations(), 2);
        assert!(mgr.volume(VolumeId::new(0)).unwrap().io_tracker().is_blocked());
        assert!(!mgr.volume(VolumeId::new(1)).unwrap().io_tracker().is_blocked());

        let sent = transport.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, node(1));
        assert!(matches!(
            sent[0].1,
            DmMigrationMsg::InitialBlobFilterSet { dmt_version: 2, .. }
        ));
    }

    #[test]
    fn test_peer_abort_frees_slot_and_io() {
        let transport = Arc::new(Recorder::default());
        let (_dir, mgr) = mgr(node(2), &[0, 1], Arc::clone(&transport));
        mgr.on_dmt_update(dmt(1, &[&[1], &[1]])).unwrap();
        mgr.on_dmt_update(dmt(2, &[&[1, 2], &[1, 2]])).unwrap();

        mgr.handle_message(
            node(1),
            DmMigrationMsg::Abort {
                vol: VolumeId::new(0),
                dmt_version: 2,
                reason: "test".into(),
            },
        )
        .unwrap();
        assert_eq!(mgr.executor_state(VolumeId::new(0)), Some(ExecutorState::Aborted));
        assert!(!mgr.volume(VolumeId::new(0)).unwrap().io_tracker().is_blocked());
        assert_eq!(mgr.executor_state(VolumeId::new(1)), Some(ExecutorState::FilterSetSent));
    }

    #[test]
    fn test_stale_message_ignored() {
        let transport = Arc::new(Recorder::default());
        let (_dir, mgr) = mgr(node(1), &[0], Arc::clone(&transport));
        mgr.on_dmt_update(dmt(5, &[&[1]])).unwrap();
        mgr.handle_message(
            node(2),
            DmMigrationMsg::InitialBlobFilterSet {
                vol: VolumeId::new(0),
                dmt_version: 4,
                msg_id: 0,
                filter: BTreeMap::new(),
            },
        )
        .unwrap();
        assert!(mgr.src_state(VolumeId::new(0)).is_none());
        assert!(transport.sent.lock().is_empty());
    }

    #[test]
    fn test_filter_set_streams_empty_volume() {
        let transport = Arc::new(Recorder::default());
        let (_dir, mgr) = mgr(node(1), &[0], Arc::clone(&transport));
        mgr.on_dmt_update(dmt(1, &[&[1]])).unwrap();
        mgr.handle_message(
            node(2),
            DmMigrationMsg::InitialBlobFilterSet {
                vol: VolumeId::new(0),
                dmt_version: 1,
                msg_id: 7,
                filter: BTreeMap::new(),
            },
        )
        .unwrap();
        assert_eq!(mgr.src_state(VolumeId::new(0)), Some(SrcState::Streaming));
        assert!(mgr.volume(VolumeId::new(0)).unwrap().io_tracker().is_blocked());

        let sent: Vec<_> = transport.sent.lock().drain(..).map(|(_, m)| m).collect();
        assert!(matches!(sent[0], DmMigrationMsg::Ack { msg_id: 7, error: None, .. }));
        let ids: Vec<u64> = sent[1..]
            .iter()
            .map(|m| match m {
                DmMigrationMsg::DeltaBlobs {
                    msg_id,
                    last: true,
                    blobs,
                    ..
                } if blobs.is_empty() => *msg_id,
                DmMigrationMsg::DeltaBlobDescs {
                    msg_id,
                    last: true,
                    descs,
                    ..
                } if descs.is_empty() => *msg_id,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(ids.len(), 2);

        for msg_id in ids {
            mgr.handle_message(
                node(2),
                DmMigrationMsg::Ack {
                    vol: VolumeId::new(0),
                    dmt_version: 1,
                    msg_id,
                    error: None,
                },
            )
            .unwrap();
        }
        assert_eq!(mgr.src_state(VolumeId::new(0)), Some(SrcState::AwaitFinishAck));
        let finish = transport.sent.lock().pop().unwrap().1;
        let DmMigrationMsg::FinishStaticMigration { msg_id, .. } = finish else {
            panic!("unexpected {finish:?}");
        };
        mgr.handle_message(
            node(2),
            DmMigrationMsg::Ack {
                vol: VolumeId::new(0),
                dmt_version: 1,
                msg_id,
                error: None,
            },
        )
        .unwrap();
        assert_eq!(mgr.src_state(VolumeId::new(0)), Some(SrcState::Complete));
        assert!(!mgr.volume(VolumeId::new(0)).unwrap().io_tracker().is_blocked());
    }

    #[test]
    fn test_failed_ack_aborts_source() {
        let transport = Arc::new(Recorder::default());
        let (_dir, mgr) = mgr(node(1), &[0], Arc::clone(&transport));
        mgr.on_dmt_update(dmt(1, &[&[1]])).unwrap();
        mgr.handle_message(
            node(2),
            DmMigrationMsg::InitialBlobFilterSet {
                vol: VolumeId::new(0),
                dmt_version: 1,
                msg_id: 0,
                filter: BTreeMap::new(),
            },
        )
        .unwrap();
        let err = mgr
            .handle_message(
                node(2),
                DmMigrationMsg::Ack {
                    vol: VolumeId::new(0),
                    dmt_version: 1,
                    msg_id: 0,
                    error: Some("catalog write failed".into()),
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::DmRsyncFailed(_)));
        assert_eq!(mgr.src_state(VolumeId::new(0)), Some(SrcState::Aborted));
        assert!(!mgr.volume(VolumeId::new(0)).unwrap().io_tracker().is_blocked());
        let last = transport.sent.lock().pop().unwrap().1;
        assert!(matches!(last, DmMigrationMsg::Abort { .. }));
    }

    #[test]
    fn test_finish_waits_for_filter_set_ack() {
        let transport = Arc::new(Recorder::default());
        let (_dir, mgr) = mgr(node(2), &[0], Arc::clone(&transport));
        let vol = VolumeId::new(0);
        mgr.on_dmt_update(dmt(1, &[&[1]])).unwrap();
        mgr.on_dmt_update(dmt(2, &[&[1, 2]])).unwrap();
        let filter_msg_id = match transport.sent.lock().pop().unwrap().1 {
            DmMigrationMsg::InitialBlobFilterSet { msg_id, .. } => msg_id,
            other => panic!("unexpected {other:?}"),
        };

        let deltas = [
            DmMigrationMsg::DeltaBlobs {
                vol,
                dmt_version: 2,
                msg_id: 1,
                seq: 0,
                last: true,
                blobs: Vec::new(),
            },
            DmMigrationMsg::DeltaBlobDescs {
                vol,
                dmt_version: 2,
                msg_id: 2,
                seq: 0,
                last: true,
                descs: Vec::new(),
            },
            DmMigrationMsg::FinishStaticMigration {
                vol,
                dmt_version: 2,
                msg_id: 3,
            },
        ];
        for msg in deltas {
            mgr.handle_message(node(1), msg).unwrap();
        }
        // The source finished before our filter set was acknowledged
        assert_eq!(mgr.executor_state(vol), Some(ExecutorState::ApplyingDeltas));
        assert!(mgr.volume(vol).unwrap().io_tracker().is_blocked());
        let acked: Vec<_> = transport
            .sent
            .lock()
            .drain(..)
            .filter_map(|(_, m)| match m {
                DmMigrationMsg::Ack { msg_id, .. } => Some(msg_id),
                _ => None,
            })
            .collect();
        assert_eq!(acked, vec![1, 2]);

        mgr.handle_message(
            node(1),
            DmMigrationMsg::Ack {
                vol,
                dmt_version: 2,
                msg_id: filter_msg_id,
                error: None,
            },
        )
        .unwrap();
        assert_eq!(mgr.executor_state(vol), Some(ExecutorState::Complete));
        assert!(!mgr.volume(vol).unwrap().io_tracker().is_blocked());
        let last = transport.sent.lock().pop().unwrap().1;
        assert!(matches!(last, DmMigrationMsg::Ack { msg_id: 3, error: None, .. }));
    }

    #[test]
    fn test_send_failure_aborts_executor() {
        let transport = Arc::new(Recorder {
            fail: true,
            ..Recorder::default()
        });
        let (_dir, mgr) = mgr(node(2), &[0], transport);
        mgr.on_dmt_update(dmt(1, &[&[1]])).unwrap();
        mgr.on_dmt_update(dmt(2, &[&[1, 2]])).unwrap();
        assert_eq!(mgr.executor_state(VolumeId::new(0)), Some(ExecutorState::Aborted));
        assert!(!mgr.volume(VolumeId::new(0)).unwrap().io_tracker().is_blocked());
        assert_eq!(mgr.active_migrations(), 0);
    }
}
