//! The consensus driver above the log: accepts or rejects leader pushes,
//! truncates divergent tails, advances the commit index, and answers vote
//! and config-change requests.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::clock::Clock;
use crate::config::ConsensusOptions;
use crate::env::FsEnv;
use crate::error::{ConsensusError, LogError};
use crate::message::{
    ChangeConfigRequest, ChangeConfigResponse, ConsensusErrorCode, ConsensusRequest,
    ConsensusResponse, ConsensusStatus, ConsensusStatusError, RaftConfig, VoteRequest,
    VoteResponse,
};
use crate::consensus::state::{
    bootstrap_from_log, ConsensusMetadata, ReplicaState, Role,
};
use crate::storage::log::{CommitMsg, Log, ReplicateMsg};
use crate::types::{OpId, PeerUuid, RetentionIndexes};

/// One tablet replica's consensus surface.
///
/// All protocol-level rejections (stale term, log-matching mismatch,
/// mis-ordered ops) travel inside the returned `ConsensusResponse` so the
/// caller sees the replica's current status; transport-level failures
/// (memory pressure, log I/O) are `Err`.
pub struct RaftConsensus {
    peer_uuid: PeerUuid,
    options: ConsensusOptions,
    env: Arc<dyn FsEnv>,
    clock: Arc<dyn Clock>,
    meta_dir: PathBuf,
    log: Arc<Log>,
    state: Mutex<ReplicaState>,
}

impl RaftConsensus {
    /// Loads durable term/vote state, replays the WAL to recover the
    /// replica's op state, and starts serving.
    pub async fn start(
        options: ConsensusOptions,
        env: Arc<dyn FsEnv>,
        clock: Arc<dyn Clock>,
        log: Arc<Log>,
        peer_uuid: PeerUuid,
        initial_config: RaftConfig,
    ) -> Result<Arc<RaftConsensus>, ConsensusError> {
        let meta_dir = log.log_dir().to_path_buf();
        let meta = ConsensusMetadata::load(&env, &meta_dir)?.unwrap_or_default();
        let bootstrap = bootstrap_from_log(&log.reader())?;
        info!(
            "T {} P {}: Starting consensus: term {}, last received {}, committed index {}",
            log.tablet_id(),
            peer_uuid,
            meta.current_term,
            bootstrap.last_id,
            bootstrap.committed_index
        );
        let state = ReplicaState::new(meta, bootstrap, initial_config);
        Ok(Arc::new(RaftConsensus {
            peer_uuid,
            options,
            env,
            clock,
            meta_dir,
            log,
            state: Mutex::new(state),
        }))
    }

    fn persist_meta(&self, state: &ReplicaState) -> Result<(), ConsensusError> {
        ConsensusMetadata {
            current_term: state.current_term,
            voted_for: state.voted_for.clone(),
        }
        .persist(&self.env, &self.meta_dir)?;
        Ok(())
    }

    fn status_of(&self, state: &ReplicaState, error: Option<ConsensusStatusError>) -> ConsensusStatus {
        ConsensusStatus {
            last_received: state.last_received,
            last_received_current_leader: state.last_received_current_leader,
            last_committed_idx: state.committed_index,
            error,
        }
    }

    fn response(&self, state: &ReplicaState) -> ConsensusResponse {
        ConsensusResponse {
            responder_uuid: self.peer_uuid.clone(),
            responder_term: state.current_term,
            status: self.status_of(state, None),
        }
    }

    fn rejection(
        &self,
        state: &ReplicaState,
        code: ConsensusErrorCode,
        message: String,
    ) -> ConsensusResponse {
        ConsensusResponse {
            responder_uuid: self.peer_uuid.clone(),
            responder_term: state.current_term,
            status: self.status_of(state, Some(ConsensusStatusError { code, message })),
        }
    }

    /// Handles a leader's push of operations.
    pub async fn update_consensus(
        &self,
        req: ConsensusRequest,
    ) -> Result<ConsensusResponse, ConsensusError> {
        let mut state = self.state.lock().await;

        // 1. Term check: stale leaders are rejected outright.
        if req.caller_term < state.current_term {
            return Ok(self.rejection(
                &state,
                ConsensusErrorCode::InvalidTerm,
                format!(
                    "Request term {} is behind replica term {}",
                    req.caller_term, state.current_term
                ),
            ));
        }
        if req.caller_term > state.current_term {
            debug!(
                "P {}: Advancing term from {} to {}",
                self.peer_uuid, state.current_term, req.caller_term
            );
            state.current_term = req.caller_term;
            state.voted_for = None;
            state.role = Role::Follower;
            state.last_received_current_leader = OpId::MIN;
            self.persist_meta(&state)?;
        } else if state.role == Role::Leader {
            return Ok(self.rejection(
                &state,
                ConsensusErrorCode::InvalidTerm,
                format!(
                    "Peer {} is itself leader of term {}",
                    self.peer_uuid, state.current_term
                ),
            ));
        }
        state.leader_uuid = Some(req.caller_uuid.clone());
        state.all_replicated_index = req.all_replicated_index;

        // 2. Log matching property.
        if !state.matches_op(req.preceding_op_id) {
            // A divergent uncommitted tail is truncated now, so the status
            // we report already reflects the abort.
            if let Some(&local) = state.received.get(&req.preceding_op_id.index) {
                if local.term != req.preceding_op_id.term
                    && req.preceding_op_id.index > state.committed_index
                {
                    info!(
                        "P {}: Aborting ops after {} (ours: {}, leader's preceding: {})",
                        self.peer_uuid,
                        req.preceding_op_id.index - 1,
                        local,
                        req.preceding_op_id
                    );
                    state.truncate_after(req.preceding_op_id.index - 1);
                }
            }
            let replica_preceding = state.last_received;
            return Ok(self.rejection(
                &state,
                ConsensusErrorCode::PrecedingEntryDidntMatch,
                format!(
                    "Log matching property violated. Preceding OpId in replica: {}. \
                     Preceding OpId from leader: {}.",
                    replica_preceding, req.preceding_op_id
                ),
            ));
        }

        // 3. Intra-batch monotonicity.
        let mut prev = req.preceding_op_id;
        for op in &req.ops {
            if op.id.index != prev.index + 1 {
                return Ok(self.rejection(
                    &state,
                    ConsensusErrorCode::CannotPrepare,
                    format!(
                        "New operation's index does not follow the previous op's index. \
                         Current: {}. Previous: {}",
                        op.id, prev
                    ),
                ));
            }
            if op.id.term < prev.term {
                return Ok(self.rejection(
                    &state,
                    ConsensusErrorCode::CannotPrepare,
                    format!(
                        "New operation's term is not >= than the previous op's term. \
                         Current: {}. Previous: {}",
                        op.id, prev
                    ),
                ));
            }
            prev = op.id;
        }

        // 4. Dedup ops we already have; truncate and replace at the first
        // divergence.
        let mut new_ops: Vec<ReplicateMsg> = Vec::new();
        for op in &req.ops {
            if !new_ops.is_empty() {
                new_ops.push(op.clone());
                continue;
            }
            match state.received.get(&op.id.index).copied() {
                Some(existing) if existing == op.id => continue,
                Some(existing) => {
                    if op.id.index <= state.committed_index {
                        return Err(ConsensusError::IllegalState(format!(
                            "Leader op {} would overwrite committed op {}",
                            op.id, existing
                        )));
                    }
                    info!(
                        "P {}: Aborting uncommitted ops after index {} to replace {} with {}",
                        self.peer_uuid,
                        op.id.index - 1,
                        existing,
                        op.id
                    );
                    state.truncate_after(op.id.index - 1);
                    new_ops.push(op.clone());
                }
                None => new_ops.push(op.clone()),
            }
        }

        // The index the leader's own data allows us to commit through:
        // the last op of this request, or its preceding op for a pure
        // commit advance. Never beyond what we hold locally.
        let last_from_leader = req.ops.last().map(|op| op.id).unwrap_or(req.preceding_op_id);

        // 5. Memory pressure: reject the new ops, but only after honoring
        // the commit advancement the request implies for ops already in
        // flight.
        let new_bytes: usize = new_ops.iter().map(|op| op.payload.len()).sum();
        if !new_ops.is_empty() && state.pending_bytes + new_bytes > self.options.max_pending_bytes
        {
            let bound = req
                .committed_index
                .min(req.preceding_op_id.index)
                .min(state.last_received.index);
            self.advance_committed(&mut state, bound).await?;
            return Err(ConsensusError::SoftMemoryLimitExceeded {
                requested: new_bytes,
                used: state.pending_bytes,
                limit: self.options.max_pending_bytes,
            });
        }

        // 6. Append the accepted ops as one REPLICATE batch. The response
        // does not wait for durability; the batch's completion is only
        // watched for failure logging.
        if !new_ops.is_empty() {
            for op in &new_ops {
                state.received.insert(op.id.index, op.id);
                state.pending.insert(op.id.index, op.payload.len());
                state.pending_bytes += op.payload.len();
            }
            let last = new_ops.last().expect("new_ops not empty").id;
            state.last_received = last;
            state.last_received_current_leader = last;

            let completion = self
                .log
                .append_replicates(new_ops)
                .await
                .map_err(ConsensusError::Log)?;
            let peer = self.peer_uuid.clone();
            tokio::spawn(async move {
                if let Ok(Err(e)) = completion.await {
                    error!("P {}: Failed to append replicate batch: {}", peer, e);
                }
            });
        }

        // 7. Commit advancement, bounded by ops the leader actually
        // referenced in this request: never commit past what is locally
        // present.
        let bound = req.committed_index.min(last_from_leader.index);
        self.advance_committed(&mut state, bound).await?;

        Ok(self.response(&state))
    }

    /// Writes COMMIT records for every newly committed op and advances the
    /// in-memory commit index.
    async fn advance_committed(
        &self,
        state: &mut ReplicaState,
        bound: u64,
    ) -> Result<(), ConsensusError> {
        if bound <= state.committed_index {
            return Ok(());
        }
        debug_assert!(bound <= state.last_received.index);
        for index in (state.committed_index + 1)..=bound {
            let op = match state.received.get(&index).copied() {
                Some(op) => op,
                None => {
                    return Err(ConsensusError::IllegalState(format!(
                        "cannot commit op at index {}: not received",
                        index
                    )))
                }
            };
            let completion = self
                .log
                .append_commit(CommitMsg {
                    committed_op_id: op,
                })
                .await
                .map_err(ConsensusError::Log)?;
            let peer = self.peer_uuid.clone();
            tokio::spawn(async move {
                if let Ok(Err(e)) = completion.await {
                    error!("P {}: Failed to append COMMIT for {}: {}", peer, op, e);
                }
            });

            if let Some(bytes) = state.pending.remove(&index) {
                state.pending_bytes -= bytes;
            }
            if let Some((cfg_index, cfg)) = state.pending_config.clone() {
                if cfg_index == index {
                    info!(
                        "P {}: Committed config change at index {}: {:?}",
                        self.peer_uuid, index, cfg.voter_uuids
                    );
                    state.committed_config = cfg;
                    state.pending_config = None;
                }
            }
        }
        state.committed_index = bound;
        state.prune_below_committed();
        Ok(())
    }

    /// Handles a candidate's vote request. The vote is durably recorded
    /// before the reply.
    pub async fn request_vote(&self, req: VoteRequest) -> Result<VoteResponse, ConsensusError> {
        let mut state = self.state.lock().await;

        if req.candidate_term > state.current_term {
            state.current_term = req.candidate_term;
            state.voted_for = None;
            state.role = Role::Follower;
            self.persist_meta(&state)?;
        }

        let term_ok = req.candidate_term == state.current_term;
        let not_voted_for_other = state
            .voted_for
            .as_ref()
            .map_or(true, |v| v == &req.candidate_uuid);
        let log_ok = req.candidate_last_op_id >= state.last_received;
        let granted = term_ok && not_voted_for_other && log_ok;

        if granted && state.voted_for.is_none() {
            state.voted_for = Some(req.candidate_uuid.clone());
            self.persist_meta(&state)?;
        }
        debug!(
            "P {}: Vote request from {} for term {}: granted={}",
            self.peer_uuid, req.candidate_uuid, req.candidate_term, granted
        );
        Ok(VoteResponse {
            responder_uuid: self.peer_uuid.clone(),
            responder_term: state.current_term,
            vote_granted: granted,
        })
    }

    /// Assumes leadership of a new term (the embedding server calls this
    /// after winning an election) and replicates the term's initial
    /// no-op. In a single-voter config the no-op commits immediately.
    pub async fn become_leader(&self) -> Result<OpId, ConsensusError> {
        let (id, completion, single_voter) = {
            let mut state = self.state.lock().await;
            state.current_term += 1;
            state.voted_for = Some(self.peer_uuid.clone());
            self.persist_meta(&state)?;
            state.role = Role::Leader;
            state.leader_uuid = Some(self.peer_uuid.clone());
            state.last_received_current_leader = OpId::MIN;

            let id = OpId::new(state.current_term, state.last_received.index + 1);
            let msg = ReplicateMsg::noop(id, self.clock.now_micros());
            let completion = self
                .log
                .append_replicates(vec![msg])
                .await
                .map_err(ConsensusError::Log)?;
            state.received.insert(id.index, id);
            state.pending.insert(id.index, 0);
            state.last_received = id;
            state.last_received_current_leader = id;
            info!(
                "P {}: Becoming leader of term {} (no-op {})",
                self.peer_uuid, state.current_term, id
            );
            (id, completion, state.committed_config.voter_uuids.len() == 1)
        };
        completion
            .await
            .map_err(|_| ConsensusError::Log(LogError::shutting_down()))??;
        if single_voter {
            self.advance_committed_index(id.index).await?;
        }
        Ok(id)
    }

    /// Replicates a client operation. Returns once the op is durable
    /// locally; in a single-voter config it is also committed.
    pub async fn propose(&self, payload: Vec<u8>) -> Result<OpId, ConsensusError> {
        let (id, completion, single_voter) = {
            let mut state = self.state.lock().await;
            if state.role != Role::Leader {
                return Err(ConsensusError::not_the_leader(format!(
                    "Peer {} is not leader of this config",
                    self.peer_uuid
                )));
            }
            let id = OpId::new(state.current_term, state.last_received.index + 1);
            let bytes = payload.len();
            let msg = ReplicateMsg::new(id, self.clock.now_micros(), payload);
            let completion = self
                .log
                .append_replicates(vec![msg])
                .await
                .map_err(ConsensusError::Log)?;
            state.received.insert(id.index, id);
            state.pending.insert(id.index, bytes);
            state.pending_bytes += bytes;
            state.last_received = id;
            state.last_received_current_leader = id;
            (id, completion, state.committed_config.voter_uuids.len() == 1)
        };
        completion
            .await
            .map_err(|_| ConsensusError::Log(LogError::shutting_down()))??;
        if single_voter {
            self.advance_committed_index(id.index).await?;
        }
        Ok(id)
    }

    /// Advances the leader's commit index once the replication queue
    /// reports majority acknowledgement. Bounded by locally received ops.
    pub async fn advance_committed_index(&self, index: u64) -> Result<(), ConsensusError> {
        let mut state = self.state.lock().await;
        if state.role != Role::Leader {
            return Err(ConsensusError::not_the_leader(format!(
                "Peer {} is not leader of this config",
                self.peer_uuid
            )));
        }
        let bound = index.min(state.last_received.index);
        self.advance_committed(&mut state, bound).await
    }

    /// Replicates a configuration change.
    pub async fn change_config(
        &self,
        req: ChangeConfigRequest,
    ) -> Result<ChangeConfigResponse, ConsensusError> {
        let (id, completion, single_voter) = {
            let mut state = self.state.lock().await;
            if state.role != Role::Leader {
                return Err(ConsensusError::not_the_leader(format!(
                    "Peer {} is not leader of this config",
                    self.peer_uuid
                )));
            }
            if state.committed_term() != state.current_term {
                return Err(ConsensusError::IllegalState(
                    "Leader has not yet committed an operation in its own term".to_string(),
                ));
            }
            if state.pending_config.is_some() {
                return Err(ConsensusError::IllegalState(
                    "Configuration change in progress".to_string(),
                ));
            }
            if let Some(cas) = req.cas_config_opid_index {
                if cas != state.committed_config.opid_index {
                    return Err(ConsensusError::cas_failed(format!(
                        "Request specified cas_config_opid_index of {} but the committed \
                         config had opid_index of {}",
                        cas, state.committed_config.opid_index
                    )));
                }
            }

            let id = OpId::new(state.current_term, state.last_received.index + 1);
            let new_config = RaftConfig {
                opid_index: id.index as i64,
                voter_uuids: req.new_voter_uuids,
            };
            let payload = bincode::encode_to_vec(&new_config, bincode::config::standard())
                .map_err(|e| {
                    ConsensusError::InvalidArgument(format!("config encoding failed: {}", e))
                })?;
            let msg = ReplicateMsg::new(id, self.clock.now_micros(), payload);
            let completion = self
                .log
                .append_replicates(vec![msg])
                .await
                .map_err(ConsensusError::Log)?;
            state.received.insert(id.index, id);
            state.pending.insert(id.index, 0);
            state.last_received = id;
            state.last_received_current_leader = id;
            state.pending_config = Some((id.index, new_config));
            (id, completion, state.committed_config.voter_uuids.len() == 1)
        };
        completion
            .await
            .map_err(|_| ConsensusError::Log(LogError::shutting_down()))??;
        if single_voter {
            self.advance_committed_index(id.index).await?;
        }
        Ok(ChangeConfigResponse {
            config_change_op_id: id,
        })
    }

    /// Relinquishes leadership.
    pub async fn leader_step_down(&self) -> Result<(), ConsensusError> {
        let mut state = self.state.lock().await;
        if state.role != Role::Leader {
            return Err(ConsensusError::not_the_leader(format!(
                "Peer {} is not leader of this config",
                self.peer_uuid
            )));
        }
        info!(
            "P {}: Stepping down as leader of term {}",
            self.peer_uuid, state.current_term
        );
        state.role = Role::Follower;
        state.leader_uuid = None;
        Ok(())
    }

    /// The replica's current log status, as a leader would see it in a
    /// response.
    pub async fn consensus_status(&self) -> ConsensusStatus {
        let state = self.state.lock().await;
        self.status_of(&state, None)
    }

    pub async fn current_term(&self) -> u64 {
        self.state.lock().await.current_term
    }

    pub async fn is_leader(&self) -> bool {
        self.state.lock().await.role == Role::Leader
    }

    pub async fn committed_config(&self) -> RaftConfig {
        self.state.lock().await.committed_config.clone()
    }

    /// Retention floors for log GC derived from consensus progress: ops
    /// above the committed index are needed locally, ops above the
    /// all-replicated watermark may be needed by lagging peers.
    pub async fn retention_indexes(&self) -> RetentionIndexes {
        let state = self.state.lock().await;
        RetentionIndexes::new(state.committed_index + 1, state.all_replicated_index + 1)
    }
}

impl std::fmt::Debug for RaftConsensus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaftConsensus")
            .field("peer_uuid", &self.peer_uuid)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::LogOptions;
    use crate::env::StdFsEnv;
    use crate::metrics::LogMetrics;
    use crate::types::Schema;
    use std::path::Path;
    use tempfile::TempDir;

    async fn open_log(root: &Path) -> Arc<Log> {
        let options = LogOptions {
            compression_codec: "none".to_string(),
            ..Default::default()
        };
        Arc::new(
            Log::open(
                options,
                Arc::new(StdFsEnv),
                Arc::new(SystemClock),
                LogMetrics::default(),
                root,
                "tablet-consensus",
                Schema::default(),
                0,
            )
            .await
            .unwrap(),
        )
    }

    async fn start_replica(log: Arc<Log>, voters: Vec<&str>) -> Arc<RaftConsensus> {
        start_replica_with_options(log, voters, ConsensusOptions::default()).await
    }

    async fn start_replica_with_options(
        log: Arc<Log>,
        voters: Vec<&str>,
        options: ConsensusOptions,
    ) -> Arc<RaftConsensus> {
        RaftConsensus::start(
            options,
            Arc::new(StdFsEnv),
            Arc::new(SystemClock),
            log,
            "replica-a".to_string(),
            RaftConfig::initial(voters.into_iter().map(|s| s.to_string()).collect()),
        )
        .await
        .unwrap()
    }

    fn op(term: u64, index: u64) -> ReplicateMsg {
        ReplicateMsg::new(OpId::new(term, index), 1000, vec![index as u8; 8])
    }

    fn request(
        term: u64,
        preceding: OpId,
        ops: Vec<ReplicateMsg>,
        committed_index: u64,
    ) -> ConsensusRequest {
        ConsensusRequest {
            tablet_id: "tablet-consensus".to_string(),
            caller_uuid: "fake_caller".to_string(),
            caller_term: term,
            preceding_op_id: preceding,
            ops,
            committed_index,
            all_replicated_index: 0,
        }
    }

    #[tokio::test]
    async fn test_accepts_ops_and_advances_commit() {
        let dir = TempDir::new().unwrap();
        let log = open_log(dir.path()).await;
        let replica = start_replica(log.clone(), vec!["replica-a", "b", "c"]).await;

        let resp = replica
            .update_consensus(request(
                2,
                OpId::MIN,
                vec![op(2, 1), op(2, 2), op(2, 3)],
                2,
            ))
            .await
            .unwrap();
        assert!(!resp.is_error(), "{:?}", resp);
        assert_eq!(resp.status.last_received, OpId::new(2, 3));
        assert_eq!(resp.status.last_received_current_leader, OpId::new(2, 3));
        assert_eq!(resp.status.last_committed_idx, 2);
        assert_eq!(resp.responder_term, 2);
    }

    #[tokio::test]
    async fn test_rejects_stale_term() {
        let dir = TempDir::new().unwrap();
        let log = open_log(dir.path()).await;
        let replica = start_replica(log.clone(), vec!["replica-a", "b", "c"]).await;

        replica
            .update_consensus(request(5, OpId::MIN, vec![], 0))
            .await
            .unwrap();
        let resp = replica
            .update_consensus(request(3, OpId::MIN, vec![op(3, 1)], 0))
            .await
            .unwrap();
        let err = resp.status.error.unwrap();
        assert_eq!(err.code, ConsensusErrorCode::InvalidTerm);
        assert_eq!(resp.responder_term, 5);
    }

    #[tokio::test]
    async fn test_lmp_mismatch_reports_status() {
        let dir = TempDir::new().unwrap();
        let log = open_log(dir.path()).await;
        let replica = start_replica(log.clone(), vec!["replica-a", "b", "c"]).await;

        replica
            .update_consensus(request(2, OpId::MIN, vec![op(2, 1), op(2, 2)], 1))
            .await
            .unwrap();

        // The leader claims a preceding op we never got.
        let resp = replica
            .update_consensus(request(2, OpId::new(2, 4), vec![op(2, 5)], 1))
            .await
            .unwrap();
        let err = resp.status.error.as_ref().unwrap();
        assert_eq!(err.code, ConsensusErrorCode::PrecedingEntryDidntMatch);
        assert!(
            err.message.contains("Log matching property violated"),
            "{}",
            err.message
        );
        assert_eq!(resp.status.last_received, OpId::new(2, 2));
        assert_eq!(resp.status.last_committed_idx, 1);
    }

    #[tokio::test]
    async fn test_misordered_index_message() {
        let dir = TempDir::new().unwrap();
        let log = open_log(dir.path()).await;
        let replica = start_replica(log.clone(), vec!["replica-a", "b", "c"]).await;

        replica
            .update_consensus(request(2, OpId::MIN, vec![op(2, 1), op(2, 2), op(2, 3), op(2, 4)], 1))
            .await
            .unwrap();

        // Send op 2.6 claiming preceding 2.4: skips index 5.
        let resp = replica
            .update_consensus(request(2, OpId::new(2, 4), vec![op(2, 6)], 1))
            .await
            .unwrap();
        let err = resp.status.error.unwrap();
        assert_eq!(
            err.message,
            "New operation's index does not follow the previous op's index. \
             Current: 2.6. Previous: 2.4"
        );

        // Terms going backwards within the batch.
        let resp = replica
            .update_consensus(request(
                3,
                OpId::new(2, 4),
                vec![op(3, 5), op(2, 6)],
                1,
            ))
            .await
            .unwrap();
        let err = resp.status.error.unwrap();
        assert_eq!(
            err.message,
            "New operation's term is not >= than the previous op's term. \
             Current: 2.6. Previous: 3.5"
        );
    }

    #[tokio::test]
    async fn test_commit_index_bounded_by_ops_from_leader() {
        let dir = TempDir::new().unwrap();
        let log = open_log(dir.path()).await;
        let replica = start_replica(log.clone(), vec!["replica-a", "b", "c"]).await;

        replica
            .update_consensus(request(2, OpId::MIN, vec![op(2, 1), op(2, 2), op(2, 3), op(2, 4)], 1))
            .await
            .unwrap();

        // Re-send op 2.3 with committed_index=4: nothing past the last op
        // the leader referenced (2.3) may commit.
        let resp = replica
            .update_consensus(request(2, OpId::new(2, 2), vec![op(2, 3)], 4))
            .await
            .unwrap();
        assert!(!resp.is_error());
        assert_eq!(resp.status.last_committed_idx, 3);

        // The next push with later ops releases the rest.
        let resp = replica
            .update_consensus(request(2, OpId::new(2, 4), vec![op(2, 5), op(2, 6)], 4))
            .await
            .unwrap();
        assert!(!resp.is_error());
        assert_eq!(resp.status.last_committed_idx, 4);
        assert_eq!(resp.status.last_received, OpId::new(2, 6));
    }

    #[tokio::test]
    async fn test_replace_uncommitted_tail() {
        let dir = TempDir::new().unwrap();
        let log = open_log(dir.path()).await;
        let replica = start_replica(log.clone(), vec!["replica-a", "b", "c"]).await;

        replica
            .update_consensus(request(2, OpId::MIN, vec![op(2, 1), op(2, 2), op(2, 3), op(2, 4)], 2))
            .await
            .unwrap();

        // A new leader replaces 2.4 with 3.4 and appends 3.5.
        let resp = replica
            .update_consensus(request(
                3,
                OpId::new(2, 3),
                vec![op(3, 4), op(3, 5)],
                2,
            ))
            .await
            .unwrap();
        assert!(!resp.is_error(), "{:?}", resp);
        assert_eq!(resp.status.last_received, OpId::new(3, 5));

        // Commit through 5 and confirm the replacement ops are the
        // committed ones.
        let resp = replica
            .update_consensus(request(3, OpId::new(3, 5), vec![], 5))
            .await
            .unwrap();
        assert!(!resp.is_error());
        assert_eq!(resp.status.last_committed_idx, 5);

        // Repeated replacement across many terms stays accepted
        // (idempotent re-election safety).
        let mut term = 3;
        while term < 20 {
            term += 1;
            let resp = replica
                .update_consensus(request(
                    term,
                    OpId::new(3, 5),
                    vec![op(term, 6), op(term, 7)],
                    5,
                ))
                .await
                .unwrap();
            assert!(!resp.is_error(), "term {}: {:?}", term, resp);
            assert_eq!(resp.status.last_received, OpId::new(term, 7));
        }
    }

    #[tokio::test]
    async fn test_duplicate_ops_are_idempotent() {
        let dir = TempDir::new().unwrap();
        let log = open_log(dir.path()).await;
        let replica = start_replica(log.clone(), vec!["replica-a", "b", "c"]).await;

        let req = request(2, OpId::MIN, vec![op(2, 1), op(2, 2)], 0);
        let first = replica.update_consensus(req.clone()).await.unwrap();
        let second = replica.update_consensus(req).await.unwrap();
        assert!(!second.is_error());
        assert_eq!(first.status.last_received, second.status.last_received);
    }

    #[tokio::test]
    async fn test_soft_memory_limit_applies_commits_first() {
        let dir = TempDir::new().unwrap();
        let log = open_log(dir.path()).await;
        let replica = start_replica_with_options(
            log.clone(),
            vec!["replica-a", "b", "c"],
            ConsensusOptions {
                max_pending_bytes: 64,
            },
        )
        .await;

        let resp = replica
            .update_consensus(request(2, OpId::MIN, vec![op(2, 1)], 0))
            .await
            .unwrap();
        assert!(!resp.is_error());

        // This push blows the pending budget but also carries a commit
        // advancement for op 1; the advancement must happen despite the
        // rejection.
        let big = ReplicateMsg::new(OpId::new(2, 2), 1000, vec![0u8; 256]);
        let err = replica
            .update_consensus(request(2, OpId::new(2, 1), vec![big], 1))
            .await
            .unwrap_err();
        assert!(
            err.to_string().contains("Soft memory limit exceeded"),
            "{}",
            err
        );
        let status = replica.consensus_status().await;
        assert_eq!(status.last_committed_idx, 1);
        assert_eq!(status.last_received, OpId::new(2, 1));
    }

    #[tokio::test]
    async fn test_lmp_mismatch_after_restart() {
        let dir = TempDir::new().unwrap();
        {
            let log = open_log(dir.path()).await;
            let replica = start_replica(log.clone(), vec!["replica-a", "b", "c"]).await;
            let resp = replica
                .update_consensus(request(
                    2,
                    OpId::MIN,
                    vec![op(2, 1), op(2, 2), op(2, 3)],
                    2,
                ))
                .await
                .unwrap();
            assert!(!resp.is_error());
            // Make sure the replicates and both COMMIT records are on
            // disk before the "crash".
            log.wait_until_all_flushed().await.unwrap();
            log.close().await.unwrap();
        }

        // Restart: bootstrap from the WAL.
        let log = open_log(dir.path()).await;
        let replica = start_replica(log.clone(), vec!["replica-a", "b", "c"]).await;

        // A term-3 leader pushes 3.4 claiming preceding 3.3. We have 2.3
        // there: LMP mismatch, and the divergent 2.3 is truncated.
        let resp = replica
            .update_consensus(request(3, OpId::new(3, 3), vec![op(3, 4)], 2))
            .await
            .unwrap();
        let err = resp.status.error.as_ref().unwrap();
        assert_eq!(err.code, ConsensusErrorCode::PrecedingEntryDidntMatch);
        assert_eq!(resp.status.last_committed_idx, 2);
        assert_eq!(resp.status.last_received, OpId::new(2, 2));
        assert_eq!(resp.status.last_received_current_leader, OpId::MIN);
    }

    #[tokio::test]
    async fn test_single_voter_leader_lifecycle() {
        let dir = TempDir::new().unwrap();
        let log = open_log(dir.path()).await;
        let replica = start_replica(log.clone(), vec!["replica-a"]).await;

        let noop_id = replica.become_leader().await.unwrap();
        assert_eq!(noop_id, OpId::new(1, 1));
        assert!(replica.is_leader().await);

        let op_id = replica.propose(b"write".to_vec()).await.unwrap();
        assert_eq!(op_id, OpId::new(1, 2));
        let status = replica.consensus_status().await;
        assert_eq!(status.last_committed_idx, 2);

        replica.leader_step_down().await.unwrap();
        assert!(!replica.is_leader().await);
        let err = replica.leader_step_down().await.unwrap_err();
        assert_eq!(err.code(), Some(ConsensusErrorCode::NotTheLeader));
        let err = replica.propose(b"nope".to_vec()).await.unwrap_err();
        assert_eq!(err.code(), Some(ConsensusErrorCode::NotTheLeader));
    }

    #[tokio::test]
    async fn test_change_config_requires_commit_in_own_term() {
        let dir = TempDir::new().unwrap();
        let log = open_log(dir.path()).await;
        // Three voters: the no-op cannot self-commit.
        let replica = start_replica(log.clone(), vec!["replica-a", "b", "c"]).await;
        replica.become_leader().await.unwrap();

        let err = replica
            .change_config(ChangeConfigRequest {
                tablet_id: "tablet-consensus".to_string(),
                cas_config_opid_index: None,
                new_voter_uuids: vec!["replica-a".to_string(), "b".to_string()],
            })
            .await
            .unwrap_err();
        assert!(
            err.to_string()
                .contains("Leader has not yet committed an operation in its own term"),
            "{}",
            err
        );
    }

    #[tokio::test]
    async fn test_change_config_cas() {
        let dir = TempDir::new().unwrap();
        let log = open_log(dir.path()).await;
        let replica = start_replica(log.clone(), vec!["replica-a"]).await;
        replica.become_leader().await.unwrap();

        // Mismatched CAS index.
        let err = replica
            .change_config(ChangeConfigRequest {
                tablet_id: "tablet-consensus".to_string(),
                cas_config_opid_index: Some(99),
                new_voter_uuids: vec!["replica-a".to_string(), "b".to_string()],
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(ConsensusErrorCode::CasFailed));
        assert!(err.to_string().contains("cas_config_opid_index of 99"));
        assert!(err.to_string().contains("opid_index of -1"));

        // Matching CAS succeeds; single voter commits immediately.
        let resp = replica
            .change_config(ChangeConfigRequest {
                tablet_id: "tablet-consensus".to_string(),
                cas_config_opid_index: Some(-1),
                new_voter_uuids: vec!["replica-a".to_string(), "b".to_string()],
            })
            .await
            .unwrap();
        let config = replica.committed_config().await;
        assert_eq!(config.opid_index, resp.config_change_op_id.index as i64);
        assert_eq!(config.voter_uuids.len(), 2);
    }

    #[tokio::test]
    async fn test_request_vote_rules() {
        let dir = TempDir::new().unwrap();
        let log = open_log(dir.path()).await;
        let replica = start_replica(log.clone(), vec!["replica-a", "b", "c"]).await;

        replica
            .update_consensus(request(2, OpId::MIN, vec![op(2, 1), op(2, 2)], 0))
            .await
            .unwrap();

        // Stale candidate log: denied.
        let resp = replica
            .request_vote(VoteRequest {
                tablet_id: "tablet-consensus".to_string(),
                candidate_uuid: "b".to_string(),
                candidate_term: 3,
                candidate_last_op_id: OpId::new(2, 1),
            })
            .await
            .unwrap();
        assert!(!resp.vote_granted);
        assert_eq!(resp.responder_term, 3);

        // Current-enough candidate: granted.
        let resp = replica
            .request_vote(VoteRequest {
                tablet_id: "tablet-consensus".to_string(),
                candidate_uuid: "c".to_string(),
                candidate_term: 3,
                candidate_last_op_id: OpId::new(2, 2),
            })
            .await
            .unwrap();
        assert!(resp.vote_granted);

        // Same term, different candidate: already voted.
        let resp = replica
            .request_vote(VoteRequest {
                tablet_id: "tablet-consensus".to_string(),
                candidate_uuid: "b".to_string(),
                candidate_term: 3,
                candidate_last_op_id: OpId::new(2, 2),
            })
            .await
            .unwrap();
        assert!(!resp.vote_granted);
    }

    #[tokio::test]
    async fn test_vote_survives_restart() {
        let dir = TempDir::new().unwrap();
        {
            let log = open_log(dir.path()).await;
            let replica = start_replica(log.clone(), vec!["replica-a", "b", "c"]).await;
            let resp = replica
                .request_vote(VoteRequest {
                    tablet_id: "tablet-consensus".to_string(),
                    candidate_uuid: "b".to_string(),
                    candidate_term: 4,
                    candidate_last_op_id: OpId::new(3, 10),
                })
                .await
                .unwrap();
            assert!(resp.vote_granted);
            log.close().await.unwrap();
        }

        let log = open_log(dir.path()).await;
        let replica = start_replica(log.clone(), vec!["replica-a", "b", "c"]).await;
        assert_eq!(replica.current_term().await, 4);
        // Same term, different candidate: the durable vote still binds.
        let resp = replica
            .request_vote(VoteRequest {
                tablet_id: "tablet-consensus".to_string(),
                candidate_uuid: "c".to_string(),
                candidate_term: 4,
                candidate_last_op_id: OpId::new(3, 10),
            })
            .await
            .unwrap();
        assert!(!resp.vote_granted);
    }
}
