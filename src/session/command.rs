//! The READY command loop: dispatch, routing and reply forwarding.

use std::time::Instant;

use bytes::Bytes;
use futures::SinkExt;
use tracing::{debug, info, warn};

use crate::auth::{select_backend_credentials, verify_client_token, AuthError, TokenCheck};
use crate::backend::{BackendError, LocalClient, Reply, ReplyKind, ReplyShape};
use crate::metrics::metrics;
use crate::parser::{KillKind, KillSpec, KillTarget, StatementKind};
use crate::protocol::{
    error_codes, ChangeUserRequest, Command, ErrPacket, LogicalPacket, OkPacket,
};
use crate::router::{FilterAction, RouteDecision, RwSplitSession};
use crate::users::{ResolvedHostname, UserSearchOutcome};

use super::state::{PreparedStatement, StagedAuth};
use super::{ClientFramed, Session, SessionError};

/// What the loop does after one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopFlow {
    Continue,
    Quit,
}

/// Which speculative state a collective OK commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommitAction {
    None,
    Database,
    Role,
}

impl Session {
    pub(super) async fn command_loop(
        &mut self,
        framed: &mut ClientFramed,
    ) -> Result<(), SessionError> {
        let idle_timeout = self.ctx.listener.idle_timeout_secs;

        loop {
            let next = if idle_timeout > 0 {
                match tokio::time::timeout(
                    std::time::Duration::from_secs(idle_timeout),
                    self.read_command(framed),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => {
                        info!(session_id = self.id, "closing idle session");
                        return Ok(());
                    }
                }
            } else {
                self.read_command(framed).await
            };

            let packet = match next {
                Ok(Some(packet)) => packet,
                Ok(None) => {
                    debug!(session_id = self.id, "client disconnected");
                    return Ok(());
                }
                Err(SessionError::Killed) => {
                    let err = ErrPacket::new(
                        error_codes::ER_CONNECTION_KILLED,
                        "70100",
                        "Connection killed by hermes",
                    );
                    let _ = framed.send(err.encode(0, self.state.capabilities)).await;
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            match self.dispatch(framed, packet).await? {
                LoopFlow::Continue => {}
                LoopFlow::Quit => return Ok(()),
            }
        }
    }

    async fn dispatch(
        &mut self,
        framed: &mut ClientFramed,
        packet: LogicalPacket,
    ) -> Result<LoopFlow, SessionError> {
        let Some(command) = packet.command() else {
            return self
                .reply_error(
                    framed,
                    ErrPacket::new(error_codes::ER_UNKNOWN_COM_ERROR, "08S01", "Empty command"),
                )
                .await;
        };

        debug!(session_id = self.id, command = ?command, "command");

        match command {
            Command::Quit => {
                // Idle backends go back to the pool, the rest close.
                self.router.close(&self.worker.pool).await;
                Ok(LoopFlow::Quit)
            }
            Command::Query => {
                let sql = String::from_utf8_lossy(&packet.payload[1..]).to_string();
                self.handle_query(framed, packet.payload.clone(), &sql).await
            }
            Command::InitDb => {
                let db = String::from_utf8_lossy(&packet.payload[1..]).to_string();
                self.state.pending_db = Some(db);
                self.route_to_all(
                    framed,
                    packet.payload.clone(),
                    ReplyShape::Generic,
                    true,
                    CommitAction::Database,
                )
                .await
            }
            Command::ChangeUser => self.handle_change_user(framed, &packet).await,
            Command::StmtPrepare => self.handle_prepare(framed, &packet).await,
            Command::StmtExecute => self.handle_execute(framed, &packet).await,
            Command::StmtClose => self.handle_stmt_close(&packet).await,
            Command::StmtFetch => self.handle_stmt_fetch(framed, &packet).await,
            Command::StmtSendLongData => {
                // No reply; goes to every backend that may later execute.
                for index in self.router.connected_indexes() {
                    let _ = self
                        .router
                        .endpoint(index)
                        .write_no_response(packet.payload.clone())
                        .await;
                }
                Ok(LoopFlow::Continue)
            }
            Command::StmtReset | Command::SetOption => {
                self.route_to_all(
                    framed,
                    packet.payload.clone(),
                    ReplyShape::Generic,
                    true,
                    CommitAction::None,
                )
                .await
            }
            Command::ResetConnection => {
                self.history.clear();
                self.state.prepared.clear();
                self.route_to_all(
                    framed,
                    packet.payload.clone(),
                    ReplyShape::Generic,
                    false,
                    CommitAction::None,
                )
                .await
            }
            Command::Ping | Command::Statistics | Command::Debug | Command::ProcessInfo => {
                let shape = if command == Command::Statistics {
                    ReplyShape::Statistics
                } else {
                    ReplyShape::Generic
                };
                self.route_to_one(framed, packet.payload.clone(), shape).await
            }
            Command::FieldList => {
                self.route_read_cmd(framed, packet.payload.clone(), ReplyShape::FieldList)
                    .await
            }
            Command::ProcessKill => {
                if packet.payload.len() < 5 {
                    return self
                        .reply_error(
                            framed,
                            ErrPacket::new(
                                error_codes::ER_UNKNOWN_COM_ERROR,
                                "08S01",
                                "Malformed COM_PROCESS_KILL",
                            ),
                        )
                        .await;
                }
                let id = u32::from_le_bytes([
                    packet.payload[1],
                    packet.payload[2],
                    packet.payload[3],
                    packet.payload[4],
                ]);
                let spec = KillSpec {
                    hard: None,
                    kind: KillKind::Connection,
                    target: KillTarget::Id(id as u64),
                };
                self.execute_kill(framed, spec).await
            }
            Command::BinlogDump | Command::BinlogDumpGtid | Command::RegisterSlave => {
                if !self.ctx.service.allow_replication {
                    return self
                        .reply_error(
                            framed,
                            ErrPacket::new(
                                error_codes::ER_UNKNOWN_COM_ERROR,
                                "08S01",
                                "Replication commands are not allowed on this service",
                            ),
                        )
                        .await;
                }
                self.route_write_cmd(framed, packet.payload.clone(), ReplyShape::Generic)
                    .await
            }
            _ => {
                self.route_write_cmd(framed, packet.payload.clone(), ReplyShape::Generic)
                    .await
            }
        }
    }

    async fn handle_query(
        &mut self,
        framed: &mut ClientFramed,
        payload: Bytes,
        sql: &str,
    ) -> Result<LoopFlow, SessionError> {
        let classification = self.classifier.classify(sql);

        // Filters first; any of them may answer without routing.
        let mut payload = payload;
        let mut short_circuit = None;
        for filter in &mut self.filters {
            match filter.on_query(payload.clone(), &classification) {
                FilterAction::Pass(next) => payload = next,
                FilterAction::ShortCircuit(err) => {
                    short_circuit = Some(err);
                    break;
                }
            }
        }
        if let Some(err) = short_circuit {
            return self.reply_error(framed, err).await;
        }

        match classification.kind.clone() {
            StatementKind::Kill(spec) => {
                if spec.kind == KillKind::QueryId {
                    // Server-scoped query ids; the master resolves them.
                    return self
                        .route_write_cmd(framed, payload, ReplyShape::Generic)
                        .await;
                }
                self.execute_kill(framed, spec).await
            }
            StatementKind::Use(db) => {
                self.state.pending_db = Some(db);
                self.route_to_all(
                    framed,
                    payload,
                    ReplyShape::Generic,
                    true,
                    CommitAction::Database,
                )
                .await
            }
            StatementKind::SetRole(role) => {
                self.state.pending_role = Some(role);
                self.route_to_all(framed, payload, ReplyShape::Generic, true, CommitAction::Role)
                    .await
            }
            StatementKind::SetSqlMode(mode) => {
                self.state.apply_sql_mode(mode);
                self.route_to_all(framed, payload, ReplyShape::Generic, true, CommitAction::None)
                    .await
            }
            StatementKind::SetAutocommit(_) | StatementKind::Session => {
                self.route_to_all(framed, payload, ReplyShape::Generic, true, CommitAction::None)
                    .await
            }
            StatementKind::Begin => {
                self.route_write_cmd(framed, payload, ReplyShape::Generic).await
            }
            StatementKind::Commit | StatementKind::Rollback => {
                self.state.trx.ending = true;
                self.route_write_cmd(framed, payload, ReplyShape::Generic).await
            }
            StatementKind::Read => {
                // Inside a read-write transaction everything sticks to
                // the master; read-only transactions may use replicas.
                if self.state.trx.active && !self.state.trx.read_only {
                    self.route_write_cmd(framed, payload, ReplyShape::Generic).await
                } else {
                    self.route_read_cmd(framed, payload, ReplyShape::Generic).await
                }
            }
            _ => self.route_write_cmd(framed, payload, ReplyShape::Generic).await,
        }
    }

    async fn handle_prepare(
        &mut self,
        framed: &mut ClientFramed,
        packet: &LogicalPacket,
    ) -> Result<LoopFlow, SessionError> {
        let sql = String::from_utf8_lossy(&packet.payload[1..]).to_string();
        let classification = self.classifier.classify(&sql);

        // The statement id is the history id: assigning both from one
        // counter keeps STMT_CLOSE removal a single lookup.
        let id = self.history.allocate_id();
        let shape = ReplyShape::Prepare {
            proxy_statement_id: id,
        };

        let flow = self
            .route_to_all_recorded(
                framed,
                packet.payload.clone(),
                shape,
                Some(id),
                CommitAction::None,
            )
            .await?;

        // Metadata was installed when the authoritative reply landed;
        // stash the classification for routing executes.
        if let Some(prepared) = self.state.prepared.get_mut(&id) {
            prepared.classification = Some(classification);
        }
        Ok(flow)
    }

    async fn handle_execute(
        &mut self,
        framed: &mut ClientFramed,
        packet: &LogicalPacket,
    ) -> Result<LoopFlow, SessionError> {
        if packet.payload.len() < 10 {
            return self
                .reply_error(
                    framed,
                    ErrPacket::new(
                        error_codes::ER_UNKNOWN_COM_ERROR,
                        "08S01",
                        "Malformed COM_STMT_EXECUTE",
                    ),
                )
                .await;
        }
        let stmt_id = u32::from_le_bytes([
            packet.payload[1],
            packet.payload[2],
            packet.payload[3],
            packet.payload[4],
        ]);

        // Record the parameter type block when the new-params flag is
        // set, keyed by statement id; replays of executes rely on it.
        let is_read = {
            let Some(prepared) = self.state.prepared.get_mut(&stmt_id) else {
                return self
                    .reply_error(
                        framed,
                        ErrPacket::new(
                            error_codes::ER_UNKNOWN_COM_ERROR,
                            "HY000",
                            format!("Unknown prepared statement handler ({stmt_id})"),
                        ),
                    )
                    .await;
            };
            if prepared.param_count > 0 {
                let null_bitmap_len = (prepared.param_count as usize + 7) / 8;
                let flag_offset = 10 + null_bitmap_len;
                if packet.payload.len() > flag_offset && packet.payload[flag_offset] == 1 {
                    let types_start = flag_offset + 1;
                    let types_len = prepared.param_count as usize * 2;
                    if packet.payload.len() >= types_start + types_len {
                        prepared.type_block =
                            Some(packet.payload.slice(types_start..types_start + types_len));
                    }
                }
            }
            prepared
                .classification
                .as_ref()
                .map(|c| c.is_read_only)
                .unwrap_or(false)
        };

        let routed = if is_read && !(self.state.trx.active && !self.state.trx.read_only) {
            self.route_read_cmd(framed, packet.payload.clone(), ReplyShape::Generic)
                .await
        } else {
            self.route_write_cmd(framed, packet.payload.clone(), ReplyShape::Generic)
                .await
        };

        // Cursor fetches must hit the same backend.
        if let Some(prepared) = self.state.prepared.get_mut(&stmt_id) {
            prepared.last_endpoint = self.last_routed_endpoint;
        }
        routed
    }

    async fn handle_stmt_close(&mut self, packet: &LogicalPacket) -> Result<LoopFlow, SessionError> {
        if packet.payload.len() < 5 {
            return Ok(LoopFlow::Continue);
        }
        let stmt_id = u32::from_le_bytes([
            packet.payload[1],
            packet.payload[2],
            packet.payload[3],
            packet.payload[4],
        ]);

        // The prepare with this id disappears from the history and the
        // metadata table; a later replay does not include it.
        self.history.remove_prepare(stmt_id);
        self.state.prepared.remove(&stmt_id);

        for index in self.router.connected_indexes() {
            let _ = self
                .router
                .endpoint(index)
                .write_no_response(packet.payload.clone())
                .await;
        }
        Ok(LoopFlow::Continue)
    }

    async fn handle_stmt_fetch(
        &mut self,
        framed: &mut ClientFramed,
        packet: &LogicalPacket,
    ) -> Result<LoopFlow, SessionError> {
        // Cursors live on the backend that executed the statement.
        let target = packet
            .payload
            .get(1..5)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .and_then(|id| self.state.prepared.get(&id))
            .and_then(|p| p.last_endpoint);

        match target {
            Some(index) => {
                self.route_and_forward(framed, index, packet.payload.clone(), ReplyShape::Generic)
                    .await?;
                Ok(LoopFlow::Continue)
            }
            None => {
                self.route_write_cmd(framed, packet.payload.clone(), ReplyShape::Generic)
                    .await
            }
        }
    }

    /// COM_CHANGE_USER: authenticate the new credentials, stage them,
    /// route the change to the backends and commit or revert on their
    /// collective verdict.
    async fn handle_change_user(
        &mut self,
        framed: &mut ClientFramed,
        packet: &LogicalPacket,
    ) -> Result<LoopFlow, SessionError> {
        let Some(request) = ChangeUserRequest::parse(&packet.payload, self.state.capabilities)
        else {
            return self
                .reply_error(
                    framed,
                    ErrPacket::new(
                        error_codes::ER_UNKNOWN_COM_ERROR,
                        "08S01",
                        "Malformed COM_CHANGE_USER",
                    ),
                )
                .await;
        };

        let client_host = self.state.client_addr.clone();
        let requested_db = request.database.clone().unwrap_or_default();

        self.worker.user_cache.update_from_manager();
        let result = self.worker.user_cache.find_user(
            &request.username,
            &self.state.client_addr,
            &requested_db,
            &self.ctx.search_settings,
            &ResolvedHostname::default(),
        );

        // The token was computed against the session's original scramble.
        let auth_result: Result<Vec<u8>, AuthError> = (|| {
            if result.outcome == UserSearchOutcome::BadDb {
                return Err(AuthError::unknown_database(&requested_db));
            }
            if result.outcome == UserSearchOutcome::DbAccessDenied {
                return Err(AuthError::db_access_denied(
                    &request.username,
                    &client_host,
                    &requested_db,
                ));
            }
            if result.outcome != UserSearchOutcome::Ok {
                return Err(AuthError::access_denied(
                    &request.username,
                    &client_host,
                    !request.auth_response.is_empty(),
                ));
            }
            match verify_client_token(&result.entry, &self.scramble, &request.auth_response)? {
                TokenCheck::Ok { sha1_password } => Ok(sha1_password),
                _ => Err(AuthError::access_denied(
                    &request.username,
                    &client_host,
                    !request.auth_response.is_empty(),
                )),
            }
        })();

        let sha1_password = match auth_result {
            Ok(sha1) => sha1,
            Err(err) => {
                self.ctx.record_auth_failure(&client_host);
                metrics().record_auth("change_user_denied");
                let packet = ErrPacket::new(err.code, err.sql_state, err.message);
                return self.reply_error(framed, packet).await;
            }
        };

        let credentials =
            select_backend_credentials(&self.ctx.auth_config, &request.username, sha1_password);
        let staged = StagedAuth {
            entry: result.entry.clone(),
            username: request.username.clone(),
            database: request.database.clone(),
            role: if result.entry.default_role.is_empty() {
                None
            } else {
                Some(result.entry.default_role.clone())
            },
            credentials: credentials.clone(),
        };
        self.state.stage_auth(staged);

        // With no live backends (lazy connect) the local verdict stands;
        // fresh connections authenticate as the new user anyway.
        if self.router.connected_indexes().is_empty() {
            self.state.commit_staged_auth();
            *self.handle.username.lock() = request.username.clone();
            self.history.clear();
            let ok = OkPacket::new();
            framed
                .send(ok.encode(self.out_seq, self.state.capabilities))
                .await?;
            return Ok(LoopFlow::Continue);
        }

        // Route to every live backend and wait for the collective OK.
        let mut verdict: Option<Reply> = None;
        let mut failed = false;
        for index in self.router.connected_indexes() {
            match self
                .router
                .endpoint(index)
                .change_user(&credentials, request.database.as_deref())
                .await
            {
                Ok(reply) => {
                    if reply.is_err() {
                        failed = true;
                        verdict = Some(reply);
                        break;
                    }
                    if verdict.is_none() {
                        verdict = Some(reply);
                    }
                }
                Err(e) => {
                    warn!(session_id = self.id, error = %e, "backend CHANGE_USER failed");
                    failed = true;
                    break;
                }
            }
        }

        if failed || verdict.is_none() {
            // Prior auth data stays in force.
            self.state.revert_staged_auth();
            let reply = verdict.unwrap_or_else(|| Reply {
                frames: vec![],
                kind: ReplyKind::Err(ErrPacket::new(
                    error_codes::ER_ACCESS_DENIED_ERROR,
                    "28000",
                    "CHANGE_USER rejected by backend",
                )),
                session_track: vec![],
                status_flags: 0,
            });
            match reply.kind {
                ReplyKind::Err(err) => return self.reply_error(framed, err).await,
                _ => {
                    return self
                        .reply_error(
                            framed,
                            ErrPacket::new(
                                error_codes::ER_ACCESS_DENIED_ERROR,
                                "28000",
                                "CHANGE_USER rejected by backend",
                            ),
                        )
                        .await
                }
            }
        }

        // Collective OK: commit the staged identity, clear the history.
        self.state.commit_staged_auth();
        *self.handle.username.lock() = request.username.clone();
        self.history.clear();
        info!(session_id = self.id, user = %request.username, "user changed");

        let ok = OkPacket::new();
        framed
            .send(ok.encode(self.out_seq, self.state.capabilities))
            .await?;
        Ok(LoopFlow::Continue)
    }

    /// KILL: resolve the target sessions, kill their backend threads via
    /// short-lived auxiliary clients, then answer the initiator once all
    /// auxiliary operations finished.
    async fn execute_kill(
        &mut self,
        framed: &mut ClientFramed,
        spec: KillSpec,
    ) -> Result<LoopFlow, SessionError> {
        metrics().kills_total.inc();

        let targets = match &spec.target {
            KillTarget::Id(id) => match self.ctx.registry.get(*id) {
                Some(handle) => vec![(*id, handle)],
                None => {
                    return self
                        .reply_error(
                            framed,
                            ErrPacket::new(
                                error_codes::ER_NO_SUCH_THREAD,
                                "HY000",
                                format!("Unknown thread id: {id}"),
                            ),
                        )
                        .await;
                }
            },
            KillTarget::User(user) => self.ctx.registry.sessions_of_user(user),
        };

        let hard = match spec.hard {
            Some(true) => "HARD ",
            Some(false) => "SOFT ",
            None => "",
        };
        let verb = match spec.kind {
            KillKind::Query => "QUERY ",
            _ => "",
        };

        for (session_id, handle) in &targets {
            for backend in handle.backends() {
                let kill_sql = format!("KILL {hard}{verb}{}", backend.thread_id);
                match LocalClient::connect(
                    &backend.server_addr,
                    &self.ctx.service.user,
                    &self.ctx.service.password,
                    None,
                )
                .await
                {
                    Ok(mut client) => {
                        if let Err(e) = client.execute(&kill_sql).await {
                            debug!(
                                target_session = session_id,
                                server = %backend.server_name,
                                error = %e,
                                "auxiliary KILL failed"
                            );
                        }
                    }
                    Err(e) => {
                        warn!(
                            server = %backend.server_name,
                            error = %e,
                            "could not open auxiliary connection for KILL"
                        );
                    }
                }
            }
            if spec.kind != KillKind::Query {
                // Wake the victim; it answers 1927 and hangs up pending
                // backends itself.
                handle.kill();
            }
        }

        let ok = OkPacket::new();
        framed
            .send(ok.encode(self.out_seq, self.state.capabilities))
            .await?;
        Ok(LoopFlow::Continue)
    }

    /// Route to the master per the write policy.
    async fn route_write_cmd(
        &mut self,
        framed: &mut ClientFramed,
        payload: Bytes,
        shape: ReplyShape,
    ) -> Result<LoopFlow, SessionError> {
        let can_recover = RwSplitSession::can_recover(
            true,
            self.state.trx.active,
            self.state.trx.ending,
        );
        let credentials = self.credentials()?;
        let database = self.state.current_db.clone();

        let decision = self
            .router
            .route_write(
                &self.worker.pool,
                &credentials,
                database.as_deref(),
                &self.history.replay_list(),
                can_recover,
            )
            .await;

        match decision {
            Ok(RouteDecision::Master(index)) | Ok(RouteDecision::Slave(index)) => {
                self.register_backends();
                metrics().queries_routed_total.with_label_values(&["master"]).inc();
                self.route_and_forward(framed, index, payload, shape).await?;
                Ok(LoopFlow::Continue)
            }
            Err(e) if e.fatal => {
                let err = ErrPacket::new(error_codes::ER_UNKNOWN_ERROR, "HY000", e.message.clone());
                let _ = framed
                    .send(err.encode(self.out_seq, self.state.capabilities))
                    .await;
                Err(SessionError::Routing(e.message))
            }
            Err(e) => {
                self.reply_error(
                    framed,
                    ErrPacket::new(error_codes::ER_UNKNOWN_ERROR, "HY000", e.message),
                )
                .await
            }
        }
    }

    /// Route to a replica per the read policy.
    async fn route_read_cmd(
        &mut self,
        framed: &mut ClientFramed,
        payload: Bytes,
        shape: ReplyShape,
    ) -> Result<LoopFlow, SessionError> {
        let credentials = self.credentials()?;
        let database = self.state.current_db.clone();

        let decision = self
            .router
            .route_read(
                &self.worker.pool,
                &credentials,
                database.as_deref(),
                &self.history.replay_list(),
            )
            .await;

        match decision {
            Ok(RouteDecision::Slave(index)) => {
                self.register_backends();
                metrics().queries_routed_total.with_label_values(&["slave"]).inc();
                self.route_and_forward(framed, index, payload, shape).await?;
                Ok(LoopFlow::Continue)
            }
            Ok(RouteDecision::Master(index)) => {
                self.register_backends();
                metrics().queries_routed_total.with_label_values(&["master"]).inc();
                self.route_and_forward(framed, index, payload, shape).await?;
                Ok(LoopFlow::Continue)
            }
            Err(e) => {
                if self.router.config().retry_failed_reads {
                    debug!(session_id = self.id, "read routing failed, trying master");
                    return self.route_write_cmd(framed, payload, shape).await;
                }
                self.reply_error(
                    framed,
                    ErrPacket::new(error_codes::ER_UNKNOWN_ERROR, "HY000", e.message),
                )
                .await
            }
        }
    }

    /// Route to any live backend, preferring the master. For commands
    /// like PING that any server can answer.
    async fn route_to_one(
        &mut self,
        framed: &mut ClientFramed,
        payload: Bytes,
        shape: ReplyShape,
    ) -> Result<LoopFlow, SessionError> {
        let connected = self.router.connected_indexes();
        let index = self
            .router
            .master_index()
            .filter(|i| connected.contains(i))
            .or_else(|| connected.first().copied());

        match index {
            Some(index) => {
                self.route_and_forward(framed, index, payload, shape).await?;
                Ok(LoopFlow::Continue)
            }
            None => self.route_write_cmd(framed, payload, shape).await,
        }
    }

    /// Route a session command to every backend in use, record it in the
    /// history, forward the first complete reply and compare the rest
    /// against it.
    async fn route_to_all(
        &mut self,
        framed: &mut ClientFramed,
        payload: Bytes,
        shape: ReplyShape,
        record: bool,
        commit: CommitAction,
    ) -> Result<LoopFlow, SessionError> {
        let history_id = if record {
            Some(self.history.allocate_id())
        } else {
            None
        };
        self.route_to_all_recorded(framed, payload, shape, history_id, commit)
            .await
    }

    async fn route_to_all_recorded(
        &mut self,
        framed: &mut ClientFramed,
        payload: Bytes,
        shape: ReplyShape,
        history_id: Option<u32>,
        commit: CommitAction,
    ) -> Result<LoopFlow, SessionError> {
        let mut connected = self.router.connected_indexes();
        if connected.is_empty() {
            // Nothing open yet (lazy mode): bring up the master first.
            let can_recover =
                RwSplitSession::can_recover(true, self.state.trx.active, self.state.trx.ending);
            let credentials = self.credentials()?;
            let database = self.state.current_db.clone();
            match self
                .router
                .route_write(
                    &self.worker.pool,
                    &credentials,
                    database.as_deref(),
                    &self.history.replay_list(),
                    can_recover,
                )
                .await
            {
                Ok(_) => {
                    self.register_backends();
                    connected = self.router.connected_indexes();
                }
                Err(e) => {
                    self.state.discard_pending();
                    return self
                        .reply_error(
                            framed,
                            ErrPacket::new(error_codes::ER_UNKNOWN_ERROR, "HY000", e.message),
                        )
                        .await;
                }
            }
        }

        if let Some(id) = history_id {
            self.history.record_pending(id, payload.clone(), shape);
            metrics().session_commands_total.inc();
        }

        metrics().queries_routed_total.with_label_values(&["all"]).inc();
        self.expected_responses += 1;

        // Write everywhere, then collect replies; the first complete one
        // is authoritative and goes to the client.
        let mut write_failures = Vec::new();
        for &index in &connected {
            if let Err(e) = self
                .router
                .endpoint(index)
                .write(payload.clone(), shape)
                .await
            {
                warn!(session_id = self.id, error = %e, "session command write failed");
                write_failures.push(index);
            }
        }

        let mut authoritative: Option<Reply> = None;
        for &index in &connected {
            if write_failures.contains(&index) {
                continue;
            }
            match self.router.endpoint(index).read_reply().await {
                Ok(reply) => {
                    if authoritative.is_none() {
                        authoritative = Some(reply);
                    } else if let Some(id) = history_id {
                        // Late replies must agree with the accepted one.
                        if !self.history.check_response(id, reply.outcome_digest()) {
                            metrics().replay_mismatches_total.inc();
                            warn!(
                                session_id = self.id,
                                history_id = id,
                                server = self.router.endpoint(index).server().name(),
                                "session command outcome diverged between backends"
                            );
                        }
                    }
                }
                Err(e) => {
                    warn!(session_id = self.id, error = %e, "session command reply failed");
                }
            }
        }

        let Some(reply) = authoritative else {
            self.expected_responses -= 1;
            self.history.discard_pending();
            self.state.discard_pending();
            return self
                .reply_error(
                    framed,
                    ErrPacket::new(
                        error_codes::ER_UNKNOWN_ERROR,
                        "HY000",
                        "No backend answered the session command",
                    ),
                )
                .await;
        };

        if let Some(id) = history_id {
            if reply.is_ok() {
                self.history.commit_pending(reply.outcome_digest());
                // Install prepared-statement metadata now that the id is
                // committed.
                if let ReplyKind::PrepareOk {
                    statement_id,
                    num_params,
                    ..
                } = reply.kind
                {
                    self.state.prepared.insert(
                        statement_id,
                        PreparedStatement {
                            param_count: num_params,
                            type_block: None,
                            classification: None,
                            last_endpoint: None,
                        },
                    );
                }
            } else {
                self.history.discard_pending();
            }
        }

        // Speculative state commits only on OK.
        if reply.is_ok() {
            match commit {
                CommitAction::Database => self.state.commit_pending_db(),
                CommitAction::Role => self.state.commit_pending_role(),
                CommitAction::None => {}
            }
        } else {
            self.state.discard_pending();
        }

        self.forward_reply(framed, reply, None).await?;
        Ok(LoopFlow::Continue)
    }

    /// Send one command to one endpoint, with one reconnect-and-replay
    /// recovery attempt on transient failure.
    async fn route_and_forward(
        &mut self,
        framed: &mut ClientFramed,
        index: usize,
        payload: Bytes,
        shape: ReplyShape,
    ) -> Result<(), SessionError> {
        self.expected_responses += 1;
        self.last_routed_endpoint = Some(index);
        let started = Instant::now();

        let first_try = self.send_and_collect(index, payload.clone(), shape).await;
        let reply = match first_try {
            Ok(reply) => reply,
            Err(e) if e.is_transient()
                && RwSplitSession::can_recover(
                    true,
                    self.state.trx.active,
                    self.state.trx.ending,
                ) =>
            {
                info!(
                    session_id = self.id,
                    server = self.router.endpoint(index).server().name(),
                    error = %e,
                    "transient backend failure, reconnecting"
                );
                metrics().backend_recoveries_total.inc();
                self.recover_endpoint(index).await?;
                self.send_and_collect(index, payload, shape)
                    .await
                    .map_err(|e| {
                        self.expected_responses -= 1;
                        SessionError::Backend(e)
                    })?
            }
            Err(e) => {
                self.expected_responses -= 1;
                let err = ErrPacket::new(
                    error_codes::ER_UNKNOWN_ERROR,
                    "HY000",
                    format!("Backend failure: {e}"),
                );
                framed
                    .send(err.encode(self.out_seq, self.state.capabilities))
                    .await?;
                return Err(SessionError::Backend(e));
            }
        };

        metrics()
            .query_duration_seconds
            .with_label_values(&["statement"])
            .observe(started.elapsed().as_secs_f64());

        self.forward_reply(framed, reply, Some(index)).await
    }

    async fn send_and_collect(
        &mut self,
        index: usize,
        payload: Bytes,
        shape: ReplyShape,
    ) -> Result<Reply, BackendError> {
        let endpoint = self.router.endpoint(index);
        endpoint.write(payload, shape).await?;
        endpoint.read_reply().await
    }

    /// Tear down and rebuild one endpoint's connection, replaying the
    /// history and verifying the replayed outcomes.
    async fn recover_endpoint(&mut self, index: usize) -> Result<(), SessionError> {
        let credentials = self.credentials()?;
        let database = self.state.current_db.clone();
        let replay = self.history.replay_list();

        self.router.endpoint(index).hang_up(&self.worker.pool);
        metrics().history_replays_total.inc();

        let outcome = self
            .router
            .endpoint(index)
            .connect(&self.worker.pool, &credentials, database.as_deref(), &replay)
            .await?;

        if let crate::backend::ConnectOutcome::Connected(results) = outcome {
            for (id, reply) in results {
                if !self.history.check_response(id, reply.outcome_digest()) {
                    metrics().replay_mismatches_total.inc();
                    warn!(
                        session_id = self.id,
                        history_id = id,
                        server = self.router.endpoint(index).server().name(),
                        "history replay diverged from recorded outcome"
                    );
                }
            }
        }
        self.register_backends();
        Ok(())
    }

    /// Write a complete reply to the client, renumbering frames to
    /// continue the command's sequence. Updates transaction state and
    /// GTID watermarks from the reply metadata.
    async fn forward_reply(
        &mut self,
        framed: &mut ClientFramed,
        reply: Reply,
        endpoint: Option<usize>,
    ) -> Result<(), SessionError> {
        debug_assert!(self.expected_responses > 0);
        self.expected_responses = self.expected_responses.saturating_sub(1);

        // Track transaction and schema state from the reply.
        self.state.trx.update_from_status(reply.status_flags);
        for track in &reply.session_track {
            match track {
                crate::protocol::SessionTrack::Schema(schema) => {
                    self.state.current_db = Some(schema.clone());
                }
                crate::protocol::SessionTrack::Gtid(gtid) => {
                    self.router.note_gtid(gtid);
                }
                _ => {}
            }
        }

        let trace = endpoint.map(|i| {
            crate::router::ReplyTrace::single(self.router.endpoint(i).server().name().to_string())
                .through(self.ctx.service.name.clone())
        });
        if let Some(trace) = &trace {
            for filter in &mut self.filters {
                filter.on_reply(&reply, trace);
            }
        }

        for mut frame in reply.frames {
            frame.sequence_id = self.out_seq;
            self.out_seq = self.out_seq.wrapping_add(1);
            framed.feed(frame).await?;
        }
        SinkExt::<crate::protocol::Packet>::flush(framed).await?;
        Ok(())
    }

    /// Answer the client directly with an error; the session continues.
    async fn reply_error(
        &mut self,
        framed: &mut ClientFramed,
        err: ErrPacket,
    ) -> Result<LoopFlow, SessionError> {
        framed
            .send(err.encode(self.out_seq, self.state.capabilities))
            .await?;
        Ok(LoopFlow::Continue)
    }

    fn credentials(&self) -> Result<crate::auth::BackendCredentials, SessionError> {
        self.state
            .backend_credentials
            .clone()
            .ok_or_else(|| SessionError::Protocol("session has no backend credentials".into()))
    }
}
