//! Per-(session, target) backend handles.
//!
//! An endpoint owns at most one physical connection at a time. Opening
//! goes through the worker pool: a pooled connection is reset and given
//! the session's command history, a fresh one is authenticated and then
//! replays the history. When the target is at capacity the endpoint
//! buffers writes until a slot frees.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use crate::auth::BackendCredentials;
use crate::target::Server;

use super::connection::{BackendConnection, BackendError, Reply, ReplyShape};
use super::pool::WorkerPool;

/// Endpoint lifecycle. Only `Connected` accepts new requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    NoConn,
    Connected,
    ConnectedFailed,
    IdlePooled,
    WaitingForConn,
}

/// How a connection attempt concluded.
pub enum ConnectOutcome {
    /// Connected; carries the history replay results of a fresh or
    /// reset connection for the router to verify.
    Connected(Vec<(u32, Reply)>),
    /// Target at capacity; writes are being buffered.
    Waiting,
}

pub struct Endpoint {
    server: Arc<Server>,
    state: EndpointState,
    conn: Option<BackendConnection>,
    buffered: VecDeque<(Bytes, ReplyShape)>,
    /// Per-target connection cap (0 = unlimited).
    max_connections: usize,
}

impl Endpoint {
    pub fn new(server: Arc<Server>, max_connections: usize) -> Self {
        Self {
            server,
            state: EndpointState::NoConn,
            conn: None,
            buffered: VecDeque::new(),
            max_connections,
        }
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    pub fn state(&self) -> EndpointState {
        self.state
    }

    pub fn in_use(&self) -> bool {
        matches!(
            self.state,
            EndpointState::Connected | EndpointState::WaitingForConn
        )
    }

    pub fn is_idle(&self) -> bool {
        self.conn.as_ref().map(|c| c.idle()).unwrap_or(true)
    }

    pub fn thread_id(&self) -> Option<u32> {
        self.conn.as_ref().map(|c| c.thread_id())
    }

    pub fn outstanding_replies(&self) -> usize {
        self.conn
            .as_ref()
            .map(|c| c.outstanding_replies())
            .unwrap_or(0)
    }

    /// Open (or adopt from the pool) a physical connection and replay the
    /// session history on it.
    pub async fn connect(
        &mut self,
        pool: &WorkerPool,
        credentials: &BackendCredentials,
        database: Option<&str>,
        history: &[(u32, Bytes, ReplyShape)],
    ) -> Result<ConnectOutcome, BackendError> {
        debug_assert!(matches!(
            self.state,
            EndpointState::NoConn
                | EndpointState::WaitingForConn
                | EndpointState::ConnectedFailed
                | EndpointState::IdlePooled
        ));

        let mut conn = match pool.take(&self.server, &credentials.pool_key()) {
            Some(mut pooled) => {
                // Another session used this connection; wipe its state
                // before installing ours.
                pooled
                    .send_command(Bytes::from_static(&[0x1f]), ReplyShape::Generic)
                    .await?;
                let reset = pooled.read_reply().await?;
                if reset.is_err() {
                    pooled.quit().await;
                    pool.release_slot(self.server.name());
                    return Err(BackendError::Protocol(
                        "pooled connection failed COM_RESET_CONNECTION".into(),
                    ));
                }
                pooled
            }
            None => {
                if !pool.reserve(&self.server, self.max_connections) {
                    self.state = EndpointState::WaitingForConn;
                    return Ok(ConnectOutcome::Waiting);
                }
                match BackendConnection::connect(self.server.clone(), credentials, database).await
                {
                    Ok(conn) => conn,
                    Err(e) => {
                        pool.release_slot(self.server.name());
                        self.state = EndpointState::ConnectedFailed;
                        return Err(e);
                    }
                }
            }
        };

        let replayed = match conn.replay_history(history).await {
            Ok(results) => results,
            Err(e) => {
                conn.quit().await;
                pool.release_slot(self.server.name());
                self.state = EndpointState::ConnectedFailed;
                return Err(e);
            }
        };

        self.conn = Some(conn);
        self.state = EndpointState::Connected;

        // Release anything queued while we waited for capacity.
        while let Some((payload, shape)) = self.buffered.pop_front() {
            self.conn
                .as_mut()
                .expect("just installed")
                .send_command(payload, shape)
                .await?;
        }

        Ok(ConnectOutcome::Connected(replayed))
    }

    /// Install an already-authenticated connection (passthrough auth).
    pub fn adopt(&mut self, conn: BackendConnection) {
        self.conn = Some(conn);
        self.state = EndpointState::Connected;
    }

    /// Route one command. In `WaitingForConn` the packet is buffered.
    pub async fn write(&mut self, payload: Bytes, shape: ReplyShape) -> Result<(), BackendError> {
        match self.state {
            EndpointState::Connected => {
                self.conn
                    .as_mut()
                    .expect("connected endpoint has a connection")
                    .send_command(payload, shape)
                    .await
            }
            EndpointState::WaitingForConn => {
                self.buffered.push_back((payload, shape));
                Ok(())
            }
            other => Err(BackendError::Protocol(format!(
                "endpoint for '{}' cannot accept requests in state {:?}",
                self.server.name(),
                other
            ))),
        }
    }

    /// Route a command that produces no reply.
    pub async fn write_no_response(&mut self, payload: Bytes) -> Result<(), BackendError> {
        match self.state {
            EndpointState::Connected => {
                self.conn
                    .as_mut()
                    .expect("connected endpoint has a connection")
                    .send_no_response(payload)
                    .await
            }
            _ => Ok(()),
        }
    }

    /// Run COM_CHANGE_USER on the live connection.
    pub async fn change_user(
        &mut self,
        credentials: &BackendCredentials,
        database: Option<&str>,
    ) -> Result<Reply, BackendError> {
        match self.conn.as_mut() {
            Some(conn) => conn.change_user(credentials, database).await,
            None => Err(BackendError::Protocol(
                "COM_CHANGE_USER on an unconnected endpoint".into(),
            )),
        }
    }

    pub async fn read_reply(&mut self) -> Result<Reply, BackendError> {
        match self.conn.as_mut() {
            Some(conn) => conn.read_reply().await,
            None => Err(BackendError::Protocol(
                "reading a reply from an unconnected endpoint".into(),
            )),
        }
    }

    /// Move the connection into the pool; only possible when idle.
    pub fn release_to_pool(&mut self, pool: &WorkerPool) {
        if let Some(conn) = self.conn.take() {
            if conn.idle() {
                debug!(server = self.server.name(), "pooling backend connection");
                pool.put(conn);
                self.state = EndpointState::IdlePooled;
            } else {
                // Mid-reply connections cannot be reused.
                conn.server().connection_closed();
                pool.release_slot(self.server.name());
                self.state = EndpointState::NoConn;
            }
        }
    }

    /// Drop the connection without ceremony (session killed, fatal error).
    pub fn hang_up(&mut self, pool: &WorkerPool) {
        if let Some(conn) = self.conn.take() {
            conn.server().connection_closed();
            pool.release_slot(self.server.name());
        }
        self.buffered.clear();
        self.state = EndpointState::NoConn;
    }

    /// Graceful close with COM_QUIT.
    pub async fn close(&mut self, pool: &WorkerPool) {
        if let Some(conn) = self.conn.take() {
            conn.quit().await;
            pool.release_slot(self.server.name());
        }
        self.buffered.clear();
        self.state = EndpointState::NoConn;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ServerConfig, ServerRole};

    fn endpoint() -> Endpoint {
        let server = Server::from_config(&ServerConfig {
            name: "db1".into(),
            host: "10.0.0.1".into(),
            port: 3306,
            rank: 1,
            max_connections: 0,
            role: ServerRole::Slave,
        });
        Endpoint::new(server, 0)
    }

    #[tokio::test]
    async fn fresh_endpoint_rejects_writes() {
        let mut ep = endpoint();
        assert_eq!(ep.state(), EndpointState::NoConn);
        assert!(!ep.in_use());
        let err = ep
            .write(Bytes::from_static(&[0x0e]), ReplyShape::Generic)
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Protocol(_)));
    }

    #[tokio::test]
    async fn waiting_endpoint_buffers() {
        let mut ep = endpoint();
        ep.state = EndpointState::WaitingForConn;
        ep.write(Bytes::from_static(&[0x0e]), ReplyShape::Generic)
            .await
            .unwrap();
        assert_eq!(ep.buffered.len(), 1);
        assert!(ep.in_use());
    }
}
