// src/core/rpc/mod.rs

//! The RPC surface: wire envelopes, the server accept loop, pooled client
//! connections, request forwarding and blocking-query execution.
//!
//! Transport is TCP with length-delimited frames carrying bincode envelopes.
//! Request/response traffic multiplexes over pooled connections correlated by
//! frame id; subscriptions run on dedicated connections so a slow stream never
//! holds up pooled calls.

pub mod blocking;
pub mod forward;
pub mod pool;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, error, info, warn};

use crate::core::autopilot::ClusterHealth;
use crate::core::errors::MusterError;
use crate::core::events::Event;
use crate::core::log::RaftConfiguration;
use crate::core::store::reads::{IntentionDecision, ResolvedServiceConfig};
use crate::core::types::{
    CaRoot, CheckServiceNode, ConfigEntry, HealthCheck, Index, Intention, KvEntry, Node, Peering,
    QueryMeta, QueryOptions, ReadRequest, Request, Service, Session,
};

pub use forward::Router;
pub use pool::ConnectionPool;

/// A serializable projection of [`MusterError`] for the wire.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WireError {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Transient,
    StaleIndex,
    NotFound,
    PermissionDenied,
    Conflict,
    Invariant,
    SubscriptionReset,
    Timeout,
    Cancelled,
    NoLeader,
    NoDcPath,
    RpcClosed,
    InvalidRequest,
    SessionInvalid,
    Internal,
}

impl From<&MusterError> for WireError {
    fn from(err: &MusterError) -> Self {
        let code = match err {
            MusterError::Transient(_) | MusterError::Io(_) => ErrorCode::Transient,
            MusterError::StaleIndex { .. } => ErrorCode::StaleIndex,
            MusterError::NotFound(_) => ErrorCode::NotFound,
            MusterError::PermissionDenied => ErrorCode::PermissionDenied,
            MusterError::Conflict(_) => ErrorCode::Conflict,
            MusterError::Invariant(_) => ErrorCode::Invariant,
            MusterError::SubscriptionReset => ErrorCode::SubscriptionReset,
            MusterError::Timeout => ErrorCode::Timeout,
            MusterError::Cancelled => ErrorCode::Cancelled,
            MusterError::NoLeader => ErrorCode::NoLeader,
            MusterError::NoDcPath(_) => ErrorCode::NoDcPath,
            MusterError::RpcClosed => ErrorCode::RpcClosed,
            MusterError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            MusterError::SessionInvalid(_) => ErrorCode::SessionInvalid,
            MusterError::Encoding(_)
            | MusterError::SnapshotCorrupt(_)
            | MusterError::Internal(_) => ErrorCode::Internal,
        };
        Self {
            code,
            message: err.to_string(),
        }
    }
}

impl From<WireError> for MusterError {
    fn from(err: WireError) -> Self {
        match err.code {
            ErrorCode::Transient => MusterError::Transient(err.message),
            ErrorCode::StaleIndex => MusterError::Internal(err.message),
            ErrorCode::NotFound => MusterError::NotFound(err.message),
            ErrorCode::PermissionDenied => MusterError::PermissionDenied,
            ErrorCode::Conflict => MusterError::Conflict(err.message),
            ErrorCode::Invariant => MusterError::Invariant(err.message),
            ErrorCode::SubscriptionReset => MusterError::SubscriptionReset,
            ErrorCode::Timeout => MusterError::Timeout,
            ErrorCode::Cancelled => MusterError::Cancelled,
            ErrorCode::NoLeader => MusterError::NoLeader,
            ErrorCode::NoDcPath => MusterError::NoDcPath(err.message),
            ErrorCode::RpcClosed => MusterError::RpcClosed,
            ErrorCode::InvalidRequest => MusterError::InvalidRequest(err.message),
            ErrorCode::SessionInvalid => MusterError::SessionInvalid(err.message),
            ErrorCode::Internal => MusterError::Internal(err.message),
        }
    }
}

/// Parameters for opening a subscription stream.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SubscribeParams {
    pub topic: crate::core::events::Topic,
    pub key: String,
    pub min_index: Index,
}

/// The body of one RPC request.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum RpcRequestBody {
    Write(Request),
    Read {
        read: ReadRequest,
        options: QueryOptions,
    },
    Subscribe(SubscribeParams),
}

/// The envelope every request travels in.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RpcRequest {
    /// Empty means the receiving server's own datacenter.
    pub datacenter: String,
    pub token: String,
    pub body: RpcRequestBody,
}

/// The typed result of a read, one variant per read operation family.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum ReadBody {
    Node(Option<Node>),
    Nodes(Vec<Node>),
    ServiceHealth(Vec<CheckServiceNode>),
    Services(Vec<Service>),
    Check(Option<HealthCheck>),
    Checks(Vec<HealthCheck>),
    Kv(Option<KvEntry>),
    KvList(Vec<KvEntry>),
    Session(Option<Session>),
    Sessions(Vec<Session>),
    Intention(Option<Intention>),
    Intentions(Vec<Intention>),
    IntentionDecision(IntentionDecision),
    ConfigEntry(Option<ConfigEntry>),
    ConfigEntries(Vec<ConfigEntry>),
    ResolvedServiceConfig(ResolvedServiceConfig),
    CaRoot(Option<CaRoot>),
    CaRoots(Vec<CaRoot>),
    Peering(Option<Peering>),
    Peerings(Vec<Peering>),
    ServerHealth(ClusterHealth),
    RaftConfiguration(RaftConfiguration),
    Datacenters(Vec<String>),
}

/// The envelope every response travels in.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum RpcResponse {
    Write { index: Index },
    Read { body: ReadBody, meta: QueryMeta },
}

impl RpcResponse {
    pub fn index(&self) -> Index {
        match self {
            RpcResponse::Write { index } => *index,
            RpcResponse::Read { meta, .. } => meta.index,
        }
    }
}

/// A subscription stream frame.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum EventFrame {
    /// The initial snapshot is complete; everything after is a live delta.
    EndOfSnapshot { index: Index },
    /// The server is about to restart the subscriber's view from scratch.
    NewSnapshotToFollow,
    Batch { events: Vec<Event> },
}

/// A frame sent by a client.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ClientFrame {
    pub id: u64,
    pub request: RpcRequest,
}

/// A frame sent by a server.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum ServerFrame {
    Reply {
        id: u64,
        result: Result<RpcResponse, WireError>,
    },
    Event {
        id: u64,
        frame: EventFrame,
    },
    /// Terminates a subscription stream; `SubscriptionReset` obliges the client
    /// to reconnect with `min_index = 0`.
    StreamError {
        id: u64,
        error: WireError,
    },
}

pub fn encode_frame<T: Serialize>(frame: &T) -> Result<Bytes, MusterError> {
    let bytes = bincode::serde::encode_to_vec(frame, bincode::config::standard())?;
    Ok(Bytes::from(bytes))
}

pub fn decode_frame<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, MusterError> {
    let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
    Ok(frame)
}

pub(crate) fn framed(stream: TcpStream) -> Framed<TcpStream, LengthDelimitedCodec> {
    Framed::new(stream, LengthDelimitedCodec::new())
}

/// The RPC accept loop. Each connection gets its own task; requests within a
/// connection are served concurrently so one blocking query never stalls the
/// rest of the pipe.
pub struct RpcServer {
    router: Arc<Router>,
}

impl RpcServer {
    pub fn new(router: Arc<Router>) -> Self {
        Self { router }
    }

    pub async fn run(self, listener: TcpListener, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(addr = ?listener.local_addr().ok(), "RPC server listening");
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "accepted RPC connection");
                            let router = self.router.clone();
                            let conn_shutdown = shutdown_rx.resubscribe();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(router, stream, conn_shutdown).await {
                                    debug!(%peer, error = %e, "RPC connection ended");
                                }
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "failed to accept RPC connection");
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("RPC server shutting down.");
                    return;
                }
            }
        }
    }
}

async fn handle_connection(
    router: Arc<Router>,
    stream: TcpStream,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), MusterError> {
    let framed = framed(stream);
    let (sink, mut source) = framed.split();
    // All reply tasks funnel through one writer task so frames never interleave.
    let (reply_tx, mut reply_rx) = tokio::sync::mpsc::channel::<ServerFrame>(64);

    let writer = tokio::spawn(async move {
        let mut sink = sink;
        while let Some(frame) = reply_rx.recv().await {
            let bytes = match encode_frame(&frame) {
                Ok(b) => b,
                Err(e) => {
                    error!(error = %e, "failed to encode RPC frame");
                    continue;
                }
            };
            if sink.send(bytes).await.is_err() {
                return;
            }
        }
    });

    loop {
        tokio::select! {
            frame = source.next() => {
                let Some(frame) = frame else { break };
                let frame = frame?;
                let client: ClientFrame = decode_frame(&frame)?;
                let router = router.clone();
                let reply_tx = reply_tx.clone();
                tokio::spawn(async move {
                    match &client.request.body {
                        RpcRequestBody::Subscribe(_) => {
                            router.serve_subscription(client, reply_tx).await;
                        }
                        _ => {
                            let result = router
                                .dispatch(client.request)
                                .await
                                .map_err(|e| WireError::from(&e));
                            let _ = reply_tx
                                .send(ServerFrame::Reply { id: client.id, result })
                                .await;
                        }
                    }
                });
            }
            _ = shutdown_rx.recv() => break,
        }
    }

    drop(reply_tx);
    let _ = writer.await;
    Ok(())
}
