// src/core/rpc/pool.rs

//! Long-lived pooled connections to peer servers.
//!
//! One connection per peer address, shared by all callers and multiplexed by
//! frame id. A connection that dies fails every in-flight call with `RpcClosed`
//! and is discarded; the next call dials fresh.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::{ClientFrame, RpcRequest, RpcResponse, ServerFrame, decode_frame, encode_frame, framed};
use crate::core::errors::MusterError;

type ReplyTx = oneshot::Sender<Result<RpcResponse, MusterError>>;

/// One live connection: callers hand requests to its writer task.
struct PooledConn {
    tx: mpsc::Sender<(RpcRequest, ReplyTx)>,
}

/// The shared pool, keyed by peer address.
#[derive(Default)]
pub struct ConnectionPool {
    conns: DashMap<String, Arc<PooledConn>>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Default::default()
    }

    /// Issues one request over the pooled connection to `addr`, dialing if
    /// needed. Fails with `RpcClosed` when the connection dies mid-call; the
    /// forwarding layer decides whether to retry.
    pub async fn call(&self, addr: &str, request: RpcRequest) -> Result<RpcResponse, MusterError> {
        let conn = self.get_or_dial(addr).await?;
        let (reply_tx, reply_rx) = oneshot::channel();
        if conn.tx.send((request, reply_tx)).await.is_err() {
            self.conns.remove(addr);
            return Err(MusterError::RpcClosed);
        }
        match reply_rx.await {
            Ok(result) => result,
            Err(_) => {
                self.conns.remove(addr);
                Err(MusterError::RpcClosed)
            }
        }
    }

    /// Drops the pooled connection to `addr`, forcing the next call to redial.
    pub fn discard(&self, addr: &str) {
        self.conns.remove(addr);
    }

    async fn get_or_dial(&self, addr: &str) -> Result<Arc<PooledConn>, MusterError> {
        if let Some(conn) = self.conns.get(addr) {
            if !conn.tx.is_closed() {
                return Ok(conn.clone());
            }
            drop(conn);
            self.conns.remove(addr);
        }

        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| MusterError::Transient(format!("dial {addr}: {e}")))?;
        debug!(addr, "dialed pooled RPC connection");
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(run_connection(stream, rx, addr.to_string()));
        let conn = Arc::new(PooledConn { tx });
        self.conns.insert(addr.to_string(), conn.clone());
        Ok(conn)
    }
}

/// Owns one framed stream: writes requests, reads replies, correlates by id.
async fn run_connection(
    stream: TcpStream,
    mut requests: mpsc::Receiver<(RpcRequest, ReplyTx)>,
    addr: String,
) {
    let framed = framed(stream);
    let (mut sink, mut source) = framed.split();
    let mut pending: HashMap<u64, ReplyTx> = HashMap::new();
    let next_id = AtomicU64::new(1);

    loop {
        tokio::select! {
            outgoing = requests.recv() => {
                let Some((request, reply_tx)) = outgoing else { break };
                let id = next_id.fetch_add(1, Ordering::Relaxed);
                let frame = ClientFrame { id, request };
                let bytes = match encode_frame(&frame) {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = reply_tx.send(Err(e));
                        continue;
                    }
                };
                if sink.send(bytes).await.is_err() {
                    let _ = reply_tx.send(Err(MusterError::RpcClosed));
                    break;
                }
                pending.insert(id, reply_tx);
            }
            incoming = source.next() => {
                let Some(Ok(bytes)) = incoming else { break };
                let frame: ServerFrame = match decode_frame(&bytes) {
                    Ok(f) => f,
                    Err(e) => {
                        warn!(addr, error = %e, "undecodable frame on pooled connection");
                        break;
                    }
                };
                match frame {
                    ServerFrame::Reply { id, result } => {
                        if let Some(reply_tx) = pending.remove(&id) {
                            let _ = reply_tx.send(result.map_err(MusterError::from));
                        }
                    }
                    // Pooled connections never carry subscription streams.
                    ServerFrame::Event { .. } | ServerFrame::StreamError { .. } => {
                        warn!(addr, "unexpected stream frame on pooled connection");
                    }
                }
            }
        }
    }

    debug!(addr, in_flight = pending.len(), "pooled RPC connection closed");
    for (_, reply_tx) in pending {
        let _ = reply_tx.send(Err(MusterError::RpcClosed));
    }
}
