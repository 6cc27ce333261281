// src/core/subscribe/mod.rs

//! The subscription server: a thin wire adapter over the event publisher.
//!
//! Each streaming connection resolves the caller's authorization context, then
//! either serves a local subscription or transparently proxies the stream from
//! a remote datacenter. A publisher force-close is translated into a
//! protocol-level reset so the client knows to reconnect from index 0.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, warn};

use crate::core::errors::MusterError;
use crate::core::rpc::{
    ClientFrame, EventFrame, Router, RpcRequestBody, ServerFrame, SubscribeParams, WireError,
    decode_frame, encode_frame, framed,
};

/// Serves one subscription request on an established streaming connection.
pub(crate) async fn serve(
    router: &Arc<Router>,
    client: ClientFrame,
    reply_tx: mpsc::Sender<ServerFrame>,
) {
    let id = client.id;
    let RpcRequestBody::Subscribe(params) = client.request.body.clone() else {
        let error = WireError::from(&MusterError::InvalidRequest(
            "expected a subscribe request".into(),
        ));
        let _ = reply_tx.send(ServerFrame::StreamError { id, error }).await;
        return;
    };

    let datacenter = client.request.datacenter.clone();
    if !datacenter.is_empty() && datacenter != router.datacenter() {
        proxy_remote(router, client, reply_tx).await;
        return;
    }

    serve_local(router, id, &client.request.token, params, reply_tx).await;
}

async fn serve_local(
    router: &Arc<Router>,
    id: u64,
    token: &str,
    params: SubscribeParams,
    reply_tx: mpsc::Sender<ServerFrame>,
) {
    let authz = router.authz().resolve(token);
    let read = router.store().read_txn();
    let mut subscription = router.publisher().subscribe(
        params.topic,
        &params.key,
        params.min_index,
        read.tables(),
        authz,
    );
    drop(read);
    debug!(topic = %params.topic, key = %params.key, min_index = params.min_index, "serving local subscription");

    loop {
        match subscription.next().await {
            Ok(event) if event.is_end_of_snapshot() => {
                let frame = EventFrame::EndOfSnapshot { index: event.index };
                if reply_tx.send(ServerFrame::Event { id, frame }).await.is_err() {
                    return;
                }
            }
            Ok(event) => {
                let frame = EventFrame::Batch {
                    events: vec![event],
                };
                if reply_tx.send(ServerFrame::Event { id, frame }).await.is_err() {
                    return;
                }
            }
            Err(err) => {
                // Usually `SubscriptionReset`; either way the stream is over.
                let _ = reply_tx
                    .send(ServerFrame::StreamError {
                        id,
                        error: WireError::from(&err),
                    })
                    .await;
                return;
            }
        }
    }
}

/// Opens a client stream to the target datacenter and relays its frames
/// verbatim, re-tagged with the local stream id.
async fn proxy_remote(
    router: &Arc<Router>,
    client: ClientFrame,
    reply_tx: mpsc::Sender<ServerFrame>,
) {
    let id = client.id;
    let datacenter = client.request.datacenter.clone();
    let upstream = match router.server_in_dc(&datacenter) {
        Ok(addr) => addr,
        Err(err) => {
            let _ = reply_tx
                .send(ServerFrame::StreamError {
                    id,
                    error: WireError::from(&err),
                })
                .await;
            return;
        }
    };
    debug!(%datacenter, %upstream, "proxying subscription cross-datacenter");

    let mut stream = match SubscriptionStream::open(&upstream, client.request).await {
        Ok(s) => s,
        Err(err) => {
            let _ = reply_tx
                .send(ServerFrame::StreamError {
                    id,
                    error: WireError::from(&err),
                })
                .await;
            return;
        }
    };

    loop {
        match stream.next().await {
            Ok(frame) => {
                if reply_tx.send(ServerFrame::Event { id, frame }).await.is_err() {
                    return;
                }
            }
            Err(err) => {
                let _ = reply_tx
                    .send(ServerFrame::StreamError {
                        id,
                        error: WireError::from(&err),
                    })
                    .await;
                return;
            }
        }
    }
}

/// A client-side subscription stream on its own connection.
pub struct SubscriptionStream {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
}

impl SubscriptionStream {
    /// Dials `addr` and opens the subscription described by `request`.
    pub async fn open(
        addr: &str,
        request: crate::core::rpc::RpcRequest,
    ) -> Result<Self, MusterError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| MusterError::Transient(format!("dial {addr}: {e}")))?;
        let mut framed = framed(stream);
        let frame = ClientFrame { id: 1, request };
        framed.send(encode_frame(&frame)?).await?;
        Ok(Self { framed })
    }

    /// The next stream frame. `Err(SubscriptionReset)` means re-subscribe from
    /// index 0.
    pub async fn next(&mut self) -> Result<EventFrame, MusterError> {
        loop {
            let Some(bytes) = self.framed.next().await else {
                return Err(MusterError::RpcClosed);
            };
            let bytes = bytes?;
            let frame: ServerFrame = decode_frame(&bytes)?;
            match frame {
                ServerFrame::Event { frame, .. } => return Ok(frame),
                ServerFrame::StreamError { error, .. } => return Err(error.into()),
                ServerFrame::Reply { .. } => {
                    warn!("unexpected reply frame on subscription stream");
                }
            }
        }
    }
}
