// src/core/agent/mod.rs

//! The agent side of the control plane: the authoritative local table of
//! services and checks this host is responsible for, the anti-entropy loop that
//! converges the catalog onto it, and the local TTL check timers.

pub mod anti_entropy;
pub mod check_ttl;
pub mod local;

use async_trait::async_trait;
use std::sync::Arc;

use crate::core::errors::MusterError;
use crate::core::rpc::{ReadBody, Router, RpcRequest, RpcRequestBody, RpcResponse};
use crate::core::types::{Index, QueryMeta, QueryOptions, ReadRequest, Request};

pub use anti_entropy::AntiEntropy;
pub use check_ttl::TtlKeeper;
pub use local::{LocalState, truncate_check_output};

/// How the agent reaches the catalog. In-process agents go straight through the
/// router; remote agents go through the pooled client; tests inject fakes.
#[async_trait]
pub trait CatalogApi: Send + Sync {
    async fn write(&self, token: &str, request: Request) -> Result<Index, MusterError>;

    async fn read(
        &self,
        token: &str,
        read: ReadRequest,
        options: QueryOptions,
    ) -> Result<(QueryMeta, ReadBody), MusterError>;
}

/// The in-process API: requests go through the local router and pick up its
/// forwarding behavior (leader, remote datacenter) for free.
pub struct LocalApi {
    router: Arc<Router>,
}

impl LocalApi {
    pub fn new(router: Arc<Router>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl CatalogApi for LocalApi {
    async fn write(&self, token: &str, request: Request) -> Result<Index, MusterError> {
        let response = self
            .router
            .dispatch(RpcRequest {
                datacenter: String::new(),
                token: token.to_string(),
                body: RpcRequestBody::Write(request),
            })
            .await?;
        Ok(response.index())
    }

    async fn read(
        &self,
        token: &str,
        read: ReadRequest,
        options: QueryOptions,
    ) -> Result<(QueryMeta, ReadBody), MusterError> {
        let response = self
            .router
            .dispatch(RpcRequest {
                datacenter: options.datacenter.clone(),
                token: token.to_string(),
                body: RpcRequestBody::Read { read, options },
            })
            .await?;
        match response {
            RpcResponse::Read { body, meta } => Ok((meta, body)),
            RpcResponse::Write { .. } => {
                Err(MusterError::Internal("write response to a read".into()))
            }
        }
    }
}

/// The remote API: requests travel over a pooled connection to a server; the
/// server's router takes it from there.
pub struct RemoteApi {
    pool: crate::core::rpc::ConnectionPool,
    server_addr: String,
}

impl RemoteApi {
    pub fn new(server_addr: String) -> Self {
        Self {
            pool: crate::core::rpc::ConnectionPool::new(),
            server_addr,
        }
    }
}

#[async_trait]
impl CatalogApi for RemoteApi {
    async fn write(&self, token: &str, request: Request) -> Result<Index, MusterError> {
        let response = self
            .pool
            .call(
                &self.server_addr,
                RpcRequest {
                    datacenter: String::new(),
                    token: token.to_string(),
                    body: RpcRequestBody::Write(request),
                },
            )
            .await?;
        Ok(response.index())
    }

    async fn read(
        &self,
        token: &str,
        read: ReadRequest,
        options: QueryOptions,
    ) -> Result<(QueryMeta, ReadBody), MusterError> {
        let response = self
            .pool
            .call(
                &self.server_addr,
                RpcRequest {
                    datacenter: options.datacenter.clone(),
                    token: token.to_string(),
                    body: RpcRequestBody::Read { read, options },
                },
            )
            .await?;
        match response {
            RpcResponse::Read { body, meta } => Ok((meta, body)),
            RpcResponse::Write { .. } => {
                Err(MusterError::Internal("write response to a read".into()))
            }
        }
    }
}

/// A cache type backed by a catalog read. The request key is threaded through
/// `build`, so one implementation covers every keyed read family.
pub struct CatalogCacheType {
    name: &'static str,
    api: Arc<dyn CatalogApi>,
    build: fn(&str) -> ReadRequest,
    blocking: bool,
}

impl CatalogCacheType {
    pub fn new(
        name: &'static str,
        api: Arc<dyn CatalogApi>,
        build: fn(&str) -> ReadRequest,
        blocking: bool,
    ) -> Self {
        Self {
            name,
            api,
            build,
            blocking,
        }
    }

    /// The standard service-health cache type.
    pub fn service_health(api: Arc<dyn CatalogApi>) -> Self {
        Self::new(
            "service-health",
            api,
            |key| ReadRequest::ServiceHealth {
                service_name: key.to_string(),
            },
            true,
        )
    }

    /// The standard resolved-service-config cache type.
    pub fn service_config(api: Arc<dyn CatalogApi>) -> Self {
        Self::new(
            "service-config",
            api,
            |key| ReadRequest::ResolveServiceConfig {
                service_name: key.to_string(),
            },
            true,
        )
    }
}

#[async_trait]
impl crate::core::cache::CacheType for CatalogCacheType {
    fn name(&self) -> &'static str {
        self.name
    }

    fn supports_blocking(&self) -> bool {
        self.blocking
    }

    async fn fetch(
        &self,
        datacenter: &str,
        token: &str,
        key: &str,
        min_index: Index,
        max_wait: Option<std::time::Duration>,
    ) -> Result<crate::core::cache::FetchResult, MusterError> {
        let options = QueryOptions {
            token: token.to_string(),
            datacenter: datacenter.to_string(),
            min_index,
            max_wait,
            require_consistent: false,
            allow_stale: true,
        };
        let (meta, body) = self.api.read(token, (self.build)(key), options).await?;
        Ok(crate::core::cache::FetchResult {
            index: meta.index,
            body,
        })
    }
}
