//! Media engine provisioning interface.
//!
//! Everything the signaling server needs from the media server is expressed
//! by [`MediaEngine`]. Two bindings exist: [`kurento::KurentoClient`] talks
//! JSON-RPC to a Kurento Media Server, [`memory::InMemoryEngine`] runs the
//! same object model in-process.

pub mod kurento;
pub mod memory;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, OnceCell};
use tracing::{info, warn};

use crate::signaling::IceCandidate;

/// Identifier of an object living on the media engine (pipeline, endpoint, recorder).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MediaObjectId(String);

impl MediaObjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MediaObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Candidates discovered by an endpoint, in discovery order.
pub type CandidateEvents = mpsc::UnboundedReceiver<IceCandidate>;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("Could not find media server at address {uri}: {reason}")]
    Unavailable { uri: String, reason: String },
    #[error("media server error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("media server connection closed")]
    ConnectionClosed,
    #[error("unexpected media server response: {0}")]
    Protocol(String),
    #[error("unknown media object {0}")]
    UnknownObject(MediaObjectId),
    #[error("unsupported media server uri {0}")]
    UnsupportedUri(String),
}

/// Operations the call orchestrator performs against a connected media engine.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_pipeline(&self) -> Result<MediaObjectId, MediaError>;

    /// Create a recorder persisting whatever is connected to it at `uri`.
    async fn create_recorder(
        &self,
        pipeline: &MediaObjectId,
        uri: &str,
    ) -> Result<MediaObjectId, MediaError>;

    async fn create_webrtc_endpoint(
        &self,
        pipeline: &MediaObjectId,
    ) -> Result<MediaObjectId, MediaError>;

    /// Subscribe to the candidates an endpoint discovers while gathering.
    async fn subscribe_candidates(
        &self,
        endpoint: &MediaObjectId,
    ) -> Result<CandidateEvents, MediaError>;

    async fn connect(&self, source: &MediaObjectId, sink: &MediaObjectId)
        -> Result<(), MediaError>;

    async fn record(&self, recorder: &MediaObjectId) -> Result<(), MediaError>;

    async fn process_offer(&self, endpoint: &MediaObjectId, offer: &str)
        -> Result<String, MediaError>;

    async fn gather_candidates(&self, endpoint: &MediaObjectId) -> Result<(), MediaError>;

    async fn add_ice_candidate(
        &self,
        endpoint: &MediaObjectId,
        candidate: &IceCandidate,
    ) -> Result<(), MediaError>;

    /// Release a pipeline and every object it owns. Releasing an unknown or
    /// already released pipeline succeeds.
    async fn release(&self, pipeline: &MediaObjectId) -> Result<(), MediaError>;
}

/// Opens connections to a media engine.
#[async_trait]
pub trait EngineConnector: Send + Sync {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn MediaEngine>, MediaError>;
}

/// Picks the binding from the uri scheme: `ws://`/`wss://` reach a Kurento
/// server, `memory://` runs the in-process engine.
#[derive(Debug, Clone)]
pub struct UriConnector {
    pub request_timeout: Duration,
}

#[async_trait]
impl EngineConnector for UriConnector {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn MediaEngine>, MediaError> {
        if uri.starts_with("memory://") {
            return Ok(Arc::new(memory::InMemoryEngine::new()));
        }
        if uri.starts_with("ws://") || uri.starts_with("wss://") {
            let client = kurento::KurentoClient::connect(uri, self.request_timeout).await?;
            return Ok(Arc::new(client));
        }
        Err(MediaError::UnsupportedUri(uri.to_string()))
    }
}

/// Process-wide, lazily established connection to the media engine.
///
/// The first caller connects; concurrent callers wait on that attempt. A
/// failed attempt leaves the slot empty so a later call retries.
pub struct MediaServer {
    uri: String,
    connector: Arc<dyn EngineConnector>,
    engine: OnceCell<Arc<dyn MediaEngine>>,
}

impl MediaServer {
    pub fn new(uri: impl Into<String>, connector: Arc<dyn EngineConnector>) -> Self {
        Self {
            uri: uri.into(),
            connector,
            engine: OnceCell::new(),
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub async fn engine(&self) -> Result<Arc<dyn MediaEngine>, MediaError> {
        let engine = self
            .engine
            .get_or_try_init(|| async {
                info!(uri = %self.uri, "connecting to media server");
                self.connector.connect(&self.uri).await.map_err(|err| {
                    warn!(uri = %self.uri, error = %err, "media server connection failed");
                    match err {
                        MediaError::Unavailable { .. } => err,
                        other => MediaError::Unavailable {
                            uri: self.uri.clone(),
                            reason: other.to_string(),
                        },
                    }
                })
            })
            .await?;
        Ok(Arc::clone(engine))
    }
}
