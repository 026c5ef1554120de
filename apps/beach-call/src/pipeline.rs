use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::media::{CandidateEvents, MediaEngine, MediaError, MediaObjectId, MediaServer};
use crate::registry::{deliver, Outbound, SessionId};
use crate::signaling::{IceCandidate, ServerMessage};

#[derive(Debug, Error)]
pub enum CallSetupError {
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error("no SDP offer available for session {0}")]
    MissingOffer(SessionId),
    #[error("media session setup did not finish within {}s", .0.as_secs())]
    Timeout(Duration),
}

/// One side of a call as the orchestrator sees it.
#[derive(Debug, Clone)]
pub struct Participant {
    pub id: SessionId,
    pub outbound: Outbound,
}

/// Ordered feed of browser candidates into one WebRTC endpoint.
///
/// A single task applies candidates with `addIceCandidate`, so they reach
/// the engine in the order they were pushed.
#[derive(Debug, Clone)]
pub struct CandidateSink {
    tx: mpsc::UnboundedSender<IceCandidate>,
}

impl CandidateSink {
    pub fn spawn(engine: Arc<dyn MediaEngine>, endpoint: MediaObjectId, session_id: SessionId) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<IceCandidate>();
        tokio::spawn(async move {
            while let Some(candidate) = rx.recv().await {
                if let Err(err) = engine.add_ice_candidate(&endpoint, &candidate).await {
                    warn!(
                        session_id = %session_id,
                        endpoint = %endpoint,
                        error = %err,
                        "failed to add ice candidate"
                    );
                }
            }
            debug!(session_id = %session_id, "candidate sink closed");
        });
        Self { tx }
    }

    pub fn push(&self, candidate: IceCandidate) -> bool {
        self.tx.send(candidate).is_ok()
    }
}

/// The media resources of one accepted call.
pub struct CallPipeline {
    engine: Arc<dyn MediaEngine>,
    pipeline: MediaObjectId,
    endpoints: HashMap<SessionId, MediaObjectId>,
    recorders: HashMap<SessionId, MediaObjectId>,
    released: AtomicBool,
}

impl CallPipeline {
    pub fn id(&self) -> &MediaObjectId {
        &self.pipeline
    }

    pub fn endpoint(&self, session_id: SessionId) -> Option<&MediaObjectId> {
        self.endpoints.get(&session_id)
    }

    #[cfg(test)]
    pub fn recorder(&self, session_id: SessionId) -> Option<&MediaObjectId> {
        self.recorders.get(&session_id)
    }

    /// Process a browser offer on this session's endpoint and start
    /// gathering candidates on it.
    pub async fn negotiate(&self, session_id: SessionId, offer: &str) -> Result<String, MediaError> {
        let endpoint = self
            .endpoints
            .get(&session_id)
            .ok_or_else(|| MediaError::Protocol(format!("no endpoint for session {session_id}")))?;
        let (answer, ()) = tokio::try_join!(
            self.engine.process_offer(endpoint, offer),
            self.engine.gather_candidates(endpoint),
        )?;
        Ok(answer)
    }

    pub async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        release_pipeline(self.engine.as_ref(), &self.pipeline).await;
    }
}

async fn release_pipeline(engine: &dyn MediaEngine, pipeline: &MediaObjectId) {
    match engine.release(pipeline).await {
        Ok(()) => info!(pipeline = %pipeline, "released media pipeline"),
        Err(err) => warn!(pipeline = %pipeline, error = %err, "failed to release media pipeline"),
    }
}

/// Result of a fully negotiated call setup.
pub struct EstablishedCall {
    pub pipeline: CallPipeline,
    pub caller_answer: String,
    pub callee_answer: String,
}

/// Builds and tears down per-call media graphs.
#[derive(Clone)]
pub struct MediaOrchestrator {
    server: Arc<MediaServer>,
    recordings_uri: String,
    setup_timeout: Duration,
}

impl MediaOrchestrator {
    pub fn new(server: Arc<MediaServer>, recordings_uri: impl Into<String>, setup_timeout: Duration) -> Self {
        let recordings_uri = recordings_uri.into().trim_end_matches('/').to_string();
        Self {
            server,
            recordings_uri,
            setup_timeout,
        }
    }

    pub fn recording_uri(&self, session_id: SessionId) -> String {
        format!("{}/{}.webm", self.recordings_uri, session_id)
    }

    /// Provision the call graph and negotiate both offers, caller first.
    ///
    /// `on_endpoint` runs once per participant after its endpoint exists and
    /// its discovered candidates are wired to the browser.
    pub async fn establish<F>(
        &self,
        caller: &Participant,
        caller_offer: &str,
        callee: &Participant,
        callee_offer: &str,
        on_endpoint: F,
    ) -> Result<EstablishedCall, CallSetupError>
    where
        F: FnMut(SessionId, CandidateSink) + Send,
    {
        let deadline = Instant::now() + self.setup_timeout;
        let pipeline = self
            .provision_call(caller, callee, on_endpoint, deadline)
            .await?;

        let negotiated = timeout_at(deadline, async {
            let caller_answer = pipeline.negotiate(caller.id, caller_offer).await?;
            let callee_answer = pipeline.negotiate(callee.id, callee_offer).await?;
            Ok::<_, MediaError>((caller_answer, callee_answer))
        })
        .await;

        match negotiated {
            Ok(Ok((caller_answer, callee_answer))) => Ok(EstablishedCall {
                pipeline,
                caller_answer,
                callee_answer,
            }),
            Ok(Err(err)) => {
                pipeline.release().await;
                Err(err.into())
            }
            Err(_) => {
                pipeline.release().await;
                Err(CallSetupError::Timeout(self.setup_timeout))
            }
        }
    }

    /// Create the pipeline, both recorders and endpoints, and wire them.
    /// On failure the pipeline is released before the error is returned.
    pub async fn provision_call<F>(
        &self,
        caller: &Participant,
        callee: &Participant,
        mut on_endpoint: F,
        deadline: Instant,
    ) -> Result<CallPipeline, CallSetupError>
    where
        F: FnMut(SessionId, CandidateSink) + Send,
    {
        let engine = timeout_at(deadline, self.server.engine())
            .await
            .map_err(|_| CallSetupError::Timeout(self.setup_timeout))??;
        let pipeline = self.create_pipeline(&engine, deadline).await?;

        let wired = timeout_at(
            deadline,
            self.wire(&engine, &pipeline, caller, callee, &mut on_endpoint),
        )
        .await;

        match wired {
            Ok(Ok((endpoints, recorders))) => {
                info!(
                    pipeline = %pipeline,
                    caller = %caller.id,
                    callee = %callee.id,
                    "media pipeline ready"
                );
                Ok(CallPipeline {
                    engine,
                    pipeline,
                    endpoints,
                    recorders,
                    released: AtomicBool::new(false),
                })
            }
            Ok(Err(err)) => {
                release_pipeline(engine.as_ref(), &pipeline).await;
                Err(err.into())
            }
            Err(_) => {
                release_pipeline(engine.as_ref(), &pipeline).await;
                Err(CallSetupError::Timeout(self.setup_timeout))
            }
        }
    }

    /// Pipeline creation runs detached so a pipeline that only shows up after
    /// the deadline is still released.
    async fn create_pipeline(
        &self,
        engine: &Arc<dyn MediaEngine>,
        deadline: Instant,
    ) -> Result<MediaObjectId, CallSetupError> {
        let mut creating = {
            let engine = Arc::clone(engine);
            tokio::spawn(async move { engine.create_pipeline().await })
        };

        match timeout_at(deadline, &mut creating).await {
            Ok(Ok(result)) => Ok(result?),
            Ok(Err(join)) => Err(MediaError::Protocol(format!("pipeline creation aborted: {join}")).into()),
            Err(_) => {
                let engine = Arc::clone(engine);
                tokio::spawn(async move {
                    if let Ok(Ok(late)) = creating.await {
                        warn!(pipeline = %late, "releasing pipeline created after setup deadline");
                        release_pipeline(engine.as_ref(), &late).await;
                    }
                });
                Err(CallSetupError::Timeout(self.setup_timeout))
            }
        }
    }

    async fn wire<F>(
        &self,
        engine: &Arc<dyn MediaEngine>,
        pipeline: &MediaObjectId,
        caller: &Participant,
        callee: &Participant,
        on_endpoint: &mut F,
    ) -> Result<(HashMap<SessionId, MediaObjectId>, HashMap<SessionId, MediaObjectId>), MediaError>
    where
        F: FnMut(SessionId, CandidateSink) + Send,
    {
        let mut endpoints = HashMap::new();
        let mut recorders = HashMap::new();

        for participant in [caller, callee] {
            let recorder = engine
                .create_recorder(pipeline, &self.recording_uri(participant.id))
                .await?;
            let endpoint = engine.create_webrtc_endpoint(pipeline).await?;
            let discovered = engine.subscribe_candidates(&endpoint).await?;
            forward_discovered(participant.clone(), discovered);

            let sink = CandidateSink::spawn(Arc::clone(engine), endpoint.clone(), participant.id);
            on_endpoint(participant.id, sink);

            recorders.insert(participant.id, recorder);
            endpoints.insert(participant.id, endpoint);
        }

        let caller_endpoint = &endpoints[&caller.id];
        let callee_endpoint = &endpoints[&callee.id];
        engine.connect(caller_endpoint, &recorders[&caller.id]).await?;
        engine.connect(caller_endpoint, callee_endpoint).await?;
        engine.connect(callee_endpoint, &recorders[&callee.id]).await?;
        engine.connect(callee_endpoint, caller_endpoint).await?;

        engine.record(&recorders[&caller.id]).await?;
        engine.record(&recorders[&callee.id]).await?;

        Ok((endpoints, recorders))
    }
}

/// Relay candidates an endpoint discovers to its browser until either side goes away.
fn forward_discovered(participant: Participant, mut discovered: CandidateEvents) {
    tokio::spawn(async move {
        while let Some(candidate) = discovered.recv().await {
            let message = ServerMessage::IceCandidate { candidate };
            if deliver(participant.id, &participant.outbound, message).is_err() {
                break;
            }
        }
    });
}
