use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tracing::debug;

use super::{CandidateEvents, MediaEngine, MediaError, MediaObjectId};
use crate::signaling::IceCandidate;

/// Engine operations, used to inject failures and pauses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    CreatePipeline,
    CreateRecorder,
    CreateEndpoint,
    Subscribe,
    Connect,
    Record,
    ProcessOffer,
    GatherCandidates,
    AddCandidate,
    Release,
}

#[derive(Debug, Clone)]
enum MediaObject {
    Pipeline,
    Recorder {
        pipeline: MediaObjectId,
        uri: String,
        recording: bool,
    },
    Endpoint {
        pipeline: MediaObjectId,
        negotiated: bool,
    },
}

#[derive(Default)]
struct EngineState {
    objects: HashMap<MediaObjectId, MediaObject>,
    connections: Vec<(MediaObjectId, MediaObjectId)>,
    subscribers: HashMap<MediaObjectId, mpsc::UnboundedSender<IceCandidate>>,
    added_candidates: HashMap<MediaObjectId, Vec<IceCandidate>>,
    released: Vec<MediaObjectId>,
    calls: HashMap<Operation, usize>,
    failures: HashMap<Operation, usize>,
    pauses: HashMap<Operation, Arc<Notify>>,
}

/// In-process media engine.
///
/// Mirrors the Kurento object model closely enough to run the signaling
/// server without a media server (`memory://`) and to observe what the
/// orchestrator asked for in tests.
#[derive(Default)]
pub struct InMemoryEngine {
    next_id: AtomicU64,
    state: Mutex<EngineState>,
}

impl InMemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Failure injection and inspection, for tests.
#[cfg(test)]
impl InMemoryEngine {
    /// Make the `nth` (1-based) invocation of `op` fail.
    pub fn fail_on(&self, op: Operation, nth: usize) {
        self.state.lock().failures.insert(op, nth);
    }

    /// Hold every invocation of `op` until the returned handle is notified.
    pub fn pause_on(&self, op: Operation) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        self.state.lock().pauses.insert(op, Arc::clone(&notify));
        notify
    }

    pub fn live_pipelines(&self) -> usize {
        self.state
            .lock()
            .objects
            .values()
            .filter(|object| matches!(object, MediaObject::Pipeline))
            .count()
    }

    pub fn released(&self) -> Vec<MediaObjectId> {
        self.state.lock().released.clone()
    }

    pub fn connections(&self) -> Vec<(MediaObjectId, MediaObjectId)> {
        self.state.lock().connections.clone()
    }

    pub fn added_candidates(&self, endpoint: &MediaObjectId) -> Vec<IceCandidate> {
        self.state
            .lock()
            .added_candidates
            .get(endpoint)
            .cloned()
            .unwrap_or_default()
    }

    /// Recorder uris of recorders that have been started.
    pub fn recording_uris(&self) -> Vec<String> {
        let mut uris: Vec<String> = self
            .state
            .lock()
            .objects
            .values()
            .filter_map(|object| match object {
                MediaObject::Recorder {
                    uri,
                    recording: true,
                    ..
                } => Some(uri.clone()),
                _ => None,
            })
            .collect();
        uris.sort();
        uris
    }

    pub fn invocations(&self, op: Operation) -> usize {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Emit a candidate from `endpoint` as if the engine had discovered it.
    pub fn discover_candidate(&self, endpoint: &MediaObjectId, candidate: IceCandidate) -> bool {
        self.state
            .lock()
            .subscribers
            .get(endpoint)
            .map(|tx| tx.send(candidate).is_ok())
            .unwrap_or(false)
    }
}

impl InMemoryEngine {
    async fn enter(&self, op: Operation) -> Result<(), MediaError> {
        let (pause, fail) = {
            let mut state = self.state.lock();
            let count = state.calls.entry(op).or_insert(0);
            *count += 1;
            let count = *count;
            let fail = state.failures.get(&op) == Some(&count);
            (state.pauses.get(&op).cloned(), fail)
        };
        if let Some(pause) = pause {
            pause.notified().await;
        }
        if fail {
            debug!(?op, "injected media engine failure");
            return Err(MediaError::Rpc {
                code: 40000,
                message: format!("injected failure in {op:?}"),
            });
        }
        Ok(())
    }

    fn allocate(&self, kind: &str, parent: Option<&MediaObjectId>) -> MediaObjectId {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        match parent {
            Some(parent) => MediaObjectId::new(format!("{parent}/{n}_memory.{kind}")),
            None => MediaObjectId::new(format!("{n}_memory.{kind}")),
        }
    }

    fn ensure_pipeline(state: &EngineState, pipeline: &MediaObjectId) -> Result<(), MediaError> {
        match state.objects.get(pipeline) {
            Some(MediaObject::Pipeline) => Ok(()),
            _ => Err(MediaError::UnknownObject(pipeline.clone())),
        }
    }

    fn ensure_endpoint(state: &EngineState, endpoint: &MediaObjectId) -> Result<(), MediaError> {
        match state.objects.get(endpoint) {
            Some(MediaObject::Endpoint { .. }) => Ok(()),
            _ => Err(MediaError::UnknownObject(endpoint.clone())),
        }
    }
}

fn host_candidate(endpoint: &MediaObjectId) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:1 1 UDP 2122252543 127.0.0.1 40000 typ host generation 0 ufrag {endpoint}"),
        sdp_mid: Some("0".to_string()),
        sdp_m_line_index: 0,
    }
}

#[async_trait]
impl MediaEngine for InMemoryEngine {
    async fn create_pipeline(&self) -> Result<MediaObjectId, MediaError> {
        self.enter(Operation::CreatePipeline).await?;
        let id = self.allocate("MediaPipeline", None);
        self.state
            .lock()
            .objects
            .insert(id.clone(), MediaObject::Pipeline);
        Ok(id)
    }

    async fn create_recorder(
        &self,
        pipeline: &MediaObjectId,
        uri: &str,
    ) -> Result<MediaObjectId, MediaError> {
        self.enter(Operation::CreateRecorder).await?;
        let id = self.allocate("RecorderEndpoint", Some(pipeline));
        let mut state = self.state.lock();
        Self::ensure_pipeline(&state, pipeline)?;
        state.objects.insert(
            id.clone(),
            MediaObject::Recorder {
                pipeline: pipeline.clone(),
                uri: uri.to_string(),
                recording: false,
            },
        );
        Ok(id)
    }

    async fn create_webrtc_endpoint(
        &self,
        pipeline: &MediaObjectId,
    ) -> Result<MediaObjectId, MediaError> {
        self.enter(Operation::CreateEndpoint).await?;
        let id = self.allocate("WebRtcEndpoint", Some(pipeline));
        let mut state = self.state.lock();
        Self::ensure_pipeline(&state, pipeline)?;
        state.objects.insert(
            id.clone(),
            MediaObject::Endpoint {
                pipeline: pipeline.clone(),
                negotiated: false,
            },
        );
        Ok(id)
    }

    async fn subscribe_candidates(
        &self,
        endpoint: &MediaObjectId,
    ) -> Result<CandidateEvents, MediaError> {
        self.enter(Operation::Subscribe).await?;
        let mut state = self.state.lock();
        Self::ensure_endpoint(&state, endpoint)?;
        let (tx, rx) = mpsc::unbounded_channel();
        state.subscribers.insert(endpoint.clone(), tx);
        Ok(rx)
    }

    async fn connect(
        &self,
        source: &MediaObjectId,
        sink: &MediaObjectId,
    ) -> Result<(), MediaError> {
        self.enter(Operation::Connect).await?;
        let mut state = self.state.lock();
        for id in [source, sink] {
            if !state.objects.contains_key(id) {
                return Err(MediaError::UnknownObject(id.clone()));
            }
        }
        state.connections.push((source.clone(), sink.clone()));
        Ok(())
    }

    async fn record(&self, recorder: &MediaObjectId) -> Result<(), MediaError> {
        self.enter(Operation::Record).await?;
        match self.state.lock().objects.get_mut(recorder) {
            Some(MediaObject::Recorder { recording, uri, .. }) => {
                *recording = true;
                debug!(recorder = %recorder, uri = %uri, "recording started");
                Ok(())
            }
            _ => Err(MediaError::UnknownObject(recorder.clone())),
        }
    }

    async fn process_offer(
        &self,
        endpoint: &MediaObjectId,
        offer: &str,
    ) -> Result<String, MediaError> {
        self.enter(Operation::ProcessOffer).await?;
        match self.state.lock().objects.get_mut(endpoint) {
            Some(MediaObject::Endpoint { negotiated: true, .. }) => Err(MediaError::Protocol(
                format!("{endpoint} already negotiated an offer"),
            )),
            Some(MediaObject::Endpoint { negotiated, .. }) => {
                *negotiated = true;
                debug!(endpoint = %endpoint, offer_len = offer.len(), "offer processed");
                Ok(format!(
                    "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns={endpoint}\r\nt=0 0\r\n"
                ))
            }
            _ => Err(MediaError::UnknownObject(endpoint.clone())),
        }
    }

    async fn gather_candidates(&self, endpoint: &MediaObjectId) -> Result<(), MediaError> {
        self.enter(Operation::GatherCandidates).await?;
        let state = self.state.lock();
        Self::ensure_endpoint(&state, endpoint)?;
        if let Some(tx) = state.subscribers.get(endpoint) {
            let _ = tx.send(host_candidate(endpoint));
        }
        Ok(())
    }

    async fn add_ice_candidate(
        &self,
        endpoint: &MediaObjectId,
        candidate: &IceCandidate,
    ) -> Result<(), MediaError> {
        self.enter(Operation::AddCandidate).await?;
        let mut state = self.state.lock();
        Self::ensure_endpoint(&state, endpoint)?;
        state
            .added_candidates
            .entry(endpoint.clone())
            .or_default()
            .push(candidate.clone());
        Ok(())
    }

    async fn release(&self, pipeline: &MediaObjectId) -> Result<(), MediaError> {
        self.enter(Operation::Release).await?;
        let mut state = self.state.lock();
        if state.objects.remove(pipeline).is_none() {
            return Ok(());
        }
        let children: Vec<MediaObjectId> = state
            .objects
            .iter()
            .filter(|(_, object)| match object {
                MediaObject::Recorder { pipeline: p, .. } | MediaObject::Endpoint { pipeline: p, .. } => {
                    p == pipeline
                }
                MediaObject::Pipeline => false,
            })
            .map(|(id, _)| id.clone())
            .collect();
        for child in &children {
            state.objects.remove(child);
            state.subscribers.remove(child);
        }
        state
            .connections
            .retain(|(source, _)| !children.contains(source));
        state.released.push(pipeline.clone());
        Ok(())
    }
}
