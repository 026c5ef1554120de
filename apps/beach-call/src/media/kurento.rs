//! Kurento Media Server binding: JSON-RPC 2.0 over a WebSocket.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, trace, warn};

use super::{CandidateEvents, MediaEngine, MediaError, MediaObjectId};
use crate::signaling::IceCandidate;

const OBJECT_NOT_FOUND: i64 = 40101;
const ICE_CANDIDATE_FOUND: &str = "IceCandidateFound";

type PendingReply = oneshot::Sender<Result<Value, MediaError>>;

/// Connection to a Kurento Media Server.
pub struct KurentoClient {
    outgoing: mpsc::UnboundedSender<String>,
    pending: Arc<DashMap<u64, PendingReply>>,
    subscriptions: Arc<DashMap<MediaObjectId, mpsc::UnboundedSender<IceCandidate>>>,
    session_id: Arc<Mutex<Option<String>>>,
    /// Set once the reader task has seen the socket go away.
    closed: Arc<AtomicBool>,
    next_request: AtomicU64,
    request_timeout: Duration,
}

impl KurentoClient {
    pub async fn connect(uri: &str, request_timeout: Duration) -> Result<Self, MediaError> {
        let (stream, _) = tokio::time::timeout(request_timeout, connect_async(uri))
            .await
            .map_err(|_| MediaError::Unavailable {
                uri: uri.to_string(),
                reason: format!("no answer within {}s", request_timeout.as_secs()),
            })?
            .map_err(|err| MediaError::Unavailable {
                uri: uri.to_string(),
                reason: err.to_string(),
            })?;
        info!(uri, "connected to kurento media server");

        let (mut write, mut read) = stream.split();
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<String>();
        let pending: Arc<DashMap<u64, PendingReply>> = Arc::new(DashMap::new());
        let subscriptions = Arc::new(DashMap::new());
        let session_id = Arc::new(Mutex::new(None));
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(async move {
            while let Some(frame) = outgoing_rx.recv().await {
                trace!(%frame, "kurento request");
                if write.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            debug!("kurento writer task ended");
        });

        let reader_pending = Arc::clone(&pending);
        let reader_subscriptions = Arc::clone(&subscriptions);
        let reader_session = Arc::clone(&session_id);
        let reader_closed = Arc::clone(&closed);
        let reader_uri = uri.to_string();
        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => handle_frame(
                        text.as_str(),
                        &reader_pending,
                        &reader_subscriptions,
                        &reader_session,
                    ),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(uri = %reader_uri, error = %err, "kurento connection error");
                        break;
                    }
                }
            }
            warn!(uri = %reader_uri, "kurento connection closed");
            reader_closed.store(true, Ordering::SeqCst);
            let ids: Vec<u64> = reader_pending.iter().map(|entry| *entry.key()).collect();
            for id in ids {
                if let Some((_, reply)) = reader_pending.remove(&id) {
                    let _ = reply.send(Err(MediaError::ConnectionClosed));
                }
            }
            reader_subscriptions.clear();
        });

        Ok(Self {
            outgoing,
            pending,
            subscriptions,
            session_id,
            closed,
            next_request: AtomicU64::new(1),
            request_timeout,
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn request(&self, method: &str, mut params: Value) -> Result<Value, MediaError> {
        if self.is_closed() {
            return Err(MediaError::ConnectionClosed);
        }
        if let Some(session) = self.session_id.lock().clone() {
            params["sessionId"] = Value::String(session);
        }
        let id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let frame = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.insert(id, reply_tx);
        // The reader may have drained `pending` between the check above and the insert.
        if self.is_closed() || self.outgoing.send(frame.to_string()).is_err() {
            self.pending.remove(&id);
            return Err(MediaError::ConnectionClosed);
        }

        match tokio::time::timeout(self.request_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(MediaError::ConnectionClosed),
            Err(_) => {
                self.pending.remove(&id);
                Err(MediaError::Protocol(format!(
                    "{method} got no reply within {}s",
                    self.request_timeout.as_secs()
                )))
            }
        }
    }

    async fn create(&self, kind: &str, constructor: Value) -> Result<MediaObjectId, MediaError> {
        let value = self
            .request(
                "create",
                json!({ "type": kind, "constructorParams": constructor, "properties": {} }),
            )
            .await?;
        value
            .as_str()
            .map(MediaObjectId::new)
            .ok_or_else(|| MediaError::Protocol(format!("create {kind} returned {value}")))
    }

    async fn invoke(
        &self,
        object: &MediaObjectId,
        operation: &str,
        params: Value,
    ) -> Result<Value, MediaError> {
        self.request(
            "invoke",
            json!({
                "object": object.as_str(),
                "operation": operation,
                "operationParams": params,
            }),
        )
        .await
    }
}

fn handle_frame(
    text: &str,
    pending: &DashMap<u64, PendingReply>,
    subscriptions: &DashMap<MediaObjectId, mpsc::UnboundedSender<IceCandidate>>,
    session_id: &Mutex<Option<String>>,
) {
    let frame: Value = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(error = %err, "discarding malformed kurento frame");
            return;
        }
    };

    if frame.get("method").and_then(Value::as_str) == Some("onEvent") {
        dispatch_event(&frame["params"]["value"], subscriptions);
        return;
    }

    let Some(id) = frame.get("id").and_then(Value::as_u64) else {
        debug!(%frame, "ignoring kurento frame without id");
        return;
    };
    let Some((_, reply)) = pending.remove(&id) else {
        debug!(id, "kurento reply for unknown request");
        return;
    };

    let outcome = if let Some(error) = frame.get("error") {
        Err(MediaError::Rpc {
            code: error.get("code").and_then(Value::as_i64).unwrap_or_default(),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        })
    } else {
        let result = &frame["result"];
        if let Some(session) = result.get("sessionId").and_then(Value::as_str) {
            *session_id.lock() = Some(session.to_string());
        }
        Ok(result.get("value").cloned().unwrap_or(Value::Null))
    };
    let _ = reply.send(outcome);
}

fn dispatch_event(
    event: &Value,
    subscriptions: &DashMap<MediaObjectId, mpsc::UnboundedSender<IceCandidate>>,
) {
    if event.get("type").and_then(Value::as_str) != Some(ICE_CANDIDATE_FOUND) {
        return;
    }
    let Some(object) = event.get("object").and_then(Value::as_str) else {
        return;
    };
    let candidate: IceCandidate = match serde_json::from_value(event["data"]["candidate"].clone())
    {
        Ok(candidate) => candidate,
        Err(err) => {
            warn!(object, error = %err, "malformed IceCandidateFound event");
            return;
        }
    };
    let object = MediaObjectId::new(object);
    if let Some(tx) = subscriptions.get(&object) {
        let _ = tx.send(candidate);
    }
}

#[async_trait]
impl MediaEngine for KurentoClient {
    async fn create_pipeline(&self) -> Result<MediaObjectId, MediaError> {
        self.create("MediaPipeline", json!({})).await
    }

    async fn create_recorder(
        &self,
        pipeline: &MediaObjectId,
        uri: &str,
    ) -> Result<MediaObjectId, MediaError> {
        self.create(
            "RecorderEndpoint",
            json!({ "mediaPipeline": pipeline.as_str(), "uri": uri }),
        )
        .await
    }

    async fn create_webrtc_endpoint(
        &self,
        pipeline: &MediaObjectId,
    ) -> Result<MediaObjectId, MediaError> {
        self.create("WebRtcEndpoint", json!({ "mediaPipeline": pipeline.as_str() }))
            .await
    }

    async fn subscribe_candidates(
        &self,
        endpoint: &MediaObjectId,
    ) -> Result<CandidateEvents, MediaError> {
        let (tx, rx) = mpsc::unbounded_channel();
        // Registered before subscribing so no event can slip past.
        self.subscriptions.insert(endpoint.clone(), tx);
        let subscribed = self
            .request(
                "subscribe",
                json!({ "type": ICE_CANDIDATE_FOUND, "object": endpoint.as_str() }),
            )
            .await;
        if let Err(err) = subscribed {
            self.subscriptions.remove(endpoint);
            return Err(err);
        }
        Ok(rx)
    }

    async fn connect(
        &self,
        source: &MediaObjectId,
        sink: &MediaObjectId,
    ) -> Result<(), MediaError> {
        self.invoke(source, "connect", json!({ "sink": sink.as_str() }))
            .await
            .map(|_| ())
    }

    async fn record(&self, recorder: &MediaObjectId) -> Result<(), MediaError> {
        self.invoke(recorder, "record", json!({})).await.map(|_| ())
    }

    async fn process_offer(
        &self,
        endpoint: &MediaObjectId,
        offer: &str,
    ) -> Result<String, MediaError> {
        let answer = self
            .invoke(endpoint, "processOffer", json!({ "offer": offer }))
            .await?;
        answer
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| MediaError::Protocol(format!("processOffer returned {answer}")))
    }

    async fn gather_candidates(&self, endpoint: &MediaObjectId) -> Result<(), MediaError> {
        self.invoke(endpoint, "gatherCandidates", json!({}))
            .await
            .map(|_| ())
    }

    async fn add_ice_candidate(
        &self,
        endpoint: &MediaObjectId,
        candidate: &IceCandidate,
    ) -> Result<(), MediaError> {
        let candidate = json!({
            "__module__": "kurento",
            "__type__": "IceCandidate",
            "candidate": candidate.candidate,
            "sdpMid": candidate.sdp_mid.clone().unwrap_or_default(),
            "sdpMLineIndex": candidate.sdp_m_line_index,
        });
        self.invoke(endpoint, "addIceCandidate", json!({ "candidate": candidate }))
            .await
            .map(|_| ())
    }

    async fn release(&self, pipeline: &MediaObjectId) -> Result<(), MediaError> {
        let prefix = format!("{pipeline}/");
        self.subscriptions
            .retain(|object, _| object != pipeline && !object.as_str().starts_with(&prefix));
        match self
            .request("release", json!({ "object": pipeline.as_str() }))
            .await
        {
            Ok(_) => Ok(()),
            Err(MediaError::Rpc { code, .. }) if code == OBJECT_NOT_FOUND => Ok(()),
            Err(err) => Err(err),
        }
    }
}
