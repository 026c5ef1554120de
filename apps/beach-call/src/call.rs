//! Call state machine.
//!
//! A single coordinator task owns the session registry, the candidate queue
//! and the active-calls table. Connections feed it [`CallEvent`]s in arrival
//! order; media setup runs in spawned tasks that report back through the same
//! channel, so every state mutation is serialized here.
//!
//! Per pair of sessions the state is implicit:
//! - idle: no peer, no call entry
//! - calling: caller offer stored, peers paired, no call entry
//! - active: both sessions map to the same call
//! - terminating: the call entry is being removed and its pipeline released

use std::collections::HashMap;
use std::fmt;

use metrics::{counter, gauge};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::candidates::CandidateQueue;
use crate::pipeline::{
    CallPipeline, CallSetupError, CandidateSink, EstablishedCall, MediaOrchestrator, Participant,
};
use crate::registry::{deliver, Outbound, SessionId, SessionRegistry, UserSession};
use crate::signaling::{CallDecision, ClientMessage, IceCandidate, ServerMessage};

/// Index of a call in the coordinator's call arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallId(u64);

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call-{}", self.0)
    }
}

pub enum CallEvent {
    Inbound {
        session_id: SessionId,
        outbound: Outbound,
        message: ClientMessage,
    },
    Disconnected {
        session_id: SessionId,
    },
    EndpointReady {
        call_id: CallId,
        session_id: SessionId,
        sink: CandidateSink,
    },
    SetupFinished {
        call_id: CallId,
        result: Result<EstablishedCall, CallSetupError>,
    },
}

enum CallPhase {
    Provisioning,
    Established(CallPipeline),
}

struct ActiveCall {
    caller: SessionId,
    callee: SessionId,
    phase: CallPhase,
    sinks: HashMap<SessionId, CandidateSink>,
}

impl ActiveCall {
    fn other(&self, session_id: SessionId) -> SessionId {
        if self.caller == session_id {
            self.callee
        } else {
            self.caller
        }
    }
}

/// Handle used by connections to talk to the coordinator task.
#[derive(Clone)]
pub struct CallCoordinator {
    events: mpsc::UnboundedSender<CallEvent>,
}

impl CallCoordinator {
    pub fn spawn(orchestrator: MediaOrchestrator) -> (Self, JoinHandle<()>) {
        let (events, rx) = mpsc::unbounded_channel();
        let state = CoordinatorState::new(orchestrator, events.downgrade());
        let task = tokio::spawn(state.run(rx));
        (Self { events }, task)
    }

    pub fn dispatch(&self, session_id: SessionId, outbound: Outbound, message: ClientMessage) {
        let _ = self.events.send(CallEvent::Inbound {
            session_id,
            outbound,
            message,
        });
    }

    pub fn disconnect(&self, session_id: SessionId) {
        let _ = self.events.send(CallEvent::Disconnected { session_id });
    }
}

pub(crate) struct CoordinatorState {
    registry: SessionRegistry,
    candidates: CandidateQueue,
    active: HashMap<SessionId, CallId>,
    calls: HashMap<CallId, ActiveCall>,
    next_call: u64,
    orchestrator: MediaOrchestrator,
    events: mpsc::WeakUnboundedSender<CallEvent>,
}

impl CoordinatorState {
    pub(crate) fn new(
        orchestrator: MediaOrchestrator,
        events: mpsc::WeakUnboundedSender<CallEvent>,
    ) -> Self {
        Self {
            registry: SessionRegistry::new(),
            candidates: CandidateQueue::new(),
            active: HashMap::new(),
            calls: HashMap::new(),
            next_call: 0,
            orchestrator,
            events,
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<CallEvent>) {
        while let Some(event) = rx.recv().await {
            self.handle(event);
        }

        info!(calls = self.calls.len(), "call coordinator stopping");
        for (_, call) in self.calls.drain() {
            if let CallPhase::Established(pipeline) = call.phase {
                pipeline.release().await;
            }
        }
    }

    pub(crate) fn handle(&mut self, event: CallEvent) {
        match event {
            CallEvent::Inbound {
                session_id,
                outbound,
                message,
            } => self.handle_message(session_id, outbound, message),
            CallEvent::Disconnected { session_id } => self.disconnect(session_id),
            CallEvent::EndpointReady {
                call_id,
                session_id,
                sink,
            } => self.endpoint_ready(call_id, session_id, sink),
            CallEvent::SetupFinished { call_id, result } => self.setup_finished(call_id, result),
        }
    }

    fn handle_message(&mut self, session_id: SessionId, outbound: Outbound, message: ClientMessage) {
        debug!(session_id = %session_id, ?message, "signaling message");
        match message {
            ClientMessage::Register { name } => self.register(session_id, outbound, name),
            ClientMessage::Call { to, from, sdp_offer } => {
                self.call(session_id, &outbound, to, from, sdp_offer)
            }
            ClientMessage::IncomingCallResponse {
                from,
                call_response,
                sdp_offer,
            } => self.incoming_call_response(session_id, &outbound, from, call_response, sdp_offer),
            ClientMessage::Stop => self.stop(session_id),
            ClientMessage::OnIceCandidate { candidate } => self.on_ice_candidate(session_id, candidate),
        }
    }

    fn register(&mut self, session_id: SessionId, outbound: Outbound, name: String) {
        let rejection = if let Some(existing) = self.registry.get_by_id(session_id) {
            Some(format!("Session already registered as {}", existing.name))
        } else if name.is_empty() {
            Some("empty user name".to_string())
        } else if self.registry.contains_name(&name) {
            Some(format!("User {name} is already registered"))
        } else {
            None
        };

        if let Some(reason) = rejection {
            info!(session_id = %session_id, name = %name, reason = %reason, "registration rejected");
            let _ = deliver(session_id, &outbound, ServerMessage::register_rejected(reason));
            return;
        }

        let session = UserSession::new(session_id, name.clone(), outbound);
        if let Err(session) = self.registry.register(session) {
            warn!(session_id = %session_id, name = %session.name, "registration raced a duplicate");
            return;
        }
        info!(session_id = %session_id, name = %name, "user registered");
        gauge!("beach_call_sessions_registered").set(self.registry.len() as f64);

        if let Some(session) = self.registry.get_by_id(session_id) {
            if let Err(err) = session.send(ServerMessage::register_accepted()) {
                warn!(error = %err, "failed to acknowledge registration");
            }
        }
    }

    fn call(
        &mut self,
        caller_id: SessionId,
        outbound: &Outbound,
        to: String,
        from: String,
        sdp_offer: Option<String>,
    ) {
        let Some(caller) = self.registry.get_by_id(caller_id) else {
            let _ = deliver(
                caller_id,
                outbound,
                ServerMessage::Error {
                    message: "You must register before placing a call".to_string(),
                },
            );
            return;
        };
        let caller_name = caller.name.clone();
        if caller_name != from {
            debug!(session_id = %caller_id, claimed = %from, registered = %caller_name, "call origin differs from registered name");
        }

        if self.active.contains_key(&caller_id) {
            let _ = caller.send(ServerMessage::call_rejected(format!(
                "User {caller_name} is already in a call"
            )));
            return;
        }

        self.candidates.clear(caller_id);

        let callee_id = match self.registry.get_by_name(&to) {
            Some(callee) if callee.id == caller_id => {
                let _ = caller.send(ServerMessage::call_rejected("You cannot call yourself"));
                return;
            }
            Some(callee) if self.active.contains_key(&callee.id) => {
                info!(session_id = %caller_id, to = %to, "call to a user already in a call");
                let _ = caller.send(ServerMessage::call_rejected(format!("User {to} is busy")));
                return;
            }
            Some(callee) => callee.id,
            None => {
                info!(session_id = %caller_id, to = %to, "call to unregistered user");
                let _ = caller.send(ServerMessage::call_rejected(format!(
                    "User {to} is not registered"
                )));
                return;
            }
        };

        if let Some(caller) = self.registry.get_by_id_mut(caller_id) {
            caller.sdp_offer = sdp_offer;
            caller.peer = Some(to.clone());
        }
        let delivered = match self.registry.get_by_id_mut(callee_id) {
            Some(callee) => {
                callee.peer = Some(caller_name.clone());
                callee.send(ServerMessage::IncomingCall {
                    from: caller_name.clone(),
                })
            }
            None => return,
        };

        match delivered {
            Ok(()) => info!(caller = %caller_name, callee = %to, "incoming call announced"),
            Err(err) => {
                warn!(caller = %caller_name, callee = %to, error = %err, "failed to announce call");
                if let Some(caller) = self.registry.get_by_id(caller_id) {
                    let _ = caller.send(ServerMessage::call_rejected(format!("Error {err}")));
                }
            }
        }
    }

    fn incoming_call_response(
        &mut self,
        callee_id: SessionId,
        outbound: &Outbound,
        from: Option<String>,
        decision: CallDecision,
        callee_offer: Option<String>,
    ) {
        self.candidates.clear(callee_id);

        let Some(callee) = self.registry.get_by_id(callee_id) else {
            let _ = deliver(
                callee_id,
                outbound,
                ServerMessage::Error {
                    message: "You must register before answering a call".to_string(),
                },
            );
            return;
        };

        let from = from.unwrap_or_default();
        let Some(caller) = self.registry.get_by_name(&from) else {
            self.refuse_answer(callee_id, format!("unknown from = {from}"));
            return;
        };
        let caller_id = caller.id;

        if caller.peer.as_deref() != Some(callee.name.as_str()) {
            info!(caller = %from, callee = %callee.name, "answer to a call that is no longer pending");
            self.refuse_answer(callee_id, format!("User {from} is not calling you"));
            return;
        }

        if decision == CallDecision::Reject {
            info!(caller = %from, callee = %callee.name, "call declined");
            let _ = caller.send(ServerMessage::call_rejected("user declined"));
            return;
        }

        if caller_id == callee_id {
            self.refuse_answer(callee_id, "You cannot answer your own call".to_string());
            return;
        }
        if self.active.contains_key(&caller_id) || self.active.contains_key(&callee_id) {
            // neither party's ongoing call is touched
            counter!("beach_call_calls_failed_total").increment(1);
            let reason = "User is already in a call".to_string();
            if !self.active.contains_key(&caller_id) {
                let _ = caller.send(ServerMessage::call_rejected(reason.clone()));
            }
            self.refuse_answer(callee_id, reason);
            return;
        }

        let Some(caller_offer) = caller.sdp_offer.clone() else {
            let reason = CallSetupError::MissingOffer(caller_id).to_string();
            self.notify_setup_failure(caller_id, callee_id, reason);
            return;
        };
        let Some(callee_offer) = callee_offer else {
            let reason = CallSetupError::MissingOffer(callee_id).to_string();
            self.notify_setup_failure(caller_id, callee_id, reason);
            return;
        };

        let caller = Participant {
            id: caller_id,
            outbound: caller.outbound(),
        };
        let callee = Participant {
            id: callee_id,
            outbound: callee.outbound(),
        };

        self.next_call += 1;
        let call_id = CallId(self.next_call);
        self.calls.insert(
            call_id,
            ActiveCall {
                caller: caller_id,
                callee: callee_id,
                phase: CallPhase::Provisioning,
                sinks: HashMap::new(),
            },
        );
        self.active.insert(caller_id, call_id);
        self.active.insert(callee_id, call_id);
        gauge!("beach_call_calls_active").set(self.calls.len() as f64);
        info!(call = %call_id, caller = %caller_id, callee = %callee_id, "call accepted; provisioning media");

        let orchestrator = self.orchestrator.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let endpoint_events = events.clone();
            let result = orchestrator
                .establish(&caller, &caller_offer, &callee, &callee_offer, |session_id, sink| {
                    if let Some(tx) = endpoint_events.upgrade() {
                        let _ = tx.send(CallEvent::EndpointReady {
                            call_id,
                            session_id,
                            sink,
                        });
                    }
                })
                .await;

            match events.upgrade() {
                Some(tx) => {
                    if let Err(mpsc::error::SendError(CallEvent::SetupFinished {
                        result: Ok(call),
                        ..
                    })) = tx.send(CallEvent::SetupFinished { call_id, result })
                    {
                        call.pipeline.release().await;
                    }
                }
                None => {
                    if let Ok(call) = result {
                        call.pipeline.release().await;
                    }
                }
            }
        });
    }

    fn endpoint_ready(&mut self, call_id: CallId, session_id: SessionId, sink: CandidateSink) {
        let Some(call) = self.calls.get_mut(&call_id) else {
            debug!(call = %call_id, session_id = %session_id, "endpoint ready for a call that already ended");
            return;
        };
        let drained = self
            .candidates
            .drain_into(session_id, |candidate| {
                sink.push(candidate);
            });
        debug!(call = %call_id, session_id = %session_id, drained, "endpoint ready");
        call.sinks.insert(session_id, sink);
    }

    fn setup_finished(&mut self, call_id: CallId, result: Result<EstablishedCall, CallSetupError>) {
        let Some(call) = self.calls.get_mut(&call_id) else {
            if let Ok(established) = result {
                info!(call = %call_id, "call ended during setup; releasing its pipeline");
                tokio::spawn(async move { established.pipeline.release().await });
            }
            return;
        };
        let (caller_id, callee_id) = (call.caller, call.callee);

        match result {
            Ok(established) => {
                info!(call = %call_id, pipeline = %established.pipeline.id(), "call established");
                call.phase = CallPhase::Established(established.pipeline);
                counter!("beach_call_calls_started_total").increment(1);

                if let Some(callee) = self.registry.get_by_id(callee_id) {
                    if let Err(err) = callee.send(ServerMessage::StartCommunication {
                        sdp_answer: established.callee_answer,
                    }) {
                        warn!(call = %call_id, error = %err, "failed to start callee communication");
                    }
                }
                if let Some(caller) = self.registry.get_by_id(caller_id) {
                    if let Err(err) = caller.send(ServerMessage::call_accepted(established.caller_answer)) {
                        warn!(call = %call_id, error = %err, "failed to confirm call to caller");
                    }
                }
            }
            Err(err) => {
                warn!(call = %call_id, error = %err, "call setup failed");
                self.remove_call(call_id);
                self.notify_setup_failure(caller_id, callee_id, err.to_string());
            }
        }
    }

    /// Turn down an answer. A session that is in a call gets an error so its
    /// ongoing call survives; otherwise its pending call is terminated.
    fn refuse_answer(&self, session_id: SessionId, reason: String) {
        let Some(session) = self.registry.get_by_id(session_id) else {
            return;
        };
        let message = if self.active.contains_key(&session_id) {
            ServerMessage::Error { message: reason }
        } else {
            ServerMessage::stop_communication(Some(reason))
        };
        let _ = session.send(message);
    }

    fn notify_setup_failure(&self, caller_id: SessionId, callee_id: SessionId, reason: String) {
        counter!("beach_call_calls_failed_total").increment(1);
        if let Some(caller) = self.registry.get_by_id(caller_id) {
            let _ = caller.send(ServerMessage::call_rejected(reason.clone()));
        }
        if let Some(callee) = self.registry.get_by_id(callee_id) {
            let _ = callee.send(ServerMessage::stop_communication(Some(reason)));
        }
    }

    /// Drop a call from the arena and unmap both participants. Returns the
    /// call so the caller decides what to release.
    fn remove_call(&mut self, call_id: CallId) -> Option<ActiveCall> {
        let call = self.calls.remove(&call_id)?;
        for id in [call.caller, call.callee] {
            if self.active.get(&id) == Some(&call_id) {
                self.active.remove(&id);
            }
            self.candidates.clear(id);
        }
        gauge!("beach_call_calls_active").set(self.calls.len() as f64);
        Some(call)
    }

    fn stop(&mut self, session_id: SessionId) {
        let Some(&call_id) = self.active.get(&session_id) else {
            return;
        };
        let Some(call) = self.remove_call(call_id) else {
            self.active.remove(&session_id);
            return;
        };
        info!(call = %call_id, session_id = %session_id, "call stopped");
        let peer_id = call.other(session_id);

        match call.phase {
            CallPhase::Established(pipeline) => {
                tokio::spawn(async move { pipeline.release().await });
            }
            CallPhase::Provisioning => {
                debug!(call = %call_id, "stopped while provisioning; pipeline released on completion");
            }
        }

        if let Some(stopper) = self.registry.get_by_id_mut(session_id) {
            stopper.peer = None;
        }
        if let Some(peer) = self.registry.get_by_id_mut(peer_id) {
            peer.peer = None;
            if let Err(err) = peer.send(ServerMessage::stop_communication(Some(
                "remote user hanged out".to_string(),
            ))) {
                debug!(session_id = %peer_id, error = %err, "peer already gone");
            }
        }
    }

    fn on_ice_candidate(&mut self, session_id: SessionId, candidate: IceCandidate) {
        let sink = self
            .active
            .get(&session_id)
            .and_then(|call_id| self.calls.get(call_id))
            .and_then(|call| call.sinks.get(&session_id));

        match sink {
            Some(sink) => {
                if !sink.push(candidate) {
                    debug!(session_id = %session_id, "candidate sink closed; dropping candidate");
                }
            }
            None => {
                if self.candidates.enqueue(session_id, candidate) {
                    counter!("beach_call_candidates_queued_total").increment(1);
                } else {
                    debug!(session_id = %session_id, "candidate queue full; dropping candidate");
                }
            }
        }
    }

    fn disconnect(&mut self, session_id: SessionId) {
        self.stop(session_id);
        self.candidates.clear(session_id);
        if let Some(session) = self.registry.unregister(session_id) {
            info!(session_id = %session_id, name = %session.name, "user unregistered");
            gauge!("beach_call_sessions_registered").set(self.registry.len() as f64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::memory::{InMemoryEngine, Operation};
    use crate::media::{EngineConnector, MediaEngine, MediaError, MediaServer};
    use crate::signaling::Verdict;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;

    struct FixedConnector(Option<Arc<InMemoryEngine>>);

    #[async_trait]
    impl EngineConnector for FixedConnector {
        async fn connect(&self, uri: &str) -> Result<Arc<dyn MediaEngine>, MediaError> {
            match &self.0 {
                Some(engine) => Ok(engine.clone()),
                None => Err(MediaError::Unavailable {
                    uri: uri.to_string(),
                    reason: "connection refused".to_string(),
                }),
            }
        }
    }

    struct Client {
        id: SessionId,
        tx: Outbound,
        rx: mpsc::UnboundedReceiver<ServerMessage>,
    }

    impl Client {
        fn messages(&mut self) -> Vec<ServerMessage> {
            let mut out = Vec::new();
            while let Ok(message) = self.rx.try_recv() {
                if !matches!(message, ServerMessage::IceCandidate { .. }) {
                    out.push(message);
                }
            }
            out
        }
    }

    struct Harness {
        state: CoordinatorState,
        _events: mpsc::UnboundedSender<CallEvent>,
        rx: mpsc::UnboundedReceiver<CallEvent>,
        engine: Arc<InMemoryEngine>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_engine(Some(Arc::new(InMemoryEngine::new())))
        }

        fn with_engine(engine: Option<Arc<InMemoryEngine>>) -> Self {
            let connector = Arc::new(FixedConnector(engine.clone()));
            let server = Arc::new(MediaServer::new("ws://media.test/kurento", connector));
            let orchestrator = MediaOrchestrator::new(server, "file:///tmp", Duration::from_secs(5));
            let (events, rx) = mpsc::unbounded_channel();
            let state = CoordinatorState::new(orchestrator, events.downgrade());
            Self {
                state,
                _events: events,
                rx,
                engine: engine.unwrap_or_default(),
            }
        }

        fn client(&self) -> Client {
            let (tx, rx) = mpsc::unbounded_channel();
            Client {
                id: SessionId::generate(),
                tx,
                rx,
            }
        }

        fn send(&mut self, client: &Client, message: ClientMessage) {
            self.state.handle(CallEvent::Inbound {
                session_id: client.id,
                outbound: client.tx.clone(),
                message,
            });
        }

        fn registered(&mut self, name: &str) -> Client {
            let mut client = self.client();
            self.send(
                &client,
                ClientMessage::Register {
                    name: name.to_string(),
                },
            );
            assert_eq!(client.messages(), vec![ServerMessage::register_accepted()]);
            client
        }

        /// Feed back events from media setup tasks until they go quiet.
        async fn settle(&mut self) {
            while let Ok(Some(event)) =
                tokio::time::timeout(Duration::from_millis(100), self.rx.recv()).await
            {
                self.state.handle(event);
            }
        }

        fn place_call(&mut self, caller: &Client, from: &str, to: &str) {
            self.send(
                caller,
                ClientMessage::Call {
                    to: to.to_string(),
                    from: from.to_string(),
                    sdp_offer: Some(format!("offer-from-{from}")),
                },
            );
        }

        fn answer(&mut self, callee: &Client, from: &str, decision: CallDecision) {
            self.send(
                callee,
                ClientMessage::IncomingCallResponse {
                    from: Some(from.to_string()),
                    call_response: decision,
                    sdp_offer: Some("callee-offer".to_string()),
                },
            );
        }

        fn call_of(&self, id: SessionId) -> Option<CallId> {
            self.state.active.get(&id).copied()
        }
    }

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n} 1 UDP 2122252543 192.168.1.{n} 5400{n} typ host"),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: 0,
        }
    }

    #[tokio::test]
    async fn register_rejects_empty_and_taken_names() {
        let mut h = Harness::new();
        let first = h.registered("bob");

        let mut second = h.client();
        h.send(&second, ClientMessage::Register { name: "bob".into() });
        assert_eq!(
            second.messages(),
            vec![ServerMessage::register_rejected("User bob is already registered")]
        );

        h.send(&second, ClientMessage::Register { name: String::new() });
        assert_eq!(
            second.messages(),
            vec![ServerMessage::register_rejected("empty user name")]
        );

        assert_eq!(h.state.registry.get_by_name("bob").map(|s| s.id), Some(first.id));
        assert!(h.state.registry.get_by_id(second.id).is_none());
    }

    #[tokio::test]
    async fn call_to_unregistered_user_is_rejected() {
        let mut h = Harness::new();
        let mut alice = h.registered("alice");

        h.place_call(&alice, "alice", "nobody");

        assert_eq!(
            alice.messages(),
            vec![ServerMessage::call_rejected("User nobody is not registered")]
        );
        assert!(h.state.active.is_empty());
    }

    #[tokio::test]
    async fn call_announces_and_pairs_both_sides() {
        let mut h = Harness::new();
        let mut alice = h.registered("alice");
        let mut bob = h.registered("bob");

        h.place_call(&alice, "alice", "bob");

        assert!(alice.messages().is_empty());
        assert_eq!(
            bob.messages(),
            vec![ServerMessage::IncomingCall {
                from: "alice".into()
            }]
        );
        let caller = h.state.registry.get_by_id(alice.id).expect("alice");
        assert_eq!(caller.peer.as_deref(), Some("bob"));
        assert_eq!(caller.sdp_offer.as_deref(), Some("offer-from-alice"));
        let callee = h.state.registry.get_by_id(bob.id).expect("bob");
        assert_eq!(callee.peer.as_deref(), Some("alice"));
        assert!(h.state.active.is_empty());
    }

    #[tokio::test]
    async fn call_to_closed_connection_is_rejected_with_delivery_error() {
        let mut h = Harness::new();
        let mut alice = h.registered("alice");
        let bob = h.registered("bob");
        drop(bob.rx);

        h.place_call(&alice, "alice", "bob");

        match alice.messages().as_slice() {
            [ServerMessage::CallResponse {
                response: Verdict::Rejected,
                message: Some(reason),
                ..
            }] => assert!(reason.starts_with("Error")),
            other => panic!("unexpected messages {other:?}"),
        }
    }

    #[tokio::test]
    async fn accepted_call_shares_one_pipeline_and_starts_callee_first() {
        let mut h = Harness::new();
        // both sessions write to one channel so cross-session order is observable
        let (shared_tx, mut shared_rx) = mpsc::unbounded_channel();
        let alice_id = SessionId::generate();
        let bob_id = SessionId::generate();
        for (id, name) in [(alice_id, "alice"), (bob_id, "bob")] {
            h.state.handle(CallEvent::Inbound {
                session_id: id,
                outbound: shared_tx.clone(),
                message: ClientMessage::Register { name: name.into() },
            });
        }
        h.state.handle(CallEvent::Inbound {
            session_id: alice_id,
            outbound: shared_tx.clone(),
            message: ClientMessage::Call {
                to: "bob".into(),
                from: "alice".into(),
                sdp_offer: Some("offer-a".into()),
            },
        });
        h.state.handle(CallEvent::Inbound {
            session_id: bob_id,
            outbound: shared_tx.clone(),
            message: ClientMessage::IncomingCallResponse {
                from: Some("alice".into()),
                call_response: CallDecision::Accept,
                sdp_offer: Some("offer-b".into()),
            },
        });
        h.settle().await;

        let call_id = h.call_of(alice_id).expect("caller mapped");
        assert_eq!(h.call_of(bob_id), Some(call_id));
        assert!(matches!(
            h.state.calls.get(&call_id).map(|c| &c.phase),
            Some(CallPhase::Established(_))
        ));
        assert_eq!(h.engine.live_pipelines(), 1);

        let mut order = Vec::new();
        while let Ok(message) = shared_rx.try_recv() {
            match message {
                ServerMessage::StartCommunication { .. } => order.push("startCommunication"),
                ServerMessage::CallResponse {
                    response: Verdict::Accepted,
                    sdp_answer: Some(_),
                    ..
                } => order.push("callResponse"),
                _ => {}
            }
        }
        assert_eq!(order, vec!["startCommunication", "callResponse"]);
    }

    #[tokio::test]
    async fn declined_call_notifies_caller_only() {
        let mut h = Harness::new();
        let mut alice = h.registered("alice");
        let mut bob = h.registered("bob");
        h.place_call(&alice, "alice", "bob");
        bob.messages();
        h.send(&bob, ClientMessage::OnIceCandidate { candidate: candidate(1) });
        assert_eq!(h.state.candidates.pending(bob.id), 1);

        h.answer(&bob, "alice", CallDecision::Reject);
        h.settle().await;

        assert_eq!(
            alice.messages(),
            vec![ServerMessage::call_rejected("user declined")]
        );
        assert!(bob.messages().is_empty());
        assert!(h.state.active.is_empty());
        assert_eq!(h.state.candidates.pending(bob.id), 0);
        assert_eq!(h.engine.invocations(Operation::CreatePipeline), 0);
    }

    #[tokio::test]
    async fn answer_from_unknown_caller_terminates_callee() {
        let mut h = Harness::new();
        let mut bob = h.registered("bob");

        h.answer(&bob, "ghost", CallDecision::Accept);

        assert_eq!(
            bob.messages(),
            vec![ServerMessage::stop_communication(Some(
                "unknown from = ghost".into()
            ))]
        );
        assert!(h.state.active.is_empty());
    }

    #[tokio::test]
    async fn early_candidates_reach_endpoint_once_in_order() {
        let mut h = Harness::new();
        let alice = h.registered("alice");
        let bob = h.registered("bob");
        h.place_call(&alice, "alice", "bob");
        // the caller's queue was cleared when the call was placed; these arrive after
        for n in 1..=3 {
            h.send(&alice, ClientMessage::OnIceCandidate { candidate: candidate(n) });
        }
        h.answer(&bob, "alice", CallDecision::Accept);
        h.settle().await;

        let call_id = h.call_of(alice.id).expect("call");
        let endpoint = match &h.state.calls[&call_id].phase {
            CallPhase::Established(pipeline) => pipeline.endpoint(alice.id).expect("endpoint").clone(),
            CallPhase::Provisioning => panic!("call not established"),
        };
        assert_eq!(h.state.candidates.pending(alice.id), 0);

        h.send(&alice, ClientMessage::OnIceCandidate { candidate: candidate(4) });
        h.settle().await;

        assert_eq!(
            h.engine.added_candidates(&endpoint),
            vec![candidate(1), candidate(2), candidate(3), candidate(4)]
        );
    }

    #[tokio::test]
    async fn engine_candidates_are_relayed_to_their_browser() {
        let mut h = Harness::new();
        let alice = h.registered("alice");
        let mut bob = h.registered("bob");
        h.place_call(&alice, "alice", "bob");
        h.answer(&bob, "alice", CallDecision::Accept);
        h.settle().await;
        while bob.rx.try_recv().is_ok() {}

        let call_id = h.call_of(bob.id).expect("call");
        let endpoint = match &h.state.calls[&call_id].phase {
            CallPhase::Established(pipeline) => pipeline.endpoint(bob.id).expect("endpoint").clone(),
            CallPhase::Provisioning => panic!("call not established"),
        };
        assert!(h.engine.discover_candidate(&endpoint, candidate(9)));

        let relayed = tokio::time::timeout(Duration::from_secs(1), bob.rx.recv())
            .await
            .expect("relayed in time")
            .expect("channel open");
        assert_eq!(relayed, ServerMessage::IceCandidate { candidate: candidate(9) });
    }

    #[tokio::test]
    async fn stop_without_call_is_a_no_op() {
        let mut h = Harness::new();
        let mut alice = h.registered("alice");
        let mut bob = h.registered("bob");
        h.place_call(&alice, "alice", "bob");
        bob.messages();

        h.send(&alice, ClientMessage::Stop);

        assert!(alice.messages().is_empty());
        assert!(bob.messages().is_empty());
        let caller = h.state.registry.get_by_id(alice.id).expect("alice");
        assert_eq!(caller.peer.as_deref(), Some("bob"));
    }

    #[tokio::test]
    async fn stop_releases_pipeline_and_notifies_peer_once() {
        let mut h = Harness::new();
        let mut alice = h.registered("alice");
        let mut bob = h.registered("bob");
        h.place_call(&alice, "alice", "bob");
        h.answer(&bob, "alice", CallDecision::Accept);
        h.settle().await;
        alice.messages();
        bob.messages();

        h.send(&alice, ClientMessage::Stop);
        h.send(&alice, ClientMessage::Stop);
        h.settle().await;

        assert_eq!(
            bob.messages(),
            vec![ServerMessage::stop_communication(Some(
                "remote user hanged out".into()
            ))]
        );
        assert!(alice.messages().is_empty());
        assert!(h.state.active.is_empty());
        assert!(h.state.calls.is_empty());
        assert!(h.state.registry.get_by_id(alice.id).expect("alice").peer.is_none());
        assert!(h.state.registry.get_by_id(bob.id).expect("bob").peer.is_none());
        assert_eq!(h.engine.live_pipelines(), 0);
    }

    #[tokio::test]
    async fn setup_failure_leaves_no_entries_and_notifies_both() {
        let engine = Arc::new(InMemoryEngine::new());
        engine.fail_on(Operation::CreateEndpoint, 2);
        let mut h = Harness::with_engine(Some(engine));
        let (shared_tx, mut shared_rx) = mpsc::unbounded_channel();
        let alice_id = SessionId::generate();
        let bob_id = SessionId::generate();
        for (id, name) in [(alice_id, "alice"), (bob_id, "bob")] {
            h.state.handle(CallEvent::Inbound {
                session_id: id,
                outbound: shared_tx.clone(),
                message: ClientMessage::Register { name: name.into() },
            });
        }
        h.state.handle(CallEvent::Inbound {
            session_id: alice_id,
            outbound: shared_tx.clone(),
            message: ClientMessage::Call {
                to: "bob".into(),
                from: "alice".into(),
                sdp_offer: Some("offer-a".into()),
            },
        });
        h.state.handle(CallEvent::Inbound {
            session_id: bob_id,
            outbound: shared_tx.clone(),
            message: ClientMessage::IncomingCallResponse {
                from: Some("alice".into()),
                call_response: CallDecision::Accept,
                sdp_offer: Some("offer-b".into()),
            },
        });
        h.settle().await;

        assert!(h.call_of(alice_id).is_none());
        assert!(h.call_of(bob_id).is_none());
        assert!(h.state.calls.is_empty());
        assert_eq!(h.engine.live_pipelines(), 0);

        let mut order = Vec::new();
        while let Ok(message) = shared_rx.try_recv() {
            match message {
                ServerMessage::CallResponse {
                    response: Verdict::Rejected,
                    ..
                } => order.push("rejected"),
                ServerMessage::StopCommunication { message: Some(_) } => order.push("terminated"),
                _ => {}
            }
        }
        assert_eq!(order, vec!["rejected", "terminated"]);
    }

    #[tokio::test]
    async fn unreachable_media_server_rejects_the_call() {
        let mut h = Harness::with_engine(None);
        let mut alice = h.registered("alice");
        let mut bob = h.registered("bob");
        h.place_call(&alice, "alice", "bob");
        bob.messages();

        h.answer(&bob, "alice", CallDecision::Accept);
        h.settle().await;

        match alice.messages().as_slice() {
            [ServerMessage::CallResponse {
                response: Verdict::Rejected,
                message: Some(reason),
                ..
            }] => assert!(reason.contains("Could not find media server")),
            other => panic!("unexpected messages {other:?}"),
        }
        assert!(matches!(
            bob.messages().as_slice(),
            [ServerMessage::StopCommunication { message: Some(_) }]
        ));
        assert!(h.state.active.is_empty());
    }

    #[tokio::test]
    async fn stop_during_setup_releases_late_pipeline() {
        let engine = Arc::new(InMemoryEngine::new());
        let gate = engine.pause_on(Operation::CreatePipeline);
        let mut h = Harness::with_engine(Some(engine));
        let mut alice = h.registered("alice");
        let mut bob = h.registered("bob");
        h.place_call(&alice, "alice", "bob");
        h.answer(&bob, "alice", CallDecision::Accept);
        bob.messages();
        assert!(h.call_of(alice.id).is_some());

        h.send(&bob, ClientMessage::Stop);
        assert!(h.state.active.is_empty());
        assert_eq!(
            alice.messages(),
            vec![ServerMessage::stop_communication(Some(
                "remote user hanged out".into()
            ))]
        );

        gate.notify_one();
        h.settle().await;

        assert_eq!(h.engine.invocations(Operation::CreatePipeline), 1);
        assert_eq!(h.engine.live_pipelines(), 0);
        assert_eq!(h.engine.released().len(), 1);
        assert!(alice.messages().is_empty());
        assert!(bob.messages().is_empty());
    }

    #[tokio::test]
    async fn caller_already_in_a_call_is_rejected() {
        let mut h = Harness::new();
        let mut alice = h.registered("alice");
        let bob = h.registered("bob");
        let mut carol = h.registered("carol");
        h.place_call(&alice, "alice", "bob");
        h.answer(&bob, "alice", CallDecision::Accept);
        h.settle().await;
        alice.messages();

        h.place_call(&alice, "alice", "carol");

        assert_eq!(
            alice.messages(),
            vec![ServerMessage::call_rejected("User alice is already in a call")]
        );
        assert!(carol.messages().is_empty());
        assert_eq!(h.call_of(alice.id), h.call_of(bob.id));
    }

    #[tokio::test]
    async fn disconnect_tears_down_call_and_unregisters() {
        let mut h = Harness::new();
        let alice = h.registered("alice");
        let mut bob = h.registered("bob");
        h.place_call(&alice, "alice", "bob");
        h.answer(&bob, "alice", CallDecision::Accept);
        h.settle().await;
        bob.messages();

        h.state.handle(CallEvent::Disconnected { session_id: alice.id });
        h.settle().await;

        assert!(h.state.registry.get_by_name("alice").is_none());
        assert!(h.state.registry.get_by_id(alice.id).is_none());
        assert!(h.state.active.is_empty());
        assert_eq!(h.engine.live_pipelines(), 0);
        assert_eq!(
            bob.messages(),
            vec![ServerMessage::stop_communication(Some(
                "remote user hanged out".into()
            ))]
        );

        // the name is free again
        h.registered("alice");
    }

    #[tokio::test]
    async fn unregistered_caller_gets_an_error() {
        let mut h = Harness::new();
        let _bob = h.registered("bob");
        let mut stranger = h.client();

        h.place_call(&stranger, "stranger", "bob");

        assert!(matches!(
            stranger.messages().as_slice(),
            [ServerMessage::Error { .. }]
        ));
        assert!(h.state.registry.get_by_id(stranger.id).is_none());
    }

    #[tokio::test]
    async fn call_to_user_in_a_call_is_rejected_as_busy() {
        let mut h = Harness::new();
        let alice = h.registered("alice");
        let mut bob = h.registered("bob");
        let mut carol = h.registered("carol");
        h.place_call(&alice, "alice", "bob");
        h.answer(&bob, "alice", CallDecision::Accept);
        h.settle().await;
        bob.messages();

        h.place_call(&carol, "carol", "bob");

        assert_eq!(
            carol.messages(),
            vec![ServerMessage::call_rejected("User bob is busy")]
        );
        assert!(bob.messages().is_empty());
        let callee = h.state.registry.get_by_id(bob.id).expect("bob");
        assert_eq!(callee.peer.as_deref(), Some("alice"));
        assert!(h.state.registry.get_by_id(carol.id).expect("carol").peer.is_none());
        assert_eq!(h.call_of(alice.id), h.call_of(bob.id));
    }

    #[tokio::test]
    async fn accepting_a_second_call_leaves_the_ongoing_one_alone() {
        let mut h = Harness::new();
        let mut alice = h.registered("alice");
        let mut bob = h.registered("bob");
        let mut carol = h.registered("carol");
        h.place_call(&alice, "alice", "bob");
        h.place_call(&carol, "carol", "bob");
        h.answer(&bob, "carol", CallDecision::Accept);
        h.settle().await;
        let ongoing = h.call_of(bob.id).expect("bob and carol connected");
        bob.messages();
        carol.messages();

        h.answer(&bob, "alice", CallDecision::Accept);
        h.settle().await;

        assert_eq!(
            alice.messages(),
            vec![ServerMessage::call_rejected("User is already in a call")]
        );
        assert!(matches!(bob.messages().as_slice(), [ServerMessage::Error { .. }]));
        assert!(carol.messages().is_empty());
        assert_eq!(h.call_of(bob.id), Some(ongoing));
        assert_eq!(h.call_of(carol.id), Some(ongoing));
        assert!(h.call_of(alice.id).is_none());
        assert_eq!(h.engine.live_pipelines(), 1);
    }

    #[tokio::test]
    async fn answer_to_a_call_the_caller_moved_on_from_is_refused() {
        let mut h = Harness::new();
        let mut alice = h.registered("alice");
        let mut bob = h.registered("bob");
        let mut carol = h.registered("carol");
        h.place_call(&alice, "alice", "bob");
        h.place_call(&alice, "alice", "carol");
        bob.messages();
        carol.messages();

        h.answer(&bob, "alice", CallDecision::Accept);
        h.settle().await;

        assert_eq!(
            bob.messages(),
            vec![ServerMessage::stop_communication(Some(
                "User alice is not calling you".into()
            ))]
        );
        assert!(alice.messages().is_empty());
        assert!(h.state.active.is_empty());
        assert_eq!(h.engine.invocations(Operation::CreatePipeline), 0);
        let caller = h.state.registry.get_by_id(alice.id).expect("alice");
        assert_eq!(caller.peer.as_deref(), Some("carol"));
    }

    #[tokio::test]
    async fn ending_a_call_drops_both_parties_queued_candidates() {
        let engine = Arc::new(InMemoryEngine::new());
        let gate = engine.pause_on(Operation::CreatePipeline);
        let mut h = Harness::with_engine(Some(engine));
        let alice = h.registered("alice");
        let bob = h.registered("bob");
        h.place_call(&alice, "alice", "bob");
        h.answer(&bob, "alice", CallDecision::Accept);
        for n in 1..=2 {
            h.send(&alice, ClientMessage::OnIceCandidate { candidate: candidate(n) });
        }
        h.send(&bob, ClientMessage::OnIceCandidate { candidate: candidate(3) });
        assert_eq!(h.state.candidates.pending(alice.id), 2);
        assert_eq!(h.state.candidates.pending(bob.id), 1);

        h.send(&bob, ClientMessage::Stop);

        assert_eq!(h.state.candidates.pending(alice.id), 0);
        assert_eq!(h.state.candidates.pending(bob.id), 0);
        gate.notify_one();
        h.settle().await;
        assert_eq!(h.engine.live_pipelines(), 0);
    }
}
