//! Session and call state machine in front of the engine.
//!
//! Every operation checks its precondition first and fails with
//! `InvalidStateTransition` without touching the engine when it does not hold.
//! One instance is shared by every page; transitions are serialized by a
//! mutex that is never held across an engine or observer call. A transition
//! is reserved under the lock, the engine is called, and the reservation is
//! rolled back if the engine refuses.

use common::{BridgeError, BridgeResult};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

use crate::engine::{
    media_observer_or_noop, session_observer_or_noop, CapturedImage, EngineError, MediaEvent,
    MediaObserver, SessionEvent, SessionObserver, TelephonyEngine, VideoTarget,
};
use crate::property::{PropertyCodec, PropertyValue};

/// How the session was registered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegistrationMode {
    /// Registered with a proxy via `registerUser`.
    Proxy,
    /// Peer-to-peer mode via `startP2PMode`.
    PeerToPeer,
}

/// Registration state of the shared session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    Unregistered,
    Registered(RegistrationMode),
}

impl SessionStatus {
    pub fn is_registered(&self) -> bool {
        matches!(self, SessionStatus::Registered(_))
    }
}

/// State of the current call handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Placing,
    Active,
    Ended,
}

impl CallState {
    /// Placing or Active.
    pub fn is_live(&self) -> bool {
        matches!(self, CallState::Placing | CallState::Active)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallState::Idle => "idle",
            CallState::Placing => "placing",
            CallState::Active => "active",
            CallState::Ended => "ended",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallDirection {
    Outbound,
    Inbound,
}

/// Identifies one call for the lifetime of the session object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CallId(u64);

impl CallId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

/// Snapshot of the current call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallInfo {
    pub id: CallId,
    pub direction: CallDirection,
    pub state: CallState,
    /// Dialed number or calling party number.
    pub remote: String,
}

/// Inbound call reported by the engine and not yet answered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundOffer {
    pub name: String,
    pub number: String,
}

struct CallRecord {
    info: CallInfo,
    observer: Arc<dyn MediaObserver>,
}

struct SessionState {
    status: SessionStatus,
    session_observer: Arc<dyn SessionObserver>,
    call: Option<CallRecord>,
    inbound: Option<InboundOffer>,
    next_call_id: u64,
}

impl SessionState {
    fn live_call(&self) -> Option<&CallRecord> {
        self.call.as_ref().filter(|c| c.info.state.is_live())
    }

    fn call_state(&self) -> CallState {
        self.call
            .as_ref()
            .map(|c| c.info.state)
            .unwrap_or(CallState::Idle)
    }

    fn is_current(&self, id: CallId) -> bool {
        self.call.as_ref().map(|c| c.info.id) == Some(id)
    }

    /// Undo an `Ended` mark made before an engine call that failed.
    fn restore_call(&mut self, id: CallId, live: CallState) {
        if let Some(call) = self
            .call
            .as_mut()
            .filter(|c| c.info.id == id && c.info.state == CallState::Ended)
        {
            call.info.state = live;
        }
    }
}

/// Forwards session events and records inbound offers.
struct SessionTracker {
    state: Arc<Mutex<SessionState>>,
    inner: Arc<dyn SessionObserver>,
}

impl SessionObserver for SessionTracker {
    fn on_session_event(&self, event: &SessionEvent) {
        if let SessionEvent::IncomingCall { name, number } = event {
            let mut state = self.state.lock();
            if state.status.is_registered() {
                tracing::info!("Incoming call from {} <{}>", name, number);
                state.inbound = Some(InboundOffer {
                    name: name.clone(),
                    number: number.clone(),
                });
            } else {
                tracing::debug!("Ignoring incoming call from {} while unregistered", number);
            }
        }
        self.inner.on_session_event(event);
    }
}

/// Forwards media events for one call and applies its transitions.
struct CallTracker {
    state: Arc<Mutex<SessionState>>,
    call_id: CallId,
    inner: Arc<dyn MediaObserver>,
}

impl MediaObserver for CallTracker {
    fn on_media_event(&self, event: &MediaEvent) {
        {
            let mut state = self.state.lock();
            if let Some(call) = state.call.as_mut().filter(|c| c.info.id == self.call_id) {
                let next = match (event, call.info.state) {
                    (MediaEvent::CallConnected, CallState::Placing) => Some(CallState::Active),
                    (MediaEvent::CallTerminated, current) if current.is_live() => {
                        Some(CallState::Ended)
                    }
                    _ => None,
                };
                if let Some(next) = next {
                    tracing::debug!(
                        "Call {} {} -> {}",
                        self.call_id.value(),
                        call.info.state,
                        next
                    );
                    call.info.state = next;
                }
            }
        }
        self.inner.on_media_event(event);
    }
}

/// The shared privileged session.
pub struct PrivilegedSession {
    engine: Arc<dyn TelephonyEngine>,
    codec: PropertyCodec,
    state: Arc<Mutex<SessionState>>,
}

impl PrivilegedSession {
    pub fn new(engine: Arc<dyn TelephonyEngine>) -> Self {
        Self {
            engine,
            codec: PropertyCodec::new(),
            state: Arc::new(Mutex::new(SessionState {
                status: SessionStatus::Unregistered,
                session_observer: session_observer_or_noop(None),
                call: None,
                inbound: None,
                next_call_id: 1,
            })),
        }
    }

    pub fn engine(&self) -> &Arc<dyn TelephonyEngine> {
        &self.engine
    }

    pub fn status(&self) -> SessionStatus {
        self.state.lock().status
    }

    pub fn is_registered(&self) -> bool {
        self.status().is_registered()
    }

    /// State of the current call handle, `Idle` if there has been none.
    pub fn call_state(&self) -> CallState {
        self.state.lock().call_state()
    }

    pub fn current_call(&self) -> Option<CallInfo> {
        self.state.lock().call.as_ref().map(|c| c.info.clone())
    }

    pub fn pending_inbound(&self) -> Option<InboundOffer> {
        self.state.lock().inbound.clone()
    }

    /// Register with a proxy. Unregistered -> Registered.
    pub fn register_user(
        &self,
        device_id: &str,
        user: &str,
        credential: &str,
        proxy: &str,
        observer: Option<Arc<dyn SessionObserver>>,
    ) -> BridgeResult<()> {
        let observer = session_observer_or_noop(observer);
        let tracker = self.begin_registration("registerUser", RegistrationMode::Proxy, &observer)?;

        tracing::info!("Registering {} on device {} via {}", user, device_id, proxy);
        let result = self
            .engine
            .register_user(device_id, user, credential, proxy, tracker);
        self.finish_registration("registerUser", result, &observer)
    }

    /// Start peer-to-peer mode. Same transition as `register_user`.
    pub fn start_p2p_mode(
        &self,
        user: &str,
        observer: Option<Arc<dyn SessionObserver>>,
    ) -> BridgeResult<()> {
        let observer = session_observer_or_noop(observer);
        let tracker =
            self.begin_registration("startP2PMode", RegistrationMode::PeerToPeer, &observer)?;

        tracing::info!("Starting peer-to-peer mode for {}", user);
        let result = self.engine.start_p2p_mode(user, tracker);
        self.finish_registration("startP2PMode", result, &observer)
    }

    /// Registered -> Unregistered. Always forwarded to the engine.
    pub fn unregister_user(&self) -> BridgeResult<()> {
        let (previous, ended_call, offer, observer) = {
            let mut state = self.state.lock();
            let previous = state.status;
            state.status = SessionStatus::Unregistered;
            let offer = state.inbound.take();
            let ended_call = state
                .call
                .as_mut()
                .filter(|c| c.info.state.is_live())
                .map(|call| {
                    let live = (call.info.id, call.info.state);
                    call.info.state = CallState::Ended;
                    live
                });
            (previous, ended_call, offer, state.session_observer.clone())
        };

        if !previous.is_registered() {
            tracing::debug!("unregisterUser with no registered session");
        }

        if let Err(err) = self.engine.unregister_user() {
            {
                let mut state = self.state.lock();
                state.status = previous;
                if let Some((call_id, live)) = ended_call {
                    state.restore_call(call_id, live);
                }
                if state.inbound.is_none() {
                    state.inbound = offer;
                }
            }
            tracing::warn!("unregisterUser failed: {}", err);
            observer.on_session_event(&SessionEvent::Error(err.to_string()));
            return Err(engine_failure("unregisterUser", err));
        }

        tracing::info!("Session unregistered");
        Ok(())
    }

    /// Place a call through the proxy. Requires a registered session.
    pub fn place_call(
        &self,
        directory_number: &str,
        target: &VideoTarget,
        observer: Option<Arc<dyn MediaObserver>>,
    ) -> BridgeResult<CallId> {
        let observer = media_observer_or_noop(observer);
        let (call_id, tracker) =
            self.begin_outbound_call("placeCall", directory_number, &observer)?;

        tracing::info!("Placing call {} to {}", call_id.value(), directory_number);
        let result = self.engine.place_call(directory_number, target, tracker);
        self.finish_call("placeCall", call_id, result, None, &observer)
    }

    /// Place a call directly to a peer address. Requires a registered session.
    pub fn place_p2p_call(
        &self,
        directory_number: &str,
        ip_address: &str,
        target: &VideoTarget,
        observer: Option<Arc<dyn MediaObserver>>,
    ) -> BridgeResult<CallId> {
        let observer = media_observer_or_noop(observer);
        let (call_id, tracker) =
            self.begin_outbound_call("placeP2PCall", directory_number, &observer)?;

        tracing::info!(
            "Placing peer-to-peer call {} to {} at {}",
            call_id.value(),
            directory_number,
            ip_address
        );
        let result = self
            .engine
            .place_p2p_call(directory_number, ip_address, target, tracker);
        self.finish_call("placeP2PCall", call_id, result, None, &observer)
    }

    /// Answer the pending inbound call. Moves it straight to Active.
    pub fn answer_call(
        &self,
        target: &VideoTarget,
        observer: Option<Arc<dyn MediaObserver>>,
    ) -> BridgeResult<CallId> {
        let observer = media_observer_or_noop(observer);

        let (call_id, offer) = {
            let mut state = self.state.lock();
            if let Some(call) = state.live_call() {
                return Err(BridgeError::invalid_state(
                    "answerCall",
                    format!("call is in progress ({})", call.info.state),
                ));
            }
            let Some(offer) = state.inbound.take() else {
                return Err(BridgeError::invalid_state("answerCall", "no incoming call"));
            };
            let call_id = CallId(state.next_call_id);
            state.next_call_id += 1;
            state.call = Some(CallRecord {
                info: CallInfo {
                    id: call_id,
                    direction: CallDirection::Inbound,
                    state: CallState::Active,
                    remote: offer.number.clone(),
                },
                observer: observer.clone(),
            });
            (call_id, offer)
        };

        tracing::info!("Answering call {} from {}", call_id.value(), offer.number);
        let tracker = self.track_call(call_id, &observer);
        let result = self.engine.answer_call(target, tracker);
        self.finish_call("answerCall", call_id, result, Some(offer), &observer)
    }

    /// End the current call. A no-op when no call is Placing or Active.
    pub fn hangup_call(&self) -> BridgeResult<()> {
        let ended = {
            let mut state = self.state.lock();
            match state.call.as_mut().filter(|c| c.info.state.is_live()) {
                Some(call) => {
                    let live = call.info.state;
                    call.info.state = CallState::Ended;
                    Some((call.info.id, live, call.observer.clone()))
                }
                None => None,
            }
        };

        let Some((call_id, live, observer)) = ended else {
            tracing::debug!("hangupCall with no active call");
            return Ok(());
        };

        tracing::info!("Hanging up call {}", call_id.value());
        self.engine.hangup_call().map_err(|err| {
            self.state.lock().restore_call(call_id, live);
            tracing::warn!("hangupCall failed: {}", err);
            observer.on_media_event(&MediaEvent::Error(err.to_string()));
            engine_failure("hangupCall", err)
        })
    }

    /// Send DTMF digits on the active call. Digits are not validated here.
    pub fn send_digits(&self, digits: &str) -> BridgeResult<()> {
        let observer = {
            let state = self.state.lock();
            match state.call.as_ref() {
                Some(call) if call.info.state == CallState::Active => call.observer.clone(),
                _ => {
                    return Err(BridgeError::invalid_state(
                        "sendDigits",
                        format!("no active call ({})", state.call_state()),
                    ))
                }
            }
        };

        tracing::debug!("Sending {} digits", digits.len());
        self.engine.send_digits(digits).map_err(|err| {
            observer.on_media_event(&MediaEvent::Error(err.to_string()));
            engine_failure("sendDigits", err)
        })
    }

    /// Configure the engine. Unrecognized property names are dropped.
    pub fn set_property(&self, properties: &Map<String, Value>) -> BridgeResult<()> {
        let bag = self.codec.encode(properties);
        tracing::debug!("Setting {} of {} properties", bag.len(), properties.len());
        self.engine
            .set_property(&bag)
            .map_err(|err| engine_failure("setProperty", err))
    }

    pub fn get_property(&self, name: &str) -> BridgeResult<Option<PropertyValue>> {
        self.engine
            .get_property(name)
            .map_err(|err| engine_failure("getProperty", err))
    }

    /// Capture a still image, from the video stream or a snapshot file.
    pub fn fetch_image(&self, is_file: bool) -> BridgeResult<CapturedImage> {
        self.engine
            .fetch_image(is_file)
            .map_err(|err| engine_failure("fetchImage", err))
    }

    fn begin_registration(
        &self,
        operation: &'static str,
        mode: RegistrationMode,
        observer: &Arc<dyn SessionObserver>,
    ) -> BridgeResult<Arc<dyn SessionObserver>> {
        let mut state = self.state.lock();
        if let SessionStatus::Registered(current) = state.status {
            return Err(BridgeError::invalid_state(
                operation,
                format!("session already in progress ({:?})", current),
            ));
        }
        state.status = SessionStatus::Registered(mode);
        state.session_observer = observer.clone();

        Ok(Arc::new(SessionTracker {
            state: self.state.clone(),
            inner: observer.clone(),
        }))
    }

    fn finish_registration(
        &self,
        operation: &'static str,
        result: Result<(), EngineError>,
        observer: &Arc<dyn SessionObserver>,
    ) -> BridgeResult<()> {
        match result {
            Ok(()) => Ok(()),
            Err(err) => {
                self.state.lock().status = SessionStatus::Unregistered;
                tracing::warn!("{} failed: {}", operation, err);
                observer.on_session_event(&SessionEvent::Error(err.to_string()));
                Err(engine_failure(operation, err))
            }
        }
    }

    fn begin_outbound_call(
        &self,
        operation: &'static str,
        directory_number: &str,
        observer: &Arc<dyn MediaObserver>,
    ) -> BridgeResult<(CallId, Arc<dyn MediaObserver>)> {
        let call_id = {
            let mut state = self.state.lock();
            if !state.status.is_registered() {
                return Err(BridgeError::invalid_state(operation, "no registered session"));
            }
            if let Some(call) = state.live_call() {
                return Err(BridgeError::invalid_state(
                    operation,
                    format!("call is in progress ({})", call.info.state),
                ));
            }
            let call_id = CallId(state.next_call_id);
            state.next_call_id += 1;
            state.call = Some(CallRecord {
                info: CallInfo {
                    id: call_id,
                    direction: CallDirection::Outbound,
                    state: CallState::Placing,
                    remote: directory_number.to_string(),
                },
                observer: observer.clone(),
            });
            call_id
        };

        Ok((call_id, self.track_call(call_id, observer)))
    }

    fn track_call(&self, call_id: CallId, observer: &Arc<dyn MediaObserver>) -> Arc<dyn MediaObserver> {
        Arc::new(CallTracker {
            state: self.state.clone(),
            call_id,
            inner: observer.clone(),
        })
    }

    fn finish_call(
        &self,
        operation: &'static str,
        call_id: CallId,
        result: Result<(), EngineError>,
        restore_offer: Option<InboundOffer>,
        observer: &Arc<dyn MediaObserver>,
    ) -> BridgeResult<CallId> {
        let Err(err) = result else {
            return Ok(call_id);
        };

        {
            let mut state = self.state.lock();
            if state.is_current(call_id) {
                state.call = None;
            }
            if state.inbound.is_none() {
                state.inbound = restore_offer;
            }
        }

        tracing::warn!("{} failed: {}", operation, err);
        observer.on_media_event(&MediaEvent::Error(err.to_string()));
        Err(engine_failure(operation, err))
    }
}

fn engine_failure(operation: &'static str, err: EngineError) -> BridgeError {
    BridgeError::engine(operation, err.to_string())
}
