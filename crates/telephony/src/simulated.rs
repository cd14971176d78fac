//! In-process engine used by the `callgate` binary and by tests.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::engine::{
    CapturedImage, EngineError, MediaEvent, MediaObserver, SessionEvent, SessionObserver,
    TelephonyEngine, VideoTarget,
};
use crate::property::{PropertyBag, PropertyValue};

/// Frame size used for stream captures.
const CAPTURE_WIDTH: u32 = 160;
const CAPTURE_HEIGHT: u32 = 120;

/// One invocation forwarded to the engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EngineCall {
    RegisterUser {
        device_id: String,
        user: String,
        credential: String,
        proxy: String,
    },
    StartP2PMode {
        user: String,
    },
    UnregisterUser,
    PlaceCall {
        directory_number: String,
        target: String,
    },
    PlaceP2PCall {
        directory_number: String,
        ip_address: String,
        target: String,
    },
    AnswerCall,
    HangupCall,
    SendDigits(String),
    SetProperty(PropertyBag),
    GetProperty(String),
    FetchImage {
        is_file: bool,
    },
}

struct SimState {
    available: bool,
    auto_connect: bool,
    registered: bool,
    calls: Vec<EngineCall>,
    failures: HashMap<String, String>,
    session_observer: Option<Arc<dyn SessionObserver>>,
    media_observer: Option<Arc<dyn MediaObserver>>,
    properties: BTreeMap<String, PropertyValue>,
    snapshot: Option<PathBuf>,
}

/// Engine that answers immediately and reports events synchronously.
pub struct SimulatedEngine {
    state: Mutex<SimState>,
}

impl SimulatedEngine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                available: true,
                auto_connect: true,
                registered: false,
                calls: Vec::new(),
                failures: HashMap::new(),
                session_observer: None,
                media_observer: None,
                properties: BTreeMap::new(),
                snapshot: None,
            }),
        }
    }

    /// Engine that reports itself as missing.
    pub fn unavailable() -> Self {
        let engine = Self::new();
        engine.state.lock().available = false;
        engine
    }

    /// File returned by `fetch_image(true)`.
    pub fn with_snapshot(self, path: impl Into<PathBuf>) -> Self {
        self.state.lock().snapshot = Some(path.into());
        self
    }

    /// Whether placed calls connect as soon as they are placed.
    pub fn set_auto_connect(&self, auto_connect: bool) {
        self.state.lock().auto_connect = auto_connect;
    }

    /// Fail the next invocation of `operation` (script name, e.g. `placeCall`).
    pub fn fail_next(&self, operation: &str, message: &str) {
        self.state
            .lock()
            .failures
            .insert(operation.to_string(), message.to_string());
    }

    /// Every invocation seen so far, in order.
    pub fn calls(&self) -> Vec<EngineCall> {
        self.state.lock().calls.clone()
    }

    pub fn count(&self, predicate: impl Fn(&EngineCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|c| predicate(c)).count()
    }

    pub fn is_registered(&self) -> bool {
        self.state.lock().registered
    }

    /// Observer of the most recent call.
    pub fn media_observer(&self) -> Option<Arc<dyn MediaObserver>> {
        self.state.lock().media_observer.clone()
    }

    pub fn session_observer(&self) -> Option<Arc<dyn SessionObserver>> {
        self.state.lock().session_observer.clone()
    }

    /// Simulate an inbound call.
    pub fn ring(&self, name: &str, number: &str) {
        let observer = self.state.lock().session_observer.clone();
        if let Some(observer) = observer {
            observer.on_session_event(&SessionEvent::IncomingCall {
                name: name.to_string(),
                number: number.to_string(),
            });
        }
    }

    /// Report the current call as connected.
    pub fn connect(&self) {
        self.emit_media(MediaEvent::CallConnected);
    }

    /// Simulate the remote party hanging up.
    pub fn remote_hangup(&self) {
        let observer = self.state.lock().media_observer.take();
        if let Some(observer) = observer {
            observer.on_media_event(&MediaEvent::CallTerminated);
        }
    }

    pub fn hold(&self) {
        self.emit_media(MediaEvent::CallHeld);
    }

    pub fn resume(&self) {
        self.emit_media(MediaEvent::CallResumed);
    }

    fn emit_media(&self, event: MediaEvent) {
        let observer = self.state.lock().media_observer.clone();
        if let Some(observer) = observer {
            observer.on_media_event(&event);
        }
    }

    /// Record an invocation and consume a pending failure for it.
    fn record(&self, operation: &str, call: EngineCall) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        if !state.available {
            return Err(EngineError::Unavailable);
        }
        tracing::debug!("Engine received {:?}", call);
        state.calls.push(call);
        match state.failures.remove(operation) {
            Some(message) => Err(EngineError::Rejected(message)),
            None => Ok(()),
        }
    }

    fn begin_session(&self, observer: Arc<dyn SessionObserver>) {
        {
            let mut state = self.state.lock();
            state.registered = true;
            state.session_observer = Some(observer.clone());
        }
        observer.on_session_event(&SessionEvent::RegistrationState("registered".into()));
    }

    fn begin_call(&self, observer: Arc<dyn MediaObserver>, connect: bool) {
        let connect = {
            let mut state = self.state.lock();
            state.media_observer = Some(observer.clone());
            connect || state.auto_connect
        };
        if connect {
            observer.on_media_event(&MediaEvent::CallConnected);
        }
    }
}

impl Default for SimulatedEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TelephonyEngine for SimulatedEngine {
    fn is_available(&self) -> bool {
        self.state.lock().available
    }

    fn register_user(
        &self,
        device_id: &str,
        user: &str,
        credential: &str,
        proxy: &str,
        observer: Arc<dyn SessionObserver>,
    ) -> Result<(), EngineError> {
        self.record(
            "registerUser",
            EngineCall::RegisterUser {
                device_id: device_id.to_string(),
                user: user.to_string(),
                credential: credential.to_string(),
                proxy: proxy.to_string(),
            },
        )?;
        self.begin_session(observer);
        Ok(())
    }

    fn start_p2p_mode(
        &self,
        user: &str,
        observer: Arc<dyn SessionObserver>,
    ) -> Result<(), EngineError> {
        self.record(
            "startP2PMode",
            EngineCall::StartP2PMode {
                user: user.to_string(),
            },
        )?;
        self.begin_session(observer);
        Ok(())
    }

    fn unregister_user(&self) -> Result<(), EngineError> {
        self.record("unregisterUser", EngineCall::UnregisterUser)?;

        let (session, media) = {
            let mut state = self.state.lock();
            let was_registered = std::mem::replace(&mut state.registered, false);
            let session = state.session_observer.take().filter(|_| was_registered);
            (session, state.media_observer.take())
        };
        if let Some(media) = media {
            media.on_media_event(&MediaEvent::CallTerminated);
        }
        if let Some(session) = session {
            session.on_session_event(&SessionEvent::RegistrationState("unregistered".into()));
        }
        Ok(())
    }

    fn place_call(
        &self,
        directory_number: &str,
        target: &VideoTarget,
        observer: Arc<dyn MediaObserver>,
    ) -> Result<(), EngineError> {
        self.record(
            "placeCall",
            EngineCall::PlaceCall {
                directory_number: directory_number.to_string(),
                target: target.label.clone(),
            },
        )?;
        self.begin_call(observer, false);
        Ok(())
    }

    fn place_p2p_call(
        &self,
        directory_number: &str,
        ip_address: &str,
        target: &VideoTarget,
        observer: Arc<dyn MediaObserver>,
    ) -> Result<(), EngineError> {
        self.record(
            "placeP2PCall",
            EngineCall::PlaceP2PCall {
                directory_number: directory_number.to_string(),
                ip_address: ip_address.to_string(),
                target: target.label.clone(),
            },
        )?;
        self.begin_call(observer, false);
        Ok(())
    }

    fn answer_call(
        &self,
        _target: &VideoTarget,
        observer: Arc<dyn MediaObserver>,
    ) -> Result<(), EngineError> {
        self.record("answerCall", EngineCall::AnswerCall)?;
        self.begin_call(observer, true);
        Ok(())
    }

    fn hangup_call(&self) -> Result<(), EngineError> {
        self.record("hangupCall", EngineCall::HangupCall)?;
        self.remote_hangup();
        Ok(())
    }

    fn send_digits(&self, digits: &str) -> Result<(), EngineError> {
        self.record("sendDigits", EngineCall::SendDigits(digits.to_string()))
    }

    fn set_property(&self, bag: &PropertyBag) -> Result<(), EngineError> {
        self.record("setProperty", EngineCall::SetProperty(bag.clone()))?;
        let mut state = self.state.lock();
        for (name, value) in bag.iter() {
            state.properties.insert(name.to_string(), value.clone());
        }
        Ok(())
    }

    fn get_property(&self, name: &str) -> Result<Option<PropertyValue>, EngineError> {
        self.record("getProperty", EngineCall::GetProperty(name.to_string()))?;
        Ok(self.state.lock().properties.get(name).cloned())
    }

    fn fetch_image(&self, is_file: bool) -> Result<CapturedImage, EngineError> {
        self.record("fetchImage", EngineCall::FetchImage { is_file })?;

        if !is_file {
            return Ok(CapturedImage {
                mime_type: "image/png".to_string(),
                data: encode_frame(CAPTURE_WIDTH, CAPTURE_HEIGHT)?,
            });
        }

        let path = self
            .state
            .lock()
            .snapshot
            .clone()
            .ok_or_else(|| EngineError::Media("no snapshot file".to_string()))?;
        let data = std::fs::read(&path)
            .map_err(|e| EngineError::Media(format!("{}: {}", path.display(), e)))?;

        Ok(CapturedImage {
            mime_type: mime_type_for(&path).to_string(),
            data,
        })
    }
}

/// Render a test-pattern frame as PNG.
fn encode_frame(width: u32, height: u32) -> Result<Vec<u8>, EngineError> {
    let mut pixels = Vec::with_capacity((width * height * 3) as usize);
    for y in 0..height {
        for x in 0..width {
            pixels.push((x * 255 / width.max(1)) as u8);
            pixels.push((y * 255 / height.max(1)) as u8);
            pixels.push(0x80);
        }
    }

    let mut data = Vec::new();
    let mut encoder = png::Encoder::new(&mut data, width, height);
    encoder.set_color(png::ColorType::Rgb);
    encoder.set_depth(png::BitDepth::Eight);
    let mut writer = encoder
        .write_header()
        .map_err(|e| EngineError::Media(e.to_string()))?;
    writer
        .write_image_data(&pixels)
        .map_err(|e| EngineError::Media(e.to_string()))?;
    writer
        .finish()
        .map_err(|e| EngineError::Media(e.to_string()))?;

    Ok(data)
}

fn mime_type_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::NoopObserver;

    #[derive(Default)]
    struct Events(Mutex<Vec<String>>);

    impl SessionObserver for Events {
        fn on_session_event(&self, event: &SessionEvent) {
            self.0.lock().push(event.state().to_string());
        }
    }

    impl MediaObserver for Events {
        fn on_media_event(&self, event: &MediaEvent) {
            self.0.lock().push(event.state().to_string());
        }
    }

    #[test]
    fn test_registration_events() {
        let engine = SimulatedEngine::new();
        let events = Arc::new(Events::default());

        engine
            .register_user("d", "u", "c", "p", events.clone())
            .unwrap();
        assert!(engine.is_registered());
        engine.ring("Bob", "5550000");
        engine.unregister_user().unwrap();

        assert_eq!(
            *events.0.lock(),
            vec!["registered", "incoming-call", "unregistered"]
        );
    }

    #[test]
    fn test_call_events() {
        let engine = SimulatedEngine::new();
        let events = Arc::new(Events::default());

        engine
            .place_call("5551234", &VideoTarget::default(), events.clone())
            .unwrap();
        engine.hold();
        engine.resume();
        engine.hangup_call().unwrap();
        // Nothing left to notify.
        engine.connect();

        assert_eq!(
            *events.0.lock(),
            vec!["call-connected", "call-held", "call-resumed", "call-terminated"]
        );
    }

    #[test]
    fn test_fail_next_is_consumed() {
        let engine = SimulatedEngine::new();
        engine.fail_next("sendDigits", "no call");

        assert_eq!(
            engine.send_digits("1"),
            Err(EngineError::Rejected("no call".into()))
        );
        assert!(engine.send_digits("1").is_ok());
        assert_eq!(engine.count(|c| matches!(c, EngineCall::SendDigits(_))), 2);
    }

    #[test]
    fn test_unavailable_engine() {
        let engine = SimulatedEngine::unavailable();
        assert!(!engine.is_available());
        assert_eq!(
            engine.start_p2p_mode("u", Arc::new(NoopObserver)),
            Err(EngineError::Unavailable)
        );
        assert!(engine.calls().is_empty());
    }

    #[test]
    fn test_properties_round_trip() {
        let engine = SimulatedEngine::new();
        let mut bag = PropertyBag::new();
        bag.set("udp", PropertyValue::Bool(true));
        engine.set_property(&bag).unwrap();

        assert_eq!(engine.get_property("udp").unwrap(), Some(PropertyValue::Bool(true)));
        assert_eq!(engine.get_property("tcp").unwrap(), None);
    }

    #[test]
    fn test_snapshot_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snap.JPG");
        std::fs::write(&path, b"\xff\xd8\xff").unwrap();
        let engine = SimulatedEngine::new().with_snapshot(&path);

        let image = engine.fetch_image(true).unwrap();
        assert_eq!(image.mime_type, "image/jpeg");
        assert_eq!(image.data, b"\xff\xd8\xff");
    }

    #[test]
    fn test_capture_is_png() {
        let image = SimulatedEngine::new().fetch_image(false).unwrap();
        let decoder = png::Decoder::new(image.data.as_slice());
        let reader = decoder.read_info().unwrap();
        assert_eq!(reader.info().width, CAPTURE_WIDTH);
        assert_eq!(reader.info().height, CAPTURE_HEIGHT);
    }
}
