//! The narrow capability handed to a page.
//!
//! A `CallApi` knows the page's origin and holds a revocable binding to the
//! process-wide services. It never exposes the gate, the trust store or the
//! session themselves; every operation is authorized by the consent gate and
//! only then forwarded to the session.

use callgate_security::{ConsentGate, Origin};
use common::{BridgeError, BridgeResult};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use telephony::{
    CapturedImage, MediaObserver, PrivilegedSession, PropertyValue, SessionObserver, VideoTarget,
};
use url::Url;

/// Text shown by the consent prompt.
pub const CONSENT_MESSAGE: &str =
    "This website is requesting access to your webcam and microphone. Do you wish to allow it?";

/// One operation of the injected API.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    RegisterUser,
    StartP2PMode,
    PlaceCall,
    PlaceP2PCall,
    HangupCall,
    UnregisterUser,
    AnswerCall,
    SetProperty,
    GetProperty,
    SendDigits,
    FetchImage,
}

impl Operation {
    /// Every operation, in the order they are installed.
    pub const ALL: [Operation; 11] = [
        Operation::RegisterUser,
        Operation::StartP2PMode,
        Operation::PlaceCall,
        Operation::PlaceP2PCall,
        Operation::HangupCall,
        Operation::UnregisterUser,
        Operation::AnswerCall,
        Operation::SetProperty,
        Operation::GetProperty,
        Operation::SendDigits,
        Operation::FetchImage,
    ];

    /// Name visible to page script.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::RegisterUser => "registerUser",
            Operation::StartP2PMode => "startP2PMode",
            Operation::PlaceCall => "placeCall",
            Operation::PlaceP2PCall => "placeP2PCall",
            Operation::HangupCall => "hangupCall",
            Operation::UnregisterUser => "unregisterUser",
            Operation::AnswerCall => "answerCall",
            Operation::SetProperty => "setProperty",
            Operation::GetProperty => "getProperty",
            Operation::SendDigits => "sendDigits",
            Operation::FetchImage => "fetchImage",
        }
    }

    /// Declared number of script arguments.
    pub fn arity(&self) -> usize {
        match self {
            Operation::RegisterUser => 5,
            Operation::StartP2PMode => 2,
            Operation::PlaceCall => 3,
            Operation::PlaceP2PCall => 4,
            Operation::HangupCall | Operation::UnregisterUser => 0,
            Operation::AnswerCall => 2,
            Operation::SetProperty
            | Operation::GetProperty
            | Operation::SendDigits
            | Operation::FetchImage => 1,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A fully decoded call from a page.
pub enum CallRequest {
    RegisterUser {
        device_id: String,
        user: String,
        credential: String,
        proxy: String,
        observer: Option<Arc<dyn SessionObserver>>,
    },
    StartP2PMode {
        user: String,
        observer: Option<Arc<dyn SessionObserver>>,
    },
    PlaceCall {
        directory_number: String,
        target: VideoTarget,
        observer: Option<Arc<dyn MediaObserver>>,
    },
    PlaceP2PCall {
        directory_number: String,
        ip_address: String,
        target: VideoTarget,
        observer: Option<Arc<dyn MediaObserver>>,
    },
    HangupCall,
    UnregisterUser,
    AnswerCall {
        target: VideoTarget,
        observer: Option<Arc<dyn MediaObserver>>,
    },
    SetProperty(Map<String, Value>),
    GetProperty(String),
    SendDigits(String),
    FetchImage {
        is_file: bool,
    },
}

impl CallRequest {
    pub fn operation(&self) -> Operation {
        match self {
            CallRequest::RegisterUser { .. } => Operation::RegisterUser,
            CallRequest::StartP2PMode { .. } => Operation::StartP2PMode,
            CallRequest::PlaceCall { .. } => Operation::PlaceCall,
            CallRequest::PlaceP2PCall { .. } => Operation::PlaceP2PCall,
            CallRequest::HangupCall => Operation::HangupCall,
            CallRequest::UnregisterUser => Operation::UnregisterUser,
            CallRequest::AnswerCall { .. } => Operation::AnswerCall,
            CallRequest::SetProperty(_) => Operation::SetProperty,
            CallRequest::GetProperty(_) => Operation::GetProperty,
            CallRequest::SendDigits(_) => Operation::SendDigits,
            CallRequest::FetchImage { .. } => Operation::FetchImage,
        }
    }
}

/// Successful result of a call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CallOutput {
    Done,
    Property(Option<PropertyValue>),
    Image(CapturedImage),
}

/// Process-wide services shared by every page.
pub struct BridgeServices {
    gate: Arc<ConsentGate>,
    session: Arc<PrivilegedSession>,
    consent_message: String,
    video_size: (u32, u32),
}

impl BridgeServices {
    pub fn new(gate: Arc<ConsentGate>, session: Arc<PrivilegedSession>) -> Self {
        let default_target = VideoTarget::default();
        Self {
            gate,
            session,
            consent_message: CONSENT_MESSAGE.to_string(),
            video_size: (default_target.width, default_target.height),
        }
    }

    pub fn with_consent_message(mut self, message: impl Into<String>) -> Self {
        self.consent_message = message.into();
        self
    }

    pub fn with_video_size(mut self, width: u32, height: u32) -> Self {
        self.video_size = (width, height);
        self
    }

    pub fn gate(&self) -> &Arc<ConsentGate> {
        &self.gate
    }

    pub fn session(&self) -> &Arc<PrivilegedSession> {
        &self.session
    }

    pub fn consent_message(&self) -> &str {
        &self.consent_message
    }

    /// Target used when a page passes no rendering context.
    pub fn default_target(&self) -> VideoTarget {
        VideoTarget::default().with_size(self.video_size.0, self.video_size.1)
    }
}

/// Capability object bound to one page.
pub struct CallApi {
    page_url: String,
    origin: Option<Origin>,
    binding: RwLock<Option<Arc<BridgeServices>>>,
}

impl CallApi {
    pub fn new(page_url: &Url, services: Arc<BridgeServices>) -> Self {
        let origin = Origin::from_url(page_url);
        if origin.is_none() {
            tracing::warn!("{} has no tuple origin; privileged calls will be denied", page_url);
        }
        Self {
            page_url: page_url.to_string(),
            origin,
            binding: RwLock::new(Some(services)),
        }
    }

    /// Origin of the page, `None` for opaque pages.
    pub fn origin(&self) -> Option<&Origin> {
        self.origin.as_ref()
    }

    pub fn page_url(&self) -> &str {
        &self.page_url
    }

    /// Release the binding. Later calls fail with `Revoked`.
    pub fn revoke(&self) {
        if self.binding.write().take().is_some() {
            tracing::debug!("Call API for {} revoked", self.page_url);
        }
    }

    pub fn is_revoked(&self) -> bool {
        self.binding.read().is_none()
    }

    /// Target used when a page passes no rendering context.
    pub fn default_target(&self) -> VideoTarget {
        self.binding
            .read()
            .as_ref()
            .map(|services| services.default_target())
            .unwrap_or_default()
    }

    /// Run a decoded request.
    pub async fn invoke(&self, request: CallRequest) -> BridgeResult<CallOutput> {
        match request {
            CallRequest::RegisterUser {
                device_id,
                user,
                credential,
                proxy,
                observer,
            } => self
                .register_user(&device_id, &user, &credential, &proxy, observer)
                .await
                .map(|_| CallOutput::Done),
            CallRequest::StartP2PMode { user, observer } => self
                .start_p2p_mode(&user, observer)
                .await
                .map(|_| CallOutput::Done),
            CallRequest::PlaceCall {
                directory_number,
                target,
                observer,
            } => self
                .place_call(&directory_number, &target, observer)
                .await
                .map(|_| CallOutput::Done),
            CallRequest::PlaceP2PCall {
                directory_number,
                ip_address,
                target,
                observer,
            } => self
                .place_p2p_call(&directory_number, &ip_address, &target, observer)
                .await
                .map(|_| CallOutput::Done),
            CallRequest::HangupCall => self.hangup_call().await.map(|_| CallOutput::Done),
            CallRequest::UnregisterUser => self.unregister_user().await.map(|_| CallOutput::Done),
            CallRequest::AnswerCall { target, observer } => self
                .answer_call(&target, observer)
                .await
                .map(|_| CallOutput::Done),
            CallRequest::SetProperty(properties) => self
                .set_property(&properties)
                .await
                .map(|_| CallOutput::Done),
            CallRequest::GetProperty(name) => {
                self.get_property(&name).await.map(CallOutput::Property)
            }
            CallRequest::SendDigits(digits) => {
                self.send_digits(&digits).await.map(|_| CallOutput::Done)
            }
            CallRequest::FetchImage { is_file } => {
                self.fetch_image(is_file).await.map(CallOutput::Image)
            }
        }
    }

    pub async fn register_user(
        &self,
        device_id: &str,
        user: &str,
        credential: &str,
        proxy: &str,
        observer: Option<Arc<dyn SessionObserver>>,
    ) -> BridgeResult<()> {
        let services = self.authorize(Operation::RegisterUser).await?;
        services
            .session
            .register_user(device_id, user, credential, proxy, observer)
    }

    pub async fn start_p2p_mode(
        &self,
        user: &str,
        observer: Option<Arc<dyn SessionObserver>>,
    ) -> BridgeResult<()> {
        let services = self.authorize(Operation::StartP2PMode).await?;
        services.session.start_p2p_mode(user, observer)
    }

    pub async fn place_call(
        &self,
        directory_number: &str,
        target: &VideoTarget,
        observer: Option<Arc<dyn MediaObserver>>,
    ) -> BridgeResult<()> {
        let services = self.authorize(Operation::PlaceCall).await?;
        services
            .session
            .place_call(directory_number, target, observer)
            .map(|_| ())
    }

    pub async fn place_p2p_call(
        &self,
        directory_number: &str,
        ip_address: &str,
        target: &VideoTarget,
        observer: Option<Arc<dyn MediaObserver>>,
    ) -> BridgeResult<()> {
        let services = self.authorize(Operation::PlaceP2PCall).await?;
        services
            .session
            .place_p2p_call(directory_number, ip_address, target, observer)
            .map(|_| ())
    }

    pub async fn hangup_call(&self) -> BridgeResult<()> {
        let services = self.authorize(Operation::HangupCall).await?;
        services.session.hangup_call()
    }

    pub async fn unregister_user(&self) -> BridgeResult<()> {
        let services = self.authorize(Operation::UnregisterUser).await?;
        services.session.unregister_user()
    }

    pub async fn answer_call(
        &self,
        target: &VideoTarget,
        observer: Option<Arc<dyn MediaObserver>>,
    ) -> BridgeResult<()> {
        let services = self.authorize(Operation::AnswerCall).await?;
        services.session.answer_call(target, observer).map(|_| ())
    }

    pub async fn set_property(&self, properties: &Map<String, Value>) -> BridgeResult<()> {
        let services = self.authorize(Operation::SetProperty).await?;
        services.session.set_property(properties)
    }

    pub async fn get_property(&self, name: &str) -> BridgeResult<Option<PropertyValue>> {
        let services = self.authorize(Operation::GetProperty).await?;
        services.session.get_property(name)
    }

    pub async fn send_digits(&self, digits: &str) -> BridgeResult<()> {
        let services = self.authorize(Operation::SendDigits).await?;
        services.session.send_digits(digits)
    }

    pub async fn fetch_image(&self, is_file: bool) -> BridgeResult<CapturedImage> {
        let services = self.authorize(Operation::FetchImage).await?;
        services.session.fetch_image(is_file)
    }

    /// Evaluate consent once for this call.
    async fn authorize(&self, operation: Operation) -> BridgeResult<Arc<BridgeServices>> {
        let services = self.services()?;

        let Some(origin) = self.origin.as_ref() else {
            tracing::warn!("{} denied for opaque page {}", operation, self.page_url);
            return Err(BridgeError::permission_denied(self.page_url.clone()));
        };

        tracing::debug!("{} requested by {}", operation, origin);
        let allowed = services
            .gate
            .evaluate(origin, &services.consent_message)
            .await;

        // The page may have gone away while the prompt was open.
        let services = self.services()?;

        if !allowed {
            tracing::info!("{} denied for {}", operation, origin);
            return Err(BridgeError::permission_denied(origin.to_string()));
        }
        Ok(services)
    }

    fn services(&self) -> BridgeResult<Arc<BridgeServices>> {
        self.binding.read().clone().ok_or(BridgeError::Revoked)
    }
}

impl fmt::Debug for CallApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallApi")
            .field("page_url", &self.page_url)
            .field("origin", &self.origin)
            .field("revoked", &self.is_revoked())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use callgate_security::{
        AutoPrompt, ConsentPrompt, MemoryPermissions, MemoryPreferences, OriginTrustStore,
        PromptOutcome, TrustDecision, PRIVILEGED_CALL,
    };
    use telephony::{CallState, EngineCall, SimulatedEngine};
    use tokio::sync::{mpsc, oneshot};

    const KEY: &str = "extensions.callgate.allowedDomains";

    struct Fixture {
        services: Arc<BridgeServices>,
        engine: Arc<SimulatedEngine>,
        trust: Arc<OriginTrustStore>,
    }

    fn fixture(prompt: Arc<dyn ConsentPrompt>) -> Fixture {
        let trust = Arc::new(OriginTrustStore::new(
            Arc::new(MemoryPreferences::new()),
            Arc::new(MemoryPermissions::new()),
            KEY,
            PRIVILEGED_CALL,
        ));
        let engine = Arc::new(SimulatedEngine::new());
        let gate = Arc::new(ConsentGate::new(trust.clone(), prompt));
        let session = Arc::new(PrivilegedSession::new(engine.clone()));
        Fixture {
            services: Arc::new(BridgeServices::new(gate, session)),
            engine,
            trust,
        }
    }

    fn api(fixture: &Fixture, url: &str) -> CallApi {
        CallApi::new(&Url::parse(url).unwrap(), fixture.services.clone())
    }

    #[test]
    fn test_operation_names() {
        let names: Vec<&str> = Operation::ALL.iter().map(|op| op.name()).collect();
        assert_eq!(
            names,
            vec![
                "registerUser",
                "startP2PMode",
                "placeCall",
                "placeP2PCall",
                "hangupCall",
                "unregisterUser",
                "answerCall",
                "setProperty",
                "getProperty",
                "sendDigits",
                "fetchImage"
            ]
        );
        assert_eq!(Operation::RegisterUser.arity(), 5);
        assert_eq!(Operation::PlaceP2PCall.arity(), 4);
        assert_eq!(Operation::HangupCall.arity(), 0);
    }

    #[tokio::test]
    async fn test_trust_is_not_sufficient() {
        let prompt = Arc::new(AutoPrompt::new(PromptOutcome::Accept));
        let fixture = fixture(prompt.clone());
        let api = api(&fixture, "https://unlisted.example/app");

        let err = api
            .place_call("5551234", &VideoTarget::default(), None)
            .await
            .unwrap_err();

        assert!(err.is_invalid_state());
        assert_eq!(prompt.times_shown(), 1);
        assert_eq!(
            fixture.trust.decision(api.origin().unwrap()),
            TrustDecision::Allow
        );
        assert!(fixture.engine.calls().is_empty());
    }

    #[tokio::test]
    async fn test_denied_call_never_reaches_engine() {
        let prompt = Arc::new(AutoPrompt::new(PromptOutcome::Decline));
        let fixture = fixture(prompt.clone());
        let api = api(&fixture, "https://unlisted.example");

        let err = api.set_property(&Map::new()).await.unwrap_err();
        assert_eq!(err, BridgeError::permission_denied("https://unlisted.example"));
        assert!(fixture.engine.calls().is_empty());

        // Persisted deny: no second prompt.
        assert!(api.fetch_image(false).await.unwrap_err().is_permission_denied());
        assert_eq!(prompt.times_shown(), 1);
    }

    #[tokio::test]
    async fn test_allow_listed_origin_full_flow() {
        let prompt = Arc::new(AutoPrompt::new(PromptOutcome::Decline));
        let fixture = fixture(prompt.clone());
        let api = api(&fixture, "http://localhost/demo.html");

        api.register_user("dev1", "alice", "secret", "proxy.example", None)
            .await
            .unwrap();
        api.place_call("5551234", &VideoTarget::default(), None)
            .await
            .unwrap();
        api.send_digits("123").await.unwrap();
        api.hangup_call().await.unwrap();
        api.unregister_user().await.unwrap();

        assert_eq!(prompt.times_shown(), 0);
        assert!(fixture
            .engine
            .calls()
            .contains(&EngineCall::SendDigits("123".into())));
        assert_eq!(fixture.services.session().call_state(), CallState::Ended);
    }

    #[tokio::test]
    async fn test_allow_listed_origin_still_state_checked() {
        let fixture = fixture(Arc::new(AutoPrompt::new(PromptOutcome::Accept)));
        let api = api(&fixture, "http://localhost");

        let err = api.send_digits("1").await.unwrap_err();
        assert!(err.is_invalid_state());
    }

    #[tokio::test]
    async fn test_opaque_page_denied_without_prompt() {
        let prompt = Arc::new(AutoPrompt::new(PromptOutcome::Accept));
        let fixture = fixture(prompt.clone());
        let api = api(&fixture, "data:text/html,<p>hi</p>");

        assert!(api.origin().is_none());
        let err = api.get_property("udp").await.unwrap_err();
        assert!(err.is_permission_denied());
        assert_eq!(prompt.times_shown(), 0);
    }

    #[tokio::test]
    async fn test_revoked_api() {
        let prompt = Arc::new(AutoPrompt::new(PromptOutcome::Accept));
        let fixture = fixture(prompt.clone());
        let api = api(&fixture, "http://localhost");

        api.revoke();
        assert!(api.is_revoked());
        assert_eq!(api.hangup_call().await, Err(BridgeError::Revoked));
        assert!(fixture.engine.calls().is_empty());
    }

    /// Prompt answered by the test through a channel.
    struct ManualPrompt {
        requests: mpsc::UnboundedSender<oneshot::Sender<PromptOutcome>>,
    }

    #[async_trait]
    impl ConsentPrompt for ManualPrompt {
        async fn show(&self, _origin: &Origin, _message: &str) -> PromptOutcome {
            let (tx, rx) = oneshot::channel();
            if self.requests.send(tx).is_err() {
                return PromptOutcome::Dismissed;
            }
            rx.await.unwrap_or(PromptOutcome::Dismissed)
        }
    }

    #[tokio::test]
    async fn test_revoked_while_prompt_open() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let fixture = fixture(Arc::new(ManualPrompt { requests: tx }));
        let api = Arc::new(api(&fixture, "https://unlisted.example"));

        let pending = tokio::spawn({
            let api = api.clone();
            async move { api.start_p2p_mode("alice", None).await }
        });

        let answer = rx.recv().await.unwrap();
        api.revoke();
        answer.send(PromptOutcome::Accept).unwrap();

        assert_eq!(pending.await.unwrap(), Err(BridgeError::Revoked));
        assert!(fixture.engine.calls().is_empty());
        assert!(!fixture.services.session().is_registered());
    }

    #[tokio::test]
    async fn test_invoke_dispatch() {
        let fixture = fixture(Arc::new(AutoPrompt::new(PromptOutcome::Accept)));
        let api = api(&fixture, "http://localhost");

        let mut properties = Map::new();
        properties.insert("remotevoipport".into(), Value::from(6000));
        let output = api.invoke(CallRequest::SetProperty(properties)).await.unwrap();
        assert_eq!(output, CallOutput::Done);

        let output = api
            .invoke(CallRequest::GetProperty("remotevoipport".into()))
            .await
            .unwrap();
        assert_eq!(
            output,
            CallOutput::Property(Some(PropertyValue::Text("6000".into())))
        );

        let request = CallRequest::FetchImage { is_file: false };
        assert_eq!(request.operation(), Operation::FetchImage);
        match api.invoke(request).await.unwrap() {
            CallOutput::Image(image) => assert_eq!(image.mime_type, "image/png"),
            other => panic!("unexpected output {:?}", other),
        }
    }

    #[test]
    fn test_default_target_uses_configured_size() {
        let fixture = fixture(Arc::new(AutoPrompt::new(PromptOutcome::Accept)));
        let services = Arc::new(
            BridgeServices::new(
                fixture.services.gate().clone(),
                fixture.services.session().clone(),
            )
            .with_video_size(320, 240),
        );
        let api = CallApi::new(&Url::parse("http://localhost").unwrap(), services);
        let target = api.default_target();
        assert_eq!((target.width, target.height), (320, 240));

        api.revoke();
        assert_eq!(api.default_target(), VideoTarget::default());
    }
}
