//! Script bindings for `navigator.service.call`.
//!
//! Native functions only decode their arguments and queue the request; the
//! page context runs queued requests and settles the returned promises.

use base64::Engine as _;
use boa_engine::{
    js_string,
    object::{
        builtins::{JsFunction, JsPromise},
        ObjectInitializer,
    },
    property::Attribute,
    Context, JsArgs, JsError, JsNativeError, JsObject, JsResult, JsString, JsValue,
    NativeFunction,
};
use boa_gc::{Finalize, Trace};
use common::BridgeError;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::sync::{Arc, Weak};
use telephony::{
    MediaEvent, MediaObserver, PropertyValue, SessionEvent, SessionObserver, VideoTarget,
};

use crate::bridge::{CallApi, CallOutput, CallRequest, Operation};

/// Which observer interface a script handler was registered for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObserverKind {
    Session,
    Media,
}

impl ObserverKind {
    /// Method looked up on observer objects that are not functions.
    pub fn method(&self) -> &'static str {
        match self {
            ObserverKind::Session => "onSessionStateChange",
            ObserverKind::Media => "onMediaStateChange",
        }
    }
}

/// Engine event waiting to be delivered to script.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObserverEvent {
    pub observer: u64,
    pub kind: ObserverKind,
    pub state: String,
    pub detail: String,
}

type EventSink = Mutex<VecDeque<ObserverEvent>>;

/// Ids of observers the engine and session no longer hold.
type ReleasedHandlers = Mutex<Vec<u64>>;

/// Engine-facing half of a script observer. Events are queued for the page
/// and dropped once the page is gone. Dropping it releases the script
/// handler.
struct ScriptObserver {
    id: u64,
    kind: ObserverKind,
    sink: Weak<EventSink>,
    released: Weak<ReleasedHandlers>,
}

impl ScriptObserver {
    fn push(&self, state: &str, detail: &str) {
        if let Some(sink) = self.sink.upgrade() {
            sink.lock().push_back(ObserverEvent {
                observer: self.id,
                kind: self.kind,
                state: state.to_string(),
                detail: detail.to_string(),
            });
        }
    }
}

impl Drop for ScriptObserver {
    fn drop(&mut self) {
        if let Some(released) = self.released.upgrade() {
            released.lock().push(self.id);
        }
    }
}

impl SessionObserver for ScriptObserver {
    fn on_session_event(&self, event: &SessionEvent) {
        self.push(event.state(), event.detail());
    }
}

impl MediaObserver for ScriptObserver {
    fn on_media_event(&self, event: &MediaEvent) {
        self.push(event.state(), event.detail());
    }
}

/// A decoded call waiting to run, with the resolvers of its promise.
pub(crate) struct QueuedCall {
    pub(crate) request: CallRequest,
    pub(crate) resolve: JsFunction,
    pub(crate) reject: JsFunction,
}

/// State shared between a page context and its native functions.
pub(crate) struct PageState {
    api: Arc<CallApi>,
    queue: RefCell<VecDeque<QueuedCall>>,
    handlers: RefCell<HashMap<u64, JsValue>>,
    next_handler: Cell<u64>,
    events: Arc<EventSink>,
    released: Arc<ReleasedHandlers>,
    torn_down: Cell<bool>,
}

impl PageState {
    pub(crate) fn new(api: Arc<CallApi>) -> Self {
        Self {
            api,
            queue: RefCell::new(VecDeque::new()),
            handlers: RefCell::new(HashMap::new()),
            next_handler: Cell::new(1),
            events: Arc::new(Mutex::new(VecDeque::new())),
            released: Arc::new(Mutex::new(Vec::new())),
            torn_down: Cell::new(false),
        }
    }

    pub(crate) fn api(&self) -> &Arc<CallApi> {
        &self.api
    }

    pub(crate) fn take_queued(&self) -> Vec<QueuedCall> {
        self.queue.borrow_mut().drain(..).collect()
    }

    pub(crate) fn take_events(&self) -> Vec<ObserverEvent> {
        self.events.lock().drain(..).collect()
    }

    pub(crate) fn handler(&self, id: u64) -> Option<JsValue> {
        self.handlers.borrow().get(&id).cloned()
    }

    /// Forget handlers whose observer is gone. Run after queued events
    /// have been delivered so none of them is lost.
    pub(crate) fn prune_released(&self) {
        let released: Vec<u64> = self.released.lock().drain(..).collect();
        if released.is_empty() {
            return;
        }
        let mut handlers = self.handlers.borrow_mut();
        for id in released {
            handlers.remove(&id);
        }
    }

    pub(crate) fn has_work(&self) -> bool {
        !self.queue.borrow().is_empty() || !self.events.lock().is_empty()
    }

    pub(crate) fn queued_len(&self) -> usize {
        self.queue.borrow().len()
    }

    pub(crate) fn handler_count(&self) -> usize {
        self.handlers.borrow().len()
    }

    pub(crate) fn is_torn_down(&self) -> bool {
        self.torn_down.get()
    }

    /// Revoke the capability and forget every queued call and handler.
    pub(crate) fn teardown(&self) {
        self.torn_down.set(true);
        self.api.revoke();
        self.queue.borrow_mut().clear();
        self.handlers.borrow_mut().clear();
        self.events.lock().clear();
        self.released.lock().clear();
    }

    /// Register a script observer. `undefined` and `null` mean no observer.
    fn observer(&self, value: &JsValue, kind: ObserverKind) -> JsResult<Option<Arc<ScriptObserver>>> {
        if value.is_null_or_undefined() {
            return Ok(None);
        }
        if value.as_object().is_none() {
            return Err(JsNativeError::typ()
                .with_message("observer must be a function or an object")
                .into());
        }

        let id = self.next_handler.get();
        self.next_handler.set(id + 1);
        self.handlers.borrow_mut().insert(id, value.clone());

        Ok(Some(Arc::new(ScriptObserver {
            id,
            kind,
            sink: Arc::downgrade(&self.events),
            released: Arc::downgrade(&self.released),
        })))
    }

    fn session_observer(&self, value: &JsValue) -> JsResult<Option<Arc<dyn SessionObserver>>> {
        Ok(self
            .observer(value, ObserverKind::Session)?
            .map(|observer| observer as Arc<dyn SessionObserver>))
    }

    fn media_observer(&self, value: &JsValue) -> JsResult<Option<Arc<dyn MediaObserver>>> {
        Ok(self
            .observer(value, ObserverKind::Media)?
            .map(|observer| observer as Arc<dyn MediaObserver>))
    }
}

#[derive(Trace, Finalize)]
struct OperationBinding {
    #[unsafe_ignore_trace]
    operation: Operation,
    #[unsafe_ignore_trace]
    page: Rc<PageState>,
}

/// Install `navigator.service.call` with one function per operation.
pub(crate) fn install_call_api(context: &mut Context, page: &Rc<PageState>) -> JsResult<()> {
    let mut call = ObjectInitializer::new(context);
    for operation in Operation::ALL {
        call.function(
            NativeFunction::from_copy_closure_with_captures(
                invoke_operation,
                OperationBinding {
                    operation,
                    page: page.clone(),
                },
            ),
            JsString::from(operation.name()),
            operation.arity(),
        );
    }
    let call = call.build();

    let service = ObjectInitializer::new(context)
        .property(js_string!("call"), call, Attribute::READONLY)
        .build();
    let navigator = ObjectInitializer::new(context)
        .property(js_string!("service"), service, Attribute::READONLY)
        .build();

    context.register_global_property(js_string!("navigator"), navigator, Attribute::READONLY)
}

fn invoke_operation(
    _this: &JsValue,
    args: &[JsValue],
    binding: &OperationBinding,
    context: &mut Context,
) -> JsResult<JsValue> {
    let page = &binding.page;
    let (promise, resolvers) = JsPromise::new_pending(context);

    if page.is_torn_down() || page.api.is_revoked() {
        let error = script_error(&BridgeError::Revoked, context);
        resolvers.reject.call(&JsValue::undefined(), &[error], context)?;
        return Ok(promise.into());
    }

    match decode_request(binding.operation, args, page, context) {
        Ok(request) => {
            tracing::trace!("Queued {} for {}", binding.operation, page.api.page_url());
            page.queue.borrow_mut().push_back(QueuedCall {
                request,
                resolve: resolvers.resolve,
                reject: resolvers.reject,
            });
        }
        Err(err) => {
            let error = err.to_opaque(context);
            resolvers.reject.call(&JsValue::undefined(), &[error], context)?;
        }
    }

    Ok(promise.into())
}

fn decode_request(
    operation: Operation,
    args: &[JsValue],
    page: &PageState,
    context: &mut Context,
) -> JsResult<CallRequest> {
    let request = match operation {
        Operation::RegisterUser => CallRequest::RegisterUser {
            device_id: string_arg(args, 0, context)?,
            user: string_arg(args, 1, context)?,
            credential: string_arg(args, 2, context)?,
            proxy: string_arg(args, 3, context)?,
            observer: page.session_observer(args.get_or_undefined(4))?,
        },
        Operation::StartP2PMode => CallRequest::StartP2PMode {
            user: string_arg(args, 0, context)?,
            observer: page.session_observer(args.get_or_undefined(1))?,
        },
        Operation::PlaceCall => CallRequest::PlaceCall {
            directory_number: string_arg(args, 0, context)?,
            target: target_arg(args.get_or_undefined(1), page, context)?,
            observer: page.media_observer(args.get_or_undefined(2))?,
        },
        Operation::PlaceP2PCall => CallRequest::PlaceP2PCall {
            directory_number: string_arg(args, 0, context)?,
            ip_address: string_arg(args, 1, context)?,
            target: target_arg(args.get_or_undefined(2), page, context)?,
            observer: page.media_observer(args.get_or_undefined(3))?,
        },
        Operation::HangupCall => CallRequest::HangupCall,
        Operation::UnregisterUser => CallRequest::UnregisterUser,
        Operation::AnswerCall => CallRequest::AnswerCall {
            target: target_arg(args.get_or_undefined(0), page, context)?,
            observer: page.media_observer(args.get_or_undefined(1))?,
        },
        Operation::SetProperty => {
            CallRequest::SetProperty(property_map(args.get_or_undefined(0), context)?)
        }
        Operation::GetProperty => CallRequest::GetProperty(string_arg(args, 0, context)?),
        Operation::SendDigits => CallRequest::SendDigits(string_arg(args, 0, context)?),
        Operation::FetchImage => CallRequest::FetchImage {
            is_file: args.get_or_undefined(0).to_boolean(),
        },
    };
    Ok(request)
}

fn string_arg(args: &[JsValue], index: usize, context: &mut Context) -> JsResult<String> {
    Ok(args
        .get_or_undefined(index)
        .to_string(context)?
        .to_std_string_escaped())
}

/// Rendering context: a label string, or an object with `label`/`id`,
/// `width` and `height`.
fn target_arg(value: &JsValue, page: &PageState, context: &mut Context) -> JsResult<VideoTarget> {
    let mut target = page.api.default_target();

    if let Some(label) = value.as_string() {
        target.label = label.to_std_string_escaped();
        return Ok(target);
    }
    let Some(object) = value.as_object() else {
        return Ok(target);
    };

    for key in ["label", "id"] {
        let label = object.get(JsString::from(key), context)?;
        if !label.is_null_or_undefined() {
            target.label = label.to_string(context)?.to_std_string_escaped();
            break;
        }
    }

    let width = object.get(js_string!("width"), context)?;
    if !width.is_null_or_undefined() {
        target.width = width.to_u32(context)?;
    }
    let height = object.get(js_string!("height"), context)?;
    if !height.is_null_or_undefined() {
        target.height = height.to_u32(context)?;
    }

    Ok(target)
}

/// Flatten a script object into a JSON map of primitive values.
/// Nested objects become empty objects; only their truthiness matters.
fn property_map(value: &JsValue, context: &mut Context) -> JsResult<Map<String, Value>> {
    let Some(object) = value.as_object() else {
        return Err(JsNativeError::typ()
            .with_message("setProperty expects an object")
            .into());
    };

    let mut map = Map::new();
    for key in object.own_property_keys(context)? {
        let entry = object.get(key.clone(), context)?;
        map.insert(key.to_string(), primitive_json(&entry));
    }
    Ok(map)
}

fn primitive_json(value: &JsValue) -> Value {
    if let Some(b) = value.as_boolean() {
        return Value::Bool(b);
    }
    if let Some(s) = value.as_string() {
        return Value::String(s.to_std_string_escaped());
    }
    if let Some(n) = value.as_number() {
        if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
            return Value::from(n as i64);
        }
        return serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null);
    }
    if value.is_object() {
        return Value::Object(Map::new());
    }
    Value::Null
}

/// Script value a successful call resolves to.
pub(crate) fn output_value(output: CallOutput) -> JsValue {
    match output {
        CallOutput::Done => JsValue::undefined(),
        CallOutput::Property(None) => JsValue::undefined(),
        CallOutput::Property(Some(PropertyValue::Text(text))) => {
            JsValue::from(JsString::from(text.as_str()))
        }
        CallOutput::Property(Some(PropertyValue::Bool(b))) => JsValue::from(b),
        CallOutput::Image(image) => {
            let url = format!(
                "data:{};base64,{}",
                image.mime_type,
                base64::engine::general_purpose::STANDARD.encode(&image.data)
            );
            JsValue::from(JsString::from(url.as_str()))
        }
    }
}

/// `Error` object carrying the bridge error text and its kind as `code`.
pub(crate) fn script_error(err: &BridgeError, context: &mut Context) -> JsValue {
    let error = JsError::from(JsNativeError::error().with_message(err.to_string())).to_opaque(context);
    if let Some(object) = error.as_object() {
        set_code(object, err.code(), context);
    }
    error
}

fn set_code(object: &JsObject, code: &str, context: &mut Context) {
    if let Err(e) = object.set(js_string!("code"), JsString::from(code), false, context) {
        tracing::debug!("Could not set error code: {}", e);
    }
}
