//! Per-page script context.

use boa_engine::{object::builtins::JsFunction, Context, JsError, JsString, JsValue, Source};
use common::{BridgeError, BridgeResult};
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use url::Url;

use crate::bindings::{install_call_api, output_value, script_error, ObserverEvent, PageState};
use crate::bridge::{BridgeServices, CallApi, CallOutput};
use crate::console::register_console;
use callgate_security::Origin;

/// Isolated script context bound to one page document.
///
/// The page sees `navigator.service.call` and `console`, nothing else of the
/// host. Calls are queued by script and run by [`PageContext::run_until_idle`].
pub struct PageContext {
    id: u64,
    url: Url,
    context: Context,
    page: Rc<PageState>,
    /// Resolvers of promises whose call is running.
    pending: HashMap<u64, (JsFunction, JsFunction)>,
    next_call: u64,
}

impl PageContext {
    /// Create a context for the page at `url` and inject the call API.
    pub fn new(id: u64, url: Url, services: Arc<BridgeServices>) -> BridgeResult<Self> {
        let api = Arc::new(CallApi::new(&url, services));
        let page = Rc::new(PageState::new(api));
        let mut context = Context::default();

        install_call_api(&mut context, &page)
            .map_err(|e| BridgeError::script(format_js_error(&e, &mut context)))?;
        register_console(&mut context, url.as_str())
            .map_err(|e| BridgeError::script(format_js_error(&e, &mut context)))?;

        tracing::debug!("Created page context {} for {}", id, url);

        Ok(Self {
            id,
            url,
            context,
            page,
            pending: HashMap::new(),
            next_call: 1,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn origin(&self) -> Option<&Origin> {
        self.page.api().origin()
    }

    /// The capability bound into this page.
    pub fn api(&self) -> &Arc<CallApi> {
        self.page.api()
    }

    /// Calls queued by script or still running.
    pub fn pending_calls(&self) -> usize {
        self.page.queued_len() + self.pending.len()
    }

    /// Script observers registered through the call API.
    pub fn observer_count(&self) -> usize {
        self.page.handler_count()
    }

    pub fn is_torn_down(&self) -> bool {
        self.page.is_torn_down()
    }

    /// Evaluate a script in the page.
    pub fn eval(&mut self, source: &str) -> BridgeResult<JsValue> {
        if self.is_torn_down() {
            return Err(BridgeError::Revoked);
        }
        self.context
            .eval(Source::from_bytes(source.as_bytes()))
            .map_err(|e| BridgeError::script(format_js_error(&e, &mut self.context)))
    }

    /// Evaluate `expression` and read it back through `JSON.stringify`.
    pub fn eval_json(&mut self, expression: &str) -> BridgeResult<serde_json::Value> {
        let value = self.eval(&format!("JSON.stringify({})", expression))?;
        match value.as_string() {
            Some(json) => Ok(serde_json::from_str(&json.to_std_string_escaped())?),
            None => Ok(serde_json::Value::Null),
        }
    }

    /// Run queued calls, deliver observer events and script jobs until
    /// nothing is left to do.
    pub async fn run_until_idle(&mut self) -> BridgeResult<()> {
        let mut in_flight = FuturesUnordered::new();

        loop {
            if self.is_torn_down() {
                return Err(BridgeError::Revoked);
            }

            // Events raised during a call are seen before its promise reactions.
            self.dispatch_events();
            self.context.run_jobs();

            for call in self.page.take_queued() {
                let id = self.next_call;
                self.next_call += 1;
                tracing::debug!(
                    "Page {} starting {} (call {})",
                    self.id,
                    call.request.operation(),
                    id
                );
                self.pending.insert(id, (call.resolve, call.reject));

                let api = self.page.api().clone();
                let request = call.request;
                in_flight.push(async move { (id, api.invoke(request).await) });
            }

            match in_flight.next().await {
                Some((id, result)) => self.settle(id, result),
                None if self.page.has_work() => continue,
                None => break,
            }
        }

        Ok(())
    }

    /// Release the capability and everything script handed to it.
    pub fn teardown(&mut self) {
        if self.page.is_torn_down() {
            return;
        }
        self.page.teardown();
        self.pending.clear();
        tracing::debug!("Tore down page context {} for {}", self.id, self.url);
    }

    fn settle(&mut self, id: u64, result: BridgeResult<CallOutput>) {
        let Some((resolve, reject)) = self.pending.remove(&id) else {
            return;
        };

        let settled = match result {
            Ok(output) => {
                let value = output_value(output);
                resolve.call(&JsValue::undefined(), &[value], &mut self.context)
            }
            Err(err) => {
                tracing::debug!("Page {} call {} failed: {}", self.id, id, err);
                let error = script_error(&err, &mut self.context);
                reject.call(&JsValue::undefined(), &[error], &mut self.context)
            }
        };

        if let Err(e) = settled {
            tracing::warn!("Failed to settle call {} on page {}: {}", id, self.id, e);
        }
    }

    fn dispatch_events(&mut self) {
        for event in self.page.take_events() {
            let Some(handler) = self.page.handler(event.observer) else {
                continue;
            };
            if let Err(e) = self.deliver(&handler, &event) {
                tracing::warn!(
                    "Observer on {} threw for {}: {}",
                    self.url,
                    event.state,
                    format_js_error(&e, &mut self.context)
                );
            }
        }
        self.page.prune_released();
    }

    fn deliver(&mut self, handler: &JsValue, event: &ObserverEvent) -> Result<(), JsError> {
        let args = [
            JsValue::from(JsString::from(event.state.as_str())),
            JsValue::from(JsString::from(event.detail.as_str())),
        ];

        if let Some(function) = handler.as_callable() {
            function.call(&JsValue::undefined(), &args, &mut self.context)?;
            return Ok(());
        }

        if let Some(object) = handler.as_object() {
            let method = object.get(JsString::from(event.kind.method()), &mut self.context)?;
            if let Some(function) = method.as_callable() {
                function.call(handler, &args, &mut self.context)?;
            }
        }
        Ok(())
    }
}

impl Drop for PageContext {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Format a JavaScript error for display.
fn format_js_error(error: &JsError, context: &mut Context) -> String {
    error
        .try_native(context)
        .map(|e| e.message().to_string())
        .unwrap_or_else(|_| error.to_string())
}
