//! `console` for page script, forwarded to `tracing`.

use boa_engine::{
    js_string, object::ObjectInitializer, property::Attribute, Context, JsResult, JsString,
    JsValue, NativeFunction,
};
use boa_gc::{Finalize, Trace};
use std::fmt::Write;
use std::rc::Rc;

/// Console log level.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Log,
    Info,
    Warn,
    Error,
    Debug,
}

#[derive(Trace, Finalize)]
struct ConsoleBinding {
    #[unsafe_ignore_trace]
    level: LogLevel,
    #[unsafe_ignore_trace]
    page: Rc<str>,
}

/// Register `console` on the global object. Output is tagged with `page`.
pub fn register_console(context: &mut Context, page: &str) -> JsResult<()> {
    let page: Rc<str> = Rc::from(page);
    let levels = [
        (LogLevel::Log, "log"),
        (LogLevel::Info, "info"),
        (LogLevel::Warn, "warn"),
        (LogLevel::Error, "error"),
        (LogLevel::Debug, "debug"),
    ];

    let mut console = ObjectInitializer::new(context);
    for (level, name) in levels {
        console.function(
            NativeFunction::from_copy_closure_with_captures(
                console_write,
                ConsoleBinding {
                    level,
                    page: page.clone(),
                },
            ),
            JsString::from(name),
            0,
        );
    }
    let console = console.build();

    context.register_global_property(js_string!("console"), console, Attribute::all())
}

fn console_write(
    _: &JsValue,
    args: &[JsValue],
    binding: &ConsoleBinding,
    _context: &mut Context,
) -> JsResult<JsValue> {
    let message = format_args(args);
    let page = &*binding.page;
    match binding.level {
        LogLevel::Log | LogLevel::Info => tracing::info!(target: "page", page, "{}", message),
        LogLevel::Warn => tracing::warn!(target: "page", page, "{}", message),
        LogLevel::Error => tracing::error!(target: "page", page, "{}", message),
        LogLevel::Debug => tracing::debug!(target: "page", page, "{}", message),
    }
    Ok(JsValue::undefined())
}

/// Format arguments for console output.
fn format_args(args: &[JsValue]) -> String {
    let mut output = String::new();

    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            output.push(' ');
        }
        let _ = write!(output, "{}", format_value(arg));
    }

    output
}

fn format_value(value: &JsValue) -> String {
    match value.as_string() {
        Some(s) => s.to_std_string_escaped(),
        None => value.display().to_string(),
    }
}
