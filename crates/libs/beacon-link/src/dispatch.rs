//! Request routing.
//!
//! A [`Dispatcher`] owns the device state reachable over the link (update
//! session, settings) and a registry of named handlers. [`Dispatcher::handle`]
//! is the full request path: it always yields an encoded reply, turning every
//! failure into an `error` field.

use std::collections::BTreeMap;

use crate::codec::{self, Arguments, Reply};
use crate::config::LinkConfig;
use crate::display::{self, DisplaySource};
use crate::error::{DispatchError, HandlerError};
use crate::ota::UpdateSession;
use crate::settings::DeviceSettings;
use crate::storage::FlashStorage;

pub mod functions {
    pub const OTA_BEGIN: &str = "ota_begin";
    pub const OTA_CHUNK: &str = "ota_chunk";
    pub const OTA_END: &str = "ota_end";
    pub const GET_SETTINGS: &str = "get_settings";
    pub const UPDATE_SETTINGS: &str = "update_settings";
    pub const DISPLAY_CONTENTS: &str = "display_contents";
}

pub const INVALID_REQUEST: &str = "invalid request";
pub const UNAUTHENTICATED: &str = "unauthenticated";

/// Routes a function name to its handler.
pub trait Invoke {
    fn invoke(&mut self, function_name: &str, args: &Arguments) -> Result<Reply, DispatchError>;
}

/// State handlers operate on.
pub struct DeviceContext<S: FlashStorage> {
    pub session: UpdateSession<S>,
    pub settings: DeviceSettings,
}

pub type Handler<S> =
    Box<dyn Fn(&mut DeviceContext<S>, &Arguments) -> Result<Reply, HandlerError> + Send>;

pub struct Dispatcher<S: FlashStorage> {
    context: DeviceContext<S>,
    handlers: BTreeMap<String, Handler<S>>,
    max_request_bytes: usize,
    max_response_bytes: usize,
}

impl<S: FlashStorage> Dispatcher<S> {
    /// Dispatcher with the update and settings functions registered.
    pub fn new(storage: S, config: &LinkConfig) -> Self {
        let mut dispatcher = Self {
            context: DeviceContext {
                session: UpdateSession::new(storage),
                settings: DeviceSettings::new(config.device_name()),
            },
            handlers: BTreeMap::new(),
            max_request_bytes: config.max_request_bytes,
            max_response_bytes: config.max_response_bytes,
        };
        dispatcher.register(functions::OTA_BEGIN, |ctx, args| ctx.session.rpc_begin(args));
        dispatcher.register(functions::OTA_CHUNK, |ctx, args| ctx.session.rpc_chunk(args));
        dispatcher.register(functions::OTA_END, |ctx, args| ctx.session.rpc_end(args));
        dispatcher.register(functions::GET_SETTINGS, |ctx, args| ctx.settings.rpc_get(args));
        dispatcher
            .register(functions::UPDATE_SETTINGS, |ctx, args| ctx.settings.rpc_update(args));
        dispatcher
    }

    /// Add or replace a function.
    pub fn register<F>(&mut self, function_name: impl Into<String>, handler: F)
    where
        F: Fn(&mut DeviceContext<S>, &Arguments) -> Result<Reply, HandlerError> + Send + 'static,
    {
        self.handlers.insert(function_name.into(), Box::new(handler));
    }

    /// Expose `display_contents` backed by `source`.
    pub fn attach_display(&mut self, source: impl DisplaySource + 'static) {
        let source: Box<dyn DisplaySource> = Box::new(source);
        self.register(functions::DISPLAY_CONTENTS, move |_ctx, args| {
            display::rpc_display_contents(source.as_ref(), args)
        });
    }

    pub fn functions(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn context(&self) -> &DeviceContext<S> {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut DeviceContext<S> {
        &mut self.context
    }

    pub fn session(&self) -> &UpdateSession<S> {
        &self.context.session
    }

    pub fn settings(&self) -> &DeviceSettings {
        &self.context.settings
    }

    /// Drop any in-flight update, releasing its write handle.
    pub fn abort_update(&mut self) -> bool {
        self.context.session.abort()
    }

    /// Decode, invoke and encode one request buffer.
    pub fn handle(&mut self, buffer: &[u8]) -> Vec<u8> {
        let reply = match codec::decode_request(buffer, self.max_request_bytes) {
            Ok(request) => {
                log::debug!(
                    "rpc: call {} args={}",
                    request.function_name,
                    request.arguments.len()
                );
                self.invoke(&request.function_name, &request.arguments).unwrap_or_else(|err| {
                    log::warn!("rpc: {} ({})", err, request.function_name);
                    Reply::error(err.to_string())
                })
            }
            Err(err) => {
                log::warn!("rpc: rejecting request: {}", err);
                Reply::error(INVALID_REQUEST)
            }
        };
        self.encode_bounded(&reply)
    }

    /// Encoded `error` reply, for rejections that never reach a handler.
    pub fn error_response(&self, message: &str) -> Vec<u8> {
        self.encode_bounded(&Reply::error(message))
    }

    fn encode_bounded(&self, reply: &Reply) -> Vec<u8> {
        match self.encode_checked(reply) {
            Ok(bytes) => bytes,
            Err(err) => {
                log::warn!("rpc: {}", err);
                encode_fallback(&Reply::error(err.to_string()))
            }
        }
    }

    fn encode_checked(&self, reply: &Reply) -> Result<Vec<u8>, DispatchError> {
        let bytes = codec::encode_reply(reply)?;
        if bytes.len() > self.max_response_bytes {
            return Err(DispatchError::ResponseTooLarge {
                size: bytes.len(),
                max: self.max_response_bytes,
            });
        }
        Ok(bytes)
    }
}

fn encode_fallback(reply: &Reply) -> Vec<u8> {
    codec::encode_reply(reply).unwrap_or_else(|err| {
        log::error!("rpc: cannot encode error reply: {}", err);
        Vec::new()
    })
}

impl<S: FlashStorage> Invoke for Dispatcher<S> {
    /// Handler failures come back as `Ok` error replies; only an unknown name
    /// is an `Err`.
    fn invoke(&mut self, function_name: &str, args: &Arguments) -> Result<Reply, DispatchError> {
        let handler = self
            .handlers
            .get(function_name)
            .ok_or_else(|| DispatchError::UnknownFunction(function_name.to_string()))?;
        match handler(&mut self.context, args) {
            Ok(reply) => Ok(reply),
            Err(err) => {
                if err.aborts_session() {
                    log::warn!("rpc: {} aborted the update: {:?}", function_name, err);
                } else {
                    log::debug!("rpc: {} rejected: {:?}", function_name, err);
                }
                Ok(match err.code() {
                    Some(code) => Reply::error_with_code(err.to_string(), code),
                    None => Reply::error(err.to_string()),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_reply, request};
    use crate::ota::SessionState;
    use crate::storage::MemoryFlash;
    use rmpv::Value;

    fn dispatcher() -> Dispatcher<MemoryFlash> {
        Dispatcher::new(MemoryFlash::new(2, 1024), &LinkConfig::default())
    }

    fn call(dispatcher: &mut Dispatcher<MemoryFlash>, name: &str, args: Vec<(&str, Value)>) -> Reply {
        let bytes = request(name, args).expect("encode");
        decode_reply(&dispatcher.handle(&bytes)).expect("reply")
    }

    #[test]
    fn builtins_are_registered() {
        let dispatcher = dispatcher();
        let names: Vec<&str> = dispatcher.functions().collect();
        assert_eq!(
            names,
            vec!["get_settings", "ota_begin", "ota_chunk", "ota_end", "update_settings"]
        );
    }

    #[test]
    fn unknown_function_still_replies() {
        let reply = call(&mut dispatcher(), "reboot_now", Vec::new());
        assert_eq!(reply.error_message(), Some("unknown function"));
    }

    #[test]
    fn undecodable_buffer_gets_invalid_request_reply() {
        let mut dispatcher = dispatcher();
        let reply = decode_reply(&dispatcher.handle(&[0x81, 0xa4])).expect("reply");
        assert_eq!(reply.error_message(), Some(INVALID_REQUEST));

        let no_name = rmp_serde::to_vec(&Value::Map(vec![(Value::from("size"), Value::from(1))]))
            .expect("encode");
        let reply = decode_reply(&dispatcher.handle(&no_name)).expect("reply");
        assert_eq!(reply.error_message(), Some(INVALID_REQUEST));
        assert_eq!(dispatcher.session().state(), SessionState::Idle);
    }

    #[test]
    fn handler_errors_become_error_replies() {
        let mut dispatcher = dispatcher();
        let reply = call(&mut dispatcher, "ota_end", Vec::new());
        assert_eq!(reply.error_message(), Some("OTA not active"));
        assert_eq!(reply.code(), None);
    }

    #[test]
    fn storage_faults_carry_code() {
        let mut dispatcher = Dispatcher::new(MemoryFlash::new(2, 8), &LinkConfig::default());
        let reply = call(&mut dispatcher, "ota_begin", vec![("size", Value::from(64))]);
        assert_eq!(reply.error_message(), Some("begin failed"));
        assert_eq!(reply.code(), Some(i64::from(crate::storage::codes::INVALID_SIZE)));
    }

    #[test]
    fn oversized_reply_is_replaced() {
        let config = LinkConfig { max_response_bytes: 64, ..LinkConfig::default() };
        let mut dispatcher = Dispatcher::new(MemoryFlash::new(2, 64), &config);
        dispatcher.register("dump", |_ctx, _args| Ok(Reply::new().with("blob", "x".repeat(200))));
        let reply = call(&mut dispatcher, "dump", Vec::new());
        assert_eq!(reply.error_message(), Some("response too large"));
    }

    #[test]
    fn registered_function_sees_device_context() {
        let mut dispatcher = dispatcher();
        dispatcher.register("whoami", |ctx, _args| {
            Ok(Reply::new().with("name", ctx.settings.device_name.clone()))
        });
        let reply = call(&mut dispatcher, "whoami", Vec::new());
        assert_eq!(reply.str("name"), Some("Beacon"));
    }

    #[test]
    fn invoke_reports_unknown_function_as_error() {
        let mut dispatcher = dispatcher();
        let err = dispatcher.invoke("nope", &Arguments::default()).expect_err("unknown");
        assert!(matches!(err, DispatchError::UnknownFunction(name) if name == "nope"));
    }

    #[test]
    fn display_function_appears_once_attached() {
        let mut dispatcher = dispatcher();
        assert!(!dispatcher.functions().any(|name| name == functions::DISPLAY_CONTENTS));
        dispatcher.attach_display(crate::display::Framebuffer::new(16, 8));
        let reply = call(&mut dispatcher, functions::DISPLAY_CONTENTS, Vec::new());
        assert_eq!(reply.u64("width"), Some(16));
    }
}
