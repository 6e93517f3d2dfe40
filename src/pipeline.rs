use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use crate::client::Client;
use crate::error::Error;
use crate::request::Request;
use crate::response::Response;
use crate::signal::CancelToken;

/// Failure raised by a plugin step. Wrapped into a `Plugin`-kind error
/// with the step's name attached.
#[derive(Debug)]
pub struct PluginFault {
    message: String,
    cause: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl PluginFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(
        message: impl Into<String>,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            cause: Some(Arc::new(cause)),
        }
    }
}

impl From<String> for PluginFault {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for PluginFault {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// The single object plugin steps receive. Mutations to `req` and `meta`
/// persist across retry attempts of the same call; `res` and `error` are
/// reset per attempt.
pub struct CallContext {
    pub req: Request,
    pub res: Option<Response>,
    pub error: Option<Error>,
    /// 1-based attempt counter.
    pub attempt: usize,
    pub max_attempts: usize,
    pub meta: BTreeMap<String, Value>,
    cancel: CancelToken,
}

impl CallContext {
    pub(crate) fn new(req: Request, max_attempts: usize, cancel: CancelToken) -> Self {
        Self {
            req,
            res: None,
            error: None,
            attempt: 1,
            max_attempts,
            meta: BTreeMap::new(),
            cancel,
        }
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel.is_fired()
    }

    /// Turn a failed attempt into a success: install the response and
    /// clear the error. The pipeline stops the error chain here.
    pub fn recover(&mut self, response: Response) {
        self.res = Some(response);
        self.error = None;
    }
}

/// An ordered pipeline step. Register with `Client::use_plugin`; hooks
/// default to no-ops so plugins implement only what they need.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// Runs once at registration. May stash capabilities on the client
    /// through its extension registry.
    fn on_attach(&self, _client: &Client) {}

    /// Runs left-to-right before every attempt's transport leg, retries
    /// included, so credentials and nonces can be refreshed.
    fn on_request(&self, _ctx: &mut CallContext) -> Result<(), PluginFault> {
        Ok(())
    }

    /// Runs right-to-left after a successful transport leg.
    fn on_response(&self, _ctx: &mut CallContext) -> Result<(), PluginFault> {
        Ok(())
    }

    /// Runs right-to-left after a failed attempt. May rewrite the error
    /// or recover via `CallContext::recover`.
    fn on_response_error(&self, _ctx: &mut CallContext) -> Result<(), PluginFault> {
        Ok(())
    }
}

#[derive(Clone, Default)]
pub(crate) struct PluginChain {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginChain {
    pub(crate) fn new(plugins: Vec<Arc<dyn Plugin>>) -> Self {
        Self { plugins }
    }

    fn plugin_error(fault: PluginFault, plugin: &str, ctx: &CallContext) -> Error {
        Error::Plugin {
            plugin: plugin.to_owned(),
            message: fault.message,
            request: ctx.req.snapshot(),
            response: ctx.res.as_ref().map(Response::snapshot_of),
            attempt: ctx.attempt,
            cause: fault.cause,
        }
    }

    /// onRequest steps in registration order. The first fault aborts the
    /// attempt; later steps do not run.
    pub(crate) fn run_request(&self, ctx: &mut CallContext) -> Result<(), Error> {
        for plugin in &self.plugins {
            if let Err(fault) = plugin.on_request(ctx) {
                return Err(Self::plugin_error(fault, plugin.name(), ctx));
            }
        }
        Ok(())
    }

    /// onResponse steps in reverse registration order. A fault converts
    /// the outcome into an error, routed into the error chain by the
    /// caller.
    pub(crate) fn run_response(&self, ctx: &mut CallContext) {
        for plugin in self.plugins.iter().rev() {
            if let Err(fault) = plugin.on_response(ctx) {
                let error = Self::plugin_error(fault, plugin.name(), ctx);
                ctx.res = None;
                ctx.error = Some(error);
                return;
            }
        }
    }

    /// onResponseError steps in reverse registration order. A fault
    /// replaces `ctx.error`; a recovery (res set, error cleared) stops
    /// the chain.
    pub(crate) fn run_response_error(&self, ctx: &mut CallContext) {
        for plugin in self.plugins.iter().rev() {
            if let Err(fault) = plugin.on_response_error(ctx) {
                let error = Self::plugin_error(fault, plugin.name(), ctx);
                ctx.error = Some(error);
            }
            if ctx.error.is_none() && ctx.res.is_some() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;
    use http::Method;
    use serde_json::json;

    use super::{CallContext, Plugin, PluginChain, PluginFault};
    use crate::error::ErrorKind;
    use crate::request::Request;
    use crate::response::Response;
    use crate::signal::CancelToken;

    struct Recorder {
        name: &'static str,
    }

    impl Plugin for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        fn on_request(&self, ctx: &mut CallContext) -> Result<(), PluginFault> {
            record(ctx, "request", self.name);
            Ok(())
        }

        fn on_response(&self, ctx: &mut CallContext) -> Result<(), PluginFault> {
            record(ctx, "response", self.name);
            Ok(())
        }

        fn on_response_error(&self, ctx: &mut CallContext) -> Result<(), PluginFault> {
            record(ctx, "error", self.name);
            Ok(())
        }
    }

    fn record(ctx: &mut CallContext, phase: &str, name: &str) {
        let entry = ctx
            .meta
            .entry(phase.to_owned())
            .or_insert_with(|| json!([]));
        entry
            .as_array_mut()
            .expect("recorder meta entry should stay an array")
            .push(json!(name));
    }

    fn context() -> CallContext {
        CallContext::new(
            Request::new(Method::GET, "https://api.test/a"),
            1,
            CancelToken::new(),
        )
    }

    fn chain() -> PluginChain {
        PluginChain::new(vec![
            Arc::new(Recorder { name: "first" }),
            Arc::new(Recorder { name: "second" }),
        ])
    }

    #[test]
    fn request_steps_run_left_to_right() {
        let mut ctx = context();
        chain()
            .run_request(&mut ctx)
            .expect("recorders never fault");
        assert_eq!(ctx.meta["request"], json!(["first", "second"]));
    }

    #[test]
    fn response_steps_run_right_to_left() {
        let mut ctx = context();
        chain().run_response(&mut ctx);
        assert_eq!(ctx.meta["response"], json!(["second", "first"]));
    }

    #[test]
    fn error_steps_run_right_to_left() {
        let mut ctx = context();
        chain().run_response_error(&mut ctx);
        assert_eq!(ctx.meta["error"], json!(["second", "first"]));
    }

    struct Failing;

    impl Plugin for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn on_request(&self, _ctx: &mut CallContext) -> Result<(), PluginFault> {
            Err("token refresh failed".into())
        }
    }

    #[test]
    fn request_fault_short_circuits_later_steps() {
        let chain = PluginChain::new(vec![
            Arc::new(Failing),
            Arc::new(Recorder { name: "after" }),
        ]);
        let mut ctx = context();
        let error = chain
            .run_request(&mut ctx)
            .expect_err("failing plugin should abort the chain");
        assert_eq!(error.kind(), ErrorKind::Plugin);
        assert!(!ctx.meta.contains_key("request"));
    }

    struct Recovering;

    impl Plugin for Recovering {
        fn name(&self) -> &str {
            "recovering"
        }

        fn on_response_error(&self, ctx: &mut CallContext) -> Result<(), PluginFault> {
            ctx.recover(Response::synthetic(200, Bytes::from_static(b"ok")));
            Ok(())
        }
    }

    #[test]
    fn recovery_stops_the_error_chain() {
        let chain = PluginChain::new(vec![
            Arc::new(Recorder { name: "outer" }),
            Arc::new(Recovering),
        ]);
        let mut ctx = context();
        chain.run_response_error(&mut ctx);
        assert!(ctx.error.is_none());
        assert!(ctx.res.is_some());
        // The recovering step ran last-registered-first and stopped the
        // chain before "outer".
        assert!(!ctx.meta.contains_key("error"));
    }
}
