use std::sync::Arc;

use tracing::{error, info};

use courier_types::{
    CallEnvelope, Clock, NonDeliveryReason, OperationResult, Request, ResultEnvelope,
};

use crate::actor::{ActorRegistry, ExceptionCallback};
use crate::cache::DispatchedCache;
use crate::error::DispatchError;

/// Routes inbound calls to registered actors, enforcing TTL and duplicate
/// suppression, and normalizes the outcome into a result envelope.
///
/// A missing dispatched cache disables duplicate suppression entirely.
pub struct Dispatcher {
    identity: String,
    registry: Arc<ActorRegistry>,
    cache: Option<DispatchedCache>,
    clock: Arc<dyn Clock>,
}

impl Dispatcher {
    pub fn new(
        identity: impl Into<String>,
        registry: Arc<ActorRegistry>,
        cache: Option<DispatchedCache>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            identity: identity.into(),
            registry,
            cache,
            clock,
        }
    }

    /// Whether `prefix` resolves to a registered actor.
    pub fn routable(&self, prefix: &str) -> bool {
        self.registry.resolve(prefix).is_some()
    }

    pub fn dispatched_cache(&self) -> Option<&DispatchedCache> {
        self.cache.as_ref()
    }

    /// Route one inbound call.
    ///
    /// Returns the result envelope to publish back for a two-way call, or
    /// `None` when there is nothing to reply to. Handler failures are
    /// recovered here and converted into error results; only routing bugs
    /// (`InvalidRequestType`) and re-deliveries (`DuplicateRequest`) are
    /// raised to the transport.
    pub fn dispatch(
        &self,
        envelope: &CallEnvelope,
    ) -> Result<Option<ResultEnvelope>, DispatchError> {
        // TTL precedes the duplicate check so an expired duplicate is
        // reported as expired, and a duplicate never reaches the handler.
        let expires_at = envelope.expires_at();
        if expires_at != 0 {
            let now = self.clock.now_secs();
            if now > expires_at {
                info!(
                    token = %envelope.token(),
                    from = %envelope.from(),
                    "REJECT EXPIRED {} request <{}>: TTL {} sec ago",
                    envelope.route(),
                    envelope.token(),
                    now - expires_at
                );
                return Ok(self.expired_result(envelope));
            }
        }

        let (prefix, method_segment) = split_route(envelope.route());
        let actor = self.registry.resolve(prefix).ok_or_else(|| {
            DispatchError::InvalidRequestType(format!("unknown actor for {}", envelope.route()))
        })?;
        let method = method_segment.unwrap_or_else(|| actor.default_method().to_string());
        if !actor.exposed_methods().contains(&method.as_str()) {
            return Err(DispatchError::InvalidRequestType(format!(
                "unknown method {} for {}",
                method,
                envelope.route()
            )));
        }

        if !actor.idempotent(&method) {
            if let Some(cache) = &self.cache {
                if cache.contains(envelope.token()) {
                    info!("REJECT DUP <{}> of self", envelope.token());
                    return Err(DispatchError::DuplicateRequest(format!(
                        "<{}> duplicate",
                        envelope.token()
                    )));
                }
                for tried in envelope.tries() {
                    if cache.contains(tried) {
                        info!("REJECT RETRY DUP <{}> of <{}>", envelope.token(), tried);
                        return Err(DispatchError::DuplicateRequest(format!(
                            "<{}> retry duplicate of <{}>",
                            envelope.token(),
                            tried
                        )));
                    }
                }
                // Record on acceptance, not on completion, so re-delivery
                // during the handling window is also caught.
                cache.store(envelope.token());
            }
        }

        match actor.invoke(&method, envelope.payload(), envelope) {
            Ok(content) => Ok(self.reply(envelope, OperationResult::success(content))),
            Err(err) => {
                if let Some(callback) = actor.exception_callback() {
                    match callback {
                        ExceptionCallback::ByName(name) => {
                            actor.invoke_callback(&name, &method, envelope, &err)
                        }
                        ExceptionCallback::ByClosure(callback) => callback(&method, envelope, &err),
                    }
                }
                let description =
                    format!("Could not handle {} request: {}", envelope.route(), err);
                error!(token = %envelope.token(), "{}", description);
                Ok(self.reply(envelope, OperationResult::error(description)))
            }
        }
    }

    fn expired_result(&self, envelope: &CallEnvelope) -> Option<ResultEnvelope> {
        let request = match envelope {
            CallEnvelope::Push(_) => return None,
            CallEnvelope::Request(request) => request,
        };
        let result = if request.reply_to.is_some() {
            // A legacy respondent addressed by direct queue cannot interpret
            // a non-delivery result.
            OperationResult::error(format!(
                "Could not deliver request <{}> because its TTL expired",
                request.token
            ))
        } else {
            OperationResult::non_delivery(NonDeliveryReason::TtlExpiration)
        };
        Some(self.result_for(request, result))
    }

    fn reply(&self, envelope: &CallEnvelope, result: OperationResult) -> Option<ResultEnvelope> {
        match envelope {
            CallEnvelope::Push(_) => None,
            CallEnvelope::Request(request) => Some(self.result_for(request, result)),
        }
    }

    fn result_for(&self, request: &Request, result: OperationResult) -> ResultEnvelope {
        let to = request
            .reply_to
            .clone()
            .unwrap_or_else(|| request.from.clone());
        ResultEnvelope::new(request.token.clone(), self.identity.clone(), to, result)
    }
}

fn split_route(route: &str) -> (&str, Option<String>) {
    let mut parts = route.trim_start_matches('/').splitn(2, '/');
    let prefix = parts.next().unwrap_or_default();
    let method = parts
        .next()
        .filter(|segment| !segment.is_empty())
        .map(String::from);
    (prefix, method)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::{json, Value};

    use courier_types::{ManualClock, Push, Token};

    use super::*;
    use crate::actor::Actor;

    /// Test actor with idempotent and non-idempotent methods, a failing
    /// method, and a named exception callback that records its arguments.
    #[derive(Default)]
    struct Greeter {
        tally: Mutex<i64>,
        failures: Mutex<Vec<(String, String)>>,
    }

    impl Actor for Greeter {
        fn prefix(&self) -> &str {
            "greeter"
        }

        fn exposed_methods(&self) -> Vec<&str> {
            vec!["index", "echo", "echo_call", "tally", "explode"]
        }

        fn idempotent(&self, method: &str) -> bool {
            matches!(method, "index" | "echo" | "echo_call" | "explode")
        }

        fn exception_callback(&self) -> Option<ExceptionCallback> {
            Some(ExceptionCallback::ByName("record_failure".into()))
        }

        fn invoke(
            &self,
            method: &str,
            payload: &Value,
            envelope: &CallEnvelope,
        ) -> anyhow::Result<Value> {
            match method {
                "index" | "echo" => Ok(json!(["hello", payload])),
                "echo_call" => Ok(json!(["hello", payload, envelope.token().to_string()])),
                "tally" => {
                    let mut tally = self.tally.lock().unwrap();
                    *tally += payload.as_i64().unwrap_or(0);
                    Ok(json!(*tally))
                }
                "explode" => Err(anyhow::anyhow!("I kill you!")),
                other => Err(anyhow::anyhow!("no such method {other}")),
            }
        }

        fn invoke_callback(
            &self,
            name: &str,
            method: &str,
            _envelope: &CallEnvelope,
            error: &anyhow::Error,
        ) {
            if name == "record_failure" {
                self.failures
                    .lock()
                    .unwrap()
                    .push((method.to_string(), error.to_string()));
            }
        }
    }

    struct Fixture {
        actor: Arc<Greeter>,
        registry: Arc<ActorRegistry>,
        dispatcher: Dispatcher,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let actor = Arc::new(Greeter::default());
        let registry = Arc::new(ActorRegistry::new());
        registry.register(actor.clone(), None);
        let cache = DispatchedCache::new("agent-1", clock.clone());
        let dispatcher = Dispatcher::new("agent-1", registry.clone(), Some(cache), clock.clone());
        Fixture {
            actor,
            registry,
            dispatcher,
            clock,
        }
    }

    fn request(route: &str, payload: Value, token: &str) -> CallEnvelope {
        let mut request = Request::new(route, payload, "you");
        request.token = Token::from(token);
        CallEnvelope::Request(request)
    }

    #[test]
    fn routable_consults_registry() {
        let f = fixture();
        assert!(f.dispatcher.routable("greeter"));
        assert!(!f.dispatcher.routable("stranger"));
    }

    #[test]
    fn dispatches_a_request() {
        let f = fixture();
        let result = f
            .dispatcher
            .dispatch(&request("/greeter/echo", json!("you"), "token"))
            .unwrap()
            .unwrap();
        assert_eq!(result.token, Token::from("token"));
        assert_eq!(result.to, "you");
        match result.result {
            OperationResult::Success(content) => assert_eq!(content, json!(["hello", "you"])),
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[test]
    fn dispatches_with_envelope_argument() {
        let f = fixture();
        let result = f
            .dispatcher
            .dispatch(&request("/greeter/echo_call", json!("you"), "token"))
            .unwrap()
            .unwrap();
        match result.result {
            OperationResult::Success(content) => {
                assert_eq!(content, json!(["hello", "you", "token"]))
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[test]
    fn dispatches_to_default_method() {
        let f = fixture();
        let result = f
            .dispatcher
            .dispatch(&request("/greeter", json!("you"), "token"))
            .unwrap()
            .unwrap();
        match result.result {
            OperationResult::Success(content) => assert_eq!(content, json!(["hello", "you"])),
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[test]
    fn successful_push_returns_none() {
        let f = fixture();
        let push = CallEnvelope::Push(Push::new("/greeter", json!("you"), "you"));
        assert!(f.dispatcher.dispatch(&push).unwrap().is_none());
    }

    #[test]
    fn handles_custom_prefixes() {
        let f = fixture();
        f.registry
            .register(Arc::new(Greeter::default()), Some("umbongo"));
        let result = f
            .dispatcher
            .dispatch(&request("/umbongo/echo", json!("you"), "token"))
            .unwrap()
            .unwrap();
        assert!(result.result.is_success());
    }

    #[test]
    fn unknown_actor_is_invalid_request_type() {
        let f = fixture();
        let err = f
            .dispatcher
            .dispatch(&request("/bad", json!("you"), "token"))
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidRequestType(_)));
    }

    #[test]
    fn unknown_method_is_invalid_request_type() {
        let f = fixture();
        let err = f
            .dispatcher
            .dispatch(&request("/greeter/missing", json!("you"), "token"))
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidRequestType(_)));
    }

    #[test]
    fn handler_failure_becomes_error_result() {
        let f = fixture();
        let result = f
            .dispatcher
            .dispatch(&request("/greeter/explode", Value::Null, "token"))
            .unwrap()
            .unwrap();
        match result.result {
            OperationResult::Error(message) => {
                assert!(message.contains("Could not handle /greeter/explode request"));
                assert!(message.contains("I kill you!"));
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn exception_callback_by_name_sees_actor_state() {
        let f = fixture();
        f.dispatcher
            .dispatch(&request("/greeter/explode", Value::Null, "token"))
            .unwrap();
        let failures = f.actor.failures.lock().unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "explode");
        assert_eq!(failures[0].1, "I kill you!");
    }

    #[test]
    fn exception_callback_by_closure_gets_arguments() {
        struct Doomed {
            called_with: Arc<Mutex<Vec<(String, String, String)>>>,
        }

        impl Actor for Doomed {
            fn prefix(&self) -> &str {
                "doomed"
            }

            fn exposed_methods(&self) -> Vec<&str> {
                vec!["explode"]
            }

            fn idempotent(&self, _method: &str) -> bool {
                true
            }

            fn exception_callback(&self) -> Option<ExceptionCallback> {
                let called_with = self.called_with.clone();
                Some(ExceptionCallback::ByClosure(Arc::new(
                    move |method, envelope, error| {
                        called_with.lock().unwrap().push((
                            method.to_string(),
                            envelope.token().to_string(),
                            error.to_string(),
                        ));
                    },
                )))
            }

            fn invoke(
                &self,
                _method: &str,
                _payload: &Value,
                _envelope: &CallEnvelope,
            ) -> anyhow::Result<Value> {
                Err(anyhow::anyhow!("I kill you!"))
            }
        }

        let f = fixture();
        let called_with = Arc::new(Mutex::new(Vec::new()));
        f.registry.register(
            Arc::new(Doomed {
                called_with: called_with.clone(),
            }),
            None,
        );
        f.dispatcher
            .dispatch(&request("/doomed/explode", Value::Null, "token"))
            .unwrap();
        let calls = called_with.lock().unwrap();
        assert_eq!(
            calls.as_slice(),
            &[(
                "explode".to_string(),
                "token".to_string(),
                "I kill you!".to_string()
            )]
        );
    }

    #[test]
    fn rejects_expired_push_with_none() {
        let f = fixture();
        let mut push = Push::new("/greeter/echo", json!("you"), "you");
        push.expires_at = 1_000_008;
        f.clock.advance(10);
        assert!(f
            .dispatcher
            .dispatch(&CallEnvelope::Push(push))
            .unwrap()
            .is_none());
    }

    #[test]
    fn expired_request_without_reply_to_is_non_delivery() {
        let f = fixture();
        let mut request = Request::new("/greeter/echo", json!("you"), "you");
        request.expires_at = 1_000_008;
        f.clock.advance(10);
        let result = f
            .dispatcher
            .dispatch(&CallEnvelope::Request(request))
            .unwrap()
            .unwrap();
        match result.result {
            OperationResult::NonDelivery(reason) => {
                assert_eq!(reason, NonDeliveryReason::TtlExpiration)
            }
            other => panic!("expected non-delivery, got {other:?}"),
        }
    }

    #[test]
    fn expired_request_with_reply_to_is_error() {
        let f = fixture();
        let mut request = Request::new("/greeter/echo", json!("you"), "you");
        request.expires_at = 1_000_008;
        request.reply_to = Some("mapper-1-1".into());
        f.clock.advance(10);
        let result = f
            .dispatcher
            .dispatch(&CallEnvelope::Request(request))
            .unwrap()
            .unwrap();
        assert_eq!(result.to, "mapper-1-1");
        match result.result {
            OperationResult::Error(message) => assert!(message.contains("Could not deliver")),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn unexpired_request_is_dispatched() {
        let f = fixture();
        let mut request = Request::new("/greeter/echo", json!("you"), "you");
        request.expires_at = 1_000_011;
        f.clock.advance(10);
        let result = f
            .dispatcher
            .dispatch(&CallEnvelope::Request(request))
            .unwrap()
            .unwrap();
        assert!(result.result.is_success());
    }

    #[test]
    fn zero_expiry_disables_ttl_check() {
        let f = fixture();
        f.clock.advance(1_000_000);
        let result = f
            .dispatcher
            .dispatch(&request("/greeter/echo", json!("you"), "token"))
            .unwrap()
            .unwrap();
        assert!(result.result.is_success());
    }

    #[test]
    fn rejects_duplicate_request() {
        let f = fixture();
        let envelope = request("/greeter/tally", json!(1), "try");
        f.dispatcher
            .dispatched_cache()
            .unwrap()
            .store(&Token::from("try"));
        let err = f.dispatcher.dispatch(&envelope).unwrap_err();
        assert!(matches!(err, DispatchError::DuplicateRequest(_)));
        assert_eq!(*f.actor.tally.lock().unwrap(), 0);
    }

    #[test]
    fn rejects_duplicate_from_retry() {
        let f = fixture();
        let mut inner = Request::new("/greeter/tally", json!(1), "you");
        inner.token = Token::from("try");
        inner.tries = vec![Token::from("try1"), Token::from("try2")];
        f.dispatcher
            .dispatched_cache()
            .unwrap()
            .store(&Token::from("try2"));
        let err = f
            .dispatcher
            .dispatch(&CallEnvelope::Request(inner))
            .unwrap_err();
        assert!(matches!(err, DispatchError::DuplicateRequest(_)));
    }

    #[test]
    fn accepts_non_duplicates() {
        let f = fixture();
        let mut inner = Request::new("/greeter/tally", json!(1), "you");
        inner.token = Token::from("try");
        inner.tries = vec![Token::from("try1"), Token::from("try2")];
        f.dispatcher
            .dispatched_cache()
            .unwrap()
            .store(&Token::from("try3"));
        assert!(f
            .dispatcher
            .dispatch(&CallEnvelope::Request(inner))
            .unwrap()
            .is_some());
    }

    #[test]
    fn accepted_request_is_recorded_for_later_duplicates() {
        let f = fixture();
        f.dispatcher
            .dispatch(&request("/greeter/tally", json!(1), "try"))
            .unwrap();
        let err = f
            .dispatcher
            .dispatch(&request("/greeter/tally", json!(1), "try"))
            .unwrap_err();
        assert!(matches!(err, DispatchError::DuplicateRequest(_)));
        assert_eq!(*f.actor.tally.lock().unwrap(), 1);
    }

    #[test]
    fn idempotent_methods_bypass_duplicate_check() {
        let f = fixture();
        f.dispatcher
            .dispatched_cache()
            .unwrap()
            .store(&Token::from("try"));
        assert!(f
            .dispatcher
            .dispatch(&request("/greeter/echo", json!("you"), "try"))
            .unwrap()
            .is_some());
    }

    #[test]
    fn missing_cache_disables_duplicate_check() {
        let f = fixture();
        let dispatcher = Dispatcher::new("agent-1", f.registry.clone(), None, f.clock.clone());
        let mut inner = Request::new("/greeter/tally", json!(1), "you");
        inner.token = Token::from("try");
        inner.tries = vec![Token::from("try1"), Token::from("try2")];
        assert!(dispatcher
            .dispatch(&CallEnvelope::Request(inner))
            .unwrap()
            .is_some());
    }

    #[test]
    fn failing_push_returns_none() {
        let f = fixture();
        let push = CallEnvelope::Push(Push::new("/greeter/explode", Value::Null, "you"));
        assert!(f.dispatcher.dispatch(&push).unwrap().is_none());
        assert_eq!(f.actor.failures.lock().unwrap().len(), 1);
    }
}
