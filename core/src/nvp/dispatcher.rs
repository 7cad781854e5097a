//! # NVP Dispatcher
//!
//! Turns a method name, its parameters and a credential set into a signed
//! form-encoded request, posts it to the environment's endpoint, and
//! decodes the reply.
//!
//! ## Payload layout
//!
//! ```text
//! METHOD, VERSION, USER, PWD, SIGNATURE, ...params
//! ```
//!
//! `params` may override `METHOD` and `VERSION` in place. Identity fields
//! (`USER`, `PWD`, `SIGNATURE`, any casing) are stripped from `params`:
//! they always come from the credential set.
//!
//! ## Event records
//!
//! Every call emits `request` before sending, then `response` or `error`,
//! all through [`EventHub::insert`] so the redaction path is never skipped.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{Endpoints, Environment, DEFAULT_NVP_VERSION, NVP_CALL_TIMEOUT};
use crate::credentials::CredentialSet;
use crate::events::{source, EventHub, NewRecord};

use super::codec::{decode_form, encode_form};
use super::error::{NvpError, NvpResult};
use super::transport::NvpTransport;
use super::types::{NvpParams, NvpResponse};

const IDENTITY_FIELDS: [&str; 3] = ["USER", "PWD", "SIGNATURE"];

fn is_identity_field(name: &str) -> bool {
    IDENTITY_FIELDS.iter().any(|f| f.eq_ignore_ascii_case(name))
}

// ---------------------------------------------------------------------------
// Metrics hook
// ---------------------------------------------------------------------------

/// Outcome of one upstream call, as seen by a [`CallObserver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    /// The upstream answered 2xx. The `ACK` may still be a failure.
    Answered,
    Failed,
    TimedOut,
}

/// Receives per-call measurements. Lets the binary feed a metrics registry
/// without this crate depending on one.
pub trait CallObserver: Send + Sync {
    fn observe(&self, method: &str, environment: Environment, outcome: CallOutcome, elapsed: Duration);
}

// ---------------------------------------------------------------------------
// NvpCall
// ---------------------------------------------------------------------------

/// One fully specified call. Built once, never mutated.
#[derive(Debug, Clone)]
pub struct NvpCall {
    method: String,
    params: NvpParams,
    credentials: CredentialSet,
    environment: Option<String>,
}

impl NvpCall {
    pub fn new(method: impl Into<String>, params: NvpParams, credentials: CredentialSet) -> Self {
        Self {
            method: method.into(),
            params,
            credentials,
            environment: None,
        }
    }

    /// Per-call environment override. Parsed leniently at dispatch time.
    pub fn with_environment(mut self, environment: Option<impl Into<String>>) -> Self {
        self.environment = environment.map(Into::into);
        self
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn params(&self) -> &NvpParams {
        &self.params
    }
}

// ---------------------------------------------------------------------------
// NvpClient
// ---------------------------------------------------------------------------

pub struct NvpClient {
    transport: Arc<dyn NvpTransport>,
    hub: Arc<EventHub>,
    endpoints: Endpoints,
    version: String,
    default_env: Environment,
    timeout: Duration,
    observer: Option<Arc<dyn CallObserver>>,
}

impl NvpClient {
    pub fn new(transport: Arc<dyn NvpTransport>, hub: Arc<EventHub>) -> Self {
        Self {
            transport,
            hub,
            endpoints: Endpoints::default(),
            version: DEFAULT_NVP_VERSION.to_string(),
            default_env: Environment::default(),
            timeout: NVP_CALL_TIMEOUT,
            observer: None,
        }
    }

    pub fn with_endpoints(mut self, endpoints: Endpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_default_environment(mut self, env: Environment) -> Self {
        self.default_env = env;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn CallObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn default_environment(&self) -> Environment {
        self.default_env
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Resolve the target environment and its URL. An override beats the
    /// process default; unknown values fall back to sandbox.
    pub fn endpoint_for(&self, env_override: Option<&str>) -> (Environment, &str) {
        let env = Environment::resolve(env_override, self.default_env);
        (env, self.endpoints.url_for(env))
    }

    /// Build the outbound payload in wire order.
    pub fn build_payload(&self, method: &str, params: &NvpParams, credentials: &CredentialSet) -> NvpParams {
        let mut payload = NvpParams::new()
            .with("METHOD", method)
            .with("VERSION", &self.version)
            .with("USER", &credentials.username)
            .with("PWD", &credentials.password)
            .with("SIGNATURE", &credentials.signature);
        for (name, value) in params.iter() {
            if !is_identity_field(name) {
                payload.set(name, value);
            }
        }
        payload
    }

    /// Convenience wrapper around [`execute`](Self::execute).
    pub async fn call(
        &self,
        method: &str,
        params: NvpParams,
        credentials: &CredentialSet,
        env_override: Option<&str>,
    ) -> NvpResult<NvpResponse> {
        let call = NvpCall::new(method, params, credentials.clone()).with_environment(env_override);
        self.execute(&call).await
    }

    pub async fn execute(&self, call: &NvpCall) -> NvpResult<NvpResponse> {
        let env_override = call
            .environment
            .as_deref()
            .or(call.credentials.environment.map(|e| e.as_str()));
        let (env, endpoint) = self.endpoint_for(env_override);

        let mut logged_params = call.params.clone();
        logged_params.retain(|name, _| !is_identity_field(name));

        self.hub.insert(
            NewRecord::new(source::NVP, "request")
                .field("method", &call.method)
                .field("endpoint", endpoint)
                .field("environment", env)
                .field("params", &logged_params),
        );
        tracing::debug!(method = %call.method, env = %env, "dispatching NVP call");

        let body = encode_form(&self.build_payload(&call.method, &call.params, &call.credentials));
        let started = Instant::now();
        let result = match tokio::time::timeout(
            self.timeout,
            self.transport.post_form(endpoint, body, self.timeout),
        )
        .await
        {
            Ok(inner) => inner,
            Err(_) => Err(NvpError::Timeout(self.timeout)),
        };
        let elapsed = started.elapsed();

        let outcome = result.and_then(|reply| {
            if reply.is_success() {
                Ok((reply.status, decode_form(&reply.body)))
            } else {
                Err(NvpError::HttpStatus {
                    status: reply.status,
                    body: reply.body,
                })
            }
        });

        match outcome {
            Ok((status, response)) => {
                self.hub.insert(
                    NewRecord::new(source::NVP, "response")
                        .field("method", &call.method)
                        .field("status", status)
                        .field("duration_ms", elapsed.as_millis() as u64)
                        .field("data", &response),
                );
                tracing::info!(
                    method = %call.method,
                    env = %env,
                    status,
                    ack = response.get("ACK").unwrap_or("-"),
                    duration_ms = elapsed.as_millis() as u64,
                    "NVP call answered"
                );
                self.observe(&call.method, env, CallOutcome::Answered, elapsed);
                Ok(response)
            }
            Err(err) => {
                let mut record = NewRecord::new(source::NVP, "error")
                    .field("method", &call.method)
                    .field("error", err.to_string())
                    .field("duration_ms", elapsed.as_millis() as u64);
                if let NvpError::HttpStatus { status, body } = &err {
                    record = record
                        .field("status", status)
                        .field("data", decode_form(body));
                }
                self.hub.insert(record);
                tracing::warn!(method = %call.method, env = %env, error = %err, "NVP call failed");

                let outcome = if err.is_timeout() {
                    CallOutcome::TimedOut
                } else {
                    CallOutcome::Failed
                };
                self.observe(&call.method, env, outcome, elapsed);
                Err(err)
            }
        }
    }

    fn observe(&self, method: &str, env: Environment, outcome: CallOutcome, elapsed: Duration) {
        if let Some(observer) = &self.observer {
            observer.observe(method, env, outcome, elapsed);
        }
    }
}

impl std::fmt::Debug for NvpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NvpClient")
            .field("endpoints", &self.endpoints)
            .field("version", &self.version)
            .field("default_env", &self.default_env)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nvp::transport::RawReply;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Records every post and answers with a canned reply.
    struct Canned {
        reply: NvpResult<RawReply>,
        seen: Mutex<Vec<(String, String)>>,
    }

    impl Canned {
        fn ok(body: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Ok(RawReply { status: 200, body: body.to_string() }),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn status(status: u16) -> Arc<Self> {
            Arc::new(Self {
                reply: Ok(RawReply { status, body: "ACK=Failure".into() }),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl NvpTransport for Canned {
        async fn post_form(&self, endpoint: &str, body: String, _timeout: Duration) -> NvpResult<RawReply> {
            self.seen.lock().push((endpoint.to_string(), body));
            match &self.reply {
                Ok(reply) => Ok(reply.clone()),
                Err(e) => Err(NvpError::Transport(e.to_string())),
            }
        }
    }

    struct Stalled;

    #[async_trait]
    impl NvpTransport for Stalled {
        async fn post_form(&self, _: &str, _: String, _: Duration) -> NvpResult<RawReply> {
            std::future::pending().await
        }
    }

    fn creds() -> CredentialSet {
        CredentialSet::new("u1", "p1", "s1")
    }

    fn client(transport: Arc<dyn NvpTransport>) -> (NvpClient, Arc<EventHub>) {
        let hub = Arc::new(EventHub::new(50));
        (NvpClient::new(transport, Arc::clone(&hub)), hub)
    }

    #[test]
    fn payload_order_and_identity_override() {
        let (client, _) = client(Canned::ok(""));
        let params = NvpParams::new()
            .with("VERSION", "95.0")
            .with("pwd", "attacker")
            .with("AMT", "1.00");

        let payload = client.build_payload("RefundTransaction", &params, &creds());
        let fields: Vec<_> = payload.iter().collect();

        assert_eq!(
            fields,
            vec![
                ("METHOD", "RefundTransaction"),
                ("VERSION", "95.0"),
                ("USER", "u1"),
                ("PWD", "p1"),
                ("SIGNATURE", "s1"),
                ("AMT", "1.00"),
            ]
        );
    }

    #[test]
    fn unknown_environment_falls_back_to_sandbox() {
        let (client, _) = client(Canned::ok(""));
        let client = client.with_default_environment(Environment::Live);

        assert_eq!(client.endpoint_for(Some("production")).0, Environment::Sandbox);
        assert_eq!(client.endpoint_for(Some("LIVE")).0, Environment::Live);
        assert_eq!(client.endpoint_for(None).0, Environment::Live);
    }

    #[tokio::test]
    async fn answered_call_logs_request_and_response() {
        let transport = Canned::ok("ACK=Success&BALANCE=12.34");
        let (client, hub) = client(transport.clone());

        let resp = client
            .call("GetBalance", NvpParams::new(), &creds(), None)
            .await
            .unwrap();
        assert!(resp.is_success());

        let records = hub.all();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].kind, "request");
        assert_eq!(records[1].kind, "response");
        assert_eq!(records[1].fields["status"], 200);

        let (endpoint, body) = transport.seen.lock()[0].clone();
        assert_eq!(endpoint, crate::config::DEFAULT_SANDBOX_URL);
        assert!(body.starts_with("METHOD=GetBalance&VERSION=204.0&USER=u1&PWD=p1&SIGNATURE=s1"));
    }

    #[tokio::test]
    async fn failure_ack_is_data_not_error() {
        let (client, hub) = client(Canned::ok("ACK=Failure&L_ERRORCODE0=10002"));
        let resp = client
            .call("GetBalance", NvpParams::new(), &creds(), None)
            .await
            .unwrap();
        assert!(!resp.is_success());
        assert_eq!(resp.errors()[0].code.as_deref(), Some("10002"));
        assert_eq!(hub.all()[1].kind, "response");
    }

    #[tokio::test]
    async fn non_2xx_status_is_upstream_error() {
        let (client, hub) = client(Canned::status(503));
        let err = client
            .call("GetBalance", NvpParams::new(), &creds(), None)
            .await
            .unwrap_err();

        assert_eq!(err.status(), Some(503));
        let last = hub.all().pop().unwrap();
        assert_eq!(last.kind, "error");
        assert_eq!(last.fields["method"], "GetBalance");
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_upstream_times_out() {
        let (client, hub) = client(Arc::new(Stalled));
        let client = client.with_timeout(Duration::from_secs(30));

        let err = client
            .call("GetBalance", NvpParams::new(), &creds(), None)
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert_eq!(hub.all().last().unwrap().kind, "error");
    }

    #[tokio::test]
    async fn observer_sees_each_call() {
        #[derive(Default)]
        struct Tally(Mutex<Vec<CallOutcome>>);
        impl CallObserver for Tally {
            fn observe(&self, _: &str, _: Environment, outcome: CallOutcome, _: Duration) {
                self.0.lock().push(outcome);
            }
        }

        let tally = Arc::new(Tally::default());
        let (client, _) = client(Canned::status(500));
        let client = client.with_observer(tally.clone());

        let _ = client.call("GetBalance", NvpParams::new(), &creds(), None).await;
        assert_eq!(*tally.0.lock(), vec![CallOutcome::Failed]);
    }

    #[tokio::test]
    async fn credential_environment_applies_when_no_override() {
        let transport = Canned::ok("ACK=Success");
        let (client, _) = client(transport.clone());
        let live = creds().with_environment(Environment::Live);

        client.call("GetBalance", NvpParams::new(), &live, None).await.unwrap();
        client.call("GetBalance", NvpParams::new(), &live, Some("sandbox")).await.unwrap();

        let seen = transport.seen.lock();
        assert_eq!(seen[0].0, crate::config::DEFAULT_LIVE_URL);
        assert_eq!(seen[1].0, crate::config::DEFAULT_SANDBOX_URL);
    }
}
