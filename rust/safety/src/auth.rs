//! Shared-secret gate for inbound calls.
//!
//! With a token configured every call must present
//! `authorization: Basic <base64(token)>`. Without one, calls are not checked
//! and request metrics are recorded instead. The two modes never overlap.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::fmt;
use std::sync::Arc;
use tonic::metadata::{AsciiMetadataValue, MetadataMap};
use tonic::service::Interceptor;
use tonic::{Request, Status};
use tracing::warn;

use crate::error::{SafetyError, SafetyResult};
use crate::metrics::GrpcMetricsLayer;

const AUTHORIZATION: &str = "authorization";
const BASIC_SCHEME: &str = "basic";

/// A single step of an [`InterceptorChain`].
pub type CallHook = Arc<dyn Fn(Request<()>) -> Result<Request<()>, Status> + Send + Sync>;

/// Hooks applied in order to every call; the first rejection wins.
#[derive(Clone, Default)]
pub struct InterceptorChain {
    hooks: Vec<CallHook>,
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, hook: CallHook) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

impl fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptorChain")
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

impl Interceptor for InterceptorChain {
    fn call(&mut self, request: Request<()>) -> Result<Request<()>, Status> {
        self.hooks.iter().try_fold(request, |request, hook| hook(request))
    }
}

/// Everything the gate installs on a server, picked by [`with_opts`].
#[derive(Debug, Clone)]
pub struct GateOptions {
    pub interceptors: InterceptorChain,
    pub metrics: Option<GrpcMetricsLayer>,
}

/// Build the gate for `token`: basic auth when set, request metrics when empty.
pub fn with_opts(token: &str) -> GateOptions {
    if token.is_empty() {
        return GateOptions {
            interceptors: InterceptorChain::new(),
            metrics: Some(GrpcMetricsLayer::new()),
        };
    }

    GateOptions {
        interceptors: InterceptorChain::new().with(BasicAuth::new(token).into_hook()),
        metrics: None,
    }
}

/// Encode a shared secret the way it travels on the wire.
pub fn encode_token(secret: &str) -> String {
    STANDARD.encode(secret.as_bytes())
}

/// Server-side check of the `Basic` credential.
#[derive(Debug, Clone)]
pub struct BasicAuth {
    expected: String,
}

impl BasicAuth {
    pub fn new(secret: &str) -> Self {
        Self {
            expected: encode_token(secret),
        }
    }

    /// The client value is compared as sent; it is never decoded.
    pub fn check(&self, metadata: &MetadataMap) -> SafetyResult<()> {
        let token = token_from_metadata(metadata, BASIC_SCHEME)?;

        if token != self.expected {
            return Err(SafetyError::Unauthenticated(
                "tokens do not match".to_string(),
            ));
        }

        Ok(())
    }

    pub fn into_hook(self) -> CallHook {
        Arc::new(move |request: Request<()>| -> Result<Request<()>, Status> {
            if let Err(e) = self.check(request.metadata()) {
                warn!(error = %e, "Rejected unauthenticated call");
                return Err(e.into());
            }
            Ok(request)
        })
    }
}

/// Extract the credential of `scheme` from the `authorization` header.
pub fn token_from_metadata<'a>(metadata: &'a MetadataMap, scheme: &str) -> SafetyResult<&'a str> {
    let unauthenticated =
        || SafetyError::MetadataExtraction(format!("Request unauthenticated with {scheme}"));

    let value = metadata
        .get(AUTHORIZATION)
        .ok_or_else(unauthenticated)?
        .to_str()
        .map_err(|e| SafetyError::MetadataExtraction(e.to_string()))?;

    if value.is_empty() {
        return Err(unauthenticated());
    }

    let (found, token) = value
        .split_once(' ')
        .ok_or_else(|| SafetyError::MetadataExtraction("Bad authorization string".to_string()))?;

    if !found.eq_ignore_ascii_case(scheme) {
        return Err(unauthenticated());
    }

    Ok(token)
}

/// Client interceptor attaching a `Basic` credential to every call.
#[derive(Debug, Clone)]
pub struct BasicCredentials {
    header: AsciiMetadataValue,
}

impl BasicCredentials {
    /// Credentials for `secret`, encoded as the server expects.
    pub fn new(secret: &str) -> SafetyResult<Self> {
        Self::from_token(&encode_token(secret))
    }

    /// Credentials carrying `token` verbatim.
    pub fn from_token(token: &str) -> SafetyResult<Self> {
        let header = format!("Basic {token}")
            .parse()
            .map_err(|e| SafetyError::InvalidRequest(format!("Invalid credential: {e}")))?;
        Ok(Self { header })
    }
}

impl Interceptor for BasicCredentials {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        request
            .metadata_mut()
            .insert(AUTHORIZATION, self.header.clone());
        Ok(request)
    }
}
