//! Safe invocation pipeline - the only path from a plugin to the model.
//!
//! ```text
//! sanitize → admission → preflight → model → output policy → complete
//!                ↓            ↓         ↓           ↓
//!           rate_limited  policy_    model_     output_
//!                         preflight  error      policy
//! ```
//!
//! Every call ends in exactly one audit record, whatever stage it stopped at.
//! Blocked outcomes are values, not errors: `chat` never fails.

pub mod audit;
pub mod model;
pub mod policy;

pub use audit::{AuditRecord, AuditSink, JsonlAuditSink, MemoryAuditSink};
pub use model::{
    ChatMessage, ChatOptions, HttpModelClient, ModelClient, ModelError, ModelResponse, Role,
    TokenUsage,
};
pub use policy::{
    BasicSanitizer, ContentPolicy, KeywordPreflight, PhraseFilter, PolicyContext, PolicyVerdict,
    Sanitizer,
};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::kernel::recovery::with_recovery_async;
use crate::kernel::RateLimiter;
use crate::types::{IdentityName, InvocationId};

/// Category used for every invocation audit record.
pub const AUDIT_CATEGORY: &str = "llm";
/// Event name used for every invocation audit record.
pub const AUDIT_EVENT: &str = "llm_invocation";

/// How far a call got.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Sanitize,
    Admission,
    Preflight,
    Model,
    OutputPolicy,
    Complete,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Sanitize => "sanitize",
            Stage::Admission => "admission",
            Stage::Preflight => "preflight",
            Stage::Model => "model",
            Stage::OutputPolicy => "output_policy",
            Stage::Complete => "complete",
        }
    }

    /// Block reason for a call that broke down inside this stage.
    fn failure_reason(self) -> BlockReason {
        match self {
            Stage::Sanitize | Stage::Admission | Stage::Preflight => BlockReason::PolicyPreflight,
            Stage::Model => BlockReason::ModelError,
            Stage::OutputPolicy | Stage::Complete => BlockReason::OutputPolicy,
        }
    }
}

/// Machine-readable reason for a blocked call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    RateLimited,
    PolicyPreflight,
    ModelError,
    OutputPolicy,
    ShuttingDown,
}

impl BlockReason {
    pub fn as_str(self) -> &'static str {
        match self {
            BlockReason::RateLimited => "rate_limited",
            BlockReason::PolicyPreflight => "policy_preflight",
            BlockReason::ModelError => "model_error",
            BlockReason::OutputPolicy => "output_policy",
            BlockReason::ShuttingDown => "shutting_down",
        }
    }
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one pipeline call.
#[derive(Debug, Clone, PartialEq)]
pub enum GateResult {
    Allowed {
        invocation_id: InvocationId,
        response: ModelResponse,
    },
    Blocked {
        invocation_id: InvocationId,
        reason: BlockReason,
        /// User-facing replacement text. `None` means say nothing this turn.
        deflection: Option<String>,
        detail: Option<String>,
    },
}

impl GateResult {
    pub fn is_allowed(&self) -> bool {
        matches!(self, GateResult::Allowed { .. })
    }

    pub fn invocation_id(&self) -> &InvocationId {
        match self {
            GateResult::Allowed { invocation_id, .. } | GateResult::Blocked { invocation_id, .. } => {
                invocation_id
            }
        }
    }

    /// Model output, when allowed.
    pub fn content(&self) -> Option<&str> {
        match self {
            GateResult::Allowed { response, .. } => Some(&response.content),
            GateResult::Blocked { .. } => None,
        }
    }

    pub fn block_reason(&self) -> Option<BlockReason> {
        match self {
            GateResult::Blocked { reason, .. } => Some(*reason),
            GateResult::Allowed { .. } => None,
        }
    }

    pub fn deflection(&self) -> Option<&str> {
        match self {
            GateResult::Blocked { deflection, .. } => deflection.as_deref(),
            GateResult::Allowed { .. } => None,
        }
    }

    /// What to show the user: the output, a deflection, or nothing.
    pub fn reply(&self) -> Option<&str> {
        self.content().or_else(|| self.deflection())
    }
}

/// One invocation request.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    /// Admission key owner, normally the identity name.
    pub caller: String,
    /// Short label for audit ("reply", "journal_entry", ...).
    pub intent: String,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub options: ChatOptions,
}

impl ChatRequest {
    pub fn new(
        caller: impl Into<String>,
        intent: impl Into<String>,
        messages: Vec<ChatMessage>,
    ) -> Self {
        Self {
            messages,
            caller: caller.into(),
            intent: intent.into(),
            ..Self::default()
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_options(mut self, options: ChatOptions) -> Self {
        self.options = options;
        self
    }
}

/// The gated path to the model.
///
/// Each call runs on its own tracked task: dropping the `chat` future does
/// not abandon the invocation, which still finishes and writes its audit
/// record. [`SafeInvocationPipeline::drain`] waits for those tasks.
#[derive(Clone)]
pub struct SafeInvocationPipeline {
    gate: Arc<Gate>,
    in_flight: TaskTracker,
}

struct Gate {
    identity: IdentityName,
    sanitizer: Arc<dyn Sanitizer>,
    limiter: Arc<RateLimiter>,
    preflight: Arc<dyn ContentPolicy>,
    model: Arc<dyn ModelClient>,
    output_filter: Arc<dyn ContentPolicy>,
    audit: Arc<dyn AuditSink>,
    shutdown: CancellationToken,
    model_timeout: Option<Duration>,
}

impl fmt::Debug for SafeInvocationPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SafeInvocationPipeline")
            .field("identity", &self.gate.identity)
            .field("in_flight", &self.in_flight.len())
            .finish_non_exhaustive()
    }
}

/// Assembles a [`SafeInvocationPipeline`]; unset stages get the defaults.
pub struct PipelineBuilder {
    identity: IdentityName,
    model: Arc<dyn ModelClient>,
    audit: Arc<dyn AuditSink>,
    sanitizer: Option<Arc<dyn Sanitizer>>,
    limiter: Option<Arc<RateLimiter>>,
    preflight: Option<Arc<dyn ContentPolicy>>,
    output_filter: Option<Arc<dyn ContentPolicy>>,
    shutdown: Option<CancellationToken>,
    model_timeout: Option<Duration>,
}

impl fmt::Debug for PipelineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineBuilder")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

impl PipelineBuilder {
    pub fn sanitizer(mut self, sanitizer: Arc<dyn Sanitizer>) -> Self {
        self.sanitizer = Some(sanitizer);
        self
    }

    pub fn rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn preflight(mut self, policy: Arc<dyn ContentPolicy>) -> Self {
        self.preflight = Some(policy);
        self
    }

    pub fn output_filter(mut self, policy: Arc<dyn ContentPolicy>) -> Self {
        self.output_filter = Some(policy);
        self
    }

    /// Token whose cancellation blocks new invocations.
    pub fn shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown = Some(token);
        self
    }

    /// Cap for the model stage when a request sets no timeout of its own.
    pub fn model_timeout(mut self, limit: Duration) -> Self {
        self.model_timeout = Some(limit);
        self
    }

    pub fn build(self) -> SafeInvocationPipeline {
        let gate = Gate {
            identity: self.identity,
            sanitizer: self
                .sanitizer
                .unwrap_or_else(|| Arc::new(BasicSanitizer::default())),
            limiter: self.limiter.unwrap_or_default(),
            preflight: self
                .preflight
                .unwrap_or_else(|| Arc::new(KeywordPreflight::default())),
            model: self.model,
            output_filter: self
                .output_filter
                .unwrap_or_else(|| Arc::new(PhraseFilter::default())),
            audit: self.audit,
            shutdown: self.shutdown.unwrap_or_default(),
            model_timeout: self.model_timeout,
        };
        SafeInvocationPipeline {
            gate: Arc::new(gate),
            in_flight: TaskTracker::new(),
        }
    }
}

impl SafeInvocationPipeline {
    pub fn builder(
        identity: IdentityName,
        model: Arc<dyn ModelClient>,
        audit: Arc<dyn AuditSink>,
    ) -> PipelineBuilder {
        PipelineBuilder {
            identity,
            model,
            audit,
            sanitizer: None,
            limiter: None,
            preflight: None,
            output_filter: None,
            shutdown: None,
            model_timeout: None,
        }
    }

    pub fn identity(&self) -> &IdentityName {
        &self.gate.identity
    }

    /// Admission-control key for a caller.
    pub fn admission_key(caller: &str) -> String {
        format!("llm:{}", caller)
    }

    /// Whether new invocations are being refused.
    pub fn is_shutting_down(&self) -> bool {
        self.gate.shutdown.is_cancelled()
    }

    /// Check the model without going through admission.
    pub async fn model_health(&self) -> bool {
        self.gate.model.health_check().await
    }

    /// Number of invocations that have not written their audit record yet.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Run one request through every stage and audit the outcome.
    pub async fn chat(&self, request: ChatRequest) -> GateResult {
        let invocation_id = InvocationId::new();
        let gate = self.gate.clone();
        let id = invocation_id.clone();
        let handle = self
            .in_flight
            .spawn(async move { gate.invoke(request, id).await });

        match handle.await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(
                    "llm_invocation_aborted: invocation_id={}, error={}",
                    invocation_id,
                    e
                );
                GateResult::Blocked {
                    invocation_id,
                    reason: BlockReason::ShuttingDown,
                    deflection: None,
                    detail: Some(e.to_string()),
                }
            }
        }
    }

    /// Wait up to `limit` for in-flight invocations to finish.
    ///
    /// Returns `false` if some were still running when the limit expired.
    pub async fn drain(&self, limit: Duration) -> bool {
        self.in_flight.close();
        let drained = tokio::time::timeout(limit, self.in_flight.wait())
            .await
            .is_ok();
        if !drained {
            tracing::warn!(
                "llm_drain_timeout: identity={}, in_flight={}",
                self.gate.identity,
                self.in_flight.len()
            );
        }
        drained
    }
}

impl Gate {
    async fn invoke(&self, request: ChatRequest, invocation_id: InvocationId) -> GateResult {
        let started = Instant::now();
        let mut stage = Stage::Sanitize;

        let evaluated = with_recovery_async(
            async { Ok(self.evaluate(&request, &invocation_id, &mut stage).await) },
            "llm_invocation",
        )
        .await;
        let result = evaluated.unwrap_or_else(|e| GateResult::Blocked {
            invocation_id: invocation_id.clone(),
            reason: stage.failure_reason(),
            deflection: None,
            detail: Some(e.to_string()),
        });

        let mut record = AuditRecord::new(AUDIT_EVENT, AUDIT_CATEGORY)
            .success(result.is_allowed())
            .duration(started.elapsed())
            .field("invocation_id", invocation_id.as_str())
            .field("identity", self.identity.as_str())
            .field("caller", request.caller.as_str())
            .field("intent", request.intent.as_str())
            .field("stage", stage.as_str())
            .field("metadata", serde_json::Value::Object(request.metadata.clone()));
        record = match &result {
            GateResult::Allowed { response, .. } => record
                .field("block_reason", serde_json::Value::Null)
                .field("model", response.model.as_str()),
            GateResult::Blocked { reason, detail, .. } => {
                let record = record.field("block_reason", reason.as_str());
                match detail {
                    Some(detail) => record.field("detail", detail.as_str()),
                    None => record,
                }
            }
        };
        self.audit.log(record).await;

        result
    }

    async fn evaluate(
        &self,
        request: &ChatRequest,
        invocation_id: &InvocationId,
        stage: &mut Stage,
    ) -> GateResult {
        let blocked = |reason: BlockReason, deflection: Option<String>, detail: Option<String>| {
            GateResult::Blocked {
                invocation_id: invocation_id.clone(),
                reason,
                deflection,
                detail,
            }
        };

        // Sanitize everything that did not come from the identity itself.
        let mut messages = request.messages.clone();
        for msg in messages.iter_mut().filter(|m| m.role != Role::System) {
            msg.content = self.sanitizer.sanitize(&msg.content);
        }

        *stage = Stage::Admission;
        if self.shutdown.is_cancelled() {
            return blocked(BlockReason::ShuttingDown, None, None);
        }
        let key = SafeInvocationPipeline::admission_key(&request.caller);
        if !self.limiter.allow(&key) {
            let wait = self.limiter.retry_after(&key, 1.0);
            tracing::info!(
                "llm_rate_limited: caller={}, intent={}, retry_after={:?}",
                request.caller,
                request.intent,
                wait
            );
            return blocked(
                BlockReason::RateLimited,
                None,
                Some(format!("retry after {:.1}s", wait.as_secs_f64())),
            );
        }

        *stage = Stage::Preflight;
        let ctx = PolicyContext {
            identity: self.identity.as_str(),
            caller: &request.caller,
            intent: &request.intent,
            metadata: &request.metadata,
        };
        for msg in messages.iter_mut().filter(|m| m.role == Role::User) {
            let verdict = self.preflight.check(&msg.content, &ctx).await;
            if !verdict.accepted {
                return blocked(BlockReason::PolicyPreflight, verdict.deflection, None);
            }
            msg.content = verdict.text;
        }

        *stage = Stage::Model;
        if self.shutdown.is_cancelled() {
            return blocked(BlockReason::ShuttingDown, None, None);
        }
        let call = self.model.chat(&messages, &request.options);
        let outcome = match request.options.timeout.or(self.model_timeout) {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(outcome) => outcome,
                Err(_) => Err(ModelError::Timeout(limit)),
            },
            None => call.await,
        };
        let mut response = match outcome {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(
                    "llm_call_failed: caller={}, intent={}, error={}",
                    request.caller,
                    request.intent,
                    e
                );
                return blocked(BlockReason::ModelError, None, Some(e.to_string()));
            }
        };

        *stage = Stage::OutputPolicy;
        let verdict = self.output_filter.check(&response.content, &ctx).await;
        if !verdict.accepted {
            return blocked(BlockReason::OutputPolicy, verdict.deflection, None);
        }
        response.content = verdict.text;

        *stage = Stage::Complete;
        tracing::debug!(
            "llm_invocation_complete: invocation_id={}, caller={}, intent={}",
            invocation_id,
            request.caller,
            request.intent
        );
        GateResult::Allowed {
            invocation_id: invocation_id.clone(),
            response,
        }
    }
}
