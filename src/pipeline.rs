//! The interception pipeline.
//!
//! [`Shield`] sequences every guard and optimization around a model call:
//!
//! 1. breaker admission
//! 2. user-budget admission (with in-flight reservation and tier pinning)
//! 3. request guard
//! 4. cache lookup (short-circuits the model call on a hit)
//! 5. original-token accounting
//! 6. context trimming
//! 7. complexity routing
//! 8. prefix optimization
//!
//! The caller then hands the transformed request back together with its
//! model function (`wrap_generate` or `wrap_stream`); the pipeline settles
//! spend, savings, and reservations on every exit path.

use futures::Stream;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use uuid::Uuid;

use crate::breaker::{BreakerAction, CostBreaker};
use crate::budget::UserBudgetManager;
use crate::cache::{CacheHit, ResponseCache};
use crate::config::{BlockedInfo, ShieldConfig, UsageReport, UserBudgetConfig};
use crate::error::{BlockCode, Error, Result};
use crate::events::{ShieldEvent, ShieldEvents};
use crate::guard::RequestGuard;
use crate::ledger::{CostLedger, LedgerEntry, SavingsBreakdown};
use crate::prefix::{PrefixMarker, PrefixOptimizer};
use crate::pricing;
use crate::router::ModelRouter;
use crate::stream::{StreamTokenTracker, StreamUsage};
use crate::tokens::TokenCounter;
use crate::trim::{ContextTrimmer, TrimBudget};
use crate::types::{
    expand_messages, flatten_prompt, last_user_text, FinishReason, GenerateResult, PromptMessage,
    StreamChunk, Usage,
};

/// A boxed stream of response chunks.
pub type ShieldStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

/// Parameters of one model call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateParams {
    pub model: String,
    pub prompt: Vec<PromptMessage>,
    pub max_output_tokens: Option<u32>,
}

impl GenerateParams {
    pub fn new(model: impl Into<String>, prompt: Vec<PromptMessage>) -> Self {
        Self {
            model: model.into(),
            prompt,
            max_output_tokens: None,
        }
    }
}

/// Request-scoped pipeline state. Owned exclusively by the pipeline and
/// carried from the pre-stage to the post-stage; it lives for exactly one
/// request.
#[derive(Debug)]
pub(crate) struct RequestMeta {
    request_id: Uuid,
    user_text: String,
    cache_hit: Option<CacheHit>,
    original_input_tokens: u64,
    final_input_tokens: u64,
    original_model: String,
    tier_routed: bool,
    reserved: f64,
    user_id: Option<String>,
    savings: SavingsBreakdown,
    started: Instant,
    guard_started: bool,
}

/// A transformed request ready for `wrap_generate` / `wrap_stream`.
#[derive(Debug)]
pub struct ShieldRequest {
    pub params: GenerateParams,
    /// Provider cache marker for the stable prompt prefix, if any
    pub prefix_marker: Option<PrefixMarker>,
    pub(crate) meta: RequestMeta,
}

impl ShieldRequest {
    /// Unique id of this request, usable for log correlation.
    pub fn request_id(&self) -> Uuid {
        self.meta.request_id
    }

    /// Whether the lookup stage found a cached response.
    pub fn is_cache_hit(&self) -> bool {
        self.meta.cache_hit.is_some()
    }
}

enum SettleKind {
    Complete,
    Abort,
}

struct ShieldInner {
    config: ShieldConfig,
    events: Arc<ShieldEvents>,
    guard: Option<RequestGuard>,
    cache: Option<Arc<ResponseCache>>,
    router: Option<ModelRouter>,
    prefix: Option<PrefixOptimizer>,
    breaker: Option<CostBreaker>,
    budget: Option<UserBudgetManager>,
    ledger: Option<CostLedger>,
}

/// The cost-and-quota control plane around a model call.
///
/// One `Shield` owns one set of singletons (cache, breaker, budgets,
/// ledger, event bus) shared by all requests flowing through it.
#[derive(Clone)]
pub struct Shield {
    inner: Arc<ShieldInner>,
}

impl Shield {
    /// Validate the configuration and construct the pipeline. Nothing is
    /// initialized when validation fails.
    pub fn new(config: ShieldConfig) -> Result<Self> {
        config.validate()?;

        let events = Arc::new(ShieldEvents::new());
        let store = config.store.clone();

        let guard = config
            .modules
            .guard
            .then(|| RequestGuard::new(config.guard.clone()));

        let cache = config.modules.cache.then(|| {
            let mut cache = ResponseCache::new(config.cache.clone());
            if let Some(store) = &store {
                cache = cache.with_store(Arc::clone(store));
            }
            Arc::new(cache)
        });

        let router = config
            .modules
            .router
            .then(|| ModelRouter::new(config.router.clone()));

        let prefix = config
            .modules
            .prefix
            .then(|| PrefixOptimizer::new(config.prefix));

        let ledger = config.modules.ledger.then(|| {
            let mut ledger =
                CostLedger::new(config.ledger.feature.clone(), config.ledger.persist);
            if let Some(store) = &store {
                ledger = ledger.with_store(Arc::clone(store));
            }
            ledger
        });

        let breaker = config.breaker.clone().map(|breaker_config| {
            let mut breaker = CostBreaker::new(breaker_config);
            if let Some(store) = &store {
                breaker = breaker.with_store(Arc::clone(store));
            }
            breaker
        });

        let budget = config.user_budget.as_ref().map(|user_budget| {
            let mut manager =
                UserBudgetManager::new(user_budget.budgets.clone(), Arc::clone(&events));
            if let Some(store) = &store {
                manager = manager.with_store(Arc::clone(store));
            }
            manager
        });

        Ok(Self {
            inner: Arc::new(ShieldInner {
                config,
                events,
                guard,
                cache,
                router,
                prefix,
                breaker,
                budget,
                ledger,
            }),
        })
    }

    /// Reload persisted state (user budgets, breaker windows). Failures
    /// degrade to empty state.
    pub async fn hydrate(&self) {
        if let Some(budget) = &self.inner.budget {
            budget.hydrate().await;
        }
        if let Some(breaker) = &self.inner.breaker {
            breaker.hydrate().await;
        }
    }

    /// The per-instance event bus.
    pub fn events(&self) -> &ShieldEvents {
        &self.inner.events
    }

    /// The spend ledger, when the module is enabled.
    pub fn ledger(&self) -> Option<&CostLedger> {
        self.inner.ledger.as_ref()
    }

    /// The request guard, when the module is enabled.
    pub fn guard(&self) -> Option<&RequestGuard> {
        self.inner.guard.as_ref()
    }

    /// The response cache, when the module is enabled.
    pub fn cache(&self) -> Option<&ResponseCache> {
        self.inner.cache.as_deref()
    }

    /// The cost breaker, when configured.
    pub fn breaker(&self) -> Option<&CostBreaker> {
        self.inner.breaker.as_ref()
    }

    /// The user-budget manager, when configured.
    pub fn user_budgets(&self) -> Option<&UserBudgetManager> {
        self.inner.budget.as_ref()
    }

    /// Run the pre-call pipeline over `params`.
    ///
    /// On a cache hit the parameters come back unchanged with the hit
    /// stashed in the request, so the generate stage can short-circuit.
    pub async fn transform_params(&self, mut params: GenerateParams) -> Result<ShieldRequest> {
        let inner = &self.inner;
        let mut messages = flatten_prompt(&params.prompt);
        let user_text = last_user_text(&params.prompt).unwrap_or_default();
        let counter = TokenCounter::for_model(&params.model);
        let original_input_tokens = counter.count_chat(&messages) as u64;
        let reserved_output = inner.config.context.reserve_for_output as u64;

        let mut meta = RequestMeta {
            request_id: Uuid::new_v4(),
            user_text,
            cache_hit: None,
            original_input_tokens,
            final_input_tokens: original_input_tokens,
            original_model: params.model.clone(),
            tier_routed: false,
            reserved: 0.0,
            user_id: None,
            savings: SavingsBreakdown::default(),
            started: Instant::now(),
            guard_started: false,
        };

        tracing::debug!(
            request_id = %meta.request_id,
            model = %params.model,
            input_tokens = original_input_tokens,
            "transform start"
        );

        // (1) breaker admission
        if let Some(breaker) = &inner.breaker {
            let decision = breaker.check(&params.model, original_input_tokens, reserved_output);
            if !decision.allowed {
                let window = decision
                    .window
                    .map(|w| w.as_str().to_string())
                    .unwrap_or_else(|| "session".to_string());
                let limit = decision.limit.unwrap_or(0.0);
                match breaker.action() {
                    BreakerAction::Stop => {
                        inner.events.emit(ShieldEvent::BreakerTripped {
                            window,
                            spend: decision.projected,
                            limit,
                        });
                        return Err(inner.notify_blocked(
                            BlockCode::BreakerSessionLimit,
                            decision.reason.unwrap_or_default(),
                            decision.estimated_cost,
                        ));
                    }
                    BreakerAction::Warn => {
                        inner.events.emit(ShieldEvent::BreakerWarning {
                            window,
                            spend: decision.projected,
                            limit,
                        });
                    }
                }
            }
        }

        // (2) user-budget admission and tier pinning
        if let (Some(budget), Some(user_budget_cfg)) =
            (&inner.budget, &inner.config.user_budget)
        {
            let user_id = resolve_user_id(user_budget_cfg).ok_or_else(|| {
                inner.notify_blocked(
                    BlockCode::BudgetUserIdInvalid,
                    "user id resolver returned an empty id or failed".to_string(),
                    0.0,
                )
            })?;

            let check = budget.check(
                &user_id,
                &params.model,
                original_input_tokens,
                reserved_output,
            );
            if !check.allowed {
                if let Some(callback) = &user_budget_cfg.on_budget_exceeded {
                    callback(&check.status);
                }
                let code = check.code.unwrap_or(BlockCode::BudgetDailyExceeded);
                return Err(inner.notify_blocked(
                    code,
                    check.reason.unwrap_or_default(),
                    pricing::cost(&params.model, original_input_tokens, reserved_output),
                ));
            }
            if check.status.percent_used.daily >= 80.0 || check.status.percent_used.monthly >= 80.0
            {
                if let Some(callback) = &user_budget_cfg.on_budget_warning {
                    callback(&check.status);
                }
            }

            meta.reserved = check.reserved;
            meta.user_id = Some(user_id.clone());

            if let Some(pinned) = budget.model_for_user(&user_id) {
                if pinned != params.model {
                    let saved = (pricing::cost(&params.model, original_input_tokens, reserved_output)
                        - pricing::cost(&pinned, original_input_tokens, reserved_output))
                    .max(0.0);
                    inner.events.emit(ShieldEvent::RouterDowngraded {
                        original_model: params.model.clone(),
                        selected_model: pinned.clone(),
                        complexity: 0,
                        saved_cost: saved,
                    });
                    meta.savings.router += saved;
                    meta.tier_routed = true;
                    params.model = pinned;
                }
            }
        }

        // (3) request guard. A denial from here on must release the
        // reservation taken in (2) before surfacing.
        if let Some(guard) = &inner.guard {
            let check = guard.check(&meta.user_text, Some(reserved_output), Some(&params.model));
            if !check.allowed {
                inner.release_reservation(&meta);
                return Err(inner.notify_blocked(
                    BlockCode::GuardRateLimit,
                    check.reason.unwrap_or_default(),
                    check.estimated_cost,
                ));
            }
            inner.events.emit(ShieldEvent::RequestAllowed {
                prompt: meta.user_text.clone(),
                model: params.model.clone(),
            });
            guard.start_request(&meta.user_text);
            meta.guard_started = true;
        }

        // (4) cache lookup; a hit short-circuits the remaining stages and
        // the generate call itself.
        if let Some(cache) = &inner.cache {
            match cache.lookup(&meta.user_text, &params.model).await {
                Some(hit) => {
                    let saved =
                        pricing::cost(&hit.entry.model, hit.entry.input_tokens, hit.entry.output_tokens);
                    inner.events.emit(ShieldEvent::CacheHit {
                        match_type: hit.match_type,
                        similarity: hit.similarity,
                        saved_cost: saved,
                    });
                    meta.savings.cache_hit = saved;
                    meta.cache_hit = Some(hit);
                    return Ok(ShieldRequest {
                        params,
                        prefix_marker: None,
                        meta,
                    });
                }
                None => {
                    inner.events.emit(ShieldEvent::CacheMiss {
                        prompt: meta.user_text.clone(),
                    });
                }
            }
        }

        // (5) original-token total was computed up front; (6) trim.
        if inner.config.modules.context {
            if let Some(max_input_tokens) = inner.config.context.max_input_tokens {
                let trimmer = ContextTrimmer::new(counter.clone());
                let result = trimmer.trim(
                    &messages,
                    &TrimBudget {
                        max_context_tokens: max_input_tokens,
                        reserved_for_output: inner.config.context.reserve_for_output,
                    },
                );
                if result.evicted_tokens > 0 {
                    let trimmed_tokens = counter.count_chat(&result.messages);
                    meta.savings.context +=
                        pricing::input_cost(&params.model, result.evicted_tokens as u64);
                    inner.events.emit(ShieldEvent::ContextTrimmed {
                        original_tokens: original_input_tokens as usize,
                        trimmed_tokens,
                        saved_tokens: result.evicted_tokens,
                    });
                }
                messages = result.messages;
            }
        }
        meta.final_input_tokens = counter.count_chat(&messages) as u64;

        // (7) complexity routing, unless the user's tier already pinned the
        // model.
        if let Some(router) = &inner.router {
            if !meta.tier_routed {
                let decision = router.route(
                    &meta.user_text,
                    &params.model,
                    meta.final_input_tokens,
                    reserved_output,
                );
                if decision.downgraded {
                    inner.events.emit(ShieldEvent::RouterDowngraded {
                        original_model: params.model.clone(),
                        selected_model: decision.model.clone(),
                        complexity: decision.complexity,
                        saved_cost: decision.saved_cost,
                    });
                    meta.savings.router += decision.saved_cost;
                    params.model = decision.model;
                }
            }
        }

        // (8) prefix optimization
        let mut prefix_marker = None;
        if let Some(prefix) = &inner.prefix {
            if let Some(marker) = prefix.optimize(&messages, &params.model, &counter) {
                meta.savings.prefix += marker.estimated_savings;
                prefix_marker = Some(marker);
            }
        }

        params.prompt = expand_messages(&messages);
        Ok(ShieldRequest {
            params,
            prefix_marker,
            meta,
        })
    }

    /// Run the model call, or serve the cached response, and settle.
    pub async fn wrap_generate<F, Fut>(
        &self,
        request: ShieldRequest,
        do_generate: F,
    ) -> Result<GenerateResult>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<GenerateResult>>,
    {
        let inner = &self.inner;
        let ShieldRequest { params, meta, .. } = request;

        if let Some(hit) = &meta.cache_hit {
            return Ok(inner.settle_cache_hit(&meta, hit));
        }

        match do_generate().await {
            Err(err) => {
                inner.release_on_failure(&meta);
                Err(err)
            }
            Ok(result) => {
                inner.settle_generate(&params, &meta, &result);
                Ok(result)
            }
        }
    }

    /// Open the model stream, or synthesize one from the cached response,
    /// piping chunks through the token tracker. Settlement runs exactly
    /// once whether the stream finishes, errors, or is cancelled.
    pub async fn wrap_stream<F, Fut>(&self, request: ShieldRequest, do_stream: F) -> Result<ShieldStream>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<ShieldStream>>,
    {
        let inner = Arc::clone(&self.inner);
        let ShieldRequest { params, meta, .. } = request;

        if let Some(hit) = meta.cache_hit.clone() {
            let result = inner.settle_cache_hit(&meta, &hit);
            let chunks: Vec<Result<StreamChunk>> = vec![
                Ok(StreamChunk::TextDelta {
                    text_delta: result.text,
                }),
                Ok(StreamChunk::Finish {
                    finish_reason: FinishReason::Stop,
                    usage: Some(Usage::new(0, 0)),
                }),
            ];
            return Ok(Box::pin(futures::stream::iter(chunks)));
        }

        let source = match do_stream().await {
            Ok(source) => source,
            Err(err) => {
                inner.release_on_failure(&meta);
                return Err(err);
            }
        };

        let mut tracker = StreamTokenTracker::new(&params.model);
        tracker.set_input_tokens(meta.final_input_tokens);

        Ok(Box::pin(TrackedStream {
            shield: inner,
            params,
            meta,
            tracker,
            source,
            settled: false,
        }))
    }
}

impl std::fmt::Debug for Shield {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shield")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

/// Resolve the current user id; `None` when the resolver fails, panics, or
/// returns an empty id.
fn resolve_user_id(config: &UserBudgetConfig) -> Option<String> {
    let resolver = Arc::clone(&config.get_user_id);
    match catch_unwind(AssertUnwindSafe(move || resolver())) {
        Ok(Ok(id)) if !id.is_empty() => Some(id),
        _ => None,
    }
}

impl ShieldInner {
    /// Emit the blocked event, invoke the callback, and build the error.
    fn notify_blocked(&self, code: BlockCode, reason: String, estimated_cost: f64) -> Error {
        self.events.emit(ShieldEvent::RequestBlocked {
            reason: reason.clone(),
            estimated_cost,
        });
        if let Some(callback) = &self.config.on_blocked {
            let _ = catch_unwind(AssertUnwindSafe(|| {
                callback(&BlockedInfo {
                    code,
                    reason: reason.clone(),
                    estimated_cost,
                })
            }));
        }
        Error::blocked(code, reason)
    }

    fn release_reservation(&self, meta: &RequestMeta) {
        if meta.reserved > 0.0 {
            if let (Some(budget), Some(user_id)) = (&self.budget, &meta.user_id) {
                budget.release_inflight(user_id, meta.reserved);
            }
        }
    }

    /// Failure settlement: release the reservation and clear the guard's
    /// in-flight mark, without recording any spend.
    fn release_on_failure(&self, meta: &RequestMeta) {
        self.release_reservation(meta);
        if meta.guard_started {
            if let Some(guard) = &self.guard {
                guard.complete_request(&meta.user_text, 0, 0, None);
            }
        }
    }

    fn report_usage(&self, model: &str, usage: Usage, cost: f64, saved: f64) {
        if let Some(callback) = &self.config.on_usage {
            let _ = catch_unwind(AssertUnwindSafe(|| {
                callback(&UsageReport {
                    model: model.to_string(),
                    input_tokens: usage.prompt_tokens,
                    output_tokens: usage.completion_tokens,
                    cost,
                    saved,
                })
            }));
        }
    }

    fn record_ledger(&self, meta: &RequestMeta, model: &str, usage: Usage, cost: f64) {
        let entry = LedgerEntry {
            model: model.to_string(),
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            original_input_tokens: meta.original_input_tokens,
            original_model: meta.original_model.clone(),
            cost,
            savings: meta.savings,
            feature: None,
            latency_ms: meta.started.elapsed().as_millis() as u64,
            timestamp: chrono::Utc::now(),
        };
        if let Some(ledger) = &self.ledger {
            ledger.record(entry);
        }
        self.events.emit(ShieldEvent::LedgerEntry {
            model: model.to_string(),
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            cost,
            saved: meta.savings.total(),
        });
    }

    /// Settlement for a request served from cache: release the
    /// reservation, record a zero-cost ledger entry, and synthesize the
    /// response.
    fn settle_cache_hit(&self, meta: &RequestMeta, hit: &CacheHit) -> GenerateResult {
        self.release_reservation(meta);
        if meta.guard_started {
            if let Some(guard) = &self.guard {
                guard.complete_request(&meta.user_text, 0, 0, None);
            }
        }

        let usage = Usage::new(0, 0);
        self.record_ledger(meta, &hit.entry.model, usage, 0.0);
        self.report_usage(&hit.entry.model, usage, 0.0, meta.savings.total());

        tracing::debug!(request_id = %meta.request_id, "served from cache");
        GenerateResult::new(hit.entry.response.clone(), usage, FinishReason::Stop)
    }

    /// Settlement for a completed model call.
    fn settle_generate(&self, params: &GenerateParams, meta: &RequestMeta, result: &GenerateResult) {
        let usage = result.usage;
        let cost = pricing::cost(&params.model, usage.prompt_tokens, usage.completion_tokens);

        self.store_response(meta, &params.model, &result.text, usage);
        self.record_ledger(meta, &params.model, usage, cost);
        self.report_usage(&params.model, usage, cost, meta.savings.total());

        if meta.guard_started {
            if let Some(guard) = &self.guard {
                guard.complete_request(
                    &meta.user_text,
                    usage.prompt_tokens,
                    usage.completion_tokens,
                    Some(&params.model),
                );
            }
        }

        if cost > 0.0 {
            if let Some(breaker) = &self.breaker {
                breaker.record_spend(cost, &params.model);
            }
        }

        if let (Some(budget), Some(user_id)) = (&self.budget, &meta.user_id) {
            budget.record_spend(user_id, cost, &params.model, meta.reserved);
        }
    }

    /// Fire-and-forget cache store.
    fn store_response(&self, meta: &RequestMeta, model: &str, text: &str, usage: Usage) {
        let Some(cache) = self.cache.clone() else {
            return;
        };
        if meta.user_text.is_empty() || text.is_empty() {
            return;
        }
        let prompt = meta.user_text.clone();
        let model = model.to_string();
        let text = text.to_string();
        let events = Arc::clone(&self.events);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                cache
                    .store(&prompt, &text, &model, usage.prompt_tokens, usage.completion_tokens)
                    .await;
                events.emit(ShieldEvent::CacheStore {
                    model,
                    input_tokens: usage.prompt_tokens,
                    output_tokens: usage.completion_tokens,
                });
            });
        }
    }

    /// Settlement for a stream on any exit path.
    fn settle_stream(
        &self,
        params: &GenerateParams,
        meta: &RequestMeta,
        text: &str,
        usage: StreamUsage,
        kind: SettleKind,
    ) {
        let cost = pricing::cost(&params.model, usage.input_tokens, usage.output_tokens);
        let as_usage = Usage::new(usage.input_tokens, usage.output_tokens);

        match kind {
            SettleKind::Complete => {
                self.events.emit(ShieldEvent::StreamComplete {
                    input_tokens: usage.input_tokens,
                    output_tokens: usage.output_tokens,
                    total_cost: cost,
                });
                // Only a complete response is safe to serve from cache.
                self.store_response(meta, &params.model, text, as_usage);
            }
            SettleKind::Abort => {
                self.events.emit(ShieldEvent::StreamAbort {
                    output_tokens: usage.output_tokens,
                    estimated_cost: cost,
                });
            }
        }

        self.record_ledger(meta, &params.model, as_usage, cost);
        self.report_usage(&params.model, as_usage, cost, meta.savings.total());

        if meta.guard_started {
            if let Some(guard) = &self.guard {
                guard.complete_request(
                    &meta.user_text,
                    usage.input_tokens,
                    usage.output_tokens,
                    Some(&params.model),
                );
            }
        }

        if cost > 0.0 {
            if let Some(breaker) = &self.breaker {
                breaker.record_spend(cost, &params.model);
            }
        }

        if let (Some(budget), Some(user_id)) = (&self.budget, &meta.user_id) {
            budget.record_spend(user_id, cost, &params.model, meta.reserved);
        }
    }
}

/// A model stream piped through the token tracker.
///
/// The `settled` flag guarantees settlement runs exactly once even when a
/// consumer cancellation (drop) races a terminal poll.
struct TrackedStream {
    shield: Arc<ShieldInner>,
    params: GenerateParams,
    meta: RequestMeta,
    tracker: StreamTokenTracker,
    source: ShieldStream,
    settled: bool,
}

impl TrackedStream {
    fn settle(&mut self, kind: SettleKind) {
        if self.settled {
            return;
        }
        self.settled = true;
        let usage = match kind {
            SettleKind::Complete => self.tracker.finish(),
            SettleKind::Abort => self.tracker.abort(),
        };
        let text = self.tracker.text().to_string();
        self.shield
            .settle_stream(&self.params, &self.meta, &text, usage, kind);
    }
}

impl Stream for TrackedStream {
    type Item = Result<StreamChunk>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.source.as_mut().poll_next(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(chunk))) => {
                if let StreamChunk::TextDelta { text_delta } = &chunk {
                    this.tracker.add_chunk(text_delta);
                    let live = this.tracker.usage();
                    this.shield.events.emit(ShieldEvent::StreamChunk {
                        output_tokens: live.output_tokens,
                        estimated_cost: live.estimated_cost,
                    });
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(err))) => {
                this.settle(SettleKind::Abort);
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                this.settle(SettleKind::Complete);
                Poll::Ready(None)
            }
        }
    }
}

impl Drop for TrackedStream {
    fn drop(&mut self) {
        // Consumer cancellation lands here; tokens already streamed are
        // still billed.
        self.settle(SettleKind::Abort);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{BreakerConfig, BreakerLimits};
    use crate::budget::{BudgetsConfig, UserBudget};
    use crate::config::UserIdResolver;
    use crate::router::RouterTier;
    use crate::types::Role;
    use futures::StreamExt;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn prompt(text: &str) -> Vec<PromptMessage> {
        vec![PromptMessage::text(Role::User, text)]
    }

    /// Guard off by default so repeat-prompt scenarios are not debounced;
    /// tests that exercise the guard re-enable it.
    fn base_config() -> ShieldConfig {
        let mut config = ShieldConfig::default();
        config.modules.guard = false;
        config
    }

    fn ok_result(text: &str, input: u64, output: u64) -> GenerateResult {
        GenerateResult::new(text, Usage::new(input, output), FinishReason::Stop)
    }

    async fn drain_spawned() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn budget_config(resolver: UserIdResolver, budgets: BudgetsConfig) -> UserBudgetConfig {
        UserBudgetConfig::new(resolver, budgets)
    }

    #[tokio::test]
    async fn test_cache_short_circuits_second_identical_request() {
        let shield = Shield::new(base_config()).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let params = GenerateParams::new("gpt-4o-mini", prompt("What is TypeScript?"));

        let request = shield.transform_params(params.clone()).await.unwrap();
        assert!(!request.is_cache_hit());
        let counter = Arc::clone(&calls);
        let first = shield
            .wrap_generate(request, move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(ok_result("TypeScript is JavaScript with types.", 12, 9))
            })
            .await
            .unwrap();
        drain_spawned().await;

        let request = shield.transform_params(params).await.unwrap();
        assert!(request.is_cache_hit());
        let counter = Arc::clone(&calls);
        let second = shield
            .wrap_generate(request, move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(ok_result("must not run", 1, 1))
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.text, first.text);
        assert_eq!(second.usage, Usage::new(0, 0));
        assert_eq!(second.finish_reason, FinishReason::Stop);
    }

    #[tokio::test]
    async fn test_breaker_trips_on_second_request() {
        let mut config = base_config();
        config.modules.cache = false;
        config.context.reserve_for_output = 10;
        config.breaker = Some(BreakerConfig {
            limits: BreakerLimits {
                per_session: Some(0.00001),
                ..Default::default()
            },
            ..Default::default()
        });
        let shield = Shield::new(config).unwrap();
        let params = GenerateParams::new("gpt-4o-mini", prompt("Hi"));

        let request = shield.transform_params(params.clone()).await.unwrap();
        shield
            .wrap_generate(request, || async { Ok(ok_result("Hello!", 9, 20)) })
            .await
            .unwrap();

        let err = shield.transform_params(params).await.unwrap_err();
        assert_eq!(err.block_code(), Some(BlockCode::BreakerSessionLimit));
        assert!(shield
            .events()
            .recent()
            .iter()
            .any(|e| matches!(e.event, ShieldEvent::BreakerTripped { .. })));
    }

    #[tokio::test]
    async fn test_breaker_warn_action_admits() {
        let mut config = base_config();
        config.modules.cache = false;
        config.context.reserve_for_output = 10;
        config.breaker = Some(BreakerConfig {
            limits: BreakerLimits {
                per_session: Some(0.00001),
                ..Default::default()
            },
            action: BreakerAction::Warn,
            persist: false,
        });
        let shield = Shield::new(config).unwrap();
        let params = GenerateParams::new("gpt-4o-mini", prompt("Hi"));

        let request = shield.transform_params(params.clone()).await.unwrap();
        shield
            .wrap_generate(request, || async { Ok(ok_result("Hello!", 9, 20)) })
            .await
            .unwrap();

        // Over the limit, but warn-mode lets it through.
        assert!(shield.transform_params(params).await.is_ok());
        assert!(shield
            .events()
            .recent()
            .iter()
            .any(|e| matches!(e.event, ShieldEvent::BreakerWarning { .. })));
    }

    #[tokio::test]
    async fn test_tier_pinned_model_applies() {
        let mut config = base_config();
        let resolver: UserIdResolver = Arc::new(|| Ok("u1".to_string()));
        let budgets = BudgetsConfig {
            users: HashMap::from([(
                "u1".to_string(),
                UserBudget::new(0.0, 0.0).with_tier("standard"),
            )]),
            tier_models: HashMap::from([(
                "standard".to_string(),
                "gpt-4o-mini".to_string(),
            )]),
            ..Default::default()
        };
        config.user_budget = Some(budget_config(resolver, budgets));
        let shield = Shield::new(config).unwrap();

        let request = shield
            .transform_params(GenerateParams::new("gpt-4o", prompt("Explain generics")))
            .await
            .unwrap();
        assert_eq!(request.params.model, "gpt-4o-mini");
    }

    #[tokio::test]
    async fn test_stream_cancellation_settles_once() {
        let mut config = base_config();
        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reports);
        config.on_usage = Some(Arc::new(move |report: &UsageReport| {
            sink.lock().unwrap().push(report.clone());
        }));
        let shield = Shield::new(config).unwrap();

        let request = shield
            .transform_params(GenerateParams::new("gpt-4o-mini", prompt("Tell me a story")))
            .await
            .unwrap();
        let mut stream = shield
            .wrap_stream(request, || async {
                let chunks: Vec<Result<StreamChunk>> = vec![
                    Ok(StreamChunk::TextDelta {
                        text_delta: "Once".to_string(),
                    }),
                    Ok(StreamChunk::TextDelta {
                        text_delta: " upon a time".to_string(),
                    }),
                    Ok(StreamChunk::Finish {
                        finish_reason: FinishReason::Stop,
                        usage: None,
                    }),
                ];
                Ok(Box::pin(futures::stream::iter(chunks)) as ShieldStream)
            })
            .await
            .unwrap();

        let first = stream.next().await.unwrap().unwrap();
        assert!(matches!(first, StreamChunk::TextDelta { .. }));
        drop(stream);

        let reports = reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].output_tokens >= 1);
        assert!(shield
            .events()
            .recent()
            .iter()
            .any(|e| matches!(e.event, ShieldEvent::StreamAbort { .. })));
    }

    #[tokio::test]
    async fn test_stream_completion_settles_and_caches() {
        let shield = Shield::new(base_config()).unwrap();
        let params = GenerateParams::new("gpt-4o-mini", prompt("Summarize streams"));

        let request = shield.transform_params(params.clone()).await.unwrap();
        let mut stream = shield
            .wrap_stream(request, || async {
                let chunks: Vec<Result<StreamChunk>> = vec![
                    Ok(StreamChunk::TextDelta {
                        text_delta: "Streams deliver ".to_string(),
                    }),
                    Ok(StreamChunk::TextDelta {
                        text_delta: "tokens incrementally.".to_string(),
                    }),
                    Ok(StreamChunk::Finish {
                        finish_reason: FinishReason::Stop,
                        usage: None,
                    }),
                ];
                Ok(Box::pin(futures::stream::iter(chunks)) as ShieldStream)
            })
            .await
            .unwrap();

        let mut text = String::new();
        while let Some(chunk) = stream.next().await {
            if let StreamChunk::TextDelta { text_delta } = chunk.unwrap() {
                text.push_str(&text_delta);
            }
        }
        drop(stream);
        drain_spawned().await;

        assert_eq!(text, "Streams deliver tokens incrementally.");
        assert!(shield
            .events()
            .recent()
            .iter()
            .any(|e| matches!(e.event, ShieldEvent::StreamComplete { .. })));

        // The completed stream response is served from cache next time.
        let request = shield.transform_params(params).await.unwrap();
        assert!(request.is_cache_hit());
        let mut cached = shield
            .wrap_stream(request, || async {
                Err::<ShieldStream, _>(Error::Internal(
                    "cache hit must not open a stream".to_string(),
                ))
            })
            .await
            .unwrap();
        let chunk = cached.next().await.unwrap().unwrap();
        assert_eq!(
            chunk,
            StreamChunk::TextDelta {
                text_delta: "Streams deliver tokens incrementally.".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_provider_error_releases_reservation() {
        let mut config = base_config();
        let resolver: UserIdResolver = Arc::new(|| Ok("u1".to_string()));
        let budgets = BudgetsConfig {
            users: HashMap::from([("u1".to_string(), UserBudget::new(10.0, 0.0))]),
            ..Default::default()
        };
        config.user_budget = Some(budget_config(resolver, budgets));
        let shield = Shield::new(config).unwrap();

        let request = shield
            .transform_params(GenerateParams::new("gpt-4o", prompt("A failing call")))
            .await
            .unwrap();
        assert!(shield.user_budgets().unwrap().inflight("u1") > 0.0);

        let err = shield
            .wrap_generate(request, || async {
                Err(Error::Internal("provider exploded".to_string()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
        assert_eq!(shield.user_budgets().unwrap().inflight("u1"), 0.0);
    }

    #[tokio::test]
    async fn test_generate_settles_budget_and_breaker() {
        let mut config = base_config();
        config.modules.cache = false;
        let resolver: UserIdResolver = Arc::new(|| Ok("u1".to_string()));
        let budgets = BudgetsConfig {
            users: HashMap::from([("u1".to_string(), UserBudget::new(10.0, 0.0))]),
            ..Default::default()
        };
        config.user_budget = Some(budget_config(resolver, budgets));
        config.breaker = Some(BreakerConfig {
            limits: BreakerLimits {
                per_session: Some(100.0),
                ..Default::default()
            },
            ..Default::default()
        });
        let shield = Shield::new(config).unwrap();

        let request = shield
            .transform_params(GenerateParams::new("gpt-4o", prompt("Record my spend")))
            .await
            .unwrap();
        shield
            .wrap_generate(request, || async {
                Ok(ok_result("done", 1_000, 500))
            })
            .await
            .unwrap();

        assert_eq!(shield.user_budgets().unwrap().inflight("u1"), 0.0);
        let expected = pricing::cost("gpt-4o", 1_000, 500);
        let status = shield.user_budgets().unwrap().status("u1");
        assert!((status.spend.daily - expected).abs() < 1e-12);
        assert!((shield.breaker().unwrap().session_spend() - expected).abs() < 1e-12);

        let entries = shield.ledger().unwrap().entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].input_tokens, 1_000);
        assert!((entries[0].cost - expected).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_invalid_user_id_blocks() {
        for resolver in [
            Arc::new(|| Err::<String, Error>(Error::Internal("no session".to_string())))
                as UserIdResolver,
            Arc::new(|| Ok::<String, Error>(String::new())) as UserIdResolver,
        ] {
            let mut config = base_config();
            config.user_budget = Some(budget_config(resolver, BudgetsConfig::default()));
            let shield = Shield::new(config).unwrap();

            let err = shield
                .transform_params(GenerateParams::new("gpt-4o", prompt("hello")))
                .await
                .unwrap_err();
            assert_eq!(err.block_code(), Some(BlockCode::BudgetUserIdInvalid));
        }
    }

    #[tokio::test]
    async fn test_guard_denial_releases_reservation_and_notifies() {
        let mut config = base_config();
        config.modules.guard = true;
        config.guard.min_input_length = 50;

        let blocked = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&blocked);
        config.on_blocked = Some(Arc::new(move |info: &BlockedInfo| {
            sink.lock().unwrap().push(info.clone());
        }));

        let resolver: UserIdResolver = Arc::new(|| Ok("u1".to_string()));
        let budgets = BudgetsConfig {
            users: HashMap::from([("u1".to_string(), UserBudget::new(10.0, 0.0))]),
            ..Default::default()
        };
        config.user_budget = Some(budget_config(resolver, budgets));
        let shield = Shield::new(config).unwrap();

        let err = shield
            .transform_params(GenerateParams::new("gpt-4o", prompt("too short")))
            .await
            .unwrap_err();
        assert_eq!(err.block_code(), Some(BlockCode::GuardRateLimit));
        assert_eq!(shield.user_budgets().unwrap().inflight("u1"), 0.0);

        let blocked = blocked.lock().unwrap();
        assert_eq!(blocked.len(), 1);
        assert_eq!(blocked[0].code, BlockCode::GuardRateLimit);
    }

    #[tokio::test]
    async fn test_user_budget_denial_blocks_with_code() {
        let mut config = base_config();
        let resolver: UserIdResolver = Arc::new(|| Ok("u1".to_string()));
        let budgets = BudgetsConfig {
            users: HashMap::from([("u1".to_string(), UserBudget::new(0.0000001, 0.0))]),
            ..Default::default()
        };
        config.user_budget = Some(budget_config(resolver, budgets));
        let shield = Shield::new(config).unwrap();

        let err = shield
            .transform_params(GenerateParams::new("gpt-4o", prompt("a costly question")))
            .await
            .unwrap_err();
        assert_eq!(err.block_code(), Some(BlockCode::BudgetDailyExceeded));
        // Denied requests leave nothing reserved.
        assert_eq!(shield.user_budgets().unwrap().inflight("u1"), 0.0);
    }

    #[tokio::test]
    async fn test_context_trim_emits_event_and_savings() {
        let mut config = base_config();
        config.context.max_input_tokens = Some(60);
        config.context.reserve_for_output = 10;
        let shield = Shield::new(config).unwrap();

        let long_turn = "an earlier exchange that goes on for quite a while. ".repeat(8);
        let params = GenerateParams::new(
            "gpt-4o",
            vec![
                PromptMessage::text(Role::System, "You are terse."),
                PromptMessage::text(Role::User, &long_turn),
                PromptMessage::text(Role::Assistant, &long_turn),
                PromptMessage::text(Role::User, "What is the answer?"),
            ],
        );

        let request = shield.transform_params(params).await.unwrap();
        assert!(request.meta.final_input_tokens <= 50);
        assert!(request.meta.savings.context > 0.0);
        assert!(shield
            .events()
            .recent()
            .iter()
            .any(|e| matches!(e.event, ShieldEvent::ContextTrimmed { .. })));
    }

    #[tokio::test]
    async fn test_router_downgrades_simple_prompt() {
        let mut config = base_config();
        config.modules.router = true;
        config.router.tiers = vec![
            RouterTier {
                model_id: "gpt-4o-mini".to_string(),
                max_complexity: 50,
            },
            RouterTier {
                model_id: "gpt-4o".to_string(),
                max_complexity: 100,
            },
        ];
        let shield = Shield::new(config).unwrap();

        let request = shield
            .transform_params(GenerateParams::new("gpt-4o", prompt("Hi there")))
            .await
            .unwrap();
        assert_eq!(request.params.model, "gpt-4o-mini");
        assert!(request.meta.savings.router > 0.0);
        assert!(shield
            .events()
            .recent()
            .iter()
            .any(|e| matches!(e.event, ShieldEvent::RouterDowngraded { .. })));
    }

    #[tokio::test]
    async fn test_prefix_marker_on_repeat_call() {
        let shield = Shield::new(base_config()).unwrap();
        let conversation = |question: &str| {
            GenerateParams::new(
                "gpt-4o",
                vec![
                    PromptMessage::text(Role::System, "You answer questions about one document."),
                    PromptMessage::text(Role::User, question),
                ],
            )
        };

        let first = shield.transform_params(conversation("First question?")).await.unwrap();
        assert!(first.prefix_marker.is_none());

        let second = shield
            .transform_params(conversation("Second question?"))
            .await
            .unwrap();
        let marker = second.prefix_marker.expect("stable system head");
        assert_eq!(marker.stable_messages, 1);
        assert!(second.meta.savings.prefix > 0.0);
    }

    #[tokio::test]
    async fn test_cache_hit_reports_zero_cost_usage_with_savings() {
        let mut config = base_config();
        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reports);
        config.on_usage = Some(Arc::new(move |report: &UsageReport| {
            sink.lock().unwrap().push(report.clone());
        }));
        let shield = Shield::new(config).unwrap();
        let params = GenerateParams::new("gpt-4o", prompt("How do I configure my database connection?"));

        let request = shield.transform_params(params.clone()).await.unwrap();
        shield
            .wrap_generate(request, || async {
                Ok(ok_result("Use a connection string.", 10, 20))
            })
            .await
            .unwrap();
        drain_spawned().await;

        let request = shield.transform_params(params).await.unwrap();
        shield
            .wrap_generate(request, || async {
                Err::<GenerateResult, _>(Error::Internal("must not run".to_string()))
            })
            .await
            .unwrap();

        let reports = reports.lock().unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[1].cost, 0.0);
        assert_eq!(reports[1].input_tokens, 0);
        // The saved amount is the cost of the original call's tokens.
        let expected = pricing::cost("gpt-4o", 10, 20);
        assert!((reports[1].saved - expected).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_guard_in_flight_cleared_on_all_paths() {
        let mut config = base_config();
        config.modules.guard = true;
        config.guard.debounce_ms = 0;
        let shield = Shield::new(config).unwrap();

        // Success path
        let request = shield
            .transform_params(GenerateParams::new("gpt-4o", prompt("first question")))
            .await
            .unwrap();
        shield
            .wrap_generate(request, || async { Ok(ok_result("ok", 5, 5)) })
            .await
            .unwrap();
        assert_eq!(shield.guard().unwrap().stats().in_flight, 0);

        // Failure path
        let request = shield
            .transform_params(GenerateParams::new("gpt-4o", prompt("second question")))
            .await
            .unwrap();
        let _ = shield
            .wrap_generate(request, || async {
                Err::<GenerateResult, _>(Error::Internal("boom".to_string()))
            })
            .await;
        assert_eq!(shield.guard().unwrap().stats().in_flight, 0);
    }

    #[tokio::test]
    async fn test_mid_stream_error_surfaces_after_settlement() {
        let mut config = base_config();
        let resolver: UserIdResolver = Arc::new(|| Ok("u1".to_string()));
        let budgets = BudgetsConfig {
            users: HashMap::from([("u1".to_string(), UserBudget::new(10.0, 0.0))]),
            ..Default::default()
        };
        config.user_budget = Some(budget_config(resolver, budgets));
        let shield = Shield::new(config).unwrap();

        let request = shield
            .transform_params(GenerateParams::new("gpt-4o", prompt("stream then fail")))
            .await
            .unwrap();
        let mut stream = shield
            .wrap_stream(request, || async {
                let chunks: Vec<Result<StreamChunk>> = vec![
                    Ok(StreamChunk::TextDelta {
                        text_delta: "partial".to_string(),
                    }),
                    Err(Error::Internal("connection reset".to_string())),
                ];
                Ok(Box::pin(futures::stream::iter(chunks)) as ShieldStream)
            })
            .await
            .unwrap();

        assert!(stream.next().await.unwrap().is_ok());
        assert!(stream.next().await.unwrap().is_err());
        drop(stream);

        // Settled exactly once, reservation gone, streamed tokens billed.
        assert_eq!(shield.user_budgets().unwrap().inflight("u1"), 0.0);
        let status = shield.user_budgets().unwrap().status("u1");
        assert!(status.spend.daily > 0.0);
        let aborts = shield
            .events()
            .recent()
            .iter()
            .filter(|e| matches!(e.event, ShieldEvent::StreamAbort { .. }))
            .count();
        assert_eq!(aborts, 1);
    }
}
