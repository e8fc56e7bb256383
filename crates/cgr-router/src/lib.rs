// SPDX-License-Identifier: MIT OR Apache-2.0
//! Invocation pipeline, batch and compose operations (C8) — the composition
//! root that wires every other crate into the nine-step `invoke` pipeline,
//! plus the discovery and control surfaces spec §6 hangs off it.
//!
//! [`Services`] owns one instance of every subsystem (registry, metrics,
//! cache, rate limiter, circuit breaker, queue, executors, receipts,
//! activity feed, trust network, log ring) the way `abp-runtime`'s
//! `Runtime` owns its backend registry, metrics, and receipt chain. There is
//! no global state: a transport layer (`cgr-daemon`, `cgr-cli`) builds one
//! `Services`, registers capabilities and executors during startup, wraps it
//! in an `Arc`, and calls `invoke`/`batch`/`compose` for the lifetime of the
//! process.
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod batch;

pub use batch::{
    BatchItemOutcome, BatchResponse, ComposeRequest, ComposeResponse, ComposeStep,
    ComposeStepOutcome, MAX_BATCH_SIZE,
};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cgr_activity::{ActivityFeed, EventFilter, EventType, Visibility};
use cgr_cache::{Cache, CacheKey, CacheStats};
use cgr_circuit::{CircuitBreaker, State as CircuitState};
use cgr_config::GatewayConfig;
use cgr_core::{
    sha256_hex, CapabilityDescriptor, InvocationErrorView, InvocationRequest, InvocationResult,
    Priority, TrustLevel,
};
use cgr_error::GatewayError;
use cgr_executor::{Executor, ExecutorOutput, ExecutorRegistry};
use cgr_identity::{ActivityKind, TrustNetwork};
use cgr_metrics::{MetricsCollector, SystemSummary};
use cgr_observability::{Level as LogLevel, LogRing};
use cgr_queue::{DedupOutcome, LevelConfig, Queue, QueueConfig};
use cgr_receipt::{hash_value, ReceiptBuilder};
use cgr_receipt_store::{EwmaReputationScorer, ReputationScorer, UsageMeta};
use cgr_registry::{ListFilter, Registry, RegistrySummary};
use serde::{Deserialize, Serialize};
use serde_json::json;

const ANONYMOUS: &str = "anonymous";

/// Memory-pressure threshold above which only `Critical` priority is still
/// admitted, per spec §5.
const MEMORY_CRITICAL_ONLY_PCT: f64 = 95.0;

/// Aggregate health snapshot returned by `get_system_health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemHealth {
    /// `"healthy"`, `"degraded"`, or `"critical"`, derived from heap pressure.
    pub status: String,
    /// Seconds since this `Services` was constructed.
    pub uptime_seconds: u64,
    /// Current adaptive load factor in effect for rate limiting.
    pub load_factor: f64,
    /// Last-sampled memory pressure.
    pub memory: MemoryHealth,
    /// Response cache counters.
    pub cache: CacheStats,
    /// Request-volume counters.
    pub requests: RequestHealth,
    /// Latency counters.
    pub performance: PerformanceHealth,
}

/// Last-sampled memory pressure signal, per spec §5's memory supervisor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MemoryHealth {
    /// Heap occupancy, as a percentage.
    pub heap_pct: f64,
}

/// Request-volume counters surfaced by `get_system_health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestHealth {
    /// Total invocations recorded across every capability.
    pub total: u64,
    /// Requests recorded in the last 60 seconds.
    pub rpm: usize,
}

/// Latency counters surfaced by `get_system_health`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PerformanceHealth {
    /// Last-sampled average latency in milliseconds, as fed to the rate
    /// limiter's load factor.
    pub avg_latency_ms: f64,
}

/// `{descriptor, sponsor}` as returned by `get_capability`. "Sponsor" is the
/// first provider hint on the descriptor's metadata, if any — descriptors
/// carry no dedicated sponsor field, so this is the closest standing-in
/// piece of provenance a registrant can attach (see `DESIGN.md`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityView {
    /// The registered descriptor.
    pub descriptor: CapabilityDescriptor,
    /// Provider hint taken as the capability's sponsor, if one was supplied.
    pub sponsor: Option<String>,
}

/// Composition root: one instance of every subsystem, wired together and
/// exposed through `invoke`/`batch`/`compose` plus the discovery and
/// control surfaces of spec §6.
///
/// Registration (`register_capability`, `register_executor`) happens once
/// during startup, before the caller wraps this in an `Arc` and hands it to
/// a transport layer; every other method takes `&self` and is safe to call
/// concurrently from many tasks.
pub struct Services {
    config: GatewayConfig,
    registry: Registry,
    executors: ExecutorRegistry,
    metrics: MetricsCollector,
    cache: Cache,
    rate_limiter: cgr_ratelimit::RateLimiter,
    circuit: CircuitBreaker,
    queue: Queue<InvocationResult>,
    identity: TrustNetwork,
    activity: ActivityFeed,
    reputation: EwmaReputationScorer,
    logs: LogRing,
    started_at: Instant,
    heap_pct_bits: AtomicU64,
    avg_latency_bits: AtomicU64,
}

impl Services {
    /// Build every subsystem from `config`. Registries start empty; call
    /// [`Services::register_capability`] and [`Services::register_executor`]
    /// before serving traffic.
    #[must_use]
    pub fn new(config: GatewayConfig) -> Self {
        let queue_config = QueueConfig {
            critical: LevelConfig {
                concurrency: 16,
                max_depth: config.queue_max_depth.critical as usize,
            },
            high: LevelConfig {
                concurrency: 8,
                max_depth: config.queue_max_depth.high as usize,
            },
            normal: LevelConfig {
                concurrency: 32,
                max_depth: config.queue_max_depth.normal as usize,
            },
            low: LevelConfig {
                concurrency: 4,
                max_depth: config.queue_max_depth.low as usize,
            },
            starvation_guard: Duration::from_secs(config.queue_starvation_guard_secs),
        };
        Self {
            registry: Registry::new(),
            executors: ExecutorRegistry::new(),
            metrics: MetricsCollector::new(),
            cache: Cache::new(config.cache_max_entries),
            rate_limiter: cgr_ratelimit::RateLimiter::new(
                config.rate_limit_global_max,
                Duration::from_millis(config.rate_limit_window_ms),
            ),
            circuit: CircuitBreaker::new(
                config.circuit_failure_threshold,
                Duration::from_millis(config.circuit_cooldown_ms),
            ),
            queue: Queue::new(queue_config),
            identity: TrustNetwork::new(),
            activity: ActivityFeed::new(config.activity_max_events, config.activity_ttl_ms),
            reputation: EwmaReputationScorer::new(),
            logs: LogRing::new(1000),
            started_at: Instant::now(),
            heap_pct_bits: AtomicU64::new(0.0f64.to_bits()),
            avg_latency_bits: AtomicU64::new(0.0f64.to_bits()),
            config,
        }
    }

    /// Register a descriptor. Startup only.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError`] if the id is malformed or already registered.
    pub fn register_capability(&mut self, descriptor: CapabilityDescriptor) -> Result<(), GatewayError> {
        self.registry.register(descriptor).map_err(Into::into)
    }

    /// Register an executor. Startup only.
    pub fn register_executor(&mut self, executor: Arc<dyn Executor>) {
        self.executors.register(executor);
    }

    /// Register an agent identity. Startup or admin tooling only.
    ///
    /// # Errors
    ///
    /// Returns an error if `api_key` is already bound to a different agent.
    pub fn register_agent(
        &self,
        agent_id: impl Into<String>,
        api_key: Option<&str>,
        baseline_trust_level: TrustLevel,
    ) -> Result<(), cgr_identity::IdentityError> {
        self.identity.register(agent_id, api_key, baseline_trust_level)
    }

    /// The capability registry, for read-only inspection.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The metrics collector, for read-only inspection.
    #[must_use]
    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// The activity feed, for subscribing or querying directly.
    #[must_use]
    pub fn activity(&self) -> &ActivityFeed {
        &self.activity
    }

    /// The trust network, for read-only inspection.
    #[must_use]
    pub fn identity(&self) -> &TrustNetwork {
        &self.identity
    }

    /// The log ring, for `/logs`-style introspection.
    #[must_use]
    pub fn logs(&self) -> &LogRing {
        &self.logs
    }

    /// The loaded configuration.
    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Feed a fresh heap/latency pressure sample into the adaptive load
    /// factor and this service's own health snapshot. Intended to be
    /// called periodically by a detached supervisor task owned by the
    /// composition root (see spec §9's note on supervised timers); this
    /// crate does not spawn that task itself.
    pub fn update_load(&self, heap_pct: f64, avg_latency_ms: f64) {
        self.rate_limiter.update_load(heap_pct, avg_latency_ms);
        self.heap_pct_bits.store(heap_pct.to_bits(), Ordering::Relaxed);
        self.avg_latency_bits
            .store(avg_latency_ms.to_bits(), Ordering::Relaxed);
    }

    /// Derive a pressure sample from in-process signals: cache occupancy
    /// as a heap proxy (this gateway hooks no allocator directly) and the
    /// metrics collector's system-wide average latency. Intended to be
    /// polled periodically by the composition root's supervisor task and
    /// fed into [`Services::update_load`]; see that method's doc comment.
    #[must_use]
    pub fn sample_pressure(&self) -> (f64, f64) {
        let heap_pct = if self.config.cache_max_entries == 0 {
            0.0
        } else {
            let size = self.cache.stats().size as f64;
            (size / self.config.cache_max_entries as f64 * 100.0).min(100.0)
        };
        (heap_pct, self.metrics.avg_latency_ms())
    }

    fn heap_pct(&self) -> f64 {
        f64::from_bits(self.heap_pct_bits.load(Ordering::Relaxed))
    }

    fn avg_latency_ms(&self) -> f64 {
        f64::from_bits(self.avg_latency_bits.load(Ordering::Relaxed))
    }

    /// Administrative reset of a capability's circuit breaker.
    pub fn reset_circuit_breaker(&self, capability_id: &str) {
        self.circuit.reset(capability_id);
    }

    /// List registered descriptors, optionally filtered by tag and/or mode.
    #[must_use]
    pub fn list_capabilities(&self, filter: &ListFilter) -> Vec<CapabilityDescriptor> {
        self.registry.list(filter).into_iter().cloned().collect()
    }

    /// Fetch one descriptor plus its sponsor, if registered.
    #[must_use]
    pub fn get_capability(&self, capability_id: &str) -> Option<CapabilityView> {
        let descriptor = self.registry.get(capability_id)?.clone();
        let sponsor = descriptor.metadata.provider_hints.first().cloned();
        Some(CapabilityView { descriptor, sponsor })
    }

    /// Aggregate registry counts: totals, public/confidential split, tag histogram.
    #[must_use]
    pub fn capabilities_summary(&self) -> RegistrySummary {
        self.registry.summary()
    }

    /// Metrics for one capability, or the system-wide summary when `capability_id` is `None`.
    #[must_use]
    pub fn get_metrics(&self, capability_id: Option<&str>) -> serde_json::Value {
        match capability_id {
            Some(id) => self
                .metrics
                .get(id)
                .map(|cell| serde_json::to_value(cell).unwrap_or(serde_json::Value::Null))
                .unwrap_or(serde_json::Value::Null),
            None => serde_json::to_value(self.system_metrics()).unwrap_or(serde_json::Value::Null),
        }
    }

    fn system_metrics(&self) -> SystemSummary {
        self.metrics.system()
    }

    /// System health snapshot per spec §6: status, uptime, load factor,
    /// memory/cache/request/performance counters.
    #[must_use]
    pub fn system_health(&self) -> SystemHealth {
        let heap_pct = self.heap_pct();
        let status = if heap_pct > MEMORY_CRITICAL_ONLY_PCT {
            "critical"
        } else if heap_pct > 85.0 {
            "degraded"
        } else {
            "healthy"
        };
        let system = self.system_metrics();
        SystemHealth {
            status: status.to_string(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
            load_factor: self.rate_limiter.load_factor().value(),
            memory: MemoryHealth { heap_pct },
            cache: self.cache.stats(),
            requests: RequestHealth {
                total: system.total,
                rpm: system.rpm,
            },
            performance: PerformanceHealth {
                avg_latency_ms: self.avg_latency_ms(),
            },
        }
    }

    fn log_rejection(&self, kind: cgr_error::ErrorKind, capability_id: &str, agent_id: &str, message: &str) {
        self.logs.log(
            LogLevel::Warn,
            "router",
            message,
            json!({ "capability_id": capability_id, "agent_id": agent_id, "kind": kind.as_str() }),
        );
    }

    fn record_rejection_activity(&self, capability_id: &str, agent_id: &str, reason: &str) {
        self.activity.record(
            EventType::CapabilityRejected,
            (agent_id != ANONYMOUS).then(|| agent_id.to_string()),
            json!({ "capability_id": capability_id, "reason": reason }),
            Visibility::Public,
        );
    }

    /// Run the full nine-step invocation pipeline for one request: identify,
    /// rate gate, circuit gate, policy gate, cache probe, queue admission
    /// with dedup, execute under a deadline, emit receipt/usage/activity/log
    /// artefacts, and return the reply shape.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError`] for every rejection (unknown capability,
    /// rate limited, circuit open, forbidden, queue saturated, no eligible
    /// executor). A rejection never produces a receipt; every path that
    /// reaches the executor does, success or failure.
    pub async fn invoke(&self, request: InvocationRequest) -> Result<InvocationResult, GatewayError> {
        // Step 1: identify. Unknown or unresolved callers are anonymous.
        let resolved = self.identity.resolve(None, request.caller_identity.as_deref());
        let (agent_id, trust_level) = match &resolved {
            Some(r) => (r.agent_id.clone(), r.trust_level),
            None => (ANONYMOUS.to_string(), TrustLevel::Anonymous),
        };

        let descriptor = self
            .registry
            .get(&request.capability_id)
            .cloned()
            .ok_or_else(|| {
                let err = GatewayError::not_found(&request.capability_id);
                self.log_rejection(err.kind, &request.capability_id, &agent_id, "unknown capability");
                err
            })?;

        // Memory pressure gate (spec §5): above 95% heap, only Critical is admitted.
        if self.heap_pct() > MEMORY_CRITICAL_ONLY_PCT && request.priority != Priority::Critical {
            let err = GatewayError::service_unavailable("memory pressure: only critical priority admitted")
                .with_details(json!({ "heap_pct": self.heap_pct() }));
            self.log_rejection(err.kind, &descriptor.id, &agent_id, "rejected under memory pressure");
            return Err(err);
        }

        // Cache probe is computed here, ahead of the rate gate, purely so
        // `cache_hits_consume_quota = false` can skip charging quota for a
        // request that is about to be served from cache. It is still
        // logically step 5 for metrics/receipt purposes below.
        let cache_key = if request.no_cache {
            None
        } else {
            CacheKey::new(&descriptor.id, &request.inputs).ok()
        };
        let cached = cache_key.as_ref().and_then(|k| self.cache.get(k));

        // Step 2: rate gate.
        if self.config.cache_hits_consume_quota || cached.is_none() {
            if let Err(err) = self.rate_limiter.check_and_consume(
                cgr_ratelimit::Scope::Global,
                "global",
                TrustLevel::Anonymous,
            ) {
                self.log_rejection(err.kind, &descriptor.id, &agent_id, "global rate limit exceeded");
                self.record_rejection_activity(&descriptor.id, &agent_id, "rate_limited");
                return Err(err);
            }
            if let Err(err) =
                self.rate_limiter
                    .check_and_consume(cgr_ratelimit::Scope::Identity, &agent_id, trust_level)
            {
                self.log_rejection(err.kind, &descriptor.id, &agent_id, "identity rate limit exceeded");
                self.record_rejection_activity(&descriptor.id, &agent_id, "rate_limited");
                return Err(err);
            }
        }

        // Step 3: circuit gate.
        if !self.circuit.allow_request(&descriptor.id) {
            let err = GatewayError::service_unavailable("circuit open")
                .with_details(json!({ "reason": "circuit_open", "capability_id": descriptor.id }));
            self.log_rejection(err.kind, &descriptor.id, &agent_id, "circuit open");
            self.record_rejection_activity(&descriptor.id, &agent_id, "circuit_open");
            return Err(err);
        }

        // Step 4: policy gate. Confidential capabilities require a resolved,
        // non-anonymous identity — this gateway has no separate handshake or
        // capability-token primitive, so a resolved identity stands in for
        // "completed handshake or valid capability token" (see DESIGN.md).
        if descriptor.execution.mode == cgr_core::ExecutionMode::Confidential
            && trust_level == TrustLevel::Anonymous
        {
            let err = GatewayError::forbidden(format!(
                "confidential capability '{}' requires a resolved identity",
                descriptor.id
            ));
            self.log_rejection(err.kind, &descriptor.id, &agent_id, "confidential capability denied");
            // Per spec's confidential-without-handshake scenario, this
            // particular rejection is not published to the activity feed.
            return Err(err);
        }

        if descriptor.deprecated {
            self.logs.log(
                LogLevel::Warn,
                "router",
                "invoking deprecated capability",
                json!({ "capability_id": descriptor.id }),
            );
        }

        let inputs_hash = hash_value(&request.inputs).unwrap_or_default();

        // Step 5: cache probe result.
        if let Some(cached_value) = cached {
            let outputs = cached_value.get("outputs").cloned().unwrap_or(serde_json::Value::Null);
            let proof = cached_value.get("proof").cloned().filter(|v| !v.is_null());
            let executor_id = cached_value
                .get("executor_id")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string();
            let outputs_hash = hash_value(&outputs).unwrap_or_default();

            let receipt = ReceiptBuilder::new(descriptor.id.clone(), executor_id.clone())
                .inputs_hash(inputs_hash)
                .outputs_hash(outputs_hash)
                .privacy_level(descriptor.execution.mode)
                .duration_ms(0)
                .success(true)
                .proof(proof)
                .cost_actual(0.0)
                .agent_id((agent_id != ANONYMOUS).then(|| agent_id.clone()))
                .cache_hit(true)
                .build();

            // A cache hit is not an executor outcome and must not influence
            // the breaker — in particular it must never close a half-open
            // probe that the executor itself never exercised.
            self.metrics.record(&descriptor.id, true, 0, 0.0);
            self.identity
                .record_activity(&agent_id, ActivityKind::Invocation, true, &descriptor.id);
            self.reputation.record(&UsageMeta {
                capability_id: descriptor.id.clone(),
                success: true,
                latency_ms: 0,
                executor_id,
                privacy_level: descriptor.execution.mode,
                proof_type: descriptor.execution.proof_type.clone(),
                cost: 0.0,
                timestamp: receipt.timestamp,
                agent_id: (agent_id != ANONYMOUS).then(|| agent_id.clone()),
            });
            self.activity.record(
                EventType::CapabilityInvoked,
                (agent_id != ANONYMOUS).then(|| agent_id.clone()),
                json!({ "capability_id": descriptor.id, "cache_hit": true }),
                Visibility::Public,
            );

            return Ok(InvocationResult {
                success: true,
                outputs: Some(outputs),
                error: None,
                receipt: serde_json::to_value(&receipt).unwrap_or(serde_json::Value::Null),
                cost_actual: 0.0,
                execution_ms: 0,
            });
        }

        // Step 6: admit to queue, deduplicating on the inflight key.
        let inflight_key = request
            .dedup_key
            .clone()
            .or_else(|| cgr_core::inflight_key(&descriptor.id, &request.inputs).ok())
            .unwrap_or_else(|| sha256_hex(descriptor.id.as_bytes()));

        match self.queue.dedup_enter(&inflight_key) {
            DedupOutcome::Follow(mut rx) => rx
                .recv()
                .await
                .map_err(|_| GatewayError::internal("dedup leader dropped without completing")),
            DedupOutcome::Lead(guard) => {
                let executor_hint = request
                    .preferences
                    .get("executor_hint")
                    .and_then(|v| v.as_str())
                    .or(descriptor.execution.executor_hint.as_deref());
                let executor = match self.executors.select(&descriptor, executor_hint) {
                    Ok(executor) => executor,
                    Err(err) => {
                        self.log_rejection(err.kind, &descriptor.id, &agent_id, "no eligible executor");
                        self.circuit.release_probe(&descriptor.id);
                        drop(guard);
                        return Err(err);
                    }
                };

                let (_ticket, queue_wait) = match self.queue.admit(request.priority, std::future::pending()).await
                {
                    Ok(admitted) => admitted,
                    Err(err) => {
                        self.log_rejection(err.kind, &descriptor.id, &agent_id, "queue saturated");
                        self.circuit.release_probe(&descriptor.id);
                        drop(guard);
                        return Err(err);
                    }
                };

                let deadline = request
                    .preferences
                    .get("deadline_ms")
                    .and_then(serde_json::Value::as_u64)
                    .map(Duration::from_millis)
                    .unwrap_or_else(|| descriptor.performance.latency_hint.default_timeout());

                let exec_start = Instant::now();
                let before = self.circuit.snapshot(&descriptor.id);
                let outcome = tokio::time::timeout(
                    deadline,
                    executor.execute(&descriptor, request.inputs.clone()),
                )
                .await;
                let execution_ms = exec_start.elapsed().as_millis() as u64;

                let result = self.finalize_execution(
                    &descriptor,
                    &agent_id,
                    executor.id(),
                    inputs_hash,
                    outcome,
                    queue_wait.as_millis() as u64,
                    execution_ms,
                    cache_key.as_ref(),
                );
                let after = self.circuit.snapshot(&descriptor.id);
                self.record_circuit_transition(&descriptor.id, before.state, after.state);

                guard.complete(result.clone());
                Ok(result)
            }
        }
    }

    fn record_circuit_transition(&self, capability_id: &str, before: CircuitState, after: CircuitState) {
        if before == after {
            return;
        }
        match after {
            CircuitState::Open => {
                self.activity.record(
                    EventType::CircuitOpened,
                    None,
                    json!({ "capability_id": capability_id }),
                    Visibility::Public,
                );
            }
            CircuitState::Closed => {
                self.activity.record(
                    EventType::CircuitClosed,
                    None,
                    json!({ "capability_id": capability_id }),
                    Visibility::Public,
                );
            }
            CircuitState::HalfOpen => {}
        }
    }

    /// Classify the executor's outcome, update metrics/breaker/cache/trust,
    /// emit the receipt and activity artefacts, and return the reply shape.
    /// Called only once the executor has actually been reached — gate
    /// rejections never reach this function and never produce a receipt.
    #[allow(clippy::too_many_arguments)]
    fn finalize_execution(
        &self,
        descriptor: &CapabilityDescriptor,
        agent_id: &str,
        executor_id: &str,
        inputs_hash: String,
        outcome: Result<Result<ExecutorOutput, GatewayError>, tokio::time::error::Elapsed>,
        queue_wait_ms: u64,
        execution_ms: u64,
        cache_key: Option<&CacheKey>,
    ) -> InvocationResult {
        let (success, outputs, error, cost_actual, proof, partial_outputs) = match outcome {
            Ok(Ok(output)) => (
                true,
                Some(output.outputs),
                None,
                output.cost_actual,
                output.proof,
                None,
            ),
            Ok(Err(err)) => {
                if err.kind.charges_circuit_breaker() {
                    self.circuit.record_failure(&descriptor.id);
                } else {
                    self.circuit.record_success(&descriptor.id);
                }
                let details = err.details.clone();
                let partial = details.get("partial_outputs").cloned();
                (
                    false,
                    None,
                    Some(InvocationErrorView {
                        kind: err.kind.as_str().to_string(),
                        message: err.message.clone(),
                        details,
                    }),
                    0.0,
                    None,
                    partial,
                )
            }
            Err(_elapsed) => {
                self.circuit.record_failure(&descriptor.id);
                (
                    false,
                    None,
                    Some(InvocationErrorView {
                        kind: cgr_error::ErrorKind::Timeout.as_str().to_string(),
                        message: "invocation deadline exceeded".to_string(),
                        details: json!({ "capability_id": descriptor.id }),
                    }),
                    0.0,
                    None,
                    None,
                )
            }
        };

        if success {
            self.circuit.record_success(&descriptor.id);
        }

        let outputs_hash = outputs
            .as_ref()
            .map(hash_value)
            .transpose()
            .unwrap_or(None)
            .unwrap_or_else(|| hash_value(&serde_json::Value::Object(Default::default())).unwrap_or_default());

        let receipt = ReceiptBuilder::new(descriptor.id.clone(), executor_id.to_string())
            .inputs_hash(inputs_hash)
            .outputs_hash(outputs_hash)
            .privacy_level(descriptor.execution.mode)
            .duration_ms(execution_ms)
            .success(success)
            .proof(proof)
            .cost_actual(cost_actual)
            .agent_id((agent_id != ANONYMOUS).then(|| agent_id.to_string()))
            .cache_hit(false)
            .partial_outputs(partial_outputs)
            .build();

        self.metrics.record(&descriptor.id, success, execution_ms, cost_actual);
        self.identity
            .record_activity(agent_id, ActivityKind::Invocation, success, &descriptor.id);
        self.reputation.record(&UsageMeta {
            capability_id: descriptor.id.clone(),
            success,
            latency_ms: execution_ms,
            executor_id: executor_id.to_string(),
            privacy_level: descriptor.execution.mode,
            proof_type: descriptor.execution.proof_type.clone(),
            cost: cost_actual,
            timestamp: receipt.timestamp,
            agent_id: (agent_id != ANONYMOUS).then(|| agent_id.to_string()),
        });

        if success {
            if let (Some(key), Some(outputs)) = (cache_key, outputs.as_ref()) {
                self.write_cache_if_successful(
                    key,
                    outputs,
                    receipt.proof.as_ref(),
                    executor_id,
                    cost_actual,
                );
            }
        }

        self.activity.record(
            EventType::CapabilityInvoked,
            (agent_id != ANONYMOUS).then(|| agent_id.to_string()),
            json!({
                "capability_id": descriptor.id,
                "success": success,
                "cache_hit": false,
                "queue_wait_ms": queue_wait_ms,
            }),
            Visibility::Public,
        );

        self.logs.log(
            if success { LogLevel::Info } else { LogLevel::Warn },
            "router",
            if success { "invocation succeeded" } else { "invocation failed" },
            json!({
                "capability_id": descriptor.id,
                "agent_id": agent_id,
                "queue_wait_ms": queue_wait_ms,
                "execution_ms": execution_ms,
            }),
        );

        InvocationResult {
            success,
            outputs,
            error,
            receipt: serde_json::to_value(&receipt).unwrap_or(serde_json::Value::Null),
            cost_actual,
            execution_ms,
        }
    }

    fn write_cache_if_successful(
        &self,
        key: &CacheKey,
        outputs: &serde_json::Value,
        proof: Option<&serde_json::Value>,
        executor_id: &str,
        cost_actual: f64,
    ) {
        let envelope = json!({
            "outputs": outputs,
            "proof": proof,
            "executor_id": executor_id,
            "cost_actual": cost_actual,
        });
        self.cache
            .set(key, envelope, Duration::from_millis(self.config.cache_default_ttl_ms));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgr_core::{
        DescriptorMetadata, Economics, ExecutionMode, ExecutionSpec, LatencyHint, Performance,
    };
    use cgr_executor::MockPublicExecutor;

    fn descriptor(id: &str, mode: ExecutionMode) -> CapabilityDescriptor {
        CapabilityDescriptor {
            id: id.to_string(),
            name: id.to_string(),
            description: "test capability".to_string(),
            version: "1.0.0".to_string(),
            inputs_schema: serde_json::json!({}),
            outputs_schema: serde_json::json!({}),
            execution: ExecutionSpec {
                mode,
                executor_hint: None,
                proof_type: None,
            },
            economics: Economics {
                cost_hint: 0.001,
                currency: "USD".to_string(),
                payment_signal: Default::default(),
            },
            performance: Performance {
                latency_hint: LatencyHint::Low,
                reliability_hint: 1.0,
                throughput_limit: None,
            },
            composable: true,
            metadata: DescriptorMetadata::default(),
            deprecated: false,
        }
    }

    fn services() -> Services {
        let mut services = Services::new(GatewayConfig::default());
        services
            .register_capability(descriptor("cap.price.lookup.v1", ExecutionMode::Public))
            .unwrap();
        services
            .register_capability(descriptor("cap.cspl.wrap.v1", ExecutionMode::Confidential))
            .unwrap();
        services.register_executor(Arc::new(MockPublicExecutor::new("public-executor")));
        services
    }

    fn request(capability_id: &str) -> InvocationRequest {
        InvocationRequest {
            capability_id: capability_id.to_string(),
            inputs: json!({"base_token": "SOL", "quote_token": "USD"}),
            preferences: serde_json::Value::Null,
            caller_identity: None,
            priority: Priority::Normal,
            dedup_key: None,
            no_cache: false,
        }
    }

    #[tokio::test]
    async fn public_invocation_succeeds_and_emits_receipt() {
        let services = services();
        let result = services.invoke(request("cap.price.lookup.v1")).await.unwrap();
        assert!(result.success);
        assert!(result.outputs.is_some());
        assert!(result.receipt["receipt_id"].as_str().unwrap().len() == 16);
    }

    #[tokio::test]
    async fn unknown_capability_is_not_found() {
        let services = services();
        let err = services.invoke(request("cap.ghost.v1")).await.unwrap_err();
        assert_eq!(err.kind, cgr_error::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn confidential_without_identity_is_forbidden_with_no_activity() {
        let services = services();
        let before = services.activity().len();
        let err = services.invoke(request("cap.cspl.wrap.v1")).await.unwrap_err();
        assert_eq!(err.kind, cgr_error::ErrorKind::Forbidden);
        assert_eq!(services.activity().len(), before);
    }

    #[tokio::test]
    async fn dedup_collapses_concurrent_identical_invocations() {
        let services = Arc::new(services());
        let mut handles = Vec::new();
        for _ in 0..5 {
            let services = Arc::clone(&services);
            handles.push(tokio::spawn(async move {
                services.invoke(request("cap.price.lookup.v1")).await.unwrap()
            }));
        }
        let mut hashes = Vec::new();
        for handle in handles {
            let result = handle.await.unwrap();
            hashes.push(result.receipt["outputs_hash"].clone());
        }
        assert!(hashes.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn circuit_opens_after_consecutive_executor_failures() {
        struct FailingExecutor;
        #[async_trait::async_trait]
        impl Executor for FailingExecutor {
            fn id(&self) -> &str {
                "failing"
            }
            fn declared_capabilities(&self) -> &[String] {
                &[]
            }
            async fn execute(
                &self,
                _descriptor: &CapabilityDescriptor,
                _inputs: serde_json::Value,
            ) -> Result<ExecutorOutput, GatewayError> {
                Err(GatewayError::executor("boom"))
            }
        }

        let mut config = GatewayConfig::default();
        config.circuit_failure_threshold = 3;
        let mut services = Services::new(config);
        services
            .register_capability(descriptor("cap.flaky.v1", ExecutionMode::Public))
            .unwrap();
        services.register_executor(Arc::new(FailingExecutor));

        for i in 0..3 {
            let mut req = request("cap.flaky.v1");
            req.dedup_key = Some(format!("attempt-{i}"));
            req.preferences = json!({"executor_hint": "failing"});
            let result = services.invoke(req).await.unwrap();
            assert!(!result.success);
        }

        let mut req = request("cap.flaky.v1");
        req.dedup_key = Some("attempt-4".to_string());
        req.preferences = json!({"executor_hint": "failing"});
        let err = services.invoke(req).await.unwrap_err();
        assert_eq!(err.kind, cgr_error::ErrorKind::ServiceUnavailable);
    }

    #[tokio::test]
    async fn rate_limit_denies_past_global_ceiling() {
        let mut config = GatewayConfig::default();
        config.rate_limit_global_max = 2;
        let mut services = Services::new(config);
        services
            .register_capability(descriptor("cap.price.lookup.v1", ExecutionMode::Public))
            .unwrap();
        services.register_executor(Arc::new(MockPublicExecutor::new("public-executor")));

        for i in 0..2 {
            let mut req = request("cap.price.lookup.v1");
            req.dedup_key = Some(format!("k{i}"));
            assert!(services.invoke(req).await.unwrap().success);
        }
        let mut req = request("cap.price.lookup.v1");
        req.dedup_key = Some("k-over".to_string());
        let err = services.invoke(req).await.unwrap_err();
        assert_eq!(err.kind, cgr_error::ErrorKind::RateLimited);
    }
}
