//! The decision engine.
//!
//! Each evaluation fingerprints the attempt's identity, loads its record,
//! applies the [`Policy`] and persists the admitted record. Stores that
//! implement [`AtomicIncrement`](super::store::AtomicIncrement) do this in one
//! step; other stores use a read followed by a write, which can undercount
//! when attempts for the same identity race.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, instrument, trace};

use super::clock::{Clock, SystemClock};
use super::identity::IdentityKey;
use super::policy::{NameSequence, Policy, Transition};
use super::record::AttemptRecord;
use super::reset::ResetHandle;
use super::response::{FailureMode, FailureResponse};
use super::store::{AttemptStore, StoreError};
use crate::config::PolicyConfig;
use crate::error::{BruteGuardError, Result};

const GET_FAILED: &str = "Cannot get request count";
const INCREMENT_FAILED: &str = "Cannot increment request count";
const RESET_FAILED: &str = "Cannot reset request count";

/// Called with every denial.
pub type FailureHandler = Arc<dyn Fn(&Denial) + Send + Sync>;
/// Called with every store failure.
pub type StoreErrorHandler = Arc<dyn Fn(&StoreFailure) + Send + Sync>;

/// One attempt to be evaluated.
#[derive(Debug, Clone, Default)]
pub struct Attempt {
    /// Network origin of the attempt, e.g. the client address
    pub network_identity: Option<String>,
    /// Caller-chosen key, e.g. a username
    pub sub_key: Option<String>,
    /// Track the identity regardless of where it comes from
    pub ignore_network_identity: bool,
    /// Overrides the engine's failure mode for this attempt
    pub failure_mode: Option<FailureMode>,
}

impl Attempt {
    /// An attempt with no identity parts set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Scope the attempt to a network origin.
    pub fn from_network(mut self, identity: impl Into<String>) -> Self {
        self.network_identity = Some(identity.into());
        self
    }

    /// Set the caller-chosen part of the identity.
    pub fn sub_key(mut self, key: impl Into<String>) -> Self {
        self.sub_key = Some(key.into());
        self
    }

    /// Leave the network origin out of the store key.
    pub fn ignore_network_identity(mut self) -> Self {
        self.ignore_network_identity = true;
        self
    }

    /// Answer a denial of this attempt with `mode` instead of the engine's.
    pub fn failure_mode(mut self, mode: FailureMode) -> Self {
        self.failure_mode = Some(mode);
        self
    }
}

/// An attempt that may proceed.
#[derive(Debug, Clone)]
pub struct Admission {
    pub key: IdentityKey,
    /// Attempts on record including this one
    pub count: u64,
    /// A previous window ran out and this attempt started a new one
    pub window_expired: bool,
    pub reset: Option<ResetHandle>,
}

/// An attempt that came too early.
#[derive(Debug, Clone)]
pub struct Denial {
    pub key: IdentityKey,
    /// Earliest instant the next attempt will be admitted
    pub retry_after: DateTime<Utc>,
    pub count: u64,
    pub failure_mode: FailureMode,
    /// When the attempt was denied
    pub denied_at: DateTime<Utc>,
    pub reset: Option<ResetHandle>,
}

impl Denial {
    /// How an adapter should answer this denial.
    pub fn response(&self) -> FailureResponse {
        FailureResponse::render(self.failure_mode, self.retry_after, self.denied_at)
    }
}

/// A store failure that stopped an evaluation or reset.
#[derive(Debug)]
pub struct StoreFailure {
    pub message: &'static str,
    pub key: IdentityKey,
    pub network_identity: Option<String>,
    pub source: StoreError,
}

impl std::fmt::Display for StoreFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.message, self.source)
    }
}

/// Result of one evaluation.
#[derive(Debug)]
pub enum Outcome {
    Allowed(Admission),
    Denied(Denial),
    /// Neither allowed nor denied; the store could not be used
    StoreError(StoreFailure),
}

impl Outcome {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Outcome::Allowed(_))
    }

    pub fn is_denied(&self) -> bool {
        matches!(self, Outcome::Denied(_))
    }

    pub fn reset_handle(&self) -> Option<&ResetHandle> {
        match self {
            Outcome::Allowed(admission) => admission.reset.as_ref(),
            Outcome::Denied(denial) => denial.reset.as_ref(),
            Outcome::StoreError(_) => None,
        }
    }
}

/// What [`DecisionEngine::guard`] hands its continuation.
#[derive(Debug)]
pub enum Clearance {
    Admitted(Admission),
    /// Denied under [`FailureMode::Mark`]; the request goes on annotated
    Marked(Denial),
}

impl Clearance {
    pub fn is_marked(&self) -> bool {
        matches!(self, Clearance::Marked(_))
    }

    /// The annotation for a marked request.
    pub fn response(&self) -> Option<FailureResponse> {
        match self {
            Clearance::Admitted(_) => None,
            Clearance::Marked(denial) => Some(denial.response()),
        }
    }

    pub fn reset_handle(&self) -> Option<&ResetHandle> {
        match self {
            Clearance::Admitted(admission) => admission.reset.as_ref(),
            Clearance::Marked(denial) => denial.reset.as_ref(),
        }
    }
}

/// Why [`DecisionEngine::guard`] did not run its continuation.
#[derive(Debug, thiserror::Error)]
pub enum Rejection {
    #[error("too many attempts, retry after {}", .0.retry_after)]
    Denied(Denial),
    #[error("{0}")]
    Store(StoreFailure),
}

/// Brute-force decision engine for one limiter.
pub struct DecisionEngine {
    name: String,
    policy: Policy,
    store: Arc<dyn AttemptStore>,
    clock: Arc<dyn Clock>,
    failure_mode: FailureMode,
    on_denied: Option<FailureHandler>,
    on_store_error: StoreErrorHandler,
    attach_reset: bool,
    prefer_atomic: bool,
}

/// Builder for [`DecisionEngine`].
pub struct EngineBuilder {
    store: Arc<dyn AttemptStore>,
    policy: Policy,
    name: Option<String>,
    names: Option<&'static NameSequence>,
    clock: Arc<dyn Clock>,
    failure_mode: FailureMode,
    on_denied: Option<FailureHandler>,
    on_store_error: Option<StoreErrorHandler>,
    attach_reset: bool,
    prefer_atomic: bool,
}

impl EngineBuilder {
    pub fn new(store: Arc<dyn AttemptStore>) -> Self {
        Self {
            store,
            policy: Policy::default(),
            name: None,
            names: None,
            clock: Arc::new(SystemClock),
            failure_mode: FailureMode::default(),
            on_denied: None,
            on_store_error: None,
            attach_reset: true,
            prefer_atomic: true,
        }
    }

    pub fn policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    /// Apply a policy section from configuration.
    ///
    /// Fails with `InvalidConfig` on bad delay bounds.
    pub fn config(mut self, config: &PolicyConfig) -> Result<Self> {
        self.policy = config.to_policy()?;
        self.failure_mode = config.failure_mode;
        self.attach_reset = config.attach_reset;
        self.prefer_atomic = config.prefer_atomic;
        if let Some(name) = &config.name {
            self.name = Some(name.clone());
        }
        Ok(self)
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Draw the default name from `names` instead of the global sequence.
    pub fn names(mut self, names: &'static NameSequence) -> Self {
        self.names = Some(names);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn failure_mode(mut self, mode: FailureMode) -> Self {
        self.failure_mode = mode;
        self
    }

    pub fn on_denied<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Denial) + Send + Sync + 'static,
    {
        let handler: FailureHandler = Arc::new(handler);
        self.on_denied = Some(handler);
        self
    }

    pub fn on_store_error<F>(mut self, handler: F) -> Self
    where
        F: Fn(&StoreFailure) + Send + Sync + 'static,
    {
        let handler: StoreErrorHandler = Arc::new(handler);
        self.on_store_error = Some(handler);
        self
    }

    pub fn attach_reset(mut self, attach: bool) -> Self {
        self.attach_reset = attach;
        self
    }

    /// Use the store's atomic increment when it has one.
    pub fn prefer_atomic(mut self, prefer: bool) -> Self {
        self.prefer_atomic = prefer;
        self
    }

    pub fn build(self) -> DecisionEngine {
        let name = self
            .name
            .unwrap_or_else(|| self.names.unwrap_or(NameSequence::global()).next_name());

        DecisionEngine {
            name,
            policy: self.policy,
            store: self.store,
            clock: self.clock,
            failure_mode: self.failure_mode,
            on_denied: self.on_denied,
            on_store_error: self
                .on_store_error
                .unwrap_or_else(|| Arc::new(log_store_error) as StoreErrorHandler),
            attach_reset: self.attach_reset,
            prefer_atomic: self.prefer_atomic,
        }
    }
}

fn log_store_error(failure: &StoreFailure) {
    error!(
        key = %failure.key,
        network_identity = ?failure.network_identity,
        error = %failure.source,
        "{}",
        failure.message
    );
}

impl DecisionEngine {
    pub fn builder(store: Arc<dyn AttemptStore>) -> EngineBuilder {
        EngineBuilder::new(store)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Store key for an attempt.
    pub fn key_for(&self, attempt: &Attempt) -> IdentityKey {
        let network_identity = if attempt.ignore_network_identity {
            None
        } else {
            attempt.network_identity.as_deref()
        };
        IdentityKey::for_attempt(network_identity, &self.name, attempt.sub_key.as_deref())
    }

    /// A reset capability for the attempt's identity.
    pub fn reset_handle(&self, attempt: &Attempt) -> ResetHandle {
        ResetHandle::new(self.store.clone(), self.key_for(attempt))
    }

    /// Decide whether `attempt` may proceed, recording it if so.
    #[instrument(skip(self, attempt), fields(limiter = %self.name))]
    pub async fn evaluate(&self, attempt: &Attempt) -> Outcome {
        let key = self.key_for(attempt);
        let now = self.clock.now();

        trace!(key = %key, "Evaluating attempt");

        let transition = match self.apply(&key, now).await {
            Ok(transition) => transition,
            Err((message, source)) => {
                return Outcome::StoreError(self.store_failure(message, key, attempt, source));
            }
        };

        let reset = self
            .attach_reset
            .then(|| ResetHandle::new(self.store.clone(), key.clone()));

        match transition {
            Transition::Admit {
                record,
                window_expired,
                ..
            } => {
                if window_expired {
                    debug!(key = %key, "Attempt window expired, starting over");
                }
                trace!(key = %key, count = record.count, "Attempt allowed");
                Outcome::Allowed(Admission {
                    key,
                    count: record.count,
                    window_expired,
                    reset,
                })
            }
            Transition::Deny { retry_after, count } => {
                debug!(
                    key = %key,
                    count = count,
                    retry_after = %retry_after,
                    "Attempt denied"
                );
                let denial = Denial {
                    key,
                    retry_after,
                    count,
                    failure_mode: attempt.failure_mode.unwrap_or(self.failure_mode),
                    denied_at: now,
                    reset,
                };
                if let Some(handler) = &self.on_denied {
                    handler(&denial);
                }
                Outcome::Denied(denial)
            }
        }
    }

    /// Evaluate an attempt whose sub-key is produced asynchronously.
    pub async fn evaluate_with<F, Fut>(&self, attempt: Attempt, resolve_sub_key: F) -> Outcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Option<String>>,
    {
        let attempt = Attempt {
            sub_key: resolve_sub_key().await,
            ..attempt
        };
        self.evaluate(&attempt).await
    }

    /// Run `continuation` if the attempt may proceed.
    ///
    /// Allowed attempts continue as [`Clearance::Admitted`]. Denials whose
    /// failure mode is [`FailureMode::Mark`] continue as [`Clearance::Marked`]
    /// and are not recorded; every other denial is a [`Rejection`].
    pub async fn guard<F, Fut, T>(
        &self,
        attempt: &Attempt,
        continuation: F,
    ) -> std::result::Result<T, Rejection>
    where
        F: FnOnce(Clearance) -> Fut,
        Fut: Future<Output = T>,
    {
        match self.evaluate(attempt).await {
            Outcome::Allowed(admission) => Ok(continuation(Clearance::Admitted(admission)).await),
            Outcome::Denied(denial) if denial.failure_mode == FailureMode::Mark => {
                trace!(key = %denial.key, "Denied attempt marked, continuing");
                Ok(continuation(Clearance::Marked(denial)).await)
            }
            Outcome::Denied(denial) => Err(Rejection::Denied(denial)),
            Outcome::StoreError(failure) => Err(Rejection::Store(failure)),
        }
    }

    /// Forget the attempts of one identity.
    pub async fn reset(&self, network_identity: Option<&str>, sub_key: Option<&str>) -> Result<()> {
        let key = IdentityKey::for_attempt(network_identity, &self.name, sub_key);

        match self.store.reset(key.as_str()).await {
            Ok(()) => {
                debug!(key = %key, "Attempt record reset");
                Ok(())
            }
            Err(source) => {
                let failure = StoreFailure {
                    message: RESET_FAILED,
                    key,
                    network_identity: network_identity.map(str::to_string),
                    source,
                };
                (self.on_store_error)(&failure);
                Err(BruteGuardError::Store(failure.source))
            }
        }
    }

    async fn apply(
        &self,
        key: &IdentityKey,
        now: DateTime<Utc>,
    ) -> std::result::Result<Transition, (&'static str, StoreError)> {
        let evaluate = |prior: Option<&AttemptRecord>| self.policy.evaluate(prior, now);

        if self.prefer_atomic {
            if let Some(atomic) = self.store.as_atomic() {
                return atomic
                    .increment(key.as_str(), &evaluate)
                    .await
                    .map_err(|e| (INCREMENT_FAILED, e));
            }
        }

        let prior = self
            .store
            .get(key.as_str())
            .await
            .map_err(|e| (GET_FAILED, e))?;

        let transition = evaluate(prior.as_ref());
        if let Transition::Admit { record, ttl_secs, .. } = &transition {
            self.store
                .set(key.as_str(), record, *ttl_secs)
                .await
                .map_err(|e| (INCREMENT_FAILED, e))?;
        }
        Ok(transition)
    }

    fn store_failure(
        &self,
        message: &'static str,
        key: IdentityKey,
        attempt: &Attempt,
        source: StoreError,
    ) -> StoreFailure {
        let failure = StoreFailure {
            message,
            key,
            network_identity: attempt.network_identity.clone(),
            source,
        };
        (self.on_store_error)(&failure);
        failure
    }
}

impl std::fmt::Debug for DecisionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecisionEngine")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .field("failure_mode", &self.failure_mode)
            .field("attach_reset", &self.attach_reset)
            .field("prefer_atomic", &self.prefer_atomic)
            .finish()
    }
}
