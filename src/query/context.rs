//! Per-statement shared state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::query::config::QueryConfig;
use crate::storage::PinStore;
use crate::types::{PinError, PinId, Result, Value};

/// Session owning a statement: identity plus the cancellation flag.
#[derive(Clone, Debug, Default)]
pub struct Session {
    id: u64,
    abort: Arc<AtomicBool>,
}

impl Session {
    /// New session with a fresh abort flag.
    pub fn new(id: u64) -> Self {
        Self {
            id,
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Session identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Shared cancellation token.
    pub fn abort_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }

    /// Requests cancellation of every statement on the session.
    pub fn abort(&self) {
        self.abort.store(true, Ordering::Relaxed);
    }

    /// Returns true once cancellation was requested.
    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::Relaxed)
    }
}

struct CtxInner {
    session: Session,
    store: Arc<dyn PinStore>,
    env: Vec<PinId>,
    params: Vec<Vec<Value>>,
    config: QueryConfig,
}

/// Reference-counted query context shared by every operator of a tree.
///
/// Outlives every operator built with it.
#[derive(Clone)]
pub struct QueryCtx {
    inner: Arc<CtxInner>,
}

impl QueryCtx {
    /// Starts building a context over `store`.
    pub fn builder(store: Arc<dyn PinStore>) -> QueryCtxBuilder {
        QueryCtxBuilder {
            session: Session::default(),
            store,
            env: Vec::new(),
            params: Vec::new(),
            config: QueryConfig::default(),
        }
    }

    /// Context with default configuration and no parameters.
    pub fn new(store: Arc<dyn PinStore>) -> Self {
        Self::builder(store).build()
    }

    /// Storage collaborator.
    pub fn store(&self) -> &dyn PinStore {
        self.inner.store.as_ref()
    }

    /// Engine limits.
    pub fn config(&self) -> &QueryConfig {
        &self.inner.config
    }

    /// Owning session.
    pub fn session(&self) -> &Session {
        &self.inner.session
    }

    /// Environment identity array.
    pub fn env(&self) -> &[PinId] {
        &self.inner.env
    }

    /// Parameter vector `idx`.
    pub fn param(&self, idx: usize) -> Result<&[Value]> {
        self.inner
            .params
            .get(idx)
            .map(Vec::as_slice)
            .ok_or(PinError::Invalid("parameter index out of range"))
    }

    /// Fails with [`PinError::Aborted`] once the session was cancelled.
    pub fn check_abort(&self) -> Result<()> {
        if self.inner.session.is_aborted() {
            Err(PinError::Aborted)
        } else {
            Ok(())
        }
    }
}

/// Builder for [`QueryCtx`].
pub struct QueryCtxBuilder {
    session: Session,
    store: Arc<dyn PinStore>,
    env: Vec<PinId>,
    params: Vec<Vec<Value>>,
    config: QueryConfig,
}

impl QueryCtxBuilder {
    /// Attaches the statement to `session`.
    pub fn session(mut self, session: Session) -> Self {
        self.session = session;
        self
    }

    /// Sets the environment identity array.
    pub fn env(mut self, env: Vec<PinId>) -> Self {
        self.env = env;
        self
    }

    /// Appends a parameter vector.
    pub fn param(mut self, values: Vec<Value>) -> Self {
        self.params.push(values);
        self
    }

    /// Replaces the engine limits.
    pub fn config(mut self, config: QueryConfig) -> Self {
        self.config = config;
        self
    }

    /// Finishes the context.
    pub fn build(self) -> QueryCtx {
        QueryCtx {
            inner: Arc::new(CtxInner {
                session: self.session,
                store: self.store,
                env: self.env,
                params: self.params,
                config: self.config,
            }),
        }
    }
}

/// Counts loop iterations and polls the abort flag every
/// [`QueryConfig::abort_poll_interval`] ticks.
#[derive(Debug, Default, Clone)]
pub struct AbortPoll {
    ticks: u32,
}

impl AbortPoll {
    /// Registers one iteration.
    pub fn tick(&mut self, ctx: &QueryCtx) -> Result<()> {
        self.ticks += 1;
        if self.ticks >= ctx.config().abort_poll_interval {
            self.ticks = 0;
            ctx.check_abort()?;
        }
        Ok(())
    }
}
