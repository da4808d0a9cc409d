use crate::cache::{FileCache, InFlight, MemoryCache, ResultCache};
use crate::executor::{FailurePolicy, WorkflowExecutor};
use crate::invoke::RunContext;
use crate::report::{Journal, RunReport};
use pipecore::{
    EventBus, ExecutionEvent, NoProcessAdapter, PipelineError, ProcessAdapter, RunInputs, Workflow,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Main runtime for executing workflows
pub struct PipelineRuntime {
    config: RuntimeConfig,
    executor: Arc<WorkflowExecutor>,
    adapter: Arc<dyn ProcessAdapter>,
    event_bus: Arc<EventBus>,
    memory_cache: Arc<MemoryCache>,
    cache_override: Option<Arc<dyn ResultCache>>,
    flights: Arc<InFlight>,
    permits: Arc<Semaphore>,
}

impl PipelineRuntime {
    /// Create a new runtime with custom configuration
    pub fn new(config: RuntimeConfig) -> Self {
        let executor = Arc::new(WorkflowExecutor::new(config.on_failure));
        let event_bus = Arc::new(EventBus::new(config.event_buffer_size));
        let permits = Arc::new(Semaphore::new(config.max_parallel.max(1)));

        Self {
            config,
            executor,
            adapter: Arc::new(NoProcessAdapter),
            event_bus,
            memory_cache: Arc::new(MemoryCache::new()),
            cache_override: None,
            flights: Arc::new(InFlight::new()),
            permits,
        }
    }

    /// Use `adapter` to run process nodes.
    pub fn with_adapter(mut self, adapter: Arc<dyn ProcessAdapter>) -> Self {
        self.adapter = adapter;
        self
    }

    /// Use `cache` for every run, whatever the configured cache mode.
    pub fn with_cache(mut self, cache: Arc<dyn ResultCache>) -> Self {
        self.cache_override = Some(cache);
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Execute a workflow whose inputs are all bound by connections or defaults
    pub async fn run(&self, workflow: &Workflow) -> Result<RunReport, PipelineError> {
        self.run_with_inputs(workflow, RunInputs::new()).await
    }

    /// Execute a workflow, binding unconnected input ports from `inputs`
    pub async fn run_with_inputs(
        &self,
        workflow: &Workflow,
        inputs: RunInputs,
    ) -> Result<RunReport, PipelineError> {
        self.run_with_cancel(workflow, inputs, CancellationToken::new())
            .await
    }

    /// Execute a workflow that stops dispatching new nodes once `cancel` fires.
    ///
    /// Invocations already running are allowed to finish.
    pub async fn run_with_cancel(
        &self,
        workflow: &Workflow,
        inputs: RunInputs,
        cancel: CancellationToken,
    ) -> Result<RunReport, PipelineError> {
        let ctx = Arc::new(RunContext {
            execution_id: uuid::Uuid::new_v4(),
            root: workflow.working_dir().to_path_buf(),
            adapter: self.adapter.clone(),
            cache: self.cache_for(workflow),
            flights: self.flights.clone(),
            permits: self.permits.clone(),
            events: self.event_bus.clone(),
            journal: Journal::default(),
            timeout: self.config.node_timeout_ms.map(Duration::from_millis),
            max_parallel: self.config.max_parallel.max(1),
        });

        self.executor.execute(workflow, ctx, inputs, cancel).await
    }

    /// Subscribe to execution events
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<ExecutionEvent> {
        self.event_bus.subscribe()
    }

    /// Get the event bus for direct access
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// The in-memory store used when the cache mode is [`CacheMode::Memory`].
    pub fn memory_cache(&self) -> &Arc<MemoryCache> {
        &self.memory_cache
    }

    fn cache_for(&self, workflow: &Workflow) -> Arc<dyn ResultCache> {
        if let Some(cache) = &self.cache_override {
            return cache.clone();
        }
        match self.config.cache {
            CacheMode::Memory => self.memory_cache.clone(),
            CacheMode::WorkingDirectory => Arc::new(FileCache::new(workflow.working_dir())),
        }
    }
}

impl Default for PipelineRuntime {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

/// Where invocation results are kept between runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    /// Results live as long as the runtime.
    Memory,
    /// Results are written next to each invocation's working directory and
    /// survive restarts.
    #[default]
    WorkingDirectory,
}

/// Configuration for the runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Upper bound on invocations running at the same time.
    pub max_parallel: usize,
    pub event_buffer_size: usize,
    /// Per-invocation time limit; `None` waits forever.
    pub node_timeout_ms: Option<u64>,
    pub cache: CacheMode,
    pub on_failure: FailurePolicy,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            event_buffer_size: 1000,
            node_timeout_ms: None,
            cache: CacheMode::default(),
            on_failure: FailurePolicy::default(),
        }
    }
}
