use super::Engine;
use crate::error::{Error, Result};
use crate::executor::TaskOutcome;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

pub type StageFn = Arc<dyn Fn(Value) -> TaskOutcome + Send + Sync + 'static>;

/// One named step of a pipeline.
#[derive(Clone)]
pub struct Stage {
    name: String,
    func: StageFn,
    parallel: Option<bool>,
}

impl Stage {
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value) -> TaskOutcome + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Arc::new(f),
            parallel: None,
        }
    }

    /// Overrides the pipeline-wide `parallel` flag for this stage.
    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = Some(parallel);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("parallel", &self.parallel)
            .finish()
    }
}

impl Engine {
    /// Threads `data` through `stages` in order.
    ///
    /// A stage that runs in parallel mode and receives a JSON array is
    /// applied to each element through [`parallel_map`](Engine::parallel_map);
    /// elements that fail become `null`. Any other stage runs once on the
    /// whole value, and its failure aborts the pipeline.
    pub fn pipeline(&self, stages: &[Stage], data: Value, parallel: bool) -> Result<Value> {
        let mut current = data;

        for stage in stages {
            let stage_parallel = stage.parallel.unwrap_or(parallel);

            current = match current {
                Value::Array(items) if stage_parallel => {
                    let func = stage.func.clone();
                    let outputs = self
                        .parallel_map(move |item| func(item), items, None, false)
                        .map_err(|e| {
                            tracing::error!(stage = %stage.name, error = %e, "pipeline stage failed");
                            Error::stage(&stage.name, e.to_string())
                        })?;
                    Value::Array(
                        outputs
                            .into_iter()
                            .map(|output| output.unwrap_or(Value::Null))
                            .collect(),
                    )
                }
                value => self.run_stage(stage, value)?,
            };

            tracing::debug!(stage = %stage.name, "completed pipeline stage");
        }

        Ok(current)
    }

    fn run_stage(&self, stage: &Stage, value: Value) -> Result<Value> {
        self.inner
            .panic_handler
            .run_task(|| (stage.func)(value))
            .map_err(|e| {
                tracing::error!(stage = %stage.name, error = %e, "pipeline stage failed");
                Error::stage(&stage.name, e.to_string())
            })
    }
}
