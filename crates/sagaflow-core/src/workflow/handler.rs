//! Step handler contract and its type-erased wrapper.
//!
//! `StepHandler` is what a concrete business step implements to plug into the
//! engine. Because it uses RPITIT it is not object-safe, so handlers are stored
//! in the registry as `BoxStepHandler`:
//! 1. `StepHandlerDyn` is the object-safe mirror with boxed futures
//! 2. Blanket-impl `StepHandlerDyn` for all `T: StepHandler`
//! 3. `BoxStepHandler` wraps `Box<dyn StepHandlerDyn>` and delegates

use std::future::Future;
use std::pin::Pin;

use sagaflow_types::step::{StepError, StepInput, StepResult};

/// Business logic for one step of a workflow.
pub trait StepHandler: Send + Sync {
    /// Run the step. Output keys are merged into the workflow context.
    fn execute(
        &self,
        input: &StepInput,
    ) -> impl Future<Output = Result<StepResult, StepError>> + Send;

    /// Undo the effect of a previously successful `execute`.
    ///
    /// `input.workflow_input` carries the workflow context at compensation
    /// time, which includes this step's own output. Steps with nothing to
    /// undo keep the default.
    fn compensate(&self, _input: &StepInput) -> impl Future<Output = Result<(), StepError>> + Send {
        async { Ok(()) }
    }

    /// Whether the queue should re-run the step after this error.
    fn is_retryable(&self, error: &StepError) -> bool {
        error.retryable
    }
}

/// Object-safe version of [`StepHandler`] with boxed futures.
pub trait StepHandlerDyn: Send + Sync {
    fn execute_boxed<'a>(
        &'a self,
        input: &'a StepInput,
    ) -> Pin<Box<dyn Future<Output = Result<StepResult, StepError>> + Send + 'a>>;

    fn compensate_boxed<'a>(
        &'a self,
        input: &'a StepInput,
    ) -> Pin<Box<dyn Future<Output = Result<(), StepError>> + Send + 'a>>;

    fn is_retryable_dyn(&self, error: &StepError) -> bool;
}

impl<T: StepHandler> StepHandlerDyn for T {
    fn execute_boxed<'a>(
        &'a self,
        input: &'a StepInput,
    ) -> Pin<Box<dyn Future<Output = Result<StepResult, StepError>> + Send + 'a>> {
        Box::pin(self.execute(input))
    }

    fn compensate_boxed<'a>(
        &'a self,
        input: &'a StepInput,
    ) -> Pin<Box<dyn Future<Output = Result<(), StepError>> + Send + 'a>> {
        Box::pin(self.compensate(input))
    }

    fn is_retryable_dyn(&self, error: &StepError) -> bool {
        StepHandler::is_retryable(self, error)
    }
}

/// Type-erased step handler, keyed by (workflow type, step name) in the
/// registry.
pub struct BoxStepHandler {
    inner: Box<dyn StepHandlerDyn + Send + Sync>,
}

impl BoxStepHandler {
    pub fn new<T: StepHandler + 'static>(handler: T) -> Self {
        Self {
            inner: Box::new(handler),
        }
    }

    pub async fn execute(&self, input: &StepInput) -> Result<StepResult, StepError> {
        self.inner.execute_boxed(input).await
    }

    pub async fn compensate(&self, input: &StepInput) -> Result<(), StepError> {
        self.inner.compensate_boxed(input).await
    }

    pub fn is_retryable(&self, error: &StepError) -> bool {
        self.inner.is_retryable_dyn(error)
    }
}

impl std::fmt::Debug for BoxStepHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxStepHandler").finish_non_exhaustive()
    }
}
