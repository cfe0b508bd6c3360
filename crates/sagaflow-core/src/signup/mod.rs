//! The `user_signup` workflow.
//!
//! validate -> create_user -> create_organization -> setup_stripe -> send_verification
//!
//! Persistence, billing, and email are reached through the `SignupBackend`
//! port so the steps stay free of client libraries.

pub mod steps;

use std::sync::Arc;

use sagaflow_types::config::WorkflowDefaults;
use sagaflow_types::definition::{
    QUEUE_DEFAULT, QUEUE_EXTERNAL, QUEUE_NOTIFICATION, StepDefinition, WorkflowDefinition,
};
use sagaflow_types::retry::RetryPolicy;
use sagaflow_types::step::StepError;

use crate::workflow::definition::WorkflowError;
use crate::workflow::registry::Registry;

use self::steps::{
    CreateOrganizationStep, CreateUserStep, SendVerificationStep, SetupStripeStep, ValidateStep,
};

pub const WORKFLOW_TYPE: &str = "user_signup";

pub const STEP_VALIDATE: &str = "validate";
pub const STEP_CREATE_USER: &str = "create_user";
pub const STEP_CREATE_ORGANIZATION: &str = "create_organization";
pub const STEP_SETUP_STRIPE: &str = "setup_stripe";
pub const STEP_SEND_VERIFICATION: &str = "send_verification";

/// Account fields collected at signup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUser {
    pub email: String,
    pub password: String,
    pub first_name: String,
    pub last_name: String,
    pub role: String,
}

/// Port to the systems a signup touches.
///
/// Implementations classify their own failures: transient storage or
/// provider errors should come back as retryable `database` /
/// `external_service` step errors. Deletes must tolerate ids that no longer
/// exist, since compensation may run more than once.
pub trait SignupBackend: Send + Sync {
    fn email_exists(&self, email: &str) -> impl std::future::Future<Output = Result<bool, StepError>> + Send;

    fn user_exists(&self, user_id: &str) -> impl std::future::Future<Output = Result<bool, StepError>> + Send;

    fn create_user(&self, user: &NewUser) -> impl std::future::Future<Output = Result<String, StepError>> + Send;

    fn delete_user(&self, user_id: &str) -> impl std::future::Future<Output = Result<(), StepError>> + Send;

    fn create_organization(
        &self,
        name: &str,
        owner_user_id: &str,
    ) -> impl std::future::Future<Output = Result<String, StepError>> + Send;

    fn delete_organization(&self, org_id: &str) -> impl std::future::Future<Output = Result<(), StepError>> + Send;

    fn create_billing_customer(
        &self,
        org_id: &str,
        email: &str,
    ) -> impl std::future::Future<Output = Result<String, StepError>> + Send;

    fn create_subscription(
        &self,
        customer_id: &str,
    ) -> impl std::future::Future<Output = Result<String, StepError>> + Send;

    fn delete_billing_customer(
        &self,
        customer_id: &str,
    ) -> impl std::future::Future<Output = Result<(), StepError>> + Send;

    fn send_verification_email(
        &self,
        user_id: &str,
        email: &str,
        first_name: Option<&str>,
    ) -> impl std::future::Future<Output = Result<(), StepError>> + Send;
}

/// The `user_signup` definition. Steps without their own retry policy use
/// `defaults.max_retries`.
pub fn definition(defaults: &WorkflowDefaults) -> WorkflowDefinition {
    let mut def = WorkflowDefinition::new(
        WORKFLOW_TYPE,
        vec![
            StepDefinition::new(STEP_VALIDATE)
                .queue(QUEUE_DEFAULT)
                .timeout_secs(30)
                .retry(RetryPolicy::none())
                .then(STEP_CREATE_USER),
            StepDefinition::new(STEP_CREATE_USER)
                .queue(QUEUE_DEFAULT)
                .timeout_secs(120)
                .then(STEP_CREATE_ORGANIZATION),
            StepDefinition::new(STEP_CREATE_ORGANIZATION)
                .queue(QUEUE_DEFAULT)
                .timeout_secs(120)
                .then(STEP_SETUP_STRIPE),
            StepDefinition::new(STEP_SETUP_STRIPE)
                .queue(QUEUE_EXTERNAL)
                .timeout_secs(180)
                .retry(RetryPolicy::aggressive())
                .then(STEP_SEND_VERIFICATION),
            StepDefinition::new(STEP_SEND_VERIFICATION)
                .queue(QUEUE_NOTIFICATION)
                .timeout_secs(60),
        ],
    );
    def.description = Some("Create a user, their organization and billing, then send a verification email".to_string());
    def.default_timeout_secs = defaults.timeout_secs;
    def.default_max_retries = defaults.max_retries;
    def
}

/// Register the workflow definition and all five step handlers.
pub fn register<B: SignupBackend + 'static>(
    registry: &mut Registry,
    backend: Arc<B>,
    defaults: &WorkflowDefaults,
) -> Result<(), WorkflowError> {
    registry.register(definition(defaults))?;
    registry.register_handler(WORKFLOW_TYPE, STEP_VALIDATE, ValidateStep::new(Arc::clone(&backend)))?;
    registry.register_handler(WORKFLOW_TYPE, STEP_CREATE_USER, CreateUserStep::new(Arc::clone(&backend)))?;
    registry.register_handler(
        WORKFLOW_TYPE,
        STEP_CREATE_ORGANIZATION,
        CreateOrganizationStep::new(Arc::clone(&backend)),
    )?;
    registry.register_handler(WORKFLOW_TYPE, STEP_SETUP_STRIPE, SetupStripeStep::new(Arc::clone(&backend)))?;
    registry.register_handler(WORKFLOW_TYPE, STEP_SEND_VERIFICATION, SendVerificationStep::new(backend))?;
    Ok(())
}
