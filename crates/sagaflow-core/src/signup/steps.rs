//! Step handlers for the `user_signup` workflow.

use std::sync::Arc;

use chrono::Utc;
use sagaflow_types::step::{StepError, StepInput, StepResult};
use serde_json::json;
use tracing::{info, warn};

use crate::workflow::handler::StepHandler;

use super::{NewUser, SignupBackend};

/// Minimum accepted password length, in characters.
pub const MIN_PASSWORD_LEN: usize = 8;

const DEFAULT_ROLE: &str = "member";

fn required_field<'a>(input: &'a StepInput, field: &str) -> Result<&'a str, StepError> {
    input
        .context_str(field)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| StepError::validation(format!("{field} is required")))
}

fn is_valid_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && !email.chars().any(char::is_whitespace)
        && domain
            .split_once('.')
            .is_some_and(|(host, tld)| !host.is_empty() && !tld.is_empty() && !tld.ends_with('.'))
}

/// The account an earlier run of this workflow created, if it still exists.
///
/// A restart from scratch keeps the context, so the account it finds there
/// holds the signup email without being a conflict.
async fn surviving_account<'a, B: SignupBackend>(
    backend: &B,
    input: &'a StepInput,
) -> Result<Option<&'a str>, StepError> {
    match input.context_str("user_id") {
        Some(user_id) if backend.user_exists(user_id).await? => Ok(Some(user_id)),
        _ => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// validate
// ---------------------------------------------------------------------------

/// Checks the signup form and rejects emails that are already registered.
pub struct ValidateStep<B> {
    backend: Arc<B>,
}

impl<B> ValidateStep<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }
}

impl<B: SignupBackend> StepHandler for ValidateStep<B> {
    async fn execute(&self, input: &StepInput) -> Result<StepResult, StepError> {
        let email = required_field(input, "email")?.to_lowercase();
        let password = input
            .context_str("password")
            .filter(|p| !p.is_empty())
            .ok_or_else(|| StepError::validation("password is required"))?;
        required_field(input, "first_name")?;
        required_field(input, "last_name")?;

        if !is_valid_email(&email) {
            return Err(StepError::validation(format!("invalid email format: {email}")));
        }
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(StepError::validation(format!(
                "password must be at least {MIN_PASSWORD_LEN} characters long"
            )));
        }
        if self.backend.email_exists(&email).await?
            && surviving_account(self.backend.as_ref(), input).await?.is_none()
        {
            return Err(StepError::validation(format!("email already exists: {email}")));
        }

        info!(workflow_id = %input.workflow_id, email = %email, "signup input validated");
        Ok(StepResult::from_value(json!({
            "email": email,
            "validated": true,
        })))
    }
}

// ---------------------------------------------------------------------------
// create_user
// ---------------------------------------------------------------------------

pub struct CreateUserStep<B> {
    backend: Arc<B>,
}

impl<B> CreateUserStep<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }
}

impl<B: SignupBackend> StepHandler for CreateUserStep<B> {
    async fn execute(&self, input: &StepInput) -> Result<StepResult, StepError> {
        let user = NewUser {
            email: input.require_str("email")?.to_string(),
            password: input.require_str("password")?.to_string(),
            first_name: input.require_str("first_name")?.to_string(),
            last_name: input.require_str("last_name")?.to_string(),
            role: input.context_str("role").unwrap_or(DEFAULT_ROLE).to_string(),
        };
        let user_id = match surviving_account(self.backend.as_ref(), input).await? {
            Some(user_id) => {
                info!(workflow_id = %input.workflow_id, user_id, "reusing user from an earlier run");
                user_id.to_string()
            }
            None => {
                let user_id = self.backend.create_user(&user).await?;
                info!(workflow_id = %input.workflow_id, user_id = %user_id, "user created");
                user_id
            }
        };
        Ok(StepResult::from_value(json!({
            "user_id": user_id,
            "email": user.email,
            "first_name": user.first_name,
            "last_name": user.last_name,
            "role": user.role,
        })))
    }

    async fn compensate(&self, input: &StepInput) -> Result<(), StepError> {
        if let Some(user_id) = input.context_str("user_id") {
            self.backend.delete_user(user_id).await?;
            info!(workflow_id = %input.workflow_id, user_id, "user deleted during compensation");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// create_organization
// ---------------------------------------------------------------------------

pub struct CreateOrganizationStep<B> {
    backend: Arc<B>,
}

impl<B> CreateOrganizationStep<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }
}

impl<B: SignupBackend> StepHandler for CreateOrganizationStep<B> {
    async fn execute(&self, input: &StepInput) -> Result<StepResult, StepError> {
        let user_id = input.require_str("user_id")?;
        let org_name = match input.context_str("org_name").filter(|n| !n.trim().is_empty()) {
            Some(name) => name.to_string(),
            None => format!("Organization for {user_id}"),
        };
        let org_id = self.backend.create_organization(&org_name, user_id).await?;

        info!(workflow_id = %input.workflow_id, org_id = %org_id, "organization created");
        Ok(StepResult::from_value(json!({
            "org_id": org_id,
            "org_name": org_name,
        })))
    }

    async fn compensate(&self, input: &StepInput) -> Result<(), StepError> {
        if let Some(org_id) = input.context_str("org_id") {
            self.backend.delete_organization(org_id).await?;
            info!(workflow_id = %input.workflow_id, org_id, "organization deleted during compensation");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// setup_stripe
// ---------------------------------------------------------------------------

/// Creates the billing customer and its default subscription.
pub struct SetupStripeStep<B> {
    backend: Arc<B>,
}

impl<B> SetupStripeStep<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }
}

impl<B: SignupBackend> StepHandler for SetupStripeStep<B> {
    async fn execute(&self, input: &StepInput) -> Result<StepResult, StepError> {
        let org_id = input.require_str("org_id")?;
        let email = input.require_str("email")?;

        let customer_id = self.backend.create_billing_customer(org_id, email).await?;
        let subscription_id = match self.backend.create_subscription(&customer_id).await {
            Ok(id) => id,
            Err(e) => {
                // The customer would be orphaned on retry; remove it first.
                if let Err(cleanup) = self.backend.delete_billing_customer(&customer_id).await {
                    warn!(
                        workflow_id = %input.workflow_id,
                        customer_id = %customer_id,
                        error = %cleanup,
                        "failed to remove billing customer after subscription error"
                    );
                }
                return Err(e);
            }
        };

        info!(
            workflow_id = %input.workflow_id,
            customer_id = %customer_id,
            subscription_id = %subscription_id,
            "billing set up"
        );
        Ok(StepResult::from_value(json!({
            "stripe_customer_id": customer_id,
            "stripe_subscription_id": subscription_id,
        })))
    }

    async fn compensate(&self, input: &StepInput) -> Result<(), StepError> {
        if let Some(customer_id) = input.context_str("stripe_customer_id") {
            self.backend.delete_billing_customer(customer_id).await?;
            info!(workflow_id = %input.workflow_id, customer_id, "billing customer deleted during compensation");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// send_verification
// ---------------------------------------------------------------------------

pub struct SendVerificationStep<B> {
    backend: Arc<B>,
}

impl<B> SendVerificationStep<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }
}

impl<B: SignupBackend> StepHandler for SendVerificationStep<B> {
    async fn execute(&self, input: &StepInput) -> Result<StepResult, StepError> {
        let user_id = input.require_str("user_id")?;
        let email = input.require_str("email")?;
        self.backend
            .send_verification_email(user_id, email, input.context_str("first_name"))
            .await?;

        info!(workflow_id = %input.workflow_id, user_id, "verification email sent");
        Ok(StepResult::from_value(json!({
            "verification_sent": true,
            "sent_at": Utc::now().timestamp(),
        })))
    }
}
