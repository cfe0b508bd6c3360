//! In-process `SignupBackend`.
//!
//! Keeps users, organizations, billing customers and sent emails in
//! concurrent maps. Used by the CLI's demo worker and by the end-to-end
//! tests; failures can be injected per operation to exercise retries and
//! compensation.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use dashmap::{DashMap, DashSet};
use sagaflow_core::signup::{NewUser, SignupBackend};
use sagaflow_types::step::StepError;
use tracing::debug;

/// Operation names accepted by [`InMemorySignupBackend::inject_failure`].
pub mod ops {
    pub const EMAIL_EXISTS: &str = "email_exists";
    pub const USER_EXISTS: &str = "user_exists";
    pub const CREATE_USER: &str = "create_user";
    pub const DELETE_USER: &str = "delete_user";
    pub const CREATE_ORGANIZATION: &str = "create_organization";
    pub const DELETE_ORGANIZATION: &str = "delete_organization";
    pub const CREATE_BILLING_CUSTOMER: &str = "create_billing_customer";
    pub const CREATE_SUBSCRIPTION: &str = "create_subscription";
    pub const DELETE_BILLING_CUSTOMER: &str = "delete_billing_customer";
    pub const SEND_VERIFICATION_EMAIL: &str = "send_verification_email";
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredUser {
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub role: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredOrganization {
    pub name: String,
    pub owner_user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentEmail {
    pub user_id: String,
    pub email: String,
    pub first_name: Option<String>,
    pub sent_at: chrono::DateTime<Utc>,
}

#[derive(Default)]
pub struct InMemorySignupBackend {
    users: DashMap<String, StoredUser>,
    organizations: DashMap<String, StoredOrganization>,
    customers: DashMap<String, String>,
    subscriptions: DashMap<String, String>,
    reserved_emails: DashSet<String>,
    sent: DashMap<String, SentEmail>,
    failures: DashMap<String, Vec<StepError>>,
    ids: AtomicU64,
}

impl InMemorySignupBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next call of `op` with `err`. Repeated injections queue up.
    pub fn inject_failure(&self, op: &str, err: StepError) {
        self.failures.entry(op.to_string()).or_default().insert(0, err);
    }

    /// Treat `email` as already registered.
    pub fn reserve_email(&self, email: &str) {
        self.reserved_emails.insert(email.to_lowercase());
    }

    pub fn user(&self, user_id: &str) -> Option<StoredUser> {
        self.users.get(user_id).map(|u| u.clone())
    }

    pub fn organization(&self, org_id: &str) -> Option<StoredOrganization> {
        self.organizations.get(org_id).map(|o| o.clone())
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn organization_count(&self) -> usize {
        self.organizations.len()
    }

    pub fn customer_count(&self) -> usize {
        self.customers.len()
    }

    pub fn emails_sent(&self) -> usize {
        self.sent.len()
    }

    fn take_failure(&self, op: &str) -> Result<(), StepError> {
        match self.failures.get_mut(op).and_then(|mut queued| queued.pop()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{prefix}_{:06}", self.ids.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

impl SignupBackend for InMemorySignupBackend {
    async fn email_exists(&self, email: &str) -> Result<bool, StepError> {
        self.take_failure(ops::EMAIL_EXISTS)?;
        let email = email.to_lowercase();
        Ok(self.reserved_emails.contains(&email) || self.users.iter().any(|u| u.email == email))
    }

    async fn user_exists(&self, user_id: &str) -> Result<bool, StepError> {
        self.take_failure(ops::USER_EXISTS)?;
        Ok(self.users.contains_key(user_id))
    }

    async fn create_user(&self, user: &NewUser) -> Result<String, StepError> {
        self.take_failure(ops::CREATE_USER)?;
        let id = self.next_id("user");
        self.users.insert(
            id.clone(),
            StoredUser {
                email: user.email.to_lowercase(),
                first_name: user.first_name.clone(),
                last_name: user.last_name.clone(),
                role: user.role.clone(),
            },
        );
        debug!(user_id = %id, "user created");
        Ok(id)
    }

    async fn delete_user(&self, user_id: &str) -> Result<(), StepError> {
        self.take_failure(ops::DELETE_USER)?;
        self.users.remove(user_id);
        Ok(())
    }

    async fn create_organization(&self, name: &str, owner_user_id: &str) -> Result<String, StepError> {
        self.take_failure(ops::CREATE_ORGANIZATION)?;
        let id = self.next_id("org");
        self.organizations.insert(
            id.clone(),
            StoredOrganization {
                name: name.to_string(),
                owner_user_id: owner_user_id.to_string(),
            },
        );
        Ok(id)
    }

    async fn delete_organization(&self, org_id: &str) -> Result<(), StepError> {
        self.take_failure(ops::DELETE_ORGANIZATION)?;
        self.organizations.remove(org_id);
        Ok(())
    }

    async fn create_billing_customer(&self, org_id: &str, _email: &str) -> Result<String, StepError> {
        self.take_failure(ops::CREATE_BILLING_CUSTOMER)?;
        let id = self.next_id("cus");
        self.customers.insert(id.clone(), org_id.to_string());
        Ok(id)
    }

    async fn create_subscription(&self, customer_id: &str) -> Result<String, StepError> {
        self.take_failure(ops::CREATE_SUBSCRIPTION)?;
        if !self.customers.contains_key(customer_id) {
            return Err(StepError::external_service(format!("no such customer: {customer_id}"))
                .with_retryable(false));
        }
        let id = self.next_id("sub");
        self.subscriptions.insert(id.clone(), customer_id.to_string());
        Ok(id)
    }

    async fn delete_billing_customer(&self, customer_id: &str) -> Result<(), StepError> {
        self.take_failure(ops::DELETE_BILLING_CUSTOMER)?;
        self.customers.remove(customer_id);
        self.subscriptions.retain(|_, customer| customer.as_str() != customer_id);
        Ok(())
    }

    async fn send_verification_email(
        &self,
        user_id: &str,
        email: &str,
        first_name: Option<&str>,
    ) -> Result<(), StepError> {
        self.take_failure(ops::SEND_VERIFICATION_EMAIL)?;
        self.sent.insert(
            user_id.to_string(),
            SentEmail {
                user_id: user_id.to_string(),
                email: email.to_string(),
                first_name: first_name.map(str::to_string),
                sent_at: Utc::now(),
            },
        );
        Ok(())
    }
}
