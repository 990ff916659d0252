//! Persisted online/offline flag for the signed-in user.

use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use shared::{domain::UserId, protocol::StatusUpdateRequest};
use tracing::{debug, warn};

use crate::{config::RealtimeSettings, lock_unpoisoned};

#[async_trait]
pub trait UserStatusUpdater: Send + Sync {
    async fn update_user_status(&self, user_id: &UserId, is_online: bool) -> Result<()>;

    /// Session token to authenticate with; `None` after sign-out.
    fn set_access_token(&self, _token: Option<&str>) {}
}

pub struct NoopStatusUpdater;

#[async_trait]
impl UserStatusUpdater for NoopStatusUpdater {
    async fn update_user_status(&self, user_id: &UserId, is_online: bool) -> Result<()> {
        debug!(user_id = %user_id, is_online, "status update skipped (no updater configured)");
        Ok(())
    }
}

/// Posts status changes to the `update-user-status` edge function.
pub struct HttpStatusUpdater {
    http: Client,
    functions_url: String,
    api_key: String,
    access_token: Mutex<Option<String>>,
}

impl HttpStatusUpdater {
    pub fn new(functions_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            functions_url: functions_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            access_token: Mutex::new(None),
        }
    }

    pub fn from_settings(settings: &RealtimeSettings) -> Self {
        Self::new(settings.functions_url.clone(), settings.api_key.clone())
    }

    pub fn endpoint(&self) -> String {
        format!("{}/update-user-status", self.functions_url)
    }
}

#[async_trait]
impl UserStatusUpdater for HttpStatusUpdater {
    fn set_access_token(&self, token: Option<&str>) {
        *lock_unpoisoned(&self.access_token) = token.map(str::to_string);
    }

    async fn update_user_status(&self, user_id: &UserId, is_online: bool) -> Result<()> {
        let bearer = lock_unpoisoned(&self.access_token)
            .clone()
            .unwrap_or_else(|| self.api_key.clone());
        self.http
            .post(self.endpoint())
            .header("apikey", &self.api_key)
            .bearer_auth(bearer)
            .json(&StatusUpdateRequest {
                user_id: user_id.clone(),
                is_online,
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Validates `user_id` and forwards the update, logging instead of failing.
/// Returns whether the collaborator accepted the call.
pub async fn report_user_status(
    updater: &dyn UserStatusUpdater,
    user_id: &UserId,
    is_online: bool,
) -> bool {
    if let Err(err) = user_id.validate() {
        warn!(user_id = %user_id, error = %err, "skipping status update for malformed user id");
        return false;
    }
    match updater.update_user_status(user_id, is_online).await {
        Ok(()) => {
            debug!(user_id = %user_id, is_online, "user status updated");
            true
        }
        Err(err) => {
            warn!(user_id = %user_id, is_online, error = %err, "failed to update user status");
            false
        }
    }
}

#[cfg(test)]
#[path = "tests/status_tests.rs"]
mod tests;
