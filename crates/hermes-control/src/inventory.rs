//! Cloud inventory lookups for pooled VMs.
//!
//! The pool asks the inventory whether an instance exists before registering
//! it, and the health loop polls it to notice instances that have gone away.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use crate::config::InventoryConfig;
use crate::error::{ControlError, ControlResult};
use crate::types::{InstanceDetails, InstanceState};

/// Source of truth for cloud instance state.
#[async_trait]
pub trait CloudInventory: Send + Sync {
    /// Describe an instance.
    ///
    /// Returns `None` if the inventory does not know the instance.
    async fn describe_instance(
        &self,
        instance_id: &str,
        region: &str,
    ) -> ControlResult<Option<InstanceDetails>>;
}

/// Inventory backed by a fixed table of instances.
///
/// Used when no cloud API is configured, and by tests to simulate instances
/// appearing and disappearing.
#[derive(Debug, Default)]
pub struct StaticInventory {
    instances: DashMap<(String, String), InstanceDetails>,
}

impl StaticInventory {
    /// Create an empty inventory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a running instance.
    pub fn add_running(&self, instance_id: &str, region: &str, address: Option<&str>) {
        self.set(
            instance_id,
            region,
            InstanceDetails {
                state: InstanceState::Running,
                address: address.map(ToOwned::to_owned),
                instance_type: None,
                checked_at: Utc::now(),
            },
        );
    }

    /// Add or replace an instance with explicit details.
    pub fn set(&self, instance_id: &str, region: &str, details: InstanceDetails) {
        self.instances
            .insert((instance_id.to_owned(), region.to_owned()), details);
    }

    /// Change the state of a known instance.
    pub fn set_state(&self, instance_id: &str, region: &str, state: InstanceState) {
        if let Some(mut details) = self
            .instances
            .get_mut(&(instance_id.to_owned(), region.to_owned()))
        {
            details.state = state;
        }
    }

    /// Forget an instance.
    pub fn remove(&self, instance_id: &str, region: &str) {
        self.instances
            .remove(&(instance_id.to_owned(), region.to_owned()));
    }
}

#[async_trait]
impl CloudInventory for StaticInventory {
    async fn describe_instance(
        &self,
        instance_id: &str,
        region: &str,
    ) -> ControlResult<Option<InstanceDetails>> {
        Ok(self
            .instances
            .get(&(instance_id.to_owned(), region.to_owned()))
            .map(|entry| InstanceDetails {
                checked_at: Utc::now(),
                ..entry.value().clone()
            }))
    }
}

/// Instance description returned by the inventory HTTP API.
#[derive(Debug, Deserialize)]
struct RawInstance {
    state: InstanceState,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    instance_type: Option<String>,
}

/// Inventory backed by an HTTP API.
///
/// `GET {base_url}/regions/{region}/instances/{instance_id}` returns the
/// instance as JSON, or 404 if it does not exist.
#[derive(Debug, Clone)]
pub struct HttpInventory {
    client: Client,
    base_url: String,
}

impl HttpInventory {
    /// Create a new inventory client from configuration.
    pub fn new(config: &InventoryConfig) -> ControlResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(ControlError::Http)?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_owned(),
        })
    }
}

#[async_trait]
impl CloudInventory for HttpInventory {
    async fn describe_instance(
        &self,
        instance_id: &str,
        region: &str,
    ) -> ControlResult<Option<InstanceDetails>> {
        let url = format!(
            "{}/regions/{}/instances/{}",
            self.base_url, region, instance_id
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(ControlError::Http)?;

        match response.status() {
            StatusCode::OK => {
                let raw: RawInstance = response.json().await.map_err(ControlError::Http)?;
                Ok(Some(InstanceDetails {
                    state: raw.state,
                    address: raw.address,
                    instance_type: raw.instance_type,
                    checked_at: Utc::now(),
                }))
            }
            StatusCode::NOT_FOUND => Ok(None),
            status => Err(ControlError::transient(format!(
                "inventory lookup for {instance_id} failed: {status}"
            ))),
        }
    }
}
