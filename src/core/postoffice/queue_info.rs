use serde::Serialize;

use crate::core::error::{BrokerError, Result};

/// Routing metadata for a queue, shared with other nodes through binding
/// events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueInfo {
    routing_name: String,
    cluster_name: String,
    address: String,
    filter_string: Option<String>,
    id: u64,
    distance: u32,
    consumer_count: u32,
    /// Filters of the attached consumers.
    filter_strings: Vec<String>,
}

impl QueueInfo {
    pub fn new(
        routing_name: &str,
        cluster_name: &str,
        address: &str,
        filter_string: Option<String>,
        id: u64,
        distance: Option<u32>,
    ) -> Result<Self> {
        if routing_name.is_empty() {
            return Err(BrokerError::InvalidArgument("routing name must not be empty".into()));
        }
        if cluster_name.is_empty() {
            return Err(BrokerError::InvalidArgument("cluster name must not be empty".into()));
        }
        if address.is_empty() {
            return Err(BrokerError::InvalidArgument("address must not be empty".into()));
        }
        let distance = distance
            .ok_or_else(|| BrokerError::InvalidArgument("distance must be set".into()))?;
        Ok(Self {
            routing_name: routing_name.to_string(),
            cluster_name: cluster_name.to_string(),
            address: address.to_string(),
            filter_string,
            id,
            distance,
            consumer_count: 0,
            filter_strings: Vec::new(),
        })
    }

    pub fn routing_name(&self) -> &str {
        &self.routing_name
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn filter_string(&self) -> Option<&str> {
        self.filter_string.as_deref()
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn distance(&self) -> u32 {
        self.distance
    }

    pub fn consumer_count(&self) -> u32 {
        self.consumer_count
    }

    pub fn filter_strings(&self) -> &[String] {
        &self.filter_strings
    }

    pub fn increment_consumers(&mut self) {
        self.consumer_count += 1;
    }

    pub fn decrement_consumers(&mut self) {
        self.consumer_count = self.consumer_count.saturating_sub(1);
    }

    pub fn add_filter_string(&mut self, filter: String) {
        self.filter_strings.push(filter);
    }

    pub fn remove_filter_string(&mut self, filter: &str) {
        if let Some(pos) = self.filter_strings.iter().position(|f| f == filter) {
            self.filter_strings.remove(pos);
        }
    }
}
