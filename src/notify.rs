//! Sighting notifications

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::entity::Sighting;
use crate::types::{Result, ScanError};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait Notifier: Send + Sync {
    fn is_eligible(&self, sighting: &Sighting) -> bool;

    /// Deliver a notification; returns whether it was sent and why (not)
    async fn notify(&self, sighting: &Sighting) -> (bool, String);
}

/// Posts sightings of selected species to a webhook
pub struct WebhookNotifier {
    species: HashSet<u32>,
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, species: impl IntoIterator<Item = u32>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .map_err(|e| ScanError::Internal(format!("webhook client: {}", e)))?;
        Ok(Self {
            species: species.into_iter().collect(),
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn is_eligible(&self, sighting: &Sighting) -> bool {
        sighting.valid.is_trusted() && self.species.contains(&sighting.species_id)
    }

    async fn notify(&self, sighting: &Sighting) -> (bool, String) {
        debug!(encounter_id = sighting.encounter_id, "Posting sighting to webhook");
        match self.client.post(&self.url).json(sighting).send().await {
            Ok(resp) if resp.status().is_success() => (
                true,
                format!("Sent notification for species {}", sighting.species_id),
            ),
            Ok(resp) => (
                false,
                format!("Webhook rejected notification: {}", resp.status()),
            ),
            Err(e) => (false, format!("Webhook request failed: {}", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Validity;

    fn sighting(species_id: u32, valid: Validity) -> Sighting {
        Sighting {
            encounter_id: 1,
            species_id,
            expire_timestamp: 0,
            lat: 0.0,
            lon: 0.0,
            spawn_id: 0,
            time_till_hidden_ms: 0,
            seen: None,
            valid,
            encounter: None,
        }
    }

    #[test]
    fn test_eligibility() {
        let notifier = WebhookNotifier::new("http://127.0.0.1:1/hook", [149, 150]).unwrap();
        assert!(notifier.is_eligible(&sighting(149, Validity::Valid)));
        assert!(notifier.is_eligible(&sighting(150, Validity::Fixed)));
        assert!(!notifier.is_eligible(&sighting(150, Validity::Invalid)));
        assert!(!notifier.is_eligible(&sighting(16, Validity::Valid)));
    }

    #[tokio::test]
    async fn test_unreachable_webhook_reports_failure() {
        let notifier = WebhookNotifier::new("http://127.0.0.1:1/hook", [149]).unwrap();
        let (sent, explanation) = notifier.notify(&sighting(149, Validity::Valid)).await;
        assert!(!sent);
        assert!(explanation.starts_with("Webhook request failed"));
    }
}
