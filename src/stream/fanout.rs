use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;

use crate::error::DeliveryError;
use crate::faces::FramePayload;

use super::registry::SubscriberHandle;

/// Outcome of one publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Sends each payload to every subscriber in a snapshot. A failed send is
/// logged and counted; it neither stops other sends nor unregisters anyone.
#[derive(Debug, Clone, Default)]
pub struct Fanout {
    send_timeout: Option<Duration>,
}

impl Fanout {
    pub fn new(send_timeout: Option<Duration>) -> Self {
        Self { send_timeout }
    }

    pub async fn publish(&self, payload: &FramePayload, subscribers: &[SubscriberHandle]) -> DeliveryReport {
        if subscribers.is_empty() {
            return DeliveryReport::default();
        }

        let text: Arc<str> = match serde_json::to_string(payload) {
            Ok(text) => text.into(),
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize payload");
                return DeliveryReport {
                    delivered: 0,
                    failed: subscribers.len(),
                };
            }
        };

        let sends = subscribers
            .iter()
            .map(|subscriber| self.deliver(subscriber, Arc::clone(&text)));

        let mut report = DeliveryReport::default();
        for (subscriber, result) in subscribers.iter().zip(join_all(sends).await) {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(
                        subscriber = %subscriber.id,
                        remote = %subscriber.remote,
                        error = %e,
                        "Failed to send to client"
                    );
                }
            }
        }
        report
    }

    async fn deliver(&self, subscriber: &SubscriberHandle, text: Arc<str>) -> Result<(), DeliveryError> {
        match self.send_timeout {
            Some(limit) => tokio::time::timeout(limit, subscriber.send(text))
                .await
                .unwrap_or_else(|_| Err(DeliveryError::Timeout(limit.as_millis() as u64))),
            None => subscriber.send(text).await,
        }
    }
}
