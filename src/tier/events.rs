//! Tiering event stream contract.
//!
//! Events arrive from an ordered, partitioned, at-least-once log broker run
//! by the ML subsystem. The broker client is an external collaborator, so
//! consumption goes through the [`EventSource`] seam: a real deployment
//! implements it over its broker's consumer group; tests and local runs use
//! [`ChannelSource`].
//!
//! Offsets are committed after the enqueue-or-drop decision, never after
//! migration completion, keeping the consume loop non-blocking.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::meta::types::Tier;

/// One recommendation from the ML stream (snake_case JSON wire format)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TieringRequest {
    /// Epoch seconds when the model emitted the recommendation
    pub timestamp: f64,
    pub bucket_name: String,
    pub object_key: String,
    pub current_tier: Tier,
    pub recommended_tier: Tier,
    /// Model confidence in [0, 1]
    pub confidence: f64,
    #[serde(default)]
    pub probability_hot: f64,
    #[serde(default)]
    pub model_version: String,
}

/// The broker-consumption seam.
///
/// `recv` yields `(offset, payload)` in partition order and `None` once the
/// stream closes; `ack` marks the offset processed. At-least-once delivery
/// means the same offset may be seen again after a restart.
#[async_trait]
pub trait EventSource: Send {
    async fn recv(&mut self) -> Option<(u64, Vec<u8>)>;
    async fn ack(&mut self, offset: u64);
}

/// In-memory event source over a tokio channel, with an observable ack
/// watermark. Used by tests and local single-process runs.
pub struct ChannelSource {
    rx: mpsc::Receiver<Vec<u8>>,
    next_offset: u64,
    acked: Arc<AtomicU64>,
}

impl ChannelSource {
    pub fn new(rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            rx,
            next_offset: 0,
            acked: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Handle observing how far the consumer has acked (offset + 1)
    pub fn ack_watermark(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.acked)
    }
}

#[async_trait]
impl EventSource for ChannelSource {
    async fn recv(&mut self) -> Option<(u64, Vec<u8>)> {
        let payload = self.rx.recv().await?;
        let offset = self.next_offset;
        self.next_offset += 1;
        Some((offset, payload))
    }

    async fn ack(&mut self, offset: u64) {
        self.acked.store(offset + 1, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_format() {
        let json = r#"{
            "timestamp": 1722400000.5,
            "bucket_name": "b1",
            "object_key": "logs/app.log",
            "current_tier": "cold",
            "recommended_tier": "hot",
            "confidence": 0.9,
            "probability_hot": 0.88,
            "model_version": "v3"
        }"#;

        let event: TieringRequest = serde_json::from_str(json).unwrap();
        assert_eq!(event.bucket_name, "b1");
        assert_eq!(event.current_tier, Tier::Cold);
        assert_eq!(event.recommended_tier, Tier::Hot);
        assert!((event.confidence - 0.9).abs() < f64::EPSILON);
    }

    #[test]
    fn test_unknown_tier_fails_parse() {
        let json = r#"{
            "timestamp": 1.0,
            "bucket_name": "b1",
            "object_key": "x",
            "current_tier": "warm",
            "recommended_tier": "hot",
            "confidence": 0.9
        }"#;
        assert!(serde_json::from_str::<TieringRequest>(json).is_err());
    }

    #[tokio::test]
    async fn test_channel_source_offsets_and_acks() {
        let (tx, rx) = mpsc::channel(4);
        let mut source = ChannelSource::new(rx);
        let watermark = source.ack_watermark();

        tx.send(b"a".to_vec()).await.unwrap();
        tx.send(b"b".to_vec()).await.unwrap();
        drop(tx);

        let (offset, payload) = source.recv().await.unwrap();
        assert_eq!((offset, payload.as_slice()), (0, b"a".as_slice()));
        source.ack(0).await;
        assert_eq!(watermark.load(Ordering::Acquire), 1);

        let (offset, _) = source.recv().await.unwrap();
        assert_eq!(offset, 1);
        assert!(source.recv().await.is_none());
    }
}
