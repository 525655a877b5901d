//! Delivery of frame results to connected WebSocket clients.
//!
//! The broadcast loop produces one payload per frame; the fan-out sends it to
//! a snapshot of the connection registry; the server adds and removes
//! registry members as clients connect and disconnect.

pub mod broadcast;
pub mod fanout;
pub mod registry;
pub mod server;

pub use broadcast::{BroadcastLoop, LoopState, LoopSummary};
pub use fanout::{DeliveryReport, Fanout};
pub use registry::{ConnectionRegistry, PayloadSink, SubscriberHandle, SubscriberId};

#[cfg(test)]
pub(crate) mod testing {
    use futures_util::future::BoxFuture;
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};

    use super::PayloadSink;
    use crate::error::DeliveryError;

    pub fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    /// Keeps every message it is sent.
    #[derive(Default)]
    pub struct RecordingSink {
        messages: Mutex<Vec<String>>,
    }

    impl RecordingSink {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn messages(&self) -> Vec<String> {
            self.messages.lock().unwrap().clone()
        }
    }

    impl PayloadSink for RecordingSink {
        fn send(&self, text: Arc<str>) -> BoxFuture<'_, Result<(), DeliveryError>> {
            Box::pin(async move {
                self.messages.lock().unwrap().push(text.to_string());
                Ok(())
            })
        }
    }

    /// A connection that has gone away.
    pub struct FailingSink;

    impl PayloadSink for FailingSink {
        fn send(&self, _text: Arc<str>) -> BoxFuture<'_, Result<(), DeliveryError>> {
            Box::pin(async { Err(DeliveryError::Send("connection reset".into())) })
        }
    }

    /// A client that never drains its socket.
    pub struct StalledSink;

    impl PayloadSink for StalledSink {
        fn send(&self, _text: Arc<str>) -> BoxFuture<'_, Result<(), DeliveryError>> {
            Box::pin(futures_util::future::pending())
        }
    }
}
