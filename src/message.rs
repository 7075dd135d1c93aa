//! # Push Message Routing
//!
//! The [`MessageHandler`] is the push consumer of a transport channel. It
//! decodes push frames into [`PushMessage`]s and hands them to the
//! subscription callback, if one was configured, in the order they arrived.
//! It never sees request/response traffic.

use log::{debug, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::channel::TransportChannel;
use crate::config::{MessageCallback, SubscriptionConfig};
use crate::frame::{Frame, FrameCodec, FrameKind, PushMessage};

pub struct MessageHandler {
    callback: Option<MessageCallback>,
    codec: FrameCodec,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl MessageHandler {
    pub fn new(callback: Option<MessageCallback>, codec: FrameCodec) -> Self {
        Self {
            callback,
            codec,
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Build a handler from the subscription settings and install it as the
    /// channel's push consumer.
    pub fn register(
        channel: &TransportChannel,
        subscriptions: Option<&SubscriptionConfig>,
    ) -> Arc<Self> {
        let callback = subscriptions.and_then(|s| s.message_callback().cloned());
        let handler = Arc::new(Self::new(callback, channel.codec()));
        let consumer = Arc::clone(&handler);
        channel.set_push_callback(Arc::new(move |frame: Frame| consumer.handle(frame)));
        handler
    }

    pub fn has_callback(&self) -> bool {
        self.callback.is_some()
    }

    /// Decode one inbound frame and deliver it.
    pub fn handle(&self, frame: Frame) {
        if frame.kind != FrameKind::Push {
            warn!("Ignoring unsolicited {:?} frame (id {:?})", frame.kind, frame.id);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let Some(callback) = &self.callback else {
            debug!("No subscription callback, dropping push message");
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        match self.codec.decode::<PushMessage>(&frame.payload) {
            Ok(message) => {
                callback(message);
                self.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                warn!("Failed to decode push message: {}", e);
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Messages handed to the callback so far
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Frames discarded (no callback, undecodable, or not a push)
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
