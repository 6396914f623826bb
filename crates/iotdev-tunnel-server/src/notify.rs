//! Tunnel-open notifications to destination things.

use std::sync::Arc;

use iotdev_mqtt::{Channel, QoS};
use iotdev_protocol::{IotResult, ResultExt, TunnelNotification, topics};

/// Publishes [`TunnelNotification`]s at QoS 1.
pub struct Notifier {
    channel: Arc<dyn Channel>,
    topic_format: String,
}

impl Notifier {
    /// `topic_format` holds a `{thing_name}` placeholder.
    pub fn new(channel: Arc<dyn Channel>, topic_format: impl Into<String>) -> Self {
        Self {
            channel,
            topic_format: topic_format.into(),
        }
    }

    pub fn topic_for(&self, thing_name: &str) -> String {
        topics::format_thing_topic(&self.topic_format, thing_name)
    }

    pub async fn notify(&self, thing_name: &str, notification: &TunnelNotification) -> IotResult<()> {
        let topic = self.topic_for(thing_name);
        let payload = serde_json::to_vec(notification)?;
        self.channel
            .publish(&topic, &payload, QoS::AtLeastOnce)
            .await
            .wrap_err("publishing tunnel notification")?;
        tracing::info!(thing = thing_name, %topic, mode = %notification.client_mode, "tunnel notification sent");
        Ok(())
    }
}
