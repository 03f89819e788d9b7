use egress_types::{Notification, NotificationPublisher, Severity};

/// Publishes notifications into the diagnostic log. The real alerting
/// transport (email/webhook/chat) consumes the same trait; this
/// implementation is what a bare daemon runs with.
pub struct LogPublisher;

impl NotificationPublisher for LogPublisher {
    fn publish(&self, notification: Notification) {
        let meta = serde_json::to_string(&notification.metadata).unwrap_or_default();
        match notification.severity {
            Severity::Critical | Severity::High => {
                tracing::error!(
                    kind = %notification.kind,
                    severity = %notification.severity,
                    metadata = %meta,
                    "{}",
                    notification.message
                );
            }
            Severity::Medium => {
                tracing::warn!(
                    kind = %notification.kind,
                    severity = %notification.severity,
                    metadata = %meta,
                    "{}",
                    notification.message
                );
            }
            Severity::Low => {
                tracing::info!(
                    kind = %notification.kind,
                    severity = %notification.severity,
                    metadata = %meta,
                    "{}",
                    notification.message
                );
            }
        }
    }
}
