//! Demo handlers with simulated latency

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::registry::{HandlerRegistry, HandlerResult, TaskHandler, TaskInvocation};

/// Sends an email (simulated)
pub struct EmailHandler {
    pub latency: Duration,
}

#[async_trait]
impl TaskHandler for EmailHandler {
    async fn handle(&self, invocation: &TaskInvocation) -> HandlerResult {
        tokio::time::sleep(self.latency).await;
        let to = invocation.payload.get("email").cloned().unwrap_or(Value::Null);
        Ok(json!({"status": "email_sent", "to": to}))
    }
}

/// Processes a batch of records (simulated)
pub struct DataProcessingHandler {
    pub latency: Duration,
}

#[async_trait]
impl TaskHandler for DataProcessingHandler {
    async fn handle(&self, invocation: &TaskInvocation) -> HandlerResult {
        tokio::time::sleep(self.latency).await;
        let records = invocation
            .payload
            .get("count")
            .cloned()
            .unwrap_or_else(|| json!(100));
        Ok(json!({"status": "processed", "records": records}))
    }
}

/// Generates a report (simulated)
pub struct ReportHandler {
    pub latency: Duration,
}

#[async_trait]
impl TaskHandler for ReportHandler {
    async fn handle(&self, invocation: &TaskInvocation) -> HandlerResult {
        tokio::time::sleep(self.latency).await;
        Ok(json!({
            "status": "generated",
            "report_id": format!("RPT-{}", invocation.task_id),
        }))
    }
}

impl HandlerRegistry {
    /// Registry with the `email`, `data_processing` and `report_generation` handlers
    ///
    /// Report generation takes five times `latency`.
    pub fn with_builtin_handlers(latency: Duration) -> Self {
        let mut registry = Self::new();
        registry.register("email", EmailHandler { latency });
        registry.register("data_processing", DataProcessingHandler { latency });
        registry.register(
            "report_generation",
            ReportHandler {
                latency: latency * 5,
            },
        );
        registry
    }
}
