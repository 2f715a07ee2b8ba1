use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;

/// A serializable description of one unit of work handed to the external queue. Opaque to the
/// core beyond construction; the queue and the workers interpret `operation_name` and the
/// argument maps.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskSignature {
    pub operation_name: String,
    pub positional_args: Vec<Value>,
    pub keyword_args: serde_json::Map<String, Value>,
    pub target_queue_name: String,
    pub priority: u8,
}

/// The durable task queue, generalized to `enqueue`/`revoke` (§6, §9). The dispatcher and C7's
/// cancel path depend on this abstraction, never a concrete queue client.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, signature: TaskSignature) -> Result<String, CoreError>;
    async fn revoke(&self, task_id: &str, terminate: bool) -> Result<(), CoreError>;
}
