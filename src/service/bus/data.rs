use async_trait::async_trait;
use tokio::sync::mpsc;

use super::ReadReceiptUpdate;
use crate::{keyspace::abstraction::ChannelMessage, Result};

#[async_trait]
pub trait Data: Send + Sync {
    /// Long-lived multiplexed subscription on the given channels. The
    /// engine reconnects on connection loss; events in the gap are lost
    /// and reconciled by the periodic sweep.
    fn subscribe(&self, channels: Vec<String>) -> mpsc::UnboundedReceiver<ChannelMessage>;

    async fn publish_read_receipt(&self, event: &ReadReceiptUpdate) -> Result<()>;
}
