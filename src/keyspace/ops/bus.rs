use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    keyspace::{abstraction::ChannelMessage, KeyspaceAdapter},
    service::bus::{ReadReceiptUpdate, CHANNEL_READ_RECEIPT_UPDATE},
    Result,
};

#[async_trait]
impl crate::service::bus::Data for KeyspaceAdapter {
    fn subscribe(&self, channels: Vec<String>) -> mpsc::UnboundedReceiver<ChannelMessage> {
        self.engine().subscribe(channels)
    }

    async fn publish_read_receipt(&self, event: &ReadReceiptUpdate) -> Result<()> {
        self.publish_json(CHANNEL_READ_RECEIPT_UPDATE, event).await
    }
}
