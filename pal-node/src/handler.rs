//! Inbound message handlers, one per message type.

use async_trait::async_trait;
use pal_core::Envelope;

use crate::peers::PeerInfo;

/// Receives verified envelopes of the type it was registered for. Each call runs on its
/// own task, so a slow handler never stalls the link it came from.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, envelope: Envelope, from: PeerInfo) -> anyhow::Result<()>;
}

#[async_trait]
impl<F> MessageHandler for F
where
    F: Fn(Envelope, PeerInfo) -> anyhow::Result<()> + Send + Sync + 'static,
{
    async fn handle(&self, envelope: Envelope, from: PeerInfo) -> anyhow::Result<()> {
        (self)(envelope, from)
    }
}
