//! Vendor command protocols and the request/response queue they share.
//!
//! Every engine follows the same contract: encode the request into the
//! vendor framing, push it through the device's [`queue::CommandQueue`],
//! decode the typed reply, and raise a typed error on malformed or
//! unsuccessful responses.

pub mod am43;
pub mod ecam;
pub mod inmotion;
pub mod queue;
pub mod redmond;

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::ble::backend::BleClient;
use crate::error::Result;

pub use queue::{CommandQueue, DEFAULT_COMMAND_TIMEOUT, FrameSink};

/// [`FrameSink`] writing frames to one characteristic of a live client.
pub struct CharacteristicSink {
    client: Arc<dyn BleClient>,
    characteristic: Uuid,
    with_response: bool,
}

impl CharacteristicSink {
    pub fn new(client: Arc<dyn BleClient>, characteristic: Uuid, with_response: bool) -> Self {
        Self {
            client,
            characteristic,
            with_response,
        }
    }
}

#[async_trait]
impl FrameSink for CharacteristicSink {
    async fn write_frame(&self, frame: &[u8]) -> Result<()> {
        self.client
            .write_characteristic(self.characteristic, frame, self.with_response)
            .await
    }
}
