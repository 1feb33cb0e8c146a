use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;

use ipcbus_wire::{assemble_payload, MsgType, Priority, Segment};

use crate::error::Result;

/// One logical message as handed to the application.
///
/// Header fields come from the chain head; the payload is the fragments'
/// payloads reassembled in fragment order.
#[derive(Debug, Clone)]
pub struct Delivery {
    src: u32,
    dst: u32,
    msg_id: u32,
    context: u32,
    msg_type: MsgType,
    ctl_code: u8,
    priority: Priority,
    payload: Bytes,
}

impl Delivery {
    /// Collapse a reassembled chain into a delivery. `None` on an empty chain.
    pub fn from_chain(chain: &[Segment]) -> Option<Self> {
        let head = chain.first()?;
        Some(Self {
            src: head.src(),
            dst: head.dst(),
            msg_id: head.msg_id(),
            context: head.context(),
            msg_type: head.msg_type(),
            ctl_code: head.ctl_code(),
            priority: head.priority(),
            payload: assemble_payload(chain),
        })
    }

    pub fn src(&self) -> u32 {
        self.src
    }

    pub fn dst(&self) -> u32 {
        self.dst
    }

    pub fn msg_id(&self) -> u32 {
        self.msg_id
    }

    /// Correlation ID; zero for unsolicited messages.
    pub fn context(&self) -> u32 {
        self.context
    }

    pub fn msg_type(&self) -> MsgType {
        self.msg_type
    }

    pub fn ctl_code(&self) -> u8 {
        self.ctl_code
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Decode a value-typed payload.
    pub fn value<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Application callback invoked by dispatcher workers for each delivery.
pub type DeliveryHandler = Arc<dyn Fn(&Delivery) + Send + Sync>;
