//! Channel endpoints: the nodes data flows through across the run tree.
//!
//! Every declared input/output on a run owns one endpoint; workflow runs
//! additionally own one connector per internal channel so sibling steps
//! never reference each other directly. An endpoint has at most one sender
//! feeding it; fan-out to many receivers is tracked as the reverse set.

use serde::{Deserialize, Serialize};

use crate::data::DataType;
use crate::error::ValidationError;
use crate::ids::{DataNodeId, IoNodeId, RunId};
use crate::store::Entity;

/// Direction/role of a channel endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoFlavor {
    Input,
    Output,
    Connector,
}

/// One endpoint of a named channel, owned by a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IoNode {
    pub id: IoNodeId,
    pub run: RunId,
    pub channel: String,
    pub flavor: IoFlavor,
    pub data_type: DataType,
    /// Inputs only: trailing array dimensions consumed together.
    pub gather_depth: u32,
    /// The endpoint feeding this one, once wired.
    pub sender: Option<IoNodeId>,
    /// Endpoints this one feeds.
    pub receivers: Vec<IoNodeId>,
    /// Root of the owned data tree; created lazily on first write.
    pub tree: Option<DataNodeId>,
}

impl IoNode {
    pub fn new(
        run: RunId,
        channel: impl Into<String>,
        flavor: IoFlavor,
        data_type: DataType,
        gather_depth: u32,
    ) -> Self {
        Self {
            id: IoNodeId::new(),
            run,
            channel: channel.into(),
            flavor,
            data_type,
            gather_depth,
            sender: None,
            receivers: Vec::new(),
            tree: None,
        }
    }

    /// Record the single sender. Re-wiring to the same sender is a no-op;
    /// a second distinct sender is fan-in and rejected.
    pub fn set_sender(&mut self, sender: IoNodeId) -> Result<(), ValidationError> {
        match self.sender {
            None => {
                self.sender = Some(sender);
                Ok(())
            }
            Some(existing) if existing == sender => Ok(()),
            Some(_) => Err(ValidationError::SenderAlreadySet { endpoint: self.id }),
        }
    }

    pub fn add_receiver(&mut self, receiver: IoNodeId) {
        if !self.receivers.contains(&receiver) {
            self.receivers.push(receiver);
        }
    }
}

impl Entity for IoNode {
    type Id = IoNodeId;
    const KIND: &'static str = "endpoint";

    fn id(&self) -> IoNodeId {
        self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_distinct_sender_is_fan_in() {
        let mut endpoint = IoNode::new(RunId::new(), "c", IoFlavor::Input, DataType::String, 0);
        let first = IoNodeId::new();
        endpoint.set_sender(first).unwrap();
        endpoint.set_sender(first).unwrap();
        let err = endpoint.set_sender(IoNodeId::new()).unwrap_err();
        assert!(matches!(err, ValidationError::SenderAlreadySet { .. }));
    }

    #[test]
    fn receivers_deduplicate() {
        let mut endpoint = IoNode::new(RunId::new(), "c", IoFlavor::Output, DataType::File, 0);
        let receiver = IoNodeId::new();
        endpoint.add_receiver(receiver);
        endpoint.add_receiver(receiver);
        assert_eq!(endpoint.receivers.len(), 1);
    }
}
