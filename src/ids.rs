//! Newtype identifiers for every stored entity.
//!
//! Keeping ids as distinct types means a `TaskId` can never be handed to a
//! run lookup by accident; the store surface is typed end to end.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! entity_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

entity_id!(
    /// Unique identifier for a template (step or workflow definition).
    TemplateId
);
entity_id!(
    /// Unique identifier for a run (execution instance of a template).
    RunId
);
entity_id!(
    /// Unique identifier for a data node in a data tree.
    DataNodeId
);
entity_id!(
    /// Unique identifier for an immutable data object.
    DataObjectId
);
entity_id!(
    /// Unique identifier for an upload resource backing a file object.
    ResourceId
);
entity_id!(
    /// Unique identifier for a channel endpoint (input, output, connector).
    IoNodeId
);
entity_id!(
    /// Unique identifier for a task (one ready input combination).
    TaskId
);
entity_id!(
    /// Unique identifier for a task attempt.
    TaskAttemptId
);
