use serde::{Deserialize, Serialize};

use cms_core::{IntegrationId, UserId};

/// The actor who initiated a job: exactly one of a user or an integration.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Owner {
    User(UserId),
    Integration(IntegrationId),
}

impl Owner {
    pub fn user_id(&self) -> Option<UserId> {
        match self {
            Owner::User(id) => Some(*id),
            Owner::Integration(_) => None,
        }
    }

    pub fn integration_id(&self) -> Option<IntegrationId> {
        match self {
            Owner::Integration(id) => Some(*id),
            Owner::User(_) => None,
        }
    }
}

impl From<UserId> for Owner {
    fn from(id: UserId) -> Self {
        Owner::User(id)
    }
}

impl From<IntegrationId> for Owner {
    fn from(id: IntegrationId) -> Self {
        Owner::Integration(id)
    }
}
