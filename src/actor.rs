//! Caller identity handed down by the auth layer

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorRole {
    User,
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: Uuid,
    pub role: ActorRole,
}

impl Actor {
    pub fn user(user_id: Uuid) -> Self {
        Self {
            user_id,
            role: ActorRole::User,
        }
    }

    pub fn admin(user_id: Uuid) -> Self {
        Self {
            user_id,
            role: ActorRole::Admin,
        }
    }

    #[inline]
    pub fn is_admin(&self) -> bool {
        self.role == ActorRole::Admin
    }

    /// `owner` itself or any admin
    pub fn may_act_for(&self, owner: Uuid) -> bool {
        self.is_admin() || self.user_id == owner
    }
}
