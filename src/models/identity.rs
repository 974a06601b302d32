use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BookingError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Consumer,
    Owner,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Consumer => "consumer",
            Role::Owner => "owner",
            Role::Admin => "admin",
        }
    }
}

/// Authenticated principal supplied by the identity collaborator. Trusted as-is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Caller {
    pub user_id: Uuid,
    pub role: Role,
    pub suspended: bool,
    pub email: Option<String>,
}

impl Caller {
    pub fn new(user_id: Uuid, role: Role) -> Self {
        Self {
            user_id,
            role,
            suspended: false,
            email: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    CreateBooking,
    ManageBooking,
    CreateField,
    ModerateField,
    ReadNotifications,
}

/// Role check performed at the boundary before any core operation runs.
pub fn authorize(caller: Option<&Caller>, action: Action) -> Result<&Caller> {
    let caller = caller.ok_or(BookingError::Unauthorized)?;

    if caller.suspended {
        return Err(BookingError::Forbidden("account suspended".to_string()));
    }

    let allowed = match action {
        Action::CreateBooking => matches!(caller.role, Role::Consumer | Role::Owner),
        Action::ManageBooking | Action::ReadNotifications => true,
        Action::CreateField => caller.role == Role::Owner,
        Action::ModerateField => caller.role == Role::Admin,
    };

    if !allowed {
        return Err(BookingError::Forbidden(format!(
            "role '{}' may not perform {:?}",
            caller.role.as_str(),
            action
        )));
    }

    Ok(caller)
}
