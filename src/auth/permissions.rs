use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    DataEntry,
    Archivist,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Create,
    Read,
    Update,
    Delete,
    Archive,
    Restore,
    ManageUsers,
    ManageCategories,
    ViewReports,
}

const ADMIN_PERMISSIONS: &[Permission] = &[
    Permission::Create,
    Permission::Read,
    Permission::Update,
    Permission::Delete,
    Permission::Archive,
    Permission::Restore,
    Permission::ManageUsers,
    Permission::ManageCategories,
    Permission::ViewReports,
];

const DATA_ENTRY_PERMISSIONS: &[Permission] =
    &[Permission::Create, Permission::Read, Permission::Update];

const ARCHIVIST_PERMISSIONS: &[Permission] =
    &[Permission::Read, Permission::Archive, Permission::Restore];

impl Role {
    pub const ALL: [Role; 3] = [Role::Admin, Role::DataEntry, Role::Archivist];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::DataEntry => "data_entry",
            Role::Archivist => "archivist",
        }
    }

    pub fn permissions(self) -> &'static [Permission] {
        match self {
            Role::Admin => ADMIN_PERMISSIONS,
            Role::DataEntry => DATA_ENTRY_PERMISSIONS,
            Role::Archivist => ARCHIVIST_PERMISSIONS,
        }
    }

    pub fn can(self, permission: Permission) -> bool {
        self.permissions().contains(&permission)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .into_iter()
            .find(|role| role.as_str() == value)
            .ok_or_else(|| format!("invalid role '{value}'. Allowed roles: admin, data_entry, archivist"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_entry_cannot_delete_or_manage() {
        let role = Role::DataEntry;
        assert!(role.can(Permission::Create));
        assert!(role.can(Permission::Read));
        assert!(role.can(Permission::Update));
        assert!(!role.can(Permission::Delete));
        assert!(!role.can(Permission::Archive));
        assert!(!role.can(Permission::ManageUsers));
        assert!(!role.can(Permission::ManageCategories));
    }

    #[test]
    fn archivist_reads_archives_and_restores_only() {
        let role = Role::Archivist;
        assert!(role.can(Permission::Read));
        assert!(role.can(Permission::Archive));
        assert!(role.can(Permission::Restore));
        assert!(!role.can(Permission::Create));
        assert!(!role.can(Permission::Update));
        assert!(!role.can(Permission::Delete));
    }

    #[test]
    fn admin_holds_every_permission() {
        for permission in ADMIN_PERMISSIONS {
            assert!(Role::Admin.can(*permission));
        }
        assert_eq!(Role::Admin.permissions().len(), 9);
    }

    #[test]
    fn roles_parse_from_their_names() {
        for role in Role::ALL {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
        assert!("superuser".parse::<Role>().is_err());
    }
}
