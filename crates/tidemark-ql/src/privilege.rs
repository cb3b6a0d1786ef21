//! Privilege levels and the per-statement execution requirements built from them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Access level a user holds on a database.
///
/// Levels are totally ordered: `NoPrivileges < Read < Write < All`, so holding a
/// higher level satisfies any lower requirement.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Privilege {
    /// No access.
    #[default]
    NoPrivileges,
    /// May read series from the database.
    Read,
    /// May write points into the database.
    Write,
    /// Read and write.
    All,
}

impl Privilege {
    /// Returns true if holding `self` satisfies a requirement of `required`.
    pub fn satisfies(self, required: Privilege) -> bool {
        self >= required
    }
}

impl fmt::Display for Privilege {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Privilege::NoPrivileges => "NO PRIVILEGES",
            Privilege::Read => "READ",
            Privilege::Write => "WRITE",
            Privilege::All => "ALL PRIVILEGES",
        };
        f.write_str(s)
    }
}

/// A single privilege a statement needs in order to execute.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPrivilege {
    /// Only cluster administrators may execute the statement.
    pub admin: bool,
    /// Database the privilege applies to. `None` means the caller's default database.
    pub database: Option<String>,
    /// Minimum level required on `database`.
    pub privilege: Privilege,
}

impl ExecutionPrivilege {
    /// Requirement satisfied only by cluster administrators.
    pub fn admin() -> Self {
        Self {
            admin: true,
            database: None,
            privilege: Privilege::All,
        }
    }

    /// Requirement for `privilege` on `database` (`None` is the default database).
    pub fn on(database: Option<&str>, privilege: Privilege) -> Self {
        Self {
            admin: false,
            database: database.filter(|d| !d.is_empty()).map(str::to_string),
            privilege,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_privilege_ordering() {
        assert!(Privilege::NoPrivileges < Privilege::Read);
        assert!(Privilege::Read < Privilege::Write);
        assert!(Privilege::Write < Privilege::All);
    }

    #[test]
    fn test_all_satisfies_read_and_write() {
        assert!(Privilege::All.satisfies(Privilege::Read));
        assert!(Privilege::All.satisfies(Privilege::Write));
        assert!(!Privilege::Read.satisfies(Privilege::Write));
        assert!(Privilege::Write.satisfies(Privilege::Write));
    }

    #[test]
    fn test_display() {
        assert_eq!(Privilege::Read.to_string(), "READ");
        assert_eq!(Privilege::All.to_string(), "ALL PRIVILEGES");
    }

    #[test]
    fn test_on_empty_database_means_default() {
        let p = ExecutionPrivilege::on(Some(""), Privilege::Read);
        assert_eq!(p.database, None);
        assert!(!p.admin);

        let p = ExecutionPrivilege::on(Some("foo"), Privilege::Write);
        assert_eq!(p.database.as_deref(), Some("foo"));
    }

    #[test]
    fn test_serde_roundtrip() {
        let p = ExecutionPrivilege::on(Some("foo"), Privilege::Write);
        let json = serde_json::to_string(&p).unwrap();
        let back: ExecutionPrivilege = serde_json::from_str(&json).unwrap();
        assert_eq!(p, back);
    }
}
