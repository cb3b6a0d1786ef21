//! Query authorization against user privileges.

use tidemark_ql::{Query, Statement};

use crate::error::MetaError;
use crate::info::UserInfo;

fn denied(user: &UserInfo, stmt: &Statement, requirement: String) -> MetaError {
    MetaError::Unauthorized {
        reason: format!(
            "{} not authorized to execute '{}': requires {}",
            user.name, stmt, requirement
        ),
    }
}

/// Checks that `user` may execute every statement of `query`.
///
/// Without a user the query is allowed only while authentication is disabled.
/// Admins may execute anything. For everyone else each statement's required
/// privileges must all be held, with an unqualified database resolving to
/// `default_database`. The first unmet requirement is reported.
pub fn authorize(
    user: Option<&UserInfo>,
    query: &Query,
    default_database: &str,
    authentication_enabled: bool,
) -> Result<(), MetaError> {
    let Some(user) = user else {
        if authentication_enabled {
            return Err(MetaError::Unauthorized {
                reason: "no user provided".to_string(),
            });
        }
        return Ok(());
    };
    if user.admin {
        return Ok(());
    }

    for stmt in &query.statements {
        for required in stmt.required_privileges() {
            if required.admin {
                return Err(denied(user, stmt, "cluster admin".to_string()));
            }
            let database = required.database.as_deref().unwrap_or(default_database);
            if !user.authorize(required.privilege, database) {
                return Err(denied(
                    user,
                    stmt,
                    format!("{} on {}", required.privilege, database),
                ));
            }
        }
    }
    Ok(())
}
