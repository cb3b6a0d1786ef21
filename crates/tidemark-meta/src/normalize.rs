//! Rewrites measurement references into `"database"."policy".name` form.

use tidemark_ql::{Measurement, Query, Statement};

use crate::data::MetaData;
use crate::error::MetaError;

/// Fully qualifies `measurement` in place.
///
/// The database is the explicit one or `default_database`; the policy is the
/// explicit one, which must exist, or the database's default policy.
pub fn normalize_measurement(
    data: &MetaData,
    measurement: &mut Measurement,
    default_database: &str,
) -> Result<(), MetaError> {
    if measurement.name.is_empty() {
        return Err(MetaError::InvalidMeasurement);
    }

    let database = measurement
        .database
        .as_deref()
        .filter(|d| !d.is_empty())
        .unwrap_or(default_database)
        .to_string();
    let db = data
        .database(&database)
        .ok_or_else(|| MetaError::DatabaseNotFound(database.clone()))?;

    let policy = match measurement.retention_policy.as_deref().filter(|rp| !rp.is_empty()) {
        Some(rp) => {
            if db.retention_policy(rp).is_none() {
                return Err(MetaError::RetentionPolicyNotFound {
                    database,
                    name: rp.to_string(),
                });
            }
            rp.to_string()
        }
        None => db
            .default_retention_policy
            .clone()
            .ok_or_else(|| MetaError::DefaultRetentionPolicyNotSet(database.clone()))?,
    };

    measurement.database = Some(database);
    measurement.retention_policy = Some(policy);
    Ok(())
}

/// Normalizes every measurement a statement reads from or writes to.
pub fn normalize_statement(
    data: &MetaData,
    statement: &mut Statement,
    default_database: &str,
) -> Result<(), MetaError> {
    for measurement in statement.measurements_mut() {
        normalize_measurement(data, measurement, default_database)?;
    }
    Ok(())
}

/// Normalizes every statement of a query.
pub fn normalize_query(data: &MetaData, query: &mut Query, default_database: &str) -> Result<(), MetaError> {
    for statement in &mut query.statements {
        normalize_statement(data, statement, default_database)?;
    }
    Ok(())
}
