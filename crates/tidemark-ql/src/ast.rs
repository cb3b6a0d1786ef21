//! Statement AST shared by the metadata store, the authorizer and the query engine.
//!
//! Statements are built directly by callers; this crate does not parse query text.
//! Every node renders back to canonical query text through `Display`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::privilege::{ExecutionPrivilege, Privilege};

/// Double-quotes an identifier, escaping embedded quotes and backslashes.
pub fn quote_ident(ident: &str) -> String {
    let mut out = String::with_capacity(ident.len() + 2);
    out.push('"');
    for c in ident.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

fn is_bare_ident(ident: &str) -> bool {
    let mut chars = ident.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Renders an identifier bare when possible, quoted otherwise.
fn ident(name: &str) -> String {
    if is_bare_ident(name) {
        name.to_string()
    } else {
        quote_ident(name)
    }
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if d.is_zero() {
        return "INF".to_string();
    }
    if d.subsec_nanos() != 0 {
        return format!("{}ms", d.as_millis());
    }
    const UNITS: [(u64, &str); 4] = [(604_800, "w"), (86_400, "d"), (3_600, "h"), (60, "m")];
    for (width, suffix) in UNITS {
        if secs % width == 0 {
            return format!("{}{}", secs / width, suffix);
        }
    }
    format!("{}s", secs)
}

/// A reference to a measurement, optionally qualified by database and retention policy.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Measurement {
    /// Owning database; `None` resolves to the caller's default database.
    pub database: Option<String>,
    /// Retention policy; `None` resolves to the database's default policy.
    pub retention_policy: Option<String>,
    /// Measurement name.
    pub name: String,
}

impl Measurement {
    /// Unqualified reference to `name`.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            database: None,
            retention_policy: None,
            name: name.into(),
        }
    }

    /// Sets the database qualifier.
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Sets the retention policy qualifier.
    pub fn with_retention_policy(mut self, rp: impl Into<String>) -> Self {
        self.retention_policy = Some(rp.into());
        self
    }

    fn database_name(&self) -> Option<&str> {
        self.database.as_deref().filter(|d| !d.is_empty())
    }
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let db = self.database_name();
        let rp = self.retention_policy.as_deref().filter(|r| !r.is_empty());
        if let Some(db) = db {
            write!(f, "{}.", quote_ident(db))?;
        }
        if let Some(rp) = rp {
            f.write_str(&quote_ident(rp))?;
        }
        if db.is_some() || rp.is_some() {
            f.write_str(".")?;
        }
        if !self.name.is_empty() {
            f.write_str(&ident(&self.name))?;
        }
        Ok(())
    }
}

/// Destination of a `SELECT ... INTO`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// Measurement written to.
    pub measurement: Measurement,
}

/// A projected field. The expression is kept as opaque text.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    /// Expression text, e.g. `value` or `count(value)`.
    pub expr: String,
    /// Optional `AS` alias.
    pub alias: Option<String>,
}

impl Field {
    /// Field with no alias.
    pub fn expr(expr: impl Into<String>) -> Self {
        Self {
            expr: expr.into(),
            alias: None,
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expr)?;
        if let Some(alias) = &self.alias {
            write!(f, " AS {}", ident(alias))?;
        }
        Ok(())
    }
}

/// `SELECT` statement.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectStatement {
    /// Projected fields.
    pub fields: Vec<Field>,
    /// Optional `INTO` target.
    pub target: Option<Target>,
    /// Measurements read from.
    pub sources: Vec<Measurement>,
    /// `WHERE` clause text.
    pub condition: Option<String>,
    /// `GROUP BY` dimensions.
    pub group_by: Vec<String>,
    /// `LIMIT`, zero for none.
    pub limit: usize,
    /// `OFFSET`, zero for none.
    pub offset: usize,
}

impl SelectStatement {
    /// `SELECT <fields> FROM <sources>`.
    pub fn new(fields: Vec<Field>, sources: Vec<Measurement>) -> Self {
        Self {
            fields,
            sources,
            ..Default::default()
        }
    }

    /// Sets the `INTO` target.
    pub fn into_target(mut self, measurement: Measurement) -> Self {
        self.target = Some(Target { measurement });
        self
    }

    fn required_privileges(&self) -> Vec<ExecutionPrivilege> {
        let mut privs: Vec<ExecutionPrivilege> = Vec::new();
        for source in &self.sources {
            let p = ExecutionPrivilege::on(source.database_name(), Privilege::Read);
            if !privs.contains(&p) {
                privs.push(p);
            }
        }
        if privs.is_empty() {
            privs.push(ExecutionPrivilege::on(None, Privilege::Read));
        }
        if let Some(target) = &self.target {
            privs.push(ExecutionPrivilege::on(
                target.measurement.database_name(),
                Privilege::Write,
            ));
        }
        privs
    }

    fn measurements_mut(&mut self) -> Vec<&mut Measurement> {
        let mut out: Vec<&mut Measurement> = self.sources.iter_mut().collect();
        if let Some(target) = self.target.as_mut() {
            out.push(&mut target.measurement);
        }
        out
    }
}

impl fmt::Display for SelectStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SELECT ")?;
        write_joined(f, &self.fields)?;
        if let Some(target) = &self.target {
            write!(f, " INTO {}", target.measurement)?;
        }
        f.write_str(" FROM ")?;
        write_joined(f, &self.sources)?;
        if let Some(cond) = &self.condition {
            write!(f, " WHERE {}", cond)?;
        }
        if !self.group_by.is_empty() {
            write!(f, " GROUP BY {}", self.group_by.join(", "))?;
        }
        if self.limit > 0 {
            write!(f, " LIMIT {}", self.limit)?;
        }
        if self.offset > 0 {
            write!(f, " OFFSET {}", self.offset)?;
        }
        Ok(())
    }
}

fn write_joined<T: fmt::Display>(f: &mut fmt::Formatter<'_>, items: &[T]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{}", item)?;
    }
    Ok(())
}

/// `CREATE CONTINUOUS QUERY <name> ON <database> BEGIN <select> END`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuousQueryStatement {
    /// Query name, unique per database.
    pub name: String,
    /// Database the query runs against.
    pub database: String,
    /// The select that is executed on each interval.
    pub source: SelectStatement,
}

impl fmt::Display for ContinuousQueryStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CREATE CONTINUOUS QUERY {} ON {} BEGIN {} END",
            ident(&self.name),
            ident(&self.database),
            self.source
        )
    }
}

/// A single statement of a query.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Statement {
    /// `SELECT ...`
    Select(SelectStatement),
    /// `CREATE DATABASE <name>`
    CreateDatabase {
        /// Database name.
        name: String,
    },
    /// `DROP DATABASE <name>`
    DropDatabase {
        /// Database name.
        name: String,
    },
    /// `SHOW DATABASES`
    ShowDatabases,
    /// `CREATE RETENTION POLICY <name> ON <db> DURATION <d> REPLICATION <n> [DEFAULT]`
    CreateRetentionPolicy {
        /// Owning database.
        database: String,
        /// Policy name.
        name: String,
        /// Retention duration; zero is infinite.
        duration: Duration,
        /// Replication factor.
        replication: u32,
        /// Make this the database's default policy.
        default: bool,
    },
    /// `ALTER RETENTION POLICY <name> ON <db> ...`
    AlterRetentionPolicy {
        /// Owning database.
        database: String,
        /// Policy name.
        name: String,
        /// New duration, if changed.
        duration: Option<Duration>,
        /// New replication factor, if changed.
        replication: Option<u32>,
        /// Make this the database's default policy.
        default: bool,
    },
    /// `DROP RETENTION POLICY <name> ON <db>`
    DropRetentionPolicy {
        /// Owning database.
        database: String,
        /// Policy name.
        name: String,
    },
    /// `SHOW RETENTION POLICIES <db>`
    ShowRetentionPolicies {
        /// Database to list.
        database: String,
    },
    /// `CREATE USER <name> WITH PASSWORD <pw> [WITH ALL PRIVILEGES]`
    CreateUser {
        /// User name.
        name: String,
        /// Plaintext password.
        password: String,
        /// Grant cluster admin.
        admin: bool,
    },
    /// `DROP USER <name>`
    DropUser {
        /// User name.
        name: String,
    },
    /// `SET PASSWORD FOR <name> = <pw>`
    SetPassword {
        /// User name.
        name: String,
        /// New plaintext password.
        password: String,
    },
    /// `GRANT <privilege> [ON <db>] TO <user>`
    Grant {
        /// Level granted.
        privilege: Privilege,
        /// Database, or `None` for a cluster admin grant.
        database: Option<String>,
        /// Grantee.
        user: String,
    },
    /// `REVOKE <privilege> [ON <db>] FROM <user>`
    Revoke {
        /// Level revoked.
        privilege: Privilege,
        /// Database, or `None` for a cluster admin revoke.
        database: Option<String>,
        /// User losing the privilege.
        user: String,
    },
    /// `SHOW USERS`
    ShowUsers,
    /// `CREATE CONTINUOUS QUERY ...`
    CreateContinuousQuery(ContinuousQueryStatement),
    /// `DROP CONTINUOUS QUERY <name> ON <db>`
    DropContinuousQuery {
        /// Query name.
        name: String,
        /// Owning database.
        database: String,
    },
    /// `SHOW CONTINUOUS QUERIES`
    ShowContinuousQueries,
    /// `SHOW MEASUREMENTS`
    ShowMeasurements,
    /// `SHOW SERIES [FROM <m>]`
    ShowSeries {
        /// Optional source filter.
        source: Option<Measurement>,
    },
    /// `DROP SERIES [FROM <m>]`
    DropSeries {
        /// Optional source filter.
        source: Option<Measurement>,
    },
    /// `DROP MEASUREMENT <name>`
    DropMeasurement {
        /// Measurement name.
        name: String,
    },
    /// `SHOW TAG KEYS [FROM <m>]`
    ShowTagKeys {
        /// Optional source filter.
        source: Option<Measurement>,
    },
    /// `SHOW TAG VALUES [FROM <m>]`
    ShowTagValues {
        /// Optional source filter.
        source: Option<Measurement>,
    },
    /// `SHOW FIELD KEYS [FROM <m>]`
    ShowFieldKeys {
        /// Optional source filter.
        source: Option<Measurement>,
    },
    /// `CREATE SERVER <url>`
    CreateServer {
        /// Node URL.
        url: String,
    },
    /// `DROP SERVER <id>`
    DropServer {
        /// Node id.
        id: u64,
    },
    /// `SHOW SERVERS`
    ShowServers,
    /// `SHOW STATS`
    ShowStats,
    /// `SHOW DIAGNOSTICS`
    ShowDiagnostics,
}

impl Statement {
    /// Privileges a user must hold to execute this statement.
    pub fn required_privileges(&self) -> Vec<ExecutionPrivilege> {
        use Statement::*;
        match self {
            Select(s) => s.required_privileges(),
            CreateContinuousQuery(cq) => {
                let target_db = cq
                    .source
                    .target
                    .as_ref()
                    .and_then(|t| t.measurement.database_name());
                match target_db {
                    Some(db) => vec![
                        ExecutionPrivilege::on(Some(cq.database.as_str()), Privilege::Read),
                        ExecutionPrivilege::on(Some(db), Privilege::Write),
                    ],
                    None => vec![ExecutionPrivilege::on(Some(cq.database.as_str()), Privilege::Write)],
                }
            }
            DropContinuousQuery { database, .. } => {
                vec![ExecutionPrivilege::on(Some(database.as_str()), Privilege::Write)]
            }
            DropRetentionPolicy { database, .. } => {
                vec![ExecutionPrivilege::on(Some(database.as_str()), Privilege::Write)]
            }
            ShowRetentionPolicies { database } => {
                vec![ExecutionPrivilege::on(Some(database.as_str()), Privilege::Read)]
            }
            ShowContinuousQueries | ShowMeasurements => {
                vec![ExecutionPrivilege::on(None, Privilege::Read)]
            }
            ShowSeries { source }
            | ShowTagKeys { source }
            | ShowTagValues { source }
            | ShowFieldKeys { source } => vec![ExecutionPrivilege::on(
                source.as_ref().and_then(Measurement::database_name),
                Privilege::Read,
            )],
            DropSeries { source } => vec![ExecutionPrivilege::on(
                source.as_ref().and_then(Measurement::database_name),
                Privilege::Write,
            )],
            CreateDatabase { .. }
            | DropDatabase { .. }
            | ShowDatabases
            | CreateRetentionPolicy { .. }
            | AlterRetentionPolicy { .. }
            | CreateUser { .. }
            | DropUser { .. }
            | SetPassword { .. }
            | Grant { .. }
            | Revoke { .. }
            | ShowUsers
            | DropMeasurement { .. }
            | CreateServer { .. }
            | DropServer { .. }
            | ShowServers
            | ShowStats
            | ShowDiagnostics => vec![ExecutionPrivilege::admin()],
        }
    }

    /// Every measurement referenced by the statement, sources and write targets alike.
    pub fn measurements_mut(&mut self) -> Vec<&mut Measurement> {
        use Statement::*;
        match self {
            Select(s) => s.measurements_mut(),
            CreateContinuousQuery(cq) => cq.source.measurements_mut(),
            ShowSeries { source }
            | DropSeries { source }
            | ShowTagKeys { source }
            | ShowTagValues { source }
            | ShowFieldKeys { source } => source.iter_mut().collect(),
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Statement::*;
        let from = |source: &Option<Measurement>| match source {
            Some(m) => format!(" FROM {}", m),
            None => String::new(),
        };
        match self {
            Select(s) => write!(f, "{}", s),
            CreateDatabase { name } => write!(f, "CREATE DATABASE {}", ident(name)),
            DropDatabase { name } => write!(f, "DROP DATABASE {}", ident(name)),
            ShowDatabases => f.write_str("SHOW DATABASES"),
            CreateRetentionPolicy {
                database,
                name,
                duration,
                replication,
                default,
            } => {
                write!(
                    f,
                    "CREATE RETENTION POLICY {} ON {} DURATION {} REPLICATION {}",
                    ident(name),
                    ident(database),
                    format_duration(*duration),
                    replication
                )?;
                if *default {
                    f.write_str(" DEFAULT")?;
                }
                Ok(())
            }
            AlterRetentionPolicy {
                database,
                name,
                duration,
                replication,
                default,
            } => {
                write!(f, "ALTER RETENTION POLICY {} ON {}", ident(name), ident(database))?;
                if let Some(d) = duration {
                    write!(f, " DURATION {}", format_duration(*d))?;
                }
                if let Some(n) = replication {
                    write!(f, " REPLICATION {}", n)?;
                }
                if *default {
                    f.write_str(" DEFAULT")?;
                }
                Ok(())
            }
            DropRetentionPolicy { database, name } => {
                write!(f, "DROP RETENTION POLICY {} ON {}", ident(name), ident(database))
            }
            ShowRetentionPolicies { database } => {
                write!(f, "SHOW RETENTION POLICIES {}", ident(database))
            }
            CreateUser { name, admin, .. } => {
                write!(f, "CREATE USER {} WITH PASSWORD [REDACTED]", ident(name))?;
                if *admin {
                    f.write_str(" WITH ALL PRIVILEGES")?;
                }
                Ok(())
            }
            DropUser { name } => write!(f, "DROP USER {}", ident(name)),
            SetPassword { name, .. } => {
                write!(f, "SET PASSWORD FOR {} = [REDACTED]", ident(name))
            }
            Grant {
                privilege,
                database,
                user,
            } => match database {
                Some(db) => write!(f, "GRANT {} ON {} TO {}", privilege, ident(db), ident(user)),
                None => write!(f, "GRANT {} TO {}", privilege, ident(user)),
            },
            Revoke {
                privilege,
                database,
                user,
            } => match database {
                Some(db) => write!(f, "REVOKE {} ON {} FROM {}", privilege, ident(db), ident(user)),
                None => write!(f, "REVOKE {} FROM {}", privilege, ident(user)),
            },
            ShowUsers => f.write_str("SHOW USERS"),
            CreateContinuousQuery(cq) => write!(f, "{}", cq),
            DropContinuousQuery { name, database } => {
                write!(f, "DROP CONTINUOUS QUERY {} ON {}", ident(name), ident(database))
            }
            ShowContinuousQueries => f.write_str("SHOW CONTINUOUS QUERIES"),
            ShowMeasurements => f.write_str("SHOW MEASUREMENTS"),
            ShowSeries { source } => write!(f, "SHOW SERIES{}", from(source)),
            DropSeries { source } => write!(f, "DROP SERIES{}", from(source)),
            DropMeasurement { name } => write!(f, "DROP MEASUREMENT {}", ident(name)),
            ShowTagKeys { source } => write!(f, "SHOW TAG KEYS{}", from(source)),
            ShowTagValues { source } => write!(f, "SHOW TAG VALUES{}", from(source)),
            ShowFieldKeys { source } => write!(f, "SHOW FIELD KEYS{}", from(source)),
            CreateServer { url } => write!(f, "CREATE SERVER {}", quote_ident(url)),
            DropServer { id } => write!(f, "DROP SERVER {}", id),
            ShowServers => f.write_str("SHOW SERVERS"),
            ShowStats => f.write_str("SHOW STATS"),
            ShowDiagnostics => f.write_str("SHOW DIAGNOSTICS"),
        }
    }
}

/// An ordered list of statements submitted together.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    /// Statements in execution order.
    pub statements: Vec<Statement>,
}

impl Query {
    /// Query of the given statements.
    pub fn new(statements: Vec<Statement>) -> Self {
        Self { statements }
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, stmt) in self.statements.iter().enumerate() {
            if i > 0 {
                f.write_str(";\n")?;
            }
            write!(f, "{}", stmt)?;
        }
        Ok(())
    }
}
