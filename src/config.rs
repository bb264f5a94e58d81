//! Configuration handling for the SQL client engine.
//!
//! Connection settings come from a JSON document (see [`SqlConfig`]) resolved
//! per reference name. The command line front end is configured via CLI
//! arguments and environment variables (see [`Cli`]).

use crate::error::{SqlError, SqlResult};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Reference name used when neither the caller nor the config names one.
pub const DEFAULT_REFERENCE: &str = "Database";

/// Server type used when the config does not name one.
pub const DEFAULT_SERVER_TYPE: &str = "SQLite";

/// Process-wide ceiling on connected clients outside pools.
pub const DEFAULT_MAX_CONNECTIONS: usize = 8;

/// Connection fields that can appear at the top level or per reference.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceConfig {
    pub database: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub server_type: Option<String>,
}

/// Connection configuration document.
///
/// ```json
/// {
///   "server_type": "SQLite",
///   "client_name": "Orders",
///   "max_connections": 4,
///   "references": {
///     "Orders": { "database": "/var/db/orders.db" }
///   }
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlConfig {
    /// General entries, used when a reference does not override them.
    #[serde(flatten)]
    pub general: ReferenceConfig,
    /// Reference name used when the caller does not supply one.
    pub client_name: Option<String>,
    #[serde(default)]
    pub references: HashMap<String, ReferenceConfig>,
    pub max_connections: Option<usize>,
}

impl SqlConfig {
    /// Parse a configuration document.
    pub fn from_json(text: &str) -> SqlResult<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|e| SqlError::config(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a configuration file.
    pub fn load(path: &Path) -> SqlResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            SqlError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&text)
    }

    /// Validate the document and return an error if invalid.
    pub fn validate(&self) -> SqlResult<()> {
        if self.max_connections == Some(0) {
            return Err(SqlError::config("max_connections must be greater than 0"));
        }
        for name in self.references.keys() {
            if name.trim().is_empty() {
                return Err(SqlError::config("reference names must not be empty"));
            }
        }
        Ok(())
    }

    /// Get max_connections with default value.
    pub fn max_connections_or_default(&self) -> usize {
        self.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS)
    }

    /// The reference name to use: the requested one, else `client_name`, else
    /// [`DEFAULT_REFERENCE`].
    pub fn reference_name(&self, requested: Option<&str>) -> String {
        requested
            .or(self.client_name.as_deref())
            .unwrap_or(DEFAULT_REFERENCE)
            .to_string()
    }

    /// Resolve the settings for `reference`.
    ///
    /// Each field comes from the reference's own entry, then the general
    /// entry, then a built-in default (the database defaults to the reference
    /// name itself).
    pub fn resolve(&self, reference: &str) -> SqlResult<ClientSettings> {
        if reference.trim().is_empty() {
            return Err(SqlError::config("reference name must not be empty"));
        }
        let specific = self.references.get(reference);
        let pick = |field: fn(&ReferenceConfig) -> &Option<String>| {
            specific
                .and_then(|r| field(r).clone())
                .or_else(|| field(&self.general).clone())
        };
        Ok(ClientSettings {
            database: pick(|r| &r.database).unwrap_or_else(|| reference.to_string()),
            user: pick(|r| &r.user).unwrap_or_default(),
            password: pick(|r| &r.password).unwrap_or_default(),
            server_type: pick(|r| &r.server_type)
                .unwrap_or_else(|| DEFAULT_SERVER_TYPE.to_string()),
        })
    }
}

/// Resolved connection identity for one client.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ClientSettings {
    pub database: String,
    pub user: String,
    pub password: String,
    pub server_type: String,
}

impl ClientSettings {
    pub fn new(
        database: impl Into<String>,
        user: impl Into<String>,
        server_type: impl Into<String>,
    ) -> Self {
        Self {
            database: database.into(),
            user: user.into(),
            password: String::new(),
            server_type: server_type.into(),
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    /// Same database, user and server type (password is not compared).
    pub fn same_target(&self, other: &ClientSettings) -> bool {
        self.database == other.database
            && self.user == other.user
            && self.server_type.eq_ignore_ascii_case(&other.server_type)
    }
}

impl fmt::Debug for ClientSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSettings")
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("server_type", &self.server_type)
            .finish()
    }
}

/// Command line front end.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "sqlclient",
    about = "Run SQL through a named client - queries, statements and merged batches",
    version,
    author
)]
pub struct Cli {
    /// JSON configuration file (see SqlConfig). Defaults to an in-memory SQLite database.
    #[arg(short, long, value_name = "FILE", env = "SQLCLIENT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Reference name of the client to use
    #[arg(short, long, env = "SQLCLIENT_REFERENCE")]
    pub reference: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "SQLCLIENT_LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "SQLCLIENT_JSON_LOGS")]
    pub json_logs: bool,

    /// Debug level for the client (0 disables statement logging)
    #[arg(long, default_value_t = 0, env = "SQLCLIENT_DEBUGGING")]
    pub debugging: u32,

    /// Log operations taking at least this many milliseconds
    #[arg(long, value_name = "MS", env = "SQLCLIENT_DURATION_LOGGING")]
    pub duration_logging: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Run a query and print the records as JSON
    Query { sql: String },
    /// Run a statement and print the affected row count
    Execute { sql: String },
    /// Run the statements in a file (one per line) as a batch
    Batch {
        file: PathBuf,
        /// Stop at the first failing statement
        #[arg(long)]
        stop_on_failure: bool,
        /// Number of recent statements to consider for merging
        #[arg(long, default_value_t = 0)]
        merge: u8,
    },
}

impl Cli {
    /// The configuration to use: the file given, or an in-memory SQLite database.
    pub fn sql_config(&self) -> SqlResult<SqlConfig> {
        match &self.config {
            Some(path) => SqlConfig::load(path),
            None => Ok(SqlConfig {
                general: ReferenceConfig {
                    database: Some(":memory:".to_string()),
                    server_type: Some(DEFAULT_SERVER_TYPE.to_string()),
                    ..ReferenceConfig::default()
                },
                ..SqlConfig::default()
            }),
        }
    }
}
