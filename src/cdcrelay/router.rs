//! Resolves a batch of change records to the users that should receive it.
//!
//! Each table is bound to one [`RoutingStrategy`] at startup. Resolution is
//! read-only against the subscriber set store and isolated per record: a
//! record whose key is missing, malformed or unknown is logged and dropped
//! while its siblings still resolve.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::cdcrelay::record::ChangeRecord;
use crate::cdcrelay::store::SetStore;
use crate::cdcrelay::types::{set_key, TableName, UserId};
use crate::error::{ErrorCategory, ErrorCode, RelayError, Result};

/// How the users for one table are found
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum RoutingStrategy {
    /// The field holds the user identity itself
    Owner { field: String },
    /// The field holds a key with a single-owner index set
    Direct { field: String, namespace: String },
    /// The key is the part of the field before `separator`
    Derived {
        field: String,
        namespace: String,
        separator: String,
    },
    /// The field holds the natural key of a precomputed subscriber set
    Precomputed { field: String, namespace: String },
    /// Every record goes to the members of one fixed set
    Broadcast { namespace: String, key: String },
}

impl RoutingStrategy {
    fn validate(&self) -> Result<()> {
        let required: Vec<(&str, &str)> = match self {
            Self::Owner { field } => vec![("field", field.as_str())],
            Self::Direct { field, namespace } | Self::Precomputed { field, namespace } => {
                vec![("field", field.as_str()), ("namespace", namespace.as_str())]
            }
            Self::Derived { field, namespace, separator } => vec![
                ("field", field.as_str()),
                ("namespace", namespace.as_str()),
                ("separator", separator.as_str()),
            ],
            Self::Broadcast { namespace, key } => {
                vec![("namespace", namespace.as_str()), ("key", key.as_str())]
            }
        };
        match required.iter().find(|(_, value)| value.is_empty()) {
            Some((name, _)) => Err(RelayError::new(
                ErrorCode::ConfigInvalid,
                format!("{:?} strategy needs a non-empty `{}`", self, name),
            )),
            None => Ok(()),
        }
    }

    /// Resolve one record. An empty result is not an error.
    pub fn resolve(&self, record: &ChangeRecord, store: &dyn SetStore) -> Result<Vec<UserId>> {
        match self {
            Self::Owner { field } => Ok(vec![key_field(record, field)?.to_string()]),
            Self::Direct { field, namespace } => {
                let key = key_field(record, field)?;
                let owners = store.members(&set_key(namespace, key))?;
                match owners.len() {
                    0 => Err(RelayError::new(
                        ErrorCode::LookupMiss,
                        format!("No owner indexed for {}={}", field, key),
                    )),
                    1 => Ok(owners),
                    n => {
                        warn!("Owner index {}:{} holds {} users", namespace, key, n);
                        Ok(owners)
                    }
                }
            }
            Self::Derived { field, namespace, separator } => {
                let key = derive_key(key_field(record, field)?, separator)?;
                store.members(&set_key(namespace, key))
            }
            Self::Precomputed { field, namespace } => {
                store.members(&set_key(namespace, key_field(record, field)?))
            }
            Self::Broadcast { namespace, key } => store.members(&set_key(namespace, key)),
        }
    }
}

/// One `[[routes]]` entry in the server config
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfig {
    pub table: TableName,
    #[serde(flatten)]
    pub strategy: RoutingStrategy,
}

/// Validated table → strategy map
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: HashMap<TableName, RoutingStrategy>,
}

impl RouteTable {
    /// Build the map, checking every route against the known table list
    pub fn from_config(routes: &[RouteConfig], known_tables: &[TableName]) -> Result<Self> {
        let known: HashSet<&str> = known_tables.iter().map(String::as_str).collect();
        let mut table = HashMap::with_capacity(routes.len());

        for route in routes {
            if !known.contains(route.table.as_str()) {
                return Err(RelayError::new(
                    ErrorCode::ConfigInvalid,
                    format!("Route for unknown table `{}`", route.table),
                ));
            }
            route.strategy.validate()?;
            if table.insert(route.table.clone(), route.strategy.clone()).is_some() {
                return Err(RelayError::new(
                    ErrorCode::ConfigInvalid,
                    format!("Duplicate route for table `{}`", route.table),
                ));
            }
        }

        for name in known_tables {
            if !table.contains_key(name) {
                info!("Known table `{}` has no route, its changes will be ignored", name);
            }
        }
        Ok(Self { routes: table })
    }

    pub fn get(&self, table: &str) -> Option<&RoutingStrategy> {
        self.routes.get(table)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Per-batch resolution counters
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RouteOutcome {
    pub users: HashSet<UserId>,
    pub resolved: usize,
    pub skipped: usize,
    pub ignored: usize,
}

pub struct ChannelRouter {
    routes: RouteTable,
    store: Arc<dyn SetStore>,
}

impl ChannelRouter {
    pub fn new(routes: RouteTable, store: Arc<dyn SetStore>) -> Self {
        Self { routes, store }
    }

    pub fn handles_table(&self, table: &str) -> bool {
        self.routes.get(table).is_some()
    }

    /// Deduplicated set of users interested in any record of the batch
    pub fn route(&self, records: &[ChangeRecord]) -> HashSet<UserId> {
        self.route_with_outcome(records).users
    }

    pub fn route_with_outcome(&self, records: &[ChangeRecord]) -> RouteOutcome {
        let mut outcome = RouteOutcome::default();

        for record in records {
            let Some(strategy) = self.routes.get(record.table()) else {
                debug!("Ignoring change on unrouted table {}", record.table());
                outcome.ignored += 1;
                continue;
            };

            match strategy.resolve(record, self.store.as_ref()) {
                Ok(users) => {
                    debug!("{} record resolved to {} users", record.table(), users.len());
                    outcome.resolved += 1;
                    outcome.users.extend(users);
                }
                Err(e) if e.code() == Some(ErrorCode::LookupMiss) => {
                    debug!("Skipping {} record: {}", record.table(), e);
                    outcome.skipped += 1;
                }
                Err(e) => {
                    let category = e.code().map_or(ErrorCategory::Unknown, |code| code.category());
                    warn!("Skipping {} record ({} error): {}", record.table(), category, e);
                    outcome.skipped += 1;
                }
            }
        }

        debug!(
            "Routed {} records to {} users ({} skipped, {} ignored)",
            records.len(),
            outcome.users.len(),
            outcome.skipped,
            outcome.ignored
        );
        outcome
    }
}

fn key_field<'r>(record: &'r ChangeRecord, field: &str) -> Result<&'r str> {
    record.field_str(field).ok_or_else(|| {
        RelayError::new(
            ErrorCode::KeyMissing,
            format!("`{}` missing or empty on {} record", field, record.table()),
        )
    })
}

/// Prefix of `value` before `separator`; the whole value when it has none
pub fn derive_key<'v>(value: &'v str, separator: &str) -> Result<&'v str> {
    let prefix = value.split_once(separator).map_or(value, |(prefix, _)| prefix);
    if prefix.is_empty() {
        return Err(RelayError::new(
            ErrorCode::KeyMalformed,
            format!("`{}` has an empty prefix before `{}`", value, separator),
        ));
    }
    Ok(prefix)
}
