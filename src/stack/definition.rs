//! Stack definition types

use super::topology;
use crate::error::{Result, StackError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Current on-disk schema version of `stack.json`
pub const SCHEMA_VERSION: u32 = 1;

/// Longest accepted stack or account name
pub const MAX_NAME_LEN: usize = 64;

/// Declarative definition of a stack
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StackDefinition {
    /// Schema version of the persisted document
    pub schema_version: u32,
    /// Stack name (also its directory name)
    pub name: String,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Services, in declaration order
    #[serde(default)]
    pub services: Vec<ServiceSpec>,
    /// Provisioned accounts: organization -> account name -> identity
    #[serde(default)]
    pub accounts: BTreeMap<String, BTreeMap<String, AccountIdentity>>,
}

/// One service of a stack
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceSpec {
    /// Service name
    pub name: String,
    /// Container image
    pub image: String,
    /// Port mappings (`host:container[/proto]`)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<String>,
    /// Services that must be healthy before this one starts
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Volume mounts (`source:target[:ro]`)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,
    /// Environment variables
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    /// Command override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    /// Healthcheck
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<HealthcheckSpec>,
    /// Organization whose node this service runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
    /// Key generation command, `{account}` is replaced by the account name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keygen: Option<Vec<String>>,
}

/// Healthcheck configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthcheckSpec {
    /// Test command
    pub test: Vec<String>,
    /// Seconds between checks
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Consecutive failures before unhealthy
    #[serde(default = "default_retries")]
    pub retries: u32,
}

fn default_interval_secs() -> u64 {
    5
}

fn default_retries() -> u32 {
    3
}

/// A provisioned signing identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AccountIdentity {
    /// Owning organization
    pub organization: String,
    /// Account name
    pub name: String,
    /// Derived address
    pub address: String,
    /// Where the key material lives inside the node
    pub key_ref: String,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

/// Service topology input (`services:` list), as read by `devstack init`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Topology {
    #[serde(default)]
    pub services: Vec<ServiceSpec>,
}

impl Topology {
    /// Parse a topology from YAML
    pub fn parse_str(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| StackError::InvalidDefinition(format!("Failed to parse topology: {}", e)))
    }
}

impl StackDefinition {
    /// Create and validate a new definition
    pub fn new(name: &str, services: Vec<ServiceSpec>) -> Result<Self> {
        let definition = Self {
            schema_version: SCHEMA_VERSION,
            name: name.to_string(),
            created_at: Utc::now(),
            services,
            accounts: BTreeMap::new(),
        };
        definition.validate()?;
        Ok(definition)
    }

    /// Check every structural invariant
    pub fn validate(&self) -> Result<()> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(StackError::InvalidDefinition(format!(
                "unsupported schema version {}",
                self.schema_version
            )));
        }

        validate_name("stack", &self.name)?;

        let mut seen = HashSet::new();
        for service in &self.services {
            validate_name("service", &service.name)?;
            if !seen.insert(service.name.as_str()) {
                return Err(StackError::InvalidDefinition(format!(
                    "duplicate service '{}'",
                    service.name
                )));
            }
            if service.image.trim().is_empty() {
                return Err(StackError::InvalidDefinition(format!(
                    "service '{}' has no image",
                    service.name
                )));
            }
            for port in &service.ports {
                validate_port(&service.name, port)?;
            }
            if let Some(keygen) = &service.keygen {
                if keygen.is_empty() {
                    return Err(StackError::InvalidDefinition(format!(
                        "service '{}' has an empty keygen command",
                        service.name
                    )));
                }
            }
        }

        // Also rejects unknown dependencies
        topology::start_order(&self.services)?;

        for (organization, accounts) in &self.accounts {
            for (name, identity) in accounts {
                if &identity.organization != organization || &identity.name != name {
                    return Err(StackError::InvalidDefinition(format!(
                        "account '{}/{}' is filed under '{}/{}'",
                        identity.organization, identity.name, organization, name
                    )));
                }
            }
        }

        Ok(())
    }

    /// Names of all services, in declaration order
    pub fn service_names(&self) -> Vec<String> {
        self.services.iter().map(|s| s.name.clone()).collect()
    }

    /// Find a service by name
    pub fn service(&self, name: &str) -> Option<&ServiceSpec> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Service running the node of an organization.
    ///
    /// Matches the service labelled with the organization first, then a
    /// service named after it.
    pub fn organization_service(&self, organization: &str) -> Option<&ServiceSpec> {
        self.services
            .iter()
            .find(|s| s.organization.as_deref() == Some(organization))
            .or_else(|| self.service(organization))
    }

    pub fn account(&self, organization: &str, name: &str) -> Option<&AccountIdentity> {
        self.accounts.get(organization)?.get(name)
    }

    /// Accounts of one organization, or of all organizations
    pub fn accounts_for(&self, organization: Option<&str>) -> Vec<&AccountIdentity> {
        self.accounts
            .iter()
            .filter(|(org, _)| organization.map_or(true, |o| o == org.as_str()))
            .flat_map(|(_, accounts)| accounts.values())
            .collect()
    }

    pub fn account_count(&self) -> usize {
        self.accounts.values().map(BTreeMap::len).sum()
    }

    /// Register an identity; `(organization, name)` must be new
    pub fn insert_account(&mut self, identity: AccountIdentity) -> Result<()> {
        let accounts = self.accounts.entry(identity.organization.clone()).or_default();
        if accounts.contains_key(&identity.name) {
            return Err(StackError::DuplicateAccount {
                organization: identity.organization,
                account: identity.name,
            });
        }
        accounts.insert(identity.name.clone(), identity);
        Ok(())
    }
}

/// Check that `name` can be used as a single filesystem path segment
pub fn validate_name(kind: &str, name: &str) -> Result<()> {
    let invalid = |reason: &str| {
        Err(StackError::InvalidDefinition(format!(
            "invalid {} name '{}': {}",
            kind, name, reason
        )))
    };

    if name.is_empty() {
        return invalid("must not be empty");
    }
    if name.len() > MAX_NAME_LEN {
        return invalid("too long");
    }
    if name.starts_with('.') || name.starts_with('-') {
        return invalid("must not start with '.' or '-'");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
    {
        return invalid("only letters, digits, '_', '-' and '.' are allowed");
    }
    Ok(())
}

fn validate_port(service: &str, port: &str) -> Result<()> {
    let (mapping, protocol) = match port.split_once('/') {
        Some((mapping, protocol)) => (mapping, Some(protocol)),
        None => (port, None),
    };

    if let Some(protocol) = protocol {
        if protocol != "tcp" && protocol != "udp" {
            return Err(StackError::InvalidDefinition(format!(
                "service '{}' port '{}' has unknown protocol",
                service, port
            )));
        }
    }

    let valid = match mapping.split_once(':') {
        Some((host, container)) => host.parse::<u16>().is_ok() && container.parse::<u16>().is_ok(),
        None => mapping.parse::<u16>().is_ok(),
    };

    if !valid {
        return Err(StackError::InvalidDefinition(format!(
            "service '{}' has invalid port mapping '{}'",
            service, port
        )));
    }
    Ok(())
}
