//! Logical service roles and how they map to deployed app names.

use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::OperatorError;

pub const UUID_PLACEHOLDER: &str = "{uuid}";
pub const LIVE_SUFFIX: &str = "-live";

const UUID_PATTERN: &str = "[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}";

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
    clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    Identity,
    Registry,
    Runtime,
    BindingManager,
    Diagnostics,
}

pub struct RoleSpec {
    pub role: Role,
    pub label: &'static str,
    pub env_var: &'static str,
    pub failure_message: &'static str,
    /// Label of the bound service whose credentials authenticate calls made
    /// on behalf of this role.
    pub service_label: &'static str,
}

// Indexed by `Role` discriminant.
static ROLE_TABLE: [RoleSpec; 5] = [
    RoleSpec {
        role: Role::Identity,
        label: "identity service app",
        env_var: "TENANT_OP_IDENTITY_APP",
        failure_message: "could not find the identity service app",
        service_label: "xsuaa",
    },
    RoleSpec {
        role: Role::Registry,
        label: "tenant registry app",
        env_var: "TENANT_OP_REGISTRY_APP",
        failure_message: "could not find the tenant registry app",
        service_label: "saas-registry",
    },
    RoleSpec {
        role: Role::Runtime,
        label: "multitenancy runtime app",
        env_var: "TENANT_OP_RUNTIME_APP",
        failure_message: "could not find the multitenancy runtime app",
        service_label: "xsuaa",
    },
    RoleSpec {
        role: Role::BindingManager,
        label: "database binding manager app",
        env_var: "TENANT_OP_BINDING_APP",
        failure_message: "could not find the database binding manager app",
        service_label: "service-manager",
    },
    RoleSpec {
        role: Role::Diagnostics,
        label: "diagnostics app",
        env_var: "TENANT_OP_DIAGNOSTICS_APP",
        failure_message: "could not find the diagnostics app",
        service_label: "xsuaa",
    },
];

impl Role {
    pub fn all() -> impl Iterator<Item = Role> {
        ROLE_TABLE.iter().map(|spec| spec.role)
    }

    pub fn spec(self) -> &'static RoleSpec {
        &ROLE_TABLE[self as usize]
    }

    pub fn env_var(self) -> &'static str {
        self.spec().env_var
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.spec().label)
    }
}

/// One app name to try, in priority order.
#[derive(Clone, Debug)]
pub enum Candidate {
    Exact(String),
    UuidTemplate { display: String, pattern: Regex },
}

impl Candidate {
    pub fn new(base: &str, suffix: &str) -> Result<Self, regex::Error> {
        let name = format!("{base}{suffix}");
        let Some((prefix, rest)) = name.split_once(UUID_PLACEHOLDER) else {
            return Ok(Self::Exact(name));
        };
        let pattern = Regex::new(&format!(
            "(?i)^{}{UUID_PATTERN}{}$",
            regex::escape(prefix),
            regex::escape(rest)
        ))?;
        Ok(Self::UuidTemplate {
            display: name,
            pattern,
        })
    }

    pub fn display_name(&self) -> &str {
        match self {
            Candidate::Exact(name) => name,
            Candidate::UuidTemplate { display, .. } => display,
        }
    }

    pub fn matches(&self, app_name: &str) -> bool {
        match self {
            Candidate::Exact(name) => name == app_name,
            Candidate::UuidTemplate { pattern, .. } => pattern.is_match(app_name),
        }
    }
}

/// Which suffix variants are tried after the bare app name.
#[derive(Clone, Debug)]
pub struct SuffixPolicy {
    pub alternates: Vec<String>,
    pub read_only: bool,
}

impl SuffixPolicy {
    pub fn suffixes(&self) -> Vec<&str> {
        let mut suffixes = vec![""];
        suffixes.extend(self.alternates.iter().map(String::as_str));
        if self.read_only {
            suffixes.push(LIVE_SUFFIX);
        }
        suffixes
    }
}

#[derive(Clone, Debug)]
pub struct RoleBinding {
    pub role: Role,
    pub app_name: String,
    pub candidates: Vec<Candidate>,
}

impl RoleBinding {
    pub fn new(role: Role, app_name: &str, policy: &SuffixPolicy) -> Result<Self, regex::Error> {
        let mut candidates: Vec<Candidate> = Vec::new();
        for suffix in policy.suffixes() {
            let candidate = Candidate::new(app_name, suffix)?;
            if candidates
                .iter()
                .all(|known| known.display_name() != candidate.display_name())
            {
                candidates.push(candidate);
            }
        }
        Ok(Self {
            role,
            app_name: app_name.to_string(),
            candidates,
        })
    }

    pub fn attempted_names(&self) -> Vec<String> {
        self.candidates
            .iter()
            .map(|candidate| candidate.display_name().to_string())
            .collect()
    }

    /// Pick the deployed app matching the highest-priority candidate. The
    /// listing order only breaks ties within one candidate.
    pub fn select<'a, T, F>(&self, deployed: &'a [T], name_of: F) -> Result<&'a T, OperatorError>
    where
        F: Fn(&T) -> &str,
    {
        self.candidates
            .iter()
            .find_map(|candidate| deployed.iter().find(|app| candidate.matches(name_of(app))))
            .ok_or_else(|| OperatorError::Resolution {
                role: self.role,
                message: self.role.spec().failure_message,
                attempted: self.attempted_names(),
            })
    }
}
