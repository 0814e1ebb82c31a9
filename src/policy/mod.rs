//! Access policy: who may reach what through which enforcement point.
//!
//! # Resolution
//!
//! The effective rules of an identity at an enforcement point are the union
//! of
//!
//! | Source | Edge |
//! |--------|------|
//! | rules assigned to the user | `users[].rules` |
//! | rules assigned to each group of the user | `groups[].rules` |
//!
//! restricted to rules whose network is served by the point, plus rules with
//! no network. The result is a set keyed by `(type, value, ports, protocol)`;
//! there is no ordering, no priority and no deny rule. Host names stay
//! unresolved here; agents resolve them when they apply firewall rules.

pub mod routes;

use std::collections::{BTreeMap, BTreeSet, HashMap};

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use tracing::debug;
use ztgate_proto::{AccessRule, PortRange, Protocol, RuleType};

use crate::config::DirectoryConfig;
use crate::enforcement::EnforcementPoint;

pub use routes::{RouteDirective, compile_routes};

/// Named address block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkRecord {
    /// Network id
    pub id: String,
    /// Address block
    pub cidr: Ipv4Net,
}

/// A user with group memberships and direct rule assignments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    /// Stable external id
    pub id: String,
    /// Group ids
    #[serde(default)]
    pub groups: Vec<String>,
    /// Directly assigned rule ids
    #[serde(default)]
    pub rules: Vec<String>,
}

/// A group with rule assignments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRecord {
    /// Group id
    pub id: String,
    /// Assigned rule ids
    #[serde(default)]
    pub rules: Vec<String>,
}

/// An authenticated principal as handed over by the identity frontend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Stable external id; the certificate common name
    pub id: String,
    /// Group memberships from the identity provider claims
    #[serde(default)]
    pub groups: Vec<String>,
}

type RuleKey = (RuleType, String, PortRange, Protocol);

/// Resolves effective rules from directory data.
pub struct PolicyResolver {
    rules: HashMap<String, AccessRule>,
    users: HashMap<String, UserRecord>,
    groups: HashMap<String, GroupRecord>,
}

impl PolicyResolver {
    /// Index the directory.
    #[must_use]
    pub fn new(directory: &DirectoryConfig) -> Self {
        Self {
            rules: directory
                .rules
                .iter()
                .map(|r| (r.id.clone(), r.clone()))
                .collect(),
            users: directory
                .users
                .iter()
                .map(|u| (u.id.clone(), u.clone()))
                .collect(),
            groups: directory
                .groups
                .iter()
                .map(|g| (g.id.clone(), g.clone()))
                .collect(),
        }
    }

    /// Effective rules of `identity` at `point`.
    ///
    /// Group memberships come from the directory record and from
    /// `identity.groups`. Unknown identities with no known groups resolve to
    /// an empty set.
    #[must_use]
    pub fn resolve(&self, identity: &Identity, point: &EnforcementPoint) -> Vec<AccessRule> {
        let user = self.users.get(&identity.id);

        let mut group_ids: BTreeSet<&str> = identity.groups.iter().map(String::as_str).collect();
        if let Some(u) = user {
            group_ids.extend(u.groups.iter().map(String::as_str));
        }

        let direct = user.into_iter().flat_map(|u| u.rules.iter());
        let via_groups = group_ids
            .iter()
            .filter_map(|g| self.groups.get(*g))
            .flat_map(|g| g.rules.iter());

        let mut effective: BTreeMap<RuleKey, AccessRule> = BTreeMap::new();
        for rule in direct.chain(via_groups).filter_map(|id| self.rules.get(id)) {
            if !rule.active || !applies_to(rule, point) {
                continue;
            }
            let key = (
                rule.rule_type,
                rule.value.clone(),
                rule.port_range,
                rule.protocol,
            );
            effective.entry(key).or_insert_with(|| rule.clone());
        }

        debug!(
            identity = %identity.id,
            point = %point.id,
            rules = effective.len(),
            "Resolved effective rules"
        );
        effective.into_values().collect()
    }

    /// Resolve by id only, using directory group memberships.
    #[must_use]
    pub fn resolve_id(&self, identity: &str, point: &EnforcementPoint) -> Vec<AccessRule> {
        self.resolve(
            &Identity {
                id: identity.to_string(),
                groups: Vec::new(),
            },
            point,
        )
    }
}

fn applies_to(rule: &AccessRule, point: &EnforcementPoint) -> bool {
    rule.network
        .as_ref()
        .is_none_or(|net| point.networks.iter().any(|n| n == net))
}
