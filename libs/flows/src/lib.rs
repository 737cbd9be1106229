//! OpenFlow rule model used by the SDN agent.
//!
//! Flows are kept in the text form understood by `ovs-ofctl`. This crate
//! provides:
//!
//! - **Parsing** of `dump-flows` output and `add-flow` specs into [`Flow`]
//! - **Canonical form** so a dumped flow compares equal to the one we generated
//! - **Diffing** of a desired [`FlowSet`] against what the switch reports
//!
//! # Invariants
//!
//! - Flow identity is `(table, priority, matches)`; actions are payload
//! - Diffs are deterministic given the same inputs
//! - Only flows stamped with [`AGENT_COOKIE`] are ever considered stale

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Cookie stamped on every flow the agent installs.
pub const AGENT_COOKIE: u64 = 0x5344_4e41;

/// Priority OVS assigns when a flow spec omits one.
pub const DEFAULT_PRIORITY: u16 = 32768;

/// Fields printed by `dump-flows` that are statistics, not part of the rule.
const STAT_FIELDS: &[&str] = &[
    "duration",
    "n_packets",
    "n_bytes",
    "idle_age",
    "hard_age",
    "idle_timeout",
    "hard_timeout",
    "reset_counts",
];

/// Flow parsing errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FlowError {
    /// The spec has no `actions=` clause.
    #[error("missing actions in flow: {0}")]
    MissingActions(String),

    /// The actions clause is empty.
    #[error("empty actions in flow: {0}")]
    EmptyActions(String),

    /// A numeric field could not be parsed.
    #[error("invalid {field} value: {value}")]
    InvalidField { field: &'static str, value: String },
}

/// A single OpenFlow rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Flow {
    pub table: u8,
    pub priority: u16,
    pub cookie: u64,
    /// Comma-separated match fields in canonical order.
    pub matches: String,
    pub actions: String,
}

/// Identity of a flow within a bridge's flow table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FlowKey {
    pub table: u8,
    pub priority: u16,
    pub matches: String,
}

impl Flow {
    /// Build an agent-owned flow.
    pub fn new(table: u8, priority: u16, matches: &str, actions: &str) -> Self {
        Self {
            table,
            priority,
            cookie: AGENT_COOKIE,
            matches: canonical_matches(matches.split(',')),
            actions: actions.trim().to_string(),
        }
    }

    /// Override the cookie.
    pub fn with_cookie(mut self, cookie: u64) -> Self {
        self.cookie = cookie;
        self
    }

    pub fn key(&self) -> FlowKey {
        FlowKey {
            table: self.table,
            priority: self.priority,
            matches: self.matches.clone(),
        }
    }

    /// Whether the agent installed this flow.
    pub fn is_agent_owned(&self) -> bool {
        self.cookie == AGENT_COOKIE
    }

    /// Strict match spec, as accepted by `del-flows --strict`.
    pub fn match_spec(&self) -> String {
        let mut spec = format!("table={},priority={}", self.table, self.priority);
        if !self.matches.is_empty() {
            spec.push(',');
            spec.push_str(&self.matches);
        }
        spec
    }
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "table={},priority={},cookie={:#x}", self.table, self.priority, self.cookie)?;
        if !self.matches.is_empty() {
            write!(f, ",{}", self.matches)?;
        }
        write!(f, ",actions={}", self.actions)
    }
}

impl FromStr for Flow {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let line = s.trim();
        let Some(pos) = line.find("actions=") else {
            return Err(FlowError::MissingActions(line.to_string()));
        };

        let actions = line[pos + "actions=".len()..].trim();
        if actions.is_empty() {
            return Err(FlowError::EmptyActions(line.to_string()));
        }

        let head = line[..pos].trim().trim_end_matches(',');

        let mut table = 0u8;
        let mut priority = DEFAULT_PRIORITY;
        let mut cookie = 0u64;
        let mut matches = Vec::new();

        for field in head.split(',').map(str::trim).filter(|f| !f.is_empty()) {
            let (name, value) = match field.split_once('=') {
                Some((n, v)) => (n.trim(), Some(v.trim())),
                None => (field, None),
            };

            match (name, value) {
                ("table", Some(v)) => {
                    table = v.parse().map_err(|_| FlowError::InvalidField {
                        field: "table",
                        value: v.to_string(),
                    })?;
                }
                ("priority", Some(v)) => {
                    priority = v.parse().map_err(|_| FlowError::InvalidField {
                        field: "priority",
                        value: v.to_string(),
                    })?;
                }
                ("cookie", Some(v)) => {
                    cookie = parse_cookie(v).ok_or_else(|| FlowError::InvalidField {
                        field: "cookie",
                        value: v.to_string(),
                    })?;
                }
                (n, _) if STAT_FIELDS.contains(&n) => {}
                _ => matches.push(field),
            }
        }

        Ok(Self {
            table,
            priority,
            cookie,
            matches: canonical_matches(matches.into_iter()),
            actions: actions.to_string(),
        })
    }
}

/// Parse a cookie given as `0x`-prefixed hex or decimal.
fn parse_cookie(value: &str) -> Option<u64> {
    // dump-flows may print a mask, e.g. 0x1/0xffff
    let value = value.split('/').next().unwrap_or(value);
    match value.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

/// Trim, strip quotes, sort and dedupe match fields.
fn canonical_matches<'a>(fields: impl Iterator<Item = &'a str>) -> String {
    let mut fields: Vec<String> = fields
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(|f| f.replace('"', ""))
        .collect();
    fields.sort();
    fields.dedup();
    fields.join(",")
}

/// Result of comparing desired flows against the switch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowDiff {
    /// Flows to install (missing or with different actions).
    pub to_add: Vec<Flow>,

    /// Agent-owned flows on the switch that are no longer desired.
    pub to_delete: Vec<Flow>,
}

impl FlowDiff {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_delete.is_empty()
    }
}

/// Ordered set of flows keyed by [`FlowKey`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowSet {
    flows: BTreeMap<FlowKey, Flow>,
}

impl FlowSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a flow, replacing any flow with the same key.
    pub fn insert(&mut self, flow: Flow) -> Option<Flow> {
        self.flows.insert(flow.key(), flow)
    }

    pub fn remove(&mut self, key: &FlowKey) -> Option<Flow> {
        self.flows.remove(key)
    }

    pub fn contains(&self, key: &FlowKey) -> bool {
        self.flows.contains_key(key)
    }

    pub fn get(&self, key: &FlowKey) -> Option<&Flow> {
        self.flows.get(key)
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Flow> {
        self.flows.values()
    }

    /// Compute what must change on the switch so that its agent-owned
    /// flows equal `self`.
    pub fn diff(&self, actual: &FlowSet) -> FlowDiff {
        let to_delete = actual
            .iter()
            .filter(|f| f.is_agent_owned() && !self.contains(&f.key()))
            .cloned()
            .collect();

        let to_add = self
            .iter()
            .filter(|f| match actual.get(&f.key()) {
                Some(existing) => existing.actions != f.actions || !existing.is_agent_owned(),
                None => true,
            })
            .cloned()
            .collect();

        FlowDiff { to_add, to_delete }
    }
}

impl FromIterator<Flow> for FlowSet {
    fn from_iter<T: IntoIterator<Item = Flow>>(iter: T) -> Self {
        let mut set = Self::new();
        set.extend(iter);
        set
    }
}

impl Extend<Flow> for FlowSet {
    fn extend<T: IntoIterator<Item = Flow>>(&mut self, iter: T) {
        for flow in iter {
            self.insert(flow);
        }
    }
}

impl IntoIterator for FlowSet {
    type Item = Flow;
    type IntoIter = std::collections::btree_map::IntoValues<FlowKey, Flow>;

    fn into_iter(self) -> Self::IntoIter {
        self.flows.into_values()
    }
}
