//! Tiered risk propagation over the interaction graph.
//!
//! Starting from a triggering member, contacts are reached breadth-first over
//! `interacted_with` edges that fall inside the lookback window. Each contact is
//! attributed to the closest tier whose depth covers its shortest distance, so a
//! member never appears twice. Cohort-mates of the trigger still relay risk
//! through the graph but are filtered from (or sorted to the back of) the tiers.

use std::collections::{HashMap, HashSet, VecDeque};

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::models::{display_name, Interaction, Member};
use crate::store::GraphStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierSpec {
    pub name: String,
    pub label: String,
    /// Maximum contact distance covered by this tier; `None` is unbounded.
    #[serde(default)]
    pub depth: Option<u32>,
}

impl TierSpec {
    pub fn new(name: &str, label: &str, depth: Option<u32>) -> Self {
        Self {
            name: name.to_string(),
            label: label.to_string(),
            depth,
        }
    }

    fn covers(&self, distance: u32) -> bool {
        self.depth.map_or(true, |depth| distance <= depth)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TierPlanError {
    #[error("at least one risk tier is required")]
    Empty,
    #[error("tier '{0}' has depth 0")]
    ZeroDepth(String),
    #[error("tier '{0}' must be deeper than the tier before it")]
    NotAscending(String),
    #[error("unbounded tier '{0}' must be the last tier")]
    UnboundedNotLast(String),
}

/// A validated, closest-first list of tiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TierPlan {
    tiers: Vec<TierSpec>,
}

impl TierPlan {
    pub fn new(tiers: Vec<TierSpec>) -> Result<Self, TierPlanError> {
        if tiers.is_empty() {
            return Err(TierPlanError::Empty);
        }

        let mut previous: Option<u32> = None;
        for (index, tier) in tiers.iter().enumerate() {
            match tier.depth {
                Some(0) => return Err(TierPlanError::ZeroDepth(tier.name.clone())),
                Some(depth) => {
                    if previous.is_some_and(|prev| depth <= prev) {
                        return Err(TierPlanError::NotAscending(tier.name.clone()));
                    }
                    previous = Some(depth);
                }
                None if index + 1 != tiers.len() => {
                    return Err(TierPlanError::UnboundedNotLast(tier.name.clone()))
                }
                None => {}
            }
        }

        Ok(Self { tiers })
    }

    pub fn tiers(&self) -> &[TierSpec] {
        &self.tiers
    }

    /// Deepest distance worth exploring; `None` when the last tier is unbounded.
    pub fn max_depth(&self) -> Option<u32> {
        self.tiers.last().and_then(|tier| tier.depth)
    }

    fn tier_for(&self, distance: u32) -> Option<usize> {
        self.tiers.iter().position(|tier| tier.covers(distance))
    }
}

impl Default for TierPlan {
    fn default() -> Self {
        Self {
            tiers: vec![
                TierSpec::new("high_risk", "Direct contact", Some(1)),
                TierSpec::new("medium_risk", "Second-degree contact", Some(2)),
            ],
        }
    }
}

/// How cohort-mates of the triggering member are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CohortPolicy {
    /// Drop cohort-mates from every tier.
    #[default]
    Exclude,
    /// Keep cohort-mates in their tier, listed after everyone else.
    Deprioritize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactProfile {
    pub name: String,
    pub cohort: Option<String>,
}

impl From<&Member> for ContactProfile {
    fn from(member: &Member) -> Self {
        Self {
            name: member.display_name(),
            cohort: member.cohort.clone(),
        }
    }
}

/// Undirected adjacency restricted to edges inside the lookback window.
#[derive(Debug, Default)]
pub struct InteractionGraph {
    adjacency: HashMap<String, Vec<String>>,
}

impl InteractionGraph {
    pub fn from_interactions(interactions: &[Interaction], since: DateTime<Utc>) -> Self {
        let mut adjacency: HashMap<String, Vec<String>> = HashMap::new();

        for edge in interactions.iter().filter(|edge| edge.interacted_at >= since) {
            if edge.email_a == edge.email_b {
                continue;
            }
            adjacency
                .entry(edge.email_a.clone())
                .or_default()
                .push(edge.email_b.clone());
            adjacency
                .entry(edge.email_b.clone())
                .or_default()
                .push(edge.email_a.clone());
        }

        for neighbours in adjacency.values_mut() {
            neighbours.sort();
            neighbours.dedup();
        }

        Self { adjacency }
    }

    /// Breadth-first contacts of `origin` with their shortest distance, in visit order.
    pub fn contacts_by_distance(&self, origin: &str, max_depth: Option<u32>) -> Vec<(String, u32)> {
        let mut seen: HashSet<&str> = HashSet::from([origin]);
        let mut queue: VecDeque<(&str, u32)> = VecDeque::from([(origin, 0)]);
        let mut reached = Vec::new();

        while let Some((email, distance)) = queue.pop_front() {
            if max_depth.is_some_and(|max| distance >= max) {
                continue;
            }
            let Some(neighbours) = self.adjacency.get(email) else {
                continue;
            };
            for neighbour in neighbours {
                if seen.insert(neighbour.as_str()) {
                    reached.push((neighbour.clone(), distance + 1));
                    queue.push_back((neighbour.as_str(), distance + 1));
                }
            }
        }

        reached
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RiskContact {
    pub email: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TierContacts {
    pub tier: TierSpec,
    pub contacts: Vec<RiskContact>,
}

impl TierContacts {
    pub fn names(&self) -> Vec<String> {
        self.contacts.iter().map(|c| c.name.clone()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RiskTiers {
    pub tiers: Vec<TierContacts>,
}

impl RiskTiers {
    pub fn get(&self, name: &str) -> Option<&TierContacts> {
        self.tiers.iter().find(|tier| tier.tier.name == name)
    }

    pub fn total_contacts(&self) -> usize {
        self.tiers.iter().map(|tier| tier.contacts.len()).sum()
    }
}

pub struct TraversalOrigin<'a> {
    pub email: &'a str,
    pub cohort: Option<&'a str>,
}

pub fn classify_contacts(
    graph: &InteractionGraph,
    origin: &TraversalOrigin<'_>,
    directory: &HashMap<String, ContactProfile>,
    plan: &TierPlan,
    policy: CohortPolicy,
) -> RiskTiers {
    let mut primary: Vec<Vec<RiskContact>> = vec![Vec::new(); plan.tiers().len()];
    let mut deferred: Vec<Vec<RiskContact>> = vec![Vec::new(); plan.tiers().len()];

    for (email, distance) in graph.contacts_by_distance(origin.email, plan.max_depth()) {
        let Some(index) = plan.tier_for(distance) else {
            continue;
        };

        let profile = directory.get(&email);
        let cohort_mate = match (origin.cohort, profile.and_then(|p| p.cohort.as_deref())) {
            (Some(mine), Some(theirs)) => mine == theirs,
            _ => false,
        };
        let contact = RiskContact {
            name: profile
                .map(|p| p.name.clone())
                .unwrap_or_else(|| display_name("", "", &email)),
            email,
        };

        match (cohort_mate, policy) {
            (false, _) => primary[index].push(contact),
            (true, CohortPolicy::Exclude) => {}
            (true, CohortPolicy::Deprioritize) => deferred[index].push(contact),
        }
    }

    let tiers = plan
        .tiers()
        .iter()
        .cloned()
        .zip(primary.into_iter().zip(deferred))
        .map(|(tier, (mut contacts, later))| {
            contacts.extend(later);
            TierContacts { tier, contacts }
        })
        .collect();

    RiskTiers { tiers }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("a lookback of {0} days reaches past the earliest representable time")]
pub struct LookbackError(pub u32);

pub fn lookback_cutoff(
    now: DateTime<Utc>,
    lookback_days: u32,
) -> Result<DateTime<Utc>, LookbackError> {
    Duration::try_days(i64::from(lookback_days))
        .and_then(|window| now.checked_sub_signed(window))
        .ok_or(LookbackError(lookback_days))
}

/// Load the school's window-filtered interactions and classify the trigger's contacts.
pub async fn calculate_interaction_risks(
    store: &dyn GraphStore,
    member: &Member,
    lookback_days: u32,
    plan: &TierPlan,
    policy: CohortPolicy,
    now: DateTime<Utc>,
) -> anyhow::Result<RiskTiers> {
    let since = lookback_cutoff(now, lookback_days)?;
    let interactions = store
        .interactions_since(&member.school, since)
        .await
        .context("failed to load interactions")?;
    let directory: HashMap<String, ContactProfile> = store
        .members(&member.school)
        .await
        .context("failed to load school members")?
        .iter()
        .map(|m| (m.email.clone(), ContactProfile::from(m)))
        .collect();

    let graph = InteractionGraph::from_interactions(&interactions, since);
    let origin = TraversalOrigin {
        email: &member.email,
        cohort: member.cohort.as_deref(),
    };
    let tiers = classify_contacts(&graph, &origin, &directory, plan, policy);

    for tier in &tiers.tiers {
        info!(
            "Tier {} (depth {:?}): {} contacts",
            tier.tier.name,
            tier.tier.depth,
            tier.contacts.len()
        );
    }

    Ok(tiers)
}
