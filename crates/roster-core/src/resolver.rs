use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::accessor::StoreAccessor;
use crate::model::{normalize_key, IdentityRecord, TableCounts};
use crate::ReconcileError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverOptions {
    /// Case-insensitive substring of name or email restricting the scan.
    pub search: Option<String>,
    pub match_email: bool,
    pub include_archived: bool,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self { search: None, match_email: false, include_archived: true }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd)]
#[serde(rename_all = "snake_case")]
pub enum MatchReason {
    Name,
    Email,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DuplicateCandidate {
    pub identity: IdentityRecord,
    pub counts: TableCounts,
    pub total_dependents: u64,
}

/// Identities that plausibly describe the same person.
///
/// The resolver never picks the canonical member; callers decide from `counts`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DuplicateGroup {
    pub key: String,
    pub reasons: Vec<MatchReason>,
    pub members: Vec<DuplicateCandidate>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DuplicateReport {
    pub scanned: usize,
    pub search: Option<String>,
    pub groups: Vec<DuplicateGroup>,
}

struct DisjointSet {
    parent: Vec<usize>,
}

impl DisjointSet {
    fn new(len: usize) -> Self {
        Self { parent: (0..len).collect() }
    }

    fn find(&mut self, mut node: usize) -> usize {
        while self.parent[node] != node {
            self.parent[node] = self.parent[self.parent[node]];
            node = self.parent[node];
        }
        node
    }

    fn union(&mut self, a: usize, b: usize) {
        let (root_a, root_b) = (self.find(a), self.find(b));
        if root_a != root_b {
            let (low, high) = if root_a < root_b { (root_a, root_b) } else { (root_b, root_a) };
            self.parent[high] = low;
        }
    }
}

fn union_buckets(set: &mut DisjointSet, buckets: &BTreeMap<String, Vec<usize>>) {
    for members in buckets.values() {
        for pair in members.windows(2) {
            set.union(pair[0], pair[1]);
        }
    }
}

/// Partition `identities` into duplicate groups of size two or more.
///
/// Returns index sets into `identities`, each sorted, ordered by their first index.
#[must_use]
pub fn group_duplicates(identities: &[IdentityRecord], match_email: bool) -> Vec<Vec<usize>> {
    let mut by_name: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    let mut by_email: BTreeMap<String, Vec<usize>> = BTreeMap::new();

    for (index, identity) in identities.iter().enumerate() {
        let name = identity.normalized_name();
        if !name.is_empty() {
            by_name.entry(name).or_default().push(index);
        }
        if match_email {
            if let Some(email) = identity.normalized_email() {
                by_email.entry(email).or_default().push(index);
            }
        }
    }

    let mut set = DisjointSet::new(identities.len());
    union_buckets(&mut set, &by_name);
    union_buckets(&mut set, &by_email);

    let mut components: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for index in 0..identities.len() {
        let root = set.find(index);
        components.entry(root).or_default().push(index);
    }

    components.into_values().filter(|members| members.len() >= 2).collect()
}

fn matches_search(identity: &IdentityRecord, needle: &str) -> bool {
    identity.normalized_name().contains(needle)
        || identity.normalized_email().is_some_and(|email| email.contains(needle))
}

fn match_reasons(members: &[&IdentityRecord], match_email: bool) -> Vec<MatchReason> {
    let mut reasons = BTreeSet::new();
    let names = members.iter().map(|identity| identity.normalized_name()).collect::<BTreeSet<_>>();
    if names.len() < members.len() {
        reasons.insert(MatchReason::Name);
    }
    if match_email {
        let emails =
            members.iter().filter_map(|identity| identity.normalized_email()).collect::<Vec<_>>();
        let distinct = emails.iter().collect::<BTreeSet<_>>();
        if distinct.len() < emails.len() {
            reasons.insert(MatchReason::Email);
        }
    }
    reasons.into_iter().collect()
}

/// Scan the identity table for duplicate groups and attach dependent counts.
///
/// Read-only; running it twice against an unchanged store yields the same report.
///
/// # Errors
/// Returns an error when the identity table or any dependent table cannot be read.
pub fn find_duplicates<S: StoreAccessor + ?Sized>(
    store: &S,
    options: &ResolverOptions,
) -> Result<DuplicateReport, ReconcileError> {
    let needle = options.search.as_deref().map(normalize_key).filter(|term| !term.is_empty());

    let mut identities = store
        .list_identities()?
        .into_iter()
        .filter(|identity| options.include_archived || !identity.archived)
        .filter(|identity| needle.as_deref().map_or(true, |term| matches_search(identity, term)))
        .collect::<Vec<_>>();
    identities.sort_by(|a, b| a.id.cmp(&b.id));

    tracing::info!(
        scanned = identities.len(),
        mode = %store.mode(),
        "scanning identities for duplicates"
    );

    let mut groups = Vec::new();
    for indices in group_duplicates(&identities, options.match_email) {
        let members = indices.iter().map(|index| &identities[*index]).collect::<Vec<_>>();
        let reasons = match_reasons(&members, options.match_email);
        let key = members
            .iter()
            .map(|identity| identity.normalized_name())
            .min()
            .unwrap_or_default();

        let mut candidates = Vec::with_capacity(members.len());
        for identity in members {
            let counts = store.dependent_counts(&identity.id)?;
            candidates.push(DuplicateCandidate {
                identity: identity.clone(),
                total_dependents: counts.total(),
                counts,
            });
        }

        groups.push(DuplicateGroup { key, reasons, members: candidates });
    }
    groups.sort_by(|a, b| {
        a.key.cmp(&b.key).then_with(|| a.members[0].identity.id.cmp(&b.members[0].identity.id))
    });

    Ok(DuplicateReport { scanned: identities.len(), search: options.search.clone(), groups })
}
