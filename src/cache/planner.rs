//! Invalidation planning.
//!
//! A batch of events becomes one plan: for each namespace, the set of
//! targets to drop. Targets are expressed relative to the namespace so the
//! executing service can render them with its own key prefix and version.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

use uuid::Uuid;

use super::config::namespaces::{API, COLLECTION, CONFIG, CONTENT, MEDIA, PLUGIN, SESSION, USER};
use super::events::{CacheEvent, EventKind};

/// What to drop inside one namespace.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Target {
    /// Every key in the namespace.
    All,
    /// Every key of one kind (`content:list:*`).
    Kind(String),
    /// One entry (`content:item:42`).
    Item { kind: String, id: String },
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::All => f.write_str("*"),
            Target::Kind(kind) => write!(f, "{kind}:*"),
            Target::Item { kind, id } => write!(f, "{kind}:{id}"),
        }
    }
}

fn item(kind: &str, id: &str) -> Target {
    Target::Item {
        kind: kind.to_string(),
        id: id.to_string(),
    }
}

fn of_kind(kind: &str) -> Target {
    Target::Kind(kind.to_string())
}

/// Merged invalidation work for a batch of events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationPlan {
    targets: BTreeMap<String, BTreeSet<Target>>,
    event_count: usize,
}

impl InvalidationPlan {
    /// Build a plan from events. Duplicate event ids are applied once.
    pub fn from_events(events: Vec<CacheEvent>) -> Self {
        let mut plan = Self::default();
        let mut seen: HashSet<Uuid> = HashSet::new();

        let mut events = events;
        events.sort_by_key(|event| event.epoch);

        for event in events {
            if !seen.insert(event.id) {
                continue;
            }
            plan.event_count += 1;
            plan.apply(&event.kind);
        }

        plan.prune();
        plan
    }

    fn add(&mut self, namespace: &str, target: Target) {
        self.targets
            .entry(namespace.to_string())
            .or_default()
            .insert(target);
    }

    /// Point target for an optional payload field. Absent or empty ids add nothing.
    fn add_item(&mut self, namespace: &str, kind: &str, id: Option<&String>) {
        if let Some(id) = id.filter(|id| !id.is_empty()) {
            self.add(namespace, item(kind, id));
        }
    }

    fn apply(&mut self, kind: &EventKind) {
        match kind {
            EventKind::ContentCreated | EventKind::ContentPublished => {
                self.add(CONTENT, Target::All);
                self.add(API, Target::All);
            }
            EventKind::ContentUpdated { id } => {
                self.add_item(CONTENT, "item", id.as_ref());
                self.add(CONTENT, of_kind("list"));
                self.add(API, Target::All);
            }
            EventKind::ContentDeleted { id } => {
                self.add_item(CONTENT, "item", id.as_ref());
                self.add(CONTENT, Target::All);
                self.add(API, Target::All);
            }
            EventKind::UserUpdated { id, email } | EventKind::UserDeleted { id, email } => {
                self.add_item(USER, "id", id.as_ref());
                self.add_item(USER, "email", email.as_ref());
            }
            EventKind::AuthLogin { user_id } => {
                self.add_item(USER, "id", user_id.as_ref());
            }
            EventKind::AuthLogout { session_id } => {
                self.add_item(SESSION, "session", session_id.as_ref());
            }
            EventKind::ConfigUpdated => {
                self.add(CONFIG, Target::All);
            }
            EventKind::PluginActivated { .. } | EventKind::PluginDeactivated { .. } => {
                self.add(CONFIG, Target::All);
                self.add(PLUGIN, Target::All);
            }
            EventKind::PluginUpdated { .. } => {
                self.add(PLUGIN, Target::All);
            }
            EventKind::MediaUploaded => {
                self.add(MEDIA, Target::All);
            }
            EventKind::MediaUpdated { id } | EventKind::MediaDeleted { id } => {
                self.add_item(MEDIA, "item", id.as_ref());
                self.add(MEDIA, of_kind("list"));
            }
            EventKind::CollectionCreated | EventKind::CollectionDeleted { .. } => {
                self.add(COLLECTION, Target::All);
            }
            EventKind::CollectionUpdated { id } => {
                self.add_item(COLLECTION, "item", id.as_ref());
                self.add(COLLECTION, Target::All);
                self.add(API, Target::All);
            }
        }
    }

    /// Drop targets already covered by a wider target in the same namespace.
    fn prune(&mut self) {
        for targets in self.targets.values_mut() {
            if targets.contains(&Target::All) {
                targets.retain(|target| *target == Target::All);
                continue;
            }
            let kinds: BTreeSet<String> = targets
                .iter()
                .filter_map(|target| match target {
                    Target::Kind(kind) => Some(kind.clone()),
                    _ => None,
                })
                .collect();
            targets.retain(|target| match target {
                Target::Item { kind, .. } => !kinds.contains(kind),
                _ => true,
            });
        }
    }

    pub fn is_empty(&self) -> bool {
        self.targets.values().all(BTreeSet::is_empty)
    }

    /// Number of distinct events folded into the plan.
    pub fn event_count(&self) -> usize {
        self.event_count
    }

    pub fn namespaces(&self) -> impl Iterator<Item = &str> {
        self.targets.keys().map(String::as_str)
    }

    pub fn targets(&self) -> impl Iterator<Item = (&str, &Target)> {
        self.targets
            .iter()
            .flat_map(|(namespace, targets)| targets.iter().map(move |t| (namespace.as_str(), t)))
    }

    pub fn targets_for(&self, namespace: &str) -> Vec<&Target> {
        self.targets
            .get(namespace)
            .map(|targets| targets.iter().collect())
            .unwrap_or_default()
    }
}

impl fmt::Display for InvalidationPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InvalidationPlan {{ events: {}", self.event_count)?;
        for (namespace, targets) in &self.targets {
            let rendered: Vec<String> = targets.iter().map(Target::to_string).collect();
            write!(f, ", {namespace}: [{}]", rendered.join(", "))?;
        }
        write!(f, " }}")
    }
}
