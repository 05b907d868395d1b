//! The agent registry and the descriptor list it is fed from.

use crate::error::Fault;
use crate::events::RegistryEvents;
use crate::scheduler::EventScheduler;
use config::{Config, File};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

/// Where an agent can be reached.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
pub struct AgentDescriptor {
    /// Unique key within a registry.
    pub name: String,
    pub address: String,
    pub port: u16,
}

impl AgentDescriptor {
    pub fn new(name: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            port,
        }
    }
}

impl fmt::Display for AgentDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.name, self.address, self.port)
    }
}

/// An ordered list of descriptors, as loaded from a file:
///
/// ```toml
/// [[agents]]
/// name = "alpha"
/// address = "10.0.0.1"
/// port = 9000
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DescriptorSet {
    #[serde(default)]
    pub agents: Vec<AgentDescriptor>,
}

impl DescriptorSet {
    /// Loads a descriptor list. The format follows the file extension.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, config::ConfigError> {
        Config::builder()
            .add_source(File::from(path.as_ref()))
            .build()?
            .try_deserialize()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

impl IntoIterator for DescriptorSet {
    type Item = AgentDescriptor;
    type IntoIter = std::vec::IntoIter<AgentDescriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.agents.into_iter()
    }
}

/// The set of accepted agents.
///
/// Every candidate is offered to the `AGENT_REGISTERED` routines, repeats
/// included; if their fold comes back cancelled, the candidate is rejected.
/// Members form a set by value:
///
/// - a candidate equal to a member is accepted and changes nothing;
/// - a candidate sharing a member's name but not its address or port is
///   rejected, and the member is kept.
#[derive(Clone)]
pub struct AgentRegistry {
    scheduler: EventScheduler,
    agents: Arc<RwLock<BTreeSet<AgentDescriptor>>>,
}

impl AgentRegistry {
    pub fn new(scheduler: EventScheduler) -> Self {
        Self {
            scheduler,
            agents: Arc::new(RwLock::new(BTreeSet::new())),
        }
    }

    /// Offers one descriptor. Returns `true` if it was rejected.
    pub fn register_one(&self, descriptor: AgentDescriptor) -> Result<bool, Fault> {
        let cancelled = self
            .scheduler
            .dispatch(&RegistryEvents::AGENT_REGISTERED, &descriptor)?;
        if cancelled {
            debug!("Registration of {} was vetoed.", descriptor);
            return Ok(true);
        }

        let mut agents = self.agents.write().unwrap_or_else(PoisonError::into_inner);
        if agents.contains(&descriptor) {
            debug!("Agent {} is already registered.", descriptor);
            return Ok(false);
        }
        if let Some(member) = agents.iter().find(|a| a.name == descriptor.name) {
            warn!("Rejecting {}: name is taken by {}.", descriptor, member);
            return Ok(true);
        }
        info!("Registered agent {}.", descriptor);
        agents.insert(descriptor);
        Ok(false)
    }

    /// Offers every descriptor in order and returns the accepted ones.
    pub fn register_all(
        &self,
        descriptors: impl IntoIterator<Item = AgentDescriptor>,
    ) -> Result<Vec<AgentDescriptor>, Fault> {
        let mut accepted = Vec::new();
        for descriptor in descriptors {
            if !self.register_one(descriptor.clone())? {
                accepted.push(descriptor);
            }
        }
        Ok(accepted)
    }

    /// A snapshot of the members, ordered by name.
    pub fn agents(&self) -> Vec<AgentDescriptor> {
        self.agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn get_agent(&self, name: &str) -> Option<AgentDescriptor> {
        self.agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|a| a.name == name)
            .cloned()
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.get_agent(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.agents.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("agents", &self.agents())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Verdict;
    use std::io::Write;
    use std::sync::Mutex;

    fn descriptors() -> Vec<AgentDescriptor> {
        vec![
            AgentDescriptor::new("d1", "10.0.0.1", 9001),
            AgentDescriptor::new("d2", "10.0.0.2", 9002),
            AgentDescriptor::new("d3", "10.0.0.3", 9003),
        ]
    }

    #[test]
    fn test_register_all_without_routines_accepts_everything() {
        let registry = AgentRegistry::new(EventScheduler::new());
        let accepted = registry.register_all(descriptors()).unwrap();
        assert_eq!(accepted, descriptors());
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.get_agent("d2").map(|d| d.port), Some(9002));
        assert!(registry.get_agent("nope").is_none());
    }

    #[test]
    fn test_veto_rejects_everything() {
        let scheduler = EventScheduler::new();
        scheduler
            .on(RegistryEvents::AGENT_REGISTERED, |_| Ok(Verdict::Cancel))
            .unwrap();
        let registry = AgentRegistry::new(scheduler);

        let accepted = registry.register_all(descriptors()).unwrap();
        assert!(accepted.is_empty());
        assert!(registry.is_empty());
        for descriptor in descriptors() {
            assert!(!registry.is_registered(&descriptor.name));
        }
    }

    #[test]
    fn test_routines_see_the_candidate() {
        let scheduler = EventScheduler::new();
        let offered = Arc::new(Mutex::new(Vec::new()));
        let offered_in = offered.clone();
        scheduler
            .on(RegistryEvents::AGENT_REGISTERED, move |event| {
                let descriptor = event
                    .payload::<AgentDescriptor>()
                    .ok_or_else(|| Fault::handler("missing descriptor"))?;
                offered_in.lock().unwrap().push(descriptor.name.clone());
                Ok(Verdict::from(descriptor.name == "d2"))
            })
            .unwrap();
        let registry = AgentRegistry::new(scheduler);

        let accepted = registry.register_all(descriptors()).unwrap();
        let names: Vec<_> = accepted.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["d1", "d3"]);
        assert_eq!(*offered.lock().unwrap(), vec!["d1", "d2", "d3"]);
    }

    #[test]
    fn test_repeats_are_offered_and_deduplicated() {
        let scheduler = EventScheduler::new();
        let offers = Arc::new(Mutex::new(0));
        let offers_in = offers.clone();
        scheduler
            .on(RegistryEvents::AGENT_REGISTERED, move |_| {
                *offers_in.lock().unwrap() += 1;
                Ok(Verdict::Pass)
            })
            .unwrap();
        let registry = AgentRegistry::new(scheduler);

        assert!(!registry.register_one(AgentDescriptor::new("d1", "a", 1)).unwrap());
        // Equal to the member: accepted, nothing changes.
        assert!(!registry.register_one(AgentDescriptor::new("d1", "a", 1)).unwrap());
        // Same name, different endpoint: rejected, member kept.
        assert!(registry.register_one(AgentDescriptor::new("d1", "b", 2)).unwrap());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get_agent("d1").unwrap().address, "a");
        assert_eq!(*offers.lock().unwrap(), 3);
    }

    #[test]
    fn test_veto_of_a_repeat_is_reported() {
        let scheduler = EventScheduler::new();
        let seen = Arc::new(Mutex::new(0));
        let seen_in = seen.clone();
        scheduler
            .on(RegistryEvents::AGENT_REGISTERED, move |_| {
                let mut seen = seen_in.lock().unwrap();
                *seen += 1;
                Ok(Verdict::from(*seen > 1))
            })
            .unwrap();
        let registry = AgentRegistry::new(scheduler);

        assert!(!registry.register_one(AgentDescriptor::new("d1", "a", 1)).unwrap());
        assert!(registry.register_one(AgentDescriptor::new("d1", "a", 1)).unwrap());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_routine_fault_propagates() {
        let scheduler = EventScheduler::new();
        scheduler
            .on(RegistryEvents::AGENT_REGISTERED, |_| Err(Fault::handler("registry offline")))
            .unwrap();
        let registry = AgentRegistry::new(scheduler);

        assert!(registry.register_all(descriptors()).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_descriptor_set_keeps_file_order() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[[agents]]
name = "zeta"
address = "127.0.0.1"
port = 9100

[[agents]]
name = "alpha"
address = "127.0.0.2"
port = 9200
"#
        )
        .unwrap();

        let set = DescriptorSet::load(file.path()).unwrap();
        assert_eq!(set.len(), 2);
        let names: Vec<_> = set.into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["zeta", "alpha"]);
    }
}
