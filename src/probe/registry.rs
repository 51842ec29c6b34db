use super::certificate::CertificateProbe;
use super::cipher::CipherProbe;
use super::extension::ExtensionProbe;
use super::vulnerability::{DecisionPolicy, VulnerabilityProbe};
use super::Probe;
use crate::error::ScanError;
use crate::model::ProbeId;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

pub type ProbeConstructor = Arc<dyn Fn() -> Arc<dyn Probe> + Send + Sync>;

/// Maps probe identifiers to constructors. Built once, then only read.
#[derive(Clone, Default)]
pub struct ProbeRegistry {
    entries: BTreeMap<ProbeId, ProbeConstructor>,
}

impl std::fmt::Debug for ProbeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeRegistry")
            .field("probes", &self.entries.len())
            .finish()
    }
}

impl ProbeRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Every capability, extension, vulnerability and certificate probe this
    /// crate ships.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        for probe in CipherProbe::catalog() {
            registry.register_instance(Arc::new(probe));
        }
        for probe in ExtensionProbe::catalog() {
            registry.register_instance(Arc::new(probe));
        }
        for policy in DecisionPolicy::builtin() {
            registry.register_policy(policy);
        }
        registry.register_instance(Arc::new(CertificateProbe::new()));
        registry
    }

    /// Later registrations under the same identifier replace earlier ones.
    pub fn register<F>(&mut self, id: ProbeId, constructor: F)
    where
        F: Fn() -> Arc<dyn Probe> + Send + Sync + 'static,
    {
        self.entries.insert(id, Arc::new(constructor));
    }

    pub fn register_policy(&mut self, policy: DecisionPolicy) {
        self.register_instance(Arc::new(VulnerabilityProbe::new(policy)));
    }

    fn register_instance(&mut self, probe: Arc<dyn Probe>) {
        let id = probe.spec().id.clone();
        self.register(id, move || probe.clone());
    }

    pub fn ids(&self) -> impl Iterator<Item = &ProbeId> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn create(&self, id: &ProbeId) -> Option<Arc<dyn Probe>> {
        self.entries.get(id).map(|constructor| constructor())
    }

    /// Resolve selectors to probes in identifier order. A selector is an
    /// exact identifier, a `prefix/*` glob, or `*` / `all`.
    pub fn resolve<S: AsRef<str>>(&self, selectors: &[S]) -> Result<Vec<Arc<dyn Probe>>, ScanError> {
        let mut chosen: BTreeSet<&ProbeId> = BTreeSet::new();
        for selector in selectors {
            let selector = selector.as_ref().trim();
            if selector.is_empty() {
                continue;
            }
            let before = chosen.len();
            let mut matched = false;
            if selector == "*" || selector == "all" {
                chosen.extend(self.entries.keys());
                matched = !self.entries.is_empty();
            } else if let Some(prefix) = selector.strip_suffix('*') {
                for id in self.entries.keys().filter(|id| id.as_str().starts_with(prefix)) {
                    chosen.insert(id);
                    matched = true;
                }
            } else if let Some((id, _)) = self.entries.get_key_value(&ProbeId::new(selector)) {
                chosen.insert(id);
                matched = true;
            }
            if !matched {
                return Err(ScanError::InvalidConfig(format!(
                    "probe selector '{selector}' matches nothing"
                )));
            }
            tracing::debug!(selector, added = chosen.len() - before, "resolved selector");
        }
        Ok(chosen.into_iter().filter_map(|id| self.create(id)).collect())
    }
}
