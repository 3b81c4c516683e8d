//! Which probe handles which external source.
//!
//! Lookup order: exact identifier first, then patterns in registration
//! order. A directory is immutable once built; [`ProbeDirectory::with_descriptor`]
//! returns an extended copy.
//!
//! # Example
//!
//! ```rust,ignore
//! let directory = ProbeDirectory::builder()
//!     .exact("http://weather.example/today", Arc::new(WeatherProbe))
//!     .pattern(r"^https?://[^/]+/feeds/.*\.rss$", Arc::new(RssProbe))
//!     .build()?;
//! ```

use super::{CoherenceSpecification, Probe};
use crate::error::{MeshError, Result};
use crate::identifier::NetworkIdentifier;
use crate::metrics;
use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// How a descriptor selects identifiers.
#[derive(Debug, Clone)]
pub enum ProbeMatcher {
    Exact(NetworkIdentifier),
    Pattern(Regex),
}

impl ProbeMatcher {
    pub fn matches(&self, identifier: &NetworkIdentifier) -> bool {
        match self {
            ProbeMatcher::Exact(exact) => exact == identifier,
            ProbeMatcher::Pattern(regex) => regex.is_match(identifier.as_str()),
        }
    }
}

impl fmt::Display for ProbeMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeMatcher::Exact(id) => write!(f, "{}", id),
            ProbeMatcher::Pattern(regex) => write!(f, "/{}/", regex.as_str()),
        }
    }
}

/// A matcher and the probe it selects.
#[derive(Clone)]
pub struct ProbeDescriptor {
    name: String,
    matcher: ProbeMatcher,
    probe: Arc<dyn Probe>,
    default_coherence: Option<CoherenceSpecification>,
}

impl fmt::Debug for ProbeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProbeDescriptor")
            .field("name", &self.name)
            .field("matcher", &self.matcher.to_string())
            .field("default_coherence", &self.default_coherence)
            .finish()
    }
}

impl ProbeDescriptor {
    pub fn new(name: impl Into<String>, matcher: ProbeMatcher, probe: Arc<dyn Probe>) -> Self {
        Self {
            name: name.into(),
            matcher,
            probe,
            default_coherence: None,
        }
    }

    /// Coherence for sources of this kind when the accessor gives none.
    pub fn with_default_coherence(mut self, coherence: CoherenceSpecification) -> Self {
        self.default_coherence = Some(coherence);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn matcher(&self) -> &ProbeMatcher {
        &self.matcher
    }

    pub fn probe(&self) -> &Arc<dyn Probe> {
        &self.probe
    }

    pub fn default_coherence(&self) -> Option<&CoherenceSpecification> {
        self.default_coherence.as_ref()
    }
}

/// Read-only registry of probe descriptors.
#[derive(Debug, Clone, Default)]
pub struct ProbeDirectory {
    exact: HashMap<NetworkIdentifier, Arc<ProbeDescriptor>>,
    patterns: Vec<Arc<ProbeDescriptor>>,
}

impl ProbeDirectory {
    pub fn builder() -> ProbeDirectoryBuilder {
        ProbeDirectoryBuilder::default()
    }

    /// The descriptor responsible for `identifier`.
    ///
    /// # Errors
    ///
    /// [`MeshError::NoProbeFound`] if nothing matches. This is permanent for
    /// the identifier until the directory changes.
    pub fn find(&self, identifier: &NetworkIdentifier) -> Result<Arc<ProbeDescriptor>> {
        if let Some(descriptor) = self.exact.get(identifier) {
            return Ok(Arc::clone(descriptor));
        }
        self.patterns
            .iter()
            .find(|d| d.matcher.matches(identifier))
            .cloned()
            .ok_or_else(|| {
                metrics::record_no_probe_found();
                MeshError::NoProbeFound(identifier.to_string())
            })
    }

    /// A copy of this directory with one more descriptor.
    pub fn with_descriptor(&self, descriptor: ProbeDescriptor) -> Result<Self> {
        let mut extended = self.clone();
        extended.insert(descriptor)?;
        Ok(extended)
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&mut self, descriptor: ProbeDescriptor) -> Result<()> {
        match &descriptor.matcher {
            ProbeMatcher::Exact(id) => {
                if self.exact.contains_key(id) {
                    return Err(MeshError::Config(format!("probe for {} registered twice", id)));
                }
                self.exact.insert(id.clone(), Arc::new(descriptor));
            }
            ProbeMatcher::Pattern(_) => self.patterns.push(Arc::new(descriptor)),
        }
        Ok(())
    }
}

/// Collects descriptors; errors surface from [`build()`](Self::build).
#[derive(Default)]
pub struct ProbeDirectoryBuilder {
    descriptors: Vec<ProbeDescriptor>,
    error: Option<MeshError>,
}

impl ProbeDirectoryBuilder {
    /// Serve exactly this identifier.
    pub fn exact(mut self, identifier: &str, probe: Arc<dyn Probe>) -> Self {
        match NetworkIdentifier::parse(identifier) {
            Ok(id) => {
                let name = id.to_string();
                self.descriptors
                    .push(ProbeDescriptor::new(name, ProbeMatcher::Exact(id), probe));
            }
            Err(e) => self.fail(e),
        }
        self
    }

    /// Serve every identifier matching `pattern`.
    pub fn pattern(mut self, pattern: &str, probe: Arc<dyn Probe>) -> Self {
        match Regex::new(pattern) {
            Ok(regex) => self.descriptors.push(ProbeDescriptor::new(
                pattern,
                ProbeMatcher::Pattern(regex),
                probe,
            )),
            Err(e) => self.fail(MeshError::Config(format!("bad probe pattern {:?}: {}", pattern, e))),
        }
        self
    }

    pub fn descriptor(mut self, descriptor: ProbeDescriptor) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    pub fn build(self) -> Result<ProbeDirectory> {
        if let Some(e) = self.error {
            return Err(e);
        }
        let mut directory = ProbeDirectory::default();
        for descriptor in self.descriptors {
            directory.insert(descriptor)?;
        }
        Ok(directory)
    }

    fn fail(&mut self, error: MeshError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }
}
