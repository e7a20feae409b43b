use std::collections::BTreeMap;
use crate::config::NamesConfig;
use crate::location::cache::normalize_name;

/// A caller-supplied machine name after suffix stripping and alias mapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedName {
    /// Hostname the provider knows the machine by
    pub real: String,
    /// `<alias>.<vanity_domain>` when an alias applies, else the cleaned name
    pub vanity: String,
}

impl ResolvedName {
    /// The vanity name, only when it differs from the real one
    pub fn alias(&self) -> Option<&str> {
        (self.vanity != self.real).then_some(self.vanity.as_str())
    }
}

/// Maps the names clients use onto provider hostnames.
#[derive(Debug, Clone)]
pub struct NameResolver {
    domain_suffixes: Vec<String>,
    vanity_domain: String,
    /// Longest alias first, so "db" cannot shadow "db-replica"
    vanity: Vec<(String, String)>,
}

impl NameResolver {
    pub fn new(config: &NamesConfig) -> Self {
        Self::from_parts(&config.domain_suffixes, &config.vanity_domain, &config.vanity)
    }

    fn from_parts(suffixes: &[String], vanity_domain: &str, vanity: &BTreeMap<String, String>) -> Self {
        let mut vanity: Vec<_> = vanity
            .iter()
            .filter(|(alias, _)| !alias.is_empty())
            .map(|(alias, real)| (alias.clone(), real.clone()))
            .collect();
        vanity.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));

        Self {
            domain_suffixes: suffixes.to_vec(),
            vanity_domain: vanity_domain.trim_matches('.').to_string(),
            vanity,
        }
    }

    /// Strip the first configured domain suffix that matches, then any
    /// domain part left over, the same way cache lookups do.
    pub fn clean<'a>(&self, name: &'a str) -> &'a str {
        let name = name.trim();
        let stripped = self
            .domain_suffixes
            .iter()
            .filter_map(|suffix| name.strip_suffix(suffix.as_str()))
            .find(|stripped| !stripped.is_empty());
        if let Some(stripped) = stripped {
            tracing::debug!("Stripped domain suffix from VM name: {} -> {}", name, stripped);
        }
        normalize_name(stripped.unwrap_or(name))
    }

    fn alias_for(&self, cleaned: &str) -> Option<&(String, String)> {
        self.vanity
            .iter()
            .find(|(alias, real)| cleaned.starts_with(alias.as_str()) || cleaned == real)
    }

    pub fn resolve(&self, name: &str) -> ResolvedName {
        let cleaned = self.clean(name);

        match self.alias_for(cleaned) {
            Some((alias, real)) => {
                if cleaned != real {
                    tracing::info!("Mapped vanity name {} to {}", cleaned, real);
                }
                ResolvedName {
                    real: real.clone(),
                    vanity: format!("{}.{}", alias, self.vanity_domain),
                }
            }
            None => ResolvedName {
                real: cleaned.to_string(),
                vanity: cleaned.to_string(),
            },
        }
    }
}
