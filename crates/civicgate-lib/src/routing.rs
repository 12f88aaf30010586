//! Routing table: adapters, areas, aliases, and provider assignments.
//!
//! Built once from [`GatewayConfig`] at startup and read-only afterwards.
//! Every configuration problem is reported as [`Error::Config`] from
//! [`RoutingTable::from_config`]; nothing is repaired at runtime.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::{debug, info};

use crate::config::{AdapterKind, AreaConfig, Bounds, CatalogSource, GatewayConfig, SeedService};
use crate::error::{Error, Result};
use crate::id::{AdapterId, AreaId, NRoute, ProviderId};

/// One backend integration process.
#[derive(Debug, Clone, PartialEq)]
pub struct Adapter {
    pub id: AdapterId,
    pub name: String,
    pub kind: AdapterKind,
    pub address: String,
    /// Areas this adapter has at least one provider in.
    pub areas: BTreeSet<AreaId>,
}

/// A provider assignment within an area.
#[derive(Debug, Clone, PartialEq)]
pub struct Provider {
    pub route: NRoute,
    pub name: String,
    pub catalog: CatalogSource,
    pub seed_services: Vec<SeedService>,
}

/// A serviced geography.
#[derive(Debug, Clone, PartialEq)]
pub struct Area {
    pub id: AreaId,
    pub name: String,
    pub bounds: Option<Bounds>,
    pub providers: BTreeMap<ProviderId, Provider>,
}

#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    adapters: BTreeMap<AdapterId, Adapter>,
    areas: BTreeMap<AreaId, Area>,
    aliases: HashMap<String, AreaId>,
}

fn alias_key(alias: &str) -> String {
    alias.trim().to_lowercase()
}

impl RoutingTable {
    /// Validate a configuration and build the table.
    pub fn from_config(config: &GatewayConfig) -> Result<Self> {
        let mut adapters = BTreeMap::new();
        for adapter in &config.adapters {
            if adapter.address.trim().is_empty() {
                return Err(Error::config(format!(
                    "adapter {} has no network address",
                    adapter.id
                )));
            }
            let entry = Adapter {
                id: adapter.id.clone(),
                name: adapter.name.clone(),
                kind: adapter.kind,
                address: adapter.address.clone(),
                areas: BTreeSet::new(),
            };
            if adapters.insert(adapter.id.clone(), entry).is_some() {
                return Err(Error::config(format!("duplicate adapter id {}", adapter.id)));
            }
        }

        let mut table = RoutingTable {
            adapters,
            areas: BTreeMap::new(),
            aliases: HashMap::new(),
        };
        for area in &config.areas {
            table.add_area(area)?;
        }

        info!(
            adapters = table.adapters.len(),
            areas = table.areas.len(),
            aliases = table.aliases.len(),
            "routing table built"
        );
        Ok(table)
    }

    fn add_area(&mut self, config: &AreaConfig) -> Result<()> {
        if self.areas.contains_key(&config.id) {
            return Err(Error::config(format!("duplicate area id {}", config.id)));
        }
        if let Some(bounds) = &config.bounds {
            if !bounds.is_well_formed() {
                return Err(Error::config(format!("area {} has invalid bounds", config.id)));
            }
        }

        let mut providers = BTreeMap::new();
        for provider in &config.providers {
            let adapter = self.adapters.get_mut(&provider.adapter).ok_or_else(|| {
                Error::config(format!(
                    "area {} provider {} references unknown adapter {}",
                    config.id, provider.id, provider.adapter
                ))
            })?;
            if provider.catalog == CatalogSource::Seed && provider.services.is_empty() {
                return Err(Error::config(format!(
                    "area {} provider {} uses a seed catalog with no services",
                    config.id, provider.id
                )));
            }
            let mut codes = BTreeSet::new();
            if let Some(dup) = provider.services.iter().find(|s| !codes.insert(s.code)) {
                return Err(Error::config(format!(
                    "area {} provider {} repeats service code {}",
                    config.id, provider.id, dup.code
                )));
            }

            adapter.areas.insert(config.id.clone());
            let entry = Provider {
                route: NRoute::new(provider.adapter.clone(), config.id.clone(), provider.id),
                name: provider.name.clone(),
                catalog: provider.catalog,
                seed_services: provider.services.clone(),
            };
            if providers.insert(provider.id, entry).is_some() {
                return Err(Error::config(format!(
                    "area {} has duplicate provider id {}",
                    config.id, provider.id
                )));
            }
        }

        let names = std::iter::once(config.id.as_str())
            .chain(std::iter::once(config.name.as_str()))
            .chain(config.aliases.iter().map(String::as_str));
        for name in names {
            let key = alias_key(name);
            if key.is_empty() {
                continue;
            }
            match self.aliases.get(&key) {
                Some(existing) if existing != &config.id => {
                    return Err(Error::config(format!(
                        "alias '{name}' maps to both {existing} and {}",
                        config.id
                    )));
                }
                _ => {
                    self.aliases.insert(key, config.id.clone());
                }
            }
        }

        debug!(area = %config.id, providers = providers.len(), "registered area");
        self.areas.insert(
            config.id.clone(),
            Area {
                id: config.id.clone(),
                name: config.name.clone(),
                bounds: config.bounds,
                providers,
            },
        );
        Ok(())
    }

    /// Resolve a free-text city name or area code to its canonical area.
    ///
    /// Lookups are trimmed and case-insensitive.
    pub fn resolve_area(&self, alias: &str) -> Result<AreaId> {
        self.aliases
            .get(&alias_key(alias))
            .cloned()
            .ok_or_else(|| Error::UnknownArea {
                alias: alias.to_string(),
            })
    }

    /// Every adapter configured to serve `area`.
    pub fn adapters_for_area(&self, area: &AreaId) -> Result<Vec<&Adapter>> {
        let adapters: Vec<&Adapter> = self
            .adapters
            .values()
            .filter(|adapter| adapter.areas.contains(area))
            .collect();
        if adapters.is_empty() {
            return Err(Error::NoServiceInArea {
                area: area.to_string(),
            });
        }
        Ok(adapters)
    }

    /// Every dispatch route in `area`, sorted.
    pub fn routes_for_area(&self, area: &AreaId) -> Result<Vec<NRoute>> {
        let routes: Vec<NRoute> = self
            .areas
            .get(area)
            .map(|a| a.providers.values().map(|p| p.route.clone()).collect())
            .unwrap_or_default();
        if routes.is_empty() {
            return Err(Error::NoServiceInArea {
                area: area.to_string(),
            });
        }
        Ok(routes)
    }

    /// Endpoint lookup for dispatch.
    pub fn resolve_adapter(&self, id: &AdapterId) -> Result<&Adapter> {
        self.adapters.get(id).ok_or_else(|| Error::UnknownAdapter {
            id: id.to_string(),
        })
    }

    /// True iff the adapter is known and it owns that provider in that area.
    pub fn validate_route(&self, route: &NRoute) -> bool {
        self.provider(route).is_some()
    }

    pub fn provider(&self, route: &NRoute) -> Option<&Provider> {
        if !self.adapters.contains_key(&route.adapter) {
            return None;
        }
        self.areas
            .get(&route.area)
            .and_then(|area| area.providers.get(&route.provider))
            .filter(|provider| provider.route.adapter == route.adapter)
    }

    pub fn area(&self, id: &AreaId) -> Option<&Area> {
        self.areas.get(id)
    }

    pub fn areas(&self) -> impl Iterator<Item = &Area> {
        self.areas.values()
    }

    pub fn adapters(&self) -> impl Iterator<Item = &Adapter> {
        self.adapters.values()
    }

    /// All providers across all areas.
    pub fn providers(&self) -> impl Iterator<Item = &Provider> {
        self.areas.values().flat_map(|area| area.providers.values())
    }
}
