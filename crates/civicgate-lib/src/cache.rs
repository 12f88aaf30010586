//! Service catalog cache.
//!
//! The cache publishes immutable [`Generation`]s through an [`ArcSwap`]:
//! readers take a snapshot without locking and always see one complete
//! generation, while [`ServiceCache::refresh`] assembles the next one off to
//! the side and swaps it in whole. Seed catalogs are part of every
//! generation. A refresh that cannot reach any adapter carries the previous
//! generation's live services forward instead of dropping them.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::CatalogSource;
use crate::dispatch::{DispatchTarget, Dispatcher};
use crate::error::{Error, Result};
use crate::id::{AdapterId, AreaId, ServiceId};
use crate::routing::RoutingTable;
use crate::rpc::{CatalogEntry, CatalogReply, ServicesAll};

/// A reportable issue type owned by exactly one provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Service {
    pub id: ServiceId,
    pub name: String,
    pub categories: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// One complete, internally consistent catalog snapshot.
#[derive(Debug, Clone, Default)]
pub struct Generation {
    number: u64,
    built_at: Option<DateTime<Utc>>,
    areas: BTreeMap<AreaId, Vec<Service>>,
}

impl Generation {
    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn built_at(&self) -> Option<DateTime<Utc>> {
        self.built_at
    }

    pub fn services(&self, area: &AreaId) -> Option<&[Service]> {
        self.areas.get(area).map(Vec::as_slice)
    }

    pub fn find(&self, id: &ServiceId) -> Option<&Service> {
        self.areas
            .get(id.area())
            .and_then(|services| services.iter().find(|s| &s.id == id))
    }

    pub fn service_count(&self) -> usize {
        self.areas.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.areas.is_empty()
    }
}

/// Accumulates catalog entries for the next generation.
///
/// Entries may arrive in any order and may repeat; the first entry for a
/// given (area, provider, code) wins.
#[derive(Debug, Default)]
struct GenerationBuilder {
    seen: HashSet<ServiceId>,
    areas: BTreeMap<AreaId, Vec<Service>>,
}

impl GenerationBuilder {
    fn insert(&mut self, service: Service) -> bool {
        if !self.seen.insert(service.id.clone()) {
            return false;
        }
        self.areas
            .entry(service.id.area().clone())
            .or_default()
            .push(service);
        true
    }

    fn build(mut self, number: u64) -> Generation {
        for services in self.areas.values_mut() {
            services.sort_by(|a, b| {
                (a.id.provider(), a.id.code, a.id.adapter())
                    .cmp(&(b.id.provider(), b.id.code, b.id.adapter()))
            });
        }
        Generation {
            number,
            built_at: Some(Utc::now()),
            areas: self.areas,
        }
    }
}

/// Result of a refresh that published a new generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshSummary {
    pub generation: u64,
    pub services: usize,
    pub queried: usize,
    pub failed: Vec<AdapterId>,
}

pub struct ServiceCache {
    current: ArcSwap<Generation>,
    routing: Arc<RoutingTable>,
    refresh_lock: Mutex<()>,
}

impl std::fmt::Debug for ServiceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let current = self.current.load();
        f.debug_struct("ServiceCache")
            .field("generation", &current.number)
            .field("services", &current.service_count())
            .finish()
    }
}

impl ServiceCache {
    /// Create a cache holding the empty generation 0.
    pub fn new(routing: Arc<RoutingTable>) -> Self {
        Self {
            current: ArcSwap::from_pointee(Generation::default()),
            routing,
            refresh_lock: Mutex::new(()),
        }
    }

    /// Snapshot of the generation currently served to readers.
    pub fn snapshot(&self) -> Arc<Generation> {
        self.current.load_full()
    }

    pub fn generation(&self) -> u64 {
        self.current.load().number
    }

    /// Services of `area` in the current generation.
    pub fn services_for_area(&self, area: &AreaId) -> Result<Vec<Service>> {
        self.current
            .load()
            .services(area)
            .filter(|services| !services.is_empty())
            .map(<[Service]>::to_vec)
            .ok_or_else(|| Error::AreaNotServiced {
                area: area.to_string(),
            })
    }

    /// True iff the route is valid and the code exists under that provider in
    /// the current generation.
    pub fn validate_service_id(&self, id: &ServiceId) -> bool {
        self.routing.validate_route(&id.route) && self.current.load().find(id).is_some()
    }

    /// Look up a service in the current generation.
    pub fn service(&self, id: &ServiceId) -> Option<Service> {
        self.current.load().find(id).cloned()
    }

    /// Rebuild the catalog from seed data and every live adapter.
    ///
    /// # Errors
    ///
    /// [`Error::RefreshPartial`] when the new generation was published
    /// without some adapters. When every adapter failed, the new generation
    /// holds the seed catalogs plus the previous generation's services.
    pub async fn refresh(&self, dispatcher: &Dispatcher, request_id: u64) -> Result<RefreshSummary> {
        let _guard = self.refresh_lock.lock().await;
        let number = self.current.load().number + 1;
        let mut builder = GenerationBuilder::default();

        for provider in self.routing.providers() {
            if provider.catalog != CatalogSource::Seed {
                continue;
            }
            for seed in &provider.seed_services {
                builder.insert(Service {
                    id: provider.route.service(seed.code),
                    name: seed.name.clone(),
                    categories: seed.categories.clone(),
                    description: seed.description.clone(),
                });
            }
        }

        let live: Vec<DispatchTarget> = self
            .routing
            .adapters()
            .filter(|adapter| {
                self.routing.providers().any(|p| {
                    p.route.adapter == adapter.id && p.catalog == CatalogSource::Live
                })
            })
            .map(|adapter| DispatchTarget::adapter(adapter.id.clone()))
            .collect();

        let mut answered: HashSet<AdapterId> = HashSet::new();
        if !live.is_empty() {
            let routing = Arc::clone(&self.routing);
            let merged = dispatcher
                .run(request_id, &ServicesAll {}, live.clone(), |target, reply: CatalogReply| {
                    answered.insert(target.adapter.clone());
                    for entry in reply.services {
                        merge_entry(&routing, &mut builder, &target.adapter, entry);
                    }
                })
                .await;
            if let Err(err) = merged {
                warn!(
                    generation = number,
                    error = %err,
                    "catalog refresh failed for every adapter; carrying live services forward"
                );
                let previous = self.current.load();
                for service in previous.areas.values().flatten() {
                    builder.insert(service.clone());
                }
            }
        }

        let failed: Vec<AdapterId> = live
            .iter()
            .map(|target| target.adapter.clone())
            .filter(|adapter| !answered.contains(adapter))
            .collect();
        let generation = builder.build(number);
        let summary = RefreshSummary {
            generation: number,
            services: generation.service_count(),
            queried: live.len(),
            failed,
        };
        self.current.store(Arc::new(generation));

        info!(
            generation = summary.generation,
            services = summary.services,
            queried = summary.queried,
            failed = summary.failed.len(),
            "catalog generation published"
        );

        if summary.failed.is_empty() {
            Ok(summary)
        } else {
            Err(Error::RefreshPartial {
                generation: summary.generation,
                failed: summary.failed.iter().map(ToString::to_string).collect(),
            })
        }
    }
}

fn merge_entry(
    routing: &RoutingTable,
    builder: &mut GenerationBuilder,
    adapter: &AdapterId,
    entry: CatalogEntry,
) {
    let id = ServiceId::new(adapter.clone(), entry.area, entry.provider, entry.code);
    match routing.provider(&id.route) {
        Some(provider) if provider.catalog == CatalogSource::Live => {
            builder.insert(Service {
                id,
                name: entry.name,
                categories: entry.categories,
                description: entry.description,
            });
        }
        _ => {
            warn!(adapter = %adapter, service = %id, "dropping catalog entry for unassigned route");
        }
    }
}
