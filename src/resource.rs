//! Cached accessors for the clinic's REST collections.
//!
//! Each [`Collection`] reads through three stores: the full list under `list`, filtered queries
//! under `query:...`, and single items under `item:{id}`. The stores live in the client's
//! [`CollectionRegistry`], so every accessor for one collection and item type shares them. Every
//! write invalidates the list, every query, and the item it touched. Over-invalidating is fine;
//! leaving a stale entry reachable is not.

use crate::cache::CachePolicy;
use crate::client::ApiClient;
use crate::config::CacheTtls;
use crate::request::{ApiRequest, ApiResponse};
use crate::store::{Invalidate, ResourceStore, StoreState};
use crate::{ApiError, ErrorKind};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tower_service::Service;

const LIST_KEY: &str = "list";
const QUERY_PREFIX: &str = "query:";

/// How quickly a collection's contents go stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Volatility {
    /// Changes throughout the day.
    Frequent,
    /// Reference data that rarely changes.
    Reference,
    /// Date-ranged or otherwise parameterised results.
    Ranged,
}

impl Volatility {
    pub fn ttl(self, ttls: &CacheTtls) -> Duration {
        match self {
            Volatility::Frequent => ttls.frequent(),
            Volatility::Reference => ttls.reference(),
            Volatility::Ranged => ttls.ranged(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Clients,
    Pets,
    Appointments,
    Veterinarians,
    MedicalRecords,
    Vaccinations,
    Allergies,
    Medications,
    Treatments,
    Surgeries,
    Invoices,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 11] = [
        ResourceKind::Clients,
        ResourceKind::Pets,
        ResourceKind::Appointments,
        ResourceKind::Veterinarians,
        ResourceKind::MedicalRecords,
        ResourceKind::Vaccinations,
        ResourceKind::Allergies,
        ResourceKind::Medications,
        ResourceKind::Treatments,
        ResourceKind::Surgeries,
        ResourceKind::Invoices,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ResourceKind::Clients => "clients",
            ResourceKind::Pets => "pets",
            ResourceKind::Appointments => "appointments",
            ResourceKind::Veterinarians => "veterinarians",
            ResourceKind::MedicalRecords => "medical-records",
            ResourceKind::Vaccinations => "vaccinations",
            ResourceKind::Allergies => "allergies",
            ResourceKind::Medications => "medications",
            ResourceKind::Treatments => "treatments",
            ResourceKind::Surgeries => "surgeries",
            ResourceKind::Invoices => "invoices",
        }
    }

    pub fn path(self) -> String {
        format!("/{}", self.name())
    }

    pub fn volatility(self) -> Volatility {
        match self {
            ResourceKind::Veterinarians | ResourceKind::Medications => Volatility::Reference,
            _ => Volatility::Frequent,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Cache key for a filtered list. Parameter order does not matter.
pub fn query_key(params: &[(&str, &str)]) -> String {
    let mut pairs: Vec<String> = params.iter().map(|(k, v)| format!("{k}={v}")).collect();
    pairs.sort();
    format!("{QUERY_PREFIX}{}", pairs.join("&"))
}

fn item_key(id: impl fmt::Display) -> String {
    format!("item:{id}")
}

/// The stores behind one collection.
struct CollectionStores<T> {
    lists: ResourceStore<Vec<T>>,
    queries: ResourceStore<Vec<T>>,
    items: ResourceStore<T>,
}

impl<T> Clone for CollectionStores<T> {
    fn clone(&self) -> Self {
        Self { lists: self.lists.clone(), queries: self.queries.clone(), items: self.items.clone() }
    }
}

type StoreMap = HashMap<(ResourceKind, TypeId), Arc<dyn Any + Send + Sync>>;

/// Collection stores shared by every clone of a client, created on first use per
/// collection and item type.
#[derive(Clone, Default)]
pub struct CollectionRegistry {
    stores: Arc<Mutex<StoreMap>>,
}

impl fmt::Debug for CollectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self.stores.lock().unwrap_or_else(PoisonError::into_inner).len();
        f.debug_struct("CollectionRegistry").field("collections", &len).finish()
    }
}

impl CollectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn stores<T>(&self, kind: ResourceKind, create: impl FnOnce() -> CollectionStores<T>) -> CollectionStores<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let mut map = self.stores.lock().unwrap_or_else(PoisonError::into_inner);
        let key = (kind, TypeId::of::<T>());
        if let Some(existing) = map.get(&key).and_then(|s| s.downcast_ref::<CollectionStores<T>>()) {
            return existing.clone();
        }
        let stores = create();
        map.insert(key, Arc::new(stores.clone()));
        tracing::trace!(collection = %kind, "collection stores created");
        stores
    }
}

/// Cached data accessor for one collection. Cheap to clone; every accessor for the same
/// collection and item type on one client sees the same cache and state.
pub struct Collection<T, S> {
    kind: ResourceKind,
    client: ApiClient<S>,
    lists: ResourceStore<Vec<T>>,
    queries: ResourceStore<Vec<T>>,
    items: ResourceStore<T>,
    ranged: CachePolicy,
}

impl<T, S: Clone> Clone for Collection<T, S> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            client: self.client.clone(),
            lists: self.lists.clone(),
            queries: self.queries.clone(),
            items: self.items.clone(),
            ranged: self.ranged,
        }
    }
}

impl<T, S> fmt::Debug for Collection<T, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("kind", &self.kind)
            .field("lists", &self.lists)
            .field("queries", &self.queries)
            .field("items", &self.items)
            .finish_non_exhaustive()
    }
}

impl<T, S> Collection<T, S>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
    S: Service<ApiRequest, Response = ApiResponse, Error = ApiError> + Clone + Send + Sync + 'static,
    S::Future: Send + 'static,
{
    pub fn new(kind: ResourceKind, client: ApiClient<S>) -> Self {
        let ctx = client.context();
        let ttls = ctx.config.cache;
        let CollectionStores { lists, queries, items } = ctx.collections.stores(kind, || {
            let policy = CachePolicy::ttl(kind.volatility().ttl(&ttls));
            // All three share the collection name, so loading keys read `pets:list`, `pets:item:4`.
            CollectionStores {
                lists: ResourceStore::new(kind.name(), policy, ctx.loading.clone(), ctx.clock.clone()),
                queries: ResourceStore::new(kind.name(), policy, ctx.loading.clone(), ctx.clock.clone()),
                items: ResourceStore::new(kind.name(), policy, ctx.loading.clone(), ctx.clock.clone()),
            }
        });
        let ranged = CachePolicy::ttl(Volatility::Ranged.ttl(&ttls));
        Self { kind, client, lists, queries, items, ranged }
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// Every record; an envelope without `data` is an empty list.
    pub async fn list(&self) -> Result<Vec<T>, ApiError> {
        let req = ApiRequest::get(self.kind.path());
        self.lists.fetch(LIST_KEY, || self.load_list(req)).await
    }

    /// Records matching `params`, cached with the short ranged TTL.
    pub async fn query(&self, params: &[(&str, &str)]) -> Result<Vec<T>, ApiError> {
        let mut req = ApiRequest::get(self.kind.path());
        for (k, v) in params {
            req = req.with_query(*k, *v);
        }
        self.queries.fetch_with(&query_key(params), self.ranged, || self.load_list(req)).await
    }

    pub async fn get(&self, id: impl fmt::Display) -> Result<T, ApiError> {
        let req = ApiRequest::get(format!("{}/{id}", self.kind.path()));
        self.items.fetch(&item_key(&id), || self.client.request_data(req)).await
    }

    /// Like [`get`](Self::get), but a 404 is `Ok(None)` and is not shown to the user.
    pub async fn find(&self, id: impl fmt::Display) -> Result<Option<T>, ApiError> {
        let req = ApiRequest::get(format!("{}/{id}", self.kind.path())).silent_not_found();
        match self.items.fetch(&item_key(&id), || self.client.request_data(req)).await {
            Ok(item) => Ok(Some(item)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub async fn create<B: Serialize>(&self, body: &B) -> Result<T, ApiError> {
        let req = ApiRequest::post(self.kind.path()).with_json(body)?;
        self.write(None, self.client.request_data(req)).await
    }

    pub async fn update<B: Serialize>(&self, id: impl fmt::Display, body: &B) -> Result<T, ApiError> {
        let req = ApiRequest::put(format!("{}/{id}", self.kind.path())).with_json(body)?;
        self.write(Some(item_key(&id)), self.client.request_data(req)).await
    }

    pub async fn delete(&self, id: impl fmt::Display) -> Result<(), ApiError> {
        let path = format!("{}/{id}", self.kind.path());
        self.write(Some(item_key(&id)), self.client.delete(&path)).await
    }

    pub fn invalidate_all(&self) {
        self.lists.invalidate_all();
        self.queries.invalidate_all();
        self.items.invalidate_all();
    }

    /// Runs a write, then invalidates the list, every query and `item`, whatever the outcome.
    async fn write<R>(
        &self,
        item: Option<String>,
        op: impl Future<Output = Result<R, ApiError>>,
    ) -> Result<R, ApiError> {
        let result = self.lists.mutate(&[Invalidate::Key(LIST_KEY.to_owned())], || op).await;
        self.queries.invalidate_prefix(QUERY_PREFIX);
        if let Some(key) = item {
            self.items.invalidate(&key);
        }
        result
    }

    pub fn list_state(&self) -> StoreState<Vec<T>> {
        self.lists.state()
    }

    pub fn subscribe_list(&self) -> watch::Receiver<StoreState<Vec<T>>> {
        self.lists.subscribe()
    }

    /// State of the most recent filtered query. The full list is in [`list_state`](Self::list_state).
    pub fn query_state(&self) -> StoreState<Vec<T>> {
        self.queries.state()
    }

    pub fn subscribe_queries(&self) -> watch::Receiver<StoreState<Vec<T>>> {
        self.queries.subscribe()
    }

    pub fn item_state(&self) -> StoreState<T> {
        self.items.state()
    }

    async fn load_list(&self, req: ApiRequest) -> Result<Vec<T>, ApiError> {
        let envelope = self.client.send(req).await?.into_envelope::<Vec<T>>()?;
        Ok(envelope.data.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_keys_ignore_parameter_order() {
        assert_eq!(
            query_key(&[("start_date", "2024-05-01"), ("end_date", "2024-05-31")]),
            query_key(&[("end_date", "2024-05-31"), ("start_date", "2024-05-01")])
        );
        assert_eq!(query_key(&[("pet_id", "4")]), "query:pet_id=4");
    }

    #[test]
    fn volatility_drives_ttl() {
        let ttls = CacheTtls::default();
        assert_eq!(ResourceKind::Clients.volatility().ttl(&ttls), Duration::from_secs(300));
        assert_eq!(ResourceKind::Veterinarians.volatility().ttl(&ttls), Duration::from_secs(600));
        assert_eq!(Volatility::Ranged.ttl(&ttls), Duration::from_secs(120));
        assert_eq!(ResourceKind::MedicalRecords.path(), "/medical-records");
        assert_eq!(ResourceKind::ALL.len(), 11);
    }
}
