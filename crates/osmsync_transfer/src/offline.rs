//! Online/offline gate for named remote resources.

use crate::error::{TransferError, TransferResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use tracing::info;
use url::Url;

/// Named remote resource that can be taken offline.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum OnlineResource {
    /// The primary data API.
    OsmApi,
    /// The companion website.
    Website,
    /// Background cache updates.
    CacheUpdates,
    /// Certificate fetches.
    Certificates,
    /// Every resource at once.
    All,
}

impl OnlineResource {
    /// Every resource, including [`OnlineResource::All`].
    pub const VALUES: [OnlineResource; 5] = [
        OnlineResource::OsmApi,
        OnlineResource::Website,
        OnlineResource::CacheUpdates,
        OnlineResource::Certificates,
        OnlineResource::All,
    ];

    /// Configuration name.
    pub fn name(&self) -> &'static str {
        match self {
            OnlineResource::OsmApi => "osm_api",
            OnlineResource::Website => "website",
            OnlineResource::CacheUpdates => "cache_updates",
            OnlineResource::Certificates => "certificates",
            OnlineResource::All => "all",
        }
    }
}

impl fmt::Display for OnlineResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for OnlineResource {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        Self::VALUES
            .into_iter()
            .find(|r| r.name().eq_ignore_ascii_case(value))
            .ok_or_else(|| format!("unknown online resource '{}'", value))
    }
}

fn same_origin(a: &Url, b: &Url) -> bool {
    a.scheme() == b.scheme()
        && a.host_str() == b.host_str()
        && a.port_or_known_default() == b.port_or_known_default()
}

/// Registry of offline resources, consulted before every network call.
///
/// Taking [`OnlineResource::All`] offline forces every resource offline
/// without touching the individual flags, so bringing `All` back online
/// restores each resource's own state. No network access happens here.
#[derive(Debug, Default)]
pub struct OfflineGate {
    offline: RwLock<BTreeSet<OnlineResource>>,
    base_urls: RwLock<HashMap<OnlineResource, Url>>,
}

impl OfflineGate {
    /// Creates a gate with every resource online.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the base URL a resource is reached at.
    pub fn set_base_url(&self, resource: OnlineResource, base_url: &str) -> TransferResult<()> {
        let url = Url::parse(base_url).map_err(|e| {
            TransferError::Config(format!("invalid base url '{}': {}", base_url, e))
        })?;
        self.base_urls.write().insert(resource, url);
        Ok(())
    }

    /// Returns true if the resource is offline, individually or through `All`.
    pub fn is_offline(&self, resource: OnlineResource) -> bool {
        let offline = self.offline.read();
        offline.contains(&OnlineResource::All) || offline.contains(&resource)
    }

    /// Returns true if a URL belongs to an offline resource.
    pub fn is_url_offline(&self, url: &str) -> bool {
        self.offline_resource_for(url).is_some()
    }

    fn offline_resource_for(&self, url: &str) -> Option<OnlineResource> {
        let offline = self.offline.read();
        if offline.contains(&OnlineResource::All) {
            return Some(OnlineResource::All);
        }
        let target = Url::parse(url).ok()?;
        let base_urls = self.base_urls.read();
        offline
            .iter()
            .copied()
            .find(|resource| match base_urls.get(resource) {
                Some(base) => same_origin(base, &target),
                None => false,
            })
    }

    /// Takes a resource offline. Returns true if the state changed.
    pub fn set_offline(&self, resource: OnlineResource) -> bool {
        let changed = self.offline.write().insert(resource);
        if changed {
            info!(resource = %resource, "resource set offline");
        }
        changed
    }

    /// Brings a resource online. Returns true if the state changed.
    pub fn set_online(&self, resource: OnlineResource) -> bool {
        let changed = self.offline.write().remove(&resource);
        if changed {
            info!(resource = %resource, "resource set online");
        }
        changed
    }

    /// Resources explicitly set offline.
    pub fn list_offline(&self) -> BTreeSet<OnlineResource> {
        self.offline.read().clone()
    }

    /// Fails with [`TransferError::Offline`] if the resource is offline.
    pub fn ensure_online(&self, resource: OnlineResource) -> TransferResult<()> {
        if self.is_offline(resource) {
            return Err(TransferError::Offline { resource });
        }
        Ok(())
    }

    /// Fails with [`TransferError::Offline`] if the URL belongs to an offline resource.
    pub fn ensure_url_online(&self, url: &str) -> TransferResult<()> {
        match self.offline_resource_for(url) {
            Some(resource) => Err(TransferError::Offline { resource }),
            None => Ok(()),
        }
    }
}
