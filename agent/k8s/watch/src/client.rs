use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use kube::api::{Api, ListParams, WatchParams};
use kube::core::WatchEvent;
use serde::de::DeserializeOwned;

/// One page of a paginated list.
pub struct ListPage<K> {
    pub items: Vec<K>,
    pub continue_token: Option<String>,
    pub resource_version: Option<String>,
}

/// The listing and watching surface a controller needs from the API server.
#[async_trait]
pub trait ResourceClient<K>: Send + Sync + 'static {
    async fn list_page(&self, limit: u32, continue_token: Option<&str>)
        -> kube::Result<ListPage<K>>;

    async fn watch(
        &self,
        resource_version: &str,
    ) -> kube::Result<BoxStream<'static, kube::Result<WatchEvent<K>>>>;
}

/// [`ResourceClient`] backed by the cluster API, with an optional field
/// selector applied to both lists and watches.
pub struct ApiClient<K> {
    api: Api<K>,
    field_selector: Option<String>,
}

// === impl ApiClient ===

impl<K> ApiClient<K> {
    pub fn new(api: Api<K>, field_selector: Option<String>) -> Self {
        Self {
            api,
            field_selector,
        }
    }
}

#[async_trait]
impl<K> ResourceClient<K> for ApiClient<K>
where
    K: kube::Resource + Clone + DeserializeOwned + std::fmt::Debug + Send + Sync + 'static,
{
    async fn list_page(
        &self,
        limit: u32,
        continue_token: Option<&str>,
    ) -> kube::Result<ListPage<K>> {
        let mut params = ListParams::default().limit(limit);
        if let Some(fields) = &self.field_selector {
            params = params.fields(fields);
        }
        if let Some(token) = continue_token {
            params = params.continue_token(token);
        }

        let list = self.api.list(&params).await?;
        Ok(ListPage {
            continue_token: list.metadata.continue_.clone().filter(|c| !c.is_empty()),
            resource_version: list.metadata.resource_version.clone(),
            items: list.items,
        })
    }

    async fn watch(
        &self,
        resource_version: &str,
    ) -> kube::Result<BoxStream<'static, kube::Result<WatchEvent<K>>>> {
        let mut params = WatchParams::default();
        if let Some(fields) = &self.field_selector {
            params = params.fields(fields);
        }
        let events = self.api.watch(&params, resource_version).await?;
        Ok(events.boxed())
    }
}
