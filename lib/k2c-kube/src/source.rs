//! `EndpointSource` backed by the Kubernetes API server

use async_trait::async_trait;
use k2c_core::source::EndpointSource;
use k2c_core::Result;
use k8s_openapi::api::core::v1::{Endpoints, Service};
use kube::api::ListParams;
use kube::{Api, Client};
use tracing::debug;

#[derive(Clone)]
pub struct KubeSource {
    client: Client,
}

impl KubeSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl EndpointSource for KubeSource {
    async fn list_endpoints(&self) -> Result<Vec<Endpoints>> {
        let api: Api<Endpoints> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default()).await?;

        debug!("Listed {} endpoints", list.items.len());
        Ok(list.items)
    }

    async fn service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn endpoints(&self, namespace: &str, name: &str) -> Result<Option<Endpoints>> {
        let api: Api<Endpoints> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }
}
