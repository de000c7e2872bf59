//! `CatalogGateway` over the catalog's HTTP API.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use uuid::Uuid;

use imagebuilder_core::{
    CatalogError, CatalogGateway, CertificateSigningRequest, ImageBuild, PatchOp,
};

const JSON_PATCH_CONTENT_TYPE: &str = "application/json-patch+json";

/// Catalog client for service-to-service calls.
pub struct HttpCatalogClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct ListResponse<T> {
    items: Vec<T>,
}

impl HttpCatalogClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn tenant_url(&self, tenant: Uuid, suffix: &str) -> String {
        format!("{}/api/v1/tenants/{tenant}{suffix}", self.base_url)
    }

    async fn check(response: reqwest::Response, context: &str) -> Result<reqwest::Response, CatalogError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::NOT_FOUND => CatalogError::NotFound(context.to_string()),
            StatusCode::CONFLICT => CatalogError::Conflict(context.to_string()),
            StatusCode::BAD_REQUEST => CatalogError::BadRequest(format!("{context}: {body}")),
            _ => CatalogError::Api(format!("{context}: status {status}: {body}")),
        })
    }

    fn transport(context: &str, err: reqwest::Error) -> CatalogError {
        CatalogError::Api(format!("{context}: {err}"))
    }
}

#[async_trait]
impl CatalogGateway for HttpCatalogClient {
    async fn list_tenants(&self) -> Result<Vec<Uuid>, CatalogError> {
        let url = format!("{}/api/v1/tenants", self.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Self::transport("list tenants", e))?;
        let response = Self::check(response, "list tenants").await?;
        let list: ListResponse<Uuid> = response
            .json()
            .await
            .map_err(|e| Self::transport("decode tenants", e))?;
        Ok(list.items)
    }

    async fn list_image_builds(&self, tenant: Uuid) -> Result<Vec<ImageBuild>, CatalogError> {
        let url = self.tenant_url(tenant, "/imagebuilds");
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Self::transport("list imagebuilds", e))?;
        let response = Self::check(response, "list imagebuilds").await?;
        let list: ListResponse<ImageBuild> = response
            .json()
            .await
            .map_err(|e| Self::transport("decode imagebuilds", e))?;
        Ok(list.items)
    }

    async fn get_image_build(
        &self,
        tenant: Uuid,
        name: &str,
    ) -> Result<Option<ImageBuild>, CatalogError> {
        let url = self.tenant_url(tenant, &format!("/imagebuilds/{name}"));
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Self::transport("get imagebuild", e))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::check(response, &format!("get imagebuild {name}")).await?;
        let build = response
            .json()
            .await
            .map_err(|e| Self::transport("decode imagebuild", e))?;
        Ok(Some(build))
    }

    async fn delete_image_build(&self, tenant: Uuid, name: &str) -> Result<(), CatalogError> {
        let url = self.tenant_url(tenant, &format!("/imagebuilds/{name}"));
        let response = self
            .http
            .delete(&url)
            .send()
            .await
            .map_err(|e| Self::transport("delete imagebuild", e))?;
        Self::check(response, &format!("delete imagebuild {name}")).await?;
        Ok(())
    }

    async fn replace_status(&self, tenant: Uuid, build: &ImageBuild) -> Result<(), CatalogError> {
        let name = build.name();
        let url = self.tenant_url(tenant, &format!("/imagebuilds/{name}/status"));
        let response = self
            .http
            .put(&url)
            .json(build)
            .send()
            .await
            .map_err(|e| Self::transport("replace status", e))?;
        Self::check(response, &format!("replace status of {name}")).await?;
        Ok(())
    }

    async fn patch_image_build(
        &self,
        tenant: Uuid,
        name: &str,
        patch: &[PatchOp],
    ) -> Result<(), CatalogError> {
        let url = self.tenant_url(tenant, &format!("/imagebuilds/{name}"));
        let response = self
            .http
            .patch(&url)
            .header(reqwest::header::CONTENT_TYPE, JSON_PATCH_CONTENT_TYPE)
            .json(&patch)
            .send()
            .await
            .map_err(|e| Self::transport("patch imagebuild", e))?;
        Self::check(response, &format!("patch imagebuild {name}")).await?;
        Ok(())
    }

    async fn create_csr(
        &self,
        tenant: Uuid,
        csr: CertificateSigningRequest,
    ) -> Result<CertificateSigningRequest, CatalogError> {
        let url = self.tenant_url(tenant, "/certificatesigningrequests");
        let response = self
            .http
            .post(&url)
            .json(&csr)
            .send()
            .await
            .map_err(|e| Self::transport("create csr", e))?;
        let response = Self::check(response, "create csr").await?;
        response
            .json()
            .await
            .map_err(|e| Self::transport("decode csr", e))
    }

    async fn list_csrs(
        &self,
        tenant: Uuid,
    ) -> Result<Vec<CertificateSigningRequest>, CatalogError> {
        let url = self.tenant_url(tenant, "/certificatesigningrequests");
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Self::transport("list csrs", e))?;
        let response = Self::check(response, "list csrs").await?;
        let list: ListResponse<CertificateSigningRequest> = response
            .json()
            .await
            .map_err(|e| Self::transport("decode csrs", e))?;
        Ok(list.items)
    }
}
