//! Enrollment certificate issuance through the catalog's CSR API.
//!
//! A fresh key pair is generated per request; the CSR's common name equals
//! its metadata name so the result can be correlated when listing back.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use imagebuilder_core::{
    CatalogGateway, CertificateSigningRequest, CsrSpec, ResourceMeta, ENROLLMENT_SIGNER,
    ENROLLMENT_USAGES,
};

use crate::error::EngineError;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_ISSUE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Synchronously obtains a short-lived enrollment certificate and private key.
pub struct CertificateBroker {
    catalog: Arc<dyn CatalogGateway>,
    poll_interval: Duration,
    issue_timeout: Duration,
}

impl CertificateBroker {
    pub fn new(catalog: Arc<dyn CatalogGateway>) -> Self {
        Self {
            catalog,
            poll_interval: DEFAULT_POLL_INTERVAL,
            issue_timeout: DEFAULT_ISSUE_TIMEOUT,
        }
    }

    #[cfg(test)]
    pub fn with_timing(mut self, poll_interval: Duration, issue_timeout: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.issue_timeout = issue_timeout;
        self
    }

    /// Request an enrollment certificate for a build. Returns
    /// `(certificate_pem, private_key_pem)`.
    pub async fn request_enrollment_certificate(
        &self,
        tenant: Uuid,
        build_name: &str,
        expiration_seconds: i64,
    ) -> Result<(String, String), EngineError> {
        let suffix = Uuid::new_v4().simple().to_string();
        let csr_name = format!("imagebuild-{build_name}-{}", &suffix[..8]);

        let (request_pem, key_pem) = generate_csr(&csr_name)?;

        let csr = CertificateSigningRequest {
            metadata: ResourceMeta {
                name: Some(csr_name.clone()),
                ..Default::default()
            },
            spec: CsrSpec {
                signer_name: ENROLLMENT_SIGNER.to_string(),
                request: request_pem,
                expiration_seconds: Some(expiration_seconds),
                usages: ENROLLMENT_USAGES.iter().map(|u| u.to_string()).collect(),
            },
            status: None,
        };

        let created = self
            .catalog
            .create_csr(tenant, csr)
            .await
            .map_err(|e| EngineError::Certificate(format!("failed to submit CSR: {e}")))?;
        tracing::info!(csr = %created.name(), build = %build_name, "submitted enrollment CSR");

        let certificate = self.wait_for_certificate(tenant, created.name()).await?;
        tracing::info!(csr = %created.name(), build = %build_name, "enrollment certificate issued");

        Ok((certificate, key_pem))
    }

    /// Poll the CSR list until a certificate shows up, the signer rejects the
    /// request, or the issue ceiling passes.
    async fn wait_for_certificate(
        &self,
        tenant: Uuid,
        csr_name: &str,
    ) -> Result<String, EngineError> {
        let deadline = Instant::now() + self.issue_timeout;

        loop {
            tokio::time::sleep(self.poll_interval).await;
            if Instant::now() >= deadline {
                return Err(EngineError::Certificate(format!(
                    "timed out waiting for certificate for CSR {csr_name}"
                )));
            }

            let csrs = match self.catalog.list_csrs(tenant).await {
                Ok(csrs) => csrs,
                Err(err) => {
                    tracing::warn!(csr = %csr_name, error = %err, "failed to list CSRs, retrying");
                    continue;
                }
            };

            let Some(csr) = csrs.iter().find(|c| c.name() == csr_name) else {
                tracing::warn!(csr = %csr_name, "CSR not found yet");
                continue;
            };

            if let Some(certificate) = csr.issued_certificate() {
                return Ok(certificate.to_string());
            }
            if let Some(reason) = csr.rejection() {
                return Err(EngineError::Certificate(format!(
                    "CSR {csr_name} rejected: {reason}"
                )));
            }
        }
    }
}

/// Generate a key pair and a PEM-encoded certificate request whose common
/// name is `common_name`. Returns `(csr_pem, private_key_pem)`.
fn generate_csr(common_name: &str) -> Result<(String, String), EngineError> {
    let key_pair = rcgen::KeyPair::generate()
        .map_err(|e| EngineError::Certificate(format!("failed to generate key pair: {e}")))?;

    let mut params = rcgen::CertificateParams::new(Vec::<String>::new())
        .map_err(|e| EngineError::Certificate(format!("invalid certificate params: {e}")))?;
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, common_name);

    let request = params
        .serialize_request(&key_pair)
        .map_err(|e| EngineError::Certificate(format!("failed to build CSR: {e}")))?;
    let request_pem = request
        .pem()
        .map_err(|e| EngineError::Certificate(format!("failed to encode CSR: {e}")))?;

    Ok((request_pem, key_pair.serialize_pem()))
}
