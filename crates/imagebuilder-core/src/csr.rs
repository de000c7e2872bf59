//! Certificate signing request resource exchanged with the catalog's CSR API.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::resource::ResourceMeta;

/// Signer that auto-approves enrollment certificates.
pub const ENROLLMENT_SIGNER: &str = "flightctl.io/enrollment";

/// Usages required on an enrollment CSR.
pub const ENROLLMENT_USAGES: [&str; 2] = ["clientAuth", "CA:false"];

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CsrSpec {
    pub signer_name: String,
    /// PEM-encoded certificate request.
    pub request: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiration_seconds: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub usages: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CsrCondition {
    #[serde(rename = "type")]
    pub kind: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CsrStatus {
    /// PEM-encoded signed certificate, set once issued.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<CsrCondition>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CertificateSigningRequest {
    #[serde(default)]
    pub metadata: ResourceMeta,
    pub spec: CsrSpec,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<CsrStatus>,
}

impl CertificateSigningRequest {
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    /// Issued certificate, if the signer has produced one.
    pub fn issued_certificate(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.certificate.as_deref())
            .filter(|c| !c.is_empty())
    }

    /// Message of a `Denied=True` or `Failed=True` condition, if present.
    pub fn rejection(&self) -> Option<String> {
        let status = self.status.as_ref()?;
        status
            .conditions
            .iter()
            .find(|c| (c.kind == "Denied" || c.kind == "Failed") && c.status == "True")
            .map(|c| {
                c.message
                    .clone()
                    .unwrap_or_else(|| format!("{} by signer", c.kind.to_lowercase()))
            })
    }
}
