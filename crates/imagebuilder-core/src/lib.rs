//! Resource model and gateway contracts shared by the image-builder engine.

pub mod csr;
pub mod gateway;
pub mod resource;

pub use csr::{
    CertificateSigningRequest, CsrCondition, CsrSpec, CsrStatus, ENROLLMENT_SIGNER,
    ENROLLMENT_USAGES,
};
pub use gateway::{CatalogError, CatalogGateway, GatewayError, WorkloadGateway};
pub use resource::{
    AgentConfig, BootcExport, BootcImageRef, BuildFile, BuildScript, BuildUser, ContainerRegistry,
    Customizations, EnrollmentService, ExportFormat, ImageBuild, ImageBuildSpec, ImageBuildStatus,
    PatchOp, Phase, RegistryCredentials, ResourceMeta, SystemdUnit, TpmConfig, APP_LABEL_VALUE,
    CANCEL_ANNOTATION, IMAGEBUILD_LABEL, RETRY_ANNOTATION,
};
