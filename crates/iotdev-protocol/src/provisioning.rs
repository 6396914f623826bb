use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// `certificates/create/json/accepted`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateKeysAndCertificateResponse {
    pub certificate_id: String,
    pub certificate_pem: String,
    pub private_key: String,
    pub certificate_ownership_token: String,
}

/// Body published to `certificates/create-from-csr/json`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCertificateFromCsrRequest {
    pub certificate_signing_request: String,
}

/// `certificates/create-from-csr/json/accepted`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCertificateFromCsrResponse {
    pub certificate_id: String,
    pub certificate_pem: String,
    pub certificate_ownership_token: String,
}

/// Body published to `provisioning-templates/{template}/provision/json`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterThingRequest {
    pub certificate_ownership_token: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
}

/// `provisioning-templates/{template}/provision/json/accepted`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterThingResponse {
    pub thing_name: String,
    #[serde(default)]
    pub device_configuration: BTreeMap<String, String>,
}
