//! Fleet provisioning by claim.
//!
//! The three provisioning exchanges echo no client token, so each one owns
//! a fixed response slot: only one call of each kind may be in flight.

use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::sync::{Arc, Mutex};

use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use serde::de::DeserializeOwned;

use iotdev_mqtt::correlator;
use iotdev_mqtt::{Channel, Message, Router, TokenBroker};
use iotdev_protocol::provisioning::{
    CreateCertificateFromCsrRequest, CreateCertificateFromCsrResponse,
    CreateKeysAndCertificateResponse, RegisterThingRequest, RegisterThingResponse,
};
use iotdev_protocol::{ErrorResponse, IotError, IotResult, ResultExt, topics};

const SLOT_CREATE: &str = "certificates/create";
const SLOT_CREATE_FROM_CSR: &str = "certificates/create-from-csr";
const SLOT_PROVISION: &str = "provisioning-templates/provision";

/// Certificate issued by the service.
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub certificate_id: String,
    pub ownership_token: String,
}

/// Device identity assigned by a provisioning template.
#[derive(Debug, Clone)]
pub struct Registration {
    pub thing_name: String,
    pub device_configuration: BTreeMap<String, String>,
}

#[derive(Default)]
struct Material {
    certificate_pem: Vec<u8>,
    private_key_pem: Vec<u8>,
}

struct Inner {
    create: Arc<TokenBroker<IotResult<CreateKeysAndCertificateResponse>>>,
    create_from_csr: Arc<TokenBroker<IotResult<CreateCertificateFromCsrResponse>>>,
    provision: Arc<TokenBroker<IotResult<RegisterThingResponse>>>,
}

impl Inner {
    fn handle(&self, msg: &Message) {
        let topic = msg.topic.as_str();
        let Some((request, outcome)) = topic.rsplit_once('/') else {
            return;
        };
        if request == topics::certificates_create() {
            deliver(&self.create, SLOT_CREATE, outcome, &msg.payload);
        } else if request == topics::certificates_create_from_csr() {
            deliver(&self.create_from_csr, SLOT_CREATE_FROM_CSR, outcome, &msg.payload);
        } else if request.starts_with("$aws/provisioning-templates/") {
            deliver(&self.provision, SLOT_PROVISION, outcome, &msg.payload);
        } else {
            tracing::debug!(topic, "ignoring provisioning message");
        }
    }
}

fn deliver<T>(broker: &TokenBroker<IotResult<T>>, slot: &str, outcome: &str, payload: &[u8])
where
    T: DeserializeOwned + Send + 'static,
{
    let reply = match outcome {
        topics::ACCEPTED => serde_json::from_slice::<T>(payload).map_err(IotError::from),
        topics::REJECTED => serde_json::from_slice::<ErrorResponse>(payload)
            .map_err(IotError::from)
            .and_then(|rejection| Err(IotError::Rejected(rejection))),
        _ => return,
    };
    if broker.deliver(slot, reply).is_err() {
        tracing::debug!(slot, "provisioning response with no caller dropped");
    }
}

/// Client for the fleet provisioning MQTT API.
pub struct ProvisioningClient {
    channel: Arc<dyn Channel>,
    router: Arc<Router>,
    inner: Arc<Inner>,
    templates: Mutex<HashSet<String>>,
    material: Mutex<Material>,
}

impl ProvisioningClient {
    /// Subscribe to the certificate responses.
    ///
    /// Template responses are subscribed on the first
    /// [`ProvisioningClient::register_thing`] for each template.
    pub async fn start(channel: Arc<dyn Channel>, router: Arc<Router>) -> IotResult<Self> {
        let client = Self {
            channel,
            router,
            inner: Arc::new(Inner {
                create: TokenBroker::new(),
                create_from_csr: TokenBroker::new(),
                provision: TokenBroker::new(),
            }),
            templates: Mutex::new(HashSet::new()),
            material: Mutex::new(Material::default()),
        };
        client
            .listen(&[
                topics::certificates_create(),
                topics::certificates_create_from_csr(),
            ])
            .await
            .wrap_err("subscribing to certificate topics")?;
        Ok(client)
    }

    async fn listen(&self, requests: &[String]) -> IotResult<()> {
        let filters: Vec<String> = requests.iter().map(|r| format!("{r}/+")).collect();
        let inner = self.inner.clone();
        self.channel
            .subscribe_routed(&self.router, &filters, Arc::new(move |m| inner.handle(m)))
            .await
    }

    /// Have the service generate a key pair and certificate.
    pub async fn create_keys_and_certificate(&self) -> IotResult<IssuedCertificate> {
        let response = correlator::request(
            &self.inner.create,
            SLOT_CREATE,
            self.channel.as_ref(),
            &topics::certificates_create(),
            b"{}",
        )
        .await
        .and_then(|reply| reply)
        .wrap_err("creating keys and certificate")?;

        let certificate_pem = response.certificate_pem.into_bytes();
        let private_key_pem = response.private_key.into_bytes();
        validate_certificate(&certificate_pem).wrap_err("decoding issued certificate")?;
        validate_private_key(&private_key_pem).wrap_err("decoding issued private key")?;

        *self.lock_material() = Material {
            certificate_pem,
            private_key_pem,
        };
        tracing::info!(certificate_id = %response.certificate_id, "certificate and keys created");
        Ok(IssuedCertificate {
            certificate_id: response.certificate_id,
            ownership_token: response.certificate_ownership_token,
        })
    }

    /// Have the service sign `csr_pem`. The private key stays with the
    /// caller, so only the certificate is cached.
    pub async fn create_certificate_from_csr(&self, csr_pem: &str) -> IotResult<IssuedCertificate> {
        let body = serde_json::to_vec(&CreateCertificateFromCsrRequest {
            certificate_signing_request: csr_pem.to_string(),
        })?;
        let response = correlator::request(
            &self.inner.create_from_csr,
            SLOT_CREATE_FROM_CSR,
            self.channel.as_ref(),
            &topics::certificates_create_from_csr(),
            &body,
        )
        .await
        .and_then(|reply| reply)
        .wrap_err("creating certificate from CSR")?;

        let certificate_pem = response.certificate_pem.into_bytes();
        validate_certificate(&certificate_pem).wrap_err("decoding issued certificate")?;

        *self.lock_material() = Material {
            certificate_pem,
            private_key_pem: Vec::new(),
        };
        tracing::info!(certificate_id = %response.certificate_id, "certificate created from CSR");
        Ok(IssuedCertificate {
            certificate_id: response.certificate_id,
            ownership_token: response.certificate_ownership_token,
        })
    }

    /// Register the thing with `template_name`, binding the certificate
    /// identified by `ownership_token`.
    pub async fn register_thing(
        &self,
        template_name: &str,
        ownership_token: &str,
        parameters: BTreeMap<String, String>,
    ) -> IotResult<Registration> {
        let request_topic = topics::provision(template_name);
        let first_use = self
            .templates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(template_name.to_string());
        if first_use {
            if let Err(e) = self.listen(std::slice::from_ref(&request_topic)).await {
                self.templates
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(template_name);
                return Err(IotError::wrap("subscribing to provisioning template", e));
            }
        }

        let body = serde_json::to_vec(&RegisterThingRequest {
            certificate_ownership_token: ownership_token.to_string(),
            parameters,
        })?;
        let response = correlator::request(
            &self.inner.provision,
            SLOT_PROVISION,
            self.channel.as_ref(),
            &request_topic,
            &body,
        )
        .await
        .and_then(|reply| reply)
        .wrap_err("registering thing")?;

        tracing::info!(thing = %response.thing_name, template = template_name, "thing registered");
        Ok(Registration {
            thing_name: response.thing_name,
            device_configuration: response.device_configuration,
        })
    }

    /// Write the issued certificate PEM.
    pub fn write_certificate<W: Write>(&self, writer: &mut W) -> IotResult<()> {
        let material = self.lock_material();
        if material.certificate_pem.is_empty() {
            return Err(IotError::NotCreated("certificate"));
        }
        writer.write_all(&material.certificate_pem)?;
        Ok(())
    }

    /// Write the issued private key PEM (key-and-certificate flow only).
    pub fn write_private_key<W: Write>(&self, writer: &mut W) -> IotResult<()> {
        let material = self.lock_material();
        if material.private_key_pem.is_empty() {
            return Err(IotError::NotCreated("private key"));
        }
        writer.write_all(&material.private_key_pem)?;
        Ok(())
    }

    fn lock_material(&self) -> std::sync::MutexGuard<'_, Material> {
        self.material.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// The PEM must hold exactly one `CERTIFICATE` block.
fn validate_certificate(pem: &[u8]) -> IotResult<()> {
    let certs = CertificateDer::pem_slice_iter(pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| IotError::Decode(format!("failed to parse certificate: {e}")))?;
    match certs.len() {
        1 => Ok(()),
        n => Err(IotError::Decode(format!(
            "expected one CERTIFICATE block, found {n}"
        ))),
    }
}

/// The PEM must hold a `PRIVATE KEY` or `RSA PRIVATE KEY` block.
fn validate_private_key(pem: &[u8]) -> IotResult<()> {
    let key = PrivateKeyDer::from_pem_slice(pem)
        .map_err(|e| IotError::Decode(format!("failed to parse private key: {e}")))?;
    match key {
        PrivateKeyDer::Pkcs8(_) | PrivateKeyDer::Pkcs1(_) => Ok(()),
        _ => Err(IotError::Decode("unsupported private key type".into())),
    }
}
