//! SigV4 presigned WebSocket URLs for the IoT device gateway.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_credential_types::provider::{ProvideCredentials, SharedCredentialsProvider};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use iotdev_protocol::{IotError, IotResult};

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SERVICE: &str = "iotdevicegateway";
const PATH: &str = "/mqtt";
/// SHA-256 of the empty string.
const EMPTY_PAYLOAD_SHA256: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Clone)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"** redacted **")
            .field("session_token", &self.session_token.as_ref().map(|_| "** redacted **"))
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct Presigner {
    credentials: Credentials,
    region: Option<String>,
}

impl Presigner {
    pub fn new(credentials: Credentials, region: Option<String>) -> Self {
        Self {
            credentials,
            region,
        }
    }

    /// Sign for `region` instead of the one found in the environment.
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Load credentials and region from the AWS default provider chain.
    pub async fn from_env() -> IotResult<Self> {
        let (provider, region) = default_chain().await?;
        Ok(Self::new(load_credentials(&provider).await?, region))
    }

    /// Build `wss://{endpoint}/mqtt?...` signed at `at`, valid for `ttl`.
    ///
    /// The session token, when present, is appended after signing.
    pub fn presign_wss(
        &self,
        endpoint: &str,
        ttl: Duration,
        at: DateTime<Utc>,
    ) -> IotResult<String> {
        let region = self
            .region
            .as_deref()
            .filter(|r| !r.is_empty())
            .ok_or_else(|| IotError::Invalid("region is required to presign a URL".into()))?;

        let date = at.format("%Y%m%d").to_string();
        let timestamp = at.format("%Y%m%dT%H%M%SZ").to_string();
        let scope = format!("{date}/{region}/{SERVICE}/aws4_request");
        let credential = format!("{}/{scope}", self.credentials.access_key_id);

        let query = format!(
            "X-Amz-Algorithm={ALGORITHM}&X-Amz-Credential={}&X-Amz-Date={timestamp}&X-Amz-Expires={}&X-Amz-SignedHeaders=host",
            encode(&credential),
            ttl.as_secs(),
        );
        let canonical_request =
            format!("GET\n{PATH}\n{query}\nhost:{endpoint}\n\nhost\n{EMPTY_PAYLOAD_SHA256}");
        let string_to_sign = format!(
            "{ALGORITHM}\n{timestamp}\n{scope}\n{}",
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let secret = format!("AWS4{}", self.credentials.secret_access_key);
        let mut key = hmac_sha256(secret.as_bytes(), &date)?;
        for part in [region, SERVICE, "aws4_request"] {
            key = hmac_sha256(&key, part)?;
        }
        let signature = hex::encode(hmac_sha256(&key, &string_to_sign)?);

        let mut url = format!("wss://{endpoint}{PATH}?{query}&X-Amz-Signature={signature}");
        if let Some(token) = &self.credentials.session_token {
            url.push_str("&X-Amz-Security-Token=");
            url.push_str(&encode(token));
        }
        Ok(url)
    }

    /// [`Presigner::presign_wss`] with a 24 hour validity from now.
    pub fn presign_wss_now(&self, endpoint: &str) -> IotResult<String> {
        self.presign_wss(endpoint, DEFAULT_TTL, Utc::now())
    }
}

async fn default_chain() -> IotResult<(SharedCredentialsProvider, Option<String>)> {
    let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
    let provider = config
        .credentials_provider()
        .ok_or_else(|| IotError::Invalid("no AWS credentials provider configured".into()))?;
    Ok((provider, config.region().map(|r| r.to_string())))
}

async fn load_credentials(provider: &SharedCredentialsProvider) -> IotResult<Credentials> {
    let creds = provider
        .provide_credentials()
        .await
        .map_err(|e| IotError::Invalid(format!("loading AWS credentials: {e}")))?;
    Ok(Credentials {
        access_key_id: creds.access_key_id().to_string(),
        secret_access_key: creds.secret_access_key().to_string(),
        session_token: creds.session_token().map(str::to_string),
    })
}

/// Produces the broker URL for a websocket connection attempt.
///
/// Called once per dial, so a presigned URL never outlives its expiry or
/// the credentials it was signed with.
#[async_trait]
pub trait UrlSigner: Send + Sync {
    async fn sign(&self) -> IotResult<String>;
}

enum CredentialSource {
    Fixed(Credentials),
    Chain(SharedCredentialsProvider),
}

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Presigns `wss://{endpoint}/mqtt` at the moment of each dial.
pub struct EndpointSigner {
    endpoint: String,
    region: Option<String>,
    credentials: CredentialSource,
    clock: Clock,
}

impl EndpointSigner {
    /// Sign with fixed credentials.
    pub fn new(endpoint: impl Into<String>, credentials: Credentials, region: Option<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            region,
            credentials: CredentialSource::Fixed(credentials),
            clock: Arc::new(Utc::now),
        }
    }

    /// Sign with credentials re-read from the AWS default provider chain on
    /// every dial, so rotated session tokens are picked up. `region`
    /// overrides the one found in the environment.
    pub async fn from_env(endpoint: impl Into<String>, region: Option<String>) -> IotResult<Self> {
        let (provider, env_region) = default_chain().await?;
        // Fail at startup rather than on the first dial.
        load_credentials(&provider).await?;
        Ok(Self {
            endpoint: endpoint.into(),
            region: region.or(env_region),
            credentials: CredentialSource::Chain(provider),
            clock: Arc::new(Utc::now),
        })
    }

    #[cfg(test)]
    fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }
}

#[async_trait]
impl UrlSigner for EndpointSigner {
    async fn sign(&self) -> IotResult<String> {
        let credentials = match &self.credentials {
            CredentialSource::Fixed(credentials) => credentials.clone(),
            CredentialSource::Chain(provider) => load_credentials(provider).await?,
        };
        Presigner::new(credentials, self.region.clone()).presign_wss(
            &self.endpoint,
            DEFAULT_TTL,
            (self.clock)(),
        )
    }
}

fn hmac_sha256(key: &[u8], data: &str) -> IotResult<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| IotError::Invalid(format!("hmac key: {e}")))?;
    mac.update(data.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

fn encode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}
