use crate::errors::GatewayError;
use crate::model::{
    LifecycleOp, NodeId, PowerState, RemoteResource, ResourceKind, ResourcePage, ResourceSummary,
    VmCreateSpec,
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;

const API_VERSION: &str = "2024-03-01";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// The remote resource API the tree and the lifecycle commands call into.
/// The core treats it as an opaque asynchronous capability; retry and
/// timeout policy live behind this seam.
#[async_trait]
pub trait ResourceGateway: Send + Sync {
    /// Lists one page of children under `parent`. `cursor` of `None`
    /// requests the first page; the returned cursor is `None` once the
    /// listing is exhausted.
    async fn list_children(
        &self,
        parent: &NodeId,
        parent_kind: ResourceKind,
        cursor: Option<&str>,
        page_size: usize,
    ) -> Result<ResourcePage, GatewayError>;

    async fn invoke(&self, resource: &NodeId, op: LifecycleOp) -> Result<(), GatewayError>;

    async fn resource_detail(&self, resource: &NodeId) -> Result<Value, GatewayError>;

    async fn create_virtual_machine(
        &self,
        group: &NodeId,
        spec: &VmCreateSpec,
    ) -> Result<RemoteResource, GatewayError>;

    async fn add_ssh_key(
        &self,
        vm: &NodeId,
        username: &str,
        public_key: &str,
    ) -> Result<(), GatewayError>;
}

#[derive(Debug, Clone, Deserialize)]
struct ListEnvelope {
    #[serde(default)]
    value: Vec<ResourceDto>,
    #[serde(default, rename = "continuationToken")]
    continuation_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ResourceDto {
    id: String,
    name: String,
    #[serde(default, rename = "displayName")]
    display_name: Option<String>,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    properties: Option<PropertiesDto>,
}

#[derive(Debug, Clone, Deserialize)]
struct PropertiesDto {
    #[serde(default, rename = "powerState")]
    power_state: Option<String>,
    #[serde(default, rename = "publicIpAddress")]
    public_ip: Option<String>,
    #[serde(default, rename = "privateIpAddress")]
    private_ip: Option<String>,
    #[serde(default, rename = "osType")]
    os: Option<String>,
    #[serde(default, rename = "vmSize")]
    vm_size: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBodyDto,
}

#[derive(Debug, Deserialize)]
struct ErrorBodyDto {
    code: String,
    message: String,
}

impl ResourceDto {
    fn into_remote(self, kind: ResourceKind) -> RemoteResource {
        let properties = self.properties.unwrap_or(PropertiesDto {
            power_state: None,
            public_ip: None,
            private_ip: None,
            os: None,
            vm_size: None,
        });
        RemoteResource {
            id: NodeId::new(self.id),
            label: self.display_name.unwrap_or(self.name),
            kind,
            summary: ResourceSummary {
                location: self.location,
                power_state: properties.power_state.as_deref().map(PowerState::from_code),
                public_ip: properties.public_ip,
                private_ip: properties.private_ip,
                os: properties.os,
                vm_size: properties.vm_size,
            },
        }
    }
}

/// Child kind produced when listing under a node of `parent_kind`.
pub fn child_kind(parent_kind: ResourceKind) -> Option<ResourceKind> {
    match parent_kind {
        ResourceKind::Account => Some(ResourceKind::Subscription),
        ResourceKind::Subscription => Some(ResourceKind::ResourceGroup),
        ResourceKind::ResourceGroup => Some(ResourceKind::VirtualMachine),
        ResourceKind::VirtualMachine | ResourceKind::LoadMore => None,
    }
}

/// REST gateway against an ARM-style management endpoint.
pub struct HttpGateway {
    http: reqwest::Client,
    base: String,
    token: Option<String>,
}

impl HttpGateway {
    pub fn new(base: impl Into<String>, token: Option<String>) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|error| GatewayError::Transport {
                message: format!("failed to build http client: {error}"),
            })?;
        Ok(Self {
            http,
            base: base.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    fn list_url(&self, parent: &NodeId, parent_kind: ResourceKind) -> Result<String, GatewayError> {
        let url = match parent_kind {
            ResourceKind::Account => format!("{}/subscriptions", self.base),
            ResourceKind::Subscription => format!("{}{}/resourcegroups", self.base, parent),
            ResourceKind::ResourceGroup => format!("{}{}/virtualMachines", self.base, parent),
            ResourceKind::VirtualMachine | ResourceKind::LoadMore => {
                return Err(GatewayError::Malformed {
                    message: format!("{} nodes have no listable children", parent_kind.title()),
                });
            }
        };
        Ok(url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn read_body(response: reqwest::Response) -> Result<(u16, Vec<u8>), GatewayError> {
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|error| GatewayError::Transport {
                message: format!("failed to read response body: {error}"),
            })?;
        Ok((status, body.to_vec()))
    }

    fn error_from_body(status: u16, body: &[u8]) -> GatewayError {
        match serde_json::from_slice::<ErrorEnvelope>(body) {
            Ok(envelope) => GatewayError::from_remote(&envelope.error.code, envelope.error.message),
            Err(_) => GatewayError::UnrecognizedRemote {
                code: format!("HTTP{status}"),
                message: String::from_utf8_lossy(&body[..body.len().min(256)]).to_string(),
            },
        }
    }

    fn parse_page(kind: ResourceKind, body: &[u8]) -> Result<ResourcePage, GatewayError> {
        let envelope: ListEnvelope =
            serde_json::from_slice(body).map_err(|error| GatewayError::Malformed {
                message: format!("failed to parse list response: {error}"),
            })?;
        Ok(ResourcePage {
            items: envelope
                .value
                .into_iter()
                .map(|dto| dto.into_remote(kind))
                .collect(),
            next_cursor: envelope.continuation_token,
        })
    }

    async fn send_expecting_success(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<Vec<u8>, GatewayError> {
        let response = self
            .authorize(request.query(&[("api-version", API_VERSION)]))
            .send()
            .await
            .map_err(|error| GatewayError::Transport {
                message: error.to_string(),
            })?;
        let (status, body) = Self::read_body(response).await?;
        if (200..300).contains(&status) {
            Ok(body)
        } else {
            Err(Self::error_from_body(status, &body))
        }
    }
}

#[async_trait]
impl ResourceGateway for HttpGateway {
    async fn list_children(
        &self,
        parent: &NodeId,
        parent_kind: ResourceKind,
        cursor: Option<&str>,
        page_size: usize,
    ) -> Result<ResourcePage, GatewayError> {
        let kind = child_kind(parent_kind).ok_or_else(|| GatewayError::Malformed {
            message: format!("{} nodes have no listable children", parent_kind.title()),
        })?;
        let url = self.list_url(parent, parent_kind)?;
        let mut request = self.http.get(&url).query(&[("top", &page_size.to_string())]);
        if let Some(cursor) = cursor {
            request = request.query(&[("skipToken", cursor)]);
        }
        let body = self.send_expecting_success(request).await?;
        Self::parse_page(kind, &body)
    }

    async fn invoke(&self, resource: &NodeId, op: LifecycleOp) -> Result<(), GatewayError> {
        let request = match op {
            LifecycleOp::Start => self.http.post(format!("{}{}/start", self.base, resource)),
            LifecycleOp::Restart => self.http.post(format!("{}{}/restart", self.base, resource)),
            LifecycleOp::Stop => self
                .http
                .post(format!("{}{}/deallocate", self.base, resource)),
            LifecycleOp::Delete => self.http.delete(format!("{}{}", self.base, resource)),
        };
        self.send_expecting_success(request).await?;
        Ok(())
    }

    async fn resource_detail(&self, resource: &NodeId) -> Result<Value, GatewayError> {
        let body = self
            .send_expecting_success(self.http.get(format!("{}{}", self.base, resource)))
            .await?;
        serde_json::from_slice(&body).map_err(|error| GatewayError::Malformed {
            message: format!("failed to parse resource detail: {error}"),
        })
    }

    async fn create_virtual_machine(
        &self,
        group: &NodeId,
        spec: &VmCreateSpec,
    ) -> Result<RemoteResource, GatewayError> {
        let url = format!("{}{}/virtualMachines/{}", self.base, group, spec.name);
        let payload = json!({
            "name": spec.name,
            "location": spec.location,
            "properties": {
                "vmSize": spec.vm_size,
                "image": spec.image,
                "adminUsername": spec.admin_username,
                "sshPublicKey": spec.ssh_public_key,
            },
        });
        let body = self
            .send_expecting_success(self.http.put(&url).json(&payload))
            .await?;
        let dto: ResourceDto =
            serde_json::from_slice(&body).map_err(|error| GatewayError::Malformed {
                message: format!("failed to parse create response: {error}"),
            })?;
        Ok(dto.into_remote(ResourceKind::VirtualMachine))
    }

    async fn add_ssh_key(
        &self,
        vm: &NodeId,
        username: &str,
        public_key: &str,
    ) -> Result<(), GatewayError> {
        let url = format!("{}{}/sshPublicKeys/{}", self.base, vm, username);
        let payload = json!({ "publicKey": public_key });
        self.send_expecting_success(self.http.put(&url).json(&payload))
            .await?;
        Ok(())
    }
}
