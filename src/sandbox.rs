//! Sandbox provisioning: one browser container per session.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, NetworkingConfig,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::models::{ContainerInspectResponse, EndpointSettings, HostConfig};
use bollard::Docker;
use tracing::{debug, info, warn};

use crate::config::{OrchestratorConfig, PortSet};
use crate::error::{Error, Result};
use crate::state::SandboxHandle;

const CONTAINER_NAME_PREFIX: &str = "intrace-browser";
const SESSION_ENV: &str = "SESSION_ID";

/// Extra time allowed on top of the stop grace period before giving up on a
/// stop request.
const STOP_SLACK: Duration = Duration::from_secs(10);

/// What a successful provision hands back to the orchestrator.
#[derive(Debug, Clone)]
pub struct ProvisionedSandbox {
    pub handle: SandboxHandle,
    pub address: String,
    pub ports: PortSet,
}

/// Creates and destroys sandbox processes.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Start a sandbox for `session_id`. Never leaves a sandbox behind on error.
    async fn provision(&self, session_id: &str) -> Result<ProvisionedSandbox>;

    /// Best-effort stop. Failures are logged, not returned.
    async fn destroy(&self, handle: &SandboxHandle);
}

/// Pick the address a sandbox is reachable at.
///
/// Order: the configured network's address, then the default bridge address,
/// then the first non-empty address among attached networks by network name.
pub fn resolve_address(inspect: &ContainerInspectResponse, network: Option<&str>) -> Option<String> {
    let settings = inspect.network_settings.as_ref()?;
    let non_empty = |ip: &Option<String>| ip.as_ref().filter(|ip| !ip.is_empty()).cloned();

    if let (Some(name), Some(networks)) = (network, settings.networks.as_ref()) {
        if let Some(ip) = networks.get(name).and_then(|ep| non_empty(&ep.ip_address)) {
            return Some(ip);
        }
    }

    if let Some(ip) = non_empty(&settings.ip_address) {
        return Some(ip);
    }

    let networks: BTreeMap<_, _> = settings.networks.as_ref()?.iter().collect();
    networks
        .into_values()
        .find_map(|ep| non_empty(&ep.ip_address))
}

pub struct DockerProvisioner {
    docker: Docker,
    config: OrchestratorConfig,
}

impl DockerProvisioner {
    pub fn new(config: OrchestratorConfig) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| Error::Provision(format!("docker connect: {}", e)))?;
        Ok(Self { docker, config })
    }

    pub fn with_client(docker: Docker, config: OrchestratorConfig) -> Self {
        Self { docker, config }
    }

    fn container_config(&self, session_id: &str) -> Config<String> {
        let ports = self.config.ports;
        let exposed_ports: HashMap<String, HashMap<(), ()>> = [ports.control, ports.stream]
            .iter()
            .map(|p| (format!("{}/tcp", p), HashMap::new()))
            .collect();

        let host_config = HostConfig {
            auto_remove: Some(true),
            memory: Some(self.config.memory_bytes),
            nano_cpus: Some(self.config.nano_cpus),
            ..Default::default()
        };

        let networking_config = self.config.network.as_ref().map(|name| NetworkingConfig {
            endpoints_config: HashMap::from([(name.clone(), EndpointSettings::default())]),
        });

        Config {
            image: Some(self.config.image.clone()),
            env: Some(vec![format!("{}={}", SESSION_ENV, session_id)]),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            networking_config,
            ..Default::default()
        }
    }

    async fn inspect_address(&self, container_id: &str) -> Result<String> {
        let inspect = self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| Error::Provision(format!("inspect: {}", e)))?;

        resolve_address(&inspect, self.config.network.as_deref())
            .ok_or_else(|| Error::Provision("container has no network address".to_string()))
    }

    /// Force-remove a container that never became a session.
    async fn discard(&self, container_id: &str) {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        if let Err(e) = self.docker.remove_container(container_id, Some(options)).await {
            warn!(container_id, error = %e, "failed to discard partial sandbox");
        }
    }
}

#[async_trait]
impl Provisioner for DockerProvisioner {
    async fn provision(&self, session_id: &str) -> Result<ProvisionedSandbox> {
        let short_id: String = session_id.chars().take(8).collect();
        let options = CreateContainerOptions {
            name: format!("{}-{}", CONTAINER_NAME_PREFIX, short_id),
            platform: None,
        };

        let created = self
            .docker
            .create_container(Some(options), self.container_config(session_id))
            .await
            .map_err(|e| Error::Provision(format!("create: {}", e)))?;
        let container_id = created.id;
        debug!(session_id, container_id = %container_id, "container created");

        if let Err(e) = self
            .docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
        {
            self.discard(&container_id).await;
            return Err(Error::Provision(format!("start: {}", e)));
        }

        let address = match self.inspect_address(&container_id).await {
            Ok(address) => address,
            Err(e) => {
                self.discard(&container_id).await;
                return Err(e);
            }
        };

        info!(session_id, container_id = %container_id, address = %address, "sandbox started");
        Ok(ProvisionedSandbox {
            handle: SandboxHandle::new(container_id),
            address,
            ports: self.config.ports,
        })
    }

    async fn destroy(&self, handle: &SandboxHandle) {
        let grace = self.config.stop_grace_secs;
        let bound = Duration::from_secs(grace.max(0) as u64) + STOP_SLACK;
        let stop = self
            .docker
            .stop_container(handle.as_str(), Some(StopContainerOptions { t: grace }));

        match tokio::time::timeout(bound, stop).await {
            Ok(Ok(())) => info!(container_id = handle.as_str(), "sandbox stopped"),
            Ok(Err(BollardError::DockerResponseServerError { status_code: 304 | 404, .. })) => {
                debug!(container_id = handle.as_str(), "sandbox already gone");
            }
            Ok(Err(e)) => warn!(container_id = handle.as_str(), error = %e, "failed to stop sandbox"),
            Err(_) => warn!(container_id = handle.as_str(), "timed out stopping sandbox"),
        }
    }
}
