//! Docker-based sandboxes
//!
//! The container strategy talks to sandboxes through [`SandboxEngine`], so
//! the lifecycle logic does not depend on how sandboxes are provisioned.
//! [`DockerCli`] provisions them with the `docker` CLI using the platform's
//! base images, whose runtime interface emulator serves invocations over
//! HTTP on port 8080.

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

/// Port the runtime interface emulator listens on inside the container
pub const SANDBOX_PORT: u16 = 8080;

/// Container execution errors
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("Docker not available: {0}")]
    NotAvailable(String),

    #[error("Failed to start container: {0}")]
    StartFailed(String),

    #[error("Container did not become ready: {0}")]
    NotReady(String),

    #[error("Image pull failed: {0}")]
    ImagePullFailed(String),

    #[error("Failed to stop container: {0}")]
    StopFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What to start
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    pub function_key: String,
    pub image: String,
    pub handler: String,
    pub artifact_path: Option<PathBuf>,
    pub environment: HashMap<String, String>,
}

/// A started sandbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sandbox {
    pub id: String,
    /// Host address the sandbox's invoke endpoint is published on
    pub addr: SocketAddr,
}

impl Sandbox {
    pub fn invoke_url(&self) -> String {
        format!(
            "http://{}/2015-03-31/functions/function/invocations",
            self.addr
        )
    }
}

/// Provisions sandbox processes
#[async_trait]
pub trait SandboxEngine: Send + Sync {
    /// Make sure `image` is present locally, pulling it if needed
    async fn ensure_image(&self, image: &str) -> Result<(), ContainerError>;

    /// Start a sandbox and return once its endpoint is published
    async fn start(&self, spec: &SandboxSpec) -> Result<Sandbox, ContainerError>;

    /// Wait for the sandbox to exit and return its exit code
    async fn wait(&self, id: &str) -> Result<i64, ContainerError>;

    /// Stop the sandbox; stopping an already stopped sandbox is not an error
    async fn stop(&self, id: &str) -> Result<(), ContainerError>;
}

/// Docker executor configuration
#[derive(Debug, Clone)]
pub struct DockerConfig {
    /// Network mode (host, bridge)
    pub network_mode: String,
    /// Host interface sandbox ports are published on
    pub publish_host: String,
    /// Extra environment for every container
    pub environment: HashMap<String, String>,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            network_mode: "bridge".to_string(),
            publish_host: "127.0.0.1".to_string(),
            environment: HashMap::new(),
        }
    }
}

/// Sandbox engine driving the `docker` CLI
pub struct DockerCli {
    config: DockerConfig,
}

impl DockerCli {
    pub fn new(config: DockerConfig) -> Self {
        Self { config }
    }

    /// Check if Docker is available
    pub async fn is_available() -> bool {
        match Command::new("docker").arg("info").output().await {
            Ok(output) => output.status.success(),
            Err(_) => false,
        }
    }

    fn run_args(&self, spec: &SandboxSpec, container_name: &str) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            container_name.to_string(),
            "--network".to_string(),
            self.config.network_mode.clone(),
            "-p".to_string(),
            format!("{}::{}", self.config.publish_host, SANDBOX_PORT),
        ];

        if let Some(path) = &spec.artifact_path {
            args.push("-v".to_string());
            args.push(format!("{}:/var/task:ro,delegated", path.display()));
        }

        let mut env: Vec<(&String, &String)> = self
            .config
            .environment
            .iter()
            .chain(spec.environment.iter())
            .collect();
        env.sort();
        for (key, value) in env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        args.push(spec.image.clone());
        args.push(spec.handler.clone());
        args
    }

    /// Host address published for the sandbox port
    async fn published_addr(&self, id: &str) -> Result<SocketAddr, ContainerError> {
        let output = Command::new("docker")
            .args(["port", id, &format!("{}/tcp", SANDBOX_PORT)])
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ContainerError::StartFailed(format!(
                "no published port: {}",
                stderr.trim()
            )));
        }

        parse_published_addr(&String::from_utf8_lossy(&output.stdout)).ok_or_else(|| {
            ContainerError::StartFailed("could not read published port".to_string())
        })
    }
}

/// First IPv4 mapping printed by `docker port`, e.g. `127.0.0.1:49153`
fn parse_published_addr(stdout: &str) -> Option<SocketAddr> {
    stdout
        .lines()
        .filter_map(|line| line.trim().parse::<SocketAddr>().ok())
        .find(SocketAddr::is_ipv4)
        .map(|addr| {
            if addr.ip().is_unspecified() {
                SocketAddr::from(([127, 0, 0, 1], addr.port()))
            } else {
                addr
            }
        })
}

#[async_trait]
impl SandboxEngine for DockerCli {
    async fn ensure_image(&self, image: &str) -> Result<(), ContainerError> {
        // Check if image exists
        let output = Command::new("docker")
            .args(["image", "inspect", image])
            .output()
            .await
            .map_err(|e| ContainerError::NotAvailable(e.to_string()))?;

        if output.status.success() {
            return Ok(());
        }

        info!(image = %image, "Pulling base image");

        let output = Command::new("docker").args(["pull", image]).output().await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ContainerError::ImagePullFailed(format!(
                "Failed to pull {}: {}",
                image,
                stderr.trim()
            )));
        }

        Ok(())
    }

    async fn start(&self, spec: &SandboxSpec) -> Result<Sandbox, ContainerError> {
        let container_name = format!(
            "localfn-{}-{}",
            spec.function_key,
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        let args = self.run_args(spec, &container_name);

        debug!(args = ?args, "Starting Docker container");

        let output = Command::new("docker")
            .args(&args)
            .output()
            .await
            .map_err(|e| ContainerError::StartFailed(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(stderr = %stderr, "Failed to start container");
            return Err(ContainerError::StartFailed(stderr.trim().to_string()));
        }

        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();

        let addr = match self.published_addr(&id).await {
            Ok(addr) => addr,
            Err(e) => {
                let _ = self.stop(&id).await;
                return Err(e);
            }
        };

        info!(
            container_id = %id,
            function = %spec.function_key,
            image = %spec.image,
            addr = %addr,
            "Started container"
        );

        Ok(Sandbox { id, addr })
    }

    async fn wait(&self, id: &str) -> Result<i64, ContainerError> {
        let output = Command::new("docker").args(["wait", id]).output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout);

        // With --rm the container may be gone before `docker wait` attaches.
        Ok(stdout.trim().parse().unwrap_or(-1))
    }

    async fn stop(&self, id: &str) -> Result<(), ContainerError> {
        let output = Command::new("docker").args(["stop", id]).output().await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("No such container") {
                debug!(container_id = %id, "Container already gone");
                return Ok(());
            }
            warn!(container_id = %id, stderr = %stderr.trim(), "Failed to stop container");
            return Err(ContainerError::StopFailed(stderr.trim().to_string()));
        }

        debug!(container_id = %id, "Stopped container");
        Ok(())
    }
}
