//! Starting one controller against the local control plane

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use installer_process::{check_flag, HealthCheck, State};
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::args::render_args;
use crate::controllers::Controller;
use crate::envtest::{install_crds, CrdInstallOptions, Scheme, WebhookInstallOptions};
use crate::error::{Error, Result};
use crate::providers::ProviderArchive;

/// Start timeout for controllers
pub const CONTROLLER_START_TIMEOUT: Duration = Duration::from_secs(60);
/// Stop timeout for controllers
pub const CONTROLLER_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Environment variable every controller reads its kubeconfig from
pub const KUBECONFIG_ENV: &str = "KUBECONFIG";

/// What a launcher needs from the running system
#[derive(Clone)]
pub struct LaunchContext {
    /// Client for the local control plane
    pub client: Option<Client>,
    /// Kubeconfig of the local control plane
    pub kubeconfig_path: PathBuf,
    /// Shared binaries directory
    pub bin_dir: PathBuf,
    /// Directory receiving controller logs
    pub artifacts_dir: PathBuf,
    /// Cancelled once every controller has been stopped
    pub cancel: CancellationToken,
}

/// Starts a controller and hands back its running process
#[async_trait]
pub trait ControllerLauncher: Send + Sync {
    /// Start `controller` and wait for it to become ready
    async fn launch(&self, controller: &Controller, ctx: &LaunchContext) -> Result<State>;
}

/// Launches controllers as supervised child processes
pub struct ProcessLauncher {
    archive: ProviderArchive,
    scheme: Scheme,
    /// Start timeout for each controller
    pub start_timeout: Duration,
    /// Stop timeout for each controller
    pub stop_timeout: Duration,
}

impl ProcessLauncher {
    /// A launcher extracting controller binaries from `archive`
    pub fn new(archive: ProviderArchive) -> Self {
        Self {
            archive,
            scheme: Scheme::installer(),
            start_timeout: CONTROLLER_START_TIMEOUT,
            stop_timeout: CONTROLLER_STOP_TIMEOUT,
        }
    }

    async fn supported_optional_args(&self, binary: &std::path::Path, optional: &[String]) -> Vec<String> {
        let mut supported = Vec::new();
        for arg in optional {
            let flag = arg
                .trim_start_matches('-')
                .split('=')
                .next()
                .unwrap_or_default();
            match check_flag(binary, flag).await {
                Ok(true) => supported.push(arg.clone()),
                Ok(false) => debug!(binary = %binary.display(), flag, "optional flag not supported"),
                Err(e) => warn!(error = %e, "failed to probe optional flag"),
            }
        }
        supported
    }
}

/// Controller environment as `KEY=VALUE`, with `KUBECONFIG` forced
pub fn controller_env(controller: &Controller, kubeconfig: &std::path::Path) -> Vec<String> {
    let mut env = controller.env.clone();
    env.insert(KUBECONFIG_ENV.to_string(), kubeconfig.display().to_string());
    env.into_iter().map(|(k, v)| format!("{k}={v}")).collect()
}

#[async_trait]
impl ControllerLauncher for ProcessLauncher {
    async fn launch(&self, controller: &Controller, ctx: &LaunchContext) -> Result<State> {
        let client = ctx
            .client
            .as_ref()
            .ok_or_else(|| Error::State("local control plane has no client".to_string()))?;

        if let Some(provider) = &controller.provider {
            self.archive.extract(provider, &ctx.bin_dir)?;
        }

        let mut webhooks = WebhookInstallOptions::new(controller.manifest_paths.clone());
        webhooks.local_serving_cert_dir =
            Some(ctx.bin_dir.join(format!("{}-serving-certs", controller.slug())));
        webhooks.prepare()?;
        webhooks.install(client).await?;

        let cert_dir = webhooks
            .local_serving_cert_dir
            .clone()
            .unwrap_or_default();
        let rendered = render_args(&controller.args, webhooks.local_serving_port, &cert_dir)?;

        let mut process = State::new();
        let candidate = ctx.bin_dir.join(&controller.binary);
        if candidate.is_file() {
            process.path = candidate;
        }
        process.dir = controller.working_dir.clone();
        process.env = controller_env(controller, &ctx.kubeconfig_path);
        process.start_timeout = self.start_timeout;
        process.stop_timeout = self.stop_timeout;
        if let Some(addr) = &rendered.health_addr {
            process.health_check = Some(HealthCheck::new(addr.url("http", "/healthz")?));
        }
        process.init(&controller.binary)?;

        let mut args = rendered.args;
        args.extend(
            self.supported_optional_args(&process.path, &controller.optional_args)
                .await,
        );
        process.args = args;

        install_crds(
            client,
            &CrdInstallOptions::new(&self.scheme, controller.manifest_paths.clone(), &webhooks),
        )
        .await?;

        std::fs::create_dir_all(&ctx.artifacts_dir).map_err(|e| Error::io(&ctx.artifacts_dir, e))?;
        let log_path = ctx.artifacts_dir.join(format!("{}.log", controller.slug()));
        let log = std::fs::File::create(&log_path).map_err(|e| Error::io(&log_path, e))?;
        let log_err = log.try_clone().map_err(|e| Error::io(&log_path, e))?;

        info!(controller = %controller.name, log = %log_path.display(), "starting controller");
        if let Err(e) = process
            .start(&ctx.cancel, Stdio::from(log), Stdio::from(log_err))
            .await
        {
            if let Err(stop_err) = process.stop().await {
                warn!(controller = %controller.name, error = %stop_err, "failed to stop controller after start failure");
            }
            return Err(e.into());
        }
        info!(controller = %controller.name, "controller ready");
        Ok(process)
    }
}
