//! cloud-bootstrap library
//!
//! Finds instance data on a VMware-style hypervisor (environment variables,
//! guestinfo RPC, customization spool files), normalizes it, and ingests the
//! user-data and vendor-data it carries through pluggable part handlers.
//!
//! # Design Principles
//!
//! - **Safety First**: No unsafe code (`unsafe_code = "forbid"`)
//! - **Local failures stay local**: a broken transport, include or handler
//!   is logged and skipped; only "no datasource" and unparsable user-data
//!   stop a run
//! - **Testable seams**: transports, host inspection, external commands and
//!   URL fetching sit behind traits

pub mod command;
pub mod config;
pub mod datasources;
pub mod state;
pub mod template;
pub mod userdata;

mod error;

pub use error::BootstrapError;

use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use config::BootstrapConfig;
use datasources::controller::DatasourceController;
use datasources::hostinfo::HostInfo;
use state::{CloudPaths, InstanceState};
use userdata::{DataOrigin, Dispatcher, Frequency, HandlerRegistry, UserDataProcessor, WalkSummary};

/// What one bootstrap run did
#[derive(Debug, Clone)]
pub struct BootstrapOutcome {
    /// `"<transport> (<key>)"`
    pub provenance: String,
    pub instance_id: String,
    /// First boot of this instance
    pub new_instance: bool,
    pub host: HostInfo,
    pub vendordata: Option<WalkSummary>,
    pub userdata: Option<WalkSummary>,
}

/// Probe for instance data with the configured transports and ingest it
pub async fn bootstrap(
    config: &BootstrapConfig,
    paths: &CloudPaths,
    hint: Option<&str>,
    cancel: &CancellationToken,
) -> Result<BootstrapOutcome, BootstrapError> {
    let controller = DatasourceController::from_config(&config.datasource);
    bootstrap_with(controller, config, paths, hint, cancel).await
}

/// [`bootstrap`] with a prepared datasource controller
pub async fn bootstrap_with(
    mut controller: DatasourceController,
    config: &BootstrapConfig,
    paths: &CloudPaths,
    hint: Option<&str>,
    cancel: &CancellationToken,
) -> Result<BootstrapOutcome, BootstrapError> {
    controller.probe(hint, cancel).await?;
    let provenance = controller.provenance();
    let instance_id = controller
        .instance_id()
        .map(str::to_string)
        .ok_or(BootstrapError::NoDatasource)?;
    info!("Instance data from {}", provenance);

    let mut state = InstanceState::with_paths(paths.clone());
    state.initialize().await?;
    let new_instance = state.set_instance_id(&instance_id).await?;

    if let Some(raw) = controller.userdata_raw() {
        state.save_userdata(raw).await?;
    }
    if let Some(raw) = controller.vendordata_raw() {
        state.save_vendordata(raw).await?;
    }
    state.save_datasource(&provenance).await?;

    let host = controller.setup(cancel).await?;

    let metadata = controller
        .metadata()
        .cloned()
        .ok_or(BootstrapError::NoDatasource)?;
    state.save_metadata(&metadata.to_value()).await?;
    if let Some(network) = controller.network_config() {
        state.save_network_config(network).await?;
    }

    let frequency = if new_instance {
        Frequency::PerInstance
    } else {
        Frequency::Always
    };

    let processor = UserDataProcessor::from_config(&config.userdata)?
        .with_cache_dir(paths.urlcache_dir(&instance_id))
        .with_metadata(metadata);
    let handler_timeout = Duration::from_secs(config.userdata.external_handler_timeout_secs);
    let ingest = Ingest {
        processor: &processor,
        paths,
        instance_id: &instance_id,
        frequency,
        handler_timeout,
    };

    let vendordata = ingest
        .run(controller.vendordata_raw(), DataOrigin::Vendor)
        .await
        .unwrap_or_else(|e| {
            warn!("Skipping vendor-data: {}", e);
            None
        });
    let userdata = ingest.run(controller.userdata_raw(), DataOrigin::User).await?;

    Ok(BootstrapOutcome {
        provenance,
        instance_id,
        new_instance,
        host,
        vendordata,
        userdata,
    })
}

struct Ingest<'a> {
    processor: &'a UserDataProcessor,
    paths: &'a CloudPaths,
    instance_id: &'a str,
    frequency: Frequency,
    handler_timeout: Duration,
}

impl Ingest<'_> {
    async fn run(&self, raw: Option<&[u8]>, origin: DataOrigin) -> Result<Option<WalkSummary>, BootstrapError> {
        let Some(raw) = raw else {
            return Ok(None);
        };
        let document = self.processor.process(raw).await?;
        let registry = HandlerRegistry::with_defaults(self.paths, self.instance_id, origin);
        let mut dispatcher = Dispatcher::new(registry)
            .with_handlers_dir(self.paths.handlers_dir(self.instance_id))
            .with_handler_timeout(self.handler_timeout);
        Ok(Some(dispatcher.walk(&document, self.frequency).await))
    }
}
