//! Instance provisioning stages.
//!
//! Start creates a workstation from one size of a template. End confirms the
//! workstation exists.

use crate::error::{Result, WorkerError};
use crate::handler::{StageContext, StageHandler, StageOutcome};
use crate::image::{MetadataItem, REQUEST_ID_KEY};
use crate::provider::{Accelerator, ComputeProvider, Image, InstanceSpec, InstanceTemplate};
use crate::template::{DEFAULT_NETWORK, DEFAULT_ZONE, TEMPLATE_MACHINE_TYPE};
use async_trait::async_trait;
use orchestrate_engine::{RequestKind, Stage};
use orchestrate_identity::Credentials;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument};

const ORCHESTRATE_PREFIX: &str = "orchestrate_";
const DEFAULT_NAME_PATTERN: &str = "{template}-{size}-{id}";
const CONFIGURE_SCRIPT: &str = "remotedesktopconfigure";
const LINUX_FAMILIES: [&str; 7] = ["centos", "debian", "rhel", "sles", "cos", "coreos", "ubuntu"];

fn default_true() -> bool {
    true
}

/// Instance request parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRequest {
    pub template: String,
    /// Template size; the template's default size when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
    /// Boot from the newest image of the template image's family instead of
    /// the exact image the template references.
    #[serde(default = "default_true")]
    pub use_latest_image: bool,
    #[serde(default)]
    pub use_external_ip: bool,
    #[serde(default)]
    pub metadata: Vec<MetadataItem>,
}

impl InstanceRequest {
    pub fn from_parameters(parameters: &Value) -> Result<Self> {
        serde_json::from_value(parameters.clone())
            .map_err(|e| WorkerError::InvalidParameters(e.to_string()))
    }
}

/// Template metadata split into what the instance receives and the
/// `orchestrate_*` settings, prefix stripped. Later entries win.
#[derive(Debug, Default)]
pub struct TemplateMetadata {
    pub instance: Vec<(String, String)>,
    pub orchestrate: HashMap<String, String>,
}

impl TemplateMetadata {
    pub fn parse(template: &InstanceTemplate, overrides: &[MetadataItem]) -> Self {
        let mut metadata = TemplateMetadata::default();
        for (key, value) in &template.metadata {
            match key.strip_prefix(ORCHESTRATE_PREFIX) {
                Some(setting) => {
                    metadata.orchestrate.insert(setting.to_string(), value.clone());
                }
                None => metadata.set(key, value),
            }
        }
        for item in overrides {
            metadata.set(&item.key, &item.value);
        }
        metadata
    }

    fn set(&mut self, key: &str, value: &str) {
        match self.instance.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value.to_string(),
            None => self.instance.push((key.to_string(), value.to_string())),
        }
    }

    fn has(&self, key: &str) -> bool {
        self.instance.iter().any(|(k, _)| k == key)
    }

    fn setting(&self, key: &str) -> Option<&str> {
        self.orchestrate
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}

/// Base OS of an image: its `orchestrate_os` label, else a guess from the
/// family name prefix.
pub fn os_type(image: &Image) -> Result<String> {
    if let Some(os) = image.labels.get("orchestrate_os") {
        return Ok(os.to_lowercase());
    }

    let prefix = image.family.split('-').next().unwrap_or_default();
    if prefix == "windows" {
        return Ok("windows".to_string());
    }
    if LINUX_FAMILIES.contains(&prefix) {
        return Ok("linux".to_string());
    }

    Err(WorkerError::Provisioning(format!(
        "Image {} does not have a orchestrate_os label. And, could not guess the OS from \
         the family name based on image family naming conventions, e.g. windows-, centos-, \
         etc. Please add a orchestrate_os label and set it to either \"linux\" or \"windows\" \
         to indicate the base OS for this image. Or, rename the image family to include a \
         prefix with the base OS name.",
        image.self_link
    )))
}

/// `(metadata key, script url)` of the post-creation configuration script.
pub fn startup_script(os_type: &str, orchestrate_project: &str) -> (String, String) {
    let (key, extension) = if os_type == "windows" {
        ("windows-startup-script-url", "ps1")
    } else {
        ("startup-script-url", "py")
    };
    (
        key.to_string(),
        format!("gs://{}/{}.{}", orchestrate_project, CONFIGURE_SCRIPT, extension),
    )
}

/// Fill `{template}`, `{size}`, `{region}`, `{zone}`, `{type}`, `{gpu_name}`,
/// `{gpu_count}`, `{gpu_type}`, `{user}` and `{id}` placeholders.
pub fn build_name(
    request: &InstanceRequest,
    size: &str,
    zone: &str,
    metadata: &TemplateMetadata,
    request_id: &str,
) -> String {
    let pattern = request
        .name
        .as_deref()
        .or_else(|| metadata.setting("instance_name_pattern"))
        .unwrap_or(DEFAULT_NAME_PATTERN);

    // Derived from the request so every attempt picks the same name.
    let id: String = request_id
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .take(5)
        .collect();
    let gpu_type = metadata.setting("gpu_type").unwrap_or_default();
    let (graphics, gpu_name) = match gpu_type.strip_suffix("-vws") {
        Some(name) => ("vws", name),
        None => ("gpu", gpu_type),
    };
    let region = region_of(zone);

    let values = [
        ("template", request.template.as_str()),
        ("size", size),
        ("region", region.as_str()),
        ("zone", zone),
        ("type", graphics),
        ("gpu_name", gpu_name),
        ("gpu_count", metadata.setting("gpu_count").unwrap_or("0")),
        ("gpu_type", gpu_type),
        ("user", id.as_str()),
        ("id", id.as_str()),
    ];
    values.iter().fold(pattern.to_string(), |name, (key, value)| {
        name.replace(&format!("{{{}}}", key), value)
    })
}

fn region_of(zone: &str) -> String {
    zone.split('-').take(2).collect::<Vec<_>>().join("-")
}

/// `projects/{project}/global/images/...` -> `project`
fn image_project(self_link: &str) -> Option<&str> {
    let rest = &self_link[self_link.find("projects/")? + "projects/".len()..];
    rest.split('/').next()
}

/// Resolves the instance a request describes. Shared by both stages so they
/// agree on name and zone.
pub struct InstancePlanner {
    provider: Arc<dyn ComputeProvider>,
    orchestrate_project: String,
}

impl InstancePlanner {
    pub fn new(provider: Arc<dyn ComputeProvider>, orchestrate_project: impl Into<String>) -> Self {
        Self {
            provider,
            orchestrate_project: orchestrate_project.into(),
        }
    }

    /// The template for the requested size, or the one flagged as default.
    async fn find_template(
        &self,
        creds: &Credentials,
        request: &InstanceRequest,
    ) -> Result<InstanceTemplate> {
        if let Some(size) = &request.size {
            let name = format!("{}-{}", request.template, size);
            return self
                .provider
                .get_instance_template(creds, &name)
                .await?
                .ok_or_else(|| {
                    WorkerError::NotFound(format!(
                        "Could not find template {} size {}",
                        request.template, size
                    ))
                });
        }

        let candidates = self
            .provider
            .list_instance_templates(creds, &format!("{}-", request.template))
            .await?;
        candidates
            .into_iter()
            .find(|t| t.metadata_value("orchestrate_default_size") == Some("true"))
            .ok_or_else(|| {
                WorkerError::Provisioning(format!(
                    "Could not locate default size for project {} template {}. Please specify \
                     an explicit size in the request.",
                    creds.project_id, request.template
                ))
            })
    }

    /// Image referenced by the template, and the newest of its family.
    async fn boot_images(&self, creds: &Credentials, template: &InstanceTemplate) -> Result<(Image, Image)> {
        let image = self.provider.get_image(creds, &template.source_image).await?;
        let project = image_project(&image.self_link).ok_or_else(|| {
            WorkerError::Provisioning(format!("Unexpected image link {}", image.self_link))
        })?;
        let latest_link = self
            .provider
            .latest_image(creds, project, &image.family)
            .await?;
        let latest = self.provider.get_image(creds, &latest_link).await?;
        Ok((image, latest))
    }

    pub async fn plan(&self, ctx: &StageContext) -> Result<InstanceSpec> {
        let request = InstanceRequest::from_parameters(&ctx.parameters)?;
        let creds = &ctx.credentials;

        let template = self.find_template(creds, &request).await?;
        let size = template
            .name
            .strip_prefix(&format!("{}-", request.template))
            .unwrap_or(&template.name)
            .to_string();
        let mut metadata = TemplateMetadata::parse(&template, &request.metadata);

        let zone = request
            .zone
            .clone()
            .or_else(|| metadata.setting("zone").map(String::from))
            .unwrap_or_else(|| DEFAULT_ZONE.to_string());
        let name = build_name(&request, &size, &zone, &metadata, &ctx.request_id);

        let zone_url = format!("projects/{}/zones/{}", ctx.target_project, zone);
        let region_url = format!(
            "projects/{}/regions/{}",
            ctx.target_project,
            region_of(&zone)
        );
        let network = metadata.setting("network").unwrap_or(DEFAULT_NETWORK).to_string();
        let machine_type = metadata
            .setting("machine_type")
            .unwrap_or(TEMPLATE_MACHINE_TYPE)
            .to_string();

        let (image, latest) = self.boot_images(creds, &template).await?;
        let boot = if request.use_latest_image { latest } else { image };

        let os = os_type(&boot)?;
        let (script_key, script_url) = startup_script(&os, &self.orchestrate_project);
        if !metadata.has(&script_key) {
            metadata.set(&script_key, &script_url);
        }
        metadata.set(REQUEST_ID_KEY, &ctx.request_id);

        Ok(InstanceSpec {
            name,
            zone,
            machine_type: format!("{}/machineTypes/{}", zone_url, machine_type),
            accelerators: template
                .accelerators
                .iter()
                .map(|a| Accelerator {
                    accelerator_type: format!("{}/acceleratorTypes/{}", zone_url, a.accelerator_type),
                    count: a.count,
                })
                .collect(),
            source_image: boot.self_link,
            disk_size_gb: template.disk_size_gb,
            subnetwork: format!("{}/subnetworks/{}", region_url, network),
            external_ip: request.use_external_ip,
            metadata: metadata.instance,
            service_account: template.service_account.clone(),
            deletion_protection: false,
            description: format!(
                "Orchestrate instance created from template {} size {}",
                request.template, size
            ),
        })
    }
}

/// Creates the workstation.
pub struct InstanceStartHandler {
    planner: Arc<InstancePlanner>,
}

impl InstanceStartHandler {
    pub fn new(planner: Arc<InstancePlanner>) -> Self {
        Self { planner }
    }

    #[instrument(skip(self, ctx), fields(request_id = %ctx.request_id, attempt = ctx.attempt))]
    async fn start(&self, ctx: &StageContext) -> Result<Value> {
        let spec = self.planner.plan(ctx).await?;
        let creds = &ctx.credentials;
        let provider = &self.planner.provider;
        info!(instance = %spec.name, zone = %spec.zone, project = %ctx.target_project, "Creating instance");

        match provider.insert_instance(creds, &spec).await {
            Ok(()) => info!(instance = %spec.name, "Instance created"),
            Err(WorkerError::Conflict(_)) => {
                let existing = provider.get_instance(creds, &spec.zone, &spec.name).await?;
                let owner = existing
                    .as_ref()
                    .and_then(|instance| instance.spec.metadata_value(REQUEST_ID_KEY));
                if owner != Some(ctx.request_id.as_str()) {
                    return Err(WorkerError::Conflict(format!(
                        "An instance with name {} already exists.",
                        spec.name
                    )));
                }
                info!(instance = %spec.name, "Instance already created by an earlier attempt");
            }
            Err(e) => return Err(e),
        }

        Ok(json!({
            "instance_name": spec.name,
            "zone": spec.zone,
            "source_image": spec.source_image,
        }))
    }
}

#[async_trait]
impl StageHandler for InstanceStartHandler {
    fn kind(&self) -> RequestKind {
        RequestKind::Instance
    }

    fn stage(&self) -> Stage {
        Stage::Start
    }

    async fn handle(&self, ctx: &StageContext) -> StageOutcome {
        self.start(ctx).await.into()
    }
}

/// Confirms the workstation created by the start stage exists.
pub struct InstanceEndHandler {
    planner: Arc<InstancePlanner>,
}

impl InstanceEndHandler {
    pub fn new(planner: Arc<InstancePlanner>) -> Self {
        Self { planner }
    }

    #[instrument(skip(self, ctx), fields(request_id = %ctx.request_id, attempt = ctx.attempt))]
    async fn finish(&self, ctx: &StageContext) -> Result<Value> {
        let spec = self.planner.plan(ctx).await?;
        let instance = self
            .planner
            .provider
            .get_instance(&ctx.credentials, &spec.zone, &spec.name)
            .await?
            .filter(|i| i.spec.metadata_value(REQUEST_ID_KEY) == Some(ctx.request_id.as_str()))
            .ok_or_else(|| WorkerError::NotFound(spec.name.clone()))?;

        info!(instance = %spec.name, running = instance.running, "Instance ready");
        Ok(json!({
            "instance_name": spec.name,
            "zone": spec.zone,
            "running": instance.running,
        }))
    }
}

#[async_trait]
impl StageHandler for InstanceEndHandler {
    fn kind(&self) -> RequestKind {
        RequestKind::Instance
    }

    fn stage(&self) -> Stage {
        Stage::End
    }

    async fn handle(&self, ctx: &StageContext) -> StageOutcome {
        self.finish(ctx).await.into()
    }
}
