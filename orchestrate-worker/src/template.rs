//! Template provisioning stages.
//!
//! A template is a family of instance templates, one per size, named
//! `{template}-{size}`. Settings the instance template itself cannot hold are
//! stored as `orchestrate_*` metadata and read back when instances are
//! created from it.

use crate::error::{Result, WorkerError};
use crate::handler::{StageContext, StageHandler, StageOutcome};
use crate::image::{MetadataItem, REQUEST_ID_KEY};
use crate::provider::{Accelerator, ComputeProvider, InstanceTemplate};
use async_trait::async_trait;
use orchestrate_engine::{RequestKind, Stage};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, instrument, warn};

pub const DEFAULT_ZONE: &str = "us-central1-a";
pub const DEFAULT_NETWORK: &str = "default";
/// Instance templates cannot reference custom machine types; the real type
/// lives in `orchestrate_machine_type`.
pub const TEMPLATE_MACHINE_TYPE: &str = "n1-standard-8";

fn default_zone() -> String {
    DEFAULT_ZONE.to_string()
}

fn default_network() -> String {
    DEFAULT_NETWORK.to_string()
}

fn default_gpu_count() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateSize {
    pub name: String,
    pub cpus: u32,
    /// GB
    pub memory: u64,
    /// GB
    pub disk_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_type: Option<String>,
    #[serde(default = "default_gpu_count")]
    pub gpu_count: u32,
}

impl TemplateSize {
    /// `custom-{cpus}-{memory in MB}`
    pub fn machine_type(&self) -> String {
        format!("custom-{}-{}", self.cpus, self.memory * 1024)
    }
}

/// Template request parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateSpec {
    pub name: String,
    pub image_project: String,
    pub image_family: String,
    pub default_size_name: String,
    pub sizes: Vec<TemplateSize>,
    #[serde(default = "default_zone")]
    pub zone: String,
    #[serde(default = "default_network")]
    pub network: String,
    #[serde(default)]
    pub metadata: Vec<MetadataItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_name_pattern: Option<String>,
}

impl TemplateSpec {
    pub fn from_parameters(parameters: &Value) -> Result<Self> {
        serde_json::from_value(parameters.clone())
            .map_err(|e| WorkerError::InvalidParameters(e.to_string()))
    }

    pub fn template_name(&self, size: &TemplateSize) -> String {
        format!("{}-{}", self.name, size.name)
    }
}

pub fn build_instance_template(
    template: &TemplateSpec,
    size: &TemplateSize,
    ctx: &StageContext,
    source_image: &str,
) -> InstanceTemplate {
    let name = template.template_name(size);

    // Instance metadata first so it cannot shadow the orchestrate entries.
    let mut metadata: Vec<(String, String)> = template
        .metadata
        .iter()
        .map(|item| (item.key.clone(), item.value.clone()))
        .collect();
    metadata.extend([
        ("orchestrate_template".to_string(), "true".to_string()),
        (
            "orchestrate_default_size".to_string(),
            (size.name == template.default_size_name).to_string(),
        ),
        ("orchestrate_machine_type".to_string(), size.machine_type()),
        (
            "orchestrate_gpu_type".to_string(),
            size.gpu_type.clone().unwrap_or_default(),
        ),
        ("orchestrate_gpu_count".to_string(), size.gpu_count.to_string()),
        ("orchestrate_network".to_string(), template.network.clone()),
        ("orchestrate_zone".to_string(), template.zone.clone()),
        (REQUEST_ID_KEY.to_string(), ctx.request_id.clone()),
    ]);
    if let Some(pattern) = &template.instance_name_pattern {
        metadata.push((
            "orchestrate_instance_name_pattern".to_string(),
            pattern.clone(),
        ));
    }

    let accelerators = size
        .gpu_type
        .iter()
        .map(|gpu_type| Accelerator {
            accelerator_type: gpu_type.clone(),
            count: size.gpu_count,
        })
        .collect();

    InstanceTemplate {
        description: format!("Orchestrate template {} size {}", name, size.name),
        name,
        machine_type: TEMPLATE_MACHINE_TYPE.to_string(),
        accelerators,
        source_image: source_image.to_string(),
        disk_size_gb: size.disk_size,
        network: template.network.clone(),
        metadata,
        service_account: ctx.credentials.service_account_email.clone(),
    }
}

fn owned_by(template: &InstanceTemplate, request_id: &str) -> bool {
    template.metadata_value(REQUEST_ID_KEY) == Some(request_id)
}

/// Creates one instance template per size.
pub struct TemplateStartHandler {
    provider: Arc<dyn ComputeProvider>,
}

impl TemplateStartHandler {
    pub fn new(provider: Arc<dyn ComputeProvider>) -> Self {
        Self { provider }
    }

    /// Every GPU type must exist in the zone before any size is created, so
    /// a bad size never leaves half a template family behind.
    async fn check_gpu_types(&self, ctx: &StageContext, template: &TemplateSpec) -> Result<()> {
        if template.sizes.iter().all(|size| size.gpu_type.is_none()) {
            return Ok(());
        }

        let available = self
            .provider
            .list_accelerator_types(&ctx.credentials, &template.zone)
            .await?;
        for gpu_type in template.sizes.iter().filter_map(|s| s.gpu_type.as_ref()) {
            if !available.contains(gpu_type) {
                return Err(WorkerError::Provisioning(format!(
                    "{} is not a valid GPU type or is not available in project {} zone {}. \
                     Available options are: {}",
                    gpu_type,
                    ctx.target_project,
                    template.zone,
                    available.join(", ")
                )));
            }
        }
        Ok(())
    }

    async fn insert_size(
        &self,
        ctx: &StageContext,
        template: &TemplateSpec,
        instance_template: &InstanceTemplate,
    ) -> Result<()> {
        let creds = &ctx.credentials;
        match self
            .provider
            .insert_instance_template(creds, instance_template)
            .await
        {
            Ok(()) => {
                info!(template = %instance_template.name, "Created template size");
                Ok(())
            }
            Err(WorkerError::Conflict(_)) => {
                let existing = self
                    .provider
                    .get_instance_template(creds, &instance_template.name)
                    .await?;
                if existing.is_some_and(|t| owned_by(&t, &ctx.request_id)) {
                    return Ok(());
                }
                Err(WorkerError::Conflict(format!(
                    "A template with name {} already exists.",
                    template.name
                )))
            }
            Err(e) => Err(e),
        }
    }

    /// Deletes the sizes this run created. Best effort; the stage error is
    /// what gets reported.
    async fn roll_back(&self, ctx: &StageContext, names: &[String]) {
        for name in names {
            match self
                .provider
                .delete_instance_template(&ctx.credentials, name)
                .await
            {
                Ok(()) => info!(template = %name, "Deleted template size"),
                Err(e) => warn!(template = %name, error = %e, "Failed to delete template size"),
            }
        }
    }

    #[instrument(skip(self, ctx), fields(request_id = %ctx.request_id, attempt = ctx.attempt))]
    async fn start(&self, ctx: &StageContext) -> Result<Value> {
        let template = TemplateSpec::from_parameters(&ctx.parameters)?;
        let creds = &ctx.credentials;
        info!(name = %template.name, project = %ctx.target_project, sizes = template.sizes.len(), "Creating template");

        self.check_gpu_types(ctx, &template).await?;

        let source_image = self
            .provider
            .latest_image(creds, &template.image_project, &template.image_family)
            .await?;

        let mut names = Vec::with_capacity(template.sizes.len());
        for size in &template.sizes {
            let instance_template = build_instance_template(&template, size, ctx, &source_image);
            if let Err(e) = self.insert_size(ctx, &template, &instance_template).await {
                self.roll_back(ctx, &names).await;
                return Err(e);
            }
            names.push(instance_template.name);
        }

        Ok(json!({
            "templates": names,
            "source_image": source_image,
        }))
    }
}

#[async_trait]
impl StageHandler for TemplateStartHandler {
    fn kind(&self) -> RequestKind {
        RequestKind::Template
    }

    fn stage(&self) -> Stage {
        Stage::Start
    }

    async fn handle(&self, ctx: &StageContext) -> StageOutcome {
        self.start(ctx).await.into()
    }
}

/// Confirms every size of the template exists.
pub struct TemplateEndHandler {
    provider: Arc<dyn ComputeProvider>,
}

impl TemplateEndHandler {
    pub fn new(provider: Arc<dyn ComputeProvider>) -> Self {
        Self { provider }
    }

    #[instrument(skip(self, ctx), fields(request_id = %ctx.request_id, attempt = ctx.attempt))]
    async fn finish(&self, ctx: &StageContext) -> Result<Value> {
        let template = TemplateSpec::from_parameters(&ctx.parameters)?;
        let existing = self
            .provider
            .list_instance_templates(&ctx.credentials, &format!("{}-", template.name))
            .await?;

        let mut names = Vec::with_capacity(template.sizes.len());
        for size in &template.sizes {
            let name = template.template_name(size);
            let found = existing
                .iter()
                .any(|t| t.name == name && owned_by(t, &ctx.request_id));
            if !found {
                return Err(WorkerError::NotFound(format!(
                    "Could not find template {} size {}",
                    template.name, size.name
                )));
            }
            names.push(name);
        }

        info!(name = %template.name, sizes = names.len(), "Template ready");
        Ok(json!({
            "templates": names,
            "default": format!("{}-{}", template.name, template.default_size_name),
        }))
    }
}

#[async_trait]
impl StageHandler for TemplateEndHandler {
    fn kind(&self) -> RequestKind {
        RequestKind::Template
    }

    fn stage(&self) -> Stage {
        Stage::End
    }

    async fn handle(&self, ctx: &StageContext) -> StageOutcome {
        self.finish(ctx).await.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrate_identity::Credentials;

    fn spec() -> TemplateSpec {
        TemplateSpec::from_parameters(&json!({
            "name": "render",
            "image_project": "tenant-p1",
            "image_family": "studio-base",
            "default_size_name": "small",
            "sizes": [
                {"name": "small", "cpus": 4, "memory": 16, "disk_size": 200,
                 "gpu_type": "nvidia-tesla-t4-vws", "gpu_count": 1},
                {"name": "cpu", "cpus": 8, "memory": 32, "disk_size": 100}
            ],
            "metadata": [{"key": "orchestrate_network", "value": "spoofed"}],
            "instance_name_pattern": "{type}-{region}-{user}"
        }))
        .unwrap()
    }

    fn ctx() -> StageContext {
        StageContext {
            request_id: "req-1".to_string(),
            stage: Stage::Start,
            attempt: 1,
            target_project: "tenant-p1".to_string(),
            parameters: json!({}),
            credentials: Credentials {
                project_id: "tenant-p1".to_string(),
                service_account_email: "orchestrate@tenant-p1.iam.gserviceaccount.com"
                    .to_string(),
                api_key: "key".to_string(),
            },
        }
    }

    #[test]
    fn test_defaults() {
        let template = spec();
        assert_eq!(template.zone, "us-central1-a");
        assert_eq!(template.network, "default");
        assert_eq!(template.sizes[1].gpu_count, 1);
        assert_eq!(template.sizes[0].machine_type(), "custom-4-16384");
    }

    #[test]
    fn test_build_instance_template() {
        let template = spec();
        let small = build_instance_template(&template, &template.sizes[0], &ctx(), "img");

        assert_eq!(small.name, "render-small");
        assert_eq!(small.machine_type, "n1-standard-8");
        assert_eq!(small.accelerators.len(), 1);
        assert_eq!(small.metadata_value("orchestrate_default_size"), Some("true"));
        assert_eq!(small.metadata_value("orchestrate_machine_type"), Some("custom-4-16384"));
        assert_eq!(
            small.metadata_value("orchestrate_instance_name_pattern"),
            Some("{type}-{region}-{user}")
        );

        // User metadata precedes the orchestrate entries
        let networks: Vec<&str> = small
            .metadata
            .iter()
            .filter(|(k, _)| k == "orchestrate_network")
            .map(|(_, v)| v.as_str())
            .collect();
        assert_eq!(networks, vec!["spoofed", "default"]);

        let cpu = build_instance_template(&template, &template.sizes[1], &ctx(), "img");
        assert!(cpu.accelerators.is_empty());
        assert_eq!(cpu.metadata_value("orchestrate_default_size"), Some("false"));
    }
}
