//! Image provisioning stages.
//!
//! Start boots a GPU build machine from the base image family; software is
//! installed by the machine's startup script. End turns the build machine's
//! disk into a versioned image and removes the machine.

use crate::error::{Result, WorkerError};
use crate::handler::{StageContext, StageHandler, StageOutcome};
use crate::provider::{Accelerator, ComputeProvider, Image, ImageCreate, InstanceSpec};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use orchestrate_engine::{RequestKind, Stage};
use orchestrate_identity::Credentials;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, instrument};

pub const BUILD_MACHINE_TYPE: &str = "custom-6-32768";
const BUILD_MACHINE_PREFIX: &str = "orchestrate-image";
const INSTALL_SCRIPT: &str = "remotedesktopinstall.py";

/// Metadata key and image label tying a resource to the request that made it.
pub const REQUEST_ID_KEY: &str = "orchestrate_request_id";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataItem {
    pub key: String,
    pub value: String,
}

/// Image request parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageSpec {
    pub name: String,
    pub zone: String,
    pub image_project: String,
    pub image_family: String,
    pub network: String,
    pub os_type: String,
    pub disk_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_name: Option<String>,
    /// Installation steps; empty means all of them.
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default)]
    pub metadata: Vec<MetadataItem>,
}

impl ImageSpec {
    pub fn from_parameters(parameters: &Value) -> Result<Self> {
        serde_json::from_value(parameters.clone())
            .map_err(|e| WorkerError::InvalidParameters(e.to_string()))
    }

    pub fn instance_name(&self) -> String {
        self.instance_name
            .clone()
            .unwrap_or_else(|| format!("{}-{}", BUILD_MACHINE_PREFIX, self.name))
    }

    /// `us-central1-a` -> `us-central1`
    pub fn region(&self) -> String {
        self.zone.split('-').take(2).collect::<Vec<_>>().join("-")
    }
}

/// First accelerator with virtual workstation support: a `-vws` variant of a
/// T4 or P4.
pub fn select_gpu_type(accelerator_types: &[String]) -> Option<&str> {
    accelerator_types
        .iter()
        .map(String::as_str)
        .find(|name| {
            let model = name.split('-').nth(2);
            name.ends_with("-vws") && matches!(model, Some("t4") | Some("p4"))
        })
}

/// Image name for a build finished at `now`, e.g. `studio-base-20260301t101500`.
pub fn image_version(name: &str, now: DateTime<Utc>) -> String {
    format!("{}-{}", name, now.format("%Y%m%dt%H%M%S"))
}

pub fn build_instance_spec(
    image: &ImageSpec,
    ctx: &StageContext,
    orchestrate_project: &str,
    accelerator: &str,
    source_image: &str,
) -> Result<InstanceSpec> {
    let project = &ctx.target_project;
    let zone_url = format!("projects/{}/zones/{}", project, image.zone);
    let region_url = format!("projects/{}/regions/{}", project, image.region());

    let mut metadata = vec![
        (REQUEST_ID_KEY.to_string(), ctx.request_id.clone()),
        (
            "orchestrate_project".to_string(),
            orchestrate_project.to_string(),
        ),
        (
            "orchestrate_image".to_string(),
            STANDARD.encode(serde_json::to_vec(image)?),
        ),
        (
            "startup-script-url".to_string(),
            format!("gs://{}/{}", orchestrate_project, INSTALL_SCRIPT),
        ),
    ];
    metadata.extend(
        image
            .metadata
            .iter()
            .map(|item| (item.key.clone(), item.value.clone())),
    );
    if !image.steps.is_empty() {
        metadata.push(("steps".to_string(), image.steps.join(":")));
    }

    Ok(InstanceSpec {
        name: image.instance_name(),
        zone: image.zone.clone(),
        machine_type: format!("{}/machineTypes/{}", zone_url, BUILD_MACHINE_TYPE),
        accelerators: vec![Accelerator {
            accelerator_type: format!("{}/acceleratorTypes/{}", zone_url, accelerator),
            count: 1,
        }],
        source_image: source_image.to_string(),
        disk_size_gb: image.disk_size,
        subnetwork: format!("{}/subnetworks/{}", region_url, image.network),
        external_ip: true,
        metadata,
        service_account: ctx.credentials.service_account_email.clone(),
        deletion_protection: true,
        description: "Orchestrate temporary provisioning image.".to_string(),
    })
}

/// Boots the build machine. A machine left by an earlier attempt of the same
/// request counts as started.
pub struct ImageStartHandler {
    provider: Arc<dyn ComputeProvider>,
    orchestrate_project: String,
}

impl ImageStartHandler {
    pub fn new(provider: Arc<dyn ComputeProvider>, orchestrate_project: impl Into<String>) -> Self {
        Self {
            provider,
            orchestrate_project: orchestrate_project.into(),
        }
    }

    #[instrument(skip(self, ctx), fields(request_id = %ctx.request_id, attempt = ctx.attempt))]
    async fn start(&self, ctx: &StageContext) -> Result<Value> {
        let image = ImageSpec::from_parameters(&ctx.parameters)?;
        let creds: &Credentials = &ctx.credentials;
        let steps = if image.steps.is_empty() {
            "all".to_string()
        } else {
            image.steps.join(", ")
        };
        info!(name = %image.name, project = %ctx.target_project, steps = %steps, "Provisioning image");

        let source_image = self
            .provider
            .latest_image(creds, &image.image_project, &image.image_family)
            .await?;

        let accelerators = self
            .provider
            .list_accelerator_types(creds, &image.zone)
            .await?;
        let gpu = select_gpu_type(&accelerators).ok_or_else(|| {
            WorkerError::Provisioning(format!(
                "There are no suitable GPU types with Virtual Workstation support available \
                 in project {} zone {} to create the build machine for image {}. \
                 Consider creating the image in a different zone.",
                ctx.target_project, image.zone, image.name
            ))
        })?;

        let spec = build_instance_spec(&image, ctx, &self.orchestrate_project, gpu, &source_image)?;

        match self.provider.insert_instance(creds, &spec).await {
            Ok(()) => info!(instance = %spec.name, gpu, "Build machine started"),
            Err(WorkerError::Conflict(_)) => {
                let existing = self
                    .provider
                    .get_instance(creds, &image.zone, &spec.name)
                    .await?;
                let owner = existing
                    .as_ref()
                    .and_then(|machine| machine.spec.metadata_value(REQUEST_ID_KEY));
                if owner != Some(ctx.request_id.as_str()) {
                    return Err(WorkerError::Provisioning(format!(
                        "An image with name {} appears to be currently being created. Or, a \
                         previous attempt failed and the build machine {} is still around.",
                        image.name, spec.name
                    )));
                }
                info!(instance = %spec.name, "Build machine already started by an earlier attempt");
            }
            Err(e) => return Err(e),
        }

        Ok(json!({
            "instance_name": spec.name,
            "source_image": source_image,
            "accelerator_type": gpu,
        }))
    }
}

#[async_trait]
impl StageHandler for ImageStartHandler {
    fn kind(&self) -> RequestKind {
        RequestKind::Image
    }

    fn stage(&self) -> Stage {
        Stage::Start
    }

    async fn handle(&self, ctx: &StageContext) -> StageOutcome {
        self.start(ctx).await.into()
    }
}

/// Captures the build machine's disk as an image and removes the machine.
///
/// An image labelled with the request id means an earlier attempt got that
/// far; only the leftover machine is cleaned up.
pub struct ImageEndHandler {
    provider: Arc<dyn ComputeProvider>,
}

impl ImageEndHandler {
    pub fn new(provider: Arc<dyn ComputeProvider>) -> Self {
        Self { provider }
    }

    async fn built_image(
        &self,
        creds: &Credentials,
        family: &str,
        request_id: &str,
    ) -> Result<Option<Image>> {
        let images = self.provider.list_images(creds, family).await?;
        Ok(images.into_iter().rev().find(|image| {
            image.labels.get(REQUEST_ID_KEY).map(String::as_str) == Some(request_id)
        }))
    }

    async fn remove_build_machine(
        &self,
        creds: &Credentials,
        zone: &str,
        instance: &str,
        request_id: &str,
    ) -> Result<()> {
        let Some(machine) = self.provider.get_instance(creds, zone, instance).await? else {
            return Ok(());
        };
        if machine.spec.metadata_value(REQUEST_ID_KEY) != Some(request_id) {
            return Ok(());
        }

        if machine.deletion_protection {
            self.provider
                .set_deletion_protection(creds, zone, instance, false)
                .await?;
        }
        self.provider.delete_instance(creds, zone, instance).await
    }

    #[instrument(skip(self, ctx), fields(request_id = %ctx.request_id, attempt = ctx.attempt))]
    async fn finish(&self, ctx: &StageContext) -> Result<Value> {
        let image = ImageSpec::from_parameters(&ctx.parameters)?;
        let creds = &ctx.credentials;
        let instance = image.instance_name();
        if let Some(existing) = self
            .built_image(creds, &image.name, &ctx.request_id)
            .await?
        {
            info!(image = %existing.name, "Image already created by an earlier attempt");
            self.remove_build_machine(creds, &image.zone, &instance, &ctx.request_id)
                .await?;
            return Ok(json!({ "image": existing.name, "family": image.name }));
        }

        info!(name = %image.name, instance = %instance, "Creating image from build machine");

        self.provider
            .stop_instance(creds, &image.zone, &instance)
            .await?;

        let version = image_version(&image.name, Utc::now());
        let labels = BTreeMap::from([
            ("orchestrate_os".to_string(), image.os_type.to_lowercase()),
            (REQUEST_ID_KEY.to_string(), ctx.request_id.clone()),
        ]);
        self.provider
            .create_image(
                creds,
                &ImageCreate {
                    name: version.clone(),
                    family: image.name.clone(),
                    source_disk: format!(
                        "projects/{}/zones/{}/disks/{}",
                        ctx.target_project, image.zone, instance
                    ),
                    labels,
                    description: "Orchestrate image.".to_string(),
                },
            )
            .await?;

        self.provider
            .set_deletion_protection(creds, &image.zone, &instance, false)
            .await?;
        self.provider
            .delete_instance(creds, &image.zone, &instance)
            .await?;

        info!(image = %version, family = %image.name, "Image created");
        Ok(json!({ "image": version, "family": image.name }))
    }
}

#[async_trait]
impl StageHandler for ImageEndHandler {
    fn kind(&self) -> RequestKind {
        RequestKind::Image
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
    use chrono::TimeZone;

    fn spec() -> ImageSpec {
        ImageSpec::from_parameters(&json!({
            "name": "studio-base",
            "zone": "us-west2-b",
            "image_project": "windows-cloud",
            "image_family": "windows-2019",
            "network": "workstations",
            "os_type": "Windows",
            "disk_size": 200,
            "steps": ["drivers", "remotedesktop"],
            "metadata": [{"key": "license", "value": "abc"}]
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
    fn test_instance_name_and_region() {
        let mut image = spec();
        assert_eq!(image.instance_name(), "orchestrate-image-studio-base");
        assert_eq!(image.region(), "us-west2");

        image.instance_name = Some("custom-builder".to_string());
        assert_eq!(image.instance_name(), "custom-builder");
    }

    #[test]
    fn test_select_gpu_type() {
        let types: Vec<String> = ["nvidia-tesla-k80", "nvidia-tesla-v100-vws", "nvidia-tesla-p4-vws"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(select_gpu_type(&types), Some("nvidia-tesla-p4-vws"));

        let no_vws = vec!["nvidia-tesla-t4".to_string()];
        assert_eq!(select_gpu_type(&no_vws), None);
    }

    #[test]
    fn test_image_version() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 10, 15, 0).unwrap();
        assert_eq!(image_version("studio-base", now), "studio-base-20260301t101500");
    }

    #[test]
    fn test_build_instance_spec() {
        let spec = build_instance_spec(
            &spec(),
            &ctx(),
            "orchestrate-main",
            "nvidia-tesla-t4-vws",
            "projects/windows-cloud/global/images/windows-2019-v1",
        )
        .unwrap();

        assert_eq!(spec.name, "orchestrate-image-studio-base");
        assert_eq!(
            spec.accelerators[0].accelerator_type,
            "projects/tenant-p1/zones/us-west2-b/acceleratorTypes/nvidia-tesla-t4-vws"
        );
        assert!(spec.external_ip);
        assert_eq!(
            spec.subnetwork,
            "projects/tenant-p1/regions/us-west2/subnetworks/workstations"
        );
        assert!(spec.deletion_protection);

        let keys: Vec<&str> = spec.metadata.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                "orchestrate_request_id",
                "orchestrate_project",
                "orchestrate_image",
                "startup-script-url",
                "license",
                "steps"
            ]
        );
        assert!(spec
            .metadata
            .contains(&("steps".to_string(), "drivers:remotedesktop".to_string())));
        assert!(spec.metadata.contains(&(
            "startup-script-url".to_string(),
            "gs://orchestrate-main/remotedesktopinstall.py".to_string()
        )));
    }

    #[test]
    fn test_bad_parameters() {
        let err = ImageSpec::from_parameters(&json!({"name": "x"})).unwrap_err();
        assert!(matches!(err, WorkerError::InvalidParameters(_)));
    }
}
