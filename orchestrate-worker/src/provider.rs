//! Compute provider abstraction.
//!
//! Every call acts inside the project of the credentials it is given.

use crate::error::{Result, WorkerError};
use async_trait::async_trait;
use orchestrate_identity::Credentials;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Accelerator {
    pub accelerator_type: String,
    pub count: u32,
}

/// Instance creation parameters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceSpec {
    pub name: String,
    pub zone: String,
    pub machine_type: String,
    pub accelerators: Vec<Accelerator>,
    pub source_image: String,
    pub disk_size_gb: u64,
    pub subnetwork: String,
    /// Attach a one-to-one NAT address.
    pub external_ip: bool,
    pub metadata: Vec<(String, String)>,
    pub service_account: String,
    pub deletion_protection: bool,
    pub description: String,
}

impl InstanceSpec {
    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        metadata_value(&self.metadata, key)
    }
}

/// An instance as the provider reports it.
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    pub spec: InstanceSpec,
    pub running: bool,
    pub deletion_protection: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageCreate {
    pub name: String,
    pub family: String,
    pub source_disk: String,
    pub labels: BTreeMap<String, String>,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Image {
    pub name: String,
    pub self_link: String,
    pub family: String,
    pub labels: BTreeMap<String, String>,
}

/// Instance template. Sizes and network are names here, not URLs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceTemplate {
    pub name: String,
    pub description: String,
    pub machine_type: String,
    pub accelerators: Vec<Accelerator>,
    pub source_image: String,
    pub disk_size_gb: u64,
    pub network: String,
    pub metadata: Vec<(String, String)>,
    pub service_account: String,
}

impl InstanceTemplate {
    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        metadata_value(&self.metadata, key)
    }
}

fn metadata_value<'a>(metadata: &'a [(String, String)], key: &str) -> Option<&'a str> {
    metadata
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

#[async_trait]
pub trait ComputeProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Accelerator type names available in `zone`.
    async fn list_accelerator_types(&self, creds: &Credentials, zone: &str)
        -> Result<Vec<String>>;

    /// Self link of the newest image in `family`.
    async fn latest_image(&self, creds: &Credentials, project: &str, family: &str)
        -> Result<String>;

    /// Image behind a self link. Fails with `WorkerError::NotFound`.
    async fn get_image(&self, creds: &Credentials, self_link: &str) -> Result<Image>;

    /// Images of `family` in the credentials' project, oldest first.
    async fn list_images(&self, creds: &Credentials, family: &str) -> Result<Vec<Image>>;

    async fn get_instance(&self, creds: &Credentials, zone: &str, name: &str)
        -> Result<Option<Instance>>;

    /// Fails with `WorkerError::Conflict` if the name is taken.
    async fn insert_instance(&self, creds: &Credentials, spec: &InstanceSpec) -> Result<()>;

    async fn stop_instance(&self, creds: &Credentials, zone: &str, name: &str) -> Result<()>;

    async fn create_image(&self, creds: &Credentials, image: &ImageCreate) -> Result<()>;

    async fn set_deletion_protection(
        &self,
        creds: &Credentials,
        zone: &str,
        name: &str,
        protected: bool,
    ) -> Result<()>;

    async fn delete_instance(&self, creds: &Credentials, zone: &str, name: &str) -> Result<()>;

    /// Fails with `WorkerError::Conflict` if the name is taken.
    async fn insert_instance_template(
        &self,
        creds: &Credentials,
        template: &InstanceTemplate,
    ) -> Result<()>;

    async fn get_instance_template(&self, creds: &Credentials, name: &str)
        -> Result<Option<InstanceTemplate>>;

    /// Fails with `WorkerError::NotFound`.
    async fn delete_instance_template(&self, creds: &Credentials, name: &str) -> Result<()>;

    /// Templates whose name starts with `prefix`, sorted by name.
    async fn list_instance_templates(&self, creds: &Credentials, prefix: &str)
        -> Result<Vec<InstanceTemplate>>;
}

type ProjectKey = (String, String);

#[derive(Default)]
struct DryRunState {
    instances: HashMap<ProjectKey, Instance>,
    images: Vec<(String, ImageCreate)>,
    templates: HashMap<ProjectKey, InstanceTemplate>,
    operations: Vec<String>,
}

fn image_link(project: &str, name: &str) -> String {
    format!("projects/{}/global/images/{}", project, name)
}

fn family_link(project: &str, family: &str) -> String {
    format!("projects/{}/global/images/family/{}", project, family)
}

/// Provider that keeps resources in memory and logs every call.
///
/// Families without a recorded image resolve to a family link, which stands
/// in for the public base images.
pub struct DryRunProvider {
    accelerator_types: Vec<String>,
    state: Mutex<DryRunState>,
}

impl Default for DryRunProvider {
    fn default() -> Self {
        Self::with_accelerators(
            ["nvidia-tesla-k80", "nvidia-tesla-t4", "nvidia-tesla-t4-vws"]
                .into_iter()
                .map(String::from)
                .collect(),
        )
    }
}

impl DryRunProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_accelerators(accelerator_types: Vec<String>) -> Self {
        Self {
            accelerator_types,
            state: Mutex::new(DryRunState::default()),
        }
    }

    /// Calls made so far, e.g. `insert_instance tenant-p1/orchestrate-image-base`.
    pub async fn operations(&self) -> Vec<String> {
        self.state.lock().await.operations.clone()
    }

    pub async fn instance(&self, project: &str, name: &str) -> Option<Instance> {
        self.state
            .lock()
            .await
            .instances
            .get(&(project.to_string(), name.to_string()))
            .cloned()
    }

    pub async fn images(&self, project: &str) -> Vec<ImageCreate> {
        self.state
            .lock()
            .await
            .images
            .iter()
            .filter(|(p, _)| p == project)
            .map(|(_, image)| image.clone())
            .collect()
    }

    pub async fn template(&self, project: &str, name: &str) -> Option<InstanceTemplate> {
        self.state
            .lock()
            .await
            .templates
            .get(&(project.to_string(), name.to_string()))
            .cloned()
    }

    fn record(&self, state: &mut DryRunState, creds: &Credentials, op: &str, resource: &str) {
        info!(
            provider = self.name(),
            project = %creds.project_id,
            account = %creds.service_account_email,
            "{} {}",
            op,
            resource
        );
        state
            .operations
            .push(format!("{} {}/{}", op, creds.project_id, resource));
    }
}

fn to_image(project: &str, image: &ImageCreate) -> Image {
    Image {
        name: image.name.clone(),
        self_link: image_link(project, &image.name),
        family: image.family.clone(),
        labels: image.labels.clone(),
    }
}

#[async_trait]
impl ComputeProvider for DryRunProvider {
    fn name(&self) -> &'static str {
        "dry-run"
    }

    async fn list_accelerator_types(
        &self,
        _creds: &Credentials,
        _zone: &str,
    ) -> Result<Vec<String>> {
        Ok(self.accelerator_types.clone())
    }

    async fn latest_image(
        &self,
        _creds: &Credentials,
        project: &str,
        family: &str,
    ) -> Result<String> {
        let state = self.state.lock().await;
        let newest = state
            .images
            .iter()
            .rev()
            .find(|(p, image)| p == project && image.family == family);

        Ok(match newest {
            Some((_, image)) => image_link(project, &image.name),
            None => family_link(project, family),
        })
    }

    async fn get_image(&self, _creds: &Credentials, self_link: &str) -> Result<Image> {
        let state = self.state.lock().await;
        if let Some((project, image)) = state
            .images
            .iter()
            .find(|(p, image)| image_link(p, &image.name) == self_link)
        {
            return Ok(to_image(project, image));
        }

        match self_link.split_once("/global/images/family/") {
            Some((_, family)) => Ok(Image {
                name: family.to_string(),
                self_link: self_link.to_string(),
                family: family.to_string(),
                labels: BTreeMap::new(),
            }),
            None => Err(WorkerError::NotFound(self_link.to_string())),
        }
    }

    async fn list_images(&self, creds: &Credentials, family: &str) -> Result<Vec<Image>> {
        let state = self.state.lock().await;
        Ok(state
            .images
            .iter()
            .filter(|(p, image)| p == &creds.project_id && image.family == family)
            .map(|(p, image)| to_image(p, image))
            .collect())
    }

    async fn get_instance(
        &self,
        creds: &Credentials,
        _zone: &str,
        name: &str,
    ) -> Result<Option<Instance>> {
        Ok(self.instance(&creds.project_id, name).await)
    }

    async fn insert_instance(&self, creds: &Credentials, spec: &InstanceSpec) -> Result<()> {
        let mut state = self.state.lock().await;
        let key = (creds.project_id.clone(), spec.name.clone());
        if state.instances.contains_key(&key) {
            return Err(WorkerError::Conflict(spec.name.clone()));
        }

        self.record(&mut state, creds, "insert_instance", &spec.name);
        state.instances.insert(
            key,
            Instance {
                spec: spec.clone(),
                running: true,
                deletion_protection: spec.deletion_protection,
            },
        );
        Ok(())
    }

    async fn stop_instance(&self, creds: &Credentials, _zone: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let key = (creds.project_id.clone(), name.to_string());
        let instance = state
            .instances
            .get_mut(&key)
            .ok_or_else(|| WorkerError::NotFound(name.to_string()))?;
        instance.running = false;

        self.record(&mut state, creds, "stop_instance", name);
        Ok(())
    }

    async fn create_image(&self, creds: &Credentials, image: &ImageCreate) -> Result<()> {
        let mut state = self.state.lock().await;
        let taken = state
            .images
            .iter()
            .any(|(p, existing)| p == &creds.project_id && existing.name == image.name);
        if taken {
            return Err(WorkerError::Conflict(image.name.clone()));
        }

        self.record(&mut state, creds, "create_image", &image.name);
        state
            .images
            .push((creds.project_id.clone(), image.clone()));
        Ok(())
    }

    async fn set_deletion_protection(
        &self,
        creds: &Credentials,
        _zone: &str,
        name: &str,
        protected: bool,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let key = (creds.project_id.clone(), name.to_string());
        let instance = state
            .instances
            .get_mut(&key)
            .ok_or_else(|| WorkerError::NotFound(name.to_string()))?;
        instance.deletion_protection = protected;

        self.record(&mut state, creds, "set_deletion_protection", name);
        Ok(())
    }

    async fn delete_instance(&self, creds: &Credentials, _zone: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let key = (creds.project_id.clone(), name.to_string());
        match state.instances.get(&key) {
            None => return Err(WorkerError::NotFound(name.to_string())),
            Some(instance) if instance.deletion_protection => {
                return Err(WorkerError::Provider(format!(
                    "instance {} has deletion protection enabled",
                    name
                )));
            }
            Some(_) => {}
        }

        state.instances.remove(&key);
        self.record(&mut state, creds, "delete_instance", name);
        Ok(())
    }

    async fn insert_instance_template(
        &self,
        creds: &Credentials,
        template: &InstanceTemplate,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let key = (creds.project_id.clone(), template.name.clone());
        if state.templates.contains_key(&key) {
            return Err(WorkerError::Conflict(template.name.clone()));
        }

        self.record(&mut state, creds, "insert_instance_template", &template.name);
        state.templates.insert(key, template.clone());
        Ok(())
    }

    async fn get_instance_template(
        &self,
        creds: &Credentials,
        name: &str,
    ) -> Result<Option<InstanceTemplate>> {
        Ok(self.template(&creds.project_id, name).await)
    }

    async fn delete_instance_template(&self, creds: &Credentials, name: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let key = (creds.project_id.clone(), name.to_string());
        if state.templates.remove(&key).is_none() {
            return Err(WorkerError::NotFound(name.to_string()));
        }

        self.record(&mut state, creds, "delete_instance_template", name);
        Ok(())
    }

    async fn list_instance_templates(
        &self,
        creds: &Credentials,
        prefix: &str,
    ) -> Result<Vec<InstanceTemplate>> {
        let state = self.state.lock().await;
        let mut templates: Vec<InstanceTemplate> = state
            .templates
            .iter()
            .filter(|((project, name), _)| project == &creds.project_id && name.starts_with(prefix))
            .map(|(_, template)| template.clone())
            .collect();
        templates.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(templates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> Credentials {
        Credentials {
            project_id: "tenant-p1".to_string(),
            service_account_email: "orchestrate@tenant-p1.iam.gserviceaccount.com".to_string(),
            api_key: "key".to_string(),
        }
    }

    fn spec(name: &str) -> InstanceSpec {
        InstanceSpec {
            name: name.to_string(),
            zone: "us-central1-a".to_string(),
            machine_type: "custom-6-32768".to_string(),
            accelerators: vec![Accelerator {
                accelerator_type: "nvidia-tesla-t4-vws".to_string(),
                count: 1,
            }],
            source_image: "projects/windows-cloud/global/images/family/windows-2019".to_string(),
            disk_size_gb: 200,
            subnetwork: "workstations".to_string(),
            external_ip: true,
            metadata: vec![("orchestrate_request_id".to_string(), "req-1".to_string())],
            service_account: "orchestrate@tenant-p1.iam.gserviceaccount.com".to_string(),
            deletion_protection: true,
            description: "test".to_string(),
        }
    }

    fn image(name: &str, family: &str) -> ImageCreate {
        ImageCreate {
            name: name.to_string(),
            family: family.to_string(),
            source_disk: "projects/tenant-p1/zones/us-central1-a/disks/vm-1".to_string(),
            labels: BTreeMap::from([("orchestrate_os".to_string(), "windows".to_string())]),
            description: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn test_insert_conflict() {
        let provider = DryRunProvider::new();
        provider.insert_instance(&creds(), &spec("vm-1")).await.unwrap();

        let err = provider
            .insert_instance(&creds(), &spec("vm-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Conflict(_)));

        let existing = provider
            .get_instance(&creds(), "us-central1-a", "vm-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(existing.spec.metadata_value("orchestrate_request_id"), Some("req-1"));
    }

    #[tokio::test]
    async fn test_delete_requires_protection_lifted() {
        let provider = DryRunProvider::new();
        let c = creds();
        provider.insert_instance(&c, &spec("vm-1")).await.unwrap();

        assert!(provider
            .delete_instance(&c, "us-central1-a", "vm-1")
            .await
            .is_err());

        provider
            .set_deletion_protection(&c, "us-central1-a", "vm-1", false)
            .await
            .unwrap();
        provider
            .delete_instance(&c, "us-central1-a", "vm-1")
            .await
            .unwrap();

        assert!(provider.instance("tenant-p1", "vm-1").await.is_none());
        assert_eq!(
            provider.operations().await,
            vec![
                "insert_instance tenant-p1/vm-1",
                "set_deletion_protection tenant-p1/vm-1",
                "delete_instance tenant-p1/vm-1",
            ]
        );
    }

    #[tokio::test]
    async fn test_latest_image_prefers_recorded_images() {
        let provider = DryRunProvider::new();
        let c = creds();

        let stock = provider
            .latest_image(&c, "windows-cloud", "windows-2019")
            .await
            .unwrap();
        assert_eq!(stock, "projects/windows-cloud/global/images/family/windows-2019");
        assert_eq!(provider.get_image(&c, &stock).await.unwrap().family, "windows-2019");

        provider.create_image(&c, &image("base-1", "base")).await.unwrap();
        provider.create_image(&c, &image("base-2", "base")).await.unwrap();

        let latest = provider.latest_image(&c, "tenant-p1", "base").await.unwrap();
        assert_eq!(latest, "projects/tenant-p1/global/images/base-2");

        let found = provider.get_image(&c, &latest).await.unwrap();
        assert_eq!(found.labels["orchestrate_os"], "windows");
        assert_eq!(provider.list_images(&c, "base").await.unwrap().len(), 2);

        assert!(matches!(
            provider
                .get_image(&c, "projects/tenant-p1/global/images/missing")
                .await
                .unwrap_err(),
            WorkerError::NotFound(_)
        ));
    }
}
