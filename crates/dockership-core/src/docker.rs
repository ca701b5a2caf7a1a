//! Single-endpoint deploy pipeline.
//!
//! A [`Docker`] drives one engine endpoint through
//! prune images → build → remove containers → run → restart linked dependents.
//! Each step short-circuits the rest on failure and nothing is rolled back.

use std::path::Path;
use std::sync::Arc;

use dockership_types::{Container, DockershipError, Image, ImageId, Project, Result, Revision};

use crate::catalog::Catalog;
use crate::engine::{ContainerSpec, Engine, HostConfig, OutputSink};
use crate::events::{DeployEvent, EventEmitter};

pub struct Docker {
    engine: Arc<dyn Engine>,
    environment: String,
    events: EventEmitter,
}

impl Docker {
    pub fn new(engine: Arc<dyn Engine>, environment: impl Into<String>, events: EventEmitter) -> Self {
        let environment = environment.into();
        tracing::debug!(end_point = engine.endpoint(), environment = %environment, "Connected to docker");
        Self {
            engine,
            environment,
            events,
        }
    }

    pub fn endpoint(&self) -> &str {
        self.engine.endpoint()
    }

    /// Deploy `revision` of `project` on this endpoint.
    ///
    /// Unless `force` is set, an endpoint already running the target image is
    /// left untouched.
    pub async fn deploy(
        &self,
        catalog: &Catalog,
        project: &Project,
        revision: &Revision,
        dockerfile: &[u8],
        output: &OutputSink,
        force: bool,
    ) -> Result<()> {
        tracing::debug!(
            project = %project.name,
            revision = %revision.get_short(),
            end_point = self.endpoint(),
            "Deploying dockerfile"
        );

        let image = project.image_name(revision);
        if !force && self.is_running_image(project, &image).await? {
            tracing::info!(
                project = %project.name,
                image = %image,
                end_point = self.endpoint(),
                "Revision already running, skipping"
            );
            self.events.emit(DeployEvent::DeploySkipped {
                project: project.name.clone(),
                endpoint: self.endpoint().to_string(),
                image: image.to_string(),
            });
            return Ok(());
        }

        self.clean_images(project).await?;
        self.build_image(project, revision, dockerfile, output).await?;
        self.clean_containers(project).await?;
        self.run(catalog, project, revision).await
    }

    /// Remove every container of `project`, then prune its images down to
    /// `history`.
    pub async fn clean(&self, project: &Project) -> Result<()> {
        self.clean_containers(project).await?;
        self.clean_images(project).await
    }

    async fn is_running_image(&self, project: &Project, image: &ImageId) -> Result<bool> {
        let containers = self.list_containers(project).await?;
        Ok(containers
            .iter()
            .any(|c| c.is_running() && c.image == *image))
    }

    /// Drop the oldest images of `project` so at most `history` remain.
    pub async fn clean_images(&self, project: &Project) -> Result<()> {
        let keep = project.history.max(0) as usize;
        let images = self.list_images(project).await?;
        if images.len() <= keep {
            return Ok(());
        }

        let excess = images.len() - keep;
        tracing::debug!(project = %project.name, count = excess, end_point = self.endpoint(), "Removing old images");
        for image in &images[..excess] {
            tracing::debug!(project = %project.name, image = %image.id, end_point = self.endpoint(), "Removing image");
            self.engine.remove_image(&image.id).await?;
        }

        self.events.emit(DeployEvent::ImagesPruned {
            project: project.name.clone(),
            endpoint: self.endpoint().to_string(),
            removed: excess,
        });
        Ok(())
    }

    /// Kill the running containers of `project` and remove all of them.
    pub async fn clean_containers(&self, project: &Project) -> Result<()> {
        let containers = self.list_containers(project).await?;
        tracing::debug!(project = %project.name, count = containers.len(), end_point = self.endpoint(), "Cleaning containers");

        for container in &containers {
            if container.is_running() {
                tracing::debug!(project = %project.name, container = container.short_id(), end_point = self.endpoint(), "Stopping container");
                self.engine.kill_container(&container.id).await?;
            }

            tracing::debug!(project = %project.name, container = container.short_id(), end_point = self.endpoint(), "Removing container");
            self.engine.remove_container(&container.id).await?;
        }

        if !containers.is_empty() {
            self.events.emit(DeployEvent::ContainersRemoved {
                project: project.name.clone(),
                endpoint: self.endpoint().to_string(),
                removed: containers.len(),
            });
        }
        Ok(())
    }

    /// Containers of `project` on this endpoint, oldest first.
    pub async fn list_containers(&self, project: &Project) -> Result<Vec<Container>> {
        tracing::debug!(project = %project.name, end_point = self.endpoint(), "Retrieving current containers");

        let mut containers: Vec<Container> = self
            .engine
            .list_containers()
            .await?
            .into_iter()
            .filter(|c| c.belongs_to(&project.name))
            .collect();
        containers.sort_by_key(|c| c.created);
        Ok(containers)
    }

    /// Images of `project` on this endpoint, oldest first.
    pub async fn list_images(&self, project: &Project) -> Result<Vec<Image>> {
        tracing::debug!(project = %project.name, end_point = self.endpoint(), "Retrieving current images");

        let mut images: Vec<Image> = self
            .engine
            .list_images()
            .await?
            .into_iter()
            .filter(|i| i.belongs_to(&project.name))
            .collect();
        images.sort_by_key(|i| i.created);
        Ok(images)
    }

    pub async fn build_image(
        &self,
        project: &Project,
        revision: &Revision,
        dockerfile: &[u8],
        output: &OutputSink,
    ) -> Result<()> {
        tracing::debug!(project = %project.name, revision = %revision.get_short(), end_point = self.endpoint(), "Building image");

        let context = build_context(project, dockerfile)?;
        let image = project.image_name(revision);
        self.engine
            .build_image(&image, context, project.no_cache, output)
            .await?;

        self.events.emit(DeployEvent::ImageBuilt {
            project: project.name.clone(),
            endpoint: self.endpoint().to_string(),
            image: image.to_string(),
        });
        Ok(())
    }

    /// Create and start the project's container from the image of `revision`,
    /// then restart the containers of every project linking to it.
    pub async fn run(&self, catalog: &Catalog, project: &Project, revision: &Revision) -> Result<()> {
        let image = project.image_name(revision);
        let host_config = HostConfig::for_project(project, &self.environment);
        let spec = ContainerSpec {
            name: project.name.clone(),
            image: image.clone(),
            volumes: project.volumes.clone(),
            host_config: host_config.clone(),
        };

        tracing::debug!(project = %project.name, revision = %revision.get_short(), end_point = self.endpoint(), "Creating container from image");
        let id = self.engine.create_container(&spec).await?;
        let short_id: String = id.chars().take(12).collect();

        tracing::info!(
            project = %project.name,
            revision = %revision.get_short(),
            container = %short_id,
            end_point = self.endpoint(),
            "Running new container"
        );
        self.engine.start_container(&id, &host_config).await?;

        self.events.emit(DeployEvent::ContainerStarted {
            project: project.name.clone(),
            endpoint: self.endpoint().to_string(),
            container: short_id,
            image: image.to_string(),
        });

        self.restart_linked_containers(catalog, project).await
    }

    /// Restart in place the running containers of every project that links to
    /// `project`. Every dependent is attempted; any failure yields
    /// [`DockershipError::CascadeRestart`] once all are done.
    pub async fn restart_linked_containers(&self, catalog: &Catalog, project: &Project) -> Result<()> {
        let mut failed = Vec::new();
        for linked in catalog.linked_by(project) {
            let containers = match self.list_containers(linked).await {
                Ok(containers) => containers,
                Err(err) => {
                    tracing::error!(project = %project.name, linked = %linked.name, error = %err, end_point = self.endpoint(), "Unable to list linked containers");
                    failed.push(linked.name.clone());
                    continue;
                }
            };

            for container in &containers {
                if let Err(err) = self.restart_container(linked, container).await {
                    tracing::error!(project = %linked.name, container = container.short_id(), error = %err, end_point = self.endpoint(), "Unable to restart container");
                    failed.push(container.short_id().to_string());
                }
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(DockershipError::CascadeRestart { containers: failed })
        }
    }

    /// Kill and start `container` again with its project's host settings.
    /// Stopped containers are left alone.
    pub async fn restart_container(&self, project: &Project, container: &Container) -> Result<()> {
        if !container.is_running() {
            return Ok(());
        }

        tracing::info!(project = %project.name, container = container.short_id(), end_point = self.endpoint(), "Restarting linked container");
        self.engine.kill_container(&container.id).await?;
        self.engine
            .start_container(&container.id, &HostConfig::for_project(project, &self.environment))
            .await?;

        self.events.emit(DeployEvent::LinkedContainerRestarted {
            project: project.name.clone(),
            endpoint: self.endpoint().to_string(),
            container: container.short_id().to_string(),
        });
        Ok(())
    }
}

/// Tar build context: the rendered `Dockerfile` plus every auxiliary file of
/// the project under its base name.
pub fn build_context(project: &Project, dockerfile: &[u8]) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());

    let mut header = tar::Header::new_gnu();
    header.set_size(dockerfile.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);
    header.set_cksum();
    builder.append_data(&mut header, "Dockerfile", dockerfile)?;

    for file in &project.files {
        let name = base_name(file)?;
        builder.append_path_with_name(file, name)?;
    }

    Ok(builder.into_inner()?)
}

fn base_name(path: &Path) -> Result<&std::ffi::OsStr> {
    path.file_name().ok_or_else(|| {
        DockershipError::Config(format!("build file {} has no file name", path.display()))
    })
}
