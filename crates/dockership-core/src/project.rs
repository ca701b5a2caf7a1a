//! Per-request orchestration: deploy, status, listing and clean.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::task::JoinHandle;

use dockership_types::{
    Container, DockershipError, Environment, Image, ImageId, Project, Result, Revision, Task,
};

use crate::catalog::Catalog;
use crate::connector::{Connector, WebhookPayload, WebhookSink};
use crate::dockerfile::{self, TemplateContext};
use crate::engine::OutputSink;
use crate::events::{DeployEvent, EventEmitter, LogLevel};
use crate::group::DockerGroup;
use crate::source::{fetch_dockerfile, resolve_revision};

/// Outcome of one deploy request.
#[derive(Debug)]
pub struct DeployReport {
    pub project: String,
    pub environment: String,
    /// `None` when the revision could not be resolved.
    pub revision: Option<Revision>,
    /// One entry per failing endpoint, or a single source/setup error.
    pub errors: Vec<DockershipError>,
    /// Background webhook call, when the project has one configured.
    pub webhook: Option<JoinHandle<()>>,
}

impl DeployReport {
    /// True when every error is soft, i.e. the new containers are running.
    pub fn is_success(&self) -> bool {
        self.errors.iter().all(DockershipError::is_soft)
    }
}

/// Source revision versus what the endpoints actually run.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectStatus {
    pub environment: String,
    pub last_revision: Revision,
    /// Image a deploy of `last_revision` would produce.
    pub expected_image: ImageId,
    pub containers: Vec<Container>,
    pub running_containers: Vec<Container>,
    pub images: Vec<Image>,
}

impl ProjectStatus {
    /// The running container built from `last_revision`, if any.
    pub fn matching_container(&self) -> Option<&Container> {
        self.running_containers
            .iter()
            .find(|c| c.image == self.expected_image)
    }

    /// Revision part of the first running container's image.
    pub fn running_revision(&self) -> Option<&str> {
        running_revision(&self.running_containers)
    }

    pub fn is_up_to_date(&self) -> bool {
        self.matching_container().is_some()
    }
}

fn running_revision(containers: &[Container]) -> Option<&str> {
    containers
        .iter()
        .find(|c| c.is_running())
        .map(|c| c.image.revision_part())
        .filter(|rev| !rev.is_empty())
}

/// Entry point binding the catalog, the collaborators and the event stream.
#[derive(Clone)]
pub struct Dockership {
    catalog: Arc<Catalog>,
    connector: Arc<dyn Connector>,
    events: EventEmitter,
}

impl Dockership {
    pub fn new(catalog: Catalog, connector: Arc<dyn Connector>, events: EventEmitter) -> Self {
        Self {
            catalog: Arc::new(catalog),
            connector,
            events,
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    fn group(&self, environment: &Environment) -> Result<DockerGroup> {
        DockerGroup::new(environment, self.connector.as_ref(), &self.events)
    }

    /// Deploy the head revision of `project` to every endpoint of
    /// `environment`.
    ///
    /// Unknown names and an already running deploy of the same target are
    /// returned as `Err`; everything that happens once the deploy has started
    /// is collected in the report.
    pub async fn deploy(
        &self,
        project: &str,
        environment: &str,
        output: &OutputSink,
        force: bool,
    ) -> Result<DeployReport> {
        let project = self.catalog.project(project)?;
        let environment = self.catalog.environment_for(project, environment)?;
        let guard = project
            .task_status
            .start(&project.name, &environment.name, Task::Deploy)?;

        self.events.emit(DeployEvent::TaskStarted {
            project: project.name.clone(),
            environment: environment.name.clone(),
            task: Task::Deploy,
        });
        let started = Instant::now();

        let webhook = match (&project.webhook, self.connector.webhook()) {
            (Some(url), Some(sink)) => Some((url.clone(), sink)),
            _ => None,
        };
        let previous_revision = match webhook {
            Some(_) => self.current_running_revision(project, environment).await,
            None => None,
        };

        let (revision, errors) = match self.deploy_head(project, environment, output, force).await {
            Ok((revision, errors)) => (Some(revision), errors),
            Err(err) => (None, vec![err]),
        };
        drop(guard);

        let messages: Vec<String> = errors.iter().map(ToString::to_string).collect();
        self.events.emit(DeployEvent::TaskFinished {
            project: project.name.clone(),
            environment: environment.name.clone(),
            task: Task::Deploy,
            errors: messages.clone(),
            duration_ms: started.elapsed().as_millis() as u64,
        });

        let mut report = DeployReport {
            project: project.name.clone(),
            environment: environment.name.clone(),
            revision,
            errors,
            webhook: None,
        };
        if report.is_success() {
            self.events
                .log(LogLevel::Info, Some(project.name.as_str()), "Deploy finished");
        } else {
            self.events.log(
                LogLevel::Error,
                Some(project.name.as_str()),
                format!("Deploy failed: {}", messages.join("; ")),
            );
        }

        if let Some((url, sink)) = webhook {
            report.webhook =
                Some(self.spawn_webhook(url, sink, project, environment, previous_revision, messages));
        }

        Ok(report)
    }

    async fn deploy_head(
        &self,
        project: &Project,
        environment: &Environment,
        output: &OutputSink,
        force: bool,
    ) -> Result<(Revision, Vec<DockershipError>)> {
        let source = self.connector.source(project)?;

        self.events
            .log(LogLevel::Info, Some(project.name.as_str()), "Retrieving last revision");
        let revision = resolve_revision(source.as_ref(), project).await?;
        let blob = fetch_dockerfile(source.as_ref(), project, &revision).await?;

        let store = self.connector.key_value_store(environment);
        let context = TemplateContext {
            project,
            revision: &revision,
            environment,
        };
        let rendered = dockerfile::render(&blob, Some(&context), store.as_deref()).await;

        let group = self.group(environment)?;
        let errors = group
            .deploy(&self.catalog, project, &revision, &rendered, output, force)
            .await;

        Ok((revision, errors))
    }

    async fn current_running_revision(
        &self,
        project: &Project,
        environment: &Environment,
    ) -> Option<String> {
        let group = self.group(environment).ok()?;
        let (containers, _) = group.list_containers(project).await;
        running_revision(&containers).map(String::from)
    }

    fn spawn_webhook(
        &self,
        url: String,
        sink: Arc<dyn WebhookSink>,
        project: &Project,
        environment: &Environment,
        previous_revision: Option<String>,
        errors: Vec<String>,
    ) -> JoinHandle<()> {
        let facade = self.clone();
        let project_name = project.name.clone();
        let environment_name = environment.name.clone();

        tokio::spawn(async move {
            let (Ok(project), Some(environment)) = (
                facade.catalog.project(&project_name),
                facade.catalog.environment(&environment_name),
            ) else {
                return;
            };

            let payload = WebhookPayload {
                project: project.name.clone(),
                repository: project.repository.to_string(),
                environment: environment.name.clone(),
                previous_revision,
                current_revision: facade.current_running_revision(project, environment).await,
                errors,
            };

            facade
                .events
                .log(LogLevel::Info, Some(project.name.as_str()), format!("Calling webhook at {url}"));
            if let Err(err) = sink.post(&url, &payload).await {
                facade.events.log(
                    LogLevel::Warning,
                    Some(project.name.as_str()),
                    format!("Webhook call failed: {err}"),
                );
            }
        })
    }

    /// Status of `project` in every environment it declares. Environments
    /// that fail contribute their errors instead of a status.
    pub async fn status(&self, project: &str) -> Result<(Vec<ProjectStatus>, Vec<DockershipError>)> {
        let project = self.catalog.project(project)?;

        let mut statuses = Vec::new();
        let mut errors = Vec::new();
        for environment in self.catalog.environments_of(project) {
            match self.environment_status(project, environment).await {
                Ok(status) => statuses.push(status),
                Err(errs) => errors.extend(errs),
            }
        }
        Ok((statuses, errors))
    }

    pub async fn status_by_environment(
        &self,
        project: &str,
        environment: &str,
    ) -> std::result::Result<ProjectStatus, Vec<DockershipError>> {
        let project = self.catalog.project(project).map_err(|e| vec![e])?;
        let environment = self
            .catalog
            .environment_for(project, environment)
            .map_err(|e| vec![e])?;
        self.environment_status(project, environment).await
    }

    async fn environment_status(
        &self,
        project: &Project,
        environment: &Environment,
    ) -> std::result::Result<ProjectStatus, Vec<DockershipError>> {
        let source = self.connector.source(project).map_err(|e| vec![e])?;
        let last_revision = resolve_revision(source.as_ref(), project)
            .await
            .map_err(|e| vec![e])?;

        let group = self.group(environment).map_err(|e| vec![e])?;
        let ((containers, mut errors), (images, image_errors)) = futures::join!(
            group.list_containers(project),
            group.list_images(project)
        );
        errors.extend(image_errors);
        if !errors.is_empty() {
            return Err(errors);
        }

        let running_containers = containers
            .iter()
            .filter(|c| c.is_running())
            .cloned()
            .collect();

        Ok(ProjectStatus {
            environment: environment.name.clone(),
            expected_image: project.image_name(&last_revision),
            last_revision,
            containers,
            running_containers,
            images,
        })
    }

    /// Containers of `project` across every environment it declares.
    pub async fn list_containers(
        &self,
        project: &str,
    ) -> Result<(Vec<Container>, Vec<DockershipError>)> {
        let project = self.catalog.project(project)?;

        let mut containers = Vec::new();
        let mut errors = Vec::new();
        for environment in self.catalog.environments_of(project) {
            match self.group(environment) {
                Ok(group) => {
                    let (found, errs) = group.list_containers(project).await;
                    containers.extend(found);
                    errors.extend(errs);
                }
                Err(err) => errors.push(err),
            }
        }
        Ok((containers, errors))
    }

    pub async fn list_images(&self, project: &str) -> Result<(Vec<Image>, Vec<DockershipError>)> {
        let project = self.catalog.project(project)?;

        let mut images = Vec::new();
        let mut errors = Vec::new();
        for environment in self.catalog.environments_of(project) {
            match self.group(environment) {
                Ok(group) => {
                    let (found, errs) = group.list_images(project).await;
                    images.extend(found);
                    errors.extend(errs);
                }
                Err(err) => errors.push(err),
            }
        }
        Ok((images, errors))
    }

    /// Remove the containers of `project` on `environment` and prune its
    /// images, as a `clean` task.
    pub async fn clean(&self, project: &str, environment: &str) -> Result<Vec<DockershipError>> {
        let project = self.catalog.project(project)?;
        let environment = self.catalog.environment_for(project, environment)?;
        let _guard = project
            .task_status
            .start(&project.name, &environment.name, Task::Clean)?;

        self.events.emit(DeployEvent::TaskStarted {
            project: project.name.clone(),
            environment: environment.name.clone(),
            task: Task::Clean,
        });
        let started = Instant::now();

        let errors = match self.group(environment) {
            Ok(group) => group.clean(project).await,
            Err(err) => vec![err],
        };

        self.events.emit(DeployEvent::TaskFinished {
            project: project.name.clone(),
            environment: environment.name.clone(),
            task: Task::Clean,
            errors: errors.iter().map(ToString::to_string).collect(),
            duration_ms: started.elapsed().as_millis() as u64,
        });
        Ok(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container(image: &str, status: &str) -> Container {
        Container {
            endpoint: "mem://a".into(),
            id: "0123456789abcdef".into(),
            image: ImageId::new(image),
            names: vec!["/web".into()],
            status: status.into(),
            created: 1,
            ports: vec![],
        }
    }

    #[test]
    fn report_success_ignores_soft_errors() {
        let mut report = DeployReport {
            project: "web".into(),
            environment: "live".into(),
            revision: None,
            webhook: None,
            errors: vec![DockershipError::CascadeRestart { containers: vec![] }.at_endpoint("a")],
        };
        assert!(report.is_success());

        report
            .errors
            .push(DockershipError::engine("build", "boom").at_endpoint("b"));
        assert!(!report.is_success());
    }

    #[test]
    fn status_matches_running_container_against_expected_image() {
        let status = ProjectStatus {
            environment: "live".into(),
            last_revision: Revision::single("git@github.com:acme/web.git", "abc123"),
            expected_image: ImageId::new("web:abc123"),
            containers: vec![container("web:old", "Exited (0)"), container("web:abc123", "Up 1 hour")],
            running_containers: vec![container("web:abc123", "Up 1 hour")],
            images: vec![],
        };

        assert!(status.is_up_to_date());
        assert_eq!(status.running_revision(), Some("abc123"));
    }

    #[test]
    fn running_revision_skips_untagged_images() {
        assert_eq!(running_revision(&[container("web", "Up 1 hour")]), None);
        assert_eq!(running_revision(&[container("web:r1", "Exited (0)")]), None);
    }
}
