//! Multi-endpoint fan-out.
//!
//! Every operation runs once per endpoint of the environment, concurrently,
//! and waits for all of them. One endpoint failing never stops the others;
//! failures come back as a list with one entry per failing endpoint.

use std::future::Future;
use std::sync::Arc;

use futures::future::join_all;

use dockership_types::{Container, DockershipError, Environment, Image, Project, Result, Revision};

use crate::catalog::Catalog;
use crate::connector::Connector;
use crate::docker::Docker;
use crate::engine::{Engine, OutputSink};
use crate::events::EventEmitter;

pub struct DockerGroup {
    environment: String,
    dockers: Vec<Docker>,
}

impl DockerGroup {
    /// Connect to every endpoint of `environment`.
    pub fn new(
        environment: &Environment,
        connector: &dyn Connector,
        events: &EventEmitter,
    ) -> Result<Self> {
        let engines = environment
            .docker_endpoints
            .iter()
            .map(|endpoint| connector.engine(environment, endpoint))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self::from_engines(&environment.name, engines, events))
    }

    pub fn from_engines(
        environment: &str,
        engines: Vec<Arc<dyn Engine>>,
        events: &EventEmitter,
    ) -> Self {
        let dockers = engines
            .into_iter()
            .map(|engine| Docker::new(engine, environment, events.clone()))
            .collect();

        Self {
            environment: environment.to_string(),
            dockers,
        }
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &str> {
        self.dockers.iter().map(Docker::endpoint)
    }

    pub fn len(&self) -> usize {
        self.dockers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dockers.is_empty()
    }

    pub async fn deploy(
        &self,
        catalog: &Catalog,
        project: &Project,
        revision: &Revision,
        dockerfile: &[u8],
        output: &OutputSink,
        force: bool,
    ) -> Vec<DockershipError> {
        tracing::info!(
            project = %project.name,
            revision = %revision.get_short(),
            environment = %self.environment,
            end_points = self.dockers.len(),
            "Deploying dockerfile"
        );

        let results = self
            .batch(|docker| docker.deploy(catalog, project, revision, dockerfile, output, force))
            .await;
        collect_errors(results)
    }

    pub async fn clean(&self, project: &Project) -> Vec<DockershipError> {
        tracing::info!(project = %project.name, environment = %self.environment, end_points = self.dockers.len(), "Cleaning containers");
        collect_errors(self.batch(|docker| docker.clean(project)).await)
    }

    pub async fn build_image(
        &self,
        project: &Project,
        revision: &Revision,
        dockerfile: &[u8],
        output: &OutputSink,
    ) -> Vec<DockershipError> {
        let results = self
            .batch(|docker| docker.build_image(project, revision, dockerfile, output))
            .await;
        collect_errors(results)
    }

    pub async fn run(
        &self,
        catalog: &Catalog,
        project: &Project,
        revision: &Revision,
    ) -> Vec<DockershipError> {
        collect_errors(self.batch(|docker| docker.run(catalog, project, revision)).await)
    }

    /// Containers of `project` across every endpoint, plus one error per
    /// endpoint that could not be listed.
    pub async fn list_containers(&self, project: &Project) -> (Vec<Container>, Vec<DockershipError>) {
        collect_lists(self.batch(|docker| docker.list_containers(project)).await)
    }

    pub async fn list_images(&self, project: &Project) -> (Vec<Image>, Vec<DockershipError>) {
        collect_lists(self.batch(|docker| docker.list_images(project)).await)
    }

    /// Run `f` against every endpoint concurrently and wait for all of them.
    /// Results come back in endpoint order, tagged with the endpoint.
    async fn batch<'a, T, F, Fut>(&'a self, f: F) -> Vec<(&'a str, T)>
    where
        F: Fn(&'a Docker) -> Fut,
        Fut: Future<Output = T>,
    {
        let runs = self.dockers.iter().map(|docker| {
            let run = f(docker);
            async move { (docker.endpoint(), run.await) }
        });
        join_all(runs).await
    }
}

fn collect_errors(results: Vec<(&str, Result<()>)>) -> Vec<DockershipError> {
    results
        .into_iter()
        .filter_map(|(endpoint, result)| result.err().map(|e| e.at_endpoint(endpoint)))
        .collect()
}

fn collect_lists<T>(results: Vec<(&str, Result<Vec<T>>)>) -> (Vec<T>, Vec<DockershipError>) {
    let mut items = Vec::new();
    let mut errors = Vec::new();
    for (endpoint, result) in results {
        match result {
            Ok(list) => items.extend(list),
            Err(err) => errors.push(err.at_endpoint(endpoint)),
        }
    }
    (items, errors)
}
