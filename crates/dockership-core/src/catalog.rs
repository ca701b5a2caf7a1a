//! The project/environment arena.
//!
//! Projects refer to each other by name only. Building a catalog checks every
//! environment reference, resolves links and fills the `linked_by`
//! back-references; afterwards the graph is read-only.

use std::collections::BTreeMap;

use dockership_types::{DockershipError, Environment, LinkTarget, Project, Result};

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    projects: BTreeMap<String, Project>,
    environments: BTreeMap<String, Environment>,
}

impl Catalog {
    /// Build the arena.
    ///
    /// An undeclared environment is fatal. A link to an undeclared project is
    /// kept as [`LinkTarget::Unresolved`] and logged.
    pub fn new(
        projects: impl IntoIterator<Item = Project>,
        environments: impl IntoIterator<Item = Environment>,
    ) -> Result<Self> {
        let environments: BTreeMap<String, Environment> = environments
            .into_iter()
            .map(|e| (e.name.clone(), e))
            .collect();
        let mut projects: BTreeMap<String, Project> = projects
            .into_iter()
            .map(|p| (p.name.clone(), p))
            .collect();

        for project in projects.values() {
            if let Some(missing) = project
                .environments
                .iter()
                .find(|name| !environments.contains_key(*name))
            {
                return Err(DockershipError::UndefinedEnvironment {
                    project: project.name.clone(),
                    environment: missing.clone(),
                });
            }
        }

        let names: Vec<String> = projects.keys().cloned().collect();
        let mut back_links: Vec<(String, String)> = Vec::new();
        for project in projects.values_mut() {
            project.linked_by.clear();
            for link in project.links.iter_mut() {
                let target = link.project_name().to_string();
                if names.contains(&target) {
                    back_links.push((target.clone(), project.name.clone()));
                    link.target = LinkTarget::Resolved(target);
                } else {
                    tracing::warn!(project = %project.name, link = %target, "Undefined linked project");
                    link.target = LinkTarget::Unresolved(target);
                }
            }
        }

        for (target, dependent) in back_links {
            if let Some(project) = projects.get_mut(&target) {
                if !project.linked_by.contains(&dependent) {
                    project.linked_by.push(dependent);
                }
            }
        }

        Ok(Self {
            projects,
            environments,
        })
    }

    pub fn project(&self, name: &str) -> Result<&Project> {
        self.projects
            .get(name)
            .ok_or_else(|| DockershipError::UndefinedProject(name.to_string()))
    }

    pub fn projects(&self) -> impl Iterator<Item = &Project> {
        self.projects.values()
    }

    pub fn environment(&self, name: &str) -> Option<&Environment> {
        self.environments.get(name)
    }

    /// The named environment, provided `project` declares it.
    pub fn environment_for(&self, project: &Project, name: &str) -> Result<&Environment> {
        let undefined = || DockershipError::UndefinedEnvironment {
            project: project.name.clone(),
            environment: name.to_string(),
        };

        if !project.has_environment(name) {
            return Err(undefined());
        }
        self.environments.get(name).ok_or_else(undefined)
    }

    /// Every environment `project` declares, in declaration order.
    pub fn environments_of<'a>(
        &'a self,
        project: &'a Project,
    ) -> impl Iterator<Item = &'a Environment> + 'a {
        project
            .environments
            .iter()
            .filter_map(|name| self.environments.get(name))
    }

    /// Projects that declared a link to `project`.
    pub fn linked_by<'a>(&'a self, project: &'a Project) -> impl Iterator<Item = &'a Project> + 'a {
        project
            .linked_by
            .iter()
            .filter_map(|name| self.projects.get(name))
    }
}
