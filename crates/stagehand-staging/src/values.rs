//! What a queue deploys
//!
//! Every top-level component of the team is deployed on every run so that
//! siblings stay at their last known-good version. Values are layered per
//! release, lowest precedence first:
//!
//! 1. chart values of the component and of its dependencies
//! 2. configured default images
//! 3. stable component images
//! 4. the queue's own image (not for reverify runs)
//! 5. environment overrides

use stagehand_common::config::{Component, Config, EnvType};
use stagehand_common::crd::{Image, Queue, QueueType, StableComponentSpec};
use stagehand_common::values::{image_values, merge, nest};
use stagehand_rpc::types::ComponentVersion;

use serde_json::{Map, Value};

use crate::{Result, StagingError};

/// One release to hand to a deploy engine
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedRelease {
    /// Release name
    pub release: String,
    /// Component the release is created for
    pub component: Component,
    /// Top-level component whose chart carries `component`
    pub parent: Option<Component>,
    /// Merged values
    pub values: Value,
}

/// Nest `values` under a chain of dependency names
fn at_path(path: &[String], values: Value) -> Value {
    path.iter().rev().fold(values, |acc, key| nest(key, acc))
}

/// Whether the queue's own image takes part in the run
fn deploys_queue_image(queue: &Queue) -> bool {
    !queue.is_reverify() && !queue.spec.version.is_empty()
}

fn queue_image(queue: &Queue, component: &Component) -> Image {
    let repository = if queue.spec.repository.is_empty() {
        component.image.repository.clone()
    } else {
        queue.spec.repository.clone()
    };
    Image::new(repository, &queue.spec.version)
}

/// Walk a component tree, visiting every component with its path below `root`
fn walk<'a>(
    component: &'a Component,
    path: &mut Vec<String>,
    out: &mut Vec<(&'a Component, Vec<String>)>,
) {
    out.push((component, path.clone()));
    for dependency in &component.dependencies {
        path.push(dependency.name.clone());
        walk(dependency, path, out);
        path.pop();
    }
}

/// Every component deployed by the release of `root`, with its value path
fn members<'a>(config: &'a Config, root: &'a Component) -> Vec<(&'a Component, Vec<String>)> {
    let mut out = Vec::new();
    walk(root, &mut Vec::new(), &mut out);

    // Flat children declared with `parent`
    for component in config.components.iter().filter(|c| c.parent.is_some()) {
        if out.iter().any(|(c, _)| c.name == component.name) {
            continue;
        }
        if let Some((top, mut path)) = config.locate(&component.name) {
            if top.name == root.name {
                walk(component, &mut path, &mut out);
            }
        }
    }
    out
}

/// Values of one top-level release
fn release_values(
    config: &Config,
    root: &Component,
    queue: &Queue,
    stable: &[StableComponentSpec],
) -> Value {
    let members = members(config, root);
    let mut values = Value::Object(Map::new());

    for (component, path) in &members {
        merge(&mut values, &at_path(path, component.values.clone()));
    }
    for (component, path) in &members {
        if !component.image.repository.is_empty() {
            let image = Image::new(&component.image.repository, &component.image.tag);
            merge(&mut values, &at_path(path, image_values(&image)));
        }
    }
    for (component, path) in &members {
        if let Some(spec) = stable.iter().find(|s| s.name == component.name) {
            merge(&mut values, &at_path(path, image_values(&spec.image())));
        }
    }
    if deploys_queue_image(queue) {
        if let Some((component, path)) = members.iter().find(|(c, _)| c.name == queue.spec.name) {
            merge(&mut values, &at_path(path, image_values(&queue_image(queue, component))));
        }
    }
    if let Some(overrides) = config.env_values(EnvType::for_queue(queue.spec.type_), &root.name) {
        merge(&mut values, overrides);
    }
    values
}

/// Releases a queue deploys, one per top-level component.
///
/// Upgrade and reverify runs must name a configured component.
pub fn resolve_releases(
    config: &Config,
    queue: &Queue,
    team: &str,
    namespace: &str,
    stable: &[StableComponentSpec],
) -> Result<Vec<ResolvedRelease>> {
    let target = config.locate(&queue.spec.name);
    if target.is_none() && matches!(queue.spec.type_, QueueType::Upgrade | QueueType::Reverify) {
        return Err(StagingError::ComponentNotFound(queue.spec.name.clone()));
    }
    let target_root = target.as_ref().map(|(root, _)| root.name.clone());

    let mut releases = Vec::new();
    for root in config.components.iter().filter(|c| c.parent.is_none()) {
        let (component, parent) = match (&target_root, config.component(&queue.spec.name)) {
            (Some(name), Some(target)) if *name == root.name && target.name != root.name => {
                (target.clone(), Some(root.clone()))
            }
            _ => (root.clone(), None),
        };
        releases.push(ResolvedRelease {
            release: stagehand_common::release_name(team, namespace, &root.name),
            values: release_values(config, root, queue, stable),
            component,
            parent,
        });
    }
    Ok(releases)
}

/// Release of the top-level component carrying the queue's component
pub fn target_release(config: &Config, queue: &Queue, team: &str, namespace: &str) -> Option<String> {
    config
        .root_of(&queue.spec.name)
        .map(|root| stagehand_common::release_name(team, namespace, &root.name))
}

/// Applied values of every release keyed by release name
pub fn applied_values(releases: &[ResolvedRelease]) -> Value {
    Value::Object(
        releases
            .iter()
            .map(|r| (r.release.clone(), r.values.clone()))
            .collect(),
    )
}

/// Component versions a run deploys.
///
/// The queue's component is at the queue's version unless the run is a
/// reverify; everything else is at its stable version, else its configured
/// default. Components without an image are left out.
pub fn desired_components(
    config: &Config,
    queue: &Queue,
    stable: &[StableComponentSpec],
) -> Vec<ComponentVersion> {
    let mut out = Vec::new();
    for name in config.component_names() {
        let Some(component) = config.component(&name) else {
            continue;
        };
        let image = if name == queue.spec.name && deploys_queue_image(queue) {
            queue_image(queue, component)
        } else if let Some(spec) = stable.iter().find(|s| s.name == name) {
            spec.image()
        } else {
            Image::new(&component.image.repository, &component.image.tag)
        };
        if image.repository.is_empty() {
            continue;
        }
        if !out.iter().any(|c: &ComponentVersion| c.name == name) {
            out.push(ComponentVersion::new(name, image.repository, image.tag));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stagehand_common::crd::QueueSpec;

    const CONFIG: &str = r#"
components:
  - name: redis
    chart:
      name: redis
    image:
      repository: bitnami/redis
      tag: 5.0.0
    values:
      cluster:
        enabled: false
  - name: wordpress
    chart:
      name: wordpress
    image:
      repository: bitnami/wordpress
      tag: 5.2.4
    dependencies:
      - name: mariadb
        parent: wordpress
        image:
          repository: bitnami/mariadb
          tag: 10.3.18
        values:
          rootUser:
            password: secret
envs:
  staging:
    wordpress:
      service:
        type: ClusterIP
"#;

    fn config() -> Config {
        Config::from_slice(CONFIG.as_bytes()).unwrap()
    }

    fn queue(name: &str, version: &str, type_: QueueType) -> Queue {
        Queue::new(
            name,
            QueueSpec::new(name, format!("bitnami/{}", name), version, type_),
        )
    }

    fn by_release<'a>(releases: &'a [ResolvedRelease], root: &str) -> &'a ResolvedRelease {
        releases
            .iter()
            .find(|r| r.release.ends_with(root))
            .unwrap()
    }

    #[test]
    fn queue_image_overrides_its_dependency_inside_the_parent_chart() {
        let stable = vec![StableComponentSpec::new("redis", "bitnami/redis", "5.0.4")];
        let releases = resolve_releases(
            &config(),
            &queue("mariadb", "10.4.0", QueueType::Upgrade),
            "payments",
            "s2h",
            &stable,
        )
        .unwrap();
        assert_eq!(releases.len(), 2);

        let wordpress = by_release(&releases, "wordpress");
        assert_eq!(wordpress.release, "payments-s2h-wordpress");
        assert_eq!(wordpress.component.name, "mariadb");
        assert_eq!(wordpress.parent.as_ref().map(|p| p.name.as_str()), Some("wordpress"));
        assert_eq!(wordpress.values["mariadb"]["image"]["tag"], "10.4.0");
        assert_eq!(wordpress.values["mariadb"]["rootUser"]["password"], "secret");
        assert_eq!(wordpress.values["image"]["tag"], "5.2.4");
        assert_eq!(wordpress.values["service"]["type"], "ClusterIP");

        let redis = by_release(&releases, "redis");
        assert!(redis.parent.is_none());
        assert_eq!(redis.values["image"]["tag"], "5.0.4");
        assert_eq!(redis.values["cluster"]["enabled"], json!(false));
    }

    #[test]
    fn reverify_deploys_the_stable_version() {
        let stable = vec![StableComponentSpec::new("redis", "bitnami/redis", "5.0.4")];
        let q = queue("redis", "5.0.5-r1", QueueType::Reverify);
        let releases = resolve_releases(&config(), &q, "payments", "s2h", &stable).unwrap();
        assert_eq!(by_release(&releases, "redis").values["image"]["tag"], "5.0.4");

        let desired = desired_components(&config(), &q, &stable);
        let redis = desired.iter().find(|c| c.name == "redis").unwrap();
        assert_eq!(redis.version, "5.0.4");
    }

    #[test]
    fn unknown_components_only_fail_staging_runs() {
        let config = config();
        let err = resolve_releases(
            &config,
            &queue("nginx", "1.0", QueueType::Upgrade),
            "payments",
            "s2h",
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, StagingError::ComponentNotFound(_)));

        let promote = Queue::new(
            crate::PROMOTE_TO_ACTIVE_QUEUE,
            QueueSpec::new(crate::PROMOTE_TO_ACTIVE_QUEUE, "", "", QueueType::PromoteToActive),
        );
        let releases = resolve_releases(&config, &promote, "payments", "s2h", &[]).unwrap();
        assert_eq!(releases.len(), 2);
        assert!(releases.iter().all(|r| r.parent.is_none()));
    }

    #[test]
    fn desired_versions_prefer_queue_then_stable_then_default() {
        let stable = vec![StableComponentSpec::new("wordpress", "bitnami/wordpress", "5.3.0")];
        let desired = desired_components(
            &config(),
            &queue("redis", "5.0.5-r1", QueueType::Upgrade),
            &stable,
        );

        let version = |name: &str| {
            desired
                .iter()
                .find(|c| c.name == name)
                .map(|c| c.version.clone())
                .unwrap()
        };
        assert_eq!(version("redis"), "5.0.5-r1");
        assert_eq!(version("wordpress"), "5.3.0");
        assert_eq!(version("mariadb"), "10.3.18");
    }

    #[test]
    fn applied_values_are_keyed_by_release() {
        let releases = resolve_releases(
            &config(),
            &queue("redis", "5.0.5-r1", QueueType::Upgrade),
            "payments",
            "s2h",
            &[],
        )
        .unwrap();
        let applied = applied_values(&releases);
        assert_eq!(applied["payments-s2h-redis"]["image"]["tag"], "5.0.5-r1");
        assert_eq!(
            target_release(&config(), &queue("mariadb", "1", QueueType::Upgrade), "payments", "s2h"),
            Some("payments-s2h-wordpress".to_string())
        );
    }
}
