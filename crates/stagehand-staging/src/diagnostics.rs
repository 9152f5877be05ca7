//! Diagnostic log bundle
//!
//! Captured once per run in the collecting phase: a listing of the tenant's
//! resources plus the logs of every container that is not ready, packed as a
//! gzip-compressed tar and base64-encoded for the queue status.

use std::fmt::Write as _;
use std::io::Write as _;

use base64::Engine as _;
use flate2::write::GzEncoder;
use flate2::Compression;
use k8s_openapi::api::core::v1::Pod;
use stagehand_common::kube_utils::{
    is_deployment_ready, is_pod_ready, is_pod_succeeded, is_pvc_bound, is_service_ready,
};
use tracing::{debug, info};

use crate::cluster::ClusterClient;
use crate::{Result, StagingError};

/// Name of the resource listing inside the bundle
pub const RESOURCES_FILE: &str = "resources.txt";

fn failed(err: std::io::Error) -> StagingError {
    StagingError::Diagnostics(err.to_string())
}

fn name_of(meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta) -> &str {
    meta.name.as_deref().unwrap_or_default()
}

fn container_names(pod: &Pod) -> Vec<String> {
    pod.spec
        .as_ref()
        .map(|s| s.containers.iter().map(|c| c.name.clone()).collect())
        .unwrap_or_default()
}

/// Gzip-compressed tar of `files`, base64-encoded
pub fn pack(files: &[(String, Vec<u8>)]) -> Result<String> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);

    for (path, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, path, data.as_slice())
            .map_err(failed)?;
    }

    let mut encoder = builder.into_inner().map_err(failed)?;
    encoder.flush().map_err(failed)?;
    let bytes = encoder.finish().map_err(failed)?;
    Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
}

/// Collect the diagnostic bundle of a namespace
pub async fn collect_bundle(cluster: &dyn ClusterClient, namespace: &str) -> Result<String> {
    let pods = cluster.list_pods(namespace, "").await?;
    let services = cluster.list_services(namespace, "").await?;
    let deployments = cluster.list_deployments(namespace, "").await?;
    let pvcs = cluster.list_pvcs(namespace, "").await?;

    let mut listing = String::new();
    let _ = writeln!(listing, "# pods");
    for pod in &pods {
        let phase = pod
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .unwrap_or("Unknown");
        let _ = writeln!(
            listing,
            "{}\tphase={}\tready={}",
            name_of(&pod.metadata),
            phase,
            is_pod_ready(pod)
        );
    }
    let _ = writeln!(listing, "# services");
    for svc in &services {
        let _ = writeln!(listing, "{}\tready={}", name_of(&svc.metadata), is_service_ready(svc));
    }
    let _ = writeln!(listing, "# deployments");
    for deployment in &deployments {
        let _ = writeln!(
            listing,
            "{}\tready={}",
            name_of(&deployment.metadata),
            is_deployment_ready(deployment)
        );
    }
    let _ = writeln!(listing, "# persistentvolumeclaims");
    for pvc in &pvcs {
        let _ = writeln!(listing, "{}\tbound={}", name_of(&pvc.metadata), is_pvc_bound(pvc));
    }

    let mut files = vec![(RESOURCES_FILE.to_string(), listing.into_bytes())];

    for pod in pods.iter().filter(|p| !is_pod_ready(p) && !is_pod_succeeded(p)) {
        let pod_name = name_of(&pod.metadata);
        for container in container_names(pod) {
            match cluster.pod_logs(namespace, pod_name, &container, false).await {
                Ok(logs) => files.push((format!("{}/{}.log", pod_name, container), logs.into_bytes())),
                Err(e) => debug!(pod = %pod_name, container = %container, error = %e, "No logs"),
            }
            // Containers that never restarted have no previous instance
            if let Ok(logs) = cluster.pod_logs(namespace, pod_name, &container, true).await {
                files.push((
                    format!("{}/{}.previous.log", pod_name, container),
                    logs.into_bytes(),
                ));
            }
        }
    }

    info!(namespace, files = files.len(), "Collected diagnostics");
    pack(&files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MockClusterClient;
    use std::io::Read;

    use flate2::read::GzDecoder;
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodStatus};
    use kube::api::ObjectMeta;

    fn pod(name: &str, phase: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "main".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
        }
    }

    fn unpack(bundle: &str) -> Vec<(String, String)> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(bundle)
            .unwrap();
        let mut archive = tar::Archive::new(GzDecoder::new(bytes.as_slice()));
        archive
            .entries()
            .unwrap()
            .map(|entry| {
                let mut entry = entry.unwrap();
                let path = entry.path().unwrap().to_string_lossy().to_string();
                let mut content = String::new();
                entry.read_to_string(&mut content).unwrap();
                (path, content)
            })
            .collect()
    }

    /// Story: a crash-looping pod ends up in the bundle with both log streams
    #[tokio::test]
    async fn story_unready_pods_contribute_their_logs() {
        let mut cluster = MockClusterClient::new();
        cluster
            .expect_list_pods()
            .returning(|_, _| Ok(vec![pod("redis-0", "Running"), pod("migrate", "Succeeded")]));
        cluster.expect_list_services().returning(|_, _| Ok(vec![]));
        cluster.expect_list_deployments().returning(|_, _| Ok(vec![]));
        cluster.expect_list_pvcs().returning(|_, _| Ok(vec![]));
        cluster
            .expect_pod_logs()
            .withf(|_, pod, _, _| pod == "redis-0")
            .returning(|_, _, _, previous| {
                if previous {
                    Err(StagingError::Diagnostics("no previous".to_string()))
                } else {
                    Ok("Ready to accept connections".to_string())
                }
            });

        let bundle = collect_bundle(&cluster, "s2h").await.unwrap();
        let files = unpack(&bundle);

        let names: Vec<&str> = files.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(names, vec![RESOURCES_FILE, "redis-0/main.log"]);
        assert!(files[0].1.contains("redis-0\tphase=Running\tready=false"));
        assert!(files[0].1.contains("migrate\tphase=Succeeded"));
        assert_eq!(files[1].1, "Ready to accept connections");
    }

    #[test]
    fn empty_bundle_still_decodes() {
        let bundle = pack(&[]).unwrap();
        assert!(unpack(&bundle).is_empty());
    }
}
