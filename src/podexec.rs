//! Pod exec transport
//!
//! Moving a staged package into a pod and triggering the install both ride
//! on the Kubernetes exec subresource (SPDY/WebSocket upgrade). The
//! [`PodTransport`] trait keeps the pipeline testable; [`KubePodTransport`]
//! is the production implementation.

use std::path::Path;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams};
use kube::Client;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::Error;

/// Command that unpacks an app package on the pod
const INSTALL_BINARY: &str = "/opt/splunk/bin/splunk";

/// Transport for pushing bytes into pods and running the install command
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PodTransport: Send + Sync {
    /// Copy a local file into the pod at `dest_path`
    ///
    /// Both paths must be absolute; a relative path is a caller bug and is
    /// rejected before any I/O. A missing source file is likewise fatal for
    /// the worker rather than retryable.
    async fn copy_to_pod(
        &self,
        namespace: &str,
        pod_name: &str,
        local_path: &Path,
        dest_path: &Path,
    ) -> Result<(), Error>;

    /// Run the app install command inside the pod
    async fn install_app(
        &self,
        namespace: &str,
        pod_name: &str,
        package_path: &Path,
    ) -> Result<(), Error>;
}

/// Validate the path pair shared by every transport implementation
///
/// Split out of [`KubePodTransport`] so mock-based tests exercise the same
/// argument contract as production.
pub fn validate_copy_args(local_path: &Path, dest_path: &Path) -> Result<(), Error> {
    if !local_path.is_absolute() {
        return Err(Error::validation(format!(
            "pod copy source must be absolute: {}",
            local_path.display()
        )));
    }
    if !dest_path.is_absolute() {
        return Err(Error::validation(format!(
            "pod copy destination must be absolute: {}",
            dest_path.display()
        )));
    }
    Ok(())
}

/// [`PodTransport`] backed by the cluster's exec subresource
pub struct KubePodTransport {
    client: Client,
}

impl KubePodTransport {
    /// Transport talking to the given cluster
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl PodTransport for KubePodTransport {
    async fn copy_to_pod(
        &self,
        namespace: &str,
        pod_name: &str,
        local_path: &Path,
        dest_path: &Path,
    ) -> Result<(), Error> {
        validate_copy_args(local_path, dest_path)?;

        let mut file = tokio::fs::File::open(local_path).await?;

        let dest_dir = dest_path
            .parent()
            .ok_or_else(|| Error::validation("pod copy destination has no parent directory"))?;
        let command = format!(
            "mkdir -p {} && cat > {}",
            shell_quote(dest_dir),
            shell_quote(dest_path)
        );

        debug!(
            pod = %pod_name,
            namespace = %namespace,
            src = %local_path.display(),
            dest = %dest_path.display(),
            "Streaming package into pod"
        );

        let params = AttachParams::default()
            .stdin(true)
            .stdout(false)
            .stderr(true);
        let mut attached = self
            .pods(namespace)
            .exec(pod_name, ["sh", "-c", command.as_str()], &params)
            .await?;

        let mut stdin = attached
            .stdin()
            .ok_or_else(|| Error::pod_transport("exec session has no stdin channel"))?;
        tokio::io::copy(&mut file, &mut stdin)
            .await
            .map_err(|e| Error::pod_transport(format!("streaming to {pod_name} failed: {e}")))?;
        stdin
            .shutdown()
            .await
            .map_err(|e| Error::pod_transport(format!("closing stdin for {pod_name} failed: {e}")))?;

        finish_exec(attached, pod_name).await?;
        info!(pod = %pod_name, dest = %dest_path.display(), "Package copied into pod");
        Ok(())
    }

    async fn install_app(
        &self,
        namespace: &str,
        pod_name: &str,
        package_path: &Path,
    ) -> Result<(), Error> {
        let package = package_path
            .to_str()
            .ok_or_else(|| Error::validation("package path is not valid UTF-8"))?;

        debug!(pod = %pod_name, package = %package, "Triggering app install");

        let params = AttachParams::default().stdout(true).stderr(true);
        let attached = self
            .pods(namespace)
            .exec(
                pod_name,
                [INSTALL_BINARY, "install", "app", package, "-update", "1"],
                &params,
            )
            .await?;

        finish_exec(attached, pod_name).await?;
        info!(pod = %pod_name, package = %package, "App install command finished");
        Ok(())
    }
}

/// Wait for an exec session to end and map its status to a result
async fn finish_exec(
    mut attached: kube::api::AttachedProcess,
    pod_name: &str,
) -> Result<(), Error> {
    let status = attached.take_status();
    attached
        .join()
        .await
        .map_err(|e| Error::pod_transport(format!("exec on {pod_name} failed: {e}")))?;

    if let Some(status) = status {
        if let Some(status) = status.await {
            if status.status.as_deref() == Some("Failure") {
                return Err(Error::pod_transport(format!(
                    "exec on {pod_name} failed: {}",
                    status.message.unwrap_or_default()
                )));
            }
        }
    }
    Ok(())
}

/// Single-quote a path for `sh -c`
fn shell_quote(path: &Path) -> String {
    format!("'{}'", path.to_string_lossy().replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths_are_fatal_argument_errors() {
        assert!(validate_copy_args(Path::new("app.tgz"), Path::new("/dest/app.tgz")).is_err());
        assert!(validate_copy_args(Path::new("/src/app.tgz"), Path::new("dest/app.tgz")).is_err());
        assert!(validate_copy_args(Path::new("/src/app.tgz"), Path::new("/dest/app.tgz")).is_ok());
    }

    #[test]
    fn shell_quote_wraps_and_escapes() {
        assert_eq!(shell_quote(Path::new("/a/b c")), "'/a/b c'");
        assert_eq!(shell_quote(Path::new("/a/it's")), "'/a/it'\\''s'");
    }
}
