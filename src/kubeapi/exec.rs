//! Run a command inside a pod container and capture its output

use k8s_openapi::api::core::v1::Pod;
use kube::api::{AttachParams, AttachedProcess};
use kube::{Api, Client};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

use crate::error::{Error, Result};

/// Captured output of a command run in a container
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Execute `command` in `container` of `pod`
///
/// Fails with [`Error::Exec`] when the command does not exit successfully.
pub async fn exec(
    client: &Client,
    namespace: &str,
    pod: &str,
    container: &str,
    command: Vec<String>,
) -> Result<ExecOutput> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);

    let attach_params = AttachParams {
        container: Some(container.to_string()),
        stdin: false,
        stdout: true,
        stderr: true,
        tty: false,
        ..Default::default()
    };

    debug!(pod = %pod, container = %container, command = ?command, "Executing command in pod");

    let mut attached = pods.exec(pod, command, &attach_params).await?;
    let output = collect(&mut attached).await?;

    let status = attached
        .take_status()
        .ok_or_else(|| Error::exec("Failed to get status from exec"))?;

    if let Some(status) = status.await {
        if status.status.as_deref() != Some("Success") {
            let detail = if output.stderr.is_empty() {
                status.message.unwrap_or_else(|| format!("{:?}", status.reason))
            } else {
                output.stderr.clone()
            };
            return Err(Error::exec(format!(
                "command in pod {}/{} container {} failed: {}",
                namespace, pod, container, detail
            )));
        }
    }

    Ok(output)
}

async fn collect(attached: &mut AttachedProcess) -> Result<ExecOutput> {
    let stdout = attached
        .stdout()
        .ok_or_else(|| Error::exec("Failed to get stdout from exec"))?;
    let stderr = attached
        .stderr()
        .ok_or_else(|| Error::exec("Failed to get stderr from exec"))?;

    let (stdout, stderr) = tokio::try_join!(read_stream(stdout), read_stream(stderr))?;
    Ok(ExecOutput { stdout, stderr })
}

async fn read_stream<R: AsyncRead + Unpin>(mut reader: R) -> Result<String> {
    let mut buffer = Vec::new();
    reader.read_to_end(&mut buffer).await?;
    Ok(String::from_utf8_lossy(&buffer).to_string())
}
