//! Pod log harvesting for failed or cancelled workloads.

use k8s_openapi::api::core::v1::Pod;

use imagebuilder_core::WorkloadGateway;

/// Tail cap used when a stage fails.
pub const FAILURE_TAIL_LINES: i64 = 2_000;
/// Tail cap used for cancellation snapshots and the logs endpoint.
pub const SNAPSHOT_TAIL_LINES: i64 = 1_000;

/// Human-readable pod state: phase plus exit code / waiting reason when the
/// first container has one.
pub fn pod_state_summary(pod: &Pod) -> String {
    let phase = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.clone())
        .unwrap_or_else(|| "Unknown".to_string());

    let container_state = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|statuses| statuses.first())
        .and_then(|cs| cs.state.as_ref());

    match container_state {
        Some(state) => {
            if let Some(terminated) = state.terminated.as_ref() {
                format!(
                    "{phase} (exit code: {}, reason: {})",
                    terminated.exit_code,
                    terminated.reason.as_deref().unwrap_or("unknown")
                )
            } else if let Some(waiting) = state.waiting.as_ref() {
                format!(
                    "{phase} (waiting: {})",
                    waiting.reason.as_deref().unwrap_or("unknown")
                )
            } else {
                phase
            }
        }
        None => phase,
    }
}

/// Collect logs from every pod matching `label_selector`, each preceded by a
/// header with the pod's state. Retrieval errors become log lines rather than
/// failures so a broken pod never hides the rest.
pub async fn collect_pod_logs(
    workloads: &dyn WorkloadGateway,
    namespace: &str,
    label_selector: &str,
    tail_lines: i64,
) -> Vec<String> {
    let pods = match workloads.list_pods(namespace, label_selector).await {
        Ok(pods) => pods,
        Err(err) => {
            tracing::warn!(%label_selector, error = %err, "failed to list pods for log collection");
            return vec![format!("Failed to retrieve build logs: {err}")];
        }
    };

    if pods.is_empty() {
        return vec!["No pods found for this build job".to_string()];
    }

    let mut all_logs = Vec::new();
    for pod in &pods {
        let pod_name = pod
            .metadata
            .name
            .clone()
            .unwrap_or_else(|| "<unnamed>".to_string());
        all_logs.push(format!(
            "=== Pod {pod_name} (Status: {}) ===",
            pod_state_summary(pod)
        ));

        match workloads.pod_logs(namespace, &pod_name, tail_lines).await {
            Ok(log) if !log.is_empty() => {
                all_logs.extend(log.lines().map(str::to_string));
            }
            Ok(_) => all_logs.push("(no logs available)".to_string()),
            Err(err) => {
                tracing::warn!(pod = %pod_name, error = %err, "failed to get pod logs");
                all_logs.push(format!("Failed to retrieve logs: {err}"));
            }
        }
        all_logs.push(String::new());
    }

    all_logs
}
