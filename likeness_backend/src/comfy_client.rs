use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::sleep;

use crate::comfy_workflow::SceneWorkflow;
use crate::config::ComfyUIConfig;
use crate::image_client::{validate_image, GeneratedImage, ImageGenerator, ImageRequest};

const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Serialize)]
struct QueuePromptRequest {
    prompt: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueuePromptResponse {
    prompt_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryEntry {
    #[serde(default)]
    pub outputs: HashMap<String, OutputNode>,
    pub status: Option<StatusInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputNode {
    pub images: Option<Vec<ImageInfo>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageInfo {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type")]
    pub image_type: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusInfo {
    pub status_str: Option<String>,
    pub completed: Option<bool>,
}

impl HistoryEntry {
    /// First image of the preferred output node, else of any node.
    fn first_image(&self, preferred_node: &str) -> Option<&ImageInfo> {
        let preferred = self
            .outputs
            .get(preferred_node)
            .and_then(|o| o.images.as_ref())
            .and_then(|images| images.first());
        preferred.or_else(|| {
            let mut node_ids: Vec<&String> = self.outputs.keys().collect();
            node_ids.sort();
            node_ids.into_iter().find_map(|id| {
                self.outputs[id]
                    .images
                    .as_ref()
                    .and_then(|images| images.first())
            })
        })
    }
}

/// Thin wrapper over the ComfyUI HTTP endpoints used for scene rendering.
pub struct ComfyUIClient {
    api_url: String,
    client: Client,
}

/// Fail with the response body attached unless the status is 2xx.
async fn ensure_success(response: Response, what: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    anyhow::bail!("ComfyUI {} failed with {}: {}", what, status, body.trim());
}

impl ComfyUIClient {
    pub fn new(api_url: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build ComfyUI HTTP client")?;
        Ok(Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    /// Submit a graph; returns the prompt id to poll.
    pub async fn queue_prompt(&self, graph: serde_json::Value) -> Result<String> {
        let response = self
            .client
            .post(format!("{}/prompt", self.api_url))
            .json(&QueuePromptRequest {
                prompt: graph,
                client_id: None,
            })
            .send()
            .await
            .context("ComfyUI is unreachable")?;
        let queued: QueuePromptResponse = ensure_success(response, "prompt submission")
            .await?
            .json()
            .await
            .context("Unexpected /prompt response from ComfyUI")?;
        Ok(queued.prompt_id)
    }

    pub async fn get_history(&self, prompt_id: &str) -> Result<Option<HistoryEntry>> {
        let response = self
            .client
            .get(format!("{}/history/{}", self.api_url, prompt_id))
            .send()
            .await
            .context("ComfyUI is unreachable")?;
        let mut entries: HashMap<String, HistoryEntry> = ensure_success(response, "history lookup")
            .await?
            .json()
            .await
            .context("Unexpected /history response from ComfyUI")?;
        Ok(entries.remove(prompt_id))
    }

    /// Poll until the prompt completes, then return its output image.
    pub async fn wait_for_completion(
        &self,
        prompt_id: &str,
        output_node: &str,
        timeout: Duration,
    ) -> Result<ImageInfo> {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            let status = self.get_history(prompt_id).await?.and_then(|entry| {
                let status = entry.status.clone()?;
                Some((entry, status))
            });
            if let Some((entry, status)) = status {
                if status.status_str.as_deref() == Some("error") {
                    anyhow::bail!("ComfyUI reported an execution error for {}", prompt_id);
                }
                if status.completed == Some(true) {
                    let image = entry
                        .first_image(output_node)
                        .with_context(|| format!("Prompt {} finished without an image", prompt_id))?;
                    tracing::info!("ComfyUI rendered {} for prompt {}", image.filename, prompt_id);
                    return Ok(image.clone());
                }
            }
            sleep(POLL_INTERVAL).await;
        }
        anyhow::bail!("ComfyUI did not finish prompt {} within {:?}", prompt_id, timeout)
    }

    pub async fn fetch_image(&self, image: &ImageInfo) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(format!("{}/view", self.api_url))
            .query(&[
                ("filename", image.filename.as_str()),
                ("subfolder", image.subfolder.as_str()),
                ("type", image.image_type.as_str()),
            ])
            .send()
            .await
            .context("ComfyUI is unreachable")?;
        let bytes = ensure_success(response, "image download")
            .await?
            .bytes()
            .await
            .context("Failed to read image bytes")?;
        Ok(bytes.to_vec())
    }
}

/// [`ImageGenerator`] backed by a ComfyUI server and a workflow graph.
pub struct ComfyImageClient {
    client: ComfyUIClient,
    workflow: SceneWorkflow,
    timeout: Duration,
}

impl ComfyImageClient {
    pub fn new(client: ComfyUIClient, workflow: SceneWorkflow, timeout: Duration) -> Self {
        Self {
            client,
            workflow,
            timeout,
        }
    }

    /// Uses `workflow_path` when configured, otherwise the built-in graph.
    pub fn from_config(config: &ComfyUIConfig) -> Result<Self> {
        let workflow = match config.workflow_path.as_deref().filter(|p| !p.trim().is_empty()) {
            Some(path) => SceneWorkflow::load(path)
                .with_context(|| format!("Failed to load ComfyUI workflow {}", path))?,
            None => SceneWorkflow::txt2img(config),
        };
        Ok(Self::new(
            ComfyUIClient::new(config.api_url.clone())?,
            workflow,
            Duration::from_secs(config.timeout_secs.max(1)),
        ))
    }
}

#[async_trait]
impl ImageGenerator for ComfyImageClient {
    async fn generate_image(&self, request: &ImageRequest) -> Result<GeneratedImage> {
        let graph = self.workflow.prepare(request);
        let prompt_id = self.client.queue_prompt(graph).await?;
        tracing::debug!("Queued ComfyUI prompt {}", prompt_id);
        let info = self
            .client
            .wait_for_completion(&prompt_id, &self.workflow.output_node, self.timeout)
            .await?;
        let bytes = self.client.fetch_image(&info).await?;
        validate_image(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_prefers_configured_output_node() {
        let entry: HistoryEntry = serde_json::from_value(serde_json::json!({
            "outputs": {
                "12": {"images": [{"filename": "preview.png", "subfolder": "", "type": "temp"}]},
                "9": {"images": [{"filename": "final.png", "subfolder": "", "type": "output"}]}
            },
            "status": {"status_str": "success", "completed": true}
        }))
        .expect("history");
        assert_eq!(entry.first_image("9").map(|i| i.filename.as_str()), Some("final.png"));
        assert_eq!(entry.first_image("missing").map(|i| i.filename.as_str()), Some("preview.png"));
    }
}
