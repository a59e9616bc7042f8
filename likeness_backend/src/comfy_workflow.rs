//! ComfyUI workflow graphs: a user-supplied one or the built-in txt2img graph.

use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::fs;
use std::path::Path;

use crate::character_card::extract_png_text_chunk;
use crate::config::ComfyUIConfig;
use crate::image_client::ImageRequest;

/// A ComfyUI API-format graph plus the nodes the engine writes into.
#[derive(Debug, Clone)]
pub struct SceneWorkflow {
    pub graph: Value,
    positive_node: String,
    negative_node: Option<String>,
    sampler_node: String,
    latent_node: Option<String>,
    pub output_node: String,
}

impl SceneWorkflow {
    /// Load a workflow from API JSON, or from a PNG carrying a `prompt` chunk.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).with_context(|| format!("Failed to read workflow from {:?}", path))?;
        let graph: Value = if bytes.starts_with(b"\x89PNG") {
            let text = extract_png_text_chunk(&bytes, "prompt")
                .context("No ComfyUI workflow found in PNG metadata")?;
            serde_json::from_str(&text).context("Failed to parse workflow JSON from PNG")?
        } else {
            serde_json::from_slice(&bytes).context("Failed to parse workflow JSON")?
        };
        Self::from_graph(graph)
    }

    pub fn from_graph(graph: Value) -> Result<Self> {
        let nodes = graph
            .as_object()
            .context("Workflow must be a JSON object of nodes")?;

        let class_of = |id: &str| {
            nodes
                .get(id)
                .and_then(|n| n.get("class_type"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let first_of = |classes: &[&str]| {
            let mut ids: Vec<&String> = nodes
                .iter()
                .filter(|(_, node)| {
                    node.get("class_type")
                        .and_then(Value::as_str)
                        .is_some_and(|c| classes.contains(&c))
                })
                .map(|(id, _)| id)
                .collect();
            ids.sort();
            ids.first().map(|id| id.to_string())
        };

        let sampler_node = first_of(&["KSampler", "KSamplerAdvanced"])
            .context("No KSampler node found in workflow")?;
        let output_node = first_of(&["SaveImage", "PreviewImage"])
            .context("No output node (SaveImage/PreviewImage) found in workflow")?;

        // The sampler's positive/negative inputs reference [node_id, slot].
        let linked = |input: &str| {
            nodes
                .get(&sampler_node)
                .and_then(|n| n.get("inputs"))
                .and_then(|i| i.get(input))
                .and_then(|link| link.get(0))
                .and_then(Value::as_str)
                .map(str::to_string)
                .filter(|id| class_of(id) == "CLIPTextEncode")
        };
        let positive_node = linked("positive")
            .or_else(|| first_of(&["CLIPTextEncode"]))
            .context("No CLIPTextEncode prompt node found in workflow")?;
        let negative_node = linked("negative").filter(|id| *id != positive_node);
        let latent_node = first_of(&["EmptyLatentImage"]);

        Ok(Self {
            graph,
            positive_node,
            negative_node,
            sampler_node,
            latent_node,
            output_node,
        })
    }

    /// Built-in SD1.5-style text-to-image graph.
    pub fn txt2img(config: &ComfyUIConfig) -> Self {
        let graph = json!({
            "3": {
                "class_type": "KSampler",
                "inputs": {
                    "seed": 0,
                    "steps": config.steps,
                    "cfg": config.cfg_scale,
                    "sampler_name": config.sampler,
                    "scheduler": config.scheduler,
                    "denoise": 1.0,
                    "model": ["4", 0],
                    "positive": ["6", 0],
                    "negative": ["7", 0],
                    "latent_image": ["5", 0]
                }
            },
            "4": {
                "class_type": "CheckpointLoaderSimple",
                "inputs": { "ckpt_name": config.model_name }
            },
            "5": {
                "class_type": "EmptyLatentImage",
                "inputs": { "width": config.width, "height": config.height, "batch_size": 1 }
            },
            "6": {
                "class_type": "CLIPTextEncode",
                "inputs": { "text": "", "clip": ["4", 1] }
            },
            "7": {
                "class_type": "CLIPTextEncode",
                "inputs": { "text": "", "clip": ["4", 1] }
            },
            "8": {
                "class_type": "VAEDecode",
                "inputs": { "samples": ["3", 0], "vae": ["4", 2] }
            },
            "9": {
                "class_type": "SaveImage",
                "inputs": { "filename_prefix": "likeness", "images": ["8", 0] }
            }
        });
        Self {
            graph,
            positive_node: "6".to_string(),
            negative_node: Some("7".to_string()),
            sampler_node: "3".to_string(),
            latent_node: Some("5".to_string()),
            output_node: "9".to_string(),
        }
    }

    /// Copy of the graph with prompt, seed and size written in.
    pub fn prepare(&self, request: &ImageRequest) -> Value {
        let mut graph = self.graph.clone();
        graph[&self.positive_node]["inputs"]["text"] = json!(request.prompt);
        if let Some(negative) = &self.negative_node {
            graph[negative]["inputs"]["text"] = json!(request.negative_prompt);
        }
        let sampler = &mut graph[&self.sampler_node]["inputs"];
        if sampler.get("noise_seed").is_some() {
            sampler["noise_seed"] = json!(request.seed);
        } else {
            sampler["seed"] = json!(request.seed);
        }
        if let Some(latent) = &self.latent_node {
            graph[latent]["inputs"]["width"] = json!(request.width);
            graph[latent]["inputs"]["height"] = json!(request.height);
        }
        graph
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ImageRequest {
        ImageRequest {
            prompt: "adult, (red hair:1.2), beach".to_string(),
            negative_prompt: "lowres".to_string(),
            seed: 1234,
            width: 640,
            height: 960,
        }
    }

    #[test]
    fn builtin_graph_receives_prompt_seed_and_size() {
        let workflow = SceneWorkflow::txt2img(&ComfyUIConfig::default());
        let graph = workflow.prepare(&request());
        assert_eq!(graph["6"]["inputs"]["text"], "adult, (red hair:1.2), beach");
        assert_eq!(graph["7"]["inputs"]["text"], "lowres");
        assert_eq!(graph["3"]["inputs"]["seed"], 1234);
        assert_eq!(graph["5"]["inputs"]["width"], 640);
        assert_eq!(workflow.output_node, "9");
        assert_eq!(workflow.graph["6"]["inputs"]["text"], "");
    }

    #[test]
    fn user_graph_follows_sampler_links() {
        let graph = json!({
            "10": {"class_type": "CLIPTextEncode", "inputs": {"text": "neg"}},
            "11": {"class_type": "CLIPTextEncode", "inputs": {"text": "pos"}},
            "12": {"class_type": "KSamplerAdvanced", "inputs": {
                "noise_seed": 1, "positive": ["11", 0], "negative": ["10", 0]}},
            "13": {"class_type": "PreviewImage", "inputs": {}}
        });
        let workflow = SceneWorkflow::from_graph(graph).expect("workflow");
        let prepared = workflow.prepare(&request());
        assert_eq!(prepared["11"]["inputs"]["text"], "adult, (red hair:1.2), beach");
        assert_eq!(prepared["10"]["inputs"]["text"], "lowres");
        assert_eq!(prepared["12"]["inputs"]["noise_seed"], 1234);
        assert_eq!(workflow.output_node, "13");
    }

    #[test]
    fn rejects_graphs_without_sampler_or_output() {
        let graph = json!({"1": {"class_type": "CLIPTextEncode", "inputs": {"text": ""}}});
        assert!(SceneWorkflow::from_graph(graph).is_err());
        assert!(SceneWorkflow::from_graph(json!([1, 2])).is_err());
    }
}
