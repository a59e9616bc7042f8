pub mod character_card;
pub mod comfy_client;
pub mod comfy_workflow;
pub mod config;
pub mod consistency;
pub mod conversation;
pub mod database;
pub mod error;
pub mod events;
pub mod image_client;
pub mod jobs;
pub mod llm_client;
pub mod presence;
pub mod runtime;
pub mod scene;
pub mod schedule;
pub mod store;
pub mod tags;
pub mod visual;

#[cfg(test)]
pub(crate) mod testing;
