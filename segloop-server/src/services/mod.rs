//! Workflows and the external tools they drive

pub mod cvat_client;
pub mod dataset_insert;
pub mod discard;
pub mod export_workflow;
pub mod import_workflow;
pub mod inference;
pub mod ingest;
pub mod nnunet;
pub mod poller;
pub mod tool_runner;

#[cfg(test)]
pub(crate) mod testing;
