//! snapvault: btrfs snapshot chains archived to an S3-compatible object
//! store, and restored by replaying a manifest chain back onto a target
//! path.

pub mod chunker;
pub mod config;
pub mod lock;
pub mod manifest;
pub mod metrics;
pub mod object_store;
pub mod orchestrator;
pub mod pathenv;
pub mod planner;
pub mod receive_process;
pub mod send_process;
pub mod snapshot;
pub mod state;
pub mod uploader;
pub mod verify;
