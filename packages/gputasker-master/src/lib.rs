/*!
# GPUTasker Master

Central service of the GPU task orchestrator: HTTP report ingress, the
SQLite-backed store, the scheduler loop, per-task supervisors and the SSH
launcher for agents and workloads.
*/

pub mod config;
pub mod models;
pub mod notify;
pub mod remote;
pub mod report_api;
pub mod scheduler;
pub mod store;
pub mod supervisor;
