/*!
# GPUTasker Protocol

Shared wire contract between the Master and the per-node GPU agents.

Three surfaces live here:

- [`report`] — JSON bodies for the two Master ingress endpoints
  (`/api/v1/report_gpu/` and `/api/v1/report_tasks/`) and their ack
  responses.
- [`meta`] — the per-run-log metadata file a launched workload writes to
  `~/.gputasker/running_tasks/<log_id>.json` and the agent scans on every
  tick.
- [`marker`] — the first-stdout-line contract emitted by the remote
  bootstrap (`__GPUTASKER_REMOTE__ pid=<pid> pgid=<pgid>`), which the
  Master parses to learn the remote PID and process group.
*/

pub mod marker;
pub mod meta;
pub mod report;

pub use marker::{parse_marker, MARKER_PREFIX};
pub use meta::RunningTaskMeta;
pub use report::{
    GpuProcess, GpuReport, GpuReportAck, GpuSample, TaskHeartbeat, TaskReport, TaskReportAck,
};
