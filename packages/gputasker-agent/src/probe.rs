//! Local GPU probing: a thin shell over `nvidia-smi`, joined against `ps`
//! for process owners. Unparsable lines are skipped, never fatal.

use std::collections::HashMap;
use std::process::Command;

use gputasker_protocol::{GpuProcess, GpuSample};

fn run_probe(program: &str, args: &[&str]) -> String {
    match Command::new(program).args(args).output() {
        Ok(output) if output.status.success() => {
            String::from_utf8_lossy(&output.stdout).trim().to_string()
        }
        Ok(output) => {
            log::warn!(
                "{} failed: {}",
                program,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            String::new()
        }
        Err(err) => {
            log::warn!("failed to run {}: {}", program, err);
            String::new()
        }
    }
}

/// Parse `--query-gpu` CSV lines: uuid, index, name, utilization,
/// memory.total, memory.used.
pub fn parse_gpu_lines(raw: &str) -> Vec<GpuSample> {
    let mut gpus = Vec::new();
    for line in raw.lines() {
        let parts: Vec<&str> = line.split(',').map(str::trim).collect();
        if parts.len() < 6 {
            continue;
        }
        let (Ok(index), Ok(utilization), Ok(memory_total), Ok(memory_used)) = (
            parts[1].parse::<u32>(),
            parts[3].parse::<u32>(),
            parts[4].parse::<u64>(),
            parts[5].parse::<u64>(),
        ) else {
            continue;
        };
        gpus.push(GpuSample {
            uuid: parts[0].to_string(),
            index,
            name: parts[2].to_string(),
            utilization,
            memory_total,
            memory_used,
            processes: Vec::new(),
        });
    }
    gpus
}

/// Parse `--query-compute-apps` CSV lines (gpu_uuid, pid, process_name,
/// used_memory) and attach them to the matching GPU. Returns the PIDs seen.
pub fn attach_app_lines(gpus: &mut [GpuSample], raw: &str) -> Vec<i64> {
    let by_uuid: HashMap<String, usize> = gpus
        .iter()
        .enumerate()
        .map(|(i, gpu)| (gpu.uuid.clone(), i))
        .collect();
    let mut pids = Vec::new();
    for line in raw.lines() {
        let parts: Vec<&str> = line.split(',').map(str::trim).collect();
        if parts.len() < 4 {
            continue;
        }
        let (Ok(pid), Ok(used_memory)) = (parts[1].parse::<i64>(), parts[3].parse::<u64>()) else {
            continue;
        };
        if let Some(&slot) = by_uuid.get(parts[0]) {
            gpus[slot].processes.push(GpuProcess {
                pid,
                command: parts[2].to_string(),
                gpu_memory_usage: used_memory,
                username: "unknown".to_string(),
            });
            pids.push(pid);
        }
    }
    pids
}

/// Parse `ps -o user= -o pid=` output into a PID → username map.
pub fn parse_ps_lines(raw: &str) -> HashMap<i64, String> {
    let mut map = HashMap::new();
    for line in raw.lines() {
        let mut parts = line.split_whitespace();
        let (Some(user), Some(pid)) = (parts.next(), parts.next()) else {
            continue;
        };
        if let Ok(pid) = pid.parse::<i64>() {
            map.insert(pid, user.to_string());
        }
    }
    map
}

/// One full device probe: devices, compute apps, process owners.
pub fn collect_gpu_data() -> Vec<GpuSample> {
    let gpu_raw = run_probe(
        "nvidia-smi",
        &[
            "--query-gpu=uuid,index,gpu_name,utilization.gpu,memory.total,memory.used",
            "--format=csv,noheader,nounits",
        ],
    );
    if gpu_raw.is_empty() {
        return Vec::new();
    }
    let mut gpus = parse_gpu_lines(&gpu_raw);

    let apps_raw = run_probe(
        "nvidia-smi",
        &[
            "--query-compute-apps=gpu_uuid,pid,process_name,used_memory",
            "--format=csv,noheader,nounits",
        ],
    );
    let pids = attach_app_lines(&mut gpus, &apps_raw);

    if !pids.is_empty() {
        let pid_list = pids
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let ps_raw = run_probe("ps", &["-o", "user=", "-o", "pid=", "-p", &pid_list]);
        let owners = parse_ps_lines(&ps_raw);
        for gpu in &mut gpus {
            for process in &mut gpu.processes {
                if let Some(user) = owners.get(&process.pid) {
                    process.username = user.clone();
                }
            }
        }
    }

    gpus
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_device_lines_and_skips_short_ones() {
        let raw = "GPU-aaa, 0, NVIDIA A100-SXM4-80GB, 17, 81920, 1024\n\
                   GPU-bbb, 1, NVIDIA A100-SXM4-80GB, 0, 81920, 4\n\
                   broken line\n\
                   GPU-ccc, x, bad-index, 0, 81920, 0";
        let gpus = parse_gpu_lines(raw);
        assert_eq!(gpus.len(), 2);
        assert_eq!(gpus[0].uuid, "GPU-aaa");
        assert_eq!(gpus[0].utilization, 17);
        assert_eq!(gpus[1].index, 1);
    }

    #[test]
    fn attaches_apps_to_known_uuids_only() {
        let mut gpus = parse_gpu_lines("GPU-aaa, 0, A100, 0, 81920, 0");
        let pids = attach_app_lines(
            &mut gpus,
            "GPU-aaa, 4242, python, 2048\nGPU-zzz, 9, ghost, 1\nGPU-aaa, notanint, x, 1",
        );
        assert_eq!(pids, vec![4242]);
        assert_eq!(gpus[0].processes.len(), 1);
        assert_eq!(gpus[0].processes[0].command, "python");
        assert_eq!(gpus[0].processes[0].username, "unknown");
    }

    #[test]
    fn joins_usernames_from_ps() {
        let owners = parse_ps_lines("alice     4242\nbob 7\nnoise\n");
        assert_eq!(owners.get(&4242).map(String::as_str), Some("alice"));
        assert_eq!(owners.get(&7).map(String::as_str), Some("bob"));
        assert_eq!(owners.len(), 2);
    }
}
