//! Per-role process sampling into CSV files.

use std::path::{Path, PathBuf};

use serde_json::json;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use packgrid_core::epoch_millis;

use crate::constants::PERF_HEADER;
use crate::controller::{EngineController, finish};
use crate::error::{EngineError, EngineResult};

const PS_FORMAT: &str = "pid=,pcpu=,vsz=,rss=,cputimes=,etimes=,thcount=,cmd=";

/// One `ps` line of the sampled process.
#[derive(Debug, Clone, PartialEq)]
pub struct PerfSample {
    pub pid: u32,
    pub pcpu: f64,
    pub vsz: u64,
    pub rss: u64,
    pub cputimes: u64,
    pub etimes: u64,
    pub thcount: u32,
}

impl PerfSample {
    fn csv(&self, timestamp: u64) -> String {
        format!(
            "{},{},{},{},{},{},{},{timestamp}",
            self.pid, self.pcpu, self.vsz, self.rss, self.cputimes, self.etimes, self.thcount
        )
    }
}

/// Find the line of `binary` in `ps` output. An empty `binary` takes the
/// first process that is not `ps` itself.
pub fn parse_ps_sample(output: &str, binary: &str) -> Option<PerfSample> {
    output.lines().find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 8 {
            return None;
        }
        let cmd = fields[7..].join(" ");
        let wanted = if binary.is_empty() {
            !cmd.starts_with("ps ")
        } else {
            cmd.contains(binary)
        };
        if !wanted {
            return None;
        }
        Some(PerfSample {
            pid: fields[0].parse().ok()?,
            pcpu: fields[1].parse().ok()?,
            vsz: fields[2].parse().ok()?,
            rss: fields[3].parse().ok()?,
            cputimes: fields[4].parse().ok()?,
            etimes: fields[5].parse().ok()?,
            thcount: fields[6].parse().ok()?,
        })
    })
}

/// Append one record to `<dir>/<pack>.<role>.<clone>.0`, writing the header
/// when the file is new.
pub async fn append_sample(
    dir: &Path,
    pack_id: &str,
    pcid: &str,
    clone_id: u32,
    sample: &PerfSample,
    timestamp: u64,
) -> std::io::Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(format!("{pack_id}.{pcid}.{clone_id}.0"));
    let is_new = !tokio::fs::try_exists(&path).await?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await?;
    let mut text = String::new();
    if is_new {
        text.push_str(PERF_HEADER);
        text.push('\n');
    }
    text.push_str(&sample.csv(timestamp));
    text.push('\n');
    file.write_all(text.as_bytes()).await?;
    file.flush().await?;
    Ok(path)
}

impl EngineController {
    /// Sample every role container of a pack once. Returns how many
    /// records were written.
    pub async fn collect_performance(&self, pack_id: &str) -> EngineResult<usize> {
        let this = self.clone();
        let id = pack_id.to_string();
        let key = id.clone();
        let handle = self.queues().data_collection.post_unique(
            "collect_performance",
            json!({ "pack_id": pack_id }),
            move |t| {
                t.kind == "collect_performance" && t.params["pack_id"].as_str() == Some(key.as_str())
            },
            move || async move { this.sample_pack(&id).await },
        );
        finish(handle).await
    }

    async fn sample_pack(&self, pack_id: &str) -> EngineResult<usize> {
        let pack = self
            .registry()
            .packs
            .get(pack_id)
            .ok_or_else(|| EngineError::not_found("pack", pack_id))?;
        let dir = self.config().perf_logs_dir();
        let mut written = 0;

        for c in pack.role_containers() {
            let Some(container_id) = c.id.clone() else {
                continue;
            };
            if c.no_ps || c.state.as_deref().is_some_and(|s| s != "running") {
                continue;
            }
            let cmd = vec!["ps".to_string(), "-xo".to_string(), PS_FORMAT.to_string()];
            let output = match self.exec_in_container(&container_id, cmd).await {
                Ok(output) => output,
                Err(e) => {
                    warn!(engine = %self.inner.id, pack = %pack_id, container = %c.name, error = %e, "ps failed");
                    continue;
                }
            };
            if output.contains("executable file not found") {
                debug!(engine = %self.inner.id, container = %c.name, "no ps in container");
                let name = c.name.clone();
                self.registry()
                    .packs
                    .update(pack_id, move |p| {
                        if let Some(rec) = p.containers.iter_mut().find(|r| r.name == name) {
                            rec.no_ps = true;
                        }
                    })
                    .await?;
                continue;
            }

            let binary = c.app_bin_path.clone().unwrap_or_default();
            match parse_ps_sample(&output, &binary) {
                Some(sample) => {
                    append_sample(&dir, pack_id, &c.pcid, c.clone_id, &sample, epoch_millis())
                        .await?;
                    written += 1;
                }
                None => {
                    debug!(engine = %self.inner.id, container = %c.name, %binary, "sampled process not found");
                }
            }
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PS: &str = "\
    1  0.0   4360   748      0   812   1 /bin/sh -c /app/server --port 80
    7 12.5 812344 20480     33   810  14 /app/server --port 80
   99  0.0   1516   512      0     0   1 ps -xo pid=,pcpu=,vsz=,rss=,cputimes=,etimes=,thcount=,cmd=
";

    #[test]
    fn picks_the_binary_line() {
        let sample = parse_ps_sample(PS, "/app/server --port").unwrap();
        assert_eq!(sample.pid, 1);

        let sample = parse_ps_sample(&PS.replace("/bin/sh -c /app/server --port 80", "/bin/sh"), "/app/server").unwrap();
        assert_eq!(sample.pid, 7);
        assert_eq!(sample.thcount, 14);
        assert_eq!(sample.rss, 20480);
        assert!((sample.pcpu - 12.5).abs() < f64::EPSILON);
    }

    #[test]
    fn missing_binary_yields_nothing() {
        assert!(parse_ps_sample(PS, "/opt/other").is_none());
        assert!(parse_ps_sample("garbage", "").is_none());
    }

    #[tokio::test]
    async fn header_is_written_once() {
        let tmp = tempfile::tempdir().unwrap();
        let sample = parse_ps_sample(PS, "").unwrap();
        let path = append_sample(tmp.path(), "1_e1", "web", 0, &sample, 10).await.unwrap();
        append_sample(tmp.path(), "1_e1", "web", 0, &sample, 20).await.unwrap();

        assert!(path.ends_with("1_e1.web.0.0"));
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], PERF_HEADER);
        assert_eq!(lines[1], "1,0,4360,748,0,812,1,10");
        assert!(lines[2].ends_with(",20"));
    }
}
