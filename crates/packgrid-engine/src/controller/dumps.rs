//! Crash-dump inspection through the support sidecar.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::json;
use tracing::debug;

use packgrid_core::{CorePatternCheck, DumpsReport, RoleDumps, epoch_millis};

use crate::constants::{CORE_PATTERN, SIDECAR_DUMPS_ROOT, SUPPORT_PCID};
use crate::controller::{EngineController, finish};
use crate::error::{EngineError, EngineResult};

/// Written by the kernel hook: `core.<exe>.<pid>...`
static KERNEL_DUMP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^core\..+\.\d+").expect("static regex"));

static ANY_DUMP: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^core\..+").expect("static regex"));

/// Sort one role's dump directory listing.
///
/// A file naming one of `markers` (short container ids or hostnames of the
/// role's containers) between dots is the container's own; other files are
/// kernel or manual dumps by name shape. Anything else is ignored.
pub fn classify_dumps<'a>(files: impl IntoIterator<Item = &'a str>, markers: &[String]) -> RoleDumps {
    let mut out = RoleDumps::default();
    for file in files {
        let file = file.trim();
        if file.is_empty() {
            continue;
        }
        if markers.iter().any(|m| !m.is_empty() && file.contains(&format!(".{m}."))) {
            out.own.push(file.to_string());
        } else if KERNEL_DUMP.is_match(file) {
            out.kernel.push(file.to_string());
        } else if ANY_DUMP.is_match(file) {
            out.manual.push(file.to_string());
        }
    }
    out
}

impl EngineController {
    /// Read the host core pattern and list every role's dump directory.
    ///
    /// The result is stored on the pack together with the check time.
    pub async fn collect_dumps(&self, pack_id: &str) -> EngineResult<DumpsReport> {
        let this = self.clone();
        let id = pack_id.to_string();
        let key = id.clone();
        let handle = self.queues().other.post_unique(
            "get_dumps_info",
            json!({ "pack_id": pack_id }),
            move |t| t.kind == "get_dumps_info" && t.params["pack_id"].as_str() == Some(key.as_str()),
            move || async move { this.inspect_dumps(&id).await },
        );
        finish(handle).await
    }

    async fn inspect_dumps(&self, pack_id: &str) -> EngineResult<DumpsReport> {
        let pack = self
            .registry()
            .packs
            .get(pack_id)
            .ok_or_else(|| EngineError::not_found("pack", pack_id))?;
        let support = pack
            .containers
            .iter()
            .find(|c| c.is_system && c.pcid == SUPPORT_PCID)
            .and_then(|c| c.id.clone())
            .ok_or_else(|| EngineError::Rejected(format!("pack {pack_id} has no support container")))?;

        let current = self
            .exec_in_container(
                &support,
                vec!["cat".into(), "/proc/sys/kernel/core_pattern".into()],
            )
            .await?
            .trim()
            .to_string();
        let mut report = DumpsReport {
            config: CorePatternCheck {
                is_ok: current == CORE_PATTERN,
                current,
                expected: CORE_PATTERN.to_string(),
            },
            ..Default::default()
        };

        let mut roles: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for c in pack.role_containers() {
            let markers = roles.entry(c.pcid.as_str()).or_default();
            if let Some(id) = &c.id {
                markers.push(id.chars().take(12).collect());
            }
            if let Some(hostname) = c.spec.as_ref().and_then(|s| s.hostname.clone()) {
                markers.push(hostname);
            }
        }

        for (pcid, markers) in roles {
            let dir = format!("{SIDECAR_DUMPS_ROOT}/{pcid}");
            match self
                .exec_in_container(&support, vec!["ls".into(), "-1".into(), dir])
                .await
            {
                Ok(listing) => {
                    report
                        .dumps
                        .insert(pcid.to_string(), classify_dumps(listing.lines(), &markers));
                }
                Err(e) => report.errors.push(format!("{pcid}: {e}")),
            }
        }

        let stored = report.clone();
        self.registry()
            .packs
            .update(pack_id, move |p| {
                p.last_dumps_check = Some(epoch_millis());
                p.last_dumps_info = Some(stored);
            })
            .await?;
        debug!(
            engine = %self.inner.id,
            pack = %pack_id,
            core_pattern_ok = report.config.is_ok,
            roles = report.dumps.len(),
            "dumps inspected"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dumps_are_split_by_origin() {
        let files = [
            "core.server.4242.0123456789ab.1700000000",
            "core.server.77.othershost.1700000001",
            "core.manual-gcore",
            "notes.txt",
            "",
        ];
        let dumps = classify_dumps(files, &["0123456789ab".to_string()]);
        assert_eq!(dumps.own, vec!["core.server.4242.0123456789ab.1700000000"]);
        assert_eq!(dumps.kernel, vec!["core.server.77.othershost.1700000001"]);
        assert_eq!(dumps.manual, vec!["core.manual-gcore"]);
    }

    #[test]
    fn empty_markers_never_match() {
        let dumps = classify_dumps(["core..x"], &[String::new()]);
        assert!(dumps.own.is_empty());
        assert_eq!(dumps.manual, vec!["core..x"]);
    }
}
