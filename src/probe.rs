//! Host status probes.
//!
//! Boundary hooks for the status collector: shell out, capture combined
//! output, report success. Probe output feeds the status server verbatim.

use tokio::process::Command;

const DATA_DELIMITER: &str = "\t\n\t\n";

/// Run `sh -c <cmd>` and capture stdout+stderr.
pub async fn run_command(cmd: &str) -> (bool, String) {
    match Command::new("sh").arg("-c").arg(cmd).output().await {
        Ok(out) => {
            let mut text = String::from_utf8_lossy(&out.stdout).into_owned();
            text.push_str(&String::from_utf8_lossy(&out.stderr));
            (out.status.success(), text)
        }
        Err(e) => (false, format!("failed to run `{cmd}`: {e}")),
    }
}

pub async fn disk_space() -> (bool, String) {
    run_command("df -h").await
}

pub async fn uptime() -> (bool, String) {
    run_command("uptime").await
}

pub async fn current_load() -> (bool, String) {
    run_command("cat /proc/loadavg").await
}

/// The full report a status round collects from this host.
pub async fn status_report() -> (bool, String) {
    let (ok_disk, disk) = disk_space().await;
    let (ok_up, up) = uptime().await;
    let (ok_load, load) = current_load().await;
    let report = [disk, up, load].join(DATA_DELIMITER);
    (ok_disk && ok_up && ok_load, report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_command_captures_output() {
        let (ok, out) = run_command("echo probe-works").await;
        assert!(ok);
        assert!(out.contains("probe-works"));
    }

    #[tokio::test]
    async fn failing_command_reports_failure() {
        let (ok, _) = run_command("exit 3").await;
        assert!(!ok);
    }

    #[tokio::test]
    async fn status_report_concatenates_sections() {
        let (_, report) = status_report().await;
        assert_eq!(report.matches(DATA_DELIMITER).count(), 2);
    }
}
