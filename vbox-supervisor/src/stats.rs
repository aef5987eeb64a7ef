//! Network counters and log retrieval.

use std::fs;
use std::sync::OnceLock;

use regex::Regex;
use tracing::warn;
use vbox_core::error::{Result, VboxError};

use crate::VboxVm;

/// Upload budget for log tails.
const LOG_TAIL_BYTES: usize = 16 * 1024;

/// Sum every `c="<number>"` counter attribute in a statistics XML fragment.
pub(crate) fn sum_counters(output: &str) -> f64 {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r#"c="(\d+)""#).expect("static regex"));
    re.captures_iter(output)
        .filter_map(|caps| caps.get(1))
        .filter_map(|m| m.as_str().parse::<f64>().ok())
        .sum()
}

/// Keep at most the trailing `max` bytes, then drop the partial opening
/// line so the tail starts at a line boundary.
pub(crate) fn tail_at_line_boundary(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    let tail = &text[start..];
    match tail.find('\n') {
        Some(pos) => tail[pos + 1..].to_string(),
        None => tail.to_string(),
    }
}

impl VboxVm {
    /// Cumulative bytes the guest has transmitted, summed across devices.
    pub fn get_network_bytes_sent(&self) -> Result<f64> {
        let output = self
            .manage
            .command("get bytes sent")
            .args(["debugvm", self.vm_name.as_str(), "statistics"])
            .args(["--pattern", "/Devices/*/TransmitBytes"])
            .run()?;
        Ok(sum_counters(&output))
    }

    /// Cumulative bytes the guest has received, summed across devices.
    pub fn get_network_bytes_received(&self) -> Result<f64> {
        let output = self
            .manage
            .command("get bytes received")
            .args(["debugvm", self.vm_name.as_str(), "statistics"])
            .args(["--pattern", "/Devices/*/ReceiveBytes"])
            .run()?;
        Ok(sum_counters(&output))
    }

    /// The trailing 16 KiB of the VM frontend's log.
    pub fn get_vm_log(&self) -> Result<String> {
        let output = match self
            .manage
            .command("get vm log")
            .args(["showvminfo", self.vm_name.as_str(), "--log", "0"])
            .probe()
            .run()
        {
            Ok(output) => output,
            // VBoxManage occasionally exits non-zero while still dumping a
            // valid log; a present header means the dump is usable.
            Err(err) => {
                let dump = err
                    .output()
                    .filter(|output| output.contains("Process ID: "))
                    .map(str::to_string);
                match dump {
                    Some(output) => output,
                    None => return Err(err),
                }
            }
        };

        Ok(tail_at_line_boundary(&output, LOG_TAIL_BYTES))
    }

    /// The trailing 16 KiB of the hypervisor service log.
    ///
    /// The log is copied into the slot directory first to dodge the file
    /// locks the service keeps on it (and so the copy can be uploaded).
    pub fn get_system_log(&self) -> Result<String> {
        let source = self.environment.home_directory.join("VBoxSVC.log");
        let destination = self.slot_dir().join("VBoxSVC.log");

        if !source.exists() {
            warn!(
                "Could not find the Hypervisor System Log at '{}'.",
                source.display()
            );
            return Err(VboxError::NotFound(source.display().to_string()));
        }

        fs::copy(&source, &destination)?;
        let log = fs::read_to_string(&destination)?.replace('\r', "");
        Ok(tail_at_line_boundary(&log, LOG_TAIL_BYTES))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sum_counters_from_statistics_fragment() {
        let output = r#"<?xml version="1.0" encoding="UTF-8" standalone="no"?>
<Statistics>
<Counter c="397229" unit="bytes" name="/Devices/PCNet0/TransmitBytes"/>
<Counter c="256" unit="bytes" name="/Devices/PCNet1/TransmitBytes"/>
</Statistics>
"#;
        assert_eq!(sum_counters(output), 397_485.0);
    }

    #[test]
    fn test_sum_counters_empty_fragment() {
        assert_eq!(sum_counters("<Statistics>\n</Statistics>\n"), 0.0);
    }

    #[test]
    fn test_tail_shorter_than_limit_is_unchanged() {
        let text = "line one\nline two\n";
        assert_eq!(tail_at_line_boundary(text, 16_384), text);
    }

    #[test]
    fn test_tail_drops_partial_opening_line() {
        let mut text = String::new();
        for i in 0..2_000 {
            text.push_str(&format!("log line number {}\n", i));
        }
        let tail = tail_at_line_boundary(&text, 1_024);
        assert!(tail.len() <= 1_024);
        // The tail must start at a line boundary, not mid-line.
        assert!(tail.starts_with("log line number "));
        assert!(text.ends_with(&tail));
    }

    #[test]
    fn test_tail_with_single_long_line() {
        let text = "x".repeat(4_096);
        let tail = tail_at_line_boundary(&text, 1_024);
        assert_eq!(tail.len(), 1_024);
    }
}
