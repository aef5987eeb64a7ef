//! Job-provided VM configuration.
//!
//! The outer wrapper deserializes the descriptor from its job file and hands
//! it to the supervisor read-only; nothing in here changes over a run.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Declarative description of the guest VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmDescriptor {
    /// Name the VM is registered under in the hypervisor registry.
    pub master_name: String,

    #[serde(default)]
    pub master_description: String,

    /// Hypervisor guest OS selector, e.g. `Linux26_64`. A `_64` substring
    /// marks a 64-bit guest.
    pub os_type_tag: String,

    /// Kept as a string for direct CLI interpolation.
    #[serde(default = "default_cpu_count")]
    pub cpu_count: String,

    pub memory_mb: u32,

    /// One of ide, sata, scsi, sas.
    #[serde(default = "default_controller_type")]
    pub disk_controller_type: String,

    #[serde(default = "default_controller_model")]
    pub disk_controller_model: String,

    /// Primary virtual hard disk, relative to the slot directory.
    pub image_filename: String,

    #[serde(default)]
    pub floppy_image_filename: String,

    #[serde(default)]
    pub enable_network: bool,
    #[serde(default)]
    pub enable_shared_directory: bool,
    #[serde(default)]
    pub enable_floppyio: bool,
    #[serde(default)]
    pub enable_remotedesktop: bool,
    #[serde(default)]
    pub enable_cern_dataformat: bool,
    #[serde(default = "default_true")]
    pub headless: bool,
    #[serde(default)]
    pub register_only: bool,

    /// Guest port to forward to; zero disables port forwarding.
    #[serde(default)]
    pub pf_guest_port: u16,
    /// Preferred host port; zero means allocate an ephemeral one.
    #[serde(default)]
    pub pf_host_port: u16,
}

impl Default for VmDescriptor {
    fn default() -> Self {
        Self {
            master_name: String::new(),
            master_description: String::new(),
            os_type_tag: String::new(),
            cpu_count: default_cpu_count(),
            memory_mb: 0,
            disk_controller_type: default_controller_type(),
            disk_controller_model: default_controller_model(),
            image_filename: String::new(),
            floppy_image_filename: String::new(),
            enable_network: false,
            enable_shared_directory: false,
            enable_floppyio: false,
            enable_remotedesktop: false,
            enable_cern_dataformat: false,
            headless: true,
            register_only: false,
            pf_guest_port: 0,
            pf_host_port: 0,
        }
    }
}

impl VmDescriptor {
    /// 64-bit guests require hardware virtualization, so the acceleration
    /// check is skipped for them entirely.
    pub fn is_64bit(&self) -> bool {
        self.os_type_tag.contains("_64")
    }
}

fn default_cpu_count() -> String {
    "1".to_string()
}

fn default_controller_type() -> String {
    "ide".to_string()
}

fn default_controller_model() -> String {
    "PIIX4".to_string()
}

fn default_true() -> bool {
    true
}

/// Facts about the volunteer host and client, supplied by the outer wrapper.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostContext {
    pub project_dir: PathBuf,
    pub using_sandbox: bool,
    /// Space-separated CPU feature flags as reported by the client
    /// (`vmx`, `svm`, `hypervisor`, …).
    #[serde(default)]
    pub cpu_features: String,
    #[serde(default)]
    pub client_version: ClientVersion,
    /// Whether a previous execution already failed with VT-x enabled.
    #[serde(default)]
    pub vm_extensions_disabled: bool,
}

impl HostContext {
    pub fn has_cpu_feature(&self, feature: &str) -> bool {
        self.cpu_features
            .split_whitespace()
            .any(|flag| flag == feature)
    }
}

/// Version of the volunteer-computing client running this job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientVersion {
    pub major: u32,
    pub minor: u32,
    pub release: u32,
}

impl ClientVersion {
    pub fn new(major: u32, minor: u32, release: u32) -> Self {
        Self {
            major,
            minor,
            release,
        }
    }

    /// True when this client is strictly newer than the given version.
    pub fn is_newer_than(&self, major: u32, minor: u32, release: u32) -> bool {
        (self.major, self.minor, self.release) > (major, minor, release)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_64bit_detection() {
        let mut descriptor = VmDescriptor {
            os_type_tag: "Linux26_64".into(),
            ..Default::default()
        };
        assert!(descriptor.is_64bit());

        descriptor.os_type_tag = "Linux26".into();
        assert!(!descriptor.is_64bit());
    }

    #[test]
    fn test_descriptor_defaults() {
        let descriptor = VmDescriptor::default();
        assert_eq!(descriptor.disk_controller_type, "ide");
        assert_eq!(descriptor.disk_controller_model, "PIIX4");
        assert_eq!(descriptor.cpu_count, "1");
        assert!(descriptor.headless);
        assert!(!descriptor.register_only);
    }

    #[test]
    fn test_cpu_feature_token_match() {
        let host = HostContext {
            cpu_features: "fpu vme svm lm".into(),
            ..Default::default()
        };
        assert!(host.has_cpu_feature("svm"));
        assert!(!host.has_cpu_feature("vmx"));
        // Substrings of other flags must not match.
        assert!(!host.has_cpu_feature("vm"));
    }

    #[test]
    fn test_client_version_ordering() {
        let client = ClientVersion::new(7, 2, 16);
        assert!(!client.is_newer_than(7, 2, 16));
        assert!(client.is_newer_than(7, 2, 15));
        assert!(client.is_newer_than(6, 9, 99));
        assert!(!client.is_newer_than(7, 3, 0));

        assert!(ClientVersion::new(7, 2, 17).is_newer_than(7, 2, 16));
        assert!(ClientVersion::new(8, 0, 0).is_newer_than(7, 2, 16));
    }
}
