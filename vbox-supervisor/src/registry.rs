//! VM registration and discovery.
//!
//! `register_vm` turns the declarative descriptor into a registered VM with
//! a storage controller, the primary disk, and the capability-dependent
//! extras attached. The ordering is fixed because each CLI subcommand has
//! narrow preconditions. `deregister_vm` is the inverse and is failure
//! tolerant throughout so teardown always proceeds.

use std::sync::OnceLock;

use regex::Regex;
use tracing::{info, warn};
use vbox_core::error::Result;

use crate::floppy::FloppyChannel;
use crate::{VboxVm, FLOPPY_CONTROLLER, HARD_DISK_CONTROLLER};

/// Pull the first `(UUID: …)` value out of CLI output.
pub(crate) fn extract_uuid(output: &str) -> Option<&str> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"\(UUID: ([^)]+)\)").expect("static regex"));
    re.captures(output)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

impl VboxVm {
    /// Create and register a VM matching the descriptor.
    ///
    /// On success the VM is registered with the hypervisor with its disk
    /// attached and capability extras configured; the caller is expected to
    /// run `deregister_vm(true)` on failure so the slot is left clean.
    pub fn register_vm(&mut self) -> Result<()> {
        // Reset the name in case it still holds a stale VM's UUID.
        self.vm_name = self.descriptor.master_name.clone();

        info!("Registering VM. ({})", self.vm_name);
        let slot = self.slot_dir().display().to_string();
        self.manage
            .command("register")
            .args(["createvm", "--name", self.vm_name.as_str()])
            .args(["--basefolder", slot.as_str()])
            .args(["--ostype", self.descriptor.os_type_tag.as_str()])
            .arg("--register")
            .run()?;

        let _ = self
            .manage
            .command("modifydescription")
            .args(["modifyvm", self.vm_name.as_str()])
            .args(["--description", self.descriptor.master_description.as_str()])
            .probe()
            .run();

        info!("Setting CPU count for VM. ({})", self.descriptor.cpu_count);
        self.manage
            .command("modifycpu")
            .args(["modifyvm", self.vm_name.as_str()])
            .args(["--cpus", self.descriptor.cpu_count.as_str()])
            .run()?;

        info!("Setting memory size for VM. ({}MB)", self.descriptor.memory_mb);
        let memory = self.descriptor.memory_mb.to_string();
        self.manage
            .command("modifymem")
            .args(["modifyvm", self.vm_name.as_str()])
            .args(["--memory", memory.as_str()])
            .run()?;

        info!("Setting chipset options for VM.");
        self.manage
            .command("modifychipset")
            .args(["modifyvm", self.vm_name.as_str()])
            .args(["--acpi", "on", "--ioapic", "on"])
            .run()?;

        info!("Setting boot options for VM.");
        self.manage
            .command("modifyboot")
            .args(["modifyvm", self.vm_name.as_str()])
            .args(["--boot1", "disk", "--boot2", "none", "--boot3", "none", "--boot4", "none"])
            .run()?;

        info!("Setting network configuration for VM.");
        self.manage
            .command("modifynetwork")
            .args(["modifyvm", self.vm_name.as_str()])
            .args(["--nic1", "nat", "--natdnsproxy1", "on", "--cableconnected1", "off"])
            .run()?;

        // Strip every guest-facing convenience the workload does not need.
        for (operation, options) in [
            ("modifyusb", &["--usb", "off"][..]),
            ("modifycom", &["--uart1", "off", "--uart2", "off"][..]),
            ("modifylpt", &["--lpt1", "off", "--lpt2", "off"][..]),
            ("modifyaudio", &["--audio", "none"][..]),
            ("modifyclipboard", &["--clipboard", "disabled"][..]),
            ("modifydragdrop", &["--draganddrop", "disabled"][..]),
        ] {
            let _ = self
                .manage
                .command(operation)
                .args(["modifyvm", self.vm_name.as_str()])
                .args(options.iter().copied())
                .probe()
                .run();
        }

        // 64-bit guests require hardware virtualization; only 32-bit guests
        // get the acceleration check.
        if !self.descriptor.is_64bit() && self.should_disable_hw_virtualization() {
            info!("Disabling hardware acceleration support for virtualization.");
            self.manage
                .command("VT-x/AMD-V support")
                .args(["modifyvm", self.vm_name.as_str()])
                .args(["--hwvirtex", "off"])
                .run()?;
        }

        info!("Adding storage controller to VM.");
        let mut controller = self
            .manage
            .command("add storage controller (fixed disk)")
            .args(["storagectl", self.vm_name.as_str()])
            .args(["--name", HARD_DISK_CONTROLLER])
            .args(["--add", self.descriptor.disk_controller_type.as_str()])
            .args(["--controller", self.descriptor.disk_controller_model.as_str()])
            .args(["--hostiocache", "off"]);
        if self.descriptor.disk_controller_type.eq_ignore_ascii_case("sata") {
            controller = controller.args(["--sataportcount", "1"]);
        }
        controller.run()?;

        info!(
            "Adding virtual disk drive to VM. ({})",
            self.descriptor.image_filename
        );
        let disk = self.disk_image_path().display().to_string();
        self.manage
            .command("storage attach (fixed disk)")
            .args(["storageattach", self.vm_name.as_str()])
            .args(["--storagectl", HARD_DISK_CONTROLLER])
            .args(["--port", "0", "--device", "0", "--type", "hdd"])
            .args(["--setuuid", ""])
            .args(["--medium", disk.as_str()])
            .run()?;

        if self.descriptor.enable_floppyio {
            self.manage
                .command("add storage controller (floppy)")
                .args(["storagectl", self.vm_name.as_str()])
                .args(["--name", FLOPPY_CONTROLLER])
                .args(["--add", "floppy"])
                .run()?;

            // The image is created at registration time for use by the VM.
            self.floppy = Some(FloppyChannel::create(&self.floppy_image_path())?);

            info!("Adding virtual floppy disk drive to VM.");
            let floppy = self.floppy_image_path().display().to_string();
            self.manage
                .command("storage attach (floppy disk)")
                .args(["storageattach", self.vm_name.as_str()])
                .args(["--storagectl", FLOPPY_CONTROLLER])
                .args(["--port", "0", "--device", "0"])
                .args(["--medium", floppy.as_str()])
                .run()?;
        }

        if self.descriptor.enable_network {
            self.set_network_access(true)?;

            if self.descriptor.pf_guest_port != 0 {
                if self.pf_host_port == 0 {
                    self.get_port_forwarding_port()?;
                }

                info!("Enabling VM firewall rules.");
                let rule = format!(
                    "vboxwrapper,tcp,127.0.0.1,{},,{}",
                    self.pf_host_port, self.descriptor.pf_guest_port
                );
                self.manage
                    .command("add updated port forwarding rule")
                    .args(["modifyvm", self.vm_name.as_str()])
                    .args(["--natpf1", rule.as_str()])
                    .run()?;
            }
        }

        if self.descriptor.enable_remotedesktop {
            info!("Enabling remote desktop for VM.");
            if !self.is_extpack_installed() {
                warn!("Required extension pack not installed, remote desktop not enabled.");
            } else {
                self.get_remote_desktop_port()?;
                let port = self.rd_host_port.to_string();
                self.manage
                    .command("remote desktop")
                    .args(["modifyvm", self.vm_name.as_str()])
                    .args(["--vrde", "on"])
                    .args(["--vrdeextpack", "default"])
                    .args(["--vrdeauthlibrary", "default"])
                    .args(["--vrdeauthtype", "null"])
                    .args(["--vrdeport", port.as_str()])
                    .run()?;
            }
        }

        if self.descriptor.enable_shared_directory {
            info!("Enabling shared directory for VM.");
            let shared = self.slot_dir().join("shared").display().to_string();
            self.manage
                .command("enable shared dir")
                .args(["sharedfolder", "add", self.vm_name.as_str()])
                .args(["--name", "shared"])
                .args(["--hostpath", shared.as_str()])
                .run()?;
        }

        Ok(())
    }

    /// Remove the VM's registration, optionally deleting its media.
    ///
    /// Every step tolerates failure so a half-registered VM can still be
    /// torn down.
    pub fn deregister_vm(&mut self, delete_media: bool) -> Result<()> {
        info!("Deregistering VM.");

        let _ = self.cleanupsnapshots(true);

        info!("Removing storage controller(s) from VM.");
        let _ = self
            .manage
            .command("deregister storage controller (fixed disk)")
            .args(["storagectl", self.vm_name.as_str()])
            .args(["--name", HARD_DISK_CONTROLLER, "--remove"])
            .probe()
            .run();

        if self.descriptor.enable_floppyio {
            let _ = self
                .manage
                .command("deregister storage controller (floppy disk)")
                .args(["storagectl", self.vm_name.as_str()])
                .args(["--name", FLOPPY_CONTROLLER, "--remove"])
                .probe()
                .run();
        }

        info!("Removing VM from VirtualBox.");
        let _ = self
            .manage
            .command("delete VM")
            .args(["unregistervm", self.vm_name.as_str(), "--delete"])
            .probe()
            .run();

        info!("Removing virtual disk drive from VirtualBox.");
        let disk = self.disk_image_path().display().to_string();
        let mut close = self
            .manage
            .command("remove virtual disk")
            .args(["closemedium", "disk", disk.as_str()])
            .probe();
        if delete_media {
            close = close.arg("--delete");
        }
        let _ = close.run();

        if self.descriptor.enable_floppyio {
            info!("Removing virtual floppy disk from VirtualBox.");
            let floppy = self.floppy_image_path().display().to_string();
            let mut close = self
                .manage
                .command("remove virtual floppy disk")
                .args(["closemedium", "floppy", floppy.as_str()])
                .probe();
            if delete_media {
                close = close.arg("--delete");
            }
            let _ = close.run();
        }

        Ok(())
    }

    /// Recover from a prior instance that registered this slot's disk and
    /// then died: find the owning VM through `showhdinfo`, deregister it by
    /// UUID, and leave the media on disk for re-registration.
    pub fn deregister_stale_vm(&mut self) -> Result<()> {
        let disk = self.disk_image_path().display().to_string();
        let output = match self
            .manage
            .command("get HDD info")
            .args(["showhdinfo", disk.as_str()])
            .probe()
            .run()
        {
            Ok(output) => output,
            Err(_) => return Ok(()),
        };

        // "In use by VMs:  test2 (UUID: 000ab2be-…)" names the owner.
        if let Some(uuid) = extract_uuid(&output) {
            self.vm_name = uuid.to_string();
            return self.deregister_vm(false);
        }

        // The VM is gone but the medium is still registered; just close it.
        let _ = self
            .manage
            .command("remove virtual disk")
            .args(["closemedium", "disk", disk.as_str()])
            .probe()
            .run();
        if self.descriptor.enable_floppyio {
            let floppy = self.floppy_image_path().display().to_string();
            let _ = self
                .manage
                .command("remove virtual floppy disk")
                .args(["closemedium", "floppy", floppy.as_str()])
                .probe()
                .run();
        }
        Ok(())
    }

    /// Whether a VM with the master name is registered with the hypervisor.
    pub fn is_registered(&self) -> bool {
        match self
            .manage
            .command("registration")
            .args(["showvminfo", self.descriptor.master_name.as_str(), "--machinereadable"])
            .probe()
            .run()
        {
            Ok(output) => !output.contains("VBOX_E_OBJECT_NOT_FOUND"),
            Err(_) => false,
        }
    }

    /// Whether this slot's disk image is registered with the hypervisor.
    pub fn is_hdd_registered(&self) -> bool {
        let disk = self.disk_image_path().display().to_string();
        match self
            .manage
            .command("hdd registration")
            .args(["showhdinfo", disk.as_str()])
            .probe()
            .run()
        {
            Ok(output) => {
                !output.contains("VBOX_E_FILE_ERROR")
                    && !output.contains("VBOX_E_OBJECT_NOT_FOUND")
                    && !output.contains("does not match the value")
            }
            Err(_) => false,
        }
    }

    /// Whether the Oracle extension pack (required for VRDE) is installed.
    pub fn is_extpack_installed(&self) -> bool {
        match self
            .manage
            .command("extpack detection")
            .args(["list", "extpacks"])
            .probe()
            .run()
        {
            Ok(output) => {
                output.contains("Oracle VM VirtualBox Extension Pack")
                    && output.contains("VBoxVRDP")
            }
            Err(_) => false,
        }
    }

    /// Detect conditions that would prevent the hypervisor from running a VM
    /// at all: a broken CLI-to-service channel, or a missing host kernel
    /// driver. Returns an operator-facing message when the host is not ready.
    pub fn is_system_ready(&self) -> std::result::Result<(), String> {
        let output = match self
            .manage
            .command("host info")
            .args(["list", "hostinfo"])
            .probe()
            .run()
        {
            Ok(output) => output,
            // A failing probe is not proof of a broken host.
            Err(_) => return Ok(()),
        };

        let mut message = None;
        if !output.contains("Processor count:") {
            message = Some("Communication with VM Hypervisor failed.".to_string());
        }
        if output.contains("WARNING: The vboxdrv kernel module is not loaded.") {
            message = Some("Please update/recompile VirtualBox kernel drivers.".to_string());
        }
        match message {
            Some(message) => Err(message),
            None => Ok(()),
        }
    }

    fn should_disable_hw_virtualization(&self) -> bool {
        let mut disable = false;

        if !self.host.has_cpu_feature("vmx") && !self.host.has_cpu_feature("svm") {
            info!("Hardware acceleration CPU extensions not detected. Disabling hardware acceleration support.");
            disable = true;
        }
        if self.host.has_cpu_feature("hypervisor") {
            info!("Running under Hypervisor. Disabling hardware acceleration support.");
            disable = true;
        }
        if self.host.client_version.is_newer_than(7, 2, 16) {
            if self.host.vm_extensions_disabled {
                info!("Hardware acceleration failed with previous execution. Disabling hardware acceleration support.");
                disable = true;
            }
        } else if self.descriptor.cpu_count == "1" {
            // Older clients cannot report prior VT-x failures; single-CPU
            // jobs fall back to software virtualization rather than risk a
            // host that only ever returns crashed VMs.
            disable = true;
        }

        disable
    }
}
