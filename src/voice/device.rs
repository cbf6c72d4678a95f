//! Compute backend selection for the voice model

use log::info;
use std::path::Path;

/// Backend the model worker runs inference on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeDevice {
    Cuda,
    Mps,
    Cpu,
}

impl ComputeDevice {
    /// Name passed to the worker's `--device` flag
    pub fn as_arg(&self) -> &'static str {
        match self {
            ComputeDevice::Cuda => "cuda",
            ComputeDevice::Mps => "mps",
            ComputeDevice::Cpu => "cpu",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ComputeDevice::Cuda => "CUDA GPU",
            ComputeDevice::Mps => "Apple Metal",
            ComputeDevice::Cpu => "CPU",
        }
    }

    /// Pick the fastest backend this machine offers
    pub fn detect() -> ComputeDevice {
        let device = if cfg!(all(target_os = "macos", target_arch = "aarch64")) {
            ComputeDevice::Mps
        } else if nvidia_driver_present() {
            ComputeDevice::Cuda
        } else {
            ComputeDevice::Cpu
        };
        info!("Selected compute backend: {}", device.display_name());
        device
    }
}

impl std::fmt::Display for ComputeDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// User preference, `auto` resolves through `ComputeDevice::detect`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DevicePreference {
    #[default]
    Auto,
    Fixed(ComputeDevice),
}

impl DevicePreference {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" | "" => Some(DevicePreference::Auto),
            "cuda" | "gpu" => Some(DevicePreference::Fixed(ComputeDevice::Cuda)),
            "mps" | "metal" => Some(DevicePreference::Fixed(ComputeDevice::Mps)),
            "cpu" => Some(DevicePreference::Fixed(ComputeDevice::Cpu)),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DevicePreference::Auto => "auto",
            DevicePreference::Fixed(device) => device.as_arg(),
        }
    }

    pub fn resolve(&self) -> ComputeDevice {
        match self {
            DevicePreference::Auto => ComputeDevice::detect(),
            DevicePreference::Fixed(device) => *device,
        }
    }
}

fn nvidia_driver_present() -> bool {
    Path::new("/proc/driver/nvidia/version").exists() || Path::new("/dev/nvidiactl").exists()
}
