use std::fmt;
use std::sync::OnceLock;

use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device};
use tracing::{info, warn};

/// Which compute device the process should try to run inference on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeviceMap {
    /// Never touch an accelerator.
    ForceCpu,
    /// Prefer the accelerator with this ordinal, falling back to the CPU.
    Ordinal(usize),
    /// The first accelerator.
    #[default]
    FirstAccelerator,
}

impl DeviceMap {
    pub fn from_cpu_flag(cpu: bool) -> Self {
        if cpu {
            Self::ForceCpu
        } else {
            Self::default()
        }
    }

    fn ordinal(self) -> Option<usize> {
        match self {
            DeviceMap::ForceCpu => None,
            DeviceMap::Ordinal(ordinal) => Some(ordinal),
            DeviceMap::FirstAccelerator => Some(0),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceKind {
    Cuda,
    Metal,
    Cpu,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Cuda => f.write_str("cuda"),
            DeviceKind::Metal => f.write_str("metal"),
            DeviceKind::Cpu => f.write_str("cpu"),
        }
    }
}

/// The device inference runs on together with the precision used for weights
/// and activations on it.
#[derive(Clone, Debug)]
pub struct ComputeDevice {
    pub device: Device,
    pub dtype: DType,
    pub kind: DeviceKind,
}

impl ComputeDevice {
    pub fn cpu() -> Self {
        Self {
            device: Device::Cpu,
            dtype: DType::F32,
            kind: DeviceKind::Cpu,
        }
    }
}

static PROCESS_DEVICE: OnceLock<ComputeDevice> = OnceLock::new();

/// Pick the best available backend: CUDA with half precision, then Metal on
/// macOS with full precision, then the CPU. Never fails.
pub fn select_device(device_map: DeviceMap) -> ComputeDevice {
    let Some(ordinal) = device_map.ordinal() else {
        return ComputeDevice::cpu();
    };

    if cuda_is_available() {
        match Device::new_cuda(ordinal) {
            Ok(device) => {
                return ComputeDevice {
                    device,
                    dtype: DType::F16,
                    kind: DeviceKind::Cuda,
                }
            }
            Err(e) => warn!(ordinal, error = %e, "cuda is available but failed to initialize"),
        }
    }

    if cfg!(target_os = "macos") && metal_is_available() {
        match Device::new_metal(ordinal) {
            Ok(device) => {
                return ComputeDevice {
                    device,
                    dtype: DType::F32,
                    kind: DeviceKind::Metal,
                }
            }
            Err(e) => warn!(ordinal, error = %e, "metal is available but failed to initialize"),
        }
    }

    #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
    info!("running on CPU, to run on GPU(metal), build with `--features metal`");
    #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
    info!("running on CPU, to run on GPU, build with `--features cuda`");

    ComputeDevice::cpu()
}

/// The device selected for this process. The first caller decides the
/// [`DeviceMap`]; later calls return the same device.
pub fn process_device(device_map: DeviceMap) -> &'static ComputeDevice {
    PROCESS_DEVICE.get_or_init(|| {
        let selected = select_device(device_map);
        info!(device = %selected.kind, dtype = ?selected.dtype, "compute device selected");
        selected
    })
}
