//! バックエンド選択
//!
//! CPUは常に利用可能です。GPU (WGPU) は `wgpu` フィーチャ有効時のみ。

use burn_autodiff::Autodiff;
use burn_ndarray::{NdArray, NdArrayDevice};
use tracing::warn;

use crate::model::DeviceType;

/// CPUバックエンド
pub type CpuBackend = NdArray<f32>;

/// CPU学習用バックエンド
pub type CpuTrainingBackend = Autodiff<CpuBackend>;

#[cfg(feature = "wgpu")]
pub type GpuBackend = burn_wgpu::Wgpu;

#[cfg(feature = "wgpu")]
pub type GpuTrainingBackend = Autodiff<GpuBackend>;

pub fn cpu_device() -> NdArrayDevice {
    NdArrayDevice::Cpu
}

#[cfg(feature = "wgpu")]
pub fn gpu_device() -> burn_wgpu::WgpuDevice {
    burn_wgpu::WgpuDevice::DefaultDevice
}

/// ビルド構成で実際に使用できるデバイス種別を返す
pub fn effective_device_type(requested: &DeviceType) -> DeviceType {
    match requested {
        DeviceType::Cpu => DeviceType::Cpu,
        DeviceType::Wgpu => {
            if cfg!(feature = "wgpu") {
                DeviceType::Wgpu
            } else {
                warn!("wgpuフィーチャが無効のためCPUバックエンドを使用します");
                DeviceType::Cpu
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_is_always_available() {
        assert_eq!(effective_device_type(&DeviceType::Cpu), DeviceType::Cpu);
    }
}
