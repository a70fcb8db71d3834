//! Backend selected at compile time through cargo features.
//!
//! `wgpu` takes precedence over `tch-gpu`, then `tch-cpu`, then `ndarray`.

use burn::backend::Autodiff;

#[cfg(feature = "wgpu")]
mod selected {
    use burn::backend::wgpu::{Wgpu, WgpuDevice};

    pub type Backend = Wgpu;

    pub fn device() -> WgpuDevice {
        WgpuDevice::default()
    }
}

#[cfg(all(feature = "tch-gpu", not(feature = "wgpu")))]
mod selected {
    use burn::backend::libtorch::{LibTorch, LibTorchDevice};

    pub type Backend = LibTorch;

    pub fn device() -> LibTorchDevice {
        #[cfg(not(target_os = "macos"))]
        let device = LibTorchDevice::Cuda(0);
        #[cfg(target_os = "macos")]
        let device = LibTorchDevice::Mps;

        device
    }
}

#[cfg(all(
    feature = "tch-cpu",
    not(any(feature = "wgpu", feature = "tch-gpu"))
))]
mod selected {
    use burn::backend::libtorch::{LibTorch, LibTorchDevice};

    pub type Backend = LibTorch;

    pub fn device() -> LibTorchDevice {
        LibTorchDevice::Cpu
    }
}

#[cfg(all(
    feature = "ndarray",
    not(any(feature = "wgpu", feature = "tch-gpu", feature = "tch-cpu"))
))]
mod selected {
    use burn::backend::ndarray::{NdArray, NdArrayDevice};

    pub type Backend = NdArray;

    pub fn device() -> NdArrayDevice {
        NdArrayDevice::Cpu
    }
}

pub use selected::{device, Backend};

/// Backend used for training runs.
pub type TrainingBackend = Autodiff<Backend>;
