pub mod clock;
pub mod computer;
pub mod config;
pub mod cpu;
pub mod device;
pub mod disk_drive;
pub mod display;
pub mod event;
pub mod filesystem;
pub mod fs_error;
pub mod gamepad;
pub mod gpu;
pub mod guest;
pub mod hard_drive;
pub mod host_api;
pub mod keyboard;
pub mod logging;
pub mod memory;
pub mod mount;
pub mod resource;
pub mod sound;
pub mod speaker;
pub mod synth;
pub mod utils;
pub mod value;

pub use clock::ClockDevice;
pub use computer::{Bus, Computer, ComputerBuilder, ComputerError, ErrorOutput, PowerState};
pub use config::{ComputerConfig, MAIN_CPU_NAME};
pub use cpu::CpuDevice;
pub use device::{Device, DeviceUpdateResult};
pub use disk_drive::DiskDriveDevice;
pub use display::DisplayDevice;
pub use event::{Event, EventFilter, EventQueue};
pub use filesystem::{File, FileSystem, OpenMode};
pub use fs_error::FsError;
pub use gamepad::GamepadDevice;
pub use gpu::GpuDevice;
pub use guest::{
    ApiResult, CoroutineId, FunctionId, GuestApi, GuestError, GuestRuntime, GuestRuntimeFactory,
    Resumed, RuntimeLimits,
};
pub use hard_drive::HardDriveDevice;
pub use keyboard::KeyboardDevice;
pub use memory::{MemoryError, MemoryTracker};
pub use mount::{DirMount, Disk, MemoryMount, Mount};
pub use resource::{Handle, ResourceArena, ResourceError, ResourceKind};
pub use sound::{Sound, SoundError, Waveform};
pub use speaker::{SpeakerDevice, SpeakerOutput};
pub use synth::{SpeakerChannel, Voice};
pub use utils::hexdump;
pub use value::Value;

/// A machine with the stock peripherals: a main CPU booting from `rom`, a
/// clock, keyboard, gamepad, display, GPU, speaker, one disk drive and a
/// hard drive backed by `hdd`.
pub fn standard_computer(
    config: &ComputerConfig,
    runtime: impl GuestRuntimeFactory + 'static,
    rom: std::rc::Rc<dyn Mount>,
    hdd: std::rc::Rc<dyn Mount>,
) -> Result<Computer, ComputerError> {
    ComputerBuilder::new()
        .config(config.clone())
        .device(
            MAIN_CPU_NAME,
            CpuDevice::new(runtime, Some(rom)).with_limits(config.runtime_limits()),
        )
        .device("clock", ClockDevice::new())
        .device("keyboard", KeyboardDevice::new())
        .device("gamepad", GamepadDevice::new())
        .device("display", DisplayDevice::default())
        .device("gpu", GpuDevice::new())
        .device("speaker", SpeakerDevice::new(config.speaker_channels))
        .device("floppy", DiskDriveDevice::new())
        .device("hdd", HardDriveDevice::new(hdd))
        .build()
}
