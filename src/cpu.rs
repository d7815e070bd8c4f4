//! The CPU device: runs one guest program as a cooperative process.
//!
//! A booted program lives in a coroutine. The CPU resumes it once on boot
//! and then once for every event its filter admits. Whatever the program
//! yields becomes its new event filter, unless it called an `os` directive,
//! in which case the directive is carried out instead.

use std::{
    cell::RefCell,
    io::{Read, Write},
    rc::Rc,
    time::Duration,
};

use derivative::Derivative;
use tracing::{debug, error, info, trace, warn};

use crate::{
    computer::Bus,
    config::MAIN_CPU_NAME,
    device::{Device, DeviceUpdateResult},
    event::{Event, EventFilter},
    filesystem::FileSystem,
    fs_error::FsError,
    guest::{
        reject_bytecode, CoroutineId, GuestApi, GuestError, GuestRuntime, GuestRuntimeFactory,
        Resumed, RuntimeLimits,
    },
    host_api::{BufferApi, Directive, DirectiveSlot, IoApi, OsApi, PackageApi},
    mount::Mount,
    resource::ResourceArena,
    value::Value,
};

pub const BOOT_FILE: &str = "boot.lua";

/// Storage of another device, looked up on every access so that disk swaps
/// are seen without remounting.
struct DeviceMount {
    bus: Bus,
    device: String,
}

impl DeviceMount {
    fn target(&self) -> Result<Rc<dyn Mount>, FsError> {
        self.bus
            .device_mount(&self.device)
            .ok_or(FsError::Disconnected)
    }
}

impl Mount for DeviceMount {
    fn exists(&self, path: &str) -> bool {
        self.target().is_ok_and(|m| m.exists(path))
    }

    fn is_dir(&self, path: &str) -> bool {
        self.target().is_ok_and(|m| m.is_dir(path))
    }

    fn list(&self, path: &str) -> Result<Vec<String>, FsError> {
        self.target()?.list(path)
    }

    fn open_read(&self, path: &str) -> Result<Box<dyn Read>, FsError> {
        self.target()?.open_read(path)
    }

    fn open_write(&self, path: &str) -> Result<Box<dyn Write>, FsError> {
        self.target()?.open_write(path)
    }

    fn capacity(&self) -> Option<u64> {
        self.target().ok()?.capacity()
    }
}

#[derive(Derivative)]
#[derivative(Debug)]
struct Session {
    #[derivative(Debug = "ignore")]
    runtime: Box<dyn GuestRuntime>,
    coroutine: CoroutineId,
    filter: EventFilter,
    arena: Rc<RefCell<ResourceArena>>,
}

#[derive(Debug)]
enum CpuState {
    Halted,
    Running(Session),
}

#[derive(Derivative)]
#[derivative(Debug)]
pub struct CpuDevice {
    #[derivative(Debug = "ignore")]
    factory: Rc<dyn GuestRuntimeFactory>,
    #[derivative(Debug = "ignore")]
    boot_mount: Option<Rc<dyn Mount>>,
    limits: RuntimeLimits,
    state: CpuState,
    fs: Rc<RefCell<FileSystem>>,
    directive: DirectiveSlot,
    bus: Option<Bus>,
    name: String,
    boots: u32,
}

impl CpuDevice {
    pub fn new(
        factory: impl GuestRuntimeFactory + 'static,
        boot_mount: Option<Rc<dyn Mount>>,
    ) -> Self {
        Self {
            factory: Rc::new(factory),
            boot_mount,
            limits: RuntimeLimits::default(),
            state: CpuState::Halted,
            fs: Rc::new(RefCell::new(FileSystem::new())),
            directive: DirectiveSlot::default(),
            bus: None,
            name: String::new(),
            boots: 0,
        }
    }

    pub fn with_limits(mut self, limits: RuntimeLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Medium used by [`Device::boot`], typically a ROM.
    pub fn set_boot_mount(&mut self, mount: Option<Rc<dyn Mount>>) {
        self.boot_mount = mount;
    }

    pub fn is_main(&self) -> bool {
        self.name == MAIN_CPU_NAME
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, CpuState::Running(_))
    }

    pub fn filter(&self) -> Option<&EventFilter> {
        match &self.state {
            CpuState::Running(session) => Some(&session.filter),
            CpuState::Halted => None,
        }
    }

    pub fn mount_count(&self) -> usize {
        self.fs.borrow().mount_count()
    }

    /// Number of successful boots since the device was created.
    pub fn boots(&self) -> u32 {
        self.boots
    }

    /// What the machine should do when this CPU stops on its own.
    fn stopped(&self) -> DeviceUpdateResult {
        if self.is_main() {
            DeviceUpdateResult::Shutdown
        } else {
            DeviceUpdateResult::Continue
        }
    }

    fn report(&self, e: &GuestError) {
        error!("[CPU] {}: {}", self.name, e);
        if let Some(bus) = &self.bus {
            bus.error_output().write_line(format!("{}: {}", self.name, e));
        }
    }

    fn fail(&mut self, e: &GuestError) -> DeviceUpdateResult {
        self.report(e);
        self.halt();
        self.stopped()
    }

    /// Stops the program and severs its access to storage and memory.
    pub fn halt(&mut self) {
        let CpuState::Running(session) = std::mem::replace(&mut self.state, CpuState::Halted)
        else {
            return;
        };
        info!("[CPU] {} halted", self.name);
        session.arena.borrow_mut().clear();
        drop(session);
        self.fs.borrow_mut().unmount_all();
        self.directive.borrow_mut().take();
    }

    fn start(&mut self, mount: Option<Rc<dyn Mount>>) -> Result<(), GuestError> {
        let bus = self
            .bus
            .clone()
            .ok_or_else(|| GuestError::Runtime("cpu is not attached".to_string()))?;
        if bus.memory().budget() == 0 {
            return Err(GuestError::Runtime("no memory installed".to_string()));
        }
        let mount = mount.ok_or_else(|| GuestError::Runtime("no bootable medium".to_string()))?;

        {
            let mut fs = self.fs.borrow_mut();
            fs.mount(mount, "/", "/", true)?;
            for device in bus.storage_devices() {
                let mount = Rc::new(DeviceMount {
                    bus: bus.clone(),
                    device: device.clone(),
                });
                fs.mount(mount, &device, "/", false)?;
            }
        }
        let source = self.fs.borrow().read(BOOT_FILE)?;
        reject_bytecode(BOOT_FILE, &source)?;

        let mut runtime = self.factory.create(self.limits);
        let arena = Rc::new(RefCell::new(ResourceArena::new(bus.memory().clone())));

        let buffer: Rc<dyn GuestApi> = Rc::new(BufferApi::new(arena.clone()));
        let mut preloads = vec![("buffer".to_string(), buffer)];
        preloads.extend(bus.device_apis());
        let names = preloads.iter().map(|(n, _)| n.clone()).collect();

        runtime.set_global("io", Value::Api(Rc::new(IoApi::new(self.fs.clone()))));
        runtime.set_global(
            "os",
            Value::Api(Rc::new(OsApi::new(self.directive.clone(), bus))),
        );
        runtime.set_global("package", Value::Api(Rc::new(PackageApi::new(names))));
        for (name, api) in preloads {
            trace!("[CPU] preload {}", name);
            runtime.set_preload(&name, api);
        }

        let function = runtime.load(BOOT_FILE, &source)?;
        let coroutine = runtime.create_coroutine(function)?;
        self.directive.borrow_mut().take();
        self.state = CpuState::Running(Session {
            runtime,
            coroutine,
            filter: EventFilter::all(),
            arena,
        });
        self.boots += 1;
        Ok(())
    }

    /// Boots from `mount` and runs the program up to its first yield.
    pub fn boot_from(&mut self, mount: Option<Rc<dyn Mount>>) -> DeviceUpdateResult {
        if self.is_running() {
            warn!("[CPU] {} is already running, boot ignored", self.name);
            return DeviceUpdateResult::Continue;
        }
        info!("[CPU] {} booting", self.name);
        match self.start(mount) {
            Ok(()) => self.resume(Vec::new()),
            Err(e) => {
                // A partial boot may have left the store mounted.
                self.fs.borrow_mut().unmount_all();
                self.fail(&e)
            }
        }
    }

    fn status(&self) -> Vec<Value> {
        let Some(bus) = &self.bus else {
            return vec![Value::from("halted")];
        };
        vec![
            Value::from("running"),
            Value::from(bus.memory().used()),
            Value::from(bus.memory().budget()),
            Value::from(bus.uptime().as_secs_f64()),
        ]
    }

    /// Advances the program once.
    pub fn resume(&mut self, mut args: Vec<Value>) -> DeviceUpdateResult {
        loop {
            let CpuState::Running(session) = &mut self.state else {
                return DeviceUpdateResult::Continue;
            };
            trace!("[CPU] {} resume {:?}", self.name, args);
            let outcome = session.runtime.resume(session.coroutine, args);
            let directive = self.directive.borrow_mut().take();

            match outcome {
                Err(e) => return self.fail(&e),
                Ok(Resumed::Finished(values)) => {
                    info!("[CPU] {} program ended {:?}", self.name, values);
                    return match directive {
                        Some(Directive::Status) | None => {
                            self.halt();
                            self.stopped()
                        }
                        Some(directive) => self.apply(directive),
                    };
                }
                Ok(Resumed::Yielded(values)) => match directive {
                    None => {
                        session.filter = EventFilter::from_values(&values);
                        session.runtime.collect_garbage();
                        return DeviceUpdateResult::Continue;
                    }
                    Some(Directive::Status) => args = self.status(),
                    Some(directive) => return self.apply(directive),
                },
            }
        }
    }

    fn apply(&mut self, directive: Directive) -> DeviceUpdateResult {
        debug!("[CPU] {} applying {:?}", self.name, directive);
        match directive {
            Directive::Halt | Directive::Status => {
                self.halt();
                self.stopped()
            }
            Directive::Shutdown => {
                self.halt();
                DeviceUpdateResult::Shutdown
            }
            Directive::Reboot => {
                self.halt();
                DeviceUpdateResult::Reboot
            }
            Directive::Boot(device) => {
                let mount = self.bus.as_ref().and_then(|bus| bus.device_mount(&device));
                self.halt();
                self.boot_from(mount)
            }
        }
    }
}

impl Device for CpuDevice {
    fn device_type(&self) -> &str {
        "cpu"
    }

    fn description(&self) -> &str {
        "Scripted central processing unit"
    }

    fn attach(&mut self, bus: &Bus, name: &str) {
        self.name = name.to_string();
        self.bus = Some(bus.clone());
        info!(
            "[CPU] {} attached{}",
            name,
            if self.is_main() { " as main cpu" } else { "" }
        );
    }

    fn detach(&mut self) {
        self.halt();
        self.bus = None;
    }

    fn update(&mut self, _dt: Duration) -> DeviceUpdateResult {
        DeviceUpdateResult::Continue
    }

    fn boot(&mut self) -> DeviceUpdateResult {
        let mount = self.boot_mount.clone();
        self.boot_from(mount)
    }

    fn handle_event(&mut self, event: &Event) -> DeviceUpdateResult {
        let CpuState::Running(session) = &self.state else {
            return DeviceUpdateResult::Continue;
        };
        if !session.filter.admits(event) {
            trace!("[CPU] {} filtered out {}", self.name, event.name);
            return DeviceUpdateResult::Continue;
        }
        self.resume(event.to_values())
    }

    fn free_unused_memory(&mut self) {
        if let CpuState::Running(session) = &mut self.state {
            session.runtime.collect_garbage();
            session.arena.borrow_mut().compact();
        }
    }

    fn power_off(&mut self) {
        self.halt();
    }
}
