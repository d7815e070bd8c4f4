mod common;

#[cfg(test)]
mod cpu_tests {
    use std::{cell::RefCell, rc::Rc, time::Duration};

    use vcomputer::{
        ClockDevice, Computer, ComputerConfig, CpuDevice, Device, DeviceUpdateResult,
        DiskDriveDevice, Disk, Event, HardDriveDevice, MemoryMount, Mount, Value, MAIN_CPU_NAME,
    };

    use crate::common::{rom, Recorder};

    const TICK: Duration = Duration::from_millis(16);

    fn cpu(recorder: &Recorder, boot: &str) -> CpuDevice {
        CpuDevice::new(recorder.factory(), Some(rom(boot)))
    }

    fn machine(recorder: &Recorder, boot: &str) -> (Computer, Rc<RefCell<CpuDevice>>) {
        let mut computer = Computer::new(&ComputerConfig::default());
        let cpu = computer
            .attach_device(MAIN_CPU_NAME, cpu(recorder, boot))
            .unwrap();
        (computer, cpu)
    }

    fn floppy(boot: &str) -> Disk {
        let mount: Rc<dyn Mount> = Rc::new(MemoryMount::new().with_file("boot.lua", boot));
        Disk::new("system", mount)
    }

    #[test]
    fn test_timer_filter_ignores_other_events() {
        let recorder = Recorder::new();
        let (mut computer, cpu) = machine(&recorder, "yield timer\nloop");

        computer.power_on();
        assert!(cpu.borrow().is_running());
        assert_eq!(recorder.resume_count(), 1);

        computer.queue_event("key", vec![Value::from("a"), Value::from(false)]);
        computer.update(TICK);
        assert_eq!(recorder.resume_count(), 1);

        computer.queue_event("timer", vec![Value::Integer(1)]);
        computer.update(TICK);
        assert_eq!(recorder.resume_count(), 2);
        assert_eq!(
            recorder.last_resume(),
            vec![Value::from("timer"), Value::Integer(1)]
        );
    }

    #[test]
    fn test_clock_timer_wakes_program() {
        let recorder = Recorder::new();
        let (mut computer, _cpu) =
            machine(&recorder, "call clock startTimer 0.1\nyield timer\nloop");
        computer.attach_device("clock", ClockDevice::new()).unwrap();

        computer.power_on();
        assert_eq!(recorder.returns.borrow()[0], vec![Value::Integer(1)]);

        computer.update(Duration::from_millis(50));
        assert_eq!(recorder.resume_count(), 1);
        computer.update(Duration::from_millis(60));
        assert_eq!(recorder.resume_count(), 2);
        assert_eq!(
            recorder.last_resume(),
            vec![Value::from("timer"), Value::Integer(1)]
        );
    }

    #[test]
    fn test_empty_yield_subscribes_to_everything() {
        let recorder = Recorder::new();
        let (mut computer, cpu) = machine(&recorder, "yield\nloop");

        computer.power_on();
        assert!(cpu.borrow().filter().unwrap().is_all());

        computer.queue_event("key", vec![Value::from("a")]);
        computer.queue_event("char", vec![Value::from("a")]);
        computer.update(TICK);
        assert_eq!(recorder.resume_count(), 3);
    }

    #[test]
    fn test_second_boot_is_ignored() {
        let recorder = Recorder::new();
        let (mut computer, cpu) = machine(&recorder, "yield\nloop");
        let hdd: Rc<dyn Mount> = Rc::new(MemoryMount::new());
        computer
            .attach_device("hdd", HardDriveDevice::new(hdd))
            .unwrap();

        computer.power_on();
        let mounts = cpu.borrow().mount_count();
        assert_eq!(mounts, 2);

        assert_eq!(cpu.borrow_mut().boot(), DeviceUpdateResult::Continue);
        assert_eq!(cpu.borrow().mount_count(), mounts);
        assert_eq!(cpu.borrow().boots(), 1);
        assert_eq!(recorder.created.get(), 1);
    }

    #[test]
    fn test_globals_and_preloads() {
        let recorder = Recorder::new();
        let (mut computer, _cpu) = machine(&recorder, "call package has clock\nyield");
        computer.attach_device("clock", ClockDevice::new()).unwrap();

        computer.power_on();
        assert_eq!(*recorder.globals.borrow(), vec!["io", "os", "package"]);
        let preloads = recorder.preloads.borrow();
        assert!(preloads.contains(&"buffer".to_string()));
        assert!(preloads.contains(&"clock".to_string()));
        assert!(!preloads.contains(&"io".to_string()));
        assert_eq!(recorder.returns.borrow()[0], vec![Value::from(true)]);
    }

    #[test]
    fn test_missing_boot_file_shuts_down_main_cpu() {
        let recorder = Recorder::new();
        let mut computer = Computer::new(&ComputerConfig::default());
        let empty: Rc<dyn Mount> = Rc::new(MemoryMount::new());
        computer
            .attach_device(MAIN_CPU_NAME, CpuDevice::new(recorder.factory(), Some(empty)))
            .unwrap();

        computer.power_on();
        assert!(!computer.is_on());
        assert_eq!(recorder.created.get(), 0);
        let lines = computer.error_output().lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("cpu: "));
    }

    #[test]
    fn test_no_medium_shuts_down_main_cpu() {
        let recorder = Recorder::new();
        let mut computer = Computer::new(&ComputerConfig::default());
        computer
            .attach_device(MAIN_CPU_NAME, CpuDevice::new(recorder.factory(), None))
            .unwrap();

        computer.power_on();
        assert!(!computer.is_on());
    }

    #[test]
    fn test_secondary_cpu_failure_keeps_machine_on() {
        let recorder = Recorder::new();
        let (mut computer, main) = machine(&recorder, "yield\nloop");
        let helper = computer
            .attach_device("cpu2", cpu(&recorder, "error helper crashed"))
            .unwrap();

        computer.power_on();
        assert!(computer.is_on());
        assert!(main.borrow().is_running());
        assert!(!helper.borrow().is_running());
        assert!(!helper.borrow().is_main());
        assert_eq!(
            computer.error_output().lines(),
            vec!["cpu2: helper crashed".to_string()]
        );
    }

    #[test]
    fn test_syntax_error_is_reported() {
        let recorder = Recorder::new();
        let (mut computer, cpu) = machine(&recorder, "frobnicate");

        computer.power_on();
        assert!(!computer.is_on());
        assert!(!cpu.borrow().is_running());
        assert_eq!(cpu.borrow().mount_count(), 0);
        assert!(computer.error_output().lines()[0].contains("syntax error"));
        assert_eq!(recorder.live_runtimes(), 0);
    }

    #[test]
    fn test_bytecode_is_rejected() {
        let recorder = Recorder::new();
        let (mut computer, _cpu) = machine(&recorder, "\u{1b}LuaT");

        computer.power_on();
        assert!(!computer.is_on());
        assert!(recorder.loaded.borrow().is_empty());
        assert!(computer.error_output().lines()[0].contains("binary chunk"));
    }

    #[test]
    fn test_zero_memory_budget_refuses_to_boot() {
        let recorder = Recorder::new();
        let config = ComputerConfig {
            memory_budget: 0,
            ..Default::default()
        };
        let mut computer = Computer::new(&config);
        computer
            .attach_device(MAIN_CPU_NAME, cpu(&recorder, "yield"))
            .unwrap();

        computer.power_on();
        assert!(!computer.is_on());
        assert_eq!(recorder.created.get(), 0);
    }

    #[test]
    fn test_runtime_error_shuts_down() {
        let recorder = Recorder::new();
        let (mut computer, _cpu) = machine(&recorder, "yield\nerror boom");

        computer.power_on();
        assert!(computer.is_on());
        computer.queue_event("key", vec![]);
        computer.update(TICK);

        assert!(!computer.is_on());
        assert_eq!(computer.error_output().take(), vec!["cpu: boom".to_string()]);
        assert!(computer.error_output().lines().is_empty());
    }

    #[test]
    fn test_program_end_shuts_down_main_cpu() {
        let recorder = Recorder::new();
        let (mut computer, cpu) = machine(&recorder, "return 1");

        computer.power_on();
        assert!(!computer.is_on());
        assert!(!cpu.borrow().is_running());
        assert!(computer.error_output().lines().is_empty());
    }

    #[test]
    fn test_halt_directive() {
        let recorder = Recorder::new();
        let (mut computer, _cpu) = machine(&recorder, "yield\nhalt");
        let helper = computer
            .attach_device("cpu2", cpu(&recorder, "halt"))
            .unwrap();

        computer.power_on();
        assert!(computer.is_on());
        assert!(!helper.borrow().is_running());

        computer.queue_event("key", vec![]);
        computer.update(TICK);
        assert!(!computer.is_on());
    }

    #[test]
    fn test_secondary_shutdown_powers_off() {
        let recorder = Recorder::new();
        let (mut computer, _cpu) = machine(&recorder, "yield\nloop");
        computer
            .attach_device("cpu2", cpu(&recorder, "yield\nshutdown"))
            .unwrap();

        computer.power_on();
        computer.queue_event("key", vec![]);
        computer.update(TICK);
        assert!(!computer.is_on());
    }

    #[test]
    fn test_reboot_directive() {
        let recorder = Recorder::new();
        let (mut computer, cpu) = machine(&recorder, "yield\nreboot");

        computer.power_on();
        assert_eq!(cpu.borrow().boots(), 1);

        computer.queue_event("key", vec![]);
        computer.update(TICK);

        assert!(computer.is_on());
        assert!(cpu.borrow().is_running());
        assert_eq!(cpu.borrow().boots(), 2);
        assert_eq!(recorder.resume_count(), 3);
        assert_eq!(recorder.created.get(), 2);
        assert_eq!(recorder.live_runtimes(), 1);
    }

    #[test]
    fn test_boot_from_disk_drive() {
        let recorder = Recorder::new();
        let (mut computer, cpu) = machine(&recorder, "boot floppy");
        computer
            .attach_device(
                "floppy",
                DiskDriveDevice::with_disk(floppy("yield floppy_ready")),
            )
            .unwrap();

        computer.power_on();
        assert!(computer.is_on());
        assert_eq!(cpu.borrow().boots(), 2);
        assert_eq!(
            recorder.loaded.borrow().last().map(String::as_str),
            Some("yield floppy_ready")
        );
        let cpu = cpu.borrow();
        let filter = cpu.filter().unwrap();
        assert!(filter.admits(&Event::new("floppy_ready", vec![])));
        assert!(!filter.admits(&Event::new("key", vec![])));
    }

    #[test]
    fn test_boot_from_unknown_device_fails() {
        let recorder = Recorder::new();
        let (mut computer, _cpu) = machine(&recorder, "boot nowhere");

        computer.power_on();
        assert!(!computer.is_on());
        assert!(computer.error_output().lines()[0].contains("no such device"));
    }

    #[test]
    fn test_status_directive_resumes_immediately() {
        let recorder = Recorder::new();
        let (mut computer, cpu) = machine(&recorder, "status\nyield done");

        computer.power_on();
        assert_eq!(recorder.resume_count(), 2);
        let status = recorder.last_resume();
        assert_eq!(status[0], Value::from("running"));
        assert_eq!(status[1], Value::from(0usize));
        assert_eq!(
            status[2],
            Value::from(ComputerConfig::default().memory_budget)
        );
        assert!(cpu
            .borrow()
            .filter()
            .unwrap()
            .admits(&Event::new("done", vec![])));
    }

    #[test]
    fn test_halt_releases_guest_memory() {
        let recorder = Recorder::new();
        let (mut computer, cpu) = machine(&recorder, "call buffer create 100\nyield\nloop");

        computer.power_on();
        assert_eq!(computer.memory().used(), 100);

        cpu.borrow_mut().halt();
        assert_eq!(computer.memory().used(), 0);
        assert_eq!(cpu.borrow().mount_count(), 0);
        assert_eq!(recorder.live_runtimes(), 0);
    }

    #[test]
    fn test_power_off_releases_guest_memory() {
        let recorder = Recorder::new();
        let (mut computer, _cpu) = machine(&recorder, "call buffer create 64\nyield");

        computer.power_on();
        assert_eq!(computer.memory().used(), 64);
        computer.power_off();
        assert_eq!(computer.memory().used(), 0);
    }

    #[test]
    fn test_out_of_memory_is_a_guest_error() {
        let recorder = Recorder::new();
        let config = ComputerConfig {
            memory_budget: 32,
            ..Default::default()
        };
        let mut computer = Computer::new(&config);
        computer
            .attach_device(MAIN_CPU_NAME, cpu(&recorder, "call buffer create 64\nyield"))
            .unwrap();

        computer.power_on();
        assert!(!computer.is_on());
        assert_eq!(
            computer.error_output().lines(),
            vec!["cpu: not enough memory".to_string()]
        );
    }

    #[test]
    fn test_yield_and_free_memory_collect_garbage() {
        let recorder = Recorder::new();
        let (mut computer, _cpu) = machine(&recorder, "yield\nloop");

        computer.power_on();
        assert_eq!(recorder.collections.get(), 1);
        computer.free_unused_memory();
        assert_eq!(recorder.collections.get(), 2);
    }

    #[test]
    fn test_disk_swap_visible_to_running_program() {
        let recorder = Recorder::new();
        let (mut computer, _cpu) = machine(
            &recorder,
            "yield disk_changed\ncall io exists /floppy/data.txt\nloop",
        );
        let drive = computer
            .attach_device("floppy", DiskDriveDevice::new())
            .unwrap();
        computer.power_on();

        let data: Rc<dyn Mount> = Rc::new(MemoryMount::new().with_file("data.txt", "42"));
        drive.borrow_mut().insert(Disk::new("data", data));
        computer.update(TICK);
        assert_eq!(recorder.returns.borrow().last(), Some(&vec![Value::from(true)]));

        drive.borrow_mut().eject();
        computer.update(TICK);
        assert_eq!(recorder.resume_count(), 3);
        assert_eq!(recorder.returns.borrow().last(), Some(&vec![Value::from(false)]));
    }
}
