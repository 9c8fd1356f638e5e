//! Session behavior against a recording engine.

mod common;

use common::{destroyed_count, module_image, FakeEngine, CALLBACK_BASE, RAW_OFFSET, SYMBOL_BASE};
use wbx_host::{HostError, LayoutKb, MemoryLayout, ModuleAddr, MountMode, SandboxSession, SessionConfig};

type Session = SandboxSession<FakeEngine>;

fn layout() -> MemoryLayout {
    LayoutKb::new(16, 32, 0, 64, 128).to_bytes().unwrap()
}

fn session() -> Session {
    let image = module_image(&["init", "run_frame", "set_callbacks"]);
    Session::create(&image, "fake.wbx", &layout()).unwrap()
}

#[test]
fn test_create_loads_module() {
    let session = session();
    assert_eq!(session.name(), "fake.wbx");
    assert_eq!(session.depth(), 0);
    assert!(!session.is_sealed());

    let engine = session.engine();
    assert_eq!(engine.name, "fake.wbx");
    assert_eq!(engine.symbols, vec!["init", "run_frame", "set_callbacks"]);
    assert_eq!(engine.layout.sbrk_size, 16 * 1024);
    assert_eq!(engine.layout.mmap_size, 128 * 1024);
}

#[test]
fn test_create_reports_engine_fault() {
    let result = Session::create(b"not a module", "bad.wbx", &layout());
    match result {
        Err(HostError::Engine { op, message }) => {
            assert_eq!(op, "create");
            assert!(message.contains("header"));
        }
        other => panic!("expected engine fault, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_nested_enter_activates_once() {
    let session = session();

    for depth in 1..=5u32 {
        for _ in 0..depth {
            session.enter().unwrap();
        }
        assert_eq!(session.depth(), depth);
        assert!(session.is_active());

        for _ in 0..depth {
            session.exit().unwrap();
        }
        assert_eq!(session.depth(), 0);

        let engine = session.engine();
        assert_eq!(engine.activations, depth);
        assert_eq!(engine.deactivations, depth);
        assert!(!engine.active);
    }
}

#[test]
fn test_unbalanced_exit() {
    let session = session();
    assert!(matches!(session.exit(), Err(HostError::UnbalancedExit)));

    session.enter().unwrap();
    session.exit().unwrap();
    assert!(matches!(session.exit(), Err(HostError::UnbalancedExit)));

    assert_eq!(session.depth(), 0);
    assert_eq!(session.engine().deactivations, 1);
}

#[test]
fn test_activation_guard() {
    let session = session();
    {
        let outer = session.activate().unwrap();
        assert_eq!(outer.depth(), 1);
        {
            let inner = outer.activate().unwrap();
            assert_eq!(inner.depth(), 2);
        }
        assert_eq!(outer.depth(), 1);
        assert!(outer.engine().active);
    }
    assert_eq!(session.depth(), 0);
    assert_eq!(session.engine().activations, 1);
    assert_eq!(session.engine().deactivations, 1);
}

#[test]
fn test_failed_activation_leaves_depth() {
    let session = session();
    session.engine_mut().fail_on = Some("activate");

    match session.enter() {
        Err(HostError::Engine { op, message }) => {
            assert_eq!(op, "activate");
            assert_eq!(message, "injected activate failure");
        }
        other => panic!("expected engine fault, got {:?}", other),
    }
    assert_eq!(session.depth(), 0);

    // the fault was one-shot
    session.enter().unwrap();
    session.exit().unwrap();
}

#[test]
fn test_resolve_symbol() {
    let session = session();
    assert_eq!(session.resolve_symbol("init").unwrap(), ModuleAddr(SYMBOL_BASE));
    assert_eq!(session.resolve_symbol("set_callbacks").unwrap(), ModuleAddr(SYMBOL_BASE + 0x20));

    match session.resolve_symbol("missing") {
        Err(HostError::SymbolNotFound(name)) => assert_eq!(name, "missing"),
        other => panic!("expected missing symbol, got {:?}", other),
    }
}

#[test]
fn test_raw_symbol_and_callin() {
    let session = session();
    let raw = session.resolve_symbol_raw("run_frame").unwrap();
    assert_eq!(raw, ModuleAddr(SYMBOL_BASE + 0x10 + RAW_OFFSET));

    let callin = session.callin_address(raw).unwrap();
    assert_eq!(callin, session.resolve_symbol("run_frame").unwrap());

    assert!(matches!(
        session.resolve_symbol_raw("missing"),
        Err(HostError::SymbolNotFound(_))
    ));
}

#[test]
fn test_callbacks_resolve_by_slot() {
    let session = session();
    let callbacks = [0x5000_1000, 0x5000_2000, 0x5000_3000, 0x5000_4000];

    for (i, &cb) in callbacks.iter().enumerate() {
        assert_eq!(session.register_callback(cb).unwrap(), i);
    }

    for (slot, &cb) in callbacks.iter().enumerate() {
        let addr = session.resolve_callback(cb).unwrap();
        assert_eq!(addr, ModuleAddr(CALLBACK_BASE + slot * 0x10));
        assert_eq!(session.engine().callback_slots[&slot], cb);
    }

    match session.resolve_callback(0x6000_0000) {
        Err(HostError::CallbackNotRegistered(cb)) => assert_eq!(cb, 0x6000_0000),
        other => panic!("expected unregistered callback, got {:?}", other),
    }
}

#[test]
fn test_duplicate_registration_uses_first_slot() {
    let session = session();
    session.register_callback(0x1000).unwrap();
    session.register_callback(0x2000).unwrap();
    assert_eq!(session.register_callback(0x1000).unwrap(), 0);
    assert_eq!(session.callbacks().len(), 3);

    assert_eq!(session.resolve_callback(0x1000).unwrap(), ModuleAddr(CALLBACK_BASE));
}

#[test]
fn test_seal_once() {
    let session = session();
    session.register_callback(0x1000).unwrap();

    session.seal().unwrap();
    assert!(session.is_sealed());
    assert!(matches!(session.seal(), Err(HostError::DoubleSeal)));
    assert_eq!(session.engine().seals, 1);

    assert!(matches!(
        session.register_callback(0x2000),
        Err(HostError::SetupSealed(_))
    ));

    // existing registrations still resolve
    assert_eq!(session.resolve_callback(0x1000).unwrap(), ModuleAddr(CALLBACK_BASE));
}

#[test]
fn test_failed_seal_can_retry() {
    let session = session();
    session.engine_mut().fail_on = Some("seal");
    assert!(matches!(session.seal(), Err(HostError::Engine { op: "seal", .. })));
    assert!(!session.is_sealed());

    session.seal().unwrap();
    assert!(session.is_sealed());
}

#[test]
fn test_writable_mount_round_trip() {
    let session = session();
    session.mount_writable("save.ram", &[0u8; 16]).unwrap();
    assert_eq!(session.mounts().get("save.ram"), Some(&MountMode::Writable));

    session.engine_mut().mutate_file("save.ram", |content| {
        content[0] = 0xAA;
        content.extend_from_slice(b"tail");
    });

    let back = session.unmount_file("save.ram").unwrap();
    let mut expected = vec![0u8; 16];
    expected[0] = 0xAA;
    expected.extend_from_slice(b"tail");
    assert_eq!(back, expected);
    assert!(session.mounts().is_empty());
}

#[test]
fn test_readonly_mount() {
    let session = session();
    session.mount_readonly("bios.bin", b"firmware image").unwrap();
    assert_eq!(session.engine().files["bios.bin"].0, b"firmware image");

    match session.unmount_file("bios.bin") {
        Err(HostError::NotWritable(name)) => assert_eq!(name, "bios.bin"),
        other => panic!("expected not writable, got {:?}", other),
    }
    assert!(session.mounts().contains_key("bios.bin"));

    session.unmount_readonly("bios.bin").unwrap();
    assert!(session.engine().files.is_empty());
}

#[test]
fn test_unmount_unknown_file() {
    let session = session();
    assert!(matches!(session.unmount_file("nope"), Err(HostError::NotMounted(_))));
    assert!(matches!(session.unmount_readonly("nope"), Err(HostError::NotMounted(_))));
}

#[test]
fn test_mount_after_seal() {
    let session = session();
    session.seal().unwrap();
    session.mount_readonly("disc.cue", b"FILE").unwrap();
    session.unmount_readonly("disc.cue").unwrap();
}

#[test]
fn test_writable_mount_after_seal_rejected() {
    let session = session();
    session.mount_writable("nvram.bin", &[0u8; 8]).unwrap();
    session.seal().unwrap();

    match session.mount_writable("setup.cfg", b"abc") {
        Err(HostError::SetupSealed(what)) => assert_eq!(what, "mount a writable file"),
        other => panic!("expected sealed setup, got {:?}", other),
    }
    assert!(!session.engine().files.contains_key("setup.cfg"));
    assert!(!session.mounts().contains_key("setup.cfg"));

    // files mounted before the seal still read back
    assert_eq!(session.unmount_file("nvram.bin").unwrap(), vec![0u8; 8]);
}

#[test]
fn test_engine_call_while_engine_borrowed() {
    let session = session();
    let engine = session.engine_mut();

    match session.enter() {
        Err(HostError::EngineBusy(op)) => assert_eq!(op, "activate"),
        other => panic!("expected busy engine, got {:?}", other),
    }
    assert_eq!(session.depth(), 0);

    drop(engine);
    session.enter().unwrap();
    session.exit().unwrap();
}

#[test]
fn test_empty_mount() {
    let session = session();
    session.mount_writable("empty.sav", &[]).unwrap();
    assert!(session.unmount_file("empty.sav").unwrap().is_empty());
}

#[test]
fn test_state_round_trip() {
    let first = session();
    first.engine_mut().poke(0, 0x12);
    first.engine_mut().poke(63, 0x34);
    let blob = first.save_state().unwrap();

    let second = session();
    second.load_state(&blob).unwrap();
    assert_eq!(second.engine().peek(0), 0x12);
    assert_eq!(second.engine().peek(63), 0x34);
    assert_eq!(second.save_state().unwrap(), blob);
}

#[test]
fn test_load_corrupt_state() {
    let session = session();
    let result = session.load_state(b"garbage");
    assert!(matches!(result, Err(HostError::Engine { op: "load_state", .. })));
}

#[test]
fn test_open_from_config() {
    let dir = tempfile::tempdir().unwrap();
    let module = dir.path().join("core.wbx");
    std::fs::write(&module, module_image(&["init"])).unwrap();

    let config_path = dir.path().join("session.json");
    let config = SessionConfig::new(&module).with_sbrk_kb(8).with_mmap_kb(256);
    std::fs::write(&config_path, config.to_json().unwrap()).unwrap();

    let config = SessionConfig::from_json_file(&config_path).unwrap();
    let session = Session::open(&config).unwrap();
    assert_eq!(session.name(), "core.wbx");
    assert_eq!(session.engine().layout.sbrk_size, 8 * 1024);
    assert_eq!(session.engine().layout.mmap_size, 256 * 1024);
    assert!(session.resolve_symbol("init").is_ok());
}

#[test]
fn test_open_missing_module() {
    let dir = tempfile::tempdir().unwrap();
    let config = SessionConfig::new(dir.path().join("missing.wbx"));

    match Session::open(&config) {
        Err(HostError::Io(e)) => assert!(e.to_string().contains("missing.wbx")),
        other => panic!("expected io error, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_destroy_releases_engine_once() {
    let before = destroyed_count();

    let session = session();
    session.destroy().unwrap();
    assert_eq!(destroyed_count(), before + 1);

    {
        let _dropped = self::session();
    }
    assert_eq!(destroyed_count(), before + 2);
}
