use std::fs;

#[test]
fn simulated_signal_flows_to_host() {
    let dir = std::env::temp_dir().join(format!("cc-pipeline-{}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);

    assert!(crash_capture::init(&dir));
    assert!(crash_capture::simulate_signal(libc::SIGSEGV));

    let notice = crash_capture::pending_dump().expect("a dump should be pending");
    assert!(notice.succeeded);
    assert!(notice.path.exists());
    assert_eq!(notice.path.extension().unwrap(), "dmp");

    let bytes = fs::read(&notice.path).unwrap();
    assert_eq!(&bytes[..4], b"MDMP");

    // Collecting the dump writes the metadata sidecar next to it
    let sidecar = notice.path.with_extension("metadata");
    let meta: crash_capture::CrashMetadata =
        serde_json::from_slice(&fs::read(&sidecar).unwrap()).unwrap();
    assert_eq!(meta.version, crash_capture::version());
    assert_eq!(meta.checksum.len(), 40);

    let stale = crash_capture::stale_dumps(&dir).unwrap();
    assert_eq!(stale, vec![notice.path.clone()]);

    // The queue only held the one event
    assert!(crash_capture::pending_dump().is_none());

    fs::remove_dir_all(dir).unwrap();
}
