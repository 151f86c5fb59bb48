use std::fs;

#[test]
fn failed_dump_is_reported_and_cleaned() {
    let dir = std::env::temp_dir().join(format!("cc-pipeline-fail-{}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);

    assert!(crash_capture::init(&dir));

    // Pull the directory out from under the handler
    fs::remove_dir_all(&dir).unwrap();

    assert!(!crash_capture::simulate_signal(libc::SIGSEGV));

    let notice = crash_capture::pending_dump().expect("the failure is still reported");
    assert!(!notice.succeeded);
    assert!(!notice.path.exists());
}
