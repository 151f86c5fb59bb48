// A failed registration must roll back so a later attempt can succeed.

use std::os::unix::fs::PermissionsExt;

#[test]
fn bad_path_fails_then_recovers() {
    let base = std::env::temp_dir().join(format!("cc-invalid-{}", std::process::id()));
    std::fs::write(&base, b"not a directory").unwrap();

    // create_dir_all cannot descend through a regular file
    let bad = base.join("dumps");
    assert!(!crash_capture::init(&bad));
    assert!(!crash_capture::is_installed());

    // An existing directory we can't write dumps into must fail too.
    // Root passes every permission check, so there is nothing to test then.
    if unsafe { libc::geteuid() } != 0 {
        let ro = std::env::temp_dir().join(format!("cc-invalid-ro-{}", std::process::id()));
        std::fs::create_dir_all(&ro).unwrap();
        std::fs::set_permissions(&ro, std::fs::Permissions::from_mode(0o555)).unwrap();

        assert!(!crash_capture::init(&ro));
        assert!(!crash_capture::is_installed());

        std::fs::set_permissions(&ro, std::fs::Permissions::from_mode(0o755)).unwrap();
        std::fs::remove_dir_all(ro).unwrap();
    }

    let good = std::env::temp_dir().join(format!("cc-invalid-ok-{}", std::process::id()));
    assert!(crash_capture::init(&good));
    assert!(crash_capture::is_installed());

    std::fs::remove_file(base).unwrap();
    std::fs::remove_dir_all(good).unwrap();
}
