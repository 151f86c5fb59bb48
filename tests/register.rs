use std::sync::{Arc, Barrier};

fn dump_dir() -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("cc-register-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

#[test]
fn exactly_one_registration_wins() {
    let dir = dump_dir();

    let barrier = Arc::new(Barrier::new(8));

    let threads: Vec<_> = (0..8)
        .map(|_| {
            let barrier = barrier.clone();
            let dir = dir.clone();
            std::thread::spawn(move || {
                barrier.wait();
                crash_capture::init(&dir)
            })
        })
        .collect();

    let wins = threads
        .into_iter()
        .map(|t| t.join().unwrap())
        .filter(|won| *won)
        .count();

    assert_eq!(wins, 1);
    assert!(crash_capture::is_installed());

    // Late arrivals fail without disturbing the registration
    assert!(!crash_capture::init(&dir));
    assert!(matches!(
        crash_capture::try_init(&dir),
        Err(crash_capture::Error::Handler(
            minidump_handler::Error::HandlerAlreadyRegistered
        ))
    ));
    assert!(crash_capture::is_installed());

    std::fs::remove_dir_all(dir).unwrap();
}
