fn main() {
    let cur_dir = std::env::current_dir().unwrap();

    minidump_handler::attach(
        cur_dir,
        Some(Box::new(
            |minidump: &minidump_handler::MinidumpDescriptor, succeeded: bool| {
                // Compromised context, but this example only exists to be
                // poked at interactively
                println!("Minidump written to {} ({})", minidump.path_str(), succeeded);

                succeeded
            },
        )),
    )
    .unwrap();

    if std::env::args().any(|a| a == "--crash") {
        unsafe {
            let ptr: *mut u8 = std::ptr::null_mut();
            std::ptr::write_volatile(ptr, 42);
        }
    }
}
