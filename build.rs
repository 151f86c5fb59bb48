fn main() {
    // Bake the source revision in so crash reports can be matched to the
    // exact build that produced them. Builds outside a git checkout get a
    // recognizable all-zero value.
    let checksum = std::process::Command::new("git")
        .args(["rev-parse", "HEAD"])
        .output()
        .ok()
        .filter(|out| out.status.success())
        .and_then(|out| String::from_utf8(out.stdout).ok())
        .map(|rev| rev.trim().to_owned())
        .filter(|rev| rev.len() == 40 && rev.bytes().all(|b| b.is_ascii_hexdigit()))
        .unwrap_or_else(|| "0".repeat(40));

    println!("cargo:rustc-env=CRASH_CAPTURE_CHECKSUM={}", checksum);
    println!("cargo:rerun-if-changed=build.rs");
}
