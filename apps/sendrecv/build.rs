use chrono::Utc;

fn main() {
    // Appended to `--version`.
    let stamp = Utc::now().format("%Y%m%d%H%M%S");
    println!("cargo:rustc-env=SENDRECV_BUILD_STAMP={stamp}");
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=src/main.rs");
}
