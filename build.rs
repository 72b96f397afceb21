use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/refs");

    let version = std::env::var("CARGO_PKG_VERSION").unwrap_or_default();
    let sha = Command::new("git")
        .args(["rev-parse", "--short=12", "HEAD"])
        .output()
        .ok()
        .filter(|output| output.status.success())
        .map(|output| String::from_utf8_lossy(&output.stdout).trim().to_string())
        .filter(|sha| !sha.is_empty());

    match sha {
        Some(sha) => {
            println!("cargo:rustc-env=MUSTER_BUILD_GIT_SHA={sha}");
            println!("cargo:rustc-env=MUSTER_LONG_VERSION={version} ({sha})");
        }
        None => println!("cargo:rustc-env=MUSTER_LONG_VERSION={version}"),
    }
}
