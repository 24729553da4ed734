use std::{env, process::Command};

fn main() {
    println!("cargo:rerun-if-env-changed=NL_BUILD_GIT_TAG");
    println!("cargo:rerun-if-env-changed=NL_BUILD_GIT_COMMIT");
    println!("cargo:rerun-if-env-changed=NL_BUILD_GIT_DIRTY");

    let git_tag = env::var("NL_BUILD_GIT_TAG").unwrap_or_else(|_| {
        git_output(&["describe", "--tags", "--exact-match"])
            .unwrap_or_else(|| "untagged".to_string())
    });
    let git_commit = env::var("NL_BUILD_GIT_COMMIT").unwrap_or_else(|_| {
        git_output(&["rev-parse", "--short=12", "HEAD"]).unwrap_or_else(|| "unknown".to_string())
    });
    let git_dirty = env::var("NL_BUILD_GIT_DIRTY").unwrap_or_else(|_| {
        let dirty = git_output(&["status", "--porcelain", "--untracked-files=no"])
            .is_some_and(|output| !output.is_empty());
        dirty.to_string()
    });

    println!("cargo:rustc-env=NL_BUILD_GIT_TAG={git_tag}");
    println!("cargo:rustc-env=NL_BUILD_GIT_COMMIT={git_commit}");
    println!("cargo:rustc-env=NL_BUILD_GIT_DIRTY={git_dirty}");
}

fn git_output(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8(output.stdout)
        .ok()
        .map(|value| value.trim().to_string())
}
