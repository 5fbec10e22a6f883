//! Prepare environment variables for build
use std::ffi::OsStr;
use std::process::Command;

/// Get stdout of command
fn get_output<S, I>(program: S, args: I) -> Result<String, std::io::Error>
where
    S: AsRef<OsStr>,
    I: IntoIterator<Item = S>,
{
    let finished = Command::new(program).args(args).output()?;

    if !finished.status.success() {
        return Err(std::io::Error::other("command exited with a non-zero status"));
    }
    Ok(String::from_utf8(finished.stdout).unwrap_or_default())
}

fn main() {
    // Falls back to "unknown"/clean rather than failing the build when run
    // outside a git checkout (e.g. a source tarball).
    let git_hash = get_output("git", ["rev-parse", "--short", "HEAD"]).unwrap_or_else(|_| "unknown".into());
    let git_hash_full = get_output("git", ["rev-parse", "HEAD"]).unwrap_or_else(|_| "unknown".into());
    let clean = get_output("git", ["status", "--untracked-files=no", "--porcelain"])
        .map(|out| out.is_empty())
        .unwrap_or(true);

    println!("cargo:rustc-env=GIT_STATUS_FULL_HASH={git_hash_full}");
    println!("cargo:rustc-env=GIT_STATUS_HASH={git_hash}");
    println!(
        "cargo:rustc-env=GIT_STATUS_DIRTY={dirty}",
        dirty = if clean { "" } else { "dirty" }
    );
}
