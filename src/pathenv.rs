//! `PATH` helpers for spawning `btrfs` from cron/systemd environments
//! that commonly trim `PATH` down to user-facing directories.

use std::env;

/// Appends `/usr/sbin` and `/sbin` to `path` if not already present.
pub fn ensure_sbin_on_path(path: &str) -> String {
    let mut parts: Vec<&str> = path.split(':').filter(|p| !p.is_empty()).collect();
    for entry in ["/usr/sbin", "/sbin"] {
        if !parts.contains(&entry) {
            parts.push(entry);
        }
    }
    parts.join(":")
}

/// Sets `PATH` on `command` to the current process's `PATH` widened
/// with `ensure_sbin_on_path`.
pub fn ensure_sbin_on_command_path(command: &mut tokio::process::Command) {
    let current = env::var("PATH").unwrap_or_default();
    command.env("PATH", ensure_sbin_on_path(&current));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_missing_sbin_dirs() {
        assert_eq!(ensure_sbin_on_path("/usr/bin"), "/usr/bin:/usr/sbin:/sbin");
    }

    #[test]
    fn leaves_existing_entries_untouched() {
        assert_eq!(
            ensure_sbin_on_path("/usr/sbin:/usr/bin:/sbin"),
            "/usr/sbin:/usr/bin:/sbin"
        );
    }

    #[test]
    fn handles_empty_path() {
        assert_eq!(ensure_sbin_on_path(""), "/usr/sbin:/sbin");
    }
}
