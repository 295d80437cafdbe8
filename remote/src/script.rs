//! Shell scripts run on the remote host for each filesystem operation
//!
//! Every script is passed to `sh -c`, with paths quoted by [`crate::shell_escape`]. Scripts that
//! need to report a missing path exit with [`NOT_FOUND_EXIT`].

use crate::shell_escape;

/// Exit status used by scripts when the target path does not exist.
pub const NOT_FOUND_EXIT: i32 = 44;

fn require(test: &str, path: &str) -> String {
    format!("[ {} {} ] || exit {}", test, shell_escape(path), NOT_FOUND_EXIT)
}

pub fn file_exists(path: &str) -> String {
    format!("test -f {}", shell_escape(path))
}

pub fn directory_exists(path: &str) -> String {
    format!("test -d {}", shell_escape(path))
}

pub fn read_file(path: &str) -> String {
    format!("{}; cat -- {}", require("-f", path), shell_escape(path))
}

/// Reads the new content from stdin.
pub fn write_file(path: &str) -> String {
    format!("cat > {}", shell_escape(path))
}

pub fn delete_file(path: &str) -> String {
    format!("{}; rm -f -- {}", require("-e", path), shell_escape(path))
}

/// NUL separated `./name` entries of the given type, following symlinks.
pub fn list(path: &str, file_type: char) -> String {
    format!(
        "{}; cd {} && find -L . -mindepth 1 -maxdepth 1 -type {} -print0",
        require("-d", path),
        shell_escape(path),
        file_type
    )
}

pub fn create_directory(path: &str) -> String {
    format!("mkdir -p -- {}", shell_escape(path))
}

pub fn delete_directory(path: &str) -> String {
    format!("{}; rm -rf -- {}", require("-d", path), shell_escape(path))
}

/// Modification time in seconds since the epoch, GNU `stat` first, BSD `stat` as fallback.
pub fn last_modified(path: &str) -> String {
    let escaped = shell_escape(path);
    format!(
        "{}; stat -L -c %Y -- {} 2>/dev/null || stat -L -f %m {}",
        require("-e", path),
        escaped,
        escaped
    )
}

/// Names from the output of a [`list`] script.
pub fn parse_names(stdout: &[u8]) -> Vec<String> {
    let mut names: Vec<String> = stdout
        .split(|byte| *byte == 0)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let entry = String::from_utf8_lossy(entry);
            entry.strip_prefix("./").unwrap_or(&entry).to_string()
        })
        .filter(|name| name != "." && name != "..")
        .collect();
    names.sort();
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripts_quote_paths() {
        assert_eq!(file_exists("/a b/c"), "test -f '/a b/c'");
        assert_eq!(read_file("/x'y"), "[ -f '/x'\\''y' ] || exit 44; cat -- '/x'\\''y'");
        assert_eq!(write_file("/tmp/f"), "cat > '/tmp/f'");
        assert_eq!(
            list("/srv", 'd'),
            "[ -d '/srv' ] || exit 44; cd '/srv' && find -L . -mindepth 1 -maxdepth 1 -type d -print0"
        );
    }

    #[test]
    fn parses_find_output() {
        let stdout = b"./b.txt\0./a file\0./.hidden\0";
        assert_eq!(parse_names(stdout), vec![".hidden", "a file", "b.txt"]);
        assert!(parse_names(b"").is_empty());
    }
}
