//! Outcome records of a backup run

/// Outcome of a single file transfer attempt.
#[derive(Debug)]
pub struct BackupFileResult {
    pub source: String,
    pub destination: String,
    /// The destination already held identical content.
    pub skipped: bool,
    /// Bytes written to the destination, zero for skipped and failed files.
    pub bytes: u64,
    pub error: Option<anyhow::Error>,
}

impl BackupFileResult {
    pub fn transferred(source: String, destination: String, bytes: u64) -> Self {
        Self {
            source,
            destination,
            skipped: false,
            bytes,
            error: None,
        }
    }

    pub fn skipped(source: String, destination: String) -> Self {
        Self {
            source,
            destination,
            skipped: true,
            bytes: 0,
            error: None,
        }
    }

    pub fn failed(source: String, destination: String, error: anyhow::Error) -> Self {
        Self {
            source,
            destination,
            skipped: false,
            bytes: 0,
            error: Some(error),
        }
    }

    /// Skipped files count as successful.
    pub fn success(&self) -> bool {
        self.error.is_none()
    }
}

/// Aggregated outcome of backing up one directory tree.
#[derive(Debug)]
pub struct BackupDirResult {
    pub source: String,
    pub destination: String,
    pub files: Vec<BackupFileResult>,
    pub elapsed: std::time::Duration,
}

impl BackupDirResult {
    pub fn new(
        source: String,
        destination: String,
        files: Vec<BackupFileResult>,
        elapsed: std::time::Duration,
    ) -> Self {
        Self {
            source,
            destination,
            files,
            elapsed,
        }
    }

    pub fn total(&self) -> usize {
        self.files.len()
    }

    pub fn success(&self) -> usize {
        self.files.iter().filter(|file| file.success()).count()
    }

    pub fn failed(&self) -> usize {
        self.total() - self.success()
    }

    pub fn skipped(&self) -> usize {
        self.files.iter().filter(|file| file.skipped).count()
    }

    pub fn bytes(&self) -> u64 {
        self.files.iter().map(|file| file.bytes).sum()
    }

    pub fn failures(&self) -> impl Iterator<Item = &BackupFileResult> {
        self.files.iter().filter(|file| !file.success())
    }
}

impl std::fmt::Display for BackupDirResult {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "'{}' => '{}': {}/{}\n\
            skipped: {}\n\
            failed: {}\n\
            bytes transferred: {}\n\
            elapsed: {}",
            &self.source,
            &self.destination,
            self.success(),
            self.total(),
            self.skipped(),
            self.failed(),
            bytesize::ByteSize(self.bytes()),
            humantime::format_duration(std::time::Duration::from_millis(
                self.elapsed.as_millis() as u64
            )),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_and_display() {
        let result = BackupDirResult::new(
            "src".to_string(),
            "dst".to_string(),
            vec![
                BackupFileResult::transferred("src/a".into(), "dst/src/a".into(), 10),
                BackupFileResult::skipped("src/b".into(), "dst/src/b".into()),
                BackupFileResult::failed(
                    "src/c".into(),
                    "dst/src/c".into(),
                    anyhow::anyhow!("boom"),
                ),
            ],
            std::time::Duration::from_millis(1500),
        );
        assert_eq!(result.total(), 3);
        assert_eq!(result.success(), 2);
        assert_eq!(result.failed(), 1);
        assert_eq!(result.skipped(), 1);
        assert_eq!(result.bytes(), 10);
        assert_eq!(result.failures().count(), 1);
        let text = result.to_string();
        assert!(text.starts_with("'src' => 'dst': 2/3\n"));
        assert!(text.contains("skipped: 1"));
        assert!(text.contains("failed: 1"));
        assert!(text.contains("elapsed: 1s 500ms"));
    }
}
