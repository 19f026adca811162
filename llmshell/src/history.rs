use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Appends every spawned command to `llmshell.history.sh` so a run can be
/// replayed by hand. Output is kept as `#> ` comments under each command.
#[derive(Clone)]
pub struct CommandHistory {
    file: Arc<Mutex<File>>,
    path: PathBuf,
}

impl CommandHistory {
    pub fn open(history_path: PathBuf) -> io::Result<Self> {
        if let Some(parent) = history_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&history_path)?;

        Ok(Self {
            file: Arc::new(Mutex::new(file)),
            path: history_path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(
        &self,
        command: &str,
        cwd: Option<&Path>,
        output: &str,
        return_code: Option<i32>,
    ) -> io::Result<()> {
        let mut file = self
            .file
            .lock()
            .map_err(|e| io::Error::other(format!("history file lock poisoned: {e}")))?;

        if let Some(cwd) = cwd {
            writeln!(file, "cd {}", quote(&cwd.to_string_lossy()))?;
        }
        writeln!(file, "{command}")?;
        for line in output.lines() {
            writeln!(file, "#> {}", line.replace('\r', ""))?;
        }
        match return_code {
            Some(code) => writeln!(file, "# exit {code}")?,
            None => writeln!(file, "# no exit status")?,
        }
        writeln!(file)?;
        file.flush()
    }
}

fn quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', "'\"'\"'"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn records_command_with_output() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.sh");
        let history = CommandHistory::open(path.clone()).unwrap();

        history
            .record("echo hello", None, "hello\n", Some(0))
            .unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("echo hello\n#> hello\n# exit 0"));
    }

    #[test]
    fn quotes_working_directory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("history.sh");
        let history = CommandHistory::open(path.clone()).unwrap();

        history
            .record("ls", Some(Path::new("/path/with'quote")), "", None)
            .unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("cd '/path/with'\"'\"'quote'"));
        assert!(content.contains("# no exit status"));
    }
}
