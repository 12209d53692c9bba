//! Archiving of sealed segments.
//!
//! A segment is archived either by an external command or by copying it into
//! the archive directory. With neither configured it is recycled directly.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::config::JournalConfig;
use crate::error::{JournalError, JournalResult};

/// Placeholder for the segment file name.
const LOG_FILE_NAME: &str = "$(logfilename)";

/// Placeholder for the full segment path.
const LOG_PATH_NAME: &str = "$(logpathname)";

/// Placeholder for the full path of the archived copy.
pub(crate) const ARCHIVE_PATH_NAME: &str = "$(archpathname)";

/// Expands the archive command placeholders for one segment.
pub fn expand_archive_command(command: &str, segment: &Path, archive_dir: Option<&Path>) -> String {
    let file_name = segment
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut expanded = command
        .replace(LOG_FILE_NAME, &file_name)
        .replace(LOG_PATH_NAME, &segment.to_string_lossy());

    if expanded.contains(ARCHIVE_PATH_NAME) {
        let target = match archive_dir {
            Some(dir) => dir.join(&file_name).to_string_lossy().into_owned(),
            None => {
                tracing::warn!("archive command uses {} without an archive directory", ARCHIVE_PATH_NAME);
                String::new()
            }
        };
        expanded = expanded.replace(ARCHIVE_PATH_NAME, &target);
    }
    expanded
}

/// Archives one sealed segment.
///
/// Returns where the copy went, or `None` if nothing was configured and the
/// segment can be recycled as is.
pub(crate) fn archive_segment_file(
    config: &JournalConfig,
    segment: &Path,
) -> JournalResult<Option<PathBuf>> {
    if let Some(command) = &config.archive_command {
        let expanded = expand_archive_command(command, segment, config.archive_dir.as_deref());
        run_command(&expanded, segment)?;
        let target = config
            .archive_dir
            .as_ref()
            .and_then(|dir| segment.file_name().map(|name| dir.join(name)))
            .unwrap_or_else(|| segment.to_path_buf());
        return Ok(Some(target));
    }

    if let Some(dir) = &config.archive_dir {
        return copy_into(dir, segment).map(Some);
    }

    Ok(None)
}

fn run_command(command: &str, segment: &Path) -> JournalResult<()> {
    tracing::debug!("running archive command: {}", command);

    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .output()
        .map_err(|e| JournalError::archive_failed(segment, format!("cannot run command: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(JournalError::archive_failed(
            segment,
            format!(
                "command \"{}\" failed with {}: {}",
                command,
                output.status,
                stderr.trim()
            ),
        ));
    }

    Ok(())
}

/// Copies the segment into `dir` through a temporary file so a crash never
/// leaves a partial copy under the final name.
fn copy_into(dir: &Path, segment: &Path) -> JournalResult<PathBuf> {
    let name = segment
        .file_name()
        .ok_or_else(|| JournalError::archive_failed(segment, "segment path has no file name"))?;

    fs::create_dir_all(dir)
        .map_err(|e| JournalError::archive_failed(segment, format!("cannot create {}: {}", dir.display(), e)))?;

    let target = dir.join(name);
    let mut tmp_name = name.to_os_string();
    tmp_name.push(".tmp");
    let tmp = dir.join(tmp_name);

    let copy = || -> std::io::Result<()> {
        fs::copy(segment, &tmp)?;
        File::open(&tmp)?.sync_all()?;
        fs::rename(&tmp, &target)?;
        if let Ok(dir) = File::open(dir) {
            let _ = dir.sync_all();
        }
        Ok(())
    };

    copy().map_err(|e| {
        let _ = fs::remove_file(&tmp);
        JournalError::archive_failed(segment, format!("cannot copy to {}: {}", target.display(), e))
    })?;

    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_expand_placeholders() {
        let segment = Path::new("/data/journal/db.journal-000000007");
        let expanded = expand_archive_command(
            "cp $(logpathname) $(archpathname) && echo $(logfilename)",
            segment,
            Some(Path::new("/archive")),
        );
        assert_eq!(
            expanded,
            "cp /data/journal/db.journal-000000007 /archive/db.journal-000000007 && echo db.journal-000000007"
        );

        let expanded = expand_archive_command("gzip -k $(logpathname)", segment, None);
        assert_eq!(expanded, "gzip -k /data/journal/db.journal-000000007");

        let expanded = expand_archive_command("cp $(logpathname) $(archpathname)", segment, None);
        assert_eq!(expanded, "cp /data/journal/db.journal-000000007 ");
    }

    #[test]
    fn test_copy_into_archive_dir() {
        let tmp = TempDir::new().unwrap();
        let segment = tmp.path().join("db.journal-000000001");
        fs::write(&segment, b"segment contents").unwrap();

        let config = JournalConfig::new(tmp.path()).with_archive_dir(tmp.path().join("archive"));
        let target = archive_segment_file(&config, &segment).unwrap().unwrap();

        assert_eq!(target, tmp.path().join("archive/db.journal-000000001"));
        assert_eq!(fs::read(&target).unwrap(), b"segment contents");
        assert!(!tmp.path().join("archive/db.journal-000000001.tmp").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_archive_command() {
        let tmp = TempDir::new().unwrap();
        let segment = tmp.path().join("db.journal-000000002");
        fs::write(&segment, b"data").unwrap();
        let archive = tmp.path().join("archive");
        fs::create_dir_all(&archive).unwrap();

        let config = JournalConfig::new(tmp.path())
            .with_archive_dir(&archive)
            .with_archive_command("cp $(logpathname) $(archpathname)");
        let target = archive_segment_file(&config, &segment).unwrap().unwrap();
        assert_eq!(fs::read(target).unwrap(), b"data");
    }

    #[cfg(unix)]
    #[test]
    fn test_failing_command() {
        let tmp = TempDir::new().unwrap();
        let segment = tmp.path().join("db.journal-000000003");
        fs::write(&segment, b"data").unwrap();

        let config = JournalConfig::new(tmp.path()).with_archive_command("exit 3");
        let err = archive_segment_file(&config, &segment).unwrap_err();
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_nothing_configured() {
        let tmp = TempDir::new().unwrap();
        let segment = tmp.path().join("db.journal-000000004");
        fs::write(&segment, b"data").unwrap();

        let config = JournalConfig::new(tmp.path());
        assert!(archive_segment_file(&config, &segment).unwrap().is_none());
    }
}
