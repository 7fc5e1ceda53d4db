use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::model::TEACHER_TEST_NAME_PREFIX;

const IGNORED_SUFFIX: &str = ".ignore";

/// Hides teacher test sources from the build tool while alive, so that only the
/// student's own tests run. Every renamed file is put back on [`restore`] or drop.
///
/// [`restore`]: HiddenTestsGuard::restore
pub struct HiddenTestsGuard {
    renamed: Vec<(PathBuf, PathBuf)>,
}

impl HiddenTestsGuard {
    /// Renames every `TestTeacher*` file below `test_root` to `*.ignore`.
    /// A missing `test_root` hides nothing.
    pub fn engage(test_root: &Path) -> io::Result<Self> {
        let mut guard = Self {
            renamed: Vec::new(),
        };
        if !test_root.is_dir() {
            return Ok(guard);
        }

        let mut found = Vec::new();
        collect_teacher_sources(test_root, &mut found)?;
        found.sort();

        for original in found {
            let mut hidden = original.clone().into_os_string();
            hidden.push(IGNORED_SUFFIX);
            let hidden = PathBuf::from(hidden);
            // on error, dropping the guard restores what was renamed so far
            fs::rename(&original, &hidden)?;
            guard.renamed.push((original, hidden));
        }

        Ok(guard)
    }

    pub fn hidden(&self) -> usize {
        self.renamed.len()
    }

    pub fn restore(mut self) -> io::Result<()> {
        self.restore_all()
    }

    fn restore_all(&mut self) -> io::Result<()> {
        let mut first_error = None;
        while let Some((original, hidden)) = self.renamed.pop() {
            if let Err(e) = fs::rename(&hidden, &original) {
                log::error!("Failed to restore {}: {e}", original.display());
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for HiddenTestsGuard {
    fn drop(&mut self) {
        let _ = self.restore_all();
    }
}

fn collect_teacher_sources(dir: &Path, found: &mut Vec<PathBuf>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_teacher_sources(&path, found)?;
        } else if path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(TEACHER_TEST_NAME_PREFIX) && !n.ends_with(IGNORED_SUFFIX))
        {
            found.push(path);
        }
    }
    Ok(())
}
