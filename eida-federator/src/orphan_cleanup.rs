//! Startup orphan sweep (spec §4.M): best-effort removal of spooled files
//! left behind by a previous process that crashed before streaming them out
//! or removing them.

use std::path::Path;

use tracing::warn;

const PREFIX: &str = "eida-federator-";

pub fn sweep(tmpdir: &Path) {
    let entries = match std::fs::read_dir(tmpdir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("orphan sweep: could not read {tmpdir:?}: {e}");
            return;
        }
    };

    let mut removed = 0usize;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with(PREFIX) {
            continue;
        }
        if std::fs::remove_file(entry.path()).is_ok() {
            removed += 1;
        }
    }
    if removed > 0 {
        tracing::info!("orphan sweep: removed {removed} leftover spool file(s) from {tmpdir:?}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removes_only_prefixed_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("eida-federator-abc123"), b"x").unwrap();
        std::fs::write(dir.path().join("unrelated.txt"), b"y").unwrap();

        sweep(dir.path());

        let remaining: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(remaining, vec!["unrelated.txt".to_string()]);
    }
}
