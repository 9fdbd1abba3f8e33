use std::fs::File;
use std::path::Path;

use tempfile::TempPath;

use crate::{FetchError, FetchTarget};

/// Move a fresh download into place under `<target_dir>/<stem>/`.
///
/// The validator marker is replaced first, then the type-specific handler
/// runs: text files are renamed in (copy-then-delete when the staging area
/// sits on another device), archives have only their `<stem>.txt` entry
/// extracted and the archive itself is deleted immediately afterwards. An
/// archive that cannot be unpacked fails the whole refresh for its country.
pub fn stage_fresh(
    target_dir: &Path,
    target: &FetchTarget,
    etag: Option<&str>,
    temp_path: TempPath,
) -> Result<(), FetchError> {
    let dir = target_dir.join(&target.stem);
    std::fs::create_dir_all(&dir)?;

    if let Some(etag) = etag {
        // whole-file replace; the marker's mtime is the staleness clock
        std::fs::write(dir.join("etag"), etag)?;
    }

    if target.extension == ".zip" {
        unpack_archive(&dir, target, &temp_path)?;
        if let Err(e) = temp_path.close() {
            tracing::warn!(archive = %target.file_name(), "could not remove spent archive: {e}");
        }
        return Ok(());
    }

    let dest = dir.join(target.file_name());
    if let Err(persist_err) = temp_path.persist(&dest) {
        let staged = persist_err.path;
        std::fs::copy(&staged, &dest)?;
        if let Err(e) = staged.close() {
            tracing::warn!(file = %dest.display(), "could not remove staging copy: {e}");
        }
    }
    Ok(())
}

fn unpack_archive(dir: &Path, target: &FetchTarget, archive_path: &Path) -> Result<(), FetchError> {
    let entry_name = format!("{}.txt", target.stem);

    let mut archive = zip::ZipArchive::new(File::open(archive_path)?).map_err(|source| {
        FetchError::Archive {
            archive: target.file_name(),
            source,
        }
    })?;
    let mut entry = archive
        .by_name(&entry_name)
        .map_err(|source| FetchError::Archive {
            archive: target.file_name(),
            source,
        })?;
    let mut out = File::create(dir.join(&entry_name))?;
    std::io::copy(&mut entry, &mut out)?;
    Ok(())
}
