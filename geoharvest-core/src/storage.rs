use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::records::GeonameRecord;
use crate::CurateError;

/// Curated-list storage in `<bincode term><terminator>` format.
///
/// The payload is one self-delimited bincode term; the trailing byte marks
/// a complete write, so a reader can tell a truncated file from a valid
/// one before decoding.
const TERMINATOR: u8 = 0x1e;

/// Serialize the curated list.
pub fn dump<W: Write>(buf: &mut W, records: &[GeonameRecord]) -> Result<(), CurateError> {
    let payload = bincode::serialize(records)?;
    buf.write_all(&payload)?;
    buf.write_all(&[TERMINATOR])?;
    Ok(())
}

/// Deserialize a curated list, refusing files without the terminator.
pub fn load(bytes: &[u8], origin: &Path) -> Result<Vec<GeonameRecord>, CurateError> {
    match bytes.split_last() {
        Some((&TERMINATOR, payload)) => Ok(bincode::deserialize(payload)?),
        _ => Err(CurateError::Truncated(origin.to_path_buf())),
    }
}

/// Path of a country's curated file under its directory.
pub fn curated_path(country_dir: &Path, country_code: &str) -> PathBuf {
    country_dir.join(format!("{country_code}_fcp.txt"))
}

/// Dump the curated list for one country.
///
/// Written to a sibling temp name and renamed into place, so the file
/// appears fully written or not at all.
pub fn dump_to(
    country_dir: &Path,
    country_code: &str,
    records: &[GeonameRecord],
) -> Result<PathBuf, CurateError> {
    let path = curated_path(country_dir, country_code);
    let mut tmp = tempfile::NamedTempFile::new_in(country_dir)?;
    dump(tmp.as_file_mut(), records)?;
    tmp.persist(&path).map_err(|e| e.error)?;
    Ok(path)
}

/// Load the curated list for one country.
pub fn load_from(path: &Path) -> Result<Vec<GeonameRecord>, CurateError> {
    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;
    load(&bytes, path)
}
