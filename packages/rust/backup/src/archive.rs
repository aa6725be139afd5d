//! Checkpoint directories as gzip-compressed tarballs.

use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDateTime, Utc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

use samplegraph_shared::{Result, SampleGraphError};

const NAME_PREFIX: &str = "samplegraph-checkpoint-";
const NAME_SUFFIX: &str = ".tar.gz";
const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";

static ARCHIVE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^samplegraph-checkpoint-(\d{8}T\d{6}Z)\.tar\.gz$").expect("valid regex")
});

/// Asset name for an archive created at `at`.
pub fn archive_name(at: DateTime<Utc>) -> String {
    format!("{NAME_PREFIX}{}{NAME_SUFFIX}", at.format(TIMESTAMP_FORMAT))
}

pub fn is_archive_name(name: &str) -> bool {
    ARCHIVE_NAME.is_match(name)
}

/// Creation time encoded in an archive name.
pub fn archive_timestamp(name: &str) -> Option<DateTime<Utc>> {
    let caps = ARCHIVE_NAME.captures(name)?;
    NaiveDateTime::parse_from_str(&caps[1], TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Write `dir`'s contents into a tar.gz at `dest`. Returns the SHA-256 of
/// the archive as lowercase hex.
#[instrument(skip_all, fields(dir = %dir.display()))]
pub fn pack(dir: &Path, dest: &Path) -> Result<String> {
    if !dir.is_dir() {
        return Err(SampleGraphError::Archive(format!(
            "not a directory: {}",
            dir.display()
        )));
    }
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| SampleGraphError::io(parent, e))?;
    }

    let file = File::create(dest).map_err(|e| SampleGraphError::io(dest, e))?;
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    builder
        .append_dir_all(".", dir)
        .map_err(|e| SampleGraphError::Archive(format!("{}: {e}", dir.display())))?;
    let encoder = builder
        .into_inner()
        .map_err(|e| SampleGraphError::Archive(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| SampleGraphError::Archive(e.to_string()))?;

    let digest = sha256_file(dest)?;
    debug!(archive = %dest.display(), sha256 = %digest, "checkpoint packed");
    Ok(digest)
}

/// Extract `archive` into `dest`, creating it if needed.
#[instrument(skip_all, fields(archive = %archive.display()))]
pub fn unpack(archive: &Path, dest: &Path) -> Result<()> {
    let file = File::open(archive).map_err(|e| SampleGraphError::io(archive, e))?;
    fs::create_dir_all(dest).map_err(|e| SampleGraphError::io(dest, e))?;
    tar::Archive::new(GzDecoder::new(BufReader::new(file)))
        .unpack(dest)
        .map_err(|e| SampleGraphError::Archive(format!("{}: {e}", archive.display())))?;
    Ok(())
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|e| SampleGraphError::io(path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).map_err(|e| SampleGraphError::io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::path::PathBuf;
    use uuid::Uuid;

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("sg_archive_{}", Uuid::now_v7()))
    }

    #[test]
    fn names_carry_the_timestamp() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).single().expect("date");
        let name = archive_name(at);
        assert_eq!(name, "samplegraph-checkpoint-20240309T070501Z.tar.gz");
        assert!(is_archive_name(&name));
        assert_eq!(archive_timestamp(&name), Some(at));

        assert!(!is_archive_name("notes.txt"));
        assert!(!is_archive_name("samplegraph-checkpoint-2024.tar.gz"));
        assert_eq!(archive_timestamp("other.tar.gz"), None);
    }

    #[test]
    fn pack_then_unpack_restores_files() {
        let root = temp_dir();
        let src = root.join("checkpoint");
        fs::create_dir_all(src.join("nested")).expect("mkdir");
        fs::write(src.join("graph.json"), b"{\"nodes\":[]}").expect("write");
        fs::write(src.join("nested/extra.txt"), b"hello").expect("write");

        let archive = root.join("out.tar.gz");
        let digest = pack(&src, &archive).expect("pack");
        assert_eq!(digest.len(), 64);
        assert_eq!(digest, sha256_file(&archive).expect("hash"));

        let dest = root.join("restored");
        unpack(&archive, &dest).expect("unpack");
        assert_eq!(
            fs::read(dest.join("graph.json")).expect("read"),
            b"{\"nodes\":[]}"
        );
        assert_eq!(fs::read(dest.join("nested/extra.txt")).expect("read"), b"hello");

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn garbage_is_an_archive_error() {
        let root = temp_dir();
        fs::create_dir_all(&root).expect("mkdir");
        let bogus = root.join("bogus.tar.gz");
        fs::write(&bogus, b"definitely not gzip").expect("write");

        let err = unpack(&bogus, &root.join("dest")).expect_err("garbage");
        assert!(matches!(err, SampleGraphError::Archive(_)));

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn packing_a_missing_dir_fails() {
        let root = temp_dir();
        let err = pack(&root.join("absent"), &root.join("x.tar.gz")).expect_err("missing");
        assert!(matches!(err, SampleGraphError::Archive(_)));
    }
}
