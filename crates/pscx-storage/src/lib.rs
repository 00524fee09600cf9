//! Staging, archiving, publication and retention of extract snapshots for PSCX.

use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDateTime, Timelike};
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};
use uuid::Uuid;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

pub const CRATE_NAME: &str = "pscx-storage";

/// Filename-embedded run timestamp, `yyyyMMddHHmm`.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M";
const TIMESTAMP_DIGITS: usize = 12;

pub const ARCHIVE_EXTENSION: &str = "zip";
pub const TEXT_EXTENSION: &str = "txt";
pub const DIGEST_EXTENSION: &str = "sha256";

const COPY_BUFFER_BYTES: usize = 64 * 1024;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Names of every file produced by one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractNaming {
    extract_name: String,
    started_at: NaiveDateTime,
}

impl ExtractNaming {
    pub fn new(extract_name: impl Into<String>, started_at: NaiveDateTime) -> Self {
        Self {
            extract_name: extract_name.into(),
            started_at,
        }
    }

    pub fn started_at(&self) -> NaiveDateTime {
        self.started_at
    }

    pub fn timestamp(&self) -> String {
        self.started_at.format(TIMESTAMP_FORMAT).to_string()
    }

    pub fn stem(&self) -> String {
        format!("{}_{}", self.extract_name, self.timestamp())
    }

    pub fn archive_name(&self) -> String {
        format!("{}.{ARCHIVE_EXTENSION}", self.stem())
    }

    pub fn text_entry_name(&self) -> String {
        format!("{}.{TEXT_EXTENSION}", self.stem())
    }

    pub fn digest_entry_name(&self) -> String {
        format!("{}.{DIGEST_EXTENSION}", self.stem())
    }
}

/// Last 12-digit window of `name`, read as `yyyyMMddHHmm`.
pub fn parse_filename_timestamp(name: &str) -> Option<NaiveDateTime> {
    let bytes = name.as_bytes();
    if bytes.len() < TIMESTAMP_DIGITS {
        return None;
    }
    let start = (0..=bytes.len() - TIMESTAMP_DIGITS)
        .rev()
        .find(|&start| {
            bytes[start..start + TIMESTAMP_DIGITS]
                .iter()
                .all(u8::is_ascii_digit)
        })?;
    NaiveDateTime::parse_from_str(&name[start..start + TIMESTAMP_DIGITS], TIMESTAMP_FORMAT).ok()
}

/// Deletion failures are recorded in the report, never raised.
fn delete_listed(kept: Option<String>, doomed: Vec<ExtractListing>) -> CleanupReport {
    let mut report = CleanupReport {
        kept,
        ..Default::default()
    };
    for entry in doomed {
        match fs::remove_file(&entry.path) {
            Ok(()) => {
                info!(file = %entry.file_name, "file deleted");
                report.deleted.push(entry.file_name);
            }
            Err(err) => {
                error!(file = %entry.file_name, %err, "file could not be deleted");
                report.failed.push(entry.file_name);
            }
        }
    }
    report
}

fn is_in_progress(file_name: &str) -> bool {
    file_name.starts_with('.')
}

fn remove_staged(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => info!(path = %path.display(), "staging file deleted"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), %err, "staging file not deleted"),
    }
}

/// Text table being written for the current run.
///
/// The file is removed on drop unless handed over through [`StagingFile::finish`].
#[derive(Debug)]
pub struct StagingFile {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    rows: u64,
}

impl StagingFile {
    /// Create a fresh staging file in `dir` and write the table header.
    pub fn create(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("creating working directory {}", dir.display()))?;
        let path = dir.join(format!(".{}.staging", Uuid::new_v4()));
        let file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("opening staging file {}", path.display()))?;

        let mut staging = Self {
            path,
            writer: Some(BufWriter::new(file)),
            rows: 0,
        };
        staging.write_raw(&pscx_core::header_line())?;
        info!(path = %staging.path.display(), "staging file initialized, header written");
        Ok(staging)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn write_row(&mut self, row: &str) -> Result<()> {
        self.write_raw(row)?;
        self.rows += 1;
        Ok(())
    }

    fn write_raw(&mut self, text: &str) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .context("staging file already closed")?;
        writer
            .write_all(text.as_bytes())
            .with_context(|| format!("writing staging file {}", self.path.display()))
    }

    /// Flush and close; the returned handle owns the file from here on.
    pub fn finish(mut self) -> Result<StagedExtract> {
        let mut writer = self
            .writer
            .take()
            .context("staging file already closed")?;
        writer
            .flush()
            .with_context(|| format!("flushing staging file {}", self.path.display()))?;
        drop(writer);

        Ok(StagedExtract {
            path: std::mem::take(&mut self.path),
            rows: self.rows,
        })
    }
}

impl Drop for StagingFile {
    fn drop(&mut self) {
        if self.path.as_os_str().is_empty() {
            return;
        }
        self.writer.take();
        remove_staged(&self.path);
    }
}

/// Closed staging file ready to be archived. Removed on drop.
#[derive(Debug)]
pub struct StagedExtract {
    path: PathBuf,
    rows: u64,
}

impl StagedExtract {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }
}

impl Drop for StagedExtract {
    fn drop(&mut self) {
        remove_staged(&self.path);
    }
}

/// Archive written in the working directory, not yet published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltArchive {
    pub path: PathBuf,
    pub archive_name: String,
    pub sha256: String,
    pub rows: u64,
    pub text_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedExtract {
    pub path: PathBuf,
    pub archive_name: String,
    pub sha256: String,
    pub rows: u64,
    pub text_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ArchiveWriter {
    working_dir: PathBuf,
}

impl ArchiveWriter {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
        }
    }

    /// Zip the staged table and its SHA-256 digest in one read pass.
    ///
    /// The staging file is consumed and deleted whatever the outcome.
    pub fn write(&self, staged: StagedExtract, naming: &ExtractNaming) -> Result<BuiltArchive> {
        let archive_name = naming.archive_name();
        let temp_path = self
            .working_dir
            .join(format!(".{archive_name}.{}.tmp", Uuid::new_v4()));

        match self.write_archive(&staged, naming, &temp_path) {
            Ok((sha256, text_bytes)) => {
                let rows = staged.rows();
                drop(staged);
                Ok(BuiltArchive {
                    path: temp_path,
                    archive_name,
                    sha256,
                    rows,
                    text_bytes,
                })
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path);
                Err(err)
            }
        }
    }

    fn write_archive(
        &self,
        staged: &StagedExtract,
        naming: &ExtractNaming,
        temp_path: &Path,
    ) -> Result<(String, u64)> {
        let file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(temp_path)
            .with_context(|| format!("opening temp archive {}", temp_path.display()))?;
        let mut zip = ZipWriter::new(BufWriter::new(file));

        let started_at = naming.started_at();
        let modified = zip::DateTime::from_date_and_time(
            u16::try_from(started_at.year()).unwrap_or_default(),
            started_at.month() as u8,
            started_at.day() as u8,
            started_at.hour() as u8,
            started_at.minute() as u8,
            started_at.second() as u8,
        )
        .unwrap_or_default();

        info!(archive = %temp_path.display(), "zipping up the extract file");
        zip.start_file(naming.text_entry_name(), text_entry_options(modified))
            .context("starting text entry")?;

        let mut source = File::open(staged.path())
            .with_context(|| format!("reopening staging file {}", staged.path().display()))?;
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; COPY_BUFFER_BYTES];
        let mut text_bytes = 0u64;
        loop {
            let read = source
                .read(&mut buffer)
                .with_context(|| format!("reading staging file {}", staged.path().display()))?;
            if read == 0 {
                break;
            }
            zip.write_all(&buffer[..read]).context("writing text entry")?;
            hasher.update(&buffer[..read]);
            text_bytes += read as u64;
        }

        let sha256 = hex::encode(hasher.finalize());
        zip.start_file(naming.digest_entry_name(), digest_entry_options(modified))
            .context("starting digest entry")?;
        zip.write_all(sha256.as_bytes())
            .context("writing digest entry")?;

        let mut inner = zip.finish().context("finalizing archive")?;
        inner
            .flush()
            .with_context(|| format!("flushing temp archive {}", temp_path.display()))?;
        inner
            .get_ref()
            .sync_all()
            .with_context(|| format!("syncing temp archive {}", temp_path.display()))?;

        Ok((sha256, text_bytes))
    }
}

fn digest_entry_options(modified: zip::DateTime) -> SimpleFileOptions {
    SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(modified)
}

/// The table size is only known once written, so the entry is always zip64.
fn text_entry_options(modified: zip::DateTime) -> SimpleFileOptions {
    digest_entry_options(modified).large_file(true)
}

/// One entry of the published output directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractListing {
    pub path: PathBuf,
    pub file_name: String,
    /// Parsed from the file name; the Unix epoch when none is embedded.
    pub timestamp: NaiveDateTime,
    pub is_dir: bool,
    pub size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub kept: Option<String>,
    pub deleted: Vec<String>,
    pub failed: Vec<String>,
}

/// Published output directory.
#[derive(Debug, Clone)]
pub struct ExtractStore {
    root: PathBuf,
}

impl ExtractStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Atomically install a built archive under its final name.
    pub fn publish(&self, archive: BuiltArchive) -> Result<PublishedExtract> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("creating files directory {}", self.root.display()))?;
        let final_path = self.root.join(&archive.archive_name);

        if let Err(rename_err) = fs::rename(&archive.path, &final_path) {
            warn!(
                from = %archive.path.display(),
                to = %final_path.display(),
                %rename_err,
                "direct rename failed, copying into files directory"
            );
            let temp_path = self
                .root
                .join(format!(".{}.{}.tmp", archive.archive_name, Uuid::new_v4()));
            let copied = fs::copy(&archive.path, &temp_path)
                .map(|_| ())
                .and_then(|()| fs::rename(&temp_path, &final_path));
            if let Err(err) = copied {
                let _ = fs::remove_file(&temp_path);
                let _ = fs::remove_file(&archive.path);
                return Err(err).with_context(|| {
                    format!(
                        "publishing archive {} -> {}",
                        archive.path.display(),
                        final_path.display()
                    )
                });
            }
            let _ = fs::remove_file(&archive.path);
        }

        info!(
            from = %archive.path.display(),
            to = %final_path.display(),
            "archive published"
        );
        Ok(PublishedExtract {
            path: final_path,
            archive_name: archive.archive_name,
            sha256: archive.sha256,
            rows: archive.rows,
            text_bytes: archive.text_bytes,
        })
    }

    /// Visible entries of the output directory; in-progress temporaries are skipped.
    pub fn list(&self) -> Result<Vec<ExtractListing>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", self.root.display()))
            }
        };

        let mut out = Vec::new();
        for entry in entries {
            let entry = entry.with_context(|| format!("reading {}", self.root.display()))?;
            let file_name = entry.file_name().to_string_lossy().to_string();
            if is_in_progress(&file_name) {
                continue;
            }
            let metadata = entry
                .metadata()
                .with_context(|| format!("reading metadata of {}", entry.path().display()))?;
            out.push(ExtractListing {
                path: entry.path(),
                timestamp: parse_filename_timestamp(&file_name).unwrap_or_default(),
                file_name,
                is_dir: metadata.is_dir(),
                size: metadata.len(),
            });
        }
        out.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.file_name.cmp(&b.file_name))
        });
        Ok(out)
    }

    pub fn files(&self) -> Result<Vec<ExtractListing>> {
        Ok(self.list()?.into_iter().filter(|e| !e.is_dir).collect())
    }

    /// Newest file named after `extract_name`, the pinned test artifact excluded.
    pub fn latest_extract(
        &self,
        extract_name: &str,
        pinned_name: &str,
    ) -> Result<Option<ExtractListing>> {
        Ok(self
            .files()?
            .into_iter()
            .filter(|e| e.file_name.starts_with(extract_name))
            .filter(|e| pinned_name.is_empty() || !e.file_name.contains(pinned_name))
            .last())
    }

    pub fn pinned_artifact(&self, pinned_name: &str) -> Option<PathBuf> {
        if pinned_name.is_empty() {
            return None;
        }
        let path = self.root.join(pinned_name);
        path.is_file().then_some(path)
    }

    /// Delete every file but the newest one and the pinned test artifact.
    pub fn cleanup(&self, pinned_name: &str) -> Result<CleanupReport> {
        self.cleanup_protecting(pinned_name, None)
    }

    /// Like [`Self::cleanup`], but `protected` survives even when it is not the newest.
    pub fn cleanup_protecting(
        &self,
        pinned_name: &str,
        protected: Option<&str>,
    ) -> Result<CleanupReport> {
        info!(dir = %self.root.display(), "cleaning files repository, keeping latest file and demo");
        let mut candidates = self
            .files()?
            .into_iter()
            .filter(|e| pinned_name.is_empty() || !e.file_name.contains(pinned_name))
            .collect::<Vec<_>>();

        let kept = candidates.pop().map(|e| e.file_name);
        candidates.retain(|e| Some(e.file_name.as_str()) != protected);
        Ok(delete_listed(kept, candidates))
    }

    /// Remove everything in the output directory. Returns the number of entries removed.
    pub fn clean_all(&self) -> Result<usize> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", self.root.display()))
            }
        };
        let mut removed = 0;
        for entry in entries {
            let entry = entry.with_context(|| format!("reading {}", self.root.display()))?;
            let path = entry.path();
            let is_dir = entry
                .file_type()
                .with_context(|| format!("reading file type of {}", path.display()))?
                .is_dir();
            let removal = if is_dir {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            removal.with_context(|| format!("removing {}", path.display()))?;
            removed += 1;
        }
        info!(dir = %self.root.display(), removed, "all files deleted");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::tempdir;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    fn read_entry(path: &Path, name: &str) -> Vec<u8> {
        let mut archive = zip::ZipArchive::new(File::open(path).unwrap()).unwrap();
        let mut entry = archive.by_name(name).unwrap();
        let mut out = Vec::new();
        entry.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn artifact_hashing_is_stable() {
        let hash = sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn digest_keeps_leading_zeros() {
        // sha256("a") contains bytes below 0x10.
        let hash = sha256_hex(b"a");
        assert_eq!(
            hash,
            "ca978112ca1bbdcafac231b39a23dc4da786eff8147c4e72b9807785afee48bb"
        );
        assert_eq!(sha256_hex(b"").len(), 64);
    }

    #[test]
    fn naming_embeds_run_timestamp() {
        let naming = ExtractNaming::new("Extraction_PSC", at(2024, 3, 7, 9, 5));
        assert_eq!(naming.timestamp(), "202403070905");
        assert_eq!(naming.archive_name(), "Extraction_PSC_202403070905.zip");
        assert_eq!(naming.text_entry_name(), "Extraction_PSC_202403070905.txt");
        assert_eq!(naming.digest_entry_name(), "Extraction_PSC_202403070905.sha256");
    }

    #[test]
    fn filename_timestamps_parse_or_fall_back() {
        assert_eq!(
            parse_filename_timestamp("Extraction_PSC_202403070905.zip"),
            Some(at(2024, 3, 7, 9, 5))
        );
        assert_eq!(
            parse_filename_timestamp("x_202403071730.zip"),
            Some(at(2024, 3, 7, 17, 30))
        );
        assert_eq!(parse_filename_timestamp("demo.zip"), None);
        assert_eq!(parse_filename_timestamp("x_202413991299.zip"), None);
        assert_eq!(
            parse_filename_timestamp("demo.zip").unwrap_or_default(),
            NaiveDateTime::default()
        );
    }

    #[test]
    fn staging_file_is_removed_when_abandoned() {
        let dir = tempdir().expect("tempdir");
        let path = {
            let mut staging = StagingFile::create(dir.path()).expect("staging");
            staging.write_row("a|\n").expect("row");
            staging.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn archive_contains_text_and_matching_digest() {
        let work = tempdir().expect("work");
        let files = tempdir().expect("files");
        let naming = ExtractNaming::new("Extraction_PSC", at(2024, 3, 7, 9, 5));

        let mut staging = StagingFile::create(work.path()).expect("staging");
        staging.write_row("8|1|81|DUPONT|''|\n").expect("row");
        staging.write_row("8|2|82|MARTIN|''|\n").expect("row");
        let staged = staging.finish().expect("finish");
        let staged_path = staged.path().to_path_buf();

        let built = ArchiveWriter::new(work.path())
            .write(staged, &naming)
            .expect("archive");
        assert!(!staged_path.exists());
        assert_eq!(built.rows, 2);

        let published = ExtractStore::new(files.path())
            .publish(built)
            .expect("publish");
        assert_eq!(
            published.path,
            files.path().join("Extraction_PSC_202403070905.zip")
        );

        let text = read_entry(&published.path, "Extraction_PSC_202403070905.txt");
        let digest = read_entry(&published.path, "Extraction_PSC_202403070905.sha256");
        let text_str = String::from_utf8(text.clone()).expect("utf8");
        assert!(text_str.starts_with(&pscx_core::header_line()));
        assert!(text_str.ends_with("8|2|82|MARTIN|''|\n"));
        assert_eq!(text.len() as u64, published.text_bytes);
        assert_eq!(String::from_utf8(digest).unwrap(), sha256_hex(&text));
        assert_eq!(published.sha256, sha256_hex(&text));

        let leftovers = fs::read_dir(work.path()).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn cleanup_keeps_newest_and_pinned() {
        let dir = tempdir().expect("tempdir");
        for name in [
            "Extraction_PSC_202401010000.zip",
            "Extraction_PSC_202402010000.zip",
            "Extraction_PSC_202403010000.zip",
            "Extraction_PSC_test.zip",
            "notes.txt",
        ] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }
        fs::create_dir(dir.path().join("archive_190001010000")).unwrap();
        fs::write(dir.path().join(".Extraction_PSC_202404010000.zip.tmp"), b"x").unwrap();

        let store = ExtractStore::new(dir.path());
        let report = store.cleanup("Extraction_PSC_test").expect("cleanup");
        assert_eq!(report.kept.as_deref(), Some("Extraction_PSC_202403010000.zip"));
        assert_eq!(report.deleted.len(), 3);
        assert!(report.failed.is_empty());

        let mut remaining = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect::<Vec<_>>();
        remaining.sort();
        assert_eq!(
            remaining,
            vec![
                ".Extraction_PSC_202404010000.zip.tmp",
                "Extraction_PSC_202403010000.zip",
                "Extraction_PSC_test.zip",
                "archive_190001010000",
            ]
        );
    }

    #[test]
    fn text_entry_is_written_as_zip64() {
        let work = tempdir().expect("work");
        let naming = ExtractNaming::new("Extraction_PSC", at(2024, 3, 7, 9, 5));
        let mut staging = StagingFile::create(work.path()).expect("staging");
        staging.write_row("8|1|81|DUPONT|''|\n").expect("row");
        let built = ArchiveWriter::new(work.path())
            .write(staging.finish().expect("finish"), &naming)
            .expect("archive");

        let bytes = fs::read(&built.path).unwrap();
        assert_eq!(&bytes[..4], b"PK\x03\x04");
        let name_len = u16::from_le_bytes([bytes[26], bytes[27]]) as usize;
        let extra_len = u16::from_le_bytes([bytes[28], bytes[29]]) as usize;
        assert_eq!(&bytes[30..30 + name_len], b"Extraction_PSC_202403070905.txt");

        let mut extra = &bytes[30 + name_len..30 + name_len + extra_len];
        let mut has_zip64 = false;
        while extra.len() >= 4 {
            let tag = u16::from_le_bytes([extra[0], extra[1]]);
            let size = u16::from_le_bytes([extra[2], extra[3]]) as usize;
            has_zip64 |= tag == 0x0001;
            extra = &extra[(4 + size).min(extra.len())..];
        }
        assert!(has_zip64, "text entry has no zip64 extra field");

        let text = read_entry(&built.path, "Extraction_PSC_202403070905.txt");
        assert!(String::from_utf8(text).unwrap().ends_with("DUPONT|''|\n"));
        fs::remove_file(&built.path).unwrap();
    }

    #[test]
    #[ignore = "writes more than 4 GiB to the temp dir"]
    fn archive_accepts_tables_beyond_four_gib() {
        let work = tempdir().expect("work");
        let naming = ExtractNaming::new("Extraction_PSC", at(2024, 3, 7, 9, 5));
        let mut staging = StagingFile::create(work.path()).expect("staging");
        let row = format!("{}\n", "x".repeat(1023));
        for _ in 0..(4 * 1024 * 1024 + 1024) {
            staging.write_row(&row).expect("row");
        }
        let built = ArchiveWriter::new(work.path())
            .write(staging.finish().expect("finish"), &naming)
            .expect("archive");
        assert!(built.text_bytes > u64::from(u32::MAX));
    }

    #[test]
    fn deletion_failures_are_reported_not_raised() {
        let dir = tempdir().expect("tempdir");
        let old = dir.path().join("Extraction_PSC_202401010000.zip");
        fs::write(&old, b"x").unwrap();
        let stuck = dir.path().join("Extraction_PSC_202402010000.zip");
        fs::create_dir(&stuck).unwrap();
        fs::write(stuck.join("inner"), b"x").unwrap();

        let listing = |path: &Path, is_dir| ExtractListing {
            path: path.to_path_buf(),
            file_name: path.file_name().unwrap().to_string_lossy().to_string(),
            timestamp: parse_filename_timestamp(&path.to_string_lossy()).unwrap_or_default(),
            is_dir,
            size: 0,
        };
        let report = delete_listed(
            Some("Extraction_PSC_202403010000.zip".into()),
            vec![listing(&stuck, true), listing(&old, false)],
        );

        assert_eq!(report.deleted, vec!["Extraction_PSC_202401010000.zip"]);
        assert_eq!(report.failed, vec!["Extraction_PSC_202402010000.zip"]);
        assert!(!old.exists());
        assert!(stuck.join("inner").exists());
    }

    #[test]
    fn cleanup_never_deletes_the_protected_extract() {
        let dir = tempdir().expect("tempdir");
        for name in [
            "Extraction_PSC_202401010000.zip",
            "Extraction_PSC_202402010000.zip",
            "Extraction_PSC_202403010000.zip",
        ] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }
        let store = ExtractStore::new(dir.path());
        let report = store
            .cleanup_protecting("Extraction_PSC_test", Some("Extraction_PSC_202402010000.zip"))
            .expect("cleanup");
        assert_eq!(report.kept.as_deref(), Some("Extraction_PSC_202403010000.zip"));
        assert_eq!(report.deleted, vec!["Extraction_PSC_202401010000.zip"]);
        assert!(dir.path().join("Extraction_PSC_202402010000.zip").exists());
    }

    #[test]
    fn latest_extract_ignores_pinned_and_foreign_files() {
        let dir = tempdir().expect("tempdir");
        for name in [
            "Extraction_PSC_202401010000.zip",
            "Extraction_PSC_202402010000.zip",
            "Extraction_PSC_test.zip",
            "other_202412310000.zip",
        ] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }
        let store = ExtractStore::new(dir.path());
        let latest = store
            .latest_extract("Extraction_PSC", "Extraction_PSC_test")
            .unwrap()
            .expect("latest");
        assert_eq!(latest.file_name, "Extraction_PSC_202402010000.zip");
        assert!(store.pinned_artifact("Extraction_PSC_test.zip").is_some());
        assert!(store.pinned_artifact("missing.zip").is_none());
    }

    #[test]
    fn listing_a_missing_directory_is_empty() {
        let dir = tempdir().expect("tempdir");
        let store = ExtractStore::new(dir.path().join("nope"));
        assert!(store.list().unwrap().is_empty());
        assert!(store.latest_extract("x", "").unwrap().is_none());
        assert_eq!(store.clean_all().unwrap(), 0);
    }

    #[test]
    fn clean_all_empties_the_directory() {
        let dir = tempdir().expect("tempdir");
        fs::write(dir.path().join("a.zip"), b"x").unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("nested/b.zip"), b"x").unwrap();
        let store = ExtractStore::new(dir.path());
        assert_eq!(store.clean_all().unwrap(), 2);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
