//! Crop persistence and the session metadata file.
//!
//! Each recording session owns one directory:
//!
//! ```text
//! <output_dir>/<session>/
//!   <session>_metadata.csv
//!   crop/<label>/<timestamp>_<label>_ID<track>_crop.jpg
//! ```
//!
//! where `session` is the recording start formatted `%Y-%m-%d_%H-%M-%S`.
//! The metadata file is append-only: a header row once per session, then one
//! row per crop, never rewritten. Downstream tooling joins rows to crop
//! files by `file_path`, so image and row form one logical unit: the image
//! is written first (atomically, temp file + rename), and a row is appended
//! only once the image is in place. If the row append fails the image is
//! retained and the failure surfaces — an orphaned image beats a metadata
//! row pointing at nothing.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Cursor, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use thiserror::Error;

use crate::extract::{Crop, PixelRect};

/// Column layout of the session metadata file.
pub const METADATA_HEADER: &str =
    "timestamp,label,confidence,track_ID,x_min,y_min,x_max,y_max,file_path";

const SESSION_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";
const FILE_STAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S-%6f";
const ROW_STAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// Persistence failures, split by what survives them.
///
/// `Encode`/`ImageWrite` mean no image exists and no metadata row was
/// written; `MetadataAppend` means the image exists and is retained.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("crop encode failed for {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("crop write failed for {path}: {source}")]
    ImageWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("metadata append failed ({image} retained): {source}")]
    MetadataAppend {
        image: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// One persisted crop: the metadata row contents plus where the image went.
#[derive(Clone, Debug)]
pub struct CropRecord {
    pub timestamp: DateTime<Utc>,
    pub label: String,
    pub confidence: f32,
    pub tracking_id: i64,
    /// Absolute pixel coordinates in the high-resolution frame.
    pub bbox: PixelRect,
    pub image_path: PathBuf,
}

pub struct Recorder {
    session: String,
    session_dir: PathBuf,
    crop_root: PathBuf,
    metadata_path: PathBuf,
    metadata: File,
    labels: Vec<String>,
    jpeg_quality: u8,
}

impl Recorder {
    /// Open a session rooted at `output_dir`, creating the directory tree
    /// and the metadata file with its header.
    pub fn create(
        output_dir: &Path,
        started: DateTime<Utc>,
        labels: Vec<String>,
        jpeg_quality: u8,
    ) -> Result<Self> {
        let session = started.format(SESSION_FORMAT).to_string();
        let session_dir = output_dir.join(&session);
        let crop_root = session_dir.join("crop");
        fs::create_dir_all(&crop_root)
            .with_context(|| format!("failed to create session dir {}", session_dir.display()))?;

        let metadata_path = session_dir.join(format!("{session}_metadata.csv"));
        let mut metadata = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&metadata_path)
            .with_context(|| format!("failed to open {}", metadata_path.display()))?;
        if metadata.metadata()?.len() == 0 {
            writeln!(metadata, "{METADATA_HEADER}")?;
        }

        Ok(Self {
            session,
            session_dir,
            crop_root,
            metadata_path,
            metadata,
            labels,
            jpeg_quality,
        })
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    pub fn metadata_path(&self) -> &Path {
        &self.metadata_path
    }

    /// Resolve a model class index to its configured label name.
    /// Unknown indices get a stable fallback instead of failing the record.
    pub fn label_for(&self, class_index: usize) -> String {
        self.labels
            .get(class_index)
            .cloned()
            .unwrap_or_else(|| format!("class{class_index}"))
    }

    /// Persist one crop: image first (atomic), then its metadata row.
    ///
    /// `timestamp` is the capture time of the tracker batch the detection
    /// came from; together with label and track id it derives the file name,
    /// so replaying the same pair produces the same path.
    pub fn record(
        &mut self,
        timestamp: DateTime<Utc>,
        crop: &Crop,
    ) -> std::result::Result<CropRecord, RecordError> {
        let label = self.label_for(crop.detection.class_index);
        let label_dir = self.crop_root.join(&label);
        fs::create_dir_all(&label_dir).map_err(|source| RecordError::ImageWrite {
            path: label_dir.clone(),
            source,
        })?;

        let file_name = format!(
            "{}_{}_ID{}_crop.jpg",
            timestamp.format(FILE_STAMP_FORMAT),
            label,
            crop.detection.tracking_id
        );
        let image_path = label_dir.join(file_name);

        let mut encoded = Vec::new();
        JpegEncoder::new_with_quality(&mut Cursor::new(&mut encoded), self.jpeg_quality)
            .encode(
                crop.image.as_raw(),
                crop.image.width(),
                crop.image.height(),
                ExtendedColorType::Rgb8,
            )
            .map_err(|source| RecordError::Encode {
                path: image_path.clone(),
                source,
            })?;
        write_atomic(&image_path, &encoded).map_err(|source| RecordError::ImageWrite {
            path: image_path.clone(),
            source,
        })?;

        let record = CropRecord {
            timestamp,
            label,
            confidence: crop.detection.confidence,
            tracking_id: crop.detection.tracking_id,
            bbox: crop.rect,
            image_path: image_path.clone(),
        };
        self.append_row(&record)
            .map_err(|source| RecordError::MetadataAppend {
                image: image_path,
                source,
            })?;
        Ok(record)
    }

    fn append_row(&mut self, record: &CropRecord) -> io::Result<()> {
        writeln!(
            self.metadata,
            "{},{},{},{},{},{},{},{},{}",
            record.timestamp.format(ROW_STAMP_FORMAT),
            record.label,
            record.confidence,
            record.tracking_id,
            record.bbox.x0,
            record.bbox.y0,
            record.bbox.x1,
            record.bbox.y1,
            record.image_path.display()
        )?;
        self.metadata.flush()
    }
}

/// Write `data` so the file is either fully present or absent: write to a
/// sibling temp file, then rename into place.
fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(data)?;
    }
    fs::rename(tmp_path, path)
}
