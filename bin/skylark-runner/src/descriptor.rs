//! Job descriptors handed over by the front end.
//!
//! A descriptor is one base64 line (standard or URL-safe alphabet, padding
//! optional) that decodes to newline-separated fields. Field 0 is the job
//! kind, the rest are positional arguments of that kind.

use std::str::FromStr;

use base64::Engine;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use skylark_core::JobKind;
use thiserror::Error;

const LENIENT: GeneralPurposeConfig =
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent);
const STANDARD: GeneralPurpose = GeneralPurpose::new(&alphabet::STANDARD, LENIENT);
const URL_SAFE: GeneralPurpose = GeneralPurpose::new(&alphabet::URL_SAFE, LENIENT);

/// Separator of multi-value fields.
const LIST_SEPARATOR: char = '\t';

#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("descriptor is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("descriptor is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("empty descriptor")]
    Empty,

    #[error("unrecognized job kind {0:?}")]
    UnknownKind(String),

    #[error("{kind} descriptor is missing field {index} ({name})")]
    MissingField {
        kind: JobKind,
        index: usize,
        name: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchMergeArgs {
    pub path: String,
    pub delete_sources: bool,
    pub video_pattern: String,
    pub audio_patterns: Vec<String>,
    pub output_patterns: Vec<String>,
}

/// One decoded job request. Every kind except offline download and batch
/// merge refers to a record the front end already created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobDescriptor {
    OfflineDownload { url: String, path: String },
    Compress { id: String },
    Decompress { id: String },
    Convert { id: String },
    CrossAppCopy { id: String },
    FtpUpload { id: String },
    BatchMergeVa(BatchMergeArgs),
}

impl JobDescriptor {
    pub fn kind(&self) -> JobKind {
        match self {
            JobDescriptor::OfflineDownload { .. } => JobKind::OfflineDownload,
            JobDescriptor::Compress { .. } => JobKind::Compress,
            JobDescriptor::Decompress { .. } => JobKind::Decompress,
            JobDescriptor::Convert { .. } => JobKind::Convert,
            JobDescriptor::CrossAppCopy { .. } => JobKind::CrossAppCopy,
            JobDescriptor::FtpUpload { .. } => JobKind::FtpUpload,
            JobDescriptor::BatchMergeVa(_) => JobKind::BatchMergeVa,
        }
    }

    /// Decode an encoded descriptor line.
    pub fn decode(line: &str) -> Result<Self, DescriptorError> {
        let line = line.trim();
        let bytes = if line.contains(['-', '_']) {
            URL_SAFE.decode(line)?
        } else {
            STANDARD.decode(line)?
        };
        Self::parse(&String::from_utf8(bytes)?)
    }

    /// Parse the decoded, newline-separated fields.
    pub fn parse(text: &str) -> Result<Self, DescriptorError> {
        let fields: Vec<&str> = text.split('\n').map(|f| f.trim_end_matches('\r')).collect();
        let tag = fields.first().map(|t| t.trim()).unwrap_or_default();
        if tag.is_empty() {
            return Err(DescriptorError::Empty);
        }
        let kind =
            JobKind::from_str(tag).map_err(|_| DescriptorError::UnknownKind(tag.to_owned()))?;

        let field = |index: usize, name: &'static str| {
            fields
                .get(index)
                .map(|f| (*f).to_owned())
                .ok_or(DescriptorError::MissingField { kind, index, name })
        };

        Ok(match kind {
            JobKind::OfflineDownload => JobDescriptor::OfflineDownload {
                url: field(1, "url")?,
                path: field(2, "path")?,
            },
            JobKind::Compress => JobDescriptor::Compress { id: field(1, "id")? },
            JobKind::Decompress => JobDescriptor::Decompress { id: field(1, "id")? },
            JobKind::Convert => JobDescriptor::Convert { id: field(1, "id")? },
            JobKind::CrossAppCopy => JobDescriptor::CrossAppCopy { id: field(1, "id")? },
            JobKind::FtpUpload => JobDescriptor::FtpUpload { id: field(1, "id")? },
            JobKind::BatchMergeVa => JobDescriptor::BatchMergeVa(BatchMergeArgs {
                path: field(1, "path")?,
                delete_sources: field(2, "deleteSource")?.trim().eq_ignore_ascii_case("true"),
                video_pattern: field(3, "videoPattern")?,
                audio_patterns: split_list(&field(4, "audioPatterns")?),
                output_patterns: split_list(&field(5, "outputPatterns")?),
            }),
        })
    }
}

fn split_list(field: &str) -> Vec<String> {
    field
        .split(LIST_SEPARATOR)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}
