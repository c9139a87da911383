pub mod archive;
pub mod download;
pub mod hash;
pub mod package;

pub use archive::{extract_archive, ArchiveError, ExtractedArchive};
pub use download::{
    payload_file_name, sanitize_component, DownloadError, DownloadedPayload, Downloader,
    HttpDownloader,
};
pub use hash::sha256_file;
pub use package::{parse_size_string, verify_payload, PackageKind, VerifyError};
