//! HTTP download of raw files published by the instrument server.

use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use regex::Regex;
use tokio::{fs, io::AsyncWriteExt};
use tracing::{info, instrument, warn};

use crate::error::InstrumentClientError;

/// Used when the URL does not end in a usable file name.
pub const FALLBACK_FILE_NAME: &str = "last_acquisition.raw";

/// File name for the last path segment of `url`, with query and fragment
/// removed and anything but letters, digits, `.`, `-` and `_` replaced by `_`.
#[must_use]
pub fn file_name_from_url(url: &str) -> String {
    let without_query = url.split(['?', '#']).next().unwrap_or_default();
    let segment = without_query.rsplit('/').next().unwrap_or_default().trim();
    let sanitized = Regex::new(r"[^A-Za-z\d_.\-]").map_or_else(
        |_| segment.replace(' ', "_"),
        |re| re.replace_all(segment, "_").into_owned(),
    );
    if sanitized.trim_matches('.').is_empty() {
        FALLBACK_FILE_NAME.to_string()
    } else {
        sanitized
    }
}

/// Stream `url` into `dest_dir`, creating the directory if needed.
///
/// A response with an error status is logged and gives `Ok(None)`.
///
/// # Errors
/// - [`InstrumentClientError::Download`] if the request or the body stream fails
/// - [`InstrumentClientError::IOError`] if the file cannot be written
#[instrument(skip(dest_dir))]
pub async fn download(
    url: &str,
    dest_dir: &Path,
) -> Result<Option<PathBuf>, InstrumentClientError> {
    let response = reqwest::get(url).await?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        warn!("Download failed: status code {status}\n{body}");
        return Ok(None);
    }

    fs::create_dir_all(dest_dir).await?;
    let path = dest_dir.join(file_name_from_url(url));
    info!("Saving to {}", path.display());

    let file = fs::File::create(&path).await?;
    if let Err(e) = write_body(file, response).await {
        warn!("Download of {url} failed, removing {}", path.display());
        if let Err(remove) = fs::remove_file(&path).await {
            warn!("Unable to remove partial file {}: {remove}", path.display());
        }
        return Err(e);
    }
    Ok(Some(path))
}

async fn write_body(
    mut file: fs::File,
    response: reqwest::Response,
) -> Result<(), InstrumentClientError> {
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        file.write_all(&chunk?).await?;
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok(())
}
