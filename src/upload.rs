use axum::{
    extract::{multipart::MultipartRejection, Multipart},
    http::StatusCode,
};
use regex::Regex;

use crate::models::Upload;

pub const FIELD_NAME: &str = "image";
const FALLBACK_MEDIA_TYPE: &str = "application/octet-stream";

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("Không có tệp hình ảnh nào được cung cấp.")]
    Missing,
    #[error("Tệp tải lên vượt quá dung lượng cho phép.")]
    TooLarge,
    #[error("Yêu cầu tải lên không hợp lệ: {0}")]
    Malformed(String),
    #[error("Loại tệp không được hỗ trợ: {0}")]
    UnsupportedMediaType(String),
}

/// Pulls the single `image` file part out of the request body.
///
/// Only a part carrying a filename counts as the file; a plain text field
/// named `image` is skipped like any other field. A second `image` file is
/// refused. A body that is not multipart at all is treated as having no file.
pub async fn read_upload(
    multipart: Result<Multipart, MultipartRejection>,
    allowed_media_types: Option<&Regex>,
) -> Result<Upload, UploadError> {
    let mut multipart = multipart.map_err(|rejection| {
        tracing::debug!(%rejection, "request body is not multipart");
        UploadError::Missing
    })?;

    let mut upload = None;
    while let Some(field) = multipart.next_field().await.map_err(read_error)? {
        if field.name() != Some(FIELD_NAME) || field.file_name().is_none() {
            continue;
        }
        if upload.is_some() {
            return Err(UploadError::Malformed(format!(
                "more than one file in field \"{}\"",
                FIELD_NAME
            )));
        }

        let media_type = field
            .content_type()
            .unwrap_or(FALLBACK_MEDIA_TYPE)
            .to_string();

        if let Some(pattern) = allowed_media_types {
            if !pattern.is_match(&media_type) {
                return Err(UploadError::UnsupportedMediaType(media_type));
            }
        }

        let bytes = field.bytes().await.map_err(read_error)?;
        upload = Some(Upload {
            media_type,
            bytes: bytes.to_vec(),
        });
    }

    upload.ok_or(UploadError::Missing)
}

fn read_error(err: axum::extract::multipart::MultipartError) -> UploadError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        UploadError::TooLarge
    } else {
        UploadError::Malformed(err.body_text())
    }
}
