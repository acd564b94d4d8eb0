//! Error taxonomy for object-store operations
//!
//! Every server-reported failure is translated into one of these variants
//! before it reaches the caller. Conditions that are "already in the desired
//! state" for idempotent operations (bucket already exists, key already gone)
//! are absorbed by the client and never surface here.

use hyper::StatusCode;
use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;

/// Object-store client errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// Transport-level failure (connect, reset, timeout). Potentially
    /// transient; idempotent operations retry these before surfacing.
    #[error("connectivity error: {0}")]
    Connectivity(String),

    /// Authentication or authorization rejection. Never retried.
    #[error("permission denied: {0}")]
    Permission(String),

    /// Referenced bucket or object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Naming collision (bucket owned by another identity).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Bucket deletion blocked because it still contains objects.
    #[error("bucket not empty: {0}")]
    NotEmpty(String),

    /// Declared upload size disagrees with the bytes actually read.
    #[error("size mismatch: declared {declared} bytes, read {actual}")]
    SizeMismatch { declared: u64, actual: u64 },

    /// Caller-supplied parameter outside the allowed range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The caller's cancellation token fired mid-operation.
    #[error("operation cancelled")]
    Cancelled,

    /// Malformed XML in a server response.
    #[error("xml parse error: {0}")]
    XmlParse(String),

    /// Server response that maps to no variant above.
    #[error("unexpected server response: {status} {code}: {message}")]
    Unexpected {
        status: StatusCode,
        code: String,
        message: String,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl From<quick_xml::Error> for StoreError {
    fn from(err: quick_xml::Error) -> Self {
        StoreError::XmlParse(err.to_string())
    }
}

impl StoreError {
    /// Translate a non-2xx server response into the taxonomy.
    ///
    /// The S3 error code from the XML body takes precedence over the HTTP
    /// status: MinIO and AWS disagree on status codes for a few conditions
    /// but both emit the same `<Code>` strings.
    pub(crate) fn from_response(status: StatusCode, body: &[u8]) -> StoreError {
        let (code, message) = parse_error_body(body);
        let detail = if message.is_empty() {
            code.clone()
        } else {
            format!("{}: {}", code, message)
        };

        match code.as_str() {
            "NoSuchBucket" | "NoSuchKey" | "NoSuchUpload" => {
                return StoreError::NotFound(detail)
            }
            "BucketNotEmpty" => return StoreError::NotEmpty(detail),
            "BucketAlreadyOwnedByYou" | "BucketAlreadyExists" => {
                return StoreError::Conflict(detail)
            }
            "AccessDenied" | "InvalidAccessKeyId" | "SignatureDoesNotMatch"
            | "ExpiredToken" => return StoreError::Permission(detail),
            _ => {}
        }

        match status.as_u16() {
            404 => StoreError::NotFound(detail),
            401 | 403 => StoreError::Permission(detail),
            409 => StoreError::Conflict(detail),
            _ => StoreError::Unexpected {
                status,
                code,
                message,
            },
        }
    }

    /// Whether this is the "BucketAlreadyOwnedByYou" shape of conflict,
    /// which an idempotent create absorbs as success.
    pub(crate) fn is_owned_bucket_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(msg) if msg.starts_with("BucketAlreadyOwnedByYou"))
    }
}

/// Extract `<Code>` and `<Message>` from an S3 error document.
///
/// Returns empty strings when the body is not a well-formed error response
/// (some proxies return plain text for 5xx).
fn parse_error_body(body: &[u8]) -> (String, String) {
    let mut reader = Reader::from_reader(body);
    reader.config_mut().trim_text_start = true;
    reader.config_mut().trim_text_end = true;

    let mut code = String::new();
    let mut message = String::new();
    let mut current_text = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Text(e)) => {
                current_text.clear();
                if let Ok(text) = e.unescape() {
                    current_text.push_str(&text);
                }
            }
            Ok(Event::End(e)) => {
                match e.local_name().as_ref() {
                    b"Code" => code = std::mem::take(&mut current_text),
                    b"Message" => message = std::mem::take(&mut current_text),
                    _ => {}
                }
                current_text.clear();
            }
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
    }

    (code, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    const NO_SUCH_BUCKET: &[u8] = br#"<?xml version="1.0" encoding="UTF-8"?>
<Error><Code>NoSuchBucket</Code><Message>The specified bucket does not exist</Message>
<BucketName>missing</BucketName></Error>"#;

    #[test]
    fn test_parse_error_body() {
        let (code, message) = parse_error_body(NO_SUCH_BUCKET);
        assert_eq!(code, "NoSuchBucket");
        assert_eq!(message, "The specified bucket does not exist");
    }

    #[test]
    fn test_parse_error_body_non_xml() {
        let (code, message) = parse_error_body(b"upstream gateway timeout");
        assert_eq!(code, "");
        assert_eq!(message, "");
    }

    #[test]
    fn test_code_takes_precedence_over_status() {
        // MinIO reports NoSuchBucket with 404, AWS with 404 too, but a
        // misbehaving gateway may relay it as 400 - the code still wins.
        let err = StoreError::from_response(StatusCode::BAD_REQUEST, NO_SUCH_BUCKET);
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn test_status_fallback() {
        let err = StoreError::from_response(StatusCode::FORBIDDEN, b"");
        assert!(matches!(err, StoreError::Permission(_)));

        let err = StoreError::from_response(StatusCode::CONFLICT, b"");
        assert!(matches!(err, StoreError::Conflict(_)));

        let err = StoreError::from_response(StatusCode::NOT_FOUND, b"");
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn test_bucket_not_empty() {
        let body = br#"<Error><Code>BucketNotEmpty</Code><Message>The bucket you tried to delete is not empty</Message></Error>"#;
        let err = StoreError::from_response(StatusCode::CONFLICT, body);
        assert!(matches!(err, StoreError::NotEmpty(_)));
    }

    #[test]
    fn test_owned_bucket_conflict_detection() {
        let body = br#"<Error><Code>BucketAlreadyOwnedByYou</Code><Message>Your previous request to create the named bucket succeeded</Message></Error>"#;
        let err = StoreError::from_response(StatusCode::CONFLICT, body);
        assert!(err.is_owned_bucket_conflict());

        let body = br#"<Error><Code>BucketAlreadyExists</Code><Message>The requested bucket name is not available</Message></Error>"#;
        let err = StoreError::from_response(StatusCode::CONFLICT, body);
        assert!(!err.is_owned_bucket_conflict());
    }
}
