//! Lazy object listing over ListObjectsV2 pagination
//!
//! Pages are fetched on demand as the consumer polls the stream, so
//! dropping the stream early never pays for the rest of the listing. Each
//! call starts a fresh enumeration - there is no persistent cursor, and
//! nothing is cached between calls.

use super::ObjectStoreClient;
use crate::error::{Result, StoreError};
use crate::signer::SignerV4;
use crate::types::{ListEntry, ListPage, ObjectDescriptor};
use bytes::Bytes;
use futures::stream::Stream;
use hyper::Method;
use quick_xml::events::Event;
use quick_xml::Reader;
use std::collections::{BTreeMap, VecDeque};
use tokio_util::sync::CancellationToken;

/// Page size requested from the server
const PAGE_SIZE: u32 = 1000;

struct ListState {
    token: Option<String>,
    buffered: VecDeque<ListEntry>,
    started: bool,
}

impl ObjectStoreClient {
    /// Enumerate keys under `prefix` as a lazy stream.
    ///
    /// With `recursive` false, enumeration stops at the next `/` after the
    /// prefix and yields [`ListEntry::CommonPrefix`] directory markers in
    /// place of the subtree. Objects below a common prefix are never
    /// yielded individually in that mode.
    pub fn list_objects<'a>(
        &'a self,
        bucket: &'a str,
        prefix: Option<&'a str>,
        recursive: bool,
        cancel: &'a CancellationToken,
    ) -> impl Stream<Item = Result<ListEntry>> + 'a {
        let delimiter = if recursive { None } else { Some("/") };
        let state = ListState {
            token: None,
            buffered: VecDeque::new(),
            started: false,
        };

        futures::stream::try_unfold(state, move |mut st| async move {
            loop {
                if let Some(entry) = st.buffered.pop_front() {
                    return Ok(Some((entry, st)));
                }
                if st.started && st.token.is_none() {
                    return Ok(None);
                }

                let page = self
                    .fetch_page(bucket, prefix, delimiter, st.token.as_deref(), cancel)
                    .await?;
                st.started = true;
                // A truncated page without a token would loop forever;
                // treat it as the end.
                st.token = if page.is_truncated {
                    page.next_continuation_token
                } else {
                    None
                };
                st.buffered
                    .extend(page.objects.into_iter().map(ListEntry::Object));
                st.buffered
                    .extend(page.common_prefixes.into_iter().map(ListEntry::CommonPrefix));
            }
        })
    }

    /// Fetch one ListObjectsV2 page
    async fn fetch_page(
        &self,
        bucket: &str,
        prefix: Option<&str>,
        delimiter: Option<&str>,
        continuation_token: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<ListPage> {
        let url = self.build_list_url(bucket, prefix, delimiter, continuation_token);

        let (status, _, body_bytes) = self
            .request_with_retry(Method::GET, &url, BTreeMap::new(), Bytes::new(), false, cancel)
            .await?;

        if !status.is_success() {
            return Err(StoreError::from_response(status, &body_bytes));
        }

        let page = parse_list_page(&body_bytes)?;
        tracing::debug!(
            bucket,
            objects = page.objects.len(),
            prefixes = page.common_prefixes.len(),
            truncated = page.is_truncated,
            "fetched listing page"
        );
        Ok(page)
    }

    /// ListObjectsV2 URL. Parameters stay in alphabetical order
    /// (continuation-token, delimiter, list-type, max-keys, prefix) so the
    /// signer's canonical query fast path skips re-sorting.
    pub(crate) fn build_list_url(
        &self,
        bucket: &str,
        prefix: Option<&str>,
        delimiter: Option<&str>,
        continuation_token: Option<&str>,
    ) -> String {
        let base_url = self.endpoint_bucket_url(bucket);
        let mut url = String::with_capacity(base_url.len() + 256);
        url.push_str(&base_url);
        url.push_str("/?");

        if let Some(token) = continuation_token {
            url.push_str("continuation-token=");
            url.push_str(&SignerV4::uri_encode(token, true));
            url.push('&');
        }
        if let Some(d) = delimiter {
            url.push_str("delimiter=");
            url.push_str(&SignerV4::uri_encode(d, true));
            url.push('&');
        }
        url.push_str("list-type=2&max-keys=");
        url.push_str(&PAGE_SIZE.to_string());
        if let Some(p) = prefix {
            url.push_str("&prefix=");
            url.push_str(&SignerV4::uri_encode(p, true));
        }

        url
    }
}

/// Parse a ListObjectsV2 response document.
///
/// Byte-slice tag matching, no String allocation per tag.
fn parse_list_page(xml_data: &[u8]) -> Result<ListPage> {
    let mut reader = Reader::from_reader(xml_data);
    reader.config_mut().trim_text_start = true;
    reader.config_mut().trim_text_end = true;

    let mut page = ListPage::default();
    let mut current_object: Option<ObjectDescriptor> = None;
    let mut current_text = String::with_capacity(256);
    let mut in_common_prefixes = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"Contents" => {
                    current_object = Some(ObjectDescriptor::new(String::new(), 0));
                }
                b"CommonPrefixes" => {
                    in_common_prefixes = true;
                }
                _ => {}
            },
            Ok(Event::Text(e)) => {
                current_text.clear();
                current_text.push_str(&e.unescape()?);
            }
            Ok(Event::End(e)) => {
                match e.local_name().as_ref() {
                    b"Key" => {
                        if let Some(ref mut obj) = current_object {
                            obj.key = std::mem::take(&mut current_text);
                        }
                    }
                    b"Size" => {
                        if let Some(ref mut obj) = current_object {
                            obj.size = current_text.parse().unwrap_or(0);
                        }
                    }
                    b"LastModified" => {
                        if let Some(ref mut obj) = current_object {
                            obj.last_modified = Some(std::mem::take(&mut current_text));
                        }
                    }
                    b"ETag" => {
                        if let Some(ref mut obj) = current_object {
                            obj.etag = Some(std::mem::take(&mut current_text));
                        }
                    }
                    b"StorageClass" => {
                        if let Some(ref mut obj) = current_object {
                            obj.storage_class = Some(std::mem::take(&mut current_text));
                        }
                    }
                    b"Contents" => {
                        if let Some(obj) = current_object.take() {
                            page.objects.push(obj);
                        }
                    }
                    b"CommonPrefixes" => {
                        in_common_prefixes = false;
                    }
                    b"Prefix" => {
                        // Top-level <Prefix> echoes the request; only the
                        // nested form is a directory marker
                        if in_common_prefixes {
                            page.common_prefixes.push(std::mem::take(&mut current_text));
                        }
                    }
                    b"IsTruncated" => {
                        page.is_truncated = current_text == "true";
                    }
                    b"NextContinuationToken" => {
                        page.next_continuation_token = Some(std::mem::take(&mut current_text));
                    }
                    _ => {}
                }
                current_text.clear();
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(StoreError::XmlParse(e.to_string())),
            _ => {}
        }
    }

    Ok(page)
}
