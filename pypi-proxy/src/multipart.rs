//! # Streaming `multipart/form-data` parsing
//!
//! [`MultipartParser`] is a push parser: the request body is fed to it chunk by
//! chunk, in whatever sizes the transport delivers, and it returns the
//! [`Event`]s those bytes complete. Nothing beyond one chunk plus a short
//! carry-over is buffered, so arbitrarily large file fields stream straight
//! through.
//!
//! Bytes that could still turn out to be the start of the next boundary
//! delimiter are held back until the following chunk decides, which makes the
//! concatenated field values independent of how the body was split.
//!
//! [`FormDataReader`] sits on top of the parser and routes events to a
//! [`FormHandler`]. Each handler declares a fixed table mapping field names to
//! a [`Route`]: streamed fields get `begin`/`data`/`end` callbacks, value
//! fields are buffered and delivered whole. Fields missing from the table are
//! buffered and handed to [`FormHandler::unclaimed`].

use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, warn};

/// Header blocks larger than this are treated as malformed.
const MAX_HEADER_SIZE: usize = 16 * 1024;
/// Buffered (non-streamed) field values are truncated beyond this size.
pub const MAX_VALUE_SIZE: usize = 1024 * 1024;

/// Metadata of one form field, taken from its part headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartHeader {
    pub name: String,
    pub filename: Option<String>,
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A field opened; carries the payload bytes already available.
    Begin(PartHeader, Bytes),
    /// More payload for the open field.
    Data(Bytes),
    /// The open field is complete.
    End,
}

#[derive(Debug)]
enum State {
    Preamble,
    AfterBoundary,
    Headers,
    Body { pending: Option<PartHeader> },
    Skip,
    Done,
}

/// Incremental parser for one `multipart/form-data` body.
#[derive(Debug)]
pub struct MultipartParser {
    /// `--` + boundary token
    boundary: Vec<u8>,
    /// CRLF + `--` + boundary token
    delimiter: Vec<u8>,
    buffer: BytesMut,
    state: State,
}

impl MultipartParser {
    pub fn new(boundary: &str) -> Self {
        let boundary = format!("--{boundary}").into_bytes();
        let mut delimiter = b"\r\n".to_vec();
        delimiter.extend_from_slice(&boundary);
        Self {
            boundary,
            delimiter,
            buffer: BytesMut::new(),
            state: State::Preamble,
        }
    }

    /// Build a parser from a request `Content-Type` header value.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::BadRequest`] when the type is not
    /// `multipart/form-data` or carries no boundary.
    pub fn from_content_type(content_type: &str) -> AppResult<Self> {
        let boundary = boundary_from_content_type(content_type)?;
        debug!(boundary = %boundary, "Multipart boundary");
        Ok(Self::new(&boundary))
    }

    /// Whether the closing boundary has been seen.
    pub fn is_complete(&self) -> bool {
        matches!(self.state, State::Done)
    }

    /// Consume one chunk and return the events it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Event> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        loop {
            match &mut self.state {
                State::Preamble => match find(&self.buffer, &self.boundary) {
                    Some(at) => {
                        self.buffer.advance(at + self.boundary.len());
                        self.state = State::AfterBoundary;
                    }
                    None => {
                        let keep = self.boundary.len() - 1;
                        let drop = self.buffer.len().saturating_sub(keep);
                        self.buffer.advance(drop);
                        break;
                    }
                },
                State::AfterBoundary => {
                    if self.buffer.len() < 2 {
                        break;
                    }
                    if self.buffer.starts_with(b"--") {
                        debug!("Closing boundary reached");
                        self.state = State::Done;
                        continue;
                    }
                    match find(&self.buffer, b"\r\n") {
                        Some(at) => {
                            self.buffer.advance(at + 2);
                            self.state = State::Headers;
                        }
                        None if self.buffer.len() > MAX_HEADER_SIZE => {
                            warn!("Boundary line not terminated, skipping field");
                            self.state = State::Skip;
                        }
                        None => break,
                    }
                }
                State::Headers => {
                    if self.buffer.starts_with(b"\r\n") {
                        self.buffer.advance(2);
                        warn!("multipart/form-data field without headers");
                        self.state = State::Skip;
                        continue;
                    }

                    let end_of_headers = find(&self.buffer, b"\r\n\r\n");
                    let next_delimiter = find(&self.buffer, &self.delimiter);
                    match (end_of_headers, next_delimiter) {
                        (eoh, Some(next)) if eoh.map_or(true, |eoh| next < eoh) => {
                            warn!("Field headers not terminated before next boundary, skipping field");
                            self.state = State::Skip;
                        }
                        (Some(eoh), _) => {
                            let block = self.buffer.split_to(eoh);
                            self.buffer.advance(4);
                            match parse_part_headers(&block) {
                                Ok(header) => {
                                    debug!(field = %header.name, filename = ?header.filename, "Field opened");
                                    self.state = State::Body {
                                        pending: Some(header),
                                    };
                                }
                                Err(reason) => {
                                    warn!(reason = %reason, "Invalid multipart/form-data field, skipping");
                                    self.state = State::Skip;
                                }
                            }
                        }
                        (None, _) if self.buffer.len() > MAX_HEADER_SIZE => {
                            warn!(size = self.buffer.len(), "Field headers too large, skipping field");
                            self.state = State::Skip;
                        }
                        (None, _) => break,
                    }
                }
                State::Body { pending } => match find(&self.buffer, &self.delimiter) {
                    Some(at) => {
                        let data = self.buffer.split_to(at).freeze();
                        self.buffer.advance(self.delimiter.len());
                        push_data(&mut events, pending.take(), data);
                        events.push(Event::End);
                        self.state = State::AfterBoundary;
                    }
                    None => {
                        let safe = self.buffer.len().saturating_sub(self.delimiter.len() - 1);
                        let data = self.buffer.split_to(safe).freeze();
                        push_data(&mut events, pending.take(), data);
                        break;
                    }
                },
                State::Skip => match find(&self.buffer, &self.delimiter) {
                    Some(at) => {
                        self.buffer.advance(at + self.delimiter.len());
                        self.state = State::AfterBoundary;
                    }
                    None => {
                        let safe = self.buffer.len().saturating_sub(self.delimiter.len() - 1);
                        self.buffer.advance(safe);
                        break;
                    }
                },
                State::Done => {
                    self.buffer.clear();
                    break;
                }
            }
        }

        events
    }
}

fn push_data(events: &mut Vec<Event>, pending: Option<PartHeader>, data: Bytes) {
    match pending {
        Some(header) => events.push(Event::Begin(header, data)),
        None if !data.is_empty() => events.push(Event::Data(data)),
        None => {}
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Extract the boundary token from a `Content-Type` header value.
pub fn boundary_from_content_type(content_type: &str) -> AppResult<String> {
    let (media_type, params) = split_header_value(content_type);
    if !media_type.eq_ignore_ascii_case("multipart/form-data") {
        warn!(content_type = %content_type, "Upload is not multipart/form-data");
        return Err(AppError::BadRequest(
            "Expected a multipart/form-data request body".to_string(),
        ));
    }

    params
        .into_iter()
        .find(|(key, value)| key.eq_ignore_ascii_case("boundary") && !value.is_empty())
        .map(|(_, value)| value)
        .ok_or_else(|| {
            warn!(content_type = %content_type, "Multipart boundary missing");
            AppError::BadRequest("Missing multipart boundary".to_string())
        })
}

fn parse_part_headers(block: &[u8]) -> Result<PartHeader, String> {
    let text = std::str::from_utf8(block).map_err(|e| format!("headers are not UTF-8: {e}"))?;

    let mut disposition = None;
    let mut content_type = None;
    for line in text.split("\r\n") {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        if key.eq_ignore_ascii_case("content-disposition") {
            disposition = Some(value.trim());
        } else if key.eq_ignore_ascii_case("content-type") {
            content_type = Some(value.trim().to_string());
        }
    }

    let disposition = disposition.ok_or_else(|| "missing Content-Disposition".to_string())?;
    let (kind, params) = split_header_value(disposition);
    if !kind.eq_ignore_ascii_case("form-data") {
        return Err(format!("unexpected disposition {kind}"));
    }

    let mut name = None;
    let mut filename = None;
    for (key, value) in params {
        if key.eq_ignore_ascii_case("name") {
            name = Some(value);
        } else if key.eq_ignore_ascii_case("filename") {
            filename = Some(value);
        }
    }

    Ok(PartHeader {
        name: name.ok_or_else(|| "field has no name".to_string())?,
        filename,
        content_type,
    })
}

/// Split `value; key=param; key="quoted; param"` into the leading value and
/// its parameters. Quoted parameters may contain `;` and backslash escapes.
fn split_header_value(header: &str) -> (String, Vec<(String, String)>) {
    let mut chars = header.chars().peekable();

    let mut value = String::new();
    while let Some(&c) = chars.peek() {
        if c == ';' {
            break;
        }
        value.push(c);
        chars.next();
    }

    let mut params = Vec::new();
    while chars.next_if_eq(&';').is_some() {
        let mut key = String::new();
        while let Some(c) = chars.next_if(|c| *c != '=' && *c != ';') {
            key.push(c);
        }

        let mut param = String::new();
        if chars.next_if_eq(&'=').is_some() {
            while chars.next_if(|c| c.is_whitespace()).is_some() {}
            if chars.next_if_eq(&'"').is_some() {
                while let Some(c) = chars.next() {
                    match c {
                        '"' => break,
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                param.push(escaped);
                            }
                        }
                        c => param.push(c),
                    }
                }
                // Anything between the closing quote and the next ';' is ignored
                while chars.next_if(|c| *c != ';').is_some() {}
            } else {
                while let Some(c) = chars.next_if(|c| *c != ';') {
                    param.push(c);
                }
                param = param.trim().to_string();
            }
        }

        let key = key.trim().to_string();
        if !key.is_empty() {
            params.push((key, param));
        }
    }

    (value.trim().to_string(), params)
}

/// How a [`FormHandler`] consumes one named field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route<F> {
    /// Delivered incrementally through `begin`, `data` and `end`
    Stream(F),
    /// Buffered and delivered whole through `value`
    Value(F),
}

/// Receiver of routed form field events.
#[async_trait]
pub trait FormHandler: Send {
    type Field: Copy + Send + Sync + std::fmt::Debug + 'static;

    /// Lookup table from field name to route.
    fn routes(&self) -> &'static [(&'static str, Route<Self::Field>)];

    async fn begin(
        &mut self,
        _field: Self::Field,
        _header: &PartHeader,
        _data: Bytes,
    ) -> AppResult<()> {
        Ok(())
    }

    async fn data(&mut self, _field: Self::Field, _data: Bytes) -> AppResult<()> {
        Ok(())
    }

    async fn end(&mut self, _field: Self::Field) -> AppResult<()> {
        Ok(())
    }

    async fn value(
        &mut self,
        _field: Self::Field,
        _header: &PartHeader,
        _value: Bytes,
    ) -> AppResult<()> {
        Ok(())
    }

    /// A complete field that has no entry in the routing table.
    fn unclaimed(&mut self, header: &PartHeader, value: Bytes) {
        debug!(field = %header.name, size = value.len(), "Ignoring unrouted field");
    }
}

struct OpenField<F> {
    header: PartHeader,
    route: Option<Route<F>>,
    buffer: BytesMut,
}

impl<F> OpenField<F> {
    fn buffer(&mut self, data: &[u8]) {
        let room = MAX_VALUE_SIZE.saturating_sub(self.buffer.len());
        if data.len() > room {
            warn!(field = %self.header.name, "Field value exceeds buffer limit, truncating");
        }
        self.buffer.extend_from_slice(&data[..data.len().min(room)]);
    }
}

/// Drives a [`MultipartParser`] and dispatches its events to a handler.
pub struct FormDataReader<H: FormHandler> {
    parser: MultipartParser,
    handler: H,
    open: Option<OpenField<H::Field>>,
}

impl<H: FormHandler> FormDataReader<H> {
    pub fn new(parser: MultipartParser, handler: H) -> Self {
        Self {
            parser,
            handler,
            open: None,
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn into_handler(self) -> H {
        self.handler
    }

    pub fn is_complete(&self) -> bool {
        self.parser.is_complete()
    }

    /// Parse one body chunk and dispatch the resulting events in order.
    pub async fn feed(&mut self, chunk: &[u8]) -> AppResult<()> {
        for event in self.parser.feed(chunk) {
            self.dispatch(event).await?;
        }
        Ok(())
    }

    fn lookup(&self, name: &str) -> Option<Route<H::Field>> {
        self.handler
            .routes()
            .iter()
            .find(|(field, _)| *field == name)
            .map(|(_, route)| *route)
    }

    async fn dispatch(&mut self, event: Event) -> AppResult<()> {
        match event {
            Event::Begin(header, data) => {
                let route = self.lookup(&header.name);
                let mut open = OpenField {
                    header,
                    route,
                    buffer: BytesMut::new(),
                };
                match route {
                    Some(Route::Stream(field)) => {
                        self.handler.begin(field, &open.header, data).await?;
                    }
                    _ => open.buffer(&data),
                }
                self.open = Some(open);
            }
            Event::Data(data) => {
                let Some(open) = self.open.as_mut() else {
                    return Ok(());
                };
                match open.route {
                    Some(Route::Stream(field)) => self.handler.data(field, data).await?,
                    _ => open.buffer(&data),
                }
            }
            Event::End => {
                let Some(open) = self.open.take() else {
                    return Ok(());
                };
                match open.route {
                    Some(Route::Stream(field)) => self.handler.end(field).await?,
                    Some(Route::Value(field)) => {
                        self.handler
                            .value(field, &open.header, open.buffer.freeze())
                            .await?
                    }
                    None => self.handler.unclaimed(&open.header, open.buffer.freeze()),
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOUNDARY: &str = "----pypiproxyXyZ";

    fn sample_body() -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(b"preamble to be ignored\r\n");
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        body.extend_from_slice(b"Content-Disposition: form-data; name=\"name\"\r\n\r\n");
        body.extend_from_slice(b"foo");
        body.extend_from_slice(format!("\r\n--{BOUNDARY}\r\n").as_bytes());
        body.extend_from_slice(
            b"Content-Disposition: form-data; name=\"content\"; filename=\"foo-1.0.tar.gz\"\r\n",
        );
        body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
        body.extend_from_slice(&binary_payload());
        body.extend_from_slice(format!("\r\n--{BOUNDARY}\r\n").as_bytes());
        body.extend_from_slice(b"Content-Disposition: form-data; name=\"md5_digest\"\r\n\r\n");
        body.extend_from_slice(b"0123456789abcdef0123456789abcdef");
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    /// Payload containing near-miss delimiters.
    fn binary_payload() -> Vec<u8> {
        let mut payload: Vec<u8> = (0..=255u8).collect();
        payload.extend_from_slice(b"\r\n--");
        payload.extend_from_slice(&BOUNDARY.as_bytes()[..BOUNDARY.len() - 1]);
        payload.extend_from_slice(b"\r\n\r\n--\r\n");
        payload.extend((0..=255u8).rev());
        payload
    }

    /// Fold events into (field name, filename, value) triples.
    fn collect(events: Vec<Event>) -> Vec<(String, Option<String>, Vec<u8>)> {
        let mut fields = Vec::new();
        let mut open: Option<(PartHeader, Vec<u8>)> = None;
        for event in events {
            match event {
                Event::Begin(header, data) => {
                    assert!(open.is_none(), "begin while a field is open");
                    open = Some((header, data.to_vec()));
                }
                Event::Data(data) => open
                    .as_mut()
                    .expect("data without open field")
                    .1
                    .extend_from_slice(&data),
                Event::End => {
                    let (header, value) = open.take().expect("end without open field");
                    fields.push((header.name, header.filename, value));
                }
            }
        }
        assert!(open.is_none(), "field left open");
        fields
    }

    fn parse_chunks(chunks: &[&[u8]]) -> (Vec<(String, Option<String>, Vec<u8>)>, bool) {
        let mut parser = MultipartParser::new(BOUNDARY);
        let mut events = Vec::new();
        for chunk in chunks {
            events.extend(parser.feed(chunk));
        }
        (collect(events), parser.is_complete())
    }

    fn expected() -> Vec<(String, Option<String>, Vec<u8>)> {
        vec![
            ("name".to_string(), None, b"foo".to_vec()),
            (
                "content".to_string(),
                Some("foo-1.0.tar.gz".to_string()),
                binary_payload(),
            ),
            (
                "md5_digest".to_string(),
                None,
                b"0123456789abcdef0123456789abcdef".to_vec(),
            ),
        ]
    }

    #[test]
    fn test_single_chunk() {
        let body = sample_body();
        let (fields, complete) = parse_chunks(&[&body]);
        assert_eq!(fields, expected());
        assert!(complete);
    }

    #[test]
    fn test_every_two_way_split() {
        let body = sample_body();
        for split in 0..=body.len() {
            let (head, tail) = body.split_at(split);
            let (fields, complete) = parse_chunks(&[head, tail]);
            assert_eq!(fields, expected(), "split at {split}");
            assert!(complete, "split at {split}");
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let body = sample_body();
        let chunks: Vec<&[u8]> = body.chunks(1).collect();
        let (fields, complete) = parse_chunks(&chunks);
        assert_eq!(fields, expected());
        assert!(complete);
    }

    #[test]
    fn test_odd_chunk_sizes() {
        let body = sample_body();
        for size in [2, 3, 7, 17, 64] {
            let chunks: Vec<&[u8]> = body.chunks(size).collect();
            let (fields, _) = parse_chunks(&chunks);
            assert_eq!(fields, expected(), "chunk size {size}");
        }
    }

    #[test]
    fn test_malformed_field_is_skipped() {
        let body = format!(
            "--{b}\r\nContent-Disposition: attachment; name=\"bad\"\r\n\r\nignored\r\n\
             --{b}\r\nContent-Disposition: form-data; filename=\"x\"\r\n\r\nno name\r\n\
             --{b}\r\nContent-Disposition: form-data; name=\"good\"\r\n\r\nkept\r\n--{b}--\r\n",
            b = BOUNDARY
        );
        let (fields, complete) = parse_chunks(&[body.as_bytes()]);
        assert_eq!(fields, vec![("good".to_string(), None, b"kept".to_vec())]);
        assert!(complete);
    }

    #[test]
    fn test_empty_field_value() {
        let body = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"empty\"\r\n\r\n\r\n--{b}--",
            b = BOUNDARY
        );
        let (fields, complete) = parse_chunks(&[body.as_bytes()]);
        assert_eq!(fields, vec![("empty".to_string(), None, Vec::new())]);
        assert!(complete);
    }

    #[test]
    fn test_truncated_body_is_incomplete() {
        let body = sample_body();
        let mut parser = MultipartParser::new(BOUNDARY);
        let events = parser.feed(&body[..body.len() / 2]);

        assert!(!parser.is_complete());
        assert!(matches!(events.last(), Some(Event::Begin(..)) | Some(Event::Data(_))));
    }

    #[test]
    fn test_boundary_from_content_type() {
        assert_eq!(
            boundary_from_content_type("multipart/form-data; boundary=abc123").unwrap(),
            "abc123"
        );
        assert_eq!(
            boundary_from_content_type("Multipart/Form-Data; charset=utf-8; boundary=\"a;b c\"")
                .unwrap(),
            "a;b c"
        );
        assert!(matches!(
            boundary_from_content_type("application/json"),
            Err(AppError::BadRequest(_))
        ));
        assert!(matches!(
            boundary_from_content_type("multipart/form-data"),
            Err(AppError::BadRequest(_))
        ));
        assert!(matches!(
            boundary_from_content_type("multipart/form-data; boundary="),
            Err(AppError::BadRequest(_))
        ));
    }

    #[test]
    fn test_disposition_params() {
        let header = parse_part_headers(
            b"content-disposition: form-data; name=\"content\"; filename=\"we\\\"ird;.tar.gz\"",
        )
        .expect("should parse");
        assert_eq!(header.name, "content");
        assert_eq!(header.filename.as_deref(), Some("we\"ird;.tar.gz"));
    }

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Field {
        Content,
        Name,
    }

    const ROUTES: &[(&str, Route<Field>)] = &[
        ("content", Route::Stream(Field::Content)),
        ("name", Route::Value(Field::Name)),
    ];

    #[derive(Default)]
    struct Recorder {
        calls: Vec<String>,
        content: Vec<u8>,
        unclaimed: Vec<(String, Vec<u8>)>,
    }

    #[async_trait]
    impl FormHandler for Recorder {
        type Field = Field;

        fn routes(&self) -> &'static [(&'static str, Route<Field>)] {
            ROUTES
        }

        async fn begin(&mut self, field: Field, header: &PartHeader, data: Bytes) -> AppResult<()> {
            self.calls
                .push(format!("begin {:?} {:?}", field, header.filename));
            self.content.extend_from_slice(&data);
            Ok(())
        }

        async fn data(&mut self, _field: Field, data: Bytes) -> AppResult<()> {
            self.content.extend_from_slice(&data);
            Ok(())
        }

        async fn end(&mut self, field: Field) -> AppResult<()> {
            self.calls.push(format!("end {:?}", field));
            Ok(())
        }

        async fn value(&mut self, field: Field, _header: &PartHeader, value: Bytes) -> AppResult<()> {
            self.calls.push(format!(
                "value {:?} {}",
                field,
                String::from_utf8_lossy(&value)
            ));
            Ok(())
        }

        fn unclaimed(&mut self, header: &PartHeader, value: Bytes) {
            self.unclaimed.push((header.name.clone(), value.to_vec()));
        }
    }

    #[tokio::test]
    async fn test_reader_routes_fields() {
        let body = sample_body();
        let mut reader = FormDataReader::new(MultipartParser::new(BOUNDARY), Recorder::default());
        for chunk in body.chunks(5) {
            reader.feed(chunk).await.expect("feed");
        }
        assert!(reader.is_complete());

        let recorder = reader.into_handler();
        assert_eq!(
            recorder.calls,
            vec![
                "value Name foo".to_string(),
                "begin Content Some(\"foo-1.0.tar.gz\")".to_string(),
                "end Content".to_string(),
            ]
        );
        assert_eq!(recorder.content, binary_payload());
        assert_eq!(
            recorder.unclaimed,
            vec![(
                "md5_digest".to_string(),
                b"0123456789abcdef0123456789abcdef".to_vec()
            )]
        );
    }
}
