use async_trait::async_trait;
use braid::error::{DecodeError, MuxError, OpenerError};
use braid::opener::MemoryOpener;
use braid::{
    CsvDecoder, CsvDecoderConfig, MuxConfig, MuxReader, Opener, OpenerRegistry, SourceStream,
};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tempfile::TempDir;
use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::sync::CancellationToken;

fn sources(specs: &[(&str, &str)]) -> Vec<Box<dyn Opener>> {
    specs
        .iter()
        .map(|(name, data)| {
            Box::new(MemoryOpener::new(*name, data.to_string())) as Box<dyn Opener>
        })
        .collect()
}

fn mux_over(specs: &[(&str, &str)]) -> MuxReader {
    MuxReader::spawn(sources(specs), MuxConfig::default(), CancellationToken::new())
}

async fn read_all(mux: &mut MuxReader) -> Result<Vec<u8>, MuxError> {
    let mut merged = Vec::new();
    let mut buf = [0u8; 64];
    loop {
        let n = mux.read(&mut buf).await?;
        if n == 0 {
            return Ok(merged);
        }
        merged.extend_from_slice(&buf[..n]);
    }
}

async fn decode_over(specs: &[(&str, &str)], config: CsvDecoderConfig) -> braid::RecordIter {
    CsvDecoder::new(config)
        .decode(mux_over(specs))
        .await
        .unwrap()
}

async fn collect(records: &mut braid::RecordIter) -> Vec<(Vec<String>, String)> {
    let mut rows = Vec::new();
    while let Some(record) = records.next().await {
        rows.push((record.fields().to_vec(), record.meta().name.clone()));
    }
    rows
}

/// Stream that yields its payload, then fails.
struct FlakyStream {
    data: Vec<u8>,
    pos: usize,
}

impl AsyncRead for FlakyStream {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.pos >= this.data.len() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "connection reset",
            )));
        }
        let n = buf.remaining().min(this.data.len() - this.pos);
        buf.put_slice(&this.data[this.pos..this.pos + n]);
        this.pos += n;
        Poll::Ready(Ok(()))
    }
}

/// Opener whose stream fails after delivering a prefix of data.
struct FlakyOpener {
    name: String,
    data: Vec<u8>,
}

#[async_trait]
impl Opener for FlakyOpener {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&self) -> Result<SourceStream, OpenerError> {
        Ok(Box::new(FlakyStream {
            data: self.data.clone(),
            pos: 0,
        }))
    }
}

/// Opener that always fails to open.
struct BrokenOpener {
    name: String,
}

#[async_trait]
impl Opener for BrokenOpener {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&self) -> Result<SourceStream, OpenerError> {
        Err(OpenerError::FileOpen {
            path: self.name.clone(),
            source: io::Error::new(io::ErrorKind::NotFound, "no such file"),
        })
    }
}

#[tokio::test]
async fn test_concatenates_sources_in_order() {
    let config = MuxConfig::default().with_chunk_size(4);
    let mut mux = MuxReader::spawn(
        sources(&[("a", "hello "), ("b", "merged "), ("c", "world")]),
        config,
        CancellationToken::new(),
    );

    let merged = read_all(&mut mux).await.unwrap();
    assert_eq!(merged, b"hello merged world");

    // Exhaustion is stable.
    let mut buf = [0u8; 8];
    assert_eq!(mux.read(&mut buf).await.unwrap(), 0);
    assert_eq!(mux.read(&mut buf).await.unwrap(), 0);
}

#[tokio::test]
async fn test_empty_source_list() {
    let mut mux = mux_over(&[]);
    let mut buf = [0u8; 8];
    assert_eq!(mux.read(&mut buf).await.unwrap(), 0);

    let cancel = CancellationToken::new();
    assert_eq!(mux.await_boundary(&cancel).await.unwrap(), None);
}

#[tokio::test]
async fn test_boundaries_interleave_with_reads() {
    let mut mux = mux_over(&[("a.csv", "12345"), ("b.csv", "678")]);
    let cancel = CancellationToken::new();

    let boundary = mux.await_boundary(&cancel).await.unwrap().unwrap();
    assert_eq!(boundary.name, "a.csv");
    assert_eq!(boundary.byte_offset, 0);

    let mut buf = [0u8; 16];
    assert_eq!(mux.read(&mut buf).await.unwrap(), 5);
    assert_eq!(&buf[..5], b"12345");
    assert_eq!(mux.current().name, "a.csv");
    assert_eq!(mux.current().byte_offset, 5);

    // The next boundary is only announced once the previous source's
    // bytes have all been delivered.
    let boundary = mux.await_boundary(&cancel).await.unwrap().unwrap();
    assert_eq!(boundary.name, "b.csv");

    assert_eq!(mux.read(&mut buf).await.unwrap(), 3);
    assert_eq!(&buf[..3], b"678");
    assert_eq!(mux.read(&mut buf).await.unwrap(), 0);
    assert_eq!(mux.await_boundary(&cancel).await.unwrap(), None);
}

#[tokio::test]
async fn test_boundaries_coalesce_to_latest() {
    let mut mux = mux_over(&[("empty.csv", ""), ("b.csv", "x")]);

    let mut buf = [0u8; 8];
    assert_eq!(mux.read(&mut buf).await.unwrap(), 1);
    assert_eq!(&buf[..1], b"x");

    // The empty source's boundary was overwritten before anyone observed
    // it; a late waiter sees only the latest one.
    let cancel = CancellationToken::new();
    let boundary = mux.await_boundary(&cancel).await.unwrap().unwrap();
    assert_eq!(boundary.name, "b.csv");
}

#[tokio::test]
async fn test_current_tracks_delivered_bytes() {
    let config = MuxConfig::default().with_chunk_size(4);
    let mut mux = MuxReader::spawn(
        sources(&[("a.csv", "hello world")]),
        config,
        CancellationToken::new(),
    );

    let mut buf = [0u8; 3];
    let mut delivered = 0u64;
    let mut last = 0u64;
    loop {
        let n = mux.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        delivered += n as u64;
        let current = mux.current();
        assert_eq!(current.name, "a.csv");
        assert_eq!(current.byte_offset, delivered);
        assert!(current.byte_offset >= last);
        last = current.byte_offset;
    }
    assert_eq!(delivered, 11);
}

#[tokio::test]
async fn test_open_failure_aborts_stream() {
    let mut openers = sources(&[("a", "aa")]);
    openers.push(Box::new(BrokenOpener {
        name: "bad".to_string(),
    }));
    openers.extend(sources(&[("c", "cc")]));
    let mut mux = MuxReader::spawn(openers, MuxConfig::default(), CancellationToken::new());

    let mut buf = [0u8; 8];
    assert_eq!(mux.read(&mut buf).await.unwrap(), 2);
    assert_eq!(&buf[..2], b"aa");

    let err = mux.read(&mut buf).await.unwrap_err();
    match err {
        MuxError::Open { ref name, .. } => assert_eq!(name, "bad"),
        other => panic!("expected open error, got {other:?}"),
    }

    // The stream stays failed; no bytes from "c" ever appear.
    assert!(matches!(
        mux.read(&mut buf).await.unwrap_err(),
        MuxError::Terminated { .. }
    ));
}

#[tokio::test]
async fn test_read_failure_delivers_partial_bytes_first() {
    let openers: Vec<Box<dyn Opener>> = vec![Box::new(FlakyOpener {
        name: "flaky".to_string(),
        data: b"part".to_vec(),
    })];
    let mut mux = MuxReader::spawn(openers, MuxConfig::default(), CancellationToken::new());

    let mut buf = [0u8; 8];
    assert_eq!(mux.read(&mut buf).await.unwrap(), 4);
    assert_eq!(&buf[..4], b"part");

    let err = mux.read(&mut buf).await.unwrap_err();
    match err {
        MuxError::Read { ref name, .. } => assert_eq!(name, "flaky"),
        other => panic!("expected read error, got {other:?}"),
    }
    assert!(matches!(
        mux.read(&mut buf).await.unwrap_err(),
        MuxError::Terminated { .. }
    ));
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let mut mux = mux_over(&[("a", "data")]);
    mux.close();
    mux.close();

    let mut buf = [0u8; 8];
    assert!(matches!(
        mux.read(&mut buf).await.unwrap_err(),
        MuxError::Closed
    ));
    let cancel = CancellationToken::new();
    assert!(matches!(
        mux.await_boundary(&cancel).await.unwrap_err(),
        MuxError::Closed
    ));
}

#[tokio::test]
async fn test_cancel_interrupts_boundary_wait() {
    let mut mux = mux_over(&[("a", "x")]);
    let cancel = CancellationToken::new();

    let boundary = mux.await_boundary(&cancel).await.unwrap().unwrap();
    assert_eq!(boundary.name, "a");

    // No further boundary is coming while the source still streams.
    cancel.cancel();
    assert!(matches!(
        mux.await_boundary(&cancel).await.unwrap_err(),
        MuxError::Cancelled
    ));
}

#[tokio::test]
async fn test_decodes_sources_with_repeated_headers() {
    let mut records = decode_over(
        &[
            ("a.csv", "col1,col2\na1,b1\n"),
            ("b.csv", "col1,col2\na2,b2\n"),
            ("c.csv", "col1,col2\na3,b3\n"),
        ],
        CsvDecoderConfig::default(),
    )
    .await;

    assert_eq!(records.header().names(), &["col1", "col2"]);
    let rows = collect(&mut records).await;
    assert_eq!(
        rows,
        vec![
            (vec!["a1".to_string(), "b1".to_string()], "a.csv".to_string()),
            (vec!["a2".to_string(), "b2".to_string()], "b.csv".to_string()),
            (vec!["a3".to_string(), "b3".to_string()], "c.csv".to_string()),
        ]
    );
    assert!(records.err().is_none());
}

#[tokio::test]
async fn test_first_row_differing_from_header_is_data() {
    let mut records = decode_over(
        &[
            ("a.csv", "col1,col2\na1,b1\n"),
            ("b.csv", "x1,y1\nx2,y2\n"),
        ],
        CsvDecoderConfig::default(),
    )
    .await;

    let rows = collect(&mut records).await;
    assert!(records.err().is_none());
    assert_eq!(
        rows,
        vec![
            (vec!["a1".to_string(), "b1".to_string()], "a.csv".to_string()),
            (vec!["x1".to_string(), "y1".to_string()], "b.csv".to_string()),
            (vec!["x2".to_string(), "y2".to_string()], "b.csv".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_empty_and_header_only_sources_are_tolerated() {
    let mut records = decode_over(
        &[
            ("a.csv", "col1,col2\na1,b1\n"),
            ("empty.csv", ""),
            ("header_only.csv", "col1,col2\n"),
            ("d.csv", "a4,b4\n"),
        ],
        CsvDecoderConfig::default(),
    )
    .await;

    let rows = collect(&mut records).await;
    assert!(records.err().is_none());
    assert_eq!(
        rows,
        vec![
            (vec!["a1".to_string(), "b1".to_string()], "a.csv".to_string()),
            (vec!["a4".to_string(), "b4".to_string()], "d.csv".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_duplicate_header_rejected() {
    let err = CsvDecoder::new(CsvDecoderConfig::default())
        .decode(mux_over(&[("a.csv", "col1,col1\na1,b1\n")]))
        .await
        .err()
        .unwrap();
    assert!(matches!(
        err,
        DecodeError::DuplicateHeaderField { ref name } if name == "col1"
    ));
}

#[tokio::test]
async fn test_explicit_header_discards_matching_rows() {
    let config = CsvDecoderConfig::default()
        .with_header(vec!["col1".to_string(), "col2".to_string()]);
    let mut records = decode_over(
        &[
            ("a.csv", "col1,col2\na1,b1\n"),
            ("headerless.csv", "a2,b2\n"),
        ],
        config,
    )
    .await;

    let rows = collect(&mut records).await;
    assert!(records.err().is_none());
    assert_eq!(
        rows,
        vec![
            (vec!["a1".to_string(), "b1".to_string()], "a.csv".to_string()),
            (
                vec!["a2".to_string(), "b2".to_string()],
                "headerless.csv".to_string()
            ),
        ]
    );
}

#[tokio::test]
async fn test_explicit_header_field_count_mismatch() {
    let config = CsvDecoderConfig::default()
        .with_header(vec!["col1".to_string(), "col2".to_string()]);
    let mut records = decode_over(&[("a.csv", "x1,y1,z1\n")], config).await;

    assert!(records.next().await.is_none());
    assert!(matches!(
        records.err(),
        Some(DecodeError::FieldCount {
            expected: 2,
            found: 3,
        })
    ));
}

#[tokio::test]
async fn test_repeated_header_rows_all_discarded() {
    let mut records = decode_over(
        &[("a.csv", "col1,col2\ncol1,col2\ncol1,col2\na1,b1\n")],
        CsvDecoderConfig::default(),
    )
    .await;

    let rows = collect(&mut records).await;
    assert!(records.err().is_none());
    assert_eq!(
        rows,
        vec![(vec!["a1".to_string(), "b1".to_string()], "a.csv".to_string())]
    );
}

#[tokio::test]
async fn test_mid_source_header_like_row_is_served() {
    let mut records = decode_over(
        &[("a.csv", "col1,col2\na1,b1\ncol1,col2\n")],
        CsvDecoderConfig::default(),
    )
    .await;

    let rows = collect(&mut records).await;
    assert!(records.err().is_none());
    assert_eq!(
        rows,
        vec![
            (vec!["a1".to_string(), "b1".to_string()], "a.csv".to_string()),
            (
                vec!["col1".to_string(), "col2".to_string()],
                "a.csv".to_string()
            ),
        ]
    );
}

#[tokio::test]
async fn test_field_count_error_is_sticky() {
    let mut records = decode_over(
        &[("a.csv", "col1,col2\na1,b1\nonly_one\na2,b2\n")],
        CsvDecoderConfig::default(),
    )
    .await;

    let record = records.next().await.unwrap();
    assert_eq!(record.fields(), &["a1", "b1"]);

    assert!(records.next().await.is_none());
    assert!(matches!(
        records.err(),
        Some(DecodeError::FieldCount {
            expected: 2,
            found: 1,
        })
    ));

    // The failure does not clear on further calls.
    assert!(records.next().await.is_none());
    assert!(records.err().is_some());
}

#[tokio::test]
async fn test_header_unavailable_on_empty_stream() {
    let err = CsvDecoder::new(CsvDecoderConfig::default())
        .decode(mux_over(&[("empty.csv", "")]))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, DecodeError::HeaderUnavailable));
}

#[tokio::test]
async fn test_record_lookup_by_name() {
    let mut records = decode_over(
        &[("a.csv", "id,amount\n7,19.50\n")],
        CsvDecoderConfig::default(),
    )
    .await;

    let record = records.next().await.unwrap();
    assert_eq!(record.by_name("id"), Some("7"));
    assert_eq!(record.by_name("amount"), Some("19.50"));
    assert_eq!(record.by_name("missing"), None);
    assert_eq!(record.by_index(1), Some("19.50"));
    assert_eq!(record.meta().name, "a.csv");
}

#[tokio::test]
async fn test_custom_delimiter_end_to_end() {
    let config = CsvDecoderConfig::default().with_delimiter(b'|');
    let mut records = decode_over(
        &[("a.psv", "col1|col2\na1|b1\n"), ("b.psv", "col1|col2\na2|b2\n")],
        config,
    )
    .await;

    let rows = collect(&mut records).await;
    assert!(records.err().is_none());
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].0, vec!["a1".to_string(), "b1".to_string()]);
    assert_eq!(rows[1].0, vec!["a2".to_string(), "b2".to_string()]);
}

#[tokio::test]
async fn test_record_iter_close_is_idempotent() {
    let mut records = decode_over(
        &[("a.csv", "col1,col2\na1,b1\na2,b2\n")],
        CsvDecoderConfig::default(),
    )
    .await;

    records.next().await.unwrap();
    records.close();
    records.close();

    assert!(records.next().await.is_none());
    assert!(records.err().is_none());
}

#[tokio::test]
async fn test_decode_surfaces_stream_failure() {
    let mut openers = sources(&[("a.csv", "col1,col2\na1,b1\n")]);
    openers.push(Box::new(BrokenOpener {
        name: "bad.csv".to_string(),
    }));
    let mux = MuxReader::spawn(openers, MuxConfig::default(), CancellationToken::new());
    let mut records = CsvDecoder::new(CsvDecoderConfig::default())
        .decode(mux)
        .await
        .unwrap();

    let record = records.next().await.unwrap();
    assert_eq!(record.fields(), &["a1", "b1"]);

    assert!(records.next().await.is_none());
    assert!(matches!(records.err(), Some(DecodeError::Stream { .. })));
}

#[tokio::test]
async fn test_registry_resolves_and_decodes_files() {
    let dir = TempDir::new().unwrap();
    tokio::fs::write(dir.path().join("one.csv"), "col1,col2\na1,b1\n")
        .await
        .unwrap();
    tokio::fs::write(dir.path().join("two.csv"), "col1,col2\na2,b2\n")
        .await
        .unwrap();

    let registry = OpenerRegistry::with_defaults();
    let spec = format!("{}/*.csv", dir.path().display());
    let openers = registry.resolve(&spec).unwrap();
    assert_eq!(openers.len(), 2);

    let mux = MuxReader::spawn(openers, MuxConfig::default(), CancellationToken::new());
    let mut records = CsvDecoder::new(CsvDecoderConfig::default())
        .decode(mux)
        .await
        .unwrap();

    let rows = collect(&mut records).await;
    assert!(records.err().is_none());
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].0, vec!["a1".to_string(), "b1".to_string()]);
    assert!(rows[0].1.ends_with("one.csv"));
    assert_eq!(rows[1].0, vec!["a2".to_string(), "b2".to_string()]);
    assert!(rows[1].1.ends_with("two.csv"));
}
