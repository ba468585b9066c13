//! Wire layout of a transfer:
//!
//! ```text
//! [i32 LE name_len][name_len bytes UTF-8 name][i64 LE file_size][file_size bytes]
//! ```
//!
//! No handshake, checksum or version tag.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::error::TransferError;

/// Upper bound on an encoded file name
pub const MAX_FILE_NAME_LEN: usize = 4096;

/// Header preceding the file content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferMetadata {
    pub file_name: String,
    pub file_size: u64,
}

impl TransferMetadata {
    pub fn new(file_name: impl Into<String>, file_size: u64) -> Self {
        Self {
            file_name: file_name.into(),
            file_size,
        }
    }

    /// Encode the name and size fields
    pub fn encode(&self) -> Result<Vec<u8>, TransferError> {
        let name = self.file_name.as_bytes();
        if name.is_empty() || name.len() > MAX_FILE_NAME_LEN {
            return Err(TransferError::InvalidHeader(format!(
                "file name length {} outside 1..={}",
                name.len(),
                MAX_FILE_NAME_LEN
            )));
        }
        let size = i64::try_from(self.file_size).map_err(|_| {
            TransferError::InvalidHeader(format!("file size {} does not fit in i64", self.file_size))
        })?;

        let mut buf = Vec::with_capacity(4 + name.len() + 8);
        buf.extend_from_slice(&(name.len() as i32).to_le_bytes());
        buf.extend_from_slice(name);
        buf.extend_from_slice(&size.to_le_bytes());
        Ok(buf)
    }
}

/// Write the metadata header to `writer`
pub async fn write_metadata<W>(writer: &mut W, metadata: &TransferMetadata) -> Result<(), TransferError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&metadata.encode()?).await?;
    Ok(())
}

/// Read and validate a metadata header.
///
/// The returned name is the raw decoded name; callers writing to disk should
/// pass it through [`sanitize_file_name`].
pub async fn read_metadata<R>(reader: &mut R, cancel: &CancellationToken) -> Result<TransferMetadata, TransferError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    read_exact(reader, &mut len_buf, cancel).await?;
    let name_len = i32::from_le_bytes(len_buf);

    if name_len <= 0 || name_len as usize > MAX_FILE_NAME_LEN {
        return Err(TransferError::InvalidHeader(format!("file name length {}", name_len)));
    }

    let mut name_buf = vec![0u8; name_len as usize];
    read_exact(reader, &mut name_buf, cancel).await?;
    let file_name = String::from_utf8(name_buf)
        .map_err(|e| TransferError::InvalidHeader(format!("file name is not UTF-8: {}", e)))?;

    let mut size_buf = [0u8; 8];
    read_exact(reader, &mut size_buf, cancel).await?;
    let file_size = i64::from_le_bytes(size_buf);
    if file_size < 0 {
        return Err(TransferError::InvalidHeader(format!("negative file size {}", file_size)));
    }

    Ok(TransferMetadata {
        file_name,
        file_size: file_size as u64,
    })
}

/// Fill `buf` completely from `reader`.
///
/// A zero-length read before `buf` is full fails with
/// [`TransferError::Truncated`], cancellation with [`TransferError::Cancelled`].
pub async fn read_exact<R>(reader: &mut R, buf: &mut [u8], cancel: &CancellationToken) -> Result<(), TransferError>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;

    while filled < buf.len() {
        let n = tokio::select! {
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            read = reader.read(&mut buf[filled..]) => read?,
        };

        if n == 0 {
            return Err(TransferError::Truncated {
                expected: buf.len() as u64,
                received: filled as u64,
            });
        }
        filled += n;
    }

    Ok(())
}

/// Reduce a received name to its final path component.
///
/// Both `/` and `\` count as separators. Names that reduce to nothing, `.`
/// or `..` are rejected.
pub fn sanitize_file_name(raw: &str) -> Result<String, TransferError> {
    let base = raw
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or_default();

    if base.is_empty() || base == "." || base == ".." || base.contains('\0') {
        return Err(TransferError::InvalidFileName(raw.to_string()));
    }

    Ok(base.to_string())
}

/// Whole-number percentage of `done` out of `total`, rounded half up.
///
/// An empty total counts as complete.
pub fn percent_complete(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    let pct = (done.min(total) as u128 * 100 + total as u128 / 2) / total as u128;
    pct as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn test_metadata_round_trip() {
        let meta = TransferMetadata::new("report.pdf", 1_048_576);

        let mut wire = Vec::new();
        write_metadata(&mut wire, &meta).await.unwrap();
        assert_eq!(wire.len(), 4 + "report.pdf".len() + 8);
        assert_eq!(&wire[..4], &10i32.to_le_bytes());

        let decoded = read_metadata(&mut wire.as_slice(), &CancellationToken::new()).await.unwrap();
        assert_eq!(decoded, meta);
    }

    #[tokio::test]
    async fn test_read_exact_from_single_byte_fragments() {
        let payload = b"fragmented";
        let mut builder = Builder::new();
        for byte in payload.iter() {
            builder.read(std::slice::from_ref(byte));
        }
        let mut stream = builder.build();

        let mut buf = [0u8; 10];
        read_exact(&mut stream, &mut buf, &CancellationToken::new()).await.unwrap();
        assert_eq!(&buf, payload);
    }

    #[tokio::test]
    async fn test_read_exact_truncated() {
        let mut stream = Builder::new().read(b"abc").read(b"d").build();

        let mut buf = [0u8; 8];
        let err = read_exact(&mut stream, &mut buf, &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            TransferError::Truncated { expected, received } => {
                assert_eq!(expected, 8);
                assert_eq!(received, 4);
            }
            other => panic!("expected truncation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_exact_cancelled() {
        let (mut client, _server) = tokio::io::duplex(64);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut buf = [0u8; 4];
        let err = read_exact(&mut client, &mut buf, &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_header_split_across_reads() {
        let wire = TransferMetadata::new("notes.txt", 42).encode().unwrap();
        let mut stream = Builder::new().read(&wire[..2]).read(&wire[2..7]).read(&wire[7..]).build();

        let meta = read_metadata(&mut stream, &CancellationToken::new()).await.unwrap();
        assert_eq!(meta.file_name, "notes.txt");
        assert_eq!(meta.file_size, 42);
    }

    #[tokio::test]
    async fn test_rejects_bad_headers() {
        let cancel = CancellationToken::new();

        let negative_len = (-1i32).to_le_bytes();
        let err = read_metadata(&mut negative_len.as_slice(), &cancel).await.unwrap_err();
        assert!(matches!(err, TransferError::InvalidHeader(_)));

        let mut negative_size = Vec::new();
        negative_size.extend_from_slice(&1i32.to_le_bytes());
        negative_size.push(b'a');
        negative_size.extend_from_slice(&(-5i64).to_le_bytes());
        let err = read_metadata(&mut negative_size.as_slice(), &cancel).await.unwrap_err();
        assert!(matches!(err, TransferError::InvalidHeader(_)));

        let mut bad_utf8 = Vec::new();
        bad_utf8.extend_from_slice(&2i32.to_le_bytes());
        bad_utf8.extend_from_slice(&[0xff, 0xfe]);
        bad_utf8.extend_from_slice(&0i64.to_le_bytes());
        let err = read_metadata(&mut bad_utf8.as_slice(), &cancel).await.unwrap_err();
        assert!(matches!(err, TransferError::InvalidHeader(_)));
    }

    #[test]
    fn test_encode_rejects_empty_name() {
        assert!(TransferMetadata::new("", 1).encode().is_err());
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("report.pdf").unwrap(), "report.pdf");
        assert_eq!(sanitize_file_name("../../etc/passwd").unwrap(), "passwd");
        assert_eq!(sanitize_file_name("C:\\Users\\me\\photo.jpg").unwrap(), "photo.jpg");
        assert_eq!(sanitize_file_name("/abs/path/data.bin").unwrap(), "data.bin");
        assert_eq!(sanitize_file_name(" notes v2 .txt ").unwrap(), " notes v2 .txt ");
        assert_eq!(sanitize_file_name("dir/ padded").unwrap(), " padded");

        for bad in ["", "..", ".", "dir/", "a/..", "nul\0byte"] {
            assert!(sanitize_file_name(bad).is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn test_percent_complete() {
        assert_eq!(percent_complete(0, 0), 100);
        assert_eq!(percent_complete(0, 10), 0);
        assert_eq!(percent_complete(1, 3), 33);
        assert_eq!(percent_complete(2, 3), 67);
        assert_eq!(percent_complete(8192, 8193), 100);
        assert_eq!(percent_complete(8193, 8193), 100);
        assert_eq!(percent_complete(u64::MAX / 2, u64::MAX), 50);
    }
}
