//! Version header for compiled artifacts
//!
//! Compiled artifacts start with a small header so a byte-identical cache hit
//! produced by an older schema or tool can be rejected on restore.

use std::io::{self, Write};

const MAGIC: &[u8; 4] = b"PWAR";

/// Schema and tool version embedded at the start of an artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactHeader {
    pub schema: u32,
    pub tool_version: String,
}

impl ArtifactHeader {
    pub fn new(schema: u32, tool_version: impl Into<String>) -> Self {
        Self {
            schema,
            tool_version: tool_version.into(),
        }
    }

    /// Write the header; the artifact body follows it
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        let version = self.tool_version.as_bytes();
        let len = u32::try_from(version.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "tool version too long"))?;
        writer.write_all(MAGIC)?;
        writer.write_all(&self.schema.to_le_bytes())?;
        writer.write_all(&len.to_le_bytes())?;
        writer.write_all(version)
    }

    /// Encode the header followed by `body`
    pub fn wrap(&self, body: &[u8]) -> io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(12 + self.tool_version.len() + body.len());
        self.write_to(&mut out)?;
        out.extend_from_slice(body);
        Ok(out)
    }

    /// Parse a header, returning it with the offset where the body starts.
    ///
    /// `None` means the bytes do not start with a well-formed header.
    pub fn read_from(bytes: &[u8]) -> Option<(Self, usize)> {
        let rest = bytes.strip_prefix(MAGIC.as_slice())?;
        let schema = u32::from_le_bytes(rest.get(0..4)?.try_into().ok()?);
        let len = u32::from_le_bytes(rest.get(4..8)?.try_into().ok()?) as usize;
        let version = rest.get(8..8usize.checked_add(len)?)?;
        let tool_version = String::from_utf8(version.to_vec()).ok()?;
        Some((
            Self {
                schema,
                tool_version,
            },
            MAGIC.len() + 8 + len,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_and_read() {
        let header = ArtifactHeader::new(3, "0.1.0");
        let bytes = header.wrap(b"body").unwrap();
        let (parsed, offset) = ArtifactHeader::read_from(&bytes).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(&bytes[offset..], b"body");
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(ArtifactHeader::read_from(b"").is_none());
        assert!(ArtifactHeader::read_from(b"PWAR\x01\x00").is_none());
        assert!(ArtifactHeader::read_from(b"XXXX\x01\x00\x00\x00\x00\x00\x00\x00").is_none());
    }

    #[test]
    fn test_rejects_truncated_version() {
        let bytes = ArtifactHeader::new(1, "1.2.3").wrap(b"").unwrap();
        assert!(ArtifactHeader::read_from(&bytes[..bytes.len() - 2]).is_none());
    }
}
