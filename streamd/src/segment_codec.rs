//! Cold-segment blob framing (spec §6): a sequence of
//! `<4-byte big-endian length><length bytes of body>` frames, no header,
//! no trailer.

#[derive(Debug)]
pub struct FrameError(pub String);

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "frame decode error: {}", self.0)
    }
}
impl std::error::Error for FrameError {}

pub fn encode_frames<'a>(bodies: impl Iterator<Item = &'a [u8]>) -> Vec<u8> {
    let mut out = Vec::new();
    for body in bodies {
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(body);
    }
    out
}

pub fn decode_frames(blob: &[u8]) -> Result<Vec<Vec<u8>>, FrameError> {
    let mut frames = Vec::new();
    let mut pos = 0usize;
    while pos < blob.len() {
        if pos + 4 > blob.len() {
            return Err(FrameError("truncated length prefix".into()));
        }
        let len = u32::from_be_bytes(blob[pos..pos + 4].try_into().unwrap()) as usize;
        pos += 4;
        if pos + len > blob.len() {
            return Err(FrameError("truncated frame body".into()));
        }
        frames.push(blob[pos..pos + len].to_vec());
        pos += len;
    }
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_multiple_frames() {
        let bodies: Vec<&[u8]> = vec![b"hello", b"", b"world!!"];
        let blob = encode_frames(bodies.iter().copied());
        let decoded = decode_frames(&blob).unwrap();
        assert_eq!(decoded, vec![b"hello".to_vec(), Vec::new(), b"world!!".to_vec()]);
    }

    #[test]
    fn empty_blob_decodes_to_no_frames() {
        assert!(decode_frames(&[]).unwrap().is_empty());
    }

    #[test]
    fn rejects_truncated_length_prefix() {
        assert!(decode_frames(&[0, 0, 0]).is_err());
    }

    #[test]
    fn rejects_truncated_body() {
        let mut blob = 10u32.to_be_bytes().to_vec();
        blob.extend_from_slice(b"short");
        assert!(decode_frames(&blob).is_err());
    }
}
