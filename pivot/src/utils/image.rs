use image::{codecs::jpeg::JpegEncoder, ImageResult, RgbImage};

/// Start of image marker.
pub const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
/// End of image marker.
pub const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];

/// Encode an image as JPEG at the given quality (1..=100).
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> ImageResult<Vec<u8>> {
    let mut bytes = Vec::new();
    JpegEncoder::new_with_quality(&mut bytes, quality).encode_image(image)?;
    Ok(bytes)
}

/// Cheap check that a buffer is framed as a JPEG. Does not decode.
pub fn is_jpeg(bytes: &[u8]) -> bool {
    bytes.len() >= 4 && bytes.starts_with(&JPEG_SOI) && bytes.ends_with(&JPEG_EOI)
}

/// Splits a concatenated MJPEG byte stream (as written by `image2pipe`) into
/// individual JPEG images. Entropy coded data byte-stuffs `0xFF`, so the end of
/// image marker cannot appear inside a frame.
pub struct JpegSplitter {
    buffer: Vec<u8>,
    /// Upper bound for a single frame, anything larger is discarded.
    max_frame_len: usize,
}

impl JpegSplitter {
    /// * `max_frame_len`: bytes after which a frame with no end marker is dropped.
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_frame_len,
        }
    }

    /// Feed a chunk of the stream and collect every frame it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            let Some(start) = find_marker(&self.buffer, JPEG_SOI, 0) else {
                // Keep a trailing 0xFF, it may be the first half of a marker.
                let keep = usize::from(self.buffer.last() == Some(&0xFF));
                self.buffer.drain(..self.buffer.len() - keep);
                break;
            };
            if start > 0 {
                self.buffer.drain(..start);
            }
            match find_marker(&self.buffer, JPEG_EOI, JPEG_SOI.len()) {
                Some(end) => {
                    let frame: Vec<u8> = self.buffer.drain(..end + JPEG_EOI.len()).collect();
                    frames.push(frame);
                }
                None => {
                    if self.buffer.len() > self.max_frame_len {
                        self.buffer.clear();
                    }
                    break;
                }
            }
        }
        frames
    }
}

fn find_marker(haystack: &[u8], marker: [u8; 2], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(2)
        .position(|w| w == marker)
        .map(|idx| idx + from)
}
