//! Post-stop integrity probe
//!
//! A structural check of a finalized MP4 (ISO-BMFF) segment. The probe walks
//! top-level box headers only, seeking over box bodies, so its cost is bounded
//! by the number of boxes inspected and independent of the file size.
//!
//! A segment passes when:
//! - the first box is `ftyp`
//! - a `moov` box is present (written by the muxer on finalization)
//! - box sizes exactly tile the file (no truncated trailing box)

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;

/// Default bound on inspected top-level boxes
pub const DEFAULT_MAX_BOXES: usize = 64;

/// Result of probing one segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeReport {
    pub path: PathBuf,
    pub ok: bool,
    pub reason: Option<String>,
    pub boxes_read: usize,
}

impl ProbeReport {
    fn pass(path: &Path, boxes_read: usize) -> Self {
        Self {
            path: path.to_path_buf(),
            ok: true,
            reason: None,
            boxes_read,
        }
    }

    pub(crate) fn fail(path: &Path, boxes_read: usize, reason: impl Into<String>) -> Self {
        Self {
            path: path.to_path_buf(),
            ok: false,
            reason: Some(reason.into()),
            boxes_read,
        }
    }
}

/// Structural validator for finalized output
#[async_trait]
pub trait IntegrityProbe: Send + Sync {
    async fn probe(&self, path: &Path) -> ProbeReport;
}

/// Top-level box walker for MP4 segments
#[derive(Debug, Clone, Copy)]
pub struct Mp4StructureProbe {
    max_boxes: usize,
}

impl Default for Mp4StructureProbe {
    fn default() -> Self {
        Self {
            max_boxes: DEFAULT_MAX_BOXES,
        }
    }
}

impl Mp4StructureProbe {
    pub fn new(max_boxes: usize) -> Self {
        Self {
            max_boxes: max_boxes.max(1),
        }
    }

    /// Blocking walk of the box headers
    pub fn probe_sync(&self, path: &Path) -> ProbeReport {
        let mut file = match File::open(path) {
            Ok(f) => f,
            Err(e) => return ProbeReport::fail(path, 0, format!("cannot open: {}", e)),
        };
        let len = match file.metadata() {
            Ok(m) => m.len(),
            Err(e) => return ProbeReport::fail(path, 0, format!("cannot stat: {}", e)),
        };
        if len == 0 {
            return ProbeReport::fail(path, 0, "empty file");
        }

        let mut offset = 0u64;
        let mut boxes = 0usize;
        let mut saw_moov = false;

        while offset < len {
            if boxes == self.max_boxes {
                return ProbeReport::fail(
                    path,
                    boxes,
                    format!("more than {} top-level boxes", self.max_boxes),
                );
            }
            if len - offset < 8 {
                return ProbeReport::fail(path, boxes, "truncated box header");
            }

            let mut header = [0u8; 8];
            if let Err(e) = file
                .seek(SeekFrom::Start(offset))
                .and_then(|_| file.read_exact(&mut header))
            {
                return ProbeReport::fail(path, boxes, format!("read failed: {}", e));
            }

            let small = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as u64;
            let kind = [header[4], header[5], header[6], header[7]];
            let (size, header_len) = match small {
                0 => (len - offset, 8),
                1 => {
                    let mut large = [0u8; 8];
                    if file.read_exact(&mut large).is_err() {
                        return ProbeReport::fail(path, boxes, "truncated large-size header");
                    }
                    (u64::from_be_bytes(large), 16)
                }
                n => (n, 8),
            };

            if size < header_len {
                return ProbeReport::fail(
                    path,
                    boxes,
                    format!("box '{}' has invalid size {}", fourcc(&kind), size),
                );
            }
            if size > len - offset {
                return ProbeReport::fail(
                    path,
                    boxes,
                    format!(
                        "box '{}' at {} overruns file ({} > {})",
                        fourcc(&kind),
                        offset,
                        size,
                        len - offset
                    ),
                );
            }
            if boxes == 0 && &kind != b"ftyp" {
                return ProbeReport::fail(
                    path,
                    1,
                    format!("first box is '{}', expected 'ftyp'", fourcc(&kind)),
                );
            }
            if &kind == b"moov" {
                saw_moov = true;
            }

            boxes += 1;
            offset += size;
        }

        if !saw_moov {
            return ProbeReport::fail(path, boxes, "missing 'moov' box (not finalized)");
        }
        ProbeReport::pass(path, boxes)
    }
}

#[async_trait]
impl IntegrityProbe for Mp4StructureProbe {
    async fn probe(&self, path: &Path) -> ProbeReport {
        let probe = *self;
        let owned = path.to_path_buf();
        match tokio::task::spawn_blocking(move || probe.probe_sync(&owned)).await {
            Ok(report) => report,
            Err(e) => ProbeReport::fail(path, 0, format!("probe task failed: {}", e)),
        }
    }
}

fn fourcc(kind: &[u8; 4]) -> String {
    kind.iter()
        .map(|b| if b.is_ascii_graphic() { *b as char } else { '?' })
        .collect()
}

/// Encode one ISO-BMFF box with a 32-bit size.
pub(crate) fn encode_box(kind: &[u8; 4], body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + body.len());
    out.extend_from_slice(&((8 + body.len()) as u32).to_be_bytes());
    out.extend_from_slice(kind);
    out.extend_from_slice(body);
    out
}

/// A minimal finalized segment: `ftyp`, `mdat`, `moov`.
pub(crate) fn finalized_segment(payload_len: usize) -> Vec<u8> {
    let mut out = encode_box(b"ftyp", b"isom\0\0\x02\0isomiso2mp41");
    out.extend(encode_box(b"mdat", &vec![0u8; payload_len]));
    out.extend(encode_box(b"moov", &encode_box(b"mvhd", &[0u8; 100])));
    out
}

/// An unfinalized segment: `ftyp` then an `mdat` whose declared size runs
/// past the end of the file, as left behind by a killed muxer.
pub(crate) fn unfinalized_segment(payload_len: usize) -> Vec<u8> {
    let mut out = encode_box(b"ftyp", b"isom\0\0\x02\0isomiso2mp41");
    let declared = (8 + payload_len * 2) as u32;
    out.extend_from_slice(&declared.to_be_bytes());
    out.extend_from_slice(b"mdat");
    out.extend(vec![0u8; payload_len]);
    out
}
