//! Per-image result files.
//!
//! Each processed image `<dir>/<base>.<ext>` produces `<output_dir>/<base>.txt`
//! with one line per detection:
//!
//! ```text
//! <rank> <class> <score> <x1> <y1> <x2> <y1> <x2> <y2> <x1> <y2> <cx> <cy>
//! ```
//!
//! Ranks start at 1 and follow detector order. The four corners run clockwise
//! from top-left, then the box centre. Lines are separated by `\n` with no
//! trailing newline; an image without detections gets an empty file.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use detbatch_core::{DetError, Detection, Result};

use crate::context::ResultItem;

/// Render detections in result-file format.
pub fn format_detections(detections: &[Detection]) -> String {
    let mut out = String::new();
    for (i, det) in detections.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        let [(x1, y1), (x2, _), (_, y2), _] = det.bbox.corners();
        let (cx, cy) = det.bbox.center();
        // Writing to a String cannot fail.
        let _ = write!(
            out,
            "{} {} {} {x1} {y1} {x2} {y1} {x2} {y2} {x1} {y2} {cx} {cy}",
            i + 1,
            det.class_id,
            det.score,
        );
    }
    out
}

/// One parsed line of a result file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResultLine {
    pub rank: usize,
    pub class_id: u32,
    pub score: f32,
    /// Clockwise from top-left.
    pub corners: [(f32, f32); 4],
    pub center: (f32, f32),
}

impl ResultLine {
    /// Width and height implied by the corners.
    pub fn size(&self) -> (f32, f32) {
        (
            self.corners[1].0 - self.corners[0].0,
            self.corners[2].1 - self.corners[1].1,
        )
    }
}

/// Parse the contents of a result file. Empty input yields no lines.
pub fn parse_result_file(text: &str) -> Result<Vec<ResultLine>> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| parse_line(line).map_err(|e| invalid(n + 1, &e)))
        .collect()
}

fn parse_line(line: &str) -> std::result::Result<ResultLine, String> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() != 13 {
        return Err(format!("expected 13 fields, found {}", fields.len()));
    }

    let rank = fields[0]
        .parse::<usize>()
        .map_err(|e| format!("rank {:?}: {e}", fields[0]))?;
    let class_id = fields[1]
        .parse::<u32>()
        .map_err(|e| format!("class {:?}: {e}", fields[1]))?;

    let mut values = [0.0f32; 11];
    for (value, field) in values.iter_mut().zip(&fields[2..]) {
        *value = field
            .parse::<f32>()
            .map_err(|e| format!("value {field:?}: {e}"))?;
    }
    let [score, x1, y1, x2, y1b, x2b, y2, x1b, y2b, cx, cy] = values;

    Ok(ResultLine {
        rank,
        class_id,
        score,
        corners: [(x1, y1), (x2, y1b), (x2b, y2), (x1b, y2b)],
        center: (cx, cy),
    })
}

fn invalid(line: usize, reason: &str) -> DetError {
    DetError::InvalidInput(format!("result line {line}: {reason}"))
}

/// Where the results for `source` go: `<output_dir>/<file stem>.txt`.
pub fn result_path(output_dir: &Path, source: &Path) -> Result<PathBuf> {
    let stem = source.file_stem().ok_or_else(|| {
        DetError::InvalidInput(format!("{} has no file name", source.display()))
    })?;
    let mut name = stem.to_os_string();
    name.push(".txt");
    Ok(output_dir.join(name))
}

/// Where finished results go. [`ResultWriter`] is the file-backed sink.
pub trait ResultSink: Send + Sync {
    /// Store the results for one image and return where they were written.
    fn persist(&self, item: &ResultItem) -> Result<PathBuf>;
}

/// Writes result files into one output directory.
#[derive(Debug, Clone)]
pub struct ResultWriter {
    output_dir: PathBuf,
}

impl ResultWriter {
    /// Create the writer, creating `output_dir` if needed.
    pub fn new(output_dir: impl Into<PathBuf>) -> Result<Self> {
        let output_dir = output_dir.into();
        std::fs::create_dir_all(&output_dir).map_err(|e| {
            DetError::Persist(format!("{}: {e}", output_dir.display()))
        })?;
        Ok(Self { output_dir })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Write the result file for `item`, replacing any existing one.
    pub fn persist(&self, item: &ResultItem) -> Result<PathBuf> {
        let path = result_path(&self.output_dir, &item.source)?;
        std::fs::write(&path, format_detections(&item.detections))
            .map_err(|e| DetError::Persist(format!("{}: {e}", path.display())))?;
        Ok(path)
    }
}

impl ResultSink for ResultWriter {
    fn persist(&self, item: &ResultItem) -> Result<PathBuf> {
        ResultWriter::persist(self, item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use detbatch_core::BBox;

    fn det(class_id: u32, score: f32, x: f32, y: f32, w: f32, h: f32) -> Detection {
        Detection {
            bbox: BBox::new(x, y, w, h),
            score,
            class_id,
        }
    }

    #[test]
    fn formats_corners_and_centre() {
        let text = format_detections(&[det(3, 0.75, 10.0, 20.0, 30.0, 40.0)]);
        assert_eq!(text, "1 3 0.75 10 20 40 20 40 60 10 60 25 40");
    }

    #[test]
    fn ranks_follow_detector_order_without_trailing_newline() {
        let text = format_detections(&[
            det(0, 0.5, 0.0, 0.0, 2.0, 2.0),
            det(1, 0.9, 4.0, 4.0, 2.0, 2.0),
        ]);
        let lines: Vec<&str> = text.split('\n').collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("1 0 0.5 "));
        assert!(lines[1].starts_with("2 1 0.9 "));
        assert!(!text.ends_with('\n'));
    }

    #[test]
    fn empty_detections_give_empty_text() {
        assert_eq!(format_detections(&[]), "");
        assert!(parse_result_file("").unwrap().is_empty());
    }

    #[test]
    fn parses_what_it_writes() {
        let dets = [
            det(2, 0.625, 1.5, 2.5, 10.25, 4.0),
            det(7, 0.5, 100.0, 50.0, 8.0, 16.0),
        ];
        let lines = parse_result_file(&format_detections(&dets)).unwrap();
        assert_eq!(lines.len(), 2);
        for (i, (line, d)) in lines.iter().zip(&dets).enumerate() {
            assert_eq!(line.rank, i + 1);
            assert_eq!(line.class_id, d.class_id);
            assert_eq!(line.score, d.score);
            assert_eq!(line.corners, d.bbox.corners());
            assert_eq!(line.center, d.bbox.center());
            assert_eq!(line.size(), (d.bbox.width, d.bbox.height));
        }
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(parse_result_file("1 2 0.5").is_err());
        assert!(parse_result_file("x 0 0.5 0 0 1 0 1 1 0 1 0.5 0.5").is_err());
        let err = parse_result_file("1 0 0.5 0 0 1 0 1 1 0 1 0.5 0.5\n2 0 zz 0 0 1 0 1 1 0 1 0.5 0.5")
            .unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn result_path_uses_file_stem() {
        let out = Path::new("/tmp/out");
        assert_eq!(
            result_path(out, Path::new("/data/a/cat.01.JPG")).unwrap(),
            Path::new("/tmp/out/cat.01.txt")
        );
        assert_eq!(
            result_path(out, Path::new("dog.png")).unwrap(),
            Path::new("/tmp/out/dog.txt")
        );
        assert!(result_path(out, Path::new("/")).is_err());
    }

    #[test]
    fn writer_creates_directory_and_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ResultWriter::new(dir.path().join("nested/results")).unwrap();

        let item = ResultItem {
            source: PathBuf::from("images/frame.jpg"),
            detections: vec![det(1, 0.8, 0.0, 0.0, 4.0, 4.0)],
        };
        let path = writer.persist(&item).unwrap();
        assert_eq!(path, writer.output_dir().join("frame.txt"));
        assert_eq!(parse_result_file(&std::fs::read_to_string(&path).unwrap()).unwrap().len(), 1);

        let empty = ResultItem {
            detections: Vec::new(),
            ..item
        };
        writer.persist(&empty).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
    }
}
