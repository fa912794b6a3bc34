//! Dataset import: images, iBUG `.pts` landmark files and rectangle lists.
//!
//! A database is a directory of images, each with a sibling `.pts` file of the
//! same stem:
//!
//! ```text
//! version: 1
//! n_points: 4
//! {
//! 10.5 12.0
//! ...
//! }
//! ```
//!
//! Detection rectangles come from an optional CSV file with one
//! `x,y,width,height` line per imported image, in import order.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use image::imageops::{self, FilterType};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::image_access::{GrayImage, ImageAccess};
use crate::training::InputData;
use crate::types::{BoundingBox, Point, Shape};

const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

/// Options for [`import_database`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportParameters {
    /// Images with a longer side are downscaled to this size.
    pub max_image_side_length: u32,
}

impl Default for ImportParameters {
    fn default() -> Self {
        Self {
            max_image_side_length: 2048,
        }
    }
}

/// Load a labeled database from `dir`.
///
/// Without `rects_path` the ground-truth bounding box of every shape serves as
/// its detection rectangle.
pub fn import_database(
    dir: &Path,
    rects_path: Option<&Path>,
    params: &ImportParameters,
) -> Result<InputData> {
    if params.max_image_side_length == 0 {
        return Err(Error::InvalidInput(
            "max_image_side_length must be positive".into(),
        ));
    }

    let mut image_paths: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && is_image(p))
        .collect();
    image_paths.sort();

    let rects = rects_path.map(read_rects).transpose()?;

    let mut data = InputData::default();
    for path in &image_paths {
        let pts_path = path.with_extension("pts");
        if !pts_path.is_file() {
            warn!("skipping {}: no landmark file", path.display());
            continue;
        }
        let shape = read_pts(&pts_path)?;
        let gray = image::open(path)?.to_luma8();
        data.images.push(GrayImage::from(gray));
        data.shapes.push(shape);
    }

    match rects {
        Some(rects) => {
            if rects.len() != data.len() {
                return Err(Error::InvalidInput(format!(
                    "{} rectangles for {} imported images",
                    rects.len(),
                    data.len()
                )));
            }
            data.rects = rects;
        }
        None => {
            data.rects = data
                .shapes
                .iter()
                .map(|s| {
                    BoundingBox::around(s)
                        .ok_or_else(|| Error::InvalidInput("landmark file without points".into()))
                })
                .collect::<Result<_>>()?;
        }
    }

    for i in 0..data.len() {
        downscale_entry(&mut data, i, params.max_image_side_length);
    }

    data.validate()?;
    info!("imported {} images from {}", data.len(), dir.display());
    Ok(data)
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

fn downscale_entry(data: &mut InputData, i: usize, max_side: u32) {
    let current = &data.images[i];
    let longest = current.width().max(current.height());
    if longest <= max_side {
        return;
    }
    let factor = max_side as f32 / longest as f32;
    let width = ((current.width() as f32 * factor).round() as u32).max(1);
    let height = ((current.height() as f32 * factor).round() as u32).max(1);

    let Some(buffer) =
        image::GrayImage::from_raw(current.width(), current.height(), current.as_raw().to_vec())
    else {
        return;
    };
    let resized = imageops::resize(&buffer, width, height, FilterType::Triangle);
    data.images[i] = GrayImage::from(resized);
    data.shapes[i].scale(factor);
    data.rects[i] = data.rects[i].scaled(factor);
}

/// Read an iBUG `.pts` landmark file.
pub fn read_pts(path: &Path) -> Result<Shape> {
    let text = fs::read_to_string(path)?;
    let parse_err = |line: usize, message: String| Error::Parse {
        path: path.to_path_buf(),
        line,
        message,
    };

    let mut expected: Option<usize> = None;
    let mut in_points = false;
    let mut closed = false;
    let mut points = Vec::new();

    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim();
        if line.is_empty() || closed {
            continue;
        }
        if !in_points {
            if line == "{" {
                in_points = true;
            } else if let Some(rest) = line.strip_prefix("n_points:") {
                let n = rest
                    .trim()
                    .parse::<usize>()
                    .map_err(|e| parse_err(line_no, format!("bad point count: {}", e)))?;
                expected = Some(n);
            } else if !line.starts_with("version:") {
                return Err(parse_err(line_no, format!("unexpected header line '{}'", line)));
            }
            continue;
        }
        if line == "}" {
            closed = true;
            continue;
        }

        let mut fields = line.split_whitespace().map(str::parse::<f32>);
        match (fields.next(), fields.next(), fields.next()) {
            (Some(Ok(x)), Some(Ok(y)), None) => points.push(Point::new(x, y)),
            _ => return Err(parse_err(line_no, format!("expected 'x y', got '{}'", line))),
        }
    }

    let last_line = text.lines().count();
    if !closed {
        return Err(parse_err(last_line, "missing closing '}'".into()));
    }
    if let Some(n) = expected {
        if n != points.len() {
            return Err(parse_err(
                last_line,
                format!("header announces {} points, found {}", n, points.len()),
            ));
        }
    }
    Ok(Shape::new(points))
}

/// Write `shape` as an iBUG `.pts` file.
pub fn write_pts(path: &Path, shape: &Shape) -> Result<()> {
    let mut writer = BufWriter::new(fs::File::create(path)?);
    writeln!(writer, "version: 1")?;
    writeln!(writer, "n_points: {}", shape.num_landmarks())?;
    writeln!(writer, "{{")?;
    for p in &shape.points {
        writeln!(writer, "{} {}", p.x, p.y)?;
    }
    writeln!(writer, "}}")?;
    writer.flush()?;
    Ok(())
}

/// Read a rectangle list: one `x,y,width,height` per line.
///
/// Blank lines and lines starting with `#` are ignored.
pub fn read_rects(path: &Path) -> Result<Vec<BoundingBox>> {
    let text = fs::read_to_string(path)?;
    let mut rects = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let rect = parse_rect(line).map_err(|message| Error::Parse {
            path: path.to_path_buf(),
            line: idx + 1,
            message,
        })?;
        rects.push(rect);
    }
    Ok(rects)
}

/// Parse `x,y,width,height`.
pub fn parse_rect(text: &str) -> std::result::Result<BoundingBox, String> {
    let values = text
        .split(',')
        .map(|f| f.trim().parse::<f32>())
        .collect::<std::result::Result<Vec<f32>, _>>()
        .map_err(|e| format!("bad rectangle '{}': {}", text, e))?;
    match values[..] {
        [x, y, w, h] if w > 0.0 && h > 0.0 => Ok(BoundingBox::new(x, y, w, h)),
        [_, _, _, _] => Err(format!("rectangle '{}' has non-positive size", text)),
        _ => Err(format!("expected 'x,y,width,height', got '{}'", text)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn square() -> Shape {
        Shape::new(vec![
            Point::new(4.0, 4.0),
            Point::new(12.5, 4.0),
            Point::new(12.5, 12.0),
            Point::new(4.0, 12.0),
        ])
    }

    #[test]
    fn pts_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.pts");
        write_pts(&path, &square()).unwrap();
        assert_eq!(read_pts(&path).unwrap(), square());
    }

    #[test]
    fn malformed_pts_reports_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.pts");
        fs::write(&path, "version: 1\nn_points: 2\n{\n1 2\n3 x\n}\n").unwrap();
        match read_pts(&path) {
            Err(Error::Parse { line, .. }) => assert_eq!(line, 5),
            other => panic!("unexpected result {:?}", other),
        }

        fs::write(&path, "version: 1\nn_points: 3\n{\n1 2\n3 4\n}\n").unwrap();
        assert!(matches!(read_pts(&path), Err(Error::Parse { .. })));

        fs::write(&path, "version: 1\n{\n1 2\n").unwrap();
        assert!(matches!(read_pts(&path), Err(Error::Parse { .. })));
    }

    #[test]
    fn rect_list_skips_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rects.csv");
        fs::write(&path, "# x,y,w,h\n1,2,30,40\n\n 5.5, 6, 7, 8 \n").unwrap();
        let rects = read_rects(&path).unwrap();
        assert_eq!(
            rects,
            vec![
                BoundingBox::new(1.0, 2.0, 30.0, 40.0),
                BoundingBox::new(5.5, 6.0, 7.0, 8.0)
            ]
        );

        fs::write(&path, "1,2,3\n").unwrap();
        assert!(matches!(read_rects(&path), Err(Error::Parse { line: 1, .. })));
        assert!(parse_rect("1,2,0,4").is_err());
    }

    fn write_entry(dir: &Path, name: &str, width: u32, height: u32, shape: Option<&Shape>) {
        let img = image::GrayImage::from_fn(width, height, |x, y| image::Luma([((x + y) * 7) as u8]));
        img.save(dir.join(format!("{}.png", name))).unwrap();
        if let Some(shape) = shape {
            write_pts(&dir.join(format!("{}.pts", name)), shape).unwrap();
        }
    }

    #[test]
    fn import_pairs_images_with_landmarks() {
        let dir = tempfile::tempdir().unwrap();
        write_entry(dir.path(), "b", 20, 20, Some(&square()));
        write_entry(dir.path(), "a", 20, 20, Some(&square()));
        write_entry(dir.path(), "unlabeled", 20, 20, None);
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let data = import_database(dir.path(), None, &ImportParameters::default()).unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(data.shapes[0], square());
        assert_eq!(data.rects[0], BoundingBox::new(4.0, 4.0, 8.5, 8.0));
        assert_eq!(data.images[0].width(), 20);

        let rects_path = dir.path().join("rects.csv");
        fs::write(&rects_path, "0,0,10,10\n").unwrap();
        assert!(matches!(
            import_database(dir.path(), Some(&rects_path), &ImportParameters::default()),
            Err(Error::InvalidInput(_))
        ));

        fs::write(&rects_path, "0,0,10,10\n1,1,12,12\n").unwrap();
        let data = import_database(dir.path(), Some(&rects_path), &ImportParameters::default()).unwrap();
        assert_eq!(data.rects[1], BoundingBox::new(1.0, 1.0, 12.0, 12.0));
    }

    #[test]
    fn large_images_are_downscaled_with_their_labels() {
        let dir = tempfile::tempdir().unwrap();
        write_entry(dir.path(), "big", 40, 20, Some(&square()));

        let params = ImportParameters {
            max_image_side_length: 20,
        };
        let data = import_database(dir.path(), None, &params).unwrap();
        assert_eq!((data.images[0].width(), data.images[0].height()), (20, 10));
        assert_relative_eq!(data.shapes[0][1].x, 6.25);
        assert_relative_eq!(data.rects[0].width, 4.25);
    }

    #[test]
    fn empty_database_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(import_database(dir.path(), None, &ImportParameters::default()).is_err());
    }
}
