//! IDX file reader for the MNIST digit images.
//!
//! Files are read from a local directory; fetching them is left to the user.

use crate::data::batch::Dataset;
use crate::error::FitError;
use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};
use std::path::Path;

const IMAGES_MAGIC: u32 = 0x0000_0803;
const LABELS_MAGIC: u32 = 0x0000_0801;

/// Which half of MNIST to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MnistSplit {
    Train,
    Test,
}

impl MnistSplit {
    fn prefix(self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Test => "t10k",
        }
    }

    pub fn images_file(self) -> String {
        format!("{}-images-idx3-ubyte", self.prefix())
    }

    pub fn labels_file(self) -> String {
        format!("{}-labels-idx1-ubyte", self.prefix())
    }
}

/// Raw u8 images in row-major order.
#[derive(Debug, Clone, PartialEq)]
pub struct IdxImages {
    pub count: usize,
    pub rows: usize,
    pub cols: usize,
    pub pixels: Vec<u8>,
}

fn read_u32(bytes: &[u8], offset: usize, what: &str) -> Result<u32, FitError> {
    bytes
        .get(offset..offset + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| FitError::data(format!("{what}: truncated header")))
}

/// Parse an `idx3-ubyte` image file.
pub fn parse_images(bytes: &[u8]) -> Result<IdxImages, FitError> {
    let magic = read_u32(bytes, 0, "images")?;
    if magic != IMAGES_MAGIC {
        return Err(FitError::data(format!(
            "images: bad magic number {magic:#010x}, expected {IMAGES_MAGIC:#010x}"
        )));
    }
    let count = read_u32(bytes, 4, "images")? as usize;
    let rows = read_u32(bytes, 8, "images")? as usize;
    let cols = read_u32(bytes, 12, "images")? as usize;
    let expected = count
        .checked_mul(rows)
        .and_then(|n| n.checked_mul(cols))
        .ok_or_else(|| FitError::data("images: header dimensions overflow"))?;
    let pixels = &bytes[16..];
    if pixels.len() != expected {
        return Err(FitError::data(format!(
            "images: expected {expected} pixel bytes, found {}",
            pixels.len()
        )));
    }
    Ok(IdxImages {
        count,
        rows,
        cols,
        pixels: pixels.to_vec(),
    })
}

/// Parse an `idx1-ubyte` label file.
pub fn parse_labels(bytes: &[u8]) -> Result<Vec<u8>, FitError> {
    let magic = read_u32(bytes, 0, "labels")?;
    if magic != LABELS_MAGIC {
        return Err(FitError::data(format!(
            "labels: bad magic number {magic:#010x}, expected {LABELS_MAGIC:#010x}"
        )));
    }
    let count = read_u32(bytes, 4, "labels")? as usize;
    let labels = &bytes[8..];
    if labels.len() != count {
        return Err(FitError::data(format!(
            "labels: header says {count}, found {}",
            labels.len()
        )));
    }
    Ok(labels.to_vec())
}

/// Build a dataset from parsed IDX contents.
///
/// Pixels are min/max scaled to `[0, 1]` as `f32`; labels become `u32`.
pub fn to_dataset(
    images: &IdxImages,
    labels: &[u8],
    flatten: bool,
    device: &Device,
) -> Result<Dataset, FitError> {
    if images.count != labels.len() {
        return Err(FitError::data(format!(
            "{} images but {} labels",
            images.count,
            labels.len()
        )));
    }
    let pixels: Vec<f32> = images.pixels.iter().map(|p| f32::from(*p) / 255.0).collect();
    let inputs = if flatten {
        Tensor::from_vec(pixels, (images.count, images.rows * images.cols), device)?
    } else {
        Tensor::from_vec(pixels, (images.count, images.rows, images.cols), device)?
    };
    let targets: Vec<u32> = labels.iter().map(|l| u32::from(*l)).collect();
    let targets = Tensor::from_vec(targets, labels.len(), device)?;
    Dataset::new(inputs, targets)
}

/// Load one MNIST split from `dir`.
pub fn load_mnist(
    dir: &Path,
    split: MnistSplit,
    flatten: bool,
    device: &Device,
) -> Result<Dataset, FitError> {
    let read = |name: String| {
        let path = dir.join(&name);
        std::fs::read(&path)
            .map_err(|e| FitError::data(format!("cannot read {}: {e}", path.display())))
    };
    let images = parse_images(&read(split.images_file())?)?;
    let labels = parse_labels(&read(split.labels_file())?)?;
    tracing::info!(
        ?split,
        samples = images.count,
        rows = images.rows,
        cols = images.cols,
        "Loaded MNIST"
    );
    to_dataset(&images, &labels, flatten, device)
}
