//! PaddleOCR backend over ONNX Runtime (feature-gated behind `onnx`).
//!
//! Loads the detection and recognition models plus the optional textline
//! orientation classifier from `model_dir`, then runs the classic pipeline:
//! DB text detection, box extraction, per-line orientation fixup, CTC
//! recognition against the bundled dictionary.

use std::path::Path;

use image::{imageops::FilterType, RgbImage};
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::engine::{EngineError, OcrEngine, RecognizeOptions};
use crate::protocol::TextLine;

const DET_MODEL: &str = "paddleocr_det.onnx";
const REC_MODEL: &str = "paddleocr_rec.onnx";
const CLS_MODEL: &str = "paddleocr_textline_ori.onnx";
const DICT_FILE: &str = "paddleocr_dict.txt";

/// DB postprocessing thresholds.
const DET_BINARY_THRESH: f32 = 0.3;
const DET_BOX_THRESH: f32 = 0.5;
const DET_UNCLIP_RATIO: f32 = 1.6;

/// Recognition input geometry (PP-OCRv4 CTC head).
const REC_HEIGHT: u32 = 48;
const REC_MAX_WIDTH: u32 = 320;

/// Orientation classifier input geometry and flip threshold.
const CLS_WIDTH: u32 = 192;
const CLS_FLIP_THRESH: f32 = 0.9;

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

pub struct OnnxOcrEngine {
    det: ort::session::Session,
    rec: ort::session::Session,
    cls: Option<ort::session::Session>,
    dict: Vec<String>,
}

impl OnnxOcrEngine {
    pub fn load(config: &PoolConfig) -> Result<Self, EngineError> {
        ort::init()
            .with_execution_providers([
                ort::execution_providers::CPUExecutionProvider::default().build()
            ])
            .commit()
            .map_err(|e| EngineError::ModelLoad(e.to_string()))?;

        let model_dir = Path::new(&config.model_dir);
        let det = load_session(&model_dir.join(DET_MODEL), config.cpu_threads)?;
        let rec = load_session(&model_dir.join(REC_MODEL), config.cpu_threads)?;

        let cls_path = model_dir.join(CLS_MODEL);
        let cls = if cls_path.exists() {
            Some(load_session(&cls_path, config.cpu_threads)?)
        } else {
            warn!(path = %cls_path.display(), "orientation model missing, angle_cls disabled");
            None
        };

        let dict_path = model_dir.join(DICT_FILE);
        let dict = std::fs::read_to_string(&dict_path)
            .map_err(|e| {
                EngineError::ModelLoad(format!("dictionary {}: {e}", dict_path.display()))
            })?
            .lines()
            .map(|s| s.to_string())
            .collect::<Vec<_>>();
        if dict.is_empty() {
            return Err(EngineError::ModelLoad("empty recognition dictionary".into()));
        }

        info!(
            model_dir = %model_dir.display(),
            dict_chars = dict.len(),
            has_cls = cls.is_some(),
            "ONNX OCR engine loaded"
        );
        Ok(Self { det, rec, cls, dict })
    }
}

fn load_session(path: &Path, threads: usize) -> Result<ort::session::Session, EngineError> {
    if !path.exists() {
        return Err(EngineError::ModelLoad(format!(
            "model not found: {}",
            path.display()
        )));
    }
    ort::session::Session::builder()
        .and_then(|b| b.with_intra_threads(threads))
        .and_then(|b| b.commit_from_file(path))
        .map_err(|e| EngineError::ModelLoad(format!("{}: {e}", path.display())))
}

impl OcrEngine for OnnxOcrEngine {
    fn recognize(
        &mut self,
        image: &RgbImage,
        opts: &RecognizeOptions,
    ) -> Result<Vec<TextLine>, EngineError> {
        let boxes = detect_boxes(&mut self.det, image, opts.limit_side_len)?;
        debug!(boxes = boxes.len(), "detection done");

        let mut lines = Vec::with_capacity(boxes.len());
        for rect in boxes {
            let mut crop = crop_rect(image, &rect);
            if opts.use_angle_cls {
                if let Some(cls) = self.cls.as_mut() {
                    if is_upside_down(cls, &crop)? {
                        crop = image::imageops::rotate180(&crop);
                    }
                }
            }
            let (text, confidence) = recognize_line(&mut self.rec, &self.dict, &crop)?;
            if text.is_empty() {
                continue;
            }
            lines.push(TextLine {
                text,
                confidence,
                points: rect.corners(),
            });
        }
        Ok(lines)
    }
}

/// Axis-aligned detected box in original image coordinates.
#[derive(Debug, Clone, Copy)]
struct Rect {
    x0: u32,
    y0: u32,
    x1: u32,
    y1: u32,
}

impl Rect {
    fn width(&self) -> u32 {
        self.x1 - self.x0
    }

    fn height(&self) -> u32 {
        self.y1 - self.y0
    }

    fn corners(&self) -> [[f32; 2]; 4] {
        [
            [self.x0 as f32, self.y0 as f32],
            [self.x1 as f32, self.y0 as f32],
            [self.x1 as f32, self.y1 as f32],
            [self.x0 as f32, self.y1 as f32],
        ]
    }
}

/// CHW float tensor with per-channel mean/std normalization.
fn to_chw(image: &RgbImage, mean: &[f32; 3], std: &[f32; 3]) -> Vec<f32> {
    let (w, h) = (image.width() as usize, image.height() as usize);
    let mut data = vec![0.0f32; 3 * w * h];
    for (x, y, pixel) in image.enumerate_pixels() {
        let idx = y as usize * w + x as usize;
        for c in 0..3 {
            data[c * w * h + idx] = (pixel[c] as f32 / 255.0 - mean[c]) / std[c];
        }
    }
    data
}

fn run_single(
    session: &mut ort::session::Session,
    shape: Vec<i64>,
    data: Vec<f32>,
) -> Result<(Vec<usize>, Vec<f32>), EngineError> {
    let tensor = ort::value::Tensor::from_array((shape, data))
        .map_err(|e| EngineError::Inference(e.to_string()))?;
    let outputs = session
        .run(ort::inputs![tensor])
        .map_err(|e| EngineError::Inference(e.to_string()))?;
    let (out_shape, out_data) = outputs[0]
        .try_extract_tensor::<f32>()
        .map_err(|e| EngineError::Inference(e.to_string()))?;
    let dims: Vec<usize> = out_shape.iter().map(|&d| d as usize).collect();
    Ok((dims, out_data.to_vec()))
}

fn detect_boxes(
    det: &mut ort::session::Session,
    image: &RgbImage,
    limit_side_len: u32,
) -> Result<Vec<Rect>, EngineError> {
    // Resize so the longer side stays within the limit and both sides are
    // multiples of 32, as the DB head expects.
    let longest = image.width().max(image.height());
    let scale = if longest > limit_side_len {
        limit_side_len as f32 / longest as f32
    } else {
        1.0
    };
    let det_w = round_to_32(image.width() as f32 * scale);
    let det_h = round_to_32(image.height() as f32 * scale);
    let resized = image::imageops::resize(image, det_w, det_h, FilterType::Triangle);

    let data = to_chw(&resized, &IMAGENET_MEAN, &IMAGENET_STD);
    let (dims, prob) = run_single(det, vec![1, 3, det_h as i64, det_w as i64], data)?;
    if dims.len() != 4 || dims[2] != det_h as usize || dims[3] != det_w as usize {
        return Err(EngineError::Inference(format!(
            "unexpected detection output shape: {dims:?}"
        )));
    }

    let map_w = det_w as usize;
    let map_h = det_h as usize;
    let scale_x = image.width() as f32 / det_w as f32;
    let scale_y = image.height() as f32 / det_h as f32;

    let mut boxes = Vec::new();
    for region in connected_regions(&prob, map_w, map_h, DET_BINARY_THRESH) {
        if region.score < DET_BOX_THRESH {
            continue;
        }
        // DB unclip: grow the box by area * ratio / perimeter.
        let w = (region.x1 - region.x0 + 1) as f32;
        let h = (region.y1 - region.y0 + 1) as f32;
        if w < 3.0 || h < 3.0 {
            continue;
        }
        let offset = w * h * DET_UNCLIP_RATIO / (2.0 * (w + h));
        let x0 = ((region.x0 as f32 - offset) * scale_x).max(0.0) as u32;
        let y0 = ((region.y0 as f32 - offset) * scale_y).max(0.0) as u32;
        let x1 = (((region.x1 + 1) as f32 + offset) * scale_x).min(image.width() as f32) as u32;
        let y1 = (((region.y1 + 1) as f32 + offset) * scale_y).min(image.height() as f32) as u32;
        if x1 <= x0 || y1 <= y0 {
            continue;
        }
        boxes.push(Rect { x0, y0, x1, y1 });
    }

    // Reading order: top to bottom, then left to right.
    boxes.sort_by_key(|r| (r.y0, r.x0));
    Ok(boxes)
}

fn round_to_32(v: f32) -> u32 {
    (((v / 32.0).round() as u32).max(1)) * 32
}

struct Region {
    x0: usize,
    y0: usize,
    x1: usize,
    y1: usize,
    score: f32,
}

/// 4-connected components over the thresholded probability map, each
/// reduced to its bounding box plus mean probability.
fn connected_regions(prob: &[f32], width: usize, height: usize, thresh: f32) -> Vec<Region> {
    let mut visited = vec![false; width * height];
    let mut regions = Vec::new();
    let mut stack = Vec::new();

    for start in 0..width * height {
        if visited[start] || prob[start] < thresh {
            continue;
        }
        let (mut x0, mut y0) = (start % width, start / width);
        let (mut x1, mut y1) = (x0, y0);
        let mut sum = 0.0f32;
        let mut count = 0usize;

        stack.push(start);
        visited[start] = true;
        while let Some(idx) = stack.pop() {
            let (x, y) = (idx % width, idx / width);
            x0 = x0.min(x);
            y0 = y0.min(y);
            x1 = x1.max(x);
            y1 = y1.max(y);
            sum += prob[idx];
            count += 1;

            for (nx, ny) in [
                (x.wrapping_sub(1), y),
                (x + 1, y),
                (x, y.wrapping_sub(1)),
                (x, y + 1),
            ] {
                if nx < width && ny < height {
                    let nidx = ny * width + nx;
                    if !visited[nidx] && prob[nidx] >= thresh {
                        visited[nidx] = true;
                        stack.push(nidx);
                    }
                }
            }
        }

        regions.push(Region {
            x0,
            y0,
            x1,
            y1,
            score: sum / count as f32,
        });
    }
    regions
}

fn crop_rect(image: &RgbImage, rect: &Rect) -> RgbImage {
    image::imageops::crop_imm(image, rect.x0, rect.y0, rect.width(), rect.height()).to_image()
}

fn is_upside_down(
    cls: &mut ort::session::Session,
    crop: &RgbImage,
) -> Result<bool, EngineError> {
    let resized = image::imageops::resize(crop, CLS_WIDTH, REC_HEIGHT, FilterType::Triangle);
    let data = to_chw(&resized, &[0.5; 3], &[0.5; 3]);
    let (dims, out) = run_single(cls, vec![1, 3, REC_HEIGHT as i64, CLS_WIDTH as i64], data)?;
    if dims.last() != Some(&2) || out.len() < 2 {
        return Err(EngineError::Inference(format!(
            "unexpected cls output shape: {dims:?}"
        )));
    }
    Ok(out[1] > out[0] && out[1] > CLS_FLIP_THRESH)
}

fn recognize_line(
    rec: &mut ort::session::Session,
    dict: &[String],
    crop: &RgbImage,
) -> Result<(String, f32), EngineError> {
    // Scale to the fixed input height, clamp width, pad the rest with zeros.
    let ratio = REC_HEIGHT as f32 / crop.height().max(1) as f32;
    let scaled_w = ((crop.width() as f32 * ratio) as u32)
        .clamp(1, REC_MAX_WIDTH);
    let resized = image::imageops::resize(crop, scaled_w, REC_HEIGHT, FilterType::Triangle);

    let (w, h) = (REC_MAX_WIDTH as usize, REC_HEIGHT as usize);
    let mut data = vec![0.0f32; 3 * w * h];
    for (x, y, pixel) in resized.enumerate_pixels() {
        let idx = y as usize * w + x as usize;
        for c in 0..3 {
            data[c * w * h + idx] = pixel[c] as f32 / 127.5 - 1.0;
        }
    }

    let (dims, out) = run_single(rec, vec![1, 3, h as i64, w as i64], data)?;
    if dims.len() != 3 {
        return Err(EngineError::Inference(format!(
            "unexpected recognition output shape: {dims:?}"
        )));
    }
    let (steps, classes) = (dims[1], dims[2]);

    // Greedy CTC decode: argmax per step, drop blanks (index 0) and repeats.
    let mut text = String::new();
    let mut confidences = Vec::new();
    let mut previous = 0usize;
    for t in 0..steps {
        let row = &out[t * classes..(t + 1) * classes];
        let (best, best_prob) = row
            .iter()
            .enumerate()
            .fold((0usize, f32::MIN), |acc, (i, &p)| {
                if p > acc.1 {
                    (i, p)
                } else {
                    acc
                }
            });
        if best != 0 && best != previous {
            let ch = dict.get(best - 1).map(String::as_str).unwrap_or(" ");
            text.push_str(ch);
            confidences.push(best_prob);
        }
        previous = best;
    }

    let confidence = if confidences.is_empty() {
        0.0
    } else {
        confidences.iter().sum::<f32>() / confidences.len() as f32
    };
    Ok((text, confidence))
}
