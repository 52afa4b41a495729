use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoundingBox {
    pub xmin: f32,
    pub ymin: f32,
    pub xmax: f32,
    pub ymax: f32,
}

impl BoundingBox {
    /// Builds a box from centre coordinates and size, the layout the
    /// detection head emits.
    pub fn from_center(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self {
            xmin: cx - w / 2.,
            ymin: cy - h / 2.,
            xmax: cx + w / 2.,
            ymax: cy + h / 2.,
        }
    }

    pub fn area(&self) -> f32 {
        (self.xmax - self.xmin).max(0.) * (self.ymax - self.ymin).max(0.)
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ixmin = self.xmin.max(other.xmin);
        let iymin = self.ymin.max(other.ymin);
        let ixmax = self.xmax.min(other.xmax);
        let iymax = self.ymax.min(other.ymax);

        let inter = (ixmax - ixmin).max(0.) * (iymax - iymin).max(0.);
        let union = self.area() + other.area() - inter;
        if union <= 0. {
            0.
        } else {
            inter / union
        }
    }

    pub fn scale(&self, sx: f32, sy: f32) -> Self {
        Self {
            xmin: self.xmin * sx,
            ymin: self.ymin * sy,
            xmax: self.xmax * sx,
            ymax: self.ymax * sy,
        }
    }

    pub fn clamp(&self, width: f32, height: f32) -> Self {
        Self {
            xmin: self.xmin.clamp(0., width),
            ymin: self.ymin.clamp(0., height),
            xmax: self.xmax.clamp(0., width),
            ymax: self.ymax.clamp(0., height),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub bbox: BoundingBox,
    pub class_id: usize,
    pub confidence: f32,
}

/// Per-class greedy non-maximum suppression. Returns the kept candidates
/// ordered by descending confidence.
pub fn non_maximum_suppression(mut candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<Candidate> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let suppressed = kept.iter().any(|k| {
            k.class_id == candidate.class_id && k.bbox.iou(&candidate.bbox) > iou_threshold
        });
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}
