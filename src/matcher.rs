//! Template box matching against detected rectangles.
//!
//! Two assignment strategies are available; which one is active is chosen by
//! [`MatchStrategy`] in the configuration:
//!
//! - [`GreedyLastWins`] (default): every detection claims the template slot it
//!   overlaps most. A later detection claiming the same slot overwrites the
//!   earlier one, even if its IoU is lower.
//! - [`OptimalBipartite`]: Hungarian assignment maximising the summed IoU of
//!   accepted pairs; each slot and each detection is used at most once.

use std::fmt::Debug;

use crate::geometry::{iou, order_polygon, polygon_bounding_box, Rect};
use crate::homography::Homography;
use crate::projection::project_box;
use crate::template::TemplateBox;
use crate::types::{Aspect, MatchStrategy, RegistrationConfig, TemplateSize};

/// Per template box, the detected rectangle matched to it, if any.
/// Always as long as the template it was built for.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MatchRecord {
    slots: Vec<Option<Rect>>,
}

impl MatchRecord {
    pub fn unmatched(len: usize) -> Self {
        Self {
            slots: vec![None; len],
        }
    }

    pub fn from_slots(slots: Vec<Option<Rect>>) -> Self {
        Self { slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slots(&self) -> &[Option<Rect>] {
        &self.slots
    }

    pub fn get(&self, idx: usize) -> Option<&Rect> {
        self.slots.get(idx).and_then(Option::as_ref)
    }

    pub fn set(&mut self, idx: usize, rect: Rect) {
        self.slots[idx] = Some(rect);
    }

    pub fn matched_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Matched slots over all slots; 0 for an empty template.
    pub fn accuracy(&self) -> f64 {
        self.matched_count() as f64 / self.slots.len().max(1) as f64
    }
}

pub trait AssignmentStrategy: Debug + Send + Sync {
    fn name(&self) -> &'static str;

    /// Assigns `detected` rectangles to the `expected` template rectangles.
    fn assign(&self, detected: &[Rect], expected: &[Rect], min_iou: f64) -> MatchRecord;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GreedyLastWins;

impl AssignmentStrategy for GreedyLastWins {
    fn name(&self) -> &'static str {
        "greedy"
    }

    fn assign(&self, detected: &[Rect], expected: &[Rect], min_iou: f64) -> MatchRecord {
        let mut record = MatchRecord::unmatched(expected.len());
        for rect in detected {
            let mut best_iou = 0.0;
            let mut best_idx = None;
            for (idx, tb) in expected.iter().enumerate() {
                let current = iou(rect, tb);
                if current > best_iou {
                    best_iou = current;
                    best_idx = Some(idx);
                }
            }
            if let Some(idx) = best_idx {
                if best_iou > min_iou {
                    record.set(idx, *rect);
                }
            }
        }
        record
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OptimalBipartite;

impl AssignmentStrategy for OptimalBipartite {
    fn name(&self) -> &'static str {
        "optimal"
    }

    fn assign(&self, detected: &[Rect], expected: &[Rect], min_iou: f64) -> MatchRecord {
        let mut record = MatchRecord::unmatched(expected.len());
        if detected.is_empty() || expected.is_empty() {
            return record;
        }

        let k = detected.len().max(expected.len());
        let mut weight = vec![vec![0.0; k]; k];
        for (i, d) in detected.iter().enumerate() {
            for (j, e) in expected.iter().enumerate() {
                let v = iou(d, e);
                if v > min_iou {
                    weight[i][j] = v;
                }
            }
        }
        let cost: Vec<Vec<f64>> = weight
            .iter()
            .map(|row| row.iter().map(|w| 1.0 - w).collect())
            .collect();

        for (i, j) in hungarian(&cost).into_iter().enumerate() {
            if i < detected.len() && j < expected.len() && weight[i][j] > 0.0 {
                record.set(j, detected[i]);
            }
        }
        record
    }
}

/// Minimum-cost perfect assignment on a square matrix (potentials method).
/// Returns the column assigned to each row.
fn hungarian(cost: &[Vec<f64>]) -> Vec<usize> {
    let n = cost.len();
    let inf = f64::INFINITY;
    let mut u = vec![0.0; n + 1];
    let mut v = vec![0.0; n + 1];
    let mut p = vec![0usize; n + 1];
    let mut way = vec![0usize; n + 1];

    for i in 1..=n {
        p[0] = i;
        let mut j0 = 0usize;
        let mut minv = vec![inf; n + 1];
        let mut used = vec![false; n + 1];
        loop {
            used[j0] = true;
            let i0 = p[j0];
            let mut delta = inf;
            let mut j1 = 0usize;
            for j in 1..=n {
                if used[j] {
                    continue;
                }
                let cur = cost[i0 - 1][j - 1] - u[i0] - v[j];
                if cur < minv[j] {
                    minv[j] = cur;
                    way[j] = j0;
                }
                if minv[j] < delta {
                    delta = minv[j];
                    j1 = j;
                }
            }
            for j in 0..=n {
                if used[j] {
                    u[p[j]] += delta;
                    v[j] -= delta;
                } else {
                    minv[j] -= delta;
                }
            }
            j0 = j1;
            if p[j0] == 0 {
                break;
            }
        }
        loop {
            let j1 = way[j0];
            p[j0] = p[j1];
            j0 = j1;
            if j0 == 0 {
                break;
            }
        }
    }

    let mut assignment = vec![0usize; n];
    for j in 1..=n {
        if p[j] != 0 {
            assignment[p[j] - 1] = j - 1;
        }
    }
    assignment
}

impl MatchStrategy {
    pub fn assigner(&self) -> Box<dyn AssignmentStrategy> {
        match self {
            MatchStrategy::Greedy => Box::new(GreedyLastWins),
            MatchStrategy::Optimal => Box::new(OptimalBipartite),
        }
    }
}

/// Centred screen of `width_ratio` of the frame width with the given aspect.
/// Integer arithmetic: sizes truncate, the offset floors.
pub fn assumed_screen_rect(frame_width: u32, frame_height: u32, width_ratio: f64, aspect: &Aspect) -> Rect {
    let w = frame_width as i64;
    let h = frame_height as i64;
    let sw = (w as f64 * width_ratio) as i64;
    let sh = (sw as f64 * aspect.h as f64 / aspect.w as f64) as i64;
    let sx = (w - sw).div_euclid(2);
    let sy = (h - sh).div_euclid(2);
    Rect::new(sx as f64, sy as f64, sw as f64, sh as f64)
}

/// Template boxes laid into `screen`, truncated to whole pixels.
pub fn expected_rects_in_screen(boxes: &[TemplateBox], screen: &Rect) -> Vec<Rect> {
    boxes
        .iter()
        .map(|b| {
            let x = screen.x + (b.x / 100.0 * screen.width).trunc();
            let y = screen.y + (b.y / 100.0 * screen.height).trunc();
            let w = (b.width / 100.0 * screen.width).trunc();
            let h = (b.height / 100.0 * screen.height).trunc();
            Rect::new(x, y, w, h)
        })
        .collect()
}

/// Bounding boxes of the template boxes projected through `h`.
pub fn expected_rects_from_homography(boxes: &[TemplateBox], h: &Homography, size: &TemplateSize) -> Vec<Rect> {
    boxes
        .iter()
        .map(|b| {
            let projected = project_box(h, b, size.width, size.height);
            let ordered = order_polygon(&projected).unwrap_or(projected);
            polygon_bounding_box(&ordered)
        })
        .collect()
}

/// Post-homography scoring: each projected box counts as matched when some
/// detected rectangle overlaps it with IoU of at least `min_iou`. The first
/// detection with the highest IoU is recorded.
pub fn score_projected(projected: &[Rect], detected: &[Rect], min_iou: f64) -> MatchRecord {
    let mut record = MatchRecord::unmatched(projected.len());
    for (idx, candidate) in projected.iter().enumerate() {
        let mut best_iou = 0.0;
        let mut best = None;
        for rect in detected {
            let v = iou(candidate, rect);
            if v > best_iou {
                best_iou = v;
                best = Some(*rect);
            }
        }
        if let Some(rect) = best {
            if best_iou >= min_iou {
                record.set(idx, rect);
            }
        }
    }
    record
}

/// Expected-rectangle construction plus the configured assignment strategy.
#[derive(Debug)]
pub struct TemplateMatcher {
    strategy: Box<dyn AssignmentStrategy>,
    min_iou: f64,
    width_ratio: f64,
    aspect: Aspect,
}

impl TemplateMatcher {
    pub fn new(config: &RegistrationConfig) -> Self {
        Self {
            strategy: config.match_strategy.assigner(),
            min_iou: config.min_iou_for_match,
            width_ratio: config.screen_width_ratio,
            aspect: config.screen_aspect,
        }
    }

    pub fn with_strategy(mut self, strategy: Box<dyn AssignmentStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn strategy(&self) -> &dyn AssignmentStrategy {
        self.strategy.as_ref()
    }

    pub fn assumed_screen(&self, frame_width: u32, frame_height: u32) -> Rect {
        assumed_screen_rect(frame_width, frame_height, self.width_ratio, &self.aspect)
    }

    pub fn assign(&self, detected: &[Rect], expected: &[Rect]) -> MatchRecord {
        self.strategy.assign(detected, expected, self.min_iou)
    }

    pub fn rescore(&self, projected: &[Rect], detected: &[Rect]) -> MatchRecord {
        score_projected(projected, detected, self.min_iou)
    }
}
