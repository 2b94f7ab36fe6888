use crate::transcript::TextSegment;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeKind {
    /// Contiguous run of segments sharing a scene
    Scene,
    /// Covering window of a user selection
    Selected,
}

impl RangeKind {
    pub fn label(&self) -> &'static str {
        match self {
            RangeKind::Scene => "scene",
            RangeKind::Selected => "selected",
        }
    }
}

/// Loop window `[begin_idx, end_idx)` in segment index space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeInfo {
    pub begin_idx: usize,
    pub end_idx: usize,
    pub kind: RangeKind,
}

impl RangeInfo {
    /// Returns None for an empty window
    pub fn new(begin_idx: usize, end_idx: usize, kind: RangeKind) -> Option<Self> {
        (begin_idx < end_idx).then_some(Self {
            begin_idx,
            end_idx,
            kind,
        })
    }

    pub fn contains(&self, index: usize) -> bool {
        (self.begin_idx..self.end_idx).contains(&index)
    }

    /// Index played after `index`, wrapping back to the start of the window
    pub fn next_index(&self, index: usize) -> usize {
        let next = index + 1;
        if next >= self.end_idx {
            self.begin_idx
        } else {
            next
        }
    }

    pub fn is_first(&self, index: usize) -> bool {
        index == self.begin_idx
    }
}

/// Scene window around `index`.
///
/// Falls back to `[index, len)` when `index` is out of bounds of `segments`.
pub fn scene_range(segments: &[TextSegment], index: usize) -> Option<RangeInfo> {
    let Some(target) = segments.get(index) else {
        return RangeInfo::new(index, segments.len(), RangeKind::Scene);
    };

    let begin = segments[..index]
        .iter()
        .rposition(|s| s.scene_id != target.scene_id)
        .map(|i| i + 1)
        .unwrap_or(0);
    let end = segments[index..]
        .iter()
        .position(|s| s.scene_id != target.scene_id)
        .map(|i| index + i)
        .unwrap_or(segments.len());

    RangeInfo::new(begin, end, RangeKind::Scene)
}

/// Covering window `[min, max + 1)` of a selection, with the lowest index to start from.
///
/// Indices outside `segment_count` are dropped; None if nothing is left.
pub fn selection_range(indices: &[usize], segment_count: usize) -> Option<(RangeInfo, usize)> {
    let mut sorted: Vec<usize> = indices
        .iter()
        .copied()
        .filter(|&i| i < segment_count)
        .collect();
    sorted.sort_unstable();
    sorted.dedup();

    let first = *sorted.first()?;
    let last = *sorted.last()?;
    RangeInfo::new(first, last + 1, RangeKind::Selected).map(|range| (range, first))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcript::SceneId;

    fn segments(scenes: &[u32]) -> Vec<TextSegment> {
        scenes
            .iter()
            .enumerate()
            .map(|(i, &scene)| TextSegment {
                start_time: i as f64,
                end_time: i as f64 + 0.9,
                text: format!("line {}", i),
                scene_id: SceneId(scene),
            })
            .collect()
    }

    #[test]
    fn scene_range_covers_contiguous_scene() {
        let segs = segments(&[0, 0, 0, 1, 1, 2]);
        assert_eq!(
            scene_range(&segs, 1),
            Some(RangeInfo {
                begin_idx: 0,
                end_idx: 3,
                kind: RangeKind::Scene
            })
        );
        assert_eq!(
            scene_range(&segs, 4),
            RangeInfo::new(3, 5, RangeKind::Scene)
        );
    }

    #[test]
    fn last_scene_ends_at_segment_count() {
        let segs = segments(&[0, 0, 0, 1, 1, 2]);
        let range = scene_range(&segs, 5).unwrap();
        assert_eq!(range.begin_idx, 5);
        assert_eq!(range.end_idx, 6);
    }

    #[test]
    fn next_index_wraps_inside_range() {
        let range = RangeInfo::new(3, 6, RangeKind::Scene).unwrap();
        assert_eq!(range.next_index(3), 4);
        assert_eq!(range.next_index(4), 5);
        assert_eq!(range.next_index(5), 3);
    }

    #[test]
    fn selection_sorts_and_covers() {
        let (range, start) = selection_range(&[7, 3, 5], 10).unwrap();
        assert_eq!(
            range,
            RangeInfo {
                begin_idx: 3,
                end_idx: 8,
                kind: RangeKind::Selected
            }
        );
        assert_eq!(start, 3);
    }

    #[test]
    fn empty_selection_has_no_range() {
        assert!(selection_range(&[], 10).is_none());
        assert!(selection_range(&[12, 40], 10).is_none());
    }

    #[test]
    fn empty_window_is_rejected() {
        assert!(RangeInfo::new(4, 4, RangeKind::Scene).is_none());
    }
}
