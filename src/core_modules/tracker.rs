// THEORY:
// The `tracker` module gives the analyser object permanence. It takes the
// stateless per-image colony lists and links them into `ColonyTrack`s, each
// one a single physical colony followed through time.
//
// This module solves the data association problem for a scene that barely
// moves: colonies do not wander, but the plate shifts a little between
// photographs and centroids drift by fractions of a pixel as colonies grow.
//
// Key architectural principles:
// 1.  **Continuous distance**: observations are compared to the latest
//     centroid of each track with the Euclidean distance. Coordinates are
//     never rounded; rounding put colonies that straddle a pixel boundary
//     into different groups.
// 2.  **Strict chronology**: timepoints must be pushed in capture order per
//     plate. A timepoint older than one already consumed is refused.
// 3.  **Greedy global assignment**: within one timepoint, every (observation,
//     track) pair closer than `max_distance` is a candidate. Candidates are
//     taken by ascending distance, then by earliest-created track, then by
//     observation order. Each track receives at most one observation per
//     timepoint and each observation joins at most one track.
// 4.  **Lifecycle**: an unmatched observation starts a new track. A track that
//     is not matched stays open but becomes `Inactive`; it may be extended
//     again later. Tracks are never deleted and never merged.
// 5.  **Plate isolation**: tracks only ever compete within their own plate
//     group (`GroupKey`).

use crate::core_modules::colony::{Colony, GroupKey, Point, Timepoint};
use crate::error::{ColonyError, ColonyResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Whether a track was extended by the most recent timepoint of its plate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TrackState {
    #[default]
    Active,
    Inactive,
}

/// One colony observation placed on a track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub timestamp: Duration,
    /// The image the observation was taken from.
    pub source: PathBuf,
    pub colony: Colony,
}

/// A single physical colony followed across timepoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColonyTrack {
    /// Unique and persistent across the whole run.
    pub id: u64,
    pub group: GroupKey,
    /// Chronological, at most one per timepoint.
    pub observations: Vec<Observation>,
    pub state: TrackState,
    /// Consecutive timepoints since the track was last extended.
    pub missed_timepoints: u32,
}

impl ColonyTrack {
    fn new(id: u64, group: GroupKey, observation: Observation) -> Self {
        Self {
            id,
            group,
            observations: vec![observation],
            state: TrackState::Active,
            missed_timepoints: 0,
        }
    }

    fn extend(&mut self, observation: Observation) {
        self.observations.push(observation);
        self.state = TrackState::Active;
        self.missed_timepoints = 0;
    }

    fn miss(&mut self) {
        self.state = TrackState::Inactive;
        self.missed_timepoints += 1;
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn first(&self) -> Option<&Observation> {
        self.observations.first()
    }

    pub fn last(&self) -> Option<&Observation> {
        self.observations.last()
    }

    pub fn observation_at(&self, timestamp: Duration) -> Option<&Observation> {
        self.observations.iter().find(|o| o.timestamp == timestamp)
    }

    /// Mean centroid across all observations.
    pub fn mean_center(&self) -> Option<Point> {
        if self.observations.is_empty() {
            return None;
        }
        let count = self.observations.len() as f64;
        let (sum_x, sum_y) = self
            .observations
            .iter()
            .fold((0.0, 0.0), |(x, y), o| (x + o.colony.center.x, y + o.colony.center.y));
        Some(Point::new(sum_x / count, sum_y / count))
    }

    pub fn circularity_at(&self, timestamp: Duration) -> Option<f64> {
        self.observation_at(timestamp).map(|o| o.colony.shape.circularity)
    }
}

/// Tracks and chronology of one plate group.
#[derive(Debug, Default)]
struct GroupTracks {
    tracks: Vec<ColonyTrack>,
    last_timestamp: Option<Duration>,
}

/// Links chronologically ordered timepoints into colony tracks.
pub struct TimepointMatcher {
    max_distance: f64,
    groups: BTreeMap<GroupKey, GroupTracks>,
    next_id: u64,
}

impl TimepointMatcher {
    pub fn new(max_distance: f64) -> Self {
        Self {
            max_distance,
            groups: BTreeMap::new(),
            next_id: 0,
        }
    }

    /// Consumes the next timepoint of its plate group.
    pub fn push(&mut self, timepoint: Timepoint) -> ColonyResult<()> {
        let group = self.groups.entry(timepoint.group.clone()).or_default();
        if let Some(last) = group.last_timestamp {
            if timepoint.timestamp < last {
                return Err(ColonyError::OutOfOrderTimepoint {
                    group: format!("{}/{}", timepoint.group.group_id, timepoint.group.plate_id),
                    source_path: timepoint.source,
                    timestamp: timepoint.timestamp,
                });
            }
        }
        group.last_timestamp = Some(timepoint.timestamp);

        // --- 1. Candidate pairs below the distance threshold ---
        let mut candidates: Vec<(f64, usize, usize)> = Vec::new(); // (distance, track_index, colony_index)
        for (colony_index, colony) in timepoint.colonies.iter().enumerate() {
            for (track_index, track) in group.tracks.iter().enumerate() {
                let Some(last) = track.last() else { continue };
                let distance = colony.center.distance(&last.colony.center);
                if distance < self.max_distance {
                    candidates.push((distance, track_index, colony_index));
                }
            }
        }
        candidates.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));

        // --- 2. Greedy one-to-one assignment ---
        let mut track_taken = vec![false; group.tracks.len()];
        let mut assignment: Vec<Option<usize>> = vec![None; timepoint.colonies.len()];
        for (_, track_index, colony_index) in candidates {
            if track_taken[track_index] || assignment[colony_index].is_some() {
                continue;
            }
            track_taken[track_index] = true;
            assignment[colony_index] = Some(track_index);
        }

        // --- 3. State updates: misses, extensions, births ---
        for (track, taken) in group.tracks.iter_mut().zip(&track_taken) {
            if !taken {
                track.miss();
            }
        }
        for (colony, assigned) in timepoint.colonies.into_iter().zip(assignment) {
            let observation = Observation {
                timestamp: timepoint.timestamp,
                source: timepoint.source.clone(),
                colony,
            };
            match assigned {
                Some(track_index) => group.tracks[track_index].extend(observation),
                None => {
                    group
                        .tracks
                        .push(ColonyTrack::new(self.next_id, timepoint.group.clone(), observation));
                    self.next_id += 1;
                }
            }
        }
        Ok(())
    }

    /// All tracks, ordered by plate group and then by creation.
    pub fn into_tracks(self) -> Vec<ColonyTrack> {
        self.groups.into_values().flat_map(|group| group.tracks).collect()
    }
}

/// Runs the matcher over an already chronological sequence of timepoints.
pub fn match_timepoints(
    timepoints: impl IntoIterator<Item = Timepoint>,
    max_distance: f64,
) -> ColonyResult<Vec<ColonyTrack>> {
    let mut matcher = TimepointMatcher::new(max_distance);
    for timepoint in timepoints {
        matcher.push(timepoint)?;
    }
    Ok(matcher.into_tracks())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::colony::ShapeDescriptors;
    use crate::core_modules::frame::Region;

    fn colony_at(x: f64, y: f64, area: f64) -> Colony {
        Colony {
            center: Point::new(x, y),
            area,
            mean_intensity: 200.0,
            mean_color: [200.0; 3],
            bounding_box: Region::default(),
            shape: ShapeDescriptors {
                circularity: area / 100.0,
                ..ShapeDescriptors::default()
            },
        }
    }

    fn timepoint(group: &str, seconds: u64, colonies: Vec<Colony>) -> Timepoint {
        Timepoint {
            timestamp: Duration::from_secs(seconds),
            source: PathBuf::from(format!("{group}_{seconds}.png")),
            group: GroupKey::new(group, 1),
            colonies,
        }
    }

    #[test]
    fn stationary_colony_forms_one_track() {
        let tracks = match_timepoints(
            vec![
                timepoint("a", 1, vec![colony_at(10.0, 10.0, 50.0)]),
                timepoint("a", 2, vec![colony_at(10.0, 10.0, 80.0)]),
                timepoint("a", 3, vec![colony_at(10.0, 10.0, 120.0)]),
            ],
            1.0,
        )
        .unwrap();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].len(), 3);
        assert_eq!(tracks[0].state, TrackState::Active);
    }

    #[test]
    fn sub_pixel_drift_stays_on_track() {
        let tracks = match_timepoints(
            vec![
                timepoint("a", 1, vec![colony_at(10.0, 10.0, 50.0)]),
                timepoint("a", 2, vec![colony_at(10.4, 10.4, 60.0)]),
            ],
            1.0,
        )
        .unwrap();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].observations[1].colony.center, Point::new(10.4, 10.4));
    }

    #[test]
    fn drift_at_threshold_starts_a_new_track() {
        let tracks = match_timepoints(
            vec![
                timepoint("a", 1, vec![colony_at(10.0, 10.0, 50.0)]),
                timepoint("a", 2, vec![colony_at(11.0, 10.0, 60.0)]),
            ],
            1.0,
        )
        .unwrap();
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0].state, TrackState::Inactive);
        assert_eq!(tracks[0].missed_timepoints, 1);
    }

    #[test]
    fn closest_observation_wins_a_contested_track() {
        let tracks = match_timepoints(
            vec![
                timepoint("a", 1, vec![colony_at(10.0, 10.0, 50.0)]),
                timepoint("a", 2, vec![colony_at(10.8, 10.0, 1.0), colony_at(10.2, 10.0, 2.0)]),
            ],
            1.0,
        )
        .unwrap();
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0].observations[1].colony.area, 2.0);
        assert_eq!(tracks[1].first().unwrap().colony.area, 1.0);
    }

    #[test]
    fn equidistant_tracks_prefer_the_earliest_created() {
        let tracks = match_timepoints(
            vec![
                timepoint("a", 1, vec![colony_at(10.0, 10.0, 1.0), colony_at(11.0, 10.0, 2.0)]),
                timepoint("a", 2, vec![colony_at(10.5, 10.0, 3.0)]),
            ],
            1.0,
        )
        .unwrap();
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0].len(), 2);
        assert_eq!(tracks[1].len(), 1);
        assert_eq!(tracks[1].state, TrackState::Inactive);
    }

    #[test]
    fn inactive_track_can_resume() {
        let tracks = match_timepoints(
            vec![
                timepoint("a", 1, vec![colony_at(5.0, 5.0, 10.0)]),
                timepoint("a", 2, vec![]),
                timepoint("a", 3, vec![colony_at(5.1, 5.0, 14.0)]),
            ],
            1.0,
        )
        .unwrap();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].len(), 2);
        assert_eq!(tracks[0].missed_timepoints, 0);
    }

    #[test]
    fn plate_groups_never_share_tracks() {
        let tracks = match_timepoints(
            vec![
                timepoint("a", 1, vec![colony_at(5.0, 5.0, 10.0)]),
                timepoint("b", 1, vec![colony_at(5.0, 5.0, 10.0)]),
                timepoint("a", 2, vec![colony_at(5.0, 5.0, 12.0)]),
            ],
            1.0,
        )
        .unwrap();
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0].group, GroupKey::new("a", 1));
        assert_eq!(tracks[0].len(), 2);
        assert_eq!(tracks[1].group, GroupKey::new("b", 1));
    }

    #[test]
    fn out_of_order_timepoints_are_refused() {
        let mut matcher = TimepointMatcher::new(1.0);
        matcher.push(timepoint("a", 5, vec![])).unwrap();
        let result = matcher.push(timepoint("a", 4, vec![]));
        assert!(matches!(result, Err(ColonyError::OutOfOrderTimepoint { .. })));
        // Another plate has its own clock.
        matcher.push(timepoint("b", 1, vec![])).unwrap();
    }

    #[test]
    fn track_accessors_summarise_observations() {
        let tracks = match_timepoints(
            vec![
                timepoint("a", 1, vec![colony_at(2.0, 4.0, 10.0)]),
                timepoint("a", 2, vec![colony_at(2.5, 4.5, 20.0)]),
            ],
            1.0,
        )
        .unwrap();
        let track = &tracks[0];
        assert_eq!(track.mean_center(), Some(Point::new(2.25, 4.25)));
        assert_eq!(track.circularity_at(Duration::from_secs(2)), Some(0.2));
        assert!(track.observation_at(Duration::from_secs(3)).is_none());
        assert_eq!(track.last().unwrap().source, PathBuf::from("a_2.png"));
    }
}
