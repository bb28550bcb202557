//! Particle and trajectory types shared by the tracker, the linker and the
//! PRD writer.

/// One centroid reported by the sensor for a frame.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ParticleEvent {
    /// ROI number the centroid was reported in.
    pub roi_nr: u16,
    pub center_x: u16,
    pub center_y: u16,
    /// Zeroth moment (intensity sum), raw Q22.0.
    pub m0: u32,
    /// Second moment (size proxy), raw Q3.19.
    pub m2: u32,
}

impl ParticleEvent {
    pub const M2_FRACTION_BITS: u32 = 19;

    /// Zeroth moment as a plain number.
    #[must_use]
    pub fn m0_value(&self) -> f64 {
        f64::from(self.m0)
    }

    /// Second moment with the Q3.19 scaling removed.
    #[must_use]
    pub fn m2_value(&self) -> f64 {
        f64::from(self.m2) / f64::from(1u32 << Self::M2_FRACTION_BITS)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParticleState {
    New,
    Continuation,
    Gone,
}

/// A centroid with a stable identity across frames.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Particle {
    pub id: u32,
    pub event: ParticleEvent,
    /// Number of frames the particle has been tracked for.
    pub lifetime: u32,
    pub state: ParticleState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrajectoryPoint {
    pub frame_nr: u32,
    pub x: u16,
    pub y: u16,
}

/// Running history of one particle.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Trajectory {
    pub roi_nr: u16,
    pub particle_id: u32,
    pub lifetime: u32,
    /// Oldest first.
    pub points: Vec<TrajectoryPoint>,
}

/// Snapshot of all live trajectories, attached to a frame.
///
/// `max_trajectories` and `max_points` are the capacities the set was built
/// with; the PRD writer reserves space for that many entries per frame.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Trajectories {
    pub max_trajectories: u32,
    pub max_points: u32,
    pub trajectories: Vec<Trajectory>,
}

impl Trajectories {
    #[must_use]
    pub fn new(max_trajectories: u32, max_points: u32) -> Self {
        Self {
            max_trajectories,
            max_points,
            trajectories: Vec::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.trajectories.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.trajectories.is_empty()
    }

    #[must_use]
    pub fn get(&self, particle_id: u32) -> Option<&Trajectory> {
        self.trajectories
            .iter()
            .find(|t| t.particle_id == particle_id)
    }

    /// Per-particle sample counts, in stored order.
    pub fn sample_counts(&self) -> impl Iterator<Item = (u32, usize)> + '_ {
        self.trajectories
            .iter()
            .map(|t| (t.particle_id, t.points.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn m2_fixed_point_scaling() {
        let ev = ParticleEvent {
            m2: 3 << 19,
            ..Default::default()
        };
        assert!((ev.m2_value() - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn lookup_by_particle_id() {
        let mut set = Trajectories::new(4, 8);
        set.trajectories.push(Trajectory {
            particle_id: 7,
            points: vec![TrajectoryPoint::default(); 2],
            ..Default::default()
        });
        assert_eq!(set.get(7).map(|t| t.points.len()), Some(2));
        assert!(set.get(8).is_none());
        assert_eq!(set.sample_counts().collect::<Vec<_>>(), vec![(7, 2)]);
    }
}
